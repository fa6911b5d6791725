// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status publishers. One sink is selected per run; the publisher loop
//! snapshots a tuner's status and hands it here, so nothing in this module
//! ever runs under the status mutex.

pub mod fifo;
pub mod json;
pub mod mqtt;
pub mod udp;

use crate::status::{status_code as code, Status};
use crate::TunerId;

pub enum StatusSink {
    Udp(udp::UdpStatus),
    Fifo(fifo::FifoWriter),
    Mqtt(mqtt::MqttStatus),
    Json(json::JsonStatus),
}

impl StatusSink {
    /// Deliver one snapshot. Line sinks get one message per field; the JSON
    /// sink emits a single rate-limited object instead.
    pub fn publish(&mut self, tuner: TunerId, status: &Status) {
        match self {
            StatusSink::Json(sink) => {
                sink.publish(tuner, status);
                return;
            }
            StatusSink::Fifo(writer) => {
                // Reader may have gone away; retry the open and skip the
                // snapshot until someone is listening.
                if !writer.try_open() {
                    return;
                }
            }
            _ => {}
        }
        publish_fields(self, tuner, status);
    }

    fn write_u32(&mut self, tuner: TunerId, status_code: u8, value: u32) {
        match self {
            StatusSink::Udp(sink) => sink.write_u32(status_code, value),
            StatusSink::Fifo(writer) => {
                writer.write_line(&format!("${},{}\n", status_code, value as i32));
            }
            StatusSink::Mqtt(sink) => sink.write_u32(tuner, status_code, value),
            StatusSink::Json(_) => {}
        }
    }

    fn write_str(&mut self, tuner: TunerId, status_code: u8, value: &str) {
        match self {
            StatusSink::Udp(sink) => sink.write_str(status_code, value),
            StatusSink::Fifo(writer) => {
                writer.write_line(&format!("${},{}\n", status_code, value));
            }
            StatusSink::Mqtt(sink) => sink.write_str(tuner, status_code, value),
            StatusSink::Json(_) => {}
        }
    }
}

/// The per-field report, in the stable wire order.
fn publish_fields(sink: &mut StatusSink, tuner: TunerId, status: &Status) {
    sink.write_u32(tuner, code::STATE, status.state.code());
    if status.lna_ok {
        sink.write_u32(tuner, code::LNA_GAIN, status.lna_gain as u32);
    }
    sink.write_u32(tuner, code::AGC1_GAIN, status.agc1_gain as u32);
    sink.write_u32(tuner, code::AGC2_GAIN, status.agc2_gain as u32);
    sink.write_u32(tuner, code::POWER_I, status.power_i as u32);
    sink.write_u32(tuner, code::POWER_Q, status.power_q as u32);
    for &(i, q) in &status.constellation {
        sink.write_u32(tuner, code::CONSTELLATION_I, i as i32 as u32);
        sink.write_u32(tuner, code::CONSTELLATION_Q, q as i32 as u32);
    }
    sink.write_u32(tuner, code::PUNCTURE_RATE, status.puncture_rate as u32);
    sink.write_u32(tuner, code::CARRIER_FREQUENCY, status.carrier_frequency_khz());
    sink.write_u32(tuner, code::LNB_SUPPLY, status.polarisation_supply as u32);
    sink.write_u32(tuner, code::LNB_POLARISATION_H, status.polarisation_horizontal as u32);
    sink.write_u32(tuner, code::SYMBOL_RATE, status.symbolrate_sps);
    sink.write_u32(tuner, code::VITERBI_ERROR_RATE, status.viterbi_error_rate);
    sink.write_u32(tuner, code::BER, status.bit_error_rate);
    sink.write_u32(tuner, code::MER, status.modulation_error_rate as u32);
    sink.write_u32(tuner, code::ERRORS_BCH_UNCORRECTED, status.errors_bch_uncorrected as u32);
    sink.write_u32(tuner, code::ERRORS_BCH_COUNT, status.errors_bch_count);
    sink.write_u32(tuner, code::ERRORS_LDPC_COUNT, status.errors_ldpc_count);
    sink.write_str(tuner, code::SERVICE_NAME, &status.service_name);
    sink.write_str(tuner, code::SERVICE_PROVIDER_NAME, &status.service_provider_name);
    sink.write_u32(tuner, code::TS_NULL_PERCENTAGE, status.ts_null_percentage as u32);
    for &(pid, stream_type) in &status.ts_elementary_streams {
        if pid > 0 {
            sink.write_u32(tuner, code::ES_PID, pid as u32);
            sink.write_u32(tuner, code::ES_TYPE, stream_type as u32);
        }
    }
    sink.write_u32(tuner, code::MODCOD, status.modcod);
    sink.write_u32(tuner, code::SHORT_FRAME, status.short_frame as u32);
    sink.write_u32(tuner, code::PILOTS, status.pilots as u32);
    sink.write_u32(tuner, code::MATYPE1, status.matype1);
    sink.write_u32(tuner, code::MATYPE2, status.matype2);
    sink.write_u32(tuner, code::ROLLOFF, status.rolloff as u32);
    sink.write_u32(tuner, code::TS_PACKET_COUNT, status.ts_packet_count);
    sink.write_u32(tuner, code::TS_LOCK, status.ts_lock as u32);
    sink.write_u32(tuner, code::TS_BITRATE, status.ts_bitrate_kbps);
}
