// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON status sink: one object per demodulator cycle on stdout, rate
//! limited, with three verbosity levels. stdout carries nothing else.

use crate::monotonic_ms;
use crate::status::Status;
use crate::TunerId;
use serde_json::json;

pub const DEFAULT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonFormat {
    Full,
    Compact,
    Minimal,
}

pub struct JsonStatus {
    format: JsonFormat,
    interval_ms: u64,
    pretty: bool,
    include_constellation: bool,
    last_output: Option<u64>,
}

impl JsonStatus {
    pub fn new(format: JsonFormat, pretty: bool) -> JsonStatus {
        JsonStatus {
            format,
            interval_ms: DEFAULT_INTERVAL_MS,
            pretty,
            include_constellation: false,
            last_output: None,
        }
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }

    pub fn set_include_constellation(&mut self, include: bool) {
        self.include_constellation = include;
    }

    fn due(&mut self) -> bool {
        let now = monotonic_ms();
        match self.last_output {
            Some(last) if now - last < self.interval_ms => false,
            _ => {
                self.last_output = Some(now);
                true
            }
        }
    }

    pub fn publish(&mut self, tuner: TunerId, status: &Status) {
        if !self.due() {
            return;
        }
        let value = match self.format {
            JsonFormat::Full => self.format_full(tuner, status),
            JsonFormat::Compact => format_compact(tuner, status),
            JsonFormat::Minimal => format_minimal(tuner, status),
        };
        let line = if self.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        };
        if let Ok(text) = line {
            println!("{}", text);
        }
    }

    fn format_full(&self, tuner: TunerId, status: &Status) -> serde_json::Value {
        let mut value = json!({
            "timestamp": status.last_updated,
            "tuner": tuner.index() + 1,
            "signal": {
                "power_i": status.power_i,
                "power_q": status.power_q,
                "agc1_gain": status.agc1_gain,
                "agc2_gain": status.agc2_gain,
                "lna_gain": status.lna_gain,
            },
            "lock": {
                "demod_state": status.demod_state,
                "state_name": status.state.json_name(),
                "locked": status.state.is_locked(),
            },
            "errors": {
                "viterbi_rate": status.viterbi_error_rate,
                "ber": status.bit_error_rate,
                "mer": status.modulation_error_rate,
                "bch_uncorrected": status.errors_bch_uncorrected,
                "bch_count": status.errors_bch_count,
                "ldpc_count": status.errors_ldpc_count,
            },
            "frequency": {
                "requested": status.frequency_requested_khz,
                "offset": status.frequency_offset_hz,
                "actual": status.carrier_frequency_khz(),
            },
            "modulation": {
                "symbol_rate": status.symbolrate_sps,
                "modcod": status.modcod,
                "short_frame": status.short_frame,
                "pilots": status.pilots,
                "rolloff": status.rolloff,
            },
            "service": {
                "name": status.service_name,
                "provider": status.service_provider_name,
                "ts_null_percentage": status.ts_null_percentage,
            },
        });
        if self.include_constellation {
            let points: Vec<[i8; 2]> = status.constellation.iter().map(|&(i, q)| [i, q]).collect();
            value["constellation"] = json!(points);
        }
        value
    }
}

fn format_compact(tuner: TunerId, status: &Status) -> serde_json::Value {
    json!({
        "ts": status.last_updated,
        "t": tuner.index() + 1,
        "pi": status.power_i,
        "pq": status.power_q,
        "a1": status.agc1_gain,
        "a2": status.agc2_gain,
        "lna": status.lna_gain,
        "ds": status.demod_state,
        "lck": status.state.is_locked(),
        "vit": status.viterbi_error_rate,
        "ber": status.bit_error_rate,
        "mer": status.modulation_error_rate,
        "freq": status.carrier_frequency_khz(),
        "sr": status.symbolrate_sps,
        "mc": status.modcod,
    })
}

fn format_minimal(tuner: TunerId, status: &Status) -> serde_json::Value {
    json!({
        "ts": status.last_updated,
        "t": tuner.index() + 1,
        "lck": status.state.is_locked(),
        "mer": status.modulation_error_rate,
        "freq": status.carrier_frequency_khz(),
        "sr": status.symbolrate_sps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ReceiverState;

    fn sample_status() -> Status {
        let mut status = Status::default();
        status.state = ReceiverState::DemodS2;
        status.frequency_requested_khz = 741_500;
        status.frequency_offset_hz = -120_000;
        status.symbolrate_sps = 1_500_000;
        status.modulation_error_rate = 85;
        status.modcod = 6;
        status
    }

    #[test]
    fn minimal_contains_the_essentials() {
        let value = format_minimal(TunerId::Tuner1, &sample_status());
        assert_eq!(value["t"], 1);
        assert_eq!(value["lck"], true);
        assert_eq!(value["sr"], 1_500_000);
        assert_eq!(value["freq"], 741_380);
    }

    #[test]
    fn compact_is_flat() {
        let value = format_compact(TunerId::Tuner2, &sample_status());
        assert_eq!(value["t"], 2);
        assert!(value["mer"].is_number());
        assert!(value.get("signal").is_none());
    }

    #[test]
    fn rate_limit_suppresses_between_intervals() {
        let mut sink = JsonStatus::new(JsonFormat::Minimal, false);
        sink.set_interval(1_000_000);
        assert!(sink.due());
        assert!(!sink.due());
    }

    #[test]
    fn full_includes_constellation_only_when_asked() {
        let status = sample_status();
        let mut sink = JsonStatus::new(JsonFormat::Full, false);
        let value = sink.format_full(TunerId::Tuner1, &status);
        assert!(value.get("constellation").is_none());
        sink.set_include_constellation(true);
        let value = sink.format_full(TunerId::Tuner1, &status);
        assert!(value["constellation"].is_array());
    }
}
