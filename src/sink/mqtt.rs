// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT status sink and command channel. Status goes out under
//! `dt/longmynd/<name>` (tuner 1) and `dt2/longmynd/<name>` (tuner 2);
//! commands come in under `cmd/longmynd/#` plus the per-tuner subtrees.
//! The connection event loop runs on its own thread so publishing from the
//! status publisher never blocks on broker traffic.

use crate::config::{Polarisation, SharedConfig};
use crate::error::Result;
use crate::status::status_code as code;
use crate::status::ReceiverState;
use crate::{Shutdown, TunerId};
use log::{debug, error, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Status field names by wire code, shared with the FIFO/UDP line format
/// only in numbering; MQTT publishes by name.
const STATUS_NAMES: [&str; 34] = [
    "",
    "rx_state",
    "lna_gain",
    "puncrate",
    "poweri",
    "powerq",
    "carrier_frequency",
    "constel_i",
    "constel_q",
    "symbolrate",
    "viterbi_error",
    "ber",
    "mer",
    "service_name",
    "provider_name",
    "ts_null",
    "es_pid",
    "es_type",
    "modcod",
    "short_frame",
    "pilots",
    "ldpc_errors",
    "bch_errors",
    "bch_uncorect",
    "lnb_supply",
    "polarisation",
    "agc1",
    "agc2",
    "matype1",
    "matype2",
    "rolloff",
    "ts_packet_count",
    "ts_lock",
    "ts_bitrate",
];

/// FEC string per DVB-S2 MODCOD index.
const MODCOD_FEC: [&str; 29] = [
    "none", "1/4", "1/3", "2/5", "1/2", "3/5", "2/3", "3/4", "4/5", "5/6", "8/9", "9/10", "3/5",
    "2/3", "3/4", "5/6", "8/9", "9/10", "2/3", "3/4", "4/5", "5/6", "8/9", "9/10", "3/4", "4/5",
    "5/6", "8/9", "9/10",
];

/// Decode threshold MER per MODCOD, tenths of a dB; margin_db is measured
/// MER minus this.
const MODCOD_THRESHOLD_MER: [i32; 29] = [
    0, -24, -12, 0, 10, 22, 32, 40, 46, 52, 62, 65, 55, 66, 79, 94, 106, 110, 90, 102, 110, 116,
    129, 131, 126, 136, 143, 157, 161,
];

fn modulation_name(modcod: u32) -> &'static str {
    match modcod {
        0 => "none",
        1..=11 => "QPSK",
        12..=17 => "8PSK",
        18..=23 => "16APSK",
        24..=28 => "32APSK",
        _ => "none",
    }
}

/// MATYPE stream-type strings keyed by the top two bits. Codes 0 and 2 both
/// map to "Generic packetized" on this wire format.
fn matype_stream_name(matype1: u32) -> &'static str {
    match (matype1 & 0xc0) >> 6 {
        0 => "Generic packetized",
        1 => "Generic continuous",
        2 => "Generic packetized",
        _ => "Transport",
    }
}

const COMMAND_TOPICS: [&str; 3] = [
    "cmd/longmynd/#",
    "cmd/longmynd/tuner1/#",
    "cmd/longmynd/tuner2/#",
];

pub struct MqttStatus {
    client: Client,
    config: SharedConfig,
    latest_modcod: [u32; 2],
}

impl MqttStatus {
    /// Connect to the broker and start the command/event thread. The
    /// subscriptions are re-made on every CONNACK so a broker restart keeps
    /// the command channel alive.
    pub fn new(
        host: &str,
        port: u16,
        config: SharedConfig,
        shutdown: Arc<Shutdown>,
    ) -> Result<MqttStatus> {
        info!("MQTT status sink {}:{}", host, port);
        let mut options = MqttOptions::new("longmynd", host, port);
        options.set_keep_alive(Duration::from_secs(60));
        let (client, mut connection) = Client::new(options, 64);

        let command_client = client.clone();
        let command_config = config.clone();
        thread::spawn(move || {
            for event in connection.iter() {
                if shutdown.is_set() {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        for topic in COMMAND_TOPICS {
                            if let Err(e) = command_client.subscribe(topic, QoS::AtLeastOnce) {
                                error!("MQTT subscribe {} failed: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        handle_command(&command_config, &publish.topic, payload.trim());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        });

        Ok(MqttStatus {
            client,
            config,
            latest_modcod: [0, 0],
        })
    }

    fn prefix(tuner: TunerId) -> &'static str {
        match tuner {
            TunerId::Tuner1 => "dt",
            TunerId::Tuner2 => "dt2",
        }
    }

    fn publish(&mut self, topic: String, payload: String) {
        if let Err(e) = self
            .client
            .publish(topic, QoS::ExactlyOnce, false, payload.into_bytes())
        {
            debug!("MQTT publish failed: {}", e);
        }
    }

    fn publish_field(&mut self, tuner: TunerId, name: &str, payload: String) {
        self.publish(format!("{}/longmynd/{}", Self::prefix(tuner), name), payload);
    }

    /// Echo of the commanded settings, refreshed on every state report so
    /// dashboards can show commanded vs. measured.
    fn publish_requested(&mut self, tuner: TunerId) {
        let (freq, sr, swap, tsip) = {
            let cfg = self.config.lock().unwrap();
            let t = &cfg.tuners[tuner.index()];
            let tsip = match &cfg.ts_sink {
                crate::config::TsSink::Udp(ip, _) => ip.clone(),
                crate::config::TsSink::Fifo(_) => String::new(),
            };
            (t.current_freq_khz(), t.current_sr_ksps(), cfg.port_swap, tsip)
        };
        self.publish_field(tuner, "set/sr", sr.to_string());
        self.publish_field(tuner, "set/frequency", freq.to_string());
        self.publish_field(tuner, "set/swport", (swap as u8).to_string());
        self.publish_field(tuner, "set/tsip", tsip);
    }

    pub fn write_u32(&mut self, tuner: TunerId, status_code: u8, value: u32) {
        let name = STATUS_NAMES[status_code as usize];
        match status_code {
            code::STATE => {
                let state = match value {
                    0 => ReceiverState::Init,
                    1 => ReceiverState::Hunting,
                    2 => ReceiverState::FoundHeader,
                    3 => ReceiverState::DemodS,
                    _ => ReceiverState::DemodS2,
                };
                self.publish_field(tuner, name, state.mqtt_name().to_string());
                self.publish_requested(tuner);
            }
            code::SYMBOL_RATE => {
                /* sps on the wire, kS/s on the broker */
                self.publish_field(tuner, name, ((value + 500) / 1000).to_string());
            }
            code::MODCOD => {
                self.latest_modcod[tuner.index()] = value;
                let fec = MODCOD_FEC.get(value as usize).copied().unwrap_or("none");
                self.publish_field(tuner, "modulation", modulation_name(value).to_string());
                self.publish_field(tuner, "fec", fec.to_string());
                self.publish_field(tuner, name, value.to_string());
            }
            code::MER => {
                let mer = value as i32;
                self.publish_field(tuner, name, format!("{:.1}", mer as f64 / 10.0));
                let modcod = self.latest_modcod[tuner.index()] as usize;
                let margin = match MODCOD_THRESHOLD_MER.get(modcod) {
                    Some(threshold) if modcod != 0 => (mer - threshold) / 10,
                    _ => 0,
                };
                self.publish_field(tuner, "margin_db", margin.to_string());
            }
            code::ROLLOFF => {
                let rolloff = match value {
                    0 => "0.35",
                    1 => "0.25",
                    2 => "0.20",
                    _ => "0.15",
                };
                self.publish_field(tuner, name, rolloff.to_string());
            }
            code::MATYPE1 => {
                self.publish_field(tuner, name, matype_stream_name(value).to_string());
            }
            code::MATYPE2 => {
                self.publish_field(tuner, name, format!("{:x}", value));
            }
            _ => {
                self.publish_field(tuner, name, (value as i32).to_string());
            }
        }
    }

    pub fn write_str(&mut self, tuner: TunerId, status_code: u8, value: &str) {
        let name = STATUS_NAMES[status_code as usize];
        self.publish_field(tuner, name, value.to_string());
    }
}

/// Apply one command topic. Range violations are rejected with an error
/// line and leave the configuration untouched.
fn handle_command(config: &SharedConfig, topic: &str, payload: &str) {
    let (tuner, command) = match topic {
        t if t.starts_with("cmd/longmynd/tuner2/") => {
            (TunerId::Tuner2, &t["cmd/longmynd/tuner2/".len()..])
        }
        t if t.starts_with("cmd/longmynd/tuner1/") => {
            (TunerId::Tuner1, &t["cmd/longmynd/tuner1/".len()..])
        }
        t if t.starts_with("cmd/longmynd/") => (TunerId::Tuner1, &t["cmd/longmynd/".len()..]),
        _ => return,
    };

    match command {
        "sr" => match payload.parse::<u32>() {
            Ok(sr) => {
                if config.lock().unwrap().set_symbolrate(tuner, sr) {
                    info!("MQTT: {} symbol rate = {} kS/s", tuner.label(), sr);
                } else {
                    error!("MQTT: {} symbol rate {} out of range", tuner.label(), payload);
                }
            }
            Err(_) => error!("MQTT: bad symbol rate '{}'", payload),
        },
        "frequency" => match payload.parse::<u32>() {
            Ok(freq) => {
                if config.lock().unwrap().set_frequency(tuner, freq) {
                    info!("MQTT: {} frequency = {} kHz", tuner.label(), freq);
                } else {
                    error!("MQTT: {} frequency {} out of range", tuner.label(), payload);
                }
            }
            Err(_) => error!("MQTT: bad frequency '{}'", payload),
        },
        "polar" => {
            let polarisation = match payload {
                "h" => Polarisation::Horizontal18V,
                "v" => Polarisation::Vertical13V,
                "n" => Polarisation::Off,
                other => {
                    error!("MQTT: bad polarisation '{}' (use h, v or n)", other);
                    return;
                }
            };
            config.lock().unwrap().set_polarisation(tuner, polarisation);
            info!("MQTT: {} polarisation = {}", tuner.label(), payload);
        }
        "swport" => {
            let swap = payload.parse::<u8>().map(|v| v != 0).unwrap_or(false);
            config.lock().unwrap().set_port_swap(swap);
        }
        "tsip" => match tuner {
            TunerId::Tuner1 => {
                config.lock().unwrap().set_ts_ip(payload, 1234);
                info!("MQTT: TS output redirected to {}", payload);
            }
            TunerId::Tuner2 => {
                warn!("MQTT: tuner2 TS IP is fixed at startup (-j)");
            }
        },
        other => debug!("MQTT: unrecognised command '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulation_bands() {
        assert_eq!(modulation_name(0), "none");
        assert_eq!(modulation_name(4), "QPSK");
        assert_eq!(modulation_name(14), "8PSK");
        assert_eq!(modulation_name(20), "16APSK");
        assert_eq!(modulation_name(28), "32APSK");
    }

    #[test]
    fn matype_table_is_preserved_verbatim() {
        // Codes 0 and 2 deliberately share a label on this wire format.
        assert_eq!(matype_stream_name(0 << 6), "Generic packetized");
        assert_eq!(matype_stream_name(1 << 6), "Generic continuous");
        assert_eq!(matype_stream_name(2 << 6), "Generic packetized");
        assert_eq!(matype_stream_name(3 << 6), "Transport");
    }

    #[test]
    fn command_validation_rejects_out_of_range() {
        let config: SharedConfig = Arc::new(std::sync::Mutex::new(crate::config::Config::default()));
        handle_command(&config, "cmd/longmynd/tuner2/frequency", "500000");
        {
            let cfg = config.lock().unwrap();
            assert!(!cfg.tuners[1].new_config);
            assert_eq!(cfg.tuners[1].freq_khz[0], 0);
        }
        handle_command(&config, "cmd/longmynd/tuner2/frequency", "1278000");
        let cfg = config.lock().unwrap();
        assert!(cfg.tuners[1].new_config);
        assert_eq!(cfg.tuners[1].freq_khz[0], 1_278_000);
    }

    #[test]
    fn bare_commands_address_tuner1() {
        let config: SharedConfig = Arc::new(std::sync::Mutex::new(crate::config::Config::default()));
        handle_command(&config, "cmd/longmynd/sr", "1500");
        let cfg = config.lock().unwrap();
        assert_eq!(cfg.tuners[0].sr_ksps[0], 1500);
        assert!(cfg.tuners[0].new_config);
    }

    #[test]
    fn status_names_cover_all_codes() {
        assert_eq!(STATUS_NAMES[code::STATE as usize], "rx_state");
        assert_eq!(STATUS_NAMES[code::ROLLOFF as usize], "rolloff");
        assert_eq!(STATUS_NAMES[code::TS_BITRATE as usize], "ts_bitrate");
    }
}
