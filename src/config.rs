// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide receiver configuration. One mutex guards the whole record;
//! writers set the per-tuner one-shot flags so the acquisition loops pick up
//! changes at their next iteration boundary.

use crate::TunerId;
use log::{info, warn};
use std::sync::{Arc, Mutex};

pub const FREQ_MIN_KHZ: u32 = 144_000;
pub const FREQ_MAX_KHZ: u32 = 2_450_000;
pub const SR_MIN_KSPS: u32 = 33;
pub const SR_MAX_KSPS: u32 = 27_500;

/// LNB supply voltage selection. Horizontal polarisation is 18V, vertical 13V.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarisation {
    Off,
    Vertical13V,
    Horizontal18V,
}

impl Polarisation {
    pub fn supply_enabled(self) -> bool {
        self != Polarisation::Off
    }

    pub fn horizontal(self) -> bool {
        self == Polarisation::Horizontal18V
    }
}

/// Where the transport stream goes.
#[derive(Debug, Clone)]
pub enum TsSink {
    Fifo(String),
    Udp(String, u16),
}

/// Where the status reports go.
#[derive(Debug, Clone)]
pub enum StatusSinkConfig {
    Fifo(String),
    Udp(String, u16),
    Mqtt(String),
    Json,
}

/// Per-tuner slice of the configuration. Tuner 2 carries its own copy of the
/// scan lists and polarisation so the two halves can be commanded apart.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    /// Up to four alternative carrier frequencies in kHz; unused slots are 0.
    pub freq_khz: [u32; 4],
    /// Up to four alternative symbol rates in ksymbols/s; unused slots are 0.
    pub sr_ksps: [u32; 4],
    pub freq_idx: usize,
    pub sr_idx: usize,
    pub polarisation: Polarisation,
    /// One-shot: the acquisition loop reconfigures and clears this.
    pub new_config: bool,
    /// One-shot: the TS reader drains the endpoint and clears this.
    pub ts_reset: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        TunerConfig {
            freq_khz: [0; 4],
            sr_ksps: [0; 4],
            freq_idx: 0,
            sr_idx: 0,
            polarisation: Polarisation::Off,
            new_config: false,
            ts_reset: false,
        }
    }
}

impl TunerConfig {
    pub fn current_freq_khz(&self) -> u32 {
        self.freq_khz[self.freq_idx]
    }

    pub fn current_sr_ksps(&self) -> u32 {
        self.sr_ksps[self.sr_idx]
    }

    /// Advance the scan grid: next non-zero symbol rate, and when the symbol
    /// rates wrap, the next non-zero frequency. Slot 0 is always non-zero so
    /// both inner loops terminate.
    fn cycle(&mut self) {
        loop {
            self.sr_idx = (self.sr_idx + 1) & 0x3;
            if self.sr_idx == 0 {
                loop {
                    self.freq_idx = (self.freq_idx + 1) & 0x3;
                    if self.freq_khz[self.freq_idx] != 0 {
                        break;
                    }
                }
            }
            if self.sr_ksps[self.sr_idx] != 0 {
                break;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tuners: [TunerConfig; 2],
    pub dual_enabled: bool,
    pub port_swap: bool,
    /// Multiplier on symbol rate defining the carrier search half-window.
    pub halfscan_ratio: f32,
    /// -1 disables the watchdog, otherwise must be > 500 ms.
    pub ts_timeout_ms: i64,
    pub beep_enabled: bool,

    pub ts_sink: TsSink,
    /// Tuner 2 TS always goes to UDP.
    pub ts2_udp: (String, u16),
    pub status_sink: StatusSinkConfig,

    /// USB bus/address of the main endpoint, (0, 0) for first detected.
    pub usb_device: (u8, u8),
    pub usb_device2: (u8, u8),
    pub auto_detect_second: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tuners: [TunerConfig::default(), TunerConfig::default()],
            dual_enabled: false,
            port_swap: false,
            halfscan_ratio: 1.5,
            ts_timeout_ms: 50 * 1000,
            beep_enabled: false,
            ts_sink: TsSink::Fifo("longmynd_main_ts".to_string()),
            ts2_udp: ("230.0.0.3".to_string(), 1234),
            status_sink: StatusSinkConfig::Fifo("longmynd_main_status".to_string()),
            usb_device: (0, 0),
            usb_device2: (0, 0),
            auto_detect_second: false,
        }
    }
}

fn freq_in_range(khz: u32) -> bool {
    (FREQ_MIN_KHZ..=FREQ_MAX_KHZ).contains(&khz)
}

fn sr_in_range(ksps: u32) -> bool {
    (SR_MIN_KSPS..=SR_MAX_KSPS).contains(&ksps)
}

impl Config {
    /// Replace the frequency list of one tuner with a single entry.
    /// Out-of-range requests are refused and reported to the caller.
    pub fn set_frequency(&mut self, tuner: TunerId, khz: u32) -> bool {
        if !freq_in_range(khz) {
            warn!("frequency {} kHz out of range ({}..{})", khz, FREQ_MIN_KHZ, FREQ_MAX_KHZ);
            return false;
        }
        let t = &mut self.tuners[tuner.index()];
        t.freq_khz = [khz, 0, 0, 0];
        t.freq_idx = 0;
        t.new_config = true;
        true
    }

    /// Replace the symbol-rate list of one tuner with a single entry.
    pub fn set_symbolrate(&mut self, tuner: TunerId, ksps: u32) -> bool {
        if !sr_in_range(ksps) {
            warn!("symbol rate {} kS/s out of range ({}..{})", ksps, SR_MIN_KSPS, SR_MAX_KSPS);
            return false;
        }
        let t = &mut self.tuners[tuner.index()];
        t.sr_ksps = [ksps, 0, 0, 0];
        t.sr_idx = 0;
        t.new_config = true;
        true
    }

    pub fn set_polarisation(&mut self, tuner: TunerId, pol: Polarisation) {
        let t = &mut self.tuners[tuner.index()];
        t.polarisation = pol;
        t.new_config = true;
    }

    pub fn set_port_swap(&mut self, swap: bool) {
        info!("port swap: {}", swap);
        self.port_swap = swap;
        // Swapping F-connectors re-routes both halves.
        self.tuners[0].new_config = true;
        if self.dual_enabled {
            self.tuners[1].new_config = true;
        }
    }

    pub fn set_ts_ip(&mut self, ip: &str, port: u16) {
        self.ts_sink = TsSink::Udp(ip.to_string(), port);
        self.tuners[0].new_config = true;
    }

    /// Request a reconfiguration of one tuner, optionally advancing the
    /// frequency/symbol-rate scan grid first (TS-timeout path).
    pub fn reinit(&mut self, tuner: TunerId, advance: bool) {
        let t = &mut self.tuners[tuner.index()];
        if advance {
            t.cycle();
            info!(
                "config cycle {:?}: frequency[{}] = {} kHz, symbol rate[{}] = {} kS/s",
                tuner,
                t.freq_idx,
                t.freq_khz[t.freq_idx],
                t.sr_idx,
                t.sr_ksps[t.sr_idx]
            );
        }
        t.new_config = true;
    }
}

pub type SharedConfig = Arc<Mutex<Config>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with(freqs: [u32; 4], srs: [u32; 4]) -> Config {
        let mut cfg = Config::default();
        cfg.tuners[0].freq_khz = freqs;
        cfg.tuners[0].sr_ksps = srs;
        cfg
    }

    #[test]
    fn boundary_frequencies() {
        let mut cfg = Config::default();
        assert!(cfg.set_frequency(TunerId::Tuner1, 144_000));
        assert!(cfg.set_frequency(TunerId::Tuner1, 2_450_000));
        assert!(!cfg.set_frequency(TunerId::Tuner1, 143_999));
        assert!(!cfg.set_frequency(TunerId::Tuner1, 2_450_001));
    }

    #[test]
    fn boundary_symbolrates() {
        let mut cfg = Config::default();
        assert!(cfg.set_symbolrate(TunerId::Tuner1, 33));
        assert!(!cfg.set_symbolrate(TunerId::Tuner1, 32));
        assert!(cfg.set_symbolrate(TunerId::Tuner1, 27_500));
        assert!(!cfg.set_symbolrate(TunerId::Tuner1, 27_501));
    }

    #[test]
    fn setters_raise_new_config() {
        let mut cfg = Config::default();
        assert!(cfg.set_frequency(TunerId::Tuner2, 1_278_000));
        assert!(cfg.tuners[1].new_config);
        assert!(!cfg.tuners[0].new_config);
    }

    #[test]
    fn cycle_skips_zero_slots() {
        let mut cfg = cfg_with([741_500, 0, 10_491_500 - 9_750_000, 0], [1500, 333, 0, 0]);
        cfg.reinit(TunerId::Tuner1, true);
        assert_eq!(cfg.tuners[0].sr_idx, 1);
        assert_eq!(cfg.tuners[0].freq_idx, 0);
        // Wrapping the symbol rates advances to the next non-zero frequency.
        cfg.reinit(TunerId::Tuner1, true);
        assert_eq!(cfg.tuners[0].sr_idx, 0);
        assert_eq!(cfg.tuners[0].freq_idx, 2);
        assert!(cfg.tuners[0].new_config);
    }

    #[test]
    fn cycle_single_entry_is_noop() {
        let mut cfg = cfg_with([741_500, 0, 0, 0], [1500, 0, 0, 0]);
        cfg.reinit(TunerId::Tuner1, true);
        assert_eq!(cfg.tuners[0].sr_idx, 0);
        assert_eq!(cfg.tuners[0].freq_idx, 0);
        // Indices always reference a non-zero slot.
        assert_ne!(cfg.tuners[0].current_freq_khz(), 0);
        assert_ne!(cfg.tuners[0].current_sr_ksps(), 0);
    }
}
