// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-tuner status record and the snapshot bus around it. Producers mutate
//! under the mutex and bump `last_updated_monotonic`; the publisher waits on
//! the condvar and copies the whole record out before doing any sink I/O.

use crate::monotonic_ms;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub const NUM_CONSTELLATIONS: usize = 16;
pub const NUM_ELEMENT_STREAMS: usize = 16;

/// Receiver software states; the numeric values are the wire codes reported
/// on the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Init = 0,
    Hunting = 1,
    FoundHeader = 2,
    DemodS = 3,
    DemodS2 = 4,
}

impl ReceiverState {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// MQTT state string, stable wire format.
    pub fn mqtt_name(self) -> &'static str {
        match self {
            ReceiverState::Init => "Init",
            ReceiverState::Hunting => "Hunting",
            ReceiverState::FoundHeader => "found header",
            ReceiverState::DemodS => "demod_s",
            ReceiverState::DemodS2 => "demod_s2",
        }
    }

    pub fn json_name(self) -> &'static str {
        match self {
            ReceiverState::Init => "init",
            ReceiverState::Hunting => "hunting",
            ReceiverState::FoundHeader => "found_header",
            ReceiverState::DemodS => "demod_s",
            ReceiverState::DemodS2 => "demod_s2",
        }
    }

    pub fn is_locked(self) -> bool {
        matches!(self, ReceiverState::DemodS | ReceiverState::DemodS2)
    }
}

/// Wire codes of the line-oriented status surface ("$<code>,<value>\n").
/// Stable across versions.
pub mod status_code {
    pub const STATE: u8 = 1;
    pub const LNA_GAIN: u8 = 2;
    pub const PUNCTURE_RATE: u8 = 3;
    pub const POWER_I: u8 = 4;
    pub const POWER_Q: u8 = 5;
    pub const CARRIER_FREQUENCY: u8 = 6;
    pub const CONSTELLATION_I: u8 = 7;
    pub const CONSTELLATION_Q: u8 = 8;
    pub const SYMBOL_RATE: u8 = 9;
    pub const VITERBI_ERROR_RATE: u8 = 10;
    pub const BER: u8 = 11;
    pub const MER: u8 = 12;
    pub const SERVICE_NAME: u8 = 13;
    pub const SERVICE_PROVIDER_NAME: u8 = 14;
    pub const TS_NULL_PERCENTAGE: u8 = 15;
    pub const ES_PID: u8 = 16;
    pub const ES_TYPE: u8 = 17;
    pub const MODCOD: u8 = 18;
    pub const SHORT_FRAME: u8 = 19;
    pub const PILOTS: u8 = 20;
    pub const ERRORS_LDPC_COUNT: u8 = 21;
    pub const ERRORS_BCH_COUNT: u8 = 22;
    pub const ERRORS_BCH_UNCORRECTED: u8 = 23;
    pub const LNB_SUPPLY: u8 = 24;
    pub const LNB_POLARISATION_H: u8 = 25;
    pub const AGC1_GAIN: u8 = 26;
    pub const AGC2_GAIN: u8 = 27;
    pub const MATYPE1: u8 = 28;
    pub const MATYPE2: u8 = 29;
    pub const ROLLOFF: u8 = 30;
    pub const TS_PACKET_COUNT: u8 = 31;
    pub const TS_LOCK: u8 = 32;
    pub const TS_BITRATE: u8 = 33;
}

/// Everything the receiver knows about one tuner, mirroring the readable
/// silicon state plus the TS-derived service metadata.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: ReceiverState,
    /// Raw 2-bit HEADER_MODE code as last read from the silicon.
    pub demod_state: u8,
    pub lna_ok: bool,
    pub lna_gain: u16,
    pub agc1_gain: u16,
    pub agc2_gain: u16,
    pub power_i: u8,
    pub power_q: u8,
    pub frequency_requested_khz: u32,
    pub frequency_offset_hz: i32,
    pub polarisation_supply: bool,
    pub polarisation_horizontal: bool,
    pub symbolrate_requested_ksps: u32,
    pub symbolrate_sps: u32,
    pub viterbi_error_rate: u32,
    pub bit_error_rate: u32,
    /// MER in tenths of a dB, signed.
    pub modulation_error_rate: i32,
    pub errors_bch_uncorrected: bool,
    pub errors_bch_count: u32,
    pub errors_ldpc_count: u32,
    pub constellation: [(i8, i8); NUM_CONSTELLATIONS],
    pub puncture_rate: u8,
    pub service_name: String,
    pub service_provider_name: String,
    pub ts_null_percentage: u8,
    pub ts_elementary_streams: [(u16, u16); NUM_ELEMENT_STREAMS],
    pub modcod: u32,
    pub matype1: u32,
    pub matype2: u32,
    pub short_frame: bool,
    pub pilots: bool,
    pub rolloff: u8,
    /// Monotonic ms of the last TS activity or reinit; feeds the watchdog.
    pub last_ts_or_reinit: u64,
    pub last_updated: u64,
    /// Running byte counter maintained by the TS reader without the lock.
    pub ts_packet_count: u32,
    pub ts_lock: bool,
    pub ts_bitrate_kbps: u32,
    pub ts_last_bitrate_calc: u64,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            state: ReceiverState::Init,
            demod_state: 0,
            lna_ok: false,
            lna_gain: 0,
            agc1_gain: 0,
            agc2_gain: 0,
            power_i: 0,
            power_q: 0,
            frequency_requested_khz: 0,
            frequency_offset_hz: 0,
            polarisation_supply: false,
            polarisation_horizontal: false,
            symbolrate_requested_ksps: 0,
            symbolrate_sps: 0,
            viterbi_error_rate: 0,
            bit_error_rate: 0,
            modulation_error_rate: 0,
            errors_bch_uncorrected: false,
            errors_bch_count: 0,
            errors_ldpc_count: 0,
            constellation: [(0, 0); NUM_CONSTELLATIONS],
            puncture_rate: 0,
            service_name: String::new(),
            service_provider_name: String::new(),
            ts_null_percentage: 100,
            ts_elementary_streams: [(0, 0); NUM_ELEMENT_STREAMS],
            modcod: 0,
            matype1: 0,
            matype2: 0,
            short_frame: false,
            pilots: false,
            rolloff: 0,
            last_ts_or_reinit: 0,
            last_updated: 0,
            ts_packet_count: 0,
            ts_lock: false,
            ts_bitrate_kbps: 0,
            ts_last_bitrate_calc: 0,
        }
    }
}

impl Status {
    /// Reported carrier frequency in kHz: commanded frequency plus the
    /// measured offset.
    pub fn carrier_frequency_khz(&self) -> u32 {
        (self.frequency_requested_khz as i64 + (self.frequency_offset_hz / 1000) as i64) as u32
    }
}

/// One status record plus its condition variable. Producers commit under the
/// mutex; the publisher snapshots and never holds the lock across sink I/O.
pub struct StatusMonitor {
    inner: Mutex<Status>,
    signal: Condvar,
}

impl StatusMonitor {
    pub fn new() -> Arc<StatusMonitor> {
        Arc::new(StatusMonitor {
            inner: Mutex::new(Status::default()),
            signal: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Status> {
        self.inner.lock().unwrap()
    }

    /// Mutate the record, stamp `last_updated`, and wake the publisher. The
    /// stamp is forced strictly increasing so a waiter never misses a
    /// commit that landed within the same millisecond.
    pub fn commit<F: FnOnce(&mut Status)>(&self, f: F) {
        let mut status = self.inner.lock().unwrap();
        f(&mut status);
        status.last_updated = monotonic_ms().max(status.last_updated + 1);
        self.signal.notify_all();
    }

    /// Wake the publisher without changing the update stamp (used by the TS
    /// parser after it has already written its fields).
    pub fn notify(&self) {
        let _guard = self.inner.lock().unwrap();
        self.signal.notify_all();
    }

    /// Wait until the record is newer than `last_seen`, up to `timeout`.
    /// Returns a snapshot, or None on timeout. Monotonicity of
    /// `last_updated` guarantees at most one snapshot per update.
    pub fn wait_newer(&self, last_seen: u64, timeout: Duration) -> Option<Status> {
        let guard = self.inner.lock().unwrap();
        let (guard, _timeout) = self
            .signal
            .wait_timeout_while(guard, timeout, |s| s.last_updated <= last_seen)
            .unwrap();
        if guard.last_updated > last_seen {
            Some(guard.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn commit_bumps_update_stamp() {
        let monitor = StatusMonitor::new();
        let before = monitor.lock().last_updated;
        monitor.commit(|s| s.agc1_gain = 42);
        let status = monitor.lock();
        assert!(status.last_updated >= before);
        assert_eq!(status.agc1_gain, 42);
    }

    #[test]
    fn wait_newer_sees_exactly_one_snapshot_per_update() {
        let monitor = StatusMonitor::new();
        let publisher = monitor.clone();
        let handle = thread::spawn(move || {
            let snap = publisher.wait_newer(0, Duration::from_secs(5)).unwrap();
            // A second wait with the observed stamp times out: no update, no
            // duplicate snapshot.
            let again = publisher.wait_newer(snap.last_updated, Duration::from_millis(20));
            (snap, again)
        });
        thread::sleep(Duration::from_millis(10));
        monitor.commit(|s| s.power_i = 9);
        let (snap, again) = handle.join().unwrap();
        assert_eq!(snap.power_i, 9);
        assert!(again.is_none());
    }

    #[test]
    fn carrier_frequency_combines_offset() {
        let mut status = Status::default();
        status.frequency_requested_khz = 741_500;
        status.frequency_offset_hz = -250_000;
        assert_eq!(status.carrier_frequency_khz(), 741_250);
    }
}
