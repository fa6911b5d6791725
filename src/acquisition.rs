// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-tuner acquisition engine: a 500ms control loop that reconfigures the
//! front end when commanded, drives the blind-scan state machine, reads the
//! live telemetry, and commits a snapshot into the shared status record at
//! the end of every iteration.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::monotonic_ms;
use crate::status::{ReceiverState, Status, NUM_CONSTELLATIONS};
use crate::stv0910::{DemodHalf, HeaderMode, Stv0910};
use crate::stv6120::{Stv6120, PLL_ATTEMPTS};
use crate::stvvglna::{pack_lna_gain, LnaInput, Stvvglna};
use crate::{TaskContext, TunerId};
use log::{error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Control loop period and polling granularity.
const LOOP_PERIOD_MS: u64 = 500;
const LOOP_POLL: Duration = Duration::from_millis(100);

/// How long tuner 2 waits for tuner 1 to finish the TOP-first init.
const BARRIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between tuner PLL retry attempts.
const TUNER_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Latched barrier for the dual-tuner TOP-then-BOTTOM init ordering. Tuner 1
/// arms it at the start of its reconfiguration and fires it exactly once
/// when both halves are programmed; tuner 2 blocks on it before touching
/// the hardware.
pub struct InitBarrier {
    fired: Mutex<bool>,
    signal: Condvar,
}

impl Default for InitBarrier {
    fn default() -> Self {
        InitBarrier::new()
    }
}

impl InitBarrier {
    pub fn new() -> InitBarrier {
        InitBarrier {
            fired: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Arm for a new reconfiguration cycle.
    pub fn reset(&self) {
        *self.fired.lock().unwrap() = false;
    }

    /// Latch and wake every waiter. Idempotent within a cycle.
    pub fn fire(&self) {
        let mut fired = self.fired.lock().unwrap();
        if !*fired {
            *fired = true;
            self.signal.notify_all();
        }
    }

    /// Wait until fired or the timeout expires; returns whether it fired.
    pub fn wait_fired(&self, timeout: Duration) -> bool {
        let fired = self.fired.lock().unwrap();
        let (fired, _) = self
            .signal
            .wait_timeout_while(fired, timeout, |f| !*f)
            .unwrap();
        *fired
    }
}

/// Software state transition for a scan-state reading. Every HEADER_MODE
/// code is a legal successor of every state; illegal codes never get here
/// (they surface as `BadDemodHuntState` from the driver).
pub(crate) fn next_state(mode: HeaderMode) -> ReceiverState {
    match mode {
        HeaderMode::Hunting => ReceiverState::Hunting,
        HeaderMode::FoundHeader => ReceiverState::FoundHeader,
        HeaderMode::DvbS => ReceiverState::DemodS,
        HeaderMode::DvbS2 => ReceiverState::DemodS2,
    }
}

/// Thread entry point. Fatal errors land in the shared shutdown slot and
/// bring the process down.
pub fn loop_acquisition(ctx: TaskContext) {
    info!("acquisition loop for {} running", ctx.tuner.label());
    if let Err(e) = run(&ctx) {
        error!("acquisition loop for {} failed: {}", ctx.tuner.label(), e);
        ctx.shutdown.raise(&e);
    }
    info!("acquisition loop for {} stopped", ctx.tuner.label());
}

struct Engine {
    ctx: TaskContext,
    demod: Stv0910,
    rf: Stv6120,
    lna: Stvvglna,
    half: DemodHalf,
    /// Local draft committed into the shared record once per iteration.
    draft: Status,
    /// Config snapshot taken at the last reconfiguration.
    cfg: Config,
    last_ts_bytes: u32,
}

fn run(ctx: &TaskContext) -> Result<()> {
    let mut engine = Engine {
        ctx: ctx.clone(),
        demod: Stv0910::new(ctx.gateway.clone(), ctx.tuner),
        rf: Stv6120::new(ctx.gateway.clone(), ctx.tuner),
        lna: Stvvglna::new(ctx.gateway.clone(), ctx.tuner),
        half: DemodHalf::from(ctx.tuner),
        draft: Status::default(),
        cfg: ctx.config.lock().unwrap().clone(),
        last_ts_bytes: 0,
    };
    engine.draft.last_ts_or_reinit = monotonic_ms();

    let mut last_loop = monotonic_ms();
    loop {
        /* fixed 500ms cadence, polled so shutdown stays responsive */
        while monotonic_ms() < last_loop + LOOP_PERIOD_MS {
            if ctx.shutdown.is_set() {
                return Ok(());
            }
            thread::sleep(LOOP_POLL);
        }
        if ctx.shutdown.is_set() {
            return Ok(());
        }

        engine.handle_new_config()?;
        engine.step_state_machine()?;
        engine.watchdog();
        engine.commit();

        last_loop = monotonic_ms();
    }
}

impl Engine {
    fn tuner(&self) -> TunerId {
        self.ctx.tuner
    }

    /// Consume the tuner-scoped new-config flag and rerun the whole
    /// front-end bring-up if it was set.
    fn handle_new_config(&mut self) -> Result<()> {
        let pending = {
            let cfg = self.ctx.config.lock().unwrap();
            cfg.tuners[self.tuner().index()].new_config
        };
        if !pending {
            return Ok(());
        }

        /* snapshot under the config mutex, clear the flag, ask the TS
         * reader to flush */
        let snapshot = {
            let mut cfg = self.ctx.config.lock().unwrap();
            cfg.tuners[self.tuner().index()].new_config = false;
            cfg.tuners[self.tuner().index()].ts_reset = true;
            cfg.clone()
        };
        info!("{} applying new configuration", self.tuner().label());
        self.reconfigure(&snapshot)?;
        self.cfg = snapshot;
        self.draft.last_ts_or_reinit = monotonic_ms();
        Ok(())
    }

    fn reconfigure(&mut self, cfg: &Config) -> Result<()> {
        let tuner_cfg = &cfg.tuners[self.tuner().index()];
        let freq = tuner_cfg.current_freq_khz();
        let sr = tuner_cfg.current_sr_ksps();
        self.draft.frequency_requested_khz = freq;
        self.draft.symbolrate_requested_ksps = sr;

        if cfg.dual_enabled && self.tuner() == TunerId::Tuner1 {
            self.ctx.barrier.reset();
        }

        let mut attempts = PLL_ATTEMPTS;
        loop {
            if self.ctx.shutdown.is_set() {
                return Ok(());
            }

            match self.tuner() {
                TunerId::Tuner1 if cfg.dual_enabled => {
                    /* program BOTH halves, TOP first, then release tuner 2 */
                    let sr2 = cfg.tuners[1].current_sr_ksps();
                    self.demod.init_dual_sequence(sr, sr2, cfg.halfscan_ratio)?;
                    self.ctx.barrier.fire();
                }
                TunerId::Tuner2 if cfg.dual_enabled => {
                    if !self.ctx.barrier.wait_fired(BARRIER_TIMEOUT) {
                        warn!("timeout waiting for TOP demodulator init, proceeding anyway");
                    }
                }
                _ => {
                    self.demod.init(sr, 0, cfg.halfscan_ratio)?;
                }
            }

            let (freq1, freq2) = match (cfg.dual_enabled, self.tuner()) {
                (true, TunerId::Tuner2) => (0, freq),
                _ => (freq, 0),
            };
            match self.rf.init(freq1, freq2, cfg.port_swap) {
                Err(Error::TunerLockTimeout) if attempts > 0 => {
                    attempts -= 1;
                    info!("caught tuner lock timeout, {} attempts remaining", attempts);
                    self.rf.powerdown_both_paths()?;
                    thread::sleep(TUNER_RETRY_PAUSE);
                    continue;
                }
                other => other?,
            }
            break;
        }

        /* LNAs: enable the one feeding this path, park the other. In dual
         * mode a missing BOTTOM LNA degrades gracefully; in single mode any
         * failure is fatal. */
        let top_on = !cfg.port_swap;
        let lna_top = match self.lna.init(LnaInput::Top, top_on) {
            Ok(present) => present,
            Err(e) if cfg.dual_enabled && self.tuner() == TunerId::Tuner2 => {
                warn!("TOP LNA init failed ({}), continuing degraded", e);
                false
            }
            Err(e) => return Err(e),
        };
        let lna_bottom = match self.lna.init(LnaInput::Bottom, !top_on) {
            Ok(present) => present,
            Err(e) if cfg.dual_enabled => {
                warn!("BOTTOM LNA init failed ({}), continuing degraded", e);
                false
            }
            Err(e) => return Err(e),
        };
        self.draft.lna_ok = lna_top || lna_bottom;

        let pol = tuner_cfg.polarisation;
        self.ctx
            .gateway
            .set_polarisation_supply(self.tuner(), pol.supply_enabled(), pol.horizontal())?;
        self.draft.polarisation_supply = pol.supply_enabled();
        self.draft.polarisation_horizontal = pol.horizontal();

        if !cfg.dual_enabled {
            self.demod.start_scan(self.half)?;
        }
        /* dual mode: both scans were released by the TOP-first batch */

        self.draft.state = ReceiverState::Hunting;
        Ok(())
    }

    fn step_state_machine(&mut self) -> Result<()> {
        if self.draft.state == ReceiverState::Init {
            /* nothing to poll until the first configuration lands */
            return Ok(());
        }
        self.report()?;
        let mode = self.demod.read_scan_state(self.half)?;
        self.draft.demod_state = mode as u8;
        self.draft.state = next_state(mode);
        Ok(())
    }

    /// Read the live telemetry in the canonical order: AGC, power,
    /// constellation, puncture, carrier, symbol rate, Viterbi/BER,
    /// BCH/LDPC, MATYPE, then the lock-gated MER and MODCOD.
    fn report(&mut self) -> Result<()> {
        if self.draft.lna_ok {
            let input = match self.half {
                DemodHalf::Top => LnaInput::Top,
                DemodHalf::Bottom => LnaInput::Bottom,
            };
            // A flaky LNA read only costs this sample.
            if let Ok((gain, vgo)) = self.lna.read_agc(input) {
                self.draft.lna_gain = pack_lna_gain(gain, vgo);
            }
        }

        self.draft.agc1_gain = self.demod.read_agc1_gain(self.half)?;
        self.draft.agc2_gain = self.demod.read_agc2_gain(self.half)?;
        let (power_i, power_q) = self.demod.read_power(self.half)?;
        self.draft.power_i = power_i;
        self.draft.power_q = power_q;

        for slot in 0..NUM_CONSTELLATIONS {
            self.draft.constellation[slot] = self.demod.read_constellation(self.half)?;
        }

        self.draft.puncture_rate = self.demod.read_puncture_rate(self.half)?;
        self.draft.frequency_offset_hz = self.demod.read_car_freq(self.half)?;
        self.draft.symbolrate_sps = self.demod.read_sr(self.half)?;
        self.draft.viterbi_error_rate = self.demod.read_err_rate(self.half)?;
        self.draft.bit_error_rate = self.demod.read_ber(self.half)?;
        self.draft.errors_bch_uncorrected = self.demod.read_errors_bch_uncorrected()?;
        self.draft.errors_bch_count = self.demod.read_errors_bch_count()?;
        self.draft.errors_ldpc_count = self.demod.read_errors_ldpc_count()?;
        let (matype1, matype2) = self.demod.read_matype(self.half)?;
        self.draft.matype1 = matype1;
        self.draft.matype2 = matype2;

        if self.draft.state.is_locked() {
            self.draft.modulation_error_rate = self.demod.read_mer(self.half)?;
        } else {
            self.draft.modulation_error_rate = 0;
        }

        let (modcod, short_frame, pilots, rolloff) = self.demod.read_modcod_and_type(self.half)?;
        self.draft.modcod = modcod;
        self.draft.rolloff = rolloff;
        if self.draft.state == ReceiverState::DemodS2 {
            self.draft.short_frame = short_frame;
            self.draft.pilots = pilots;
        } else {
            /* only meaningful while locked to DVB-S2 */
            self.draft.short_frame = false;
            self.draft.pilots = false;
        }
        Ok(())
    }

    /// TS activity watchdog: note reader progress, derive the bitrate, and
    /// when the stream has been silent too long advance the scan grid and
    /// schedule a reconfiguration.
    fn watchdog(&mut self) {
        let now = monotonic_ms();
        let bytes = self.ctx.ts_bytes.load(Ordering::Relaxed);
        if bytes != self.last_ts_bytes {
            let elapsed = now.saturating_sub(self.draft.ts_last_bitrate_calc);
            if elapsed > 0 && bytes > self.last_ts_bytes {
                let delta = (bytes - self.last_ts_bytes) as u64;
                self.draft.ts_bitrate_kbps = (delta * 8 / elapsed) as u32;
            }
            self.draft.ts_last_bitrate_calc = now;
            self.draft.last_ts_or_reinit = now;
            self.last_ts_bytes = bytes;
        }
        self.draft.ts_packet_count = bytes;
        self.draft.ts_lock = self.draft.state.is_locked();

        let timeout = self.cfg.ts_timeout_ms;
        if timeout >= 0
            && self.draft.state != ReceiverState::Init
            && now > self.draft.last_ts_or_reinit + timeout as u64
        {
            info!(
                "{}: no TS for {} ms, cycling frequency/symbol-rate",
                self.tuner().label(),
                timeout
            );
            self.ctx.config.lock().unwrap().reinit(self.tuner(), true);
            self.draft.last_ts_or_reinit = now;
        }
    }

    /// Copy the draft into the shared record, stamp it, wake the publisher.
    fn commit(&mut self) {
        let draft = &self.draft;
        self.ctx.status.commit(|s| {
            s.state = draft.state;
            s.demod_state = draft.demod_state;
            s.lna_ok = draft.lna_ok;
            s.lna_gain = draft.lna_gain;
            s.agc1_gain = draft.agc1_gain;
            s.agc2_gain = draft.agc2_gain;
            s.power_i = draft.power_i;
            s.power_q = draft.power_q;
            s.frequency_requested_khz = draft.frequency_requested_khz;
            s.frequency_offset_hz = draft.frequency_offset_hz;
            s.polarisation_supply = draft.polarisation_supply;
            s.polarisation_horizontal = draft.polarisation_horizontal;
            s.symbolrate_requested_ksps = draft.symbolrate_requested_ksps;
            s.symbolrate_sps = draft.symbolrate_sps;
            s.viterbi_error_rate = draft.viterbi_error_rate;
            s.bit_error_rate = draft.bit_error_rate;
            s.modulation_error_rate = draft.modulation_error_rate;
            s.errors_bch_uncorrected = draft.errors_bch_uncorrected;
            s.errors_bch_count = draft.errors_bch_count;
            s.errors_ldpc_count = draft.errors_ldpc_count;
            s.constellation = draft.constellation;
            s.puncture_rate = draft.puncture_rate;
            s.modcod = draft.modcod;
            s.matype1 = draft.matype1;
            s.matype2 = draft.matype2;
            s.short_frame = draft.short_frame;
            s.pilots = draft.pilots;
            s.rolloff = draft.rolloff;
            s.ts_packet_count = draft.ts_packet_count;
            s.ts_lock = draft.ts_lock;
            s.ts_bitrate_kbps = draft.ts_bitrate_kbps;
            s.last_ts_or_reinit = draft.last_ts_or_reinit;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn every_header_mode_maps_to_a_receiver_state() {
        assert_eq!(next_state(HeaderMode::Hunting), ReceiverState::Hunting);
        assert_eq!(next_state(HeaderMode::FoundHeader), ReceiverState::FoundHeader);
        assert_eq!(next_state(HeaderMode::DvbS), ReceiverState::DemodS);
        assert_eq!(next_state(HeaderMode::DvbS2), ReceiverState::DemodS2);
    }

    #[test]
    fn barrier_latches_and_releases_waiter() {
        let barrier = Arc::new(InitBarrier::new());
        let waiter = barrier.clone();
        let handle =
            std::thread::spawn(move || waiter.wait_fired(Duration::from_secs(5)));
        barrier.fire();
        assert!(handle.join().unwrap());
        // Latched: a late waiter sails straight through.
        assert!(barrier.wait_fired(Duration::from_millis(1)));
        // Re-armed for the next cycle.
        barrier.reset();
        assert!(!barrier.wait_fired(Duration::from_millis(10)));
    }

    #[test]
    fn barrier_wait_times_out() {
        let barrier = InitBarrier::new();
        let start = Instant::now();
        assert!(!barrier.wait_fired(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn firing_twice_is_harmless() {
        let barrier = InitBarrier::new();
        barrier.fire();
        barrier.fire();
        assert!(barrier.wait_fired(Duration::from_millis(1)));
    }
}
