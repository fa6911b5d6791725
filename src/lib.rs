// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side control plane for MiniTiouner DVB-S/S2 receivers: drives the
//! STV0910 demodulator, STV6120 tuner, and STVVGLNA amplifiers over an FTDI
//! USB bridge, streams the transport stream out, and publishes telemetry.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod psi;
pub mod sink;
pub mod status;
pub mod stv0910;
pub mod stv6120;
pub mod stvvglna;
pub mod ts;

use error::Error;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// The two receiver slots. Tuner 1 is bound to the demodulator TOP half,
/// tuner 2 to the BOTTOM half; the binding never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerId {
    Tuner1,
    Tuner2,
}

impl TunerId {
    pub fn index(self) -> usize {
        match self {
            TunerId::Tuner1 => 0,
            TunerId::Tuner2 => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TunerId::Tuner1 => "tuner1",
            TunerId::Tuner2 => "tuner2",
        }
    }
}

/// Milliseconds on a monotonic clock, zeroed at first use.
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Process-wide stop slot. The first fatal error (or the signal handler)
/// wins; every loop polls it and unwinds, and the main thread turns it into
/// the process exit code.
pub struct Shutdown {
    // 0 = running, otherwise error code + 1 so a clean signal stop (exit
    // code 0) is still distinguishable from "running".
    state: AtomicU8,
}

impl Shutdown {
    pub fn new() -> Arc<Shutdown> {
        Arc::new(Shutdown {
            state: AtomicU8::new(0),
        })
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    /// Record a stop cause; only the first caller's code sticks.
    pub fn raise(&self, err: &Error) {
        let _ = self
            .state
            .compare_exchange(0, err.code() + 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> u8 {
        self.state.load(Ordering::SeqCst).saturating_sub(1)
    }
}

/// Everything one tuner's tasks need, handed to each thread at spawn time.
/// All fields are shared handles; the descriptor itself is immutable.
#[derive(Clone)]
pub struct TaskContext {
    pub tuner: TunerId,
    pub config: config::SharedConfig,
    pub status: Arc<status::StatusMonitor>,
    pub gateway: Arc<device::BusGateway>,
    pub shutdown: Arc<Shutdown>,
    pub barrier: Arc<acquisition::InitBarrier>,
    pub mailbox: Arc<ts::Mailbox>,
    /// Byte counter fed by the TS reader and sampled by the acquisition
    /// loop; deliberately outside the status mutex.
    pub ts_bytes: Arc<AtomicU32>,
    /// Asks the TS parser to forget the previous service.
    pub parser_reset: Arc<AtomicBool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn first_shutdown_cause_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_set());
        shutdown.raise(&Error::PllTimeout);
        shutdown.raise(&Error::NimInit);
        assert!(shutdown.is_set());
        assert_eq!(shutdown.exit_code(), Error::PllTimeout.code());
    }

    #[test]
    fn signal_stop_exits_zero() {
        let shutdown = Shutdown::new();
        shutdown.raise(&Error::SignalTerminate);
        assert!(shutdown.is_set());
        assert_eq!(shutdown.exit_code(), 0);
    }
}
