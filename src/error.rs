// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{error, fmt, result};

/// A result of a function that may return a `Error`.
pub type Result<T> = result::Result<T, Error>;

/// Everything that can go wrong in the receiver, with a stable exit code per
/// kind. Sink write failures are handled locally by the publishers and never
/// appear here.
#[derive(Debug)]
pub enum Error {
    /// Invalid command line argument or out-of-range command value.
    ArgsInput(String),
    /// USB transport failure, non-retryable at the bus layer.
    Usb(rusb::Error),
    /// Operation addressed an endpoint that is not initialised/active.
    BadDevice,
    /// Demodulator identity registers did not read back (0x51, 0x20).
    BadChipId(u8, u8),
    /// Scratch-register write/readback check failed during NIM init.
    NimInit,
    /// Demodulator master-clock PLL did not lock.
    PllTimeout,
    /// RF tuner PLL did not lock; retryable by the acquisition engine.
    TunerLockTimeout,
    /// Silicon reported a HEADER_MODE outside the four legal values.
    BadDemodHuntState(u8),
    /// State machine reached a branch that should be unreachable.
    State,
    /// Unrecognised Viterbi puncture-rate code.
    ViterbiPunctureRate(u8),
    /// TS buffer allocation failed.
    TsBufferMalloc,
    UdpSocketOpen(std::io::Error),
    UdpWrite,
    UdpClose,
    /// Thread creation failed or a child thread reported a fatal error.
    Thread,
    /// Operator-requested shutdown; treated as a clean stop everywhere.
    SignalTerminate,
}

impl Error {
    /// Stable process exit code for this error kind. `SignalTerminate` is a
    /// clean stop and maps to zero.
    pub fn code(&self) -> u8 {
        match self {
            Error::ArgsInput(_) => 1,
            Error::Usb(_) => 2,
            Error::BadDevice => 3,
            Error::BadChipId(_, _) => 4,
            Error::NimInit => 5,
            Error::PllTimeout => 6,
            Error::TunerLockTimeout => 7,
            Error::BadDemodHuntState(_) => 8,
            Error::State => 9,
            Error::ViterbiPunctureRate(_) => 10,
            Error::TsBufferMalloc => 11,
            Error::UdpSocketOpen(_) => 12,
            Error::UdpWrite => 13,
            Error::UdpClose => 14,
            Error::Thread => 15,
            Error::SignalTerminate => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ArgsInput(msg) => write!(f, "invalid arguments: {}", msg),
            Error::Usb(e) => write!(f, "USB transport error: {}", e),
            Error::BadDevice => write!(f, "device not initialised"),
            Error::BadChipId(mid, did) => {
                write!(f, "STV0910 bad chip id (MID=0x{:02x} DID=0x{:02x})", mid, did)
            }
            Error::NimInit => write!(f, "NIM scratch register check failed"),
            Error::PllTimeout => write!(f, "STV0910 PLL lock timeout"),
            Error::TunerLockTimeout => write!(f, "STV6120 tuner lock timeout"),
            Error::BadDemodHuntState(s) => {
                write!(f, "STV0910 returned a bad scan state (0x{:02x})", s)
            }
            Error::State => write!(f, "state machine reached an unreachable branch"),
            Error::ViterbiPunctureRate(v) => {
                write!(f, "STV0910 unknown puncture rate code 0x{:02x}", v)
            }
            Error::TsBufferMalloc => write!(f, "TS buffer allocation failed"),
            Error::UdpSocketOpen(e) => write!(f, "UDP socket open failed: {}", e),
            Error::UdpWrite => write!(f, "UDP write failed"),
            Error::UdpClose => write!(f, "UDP close failed"),
            Error::Thread => write!(f, "thread error"),
            Error::SignalTerminate => write!(f, "terminated by signal"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Usb(e) => Some(e),
            Error::UdpSocketOpen(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::Usb(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable_and_distinct() {
        let errors = [
            Error::ArgsInput(String::new()),
            Error::Usb(rusb::Error::Io),
            Error::BadDevice,
            Error::BadChipId(0, 0),
            Error::NimInit,
            Error::PllTimeout,
            Error::TunerLockTimeout,
            Error::BadDemodHuntState(0),
            Error::State,
            Error::ViterbiPunctureRate(0),
            Error::TsBufferMalloc,
            Error::UdpWrite,
            Error::UdpClose,
            Error::Thread,
        ];
        let mut seen = std::collections::HashSet::new();
        for e in &errors {
            assert!(e.code() != 0, "{} must map to a non-zero exit code", e);
            assert!(seen.insert(e.code()), "duplicate exit code for {}", e);
        }
        assert_eq!(Error::SignalTerminate.code(), 0);
    }
}
