// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus gateway: serialises control traffic onto one or two FTDI endpoints
//! and owns the demodulator's I2C repeater state. The repeater bit routes
//! the bus segment to the tuner and LNAs; it must be off for direct
//! demodulator traffic and on for everything behind it, and flipping it
//! while a transaction is mid-flight corrupts that transaction. Every
//! control primitive therefore holds the endpoint's control mutex for the
//! whole USB exchange and makes the repeater transition an explicit
//! precondition. The TS FIFO is a separate USB channel with a single
//! reader, so bulk TS reads never touch the control mutex and can never
//! stall an I2C transaction.

pub mod ftdi;
#[cfg(test)]
mod mock_ftdi;

#[cfg(not(test))]
use ftdi::FtdiBridge;
#[cfg(test)]
use mock_ftdi::MockFtdiBridge as FtdiBridge;

pub use ftdi::UsbAddress;

use crate::error::{Error, Result};
use crate::TunerId;
use log::error;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[cfg(test)]
mod gateway_test;

/// NIM I2C addresses behind the shared bus segment.
pub const NIM_DEMOD_ADDR: u8 = 0xd0;
pub const NIM_TUNER_ADDR: u8 = 0xc0;
pub const NIM_LNA_TOP_ADDR: u8 = 0xc8;
pub const NIM_LNA_BOTTOM_ADDR: u8 = 0xca;

/// The demodulator register carrying the repeater bit in its MSB.
pub const DEMOD_REG_I2CRPT: u16 = 0xf12a;
const I2CRPT_ON: u8 = 0xb8;
const I2CRPT_OFF: u8 = 0x38;

/// State guarded by the control mutex: whether the demod's tuner-side
/// repeater is currently open. Cached to avoid redundant writes and to keep
/// the transitions linearised with the traffic they guard.
struct ControlState {
    repeater_on: bool,
}

struct Endpoint {
    bridge: FtdiBridge,
    control: Mutex<ControlState>,
}

impl Endpoint {
    fn new(bridge: FtdiBridge) -> Endpoint {
        Endpoint {
            bridge,
            control: Mutex::new(ControlState { repeater_on: false }),
        }
    }
}

fn set_repeater(bridge: &FtdiBridge, control: &mut ControlState, on: bool) -> Result<()> {
    if control.repeater_on == on {
        return Ok(());
    }
    // Flip the cache first: even a failed write leaves the bus state
    // unknown, and re-arming on the next transaction is the safe side.
    control.repeater_on = on;
    bridge.i2c_write_reg16(
        NIM_DEMOD_ADDR,
        DEMOD_REG_I2CRPT,
        if on { I2CRPT_ON } else { I2CRPT_OFF },
    )
}

fn demod_read_locked(bridge: &FtdiBridge, control: &mut ControlState, reg: u16) -> Result<u8> {
    set_repeater(bridge, control, false)?;
    bridge.i2c_read_reg16(NIM_DEMOD_ADDR, reg)
}

fn demod_write_locked(
    bridge: &FtdiBridge,
    control: &mut ControlState,
    reg: u16,
    val: u8,
) -> Result<()> {
    if reg != DEMOD_REG_I2CRPT {
        set_repeater(bridge, control, false)?;
    }
    bridge.i2c_write_reg16(NIM_DEMOD_ADDR, reg, val)
}

/// Serialised access to the NIM(s). One endpoint in the single-FTDI build,
/// two in the dual-FTDI build, each bound 1:1 to a `TunerId`.
pub struct BusGateway {
    endpoints: [Option<Endpoint>; 2],
    dual_enabled: bool,
}

/// Holds one endpoint's control mutex across a multi-register sequence, so
/// batch programming (the dual-init TOP-then-BOTTOM write set) is
/// transactional on the shared bus. All demod writes go through the same
/// discipline; there is no unlocked fast path.
pub struct BusSession<'a> {
    bridge: &'a FtdiBridge,
    control: MutexGuard<'a, ControlState>,
}

impl BusSession<'_> {
    pub fn demod_write(&mut self, reg: u16, val: u8) -> Result<()> {
        demod_write_locked(self.bridge, &mut self.control, reg, val)
    }

    pub fn demod_read(&mut self, reg: u16) -> Result<u8> {
        demod_read_locked(self.bridge, &mut self.control, reg)
    }
}

impl BusGateway {
    pub fn open_single(address: UsbAddress) -> Result<BusGateway> {
        let bridge = FtdiBridge::open(address)?;
        Ok(BusGateway {
            endpoints: [Some(Endpoint::new(bridge)), None],
            dual_enabled: false,
        })
    }

    pub fn open_dual(address1: UsbAddress, address2: UsbAddress) -> Result<BusGateway> {
        let bridge1 = FtdiBridge::open(address1)?;
        let bridge2 = FtdiBridge::open(address2)?;
        Ok(BusGateway {
            endpoints: [Some(Endpoint::new(bridge1)), Some(Endpoint::new(bridge2))],
            dual_enabled: true,
        })
    }

    #[cfg(test)]
    fn with_bridges(bridges: Vec<FtdiBridge>, dual_enabled: bool) -> BusGateway {
        let mut iter = bridges.into_iter();
        let first = iter.next().map(Endpoint::new);
        let second = iter.next().map(Endpoint::new);
        BusGateway {
            endpoints: [first, second],
            dual_enabled,
        }
    }

    /// Endpoint selection: tuner 2 only gets its own endpoint in dual mode;
    /// otherwise everything shares endpoint 1.
    fn endpoint(&self, tuner: TunerId) -> Result<&Endpoint> {
        let index = if self.dual_enabled && tuner == TunerId::Tuner2 {
            1
        } else {
            0
        };
        self.endpoints[index].as_ref().ok_or(Error::BadDevice)
    }

    fn locked(&self, tuner: TunerId) -> Result<(&FtdiBridge, MutexGuard<'_, ControlState>)> {
        let endpoint = self.endpoint(tuner)?;
        Ok((&endpoint.bridge, endpoint.control.lock().unwrap()))
    }

    /// Begin a transactional sequence of demodulator accesses on one
    /// endpoint.
    pub fn session(&self, tuner: TunerId) -> Result<BusSession<'_>> {
        let (bridge, control) = self.locked(tuner)?;
        Ok(BusSession { bridge, control })
    }

    pub fn demod_read(&self, tuner: TunerId, reg: u16) -> Result<u8> {
        let (bridge, mut control) = self.locked(tuner)?;
        let result = demod_read_locked(bridge, &mut control, reg);
        if result.is_err() {
            error!("demod read 0x{:04x} failed", reg);
        }
        result
    }

    pub fn demod_write(&self, tuner: TunerId, reg: u16, val: u8) -> Result<()> {
        let (bridge, mut control) = self.locked(tuner)?;
        let result = demod_write_locked(bridge, &mut control, reg, val);
        if result.is_err() {
            error!("demod write 0x{:04x} = 0x{:02x} failed", reg, val);
        }
        result
    }

    pub fn tuner_read(&self, tuner: TunerId, reg: u8) -> Result<u8> {
        let (bridge, mut control) = self.locked(tuner)?;
        set_repeater(bridge, &mut control, true)?;
        let result = bridge.i2c_read_reg8(NIM_TUNER_ADDR, reg);
        if result.is_err() {
            error!("tuner read 0x{:02x} failed", reg);
        }
        result
    }

    pub fn tuner_write(&self, tuner: TunerId, reg: u8, val: u8) -> Result<()> {
        let (bridge, mut control) = self.locked(tuner)?;
        set_repeater(bridge, &mut control, true)?;
        let result = bridge.i2c_write_reg8(NIM_TUNER_ADDR, reg, val);
        if result.is_err() {
            error!("tuner write 0x{:02x} = 0x{:02x} failed", reg, val);
        }
        result
    }

    pub fn lna_read(&self, tuner: TunerId, lna_addr: u8, reg: u8) -> Result<u8> {
        let (bridge, mut control) = self.locked(tuner)?;
        set_repeater(bridge, &mut control, true)?;
        bridge.i2c_read_reg8(lna_addr, reg)
    }

    pub fn lna_write(&self, tuner: TunerId, lna_addr: u8, reg: u8, val: u8) -> Result<()> {
        let (bridge, mut control) = self.locked(tuner)?;
        set_repeater(bridge, &mut control, true)?;
        bridge.i2c_write_reg8(lna_addr, reg, val)
    }

    /// Bulk TS read. This rides the endpoint's FIFO channel, which has
    /// exactly one reader, so it deliberately takes no lock: a blocking TS
    /// read must never stall control traffic. Raw FTDI framing is
    /// preserved; the TS reader strips it.
    pub fn ts_read(&self, tuner: TunerId, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.endpoint(tuner)?.bridge.ts_read(buf, timeout)
    }

    /// Drive the LNB supply lines. These share the MPSSE command channel
    /// with I2C, so the control mutex applies.
    pub fn set_polarisation_supply(&self, tuner: TunerId, enable: bool, horizontal: bool) -> Result<()> {
        let (bridge, _control) = self.locked(tuner)?;
        bridge.set_polarisation_supply(enable, horizontal)
    }

    /// Forget the cached repeater state (after a NIM power cycle or full
    /// register init the silicon is back at its reset default).
    pub fn reset_repeater_cache(&self, tuner: TunerId) -> Result<()> {
        let (_bridge, mut control) = self.locked(tuner)?;
        control.repeater_on = false;
        Ok(())
    }
}
