// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! STVVGLNA low-noise amplifier driver. The NIM carries at most one LNA per
//! F-connector and either may be unpopulated; absence is detected by the
//! missing I2C acknowledge and is not an error.

use crate::device::{BusGateway, NIM_LNA_BOTTOM_ADDR, NIM_LNA_TOP_ADDR};
use crate::error::Result;
use crate::TunerId;
use log::{debug, info};
use std::sync::Arc;

const REG_STATUS: u8 = 0x00; /* AGC state, VGO readback */
const REG_CTRL0: u8 = 0x01; /* gain mode, VGO setpoint */
const REG_CTRL1: u8 = 0x02; /* AGC trigger, gain readback */
const REG_CTRL2: u8 = 0x03; /* power control */

const CTRL1_GETAGC: u8 = 0x01;
const CTRL2_POWERDOWN: u8 = 0x01;

const AGC_POLLS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LnaInput {
    Top,
    Bottom,
}

impl LnaInput {
    fn addr(self) -> u8 {
        match self {
            LnaInput::Top => NIM_LNA_TOP_ADDR,
            LnaInput::Bottom => NIM_LNA_BOTTOM_ADDR,
        }
    }
}

pub struct Stvvglna {
    gateway: Arc<BusGateway>,
    tuner: TunerId,
}

impl Stvvglna {
    pub fn new(gateway: Arc<BusGateway>, tuner: TunerId) -> Stvvglna {
        Stvvglna { gateway, tuner }
    }

    /// Bring one LNA up (AGC mode) or power it down. Returns whether the
    /// part is present; an unpopulated footprint simply never acks.
    pub fn init(&self, input: LnaInput, enable: bool) -> Result<bool> {
        let addr = input.addr();
        if self.gateway.lna_read(self.tuner, addr, REG_STATUS).is_err() {
            info!("LNA {:?} not fitted", input);
            return Ok(false);
        }

        if enable {
            /* automatic gain, wake the RF stages */
            self.gateway.lna_write(self.tuner, addr, REG_CTRL2, 0x00)?;
            self.gateway.lna_write(self.tuner, addr, REG_CTRL0, 0x80)?;
            info!("LNA {:?} enabled", input);
        } else {
            self.gateway
                .lna_write(self.tuner, addr, REG_CTRL2, CTRL2_POWERDOWN)?;
            info!("LNA {:?} powered down", input);
        }
        Ok(true)
    }

    /// Sample the AGC: trigger a measurement, wait for the trigger bit to
    /// self-clear, then read the gain step and VGO level.
    pub fn read_agc(&self, input: LnaInput) -> Result<(u8, u8)> {
        let addr = input.addr();
        self.gateway
            .lna_write(self.tuner, addr, REG_CTRL1, CTRL1_GETAGC)?;
        for _ in 0..AGC_POLLS {
            if self.gateway.lna_read(self.tuner, addr, REG_CTRL1)? & CTRL1_GETAGC == 0 {
                break;
            }
        }
        let gain = (self.gateway.lna_read(self.tuner, addr, REG_CTRL1)? >> 5) & 0x03;
        let vgo = self.gateway.lna_read(self.tuner, addr, REG_STATUS)? & 0x1f;
        debug!("LNA {:?} gain={} vgo={}", input, gain, vgo);
        Ok((gain, vgo))
    }
}

/// Telemetry packing used on the status surface: gain in the high bits, VGO
/// in the low five.
pub fn pack_lna_gain(gain: u8, vgo: u8) -> u16 {
    ((gain as u16) << 5) | (vgo & 0x1f) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lna_gain_packing() {
        assert_eq!(pack_lna_gain(0, 0), 0);
        assert_eq!(pack_lna_gain(3, 0x1f), (3 << 5) | 0x1f);
        // VGO is clamped to its five bits.
        assert_eq!(pack_lna_gain(1, 0xff), (1 << 5) | 0x1f);
    }
}
