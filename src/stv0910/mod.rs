// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! STV0910 dual demodulator driver. Each acquisition task owns one instance
//! bound to its tuner; the instance keeps a private shadow of the register
//! file so bit-field writes are read-modify-write against the shadow, never
//! a bus read. Volatile status registers are always read live.

pub mod regs;

use crate::device::BusGateway;
use crate::error::{Error, Result};
use crate::TunerId;
use log::{debug, info, warn};
use regs::{off, path_reg, Field};
use std::sync::Arc;

/// Master clock after PLL setup, Hz.
pub const MCLK_HZ: u32 = 135_000_000;
/// NIM crystal, Hz.
pub const XTAL_HZ: u32 = 30_000_000;
/// PLL lock poll bound.
pub const PLL_LOCK_TIMEOUT: u32 = 100;

/// DMDISTATE codes.
const DMDISTATE_STOP: u8 = 0x1c;
const DMDISTATE_BLIND_BEST_GUESS: u8 = 0x15;

/// The two demodulator halves. Tuner 1 is wired to TOP, tuner 2 to BOTTOM;
/// this binding is fixed by the NIM routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodHalf {
    Top,
    Bottom,
}

impl From<TunerId> for DemodHalf {
    fn from(tuner: TunerId) -> DemodHalf {
        match tuner {
            TunerId::Tuner1 => DemodHalf::Top,
            TunerId::Tuner2 => DemodHalf::Bottom,
        }
    }
}

/// Silicon HEADER_MODE codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Hunting = 0,
    FoundHeader = 1,
    DvbS2 = 2,
    DvbS = 3,
}

impl HeaderMode {
    pub fn from_code(code: u8) -> Result<HeaderMode> {
        match code {
            0 => Ok(HeaderMode::Hunting),
            1 => Ok(HeaderMode::FoundHeader),
            2 => Ok(HeaderMode::DvbS2),
            3 => Ok(HeaderMode::DvbS),
            other => Err(Error::BadDemodHuntState(other)),
        }
    }
}

/* Viterbi puncture rate codes, n meaning rate n/(n+1) */
const PUNCTURE_1_2: u8 = 0x0d;
const PUNCTURE_2_3: u8 = 0x12;
const PUNCTURE_3_4: u8 = 0x15;
const PUNCTURE_5_6: u8 = 0x18;
const PUNCTURE_6_7: u8 = 0x19;
const PUNCTURE_7_8: u8 = 0x1a;

pub(crate) fn puncture_rate_from(code: u8) -> Result<u8> {
    match code {
        PUNCTURE_1_2 => Ok(1),
        PUNCTURE_2_3 => Ok(2),
        PUNCTURE_3_4 => Ok(3),
        PUNCTURE_5_6 => Ok(5),
        PUNCTURE_6_7 => Ok(6),
        PUNCTURE_7_8 => Ok(7),
        other => Err(Error::ViterbiPunctureRate(other)),
    }
}

/// Charge pump setting for a given PLL NDIV, per the synthesiser table.
pub(crate) fn charge_pump_for(ndiv: u32) -> u8 {
    match ndiv {
        0..=5 => 0,
        6 => 1,
        7..=8 => 3,
        9..=12 => 5,
        13..=16 => 6,
        17..=24 => 7,
        25..=32 => 8,
        33..=48 => 9,
        49..=64 => 10,
        65..=96 => 11,
        97..=128 => 12,
        129..=192 => 13,
        193..=256 => 14,
        _ => 15,
    }
}

/// SFRINIT word: symbol rate in kS/s normalised to the 135MHz master clock,
/// `sr * 2^16 / 135000`.
pub(crate) fn timing_sfr_init(sr_ksps: u32) -> u16 {
    ((sr_ksps << 16) / 135 / 1000) as u16
}

/// Symmetric CFRUP/CFRLOW magnitude for a carrier half-window of
/// `halfscan_sr` kS/s.
pub(crate) fn carrier_search_limit(halfscan_sr_ksps: u32) -> i64 {
    halfscan_sr_ksps as i64 * 65536 / 135_000
}

/// Decode the 24-bit signed carrier offset into Hz. The three bytes are
/// assembled, shifted up 8 to sign-extend, and scaled by mclk / 2^32.
pub(crate) fn decode_carrier_offset(high: u8, mid: u8, low: u8) -> i32 {
    let raw =
        (((high as u32) << 16) + ((mid as u32) << 8) + (low as u32)) << 8;
    let signed = raw as i32;
    (MCLK_HZ as f64 * signed as f64 / 4294967296.0) as i32
}

/// Decode the 32-bit symbol-rate word into symbols per second.
pub(crate) fn decode_symbol_rate(b3: u8, b2: u8, b1: u8, b0: u8) -> u32 {
    let raw = ((b3 as u64) << 24) + ((b2 as u64) << 16) + ((b1 as u64) << 8) + (b0 as u64);
    (MCLK_HZ as f64 * raw as f64 / 4294967296.0) as u32
}

pub struct Stv0910 {
    gateway: Arc<BusGateway>,
    tuner: TunerId,
    shadow: Box<[u8]>,
}

impl Stv0910 {
    pub fn new(gateway: Arc<BusGateway>, tuner: TunerId) -> Stv0910 {
        Stv0910 {
            gateway,
            tuner,
            shadow: vec![0u8; regs::SHADOW_LEN].into_boxed_slice(),
        }
    }

    fn shadow_index(reg: u16) -> usize {
        (reg - regs::SHADOW_START) as usize
    }

    fn write_reg(&mut self, reg: u16, val: u8) -> Result<()> {
        self.shadow[Self::shadow_index(reg)] = val;
        self.gateway.demod_write(self.tuner, reg, val)
    }

    fn read_reg(&self, reg: u16) -> Result<u8> {
        self.gateway.demod_read(self.tuner, reg)
    }

    /// Bit-field write: read the shadow, mask the field in, write device and
    /// shadow together.
    fn write_field(&mut self, field: Field, val: u8) -> Result<()> {
        let index = Self::shadow_index(field.reg);
        let merged = (self.shadow[index] & !field.mask) | ((val << field.shift) & field.mask);
        self.shadow[index] = merged;
        self.gateway.demod_write(self.tuner, field.reg, merged)
    }

    /// Bit-field read, always live: status registers are volatile and must
    /// never be served from the shadow.
    fn read_field(&self, field: Field) -> Result<u8> {
        let val = self.read_reg(field.reg)?;
        Ok((val & field.mask) >> field.shift)
    }

    /// Full boot sequence: identity check, register table, LDPC decoder
    /// reset pulse, scratch write/readback.
    pub fn init_registers(&mut self) -> Result<()> {
        info!("STV0910 init registers");

        let mid = self.read_reg(regs::REG_MID)?;
        let did = self.read_reg(regs::REG_DID)?;
        debug!("STV0910 MID = 0x{:02x}, DID = 0x{:02x}", mid, did);
        if mid != regs::CHIP_MID || did != regs::CHIP_DID {
            return Err(Error::BadChipId(mid, did));
        }

        for &(reg, val) in regs::BOOT_SEQUENCE {
            self.write_reg(reg, val)?;
        }
        // The boot table wrote both I2CRPT registers directly.
        self.gateway.reset_repeater_cache(self.tuner)?;

        /* LDPC decoder reset pulse */
        self.write_reg(regs::REG_TSTRES0, 0x80)?;
        self.write_reg(regs::REG_TSTRES0, 0x00)?;

        /* scratch write/readback proves the register file is reachable */
        self.write_reg(regs::REG_SCRATCH, regs::SCRATCH_PATTERN)?;
        if self.read_reg(regs::REG_SCRATCH)? != regs::SCRATCH_PATTERN {
            return Err(Error::NimInit);
        }
        Ok(())
    }

    /// Program the PLL for the 135MHz master clock and wait for lock.
    pub fn setup_clocks(&mut self) -> Result<()> {
        info!("STV0910 set MCLK");

        /* ODF forced to 4, otherwise the digital and analog clocks
         * desynchronise and the computed symbol rate is wrong. IDF 1 is the
         * optimal value. */
        let odf = 4u32;
        let idf = 1u32;
        self.write_field(regs::F_ODF, odf as u8)?;
        self.write_field(regs::F_IDF, idf as u8)?;

        let f_xtal_mhz = XTAL_HZ / 1_000_000;
        let f_phi_mhz = MCLK_HZ / 1_000_000;
        let ndiv = (f_phi_mhz * odf * idf) / f_xtal_mhz;
        self.write_field(regs::F_NDIV, ndiv as u8)?;
        self.write_field(regs::F_CP, charge_pump_for(ndiv))?;

        /* lift standby, derive clocks from the PLL */
        self.write_field(regs::F_STANDBY, 0)?;
        self.write_field(regs::F_BYPASSPLLCORE, 0)?;

        let mut timeout = 0;
        loop {
            if self.read_field(regs::F_PLLLOCK)? != 0 {
                break;
            }
            timeout += 1;
            if timeout == PLL_LOCK_TIMEOUT {
                return Err(Error::PllTimeout);
            }
        }
        Ok(())
    }

    /// Park both demodulator state machines before reprogramming.
    pub fn stop_both(&mut self) -> Result<()> {
        self.write_reg(path_reg(DemodHalf::Top, off::DMDISTATE), DMDISTATE_STOP)?;
        self.write_reg(path_reg(DemodHalf::Bottom, off::DMDISTATE), DMDISTATE_STOP)
    }

    pub fn setup_timing_loop(&mut self, half: DemodHalf, sr_ksps: u32) -> Result<()> {
        debug!("setup timing loop {:?} sr={} kS/s", half, sr_ksps);
        let sfr = timing_sfr_init(sr_ksps);
        self.write_reg(path_reg(half, off::SFRINIT1), (sfr >> 8) as u8)?;
        self.write_reg(path_reg(half, off::SFRINIT0), (sfr & 0xff) as u8)
    }

    /// Symmetric carrier search window of +/- halfscan_sr, starting at zero
    /// offset.
    pub fn setup_carrier_loop(&mut self, half: DemodHalf, halfscan_sr_ksps: u32) -> Result<()> {
        debug!("setup carrier loop {:?} halfscan={} kS/s", half, halfscan_sr_ksps);
        self.write_reg(path_reg(half, off::CFRINIT0), 0)?;
        self.write_reg(path_reg(half, off::CFRINIT1), 0)?;

        let limit = carrier_search_limit(halfscan_sr_ksps);
        self.write_reg(path_reg(half, off::CFRUP0), (limit & 0xff) as u8)?;
        self.write_reg(path_reg(half, off::CFRUP1), ((limit >> 8) & 0xff) as u8)?;
        let low = -limit;
        self.write_reg(path_reg(half, off::CFRLOW0), (low & 0xff) as u8)?;
        self.write_reg(path_reg(half, off::CFRLOW1), ((low >> 8) & 0xff) as u8)
    }

    /// Kick off the blind scan with the best-guess start code.
    pub fn start_scan(&mut self, half: DemodHalf) -> Result<()> {
        info!("STV0910 start scan {:?}", half);
        self.write_reg(path_reg(half, off::DMDISTATE), DMDISTATE_BLIND_BEST_GUESS)
    }

    /// Single-tuner bring-up: boot, clocks, then per-half loops for every
    /// half with a non-zero symbol rate.
    pub fn init(&mut self, sr1_ksps: u32, sr2_ksps: u32, halfscan_ratio: f32) -> Result<()> {
        info!("STV0910 init");
        self.stop_both()?;
        self.init_registers()?;
        self.setup_clocks()?;

        if sr1_ksps != 0 {
            let halfscan = (sr1_ksps as f32 * halfscan_ratio) as u32;
            self.setup_carrier_loop(DemodHalf::Top, halfscan)?;
            self.setup_timing_loop(DemodHalf::Top, sr1_ksps)?;
        }
        if sr2_ksps != 0 {
            let halfscan = (sr2_ksps as f32 * halfscan_ratio) as u32;
            self.setup_carrier_loop(DemodHalf::Bottom, halfscan)?;
            self.setup_timing_loop(DemodHalf::Bottom, sr2_ksps)?;
        }
        Ok(())
    }

    /// Dual-tuner bring-up: boot and clocks as usual, then the TOP half's
    /// loops strictly before the BOTTOM half's, all in one bus transaction,
    /// and finally both scans released. The caller fires the init barrier
    /// after this returns.
    pub fn init_dual_sequence(
        &mut self,
        sr1_ksps: u32,
        sr2_ksps: u32,
        halfscan_ratio: f32,
    ) -> Result<()> {
        info!("STV0910 dual init, TOP first (sr1={} sr2={} kS/s)", sr1_ksps, sr2_ksps);
        self.stop_both()?;
        self.init_registers()?;
        self.setup_clocks()?;

        let mut batch: Vec<(u16, u8)> = Vec::new();
        for (half, sr) in [(DemodHalf::Top, sr1_ksps), (DemodHalf::Bottom, sr2_ksps)] {
            if sr == 0 {
                warn!("dual init with zero symbol rate on {:?}", half);
                continue;
            }
            let halfscan = (sr as f32 * halfscan_ratio) as u32;
            let limit = carrier_search_limit(halfscan);
            batch.push((path_reg(half, off::CFRINIT0), 0));
            batch.push((path_reg(half, off::CFRINIT1), 0));
            batch.push((path_reg(half, off::CFRUP0), (limit & 0xff) as u8));
            batch.push((path_reg(half, off::CFRUP1), ((limit >> 8) & 0xff) as u8));
            batch.push((path_reg(half, off::CFRLOW0), ((-limit) & 0xff) as u8));
            batch.push((path_reg(half, off::CFRLOW1), (((-limit) >> 8) & 0xff) as u8));
            let sfr = timing_sfr_init(sr);
            batch.push((path_reg(half, off::SFRINIT1), (sfr >> 8) as u8));
            batch.push((path_reg(half, off::SFRINIT0), (sfr & 0xff) as u8));
        }
        batch.push((path_reg(DemodHalf::Top, off::DMDISTATE), DMDISTATE_BLIND_BEST_GUESS));
        batch.push((path_reg(DemodHalf::Bottom, off::DMDISTATE), DMDISTATE_BLIND_BEST_GUESS));

        let mut session = self.gateway.session(self.tuner)?;
        for &(reg, val) in &batch {
            session.demod_write(reg, val)?;
        }
        drop(session);
        for (reg, val) in batch {
            self.shadow[Self::shadow_index(reg)] = val;
        }
        Ok(())
    }

    /* ---- telemetry reads ---- */

    pub fn read_scan_state(&self, half: DemodHalf) -> Result<HeaderMode> {
        let code = self.read_field(regs::f_header_mode(half))?;
        HeaderMode::from_code(code)
    }

    pub fn read_car_freq(&self, half: DemodHalf) -> Result<i32> {
        let high = self.read_reg(path_reg(half, off::CFR2))?;
        let mid = self.read_reg(path_reg(half, off::CFR1))?;
        let low = self.read_reg(path_reg(half, off::CFR0))?;
        Ok(decode_carrier_offset(high, mid, low))
    }

    pub fn read_sr(&self, half: DemodHalf) -> Result<u32> {
        let b3 = self.read_reg(path_reg(half, off::SFR3))?;
        let b2 = self.read_reg(path_reg(half, off::SFR2))?;
        let b1 = self.read_reg(path_reg(half, off::SFR1))?;
        let b0 = self.read_reg(path_reg(half, off::SFR0))?;
        Ok(decode_symbol_rate(b3, b2, b1, b0))
    }

    pub fn read_constellation(&self, half: DemodHalf) -> Result<(i8, i8)> {
        let i = self.read_reg(path_reg(half, off::ISYMB))?;
        let q = self.read_reg(path_reg(half, off::QSYMB))?;
        Ok((i as i8, q as i8))
    }

    pub fn read_agc1_gain(&self, half: DemodHalf) -> Result<u16> {
        let low = self.read_reg(path_reg(half, off::AGCIQIN0))?;
        let high = self.read_reg(path_reg(half, off::AGCIQIN1))?;
        Ok(((high as u16) << 8) | low as u16)
    }

    pub fn read_agc2_gain(&self, half: DemodHalf) -> Result<u16> {
        let low = self.read_reg(path_reg(half, off::AGC2I0))?;
        let high = self.read_reg(path_reg(half, off::AGC2I1))?;
        Ok(((high as u16) << 8) | low as u16)
    }

    pub fn read_power(&self, half: DemodHalf) -> Result<(u8, u8)> {
        let i = self.read_reg(path_reg(half, off::POWERI))?;
        let q = self.read_reg(path_reg(half, off::POWERQ))?;
        Ok((i, q))
    }

    pub fn read_puncture_rate(&self, half: DemodHalf) -> Result<u8> {
        let code = self.read_field(regs::f_vit_curpun(half))?;
        puncture_rate_from(code)
    }

    /// Viterbi error rate in hundredths of a percent: VERROR counts errors
    /// per 4096 bits.
    pub fn read_err_rate(&self, half: DemodHalf) -> Result<u32> {
        let val = self.read_reg(path_reg(half, off::VERROR))?;
        Ok(((val as u32 * 100_000 / 4096) + 5) / 10)
    }

    /// BER from the FEC byte and error-bit counters. Reading FBERCPT4
    /// latches the counter bank.
    pub fn read_ber(&self, half: DemodHalf) -> Result<u32> {
        let mut bytes = 0u64;
        for offset in [off::FBERCPT4, off::FBERCPT3, off::FBERCPT2, off::FBERCPT1, off::FBERCPT0] {
            bytes = (bytes << 8) | self.read_reg(path_reg(half, offset))? as u64;
        }
        let mut errs = 0u64;
        for offset in [off::FBERERR2, off::FBERERR1, off::FBERERR0] {
            errs = (errs << 8) | self.read_reg(path_reg(half, offset))? as u64;
        }
        if bytes == 0 {
            return Ok(0);
        }
        Ok((10_000.0 * errs as f64 / (bytes as f64 * 8.0)) as u32)
    }

    /// MER in tenths of a dB, signed 10-bit. When the noise estimator has no
    /// valid sample yet, re-arm it and report zero.
    pub fn read_mer(&mut self, half: DemodHalf) -> Result<i32> {
        let high = self.read_reg(path_reg(half, off::NOSRAMPOS))?;
        let low = self.read_reg(path_reg(half, off::NOSRAMVAL))?;

        if (high >> 2) & 0x01 == 1 {
            let magnitude = (((high & 0x01) as i32) << 8) | low as i32;
            if (high >> 1) & 0x01 == 1 {
                Ok(magnitude - 512)
            } else {
                Ok(magnitude)
            }
        } else {
            self.write_field(regs::f_nosram_activation(half), 0x02)?;
            Ok(0)
        }
    }

    pub fn read_errors_bch_uncorrected(&self) -> Result<bool> {
        // The uncorrected flag is chip-wide, not per half.
        Ok(self.read_field(regs::F_ERRORFLAG)? == 0)
    }

    pub fn read_errors_bch_count(&self) -> Result<u32> {
        Ok(self.read_field(regs::F_BCH_ERRORS_COUNTER)? as u32)
    }

    pub fn read_errors_ldpc_count(&self) -> Result<u32> {
        let high = self.read_field(regs::F_LDPC_ERRORS1)?;
        let low = self.read_field(regs::F_LDPC_ERRORS0)?;
        Ok(((high as u32) << 8) | low as u32)
    }

    /// MODCOD index, short-frame and pilot flags, and rolloff code. Short
    /// frames and pilots are only meaningful in DVB-S2.
    pub fn read_modcod_and_type(&self, half: DemodHalf) -> Result<(u32, bool, bool, u8)> {
        let val = self.read_reg(path_reg(half, off::DMDMODCOD))?;
        let modcod = ((val & 0x7c) >> 2) as u32;
        let short_frame = (val & 0x02) != 0;
        let pilots = (val & 0x01) != 0;
        let rolloff = self.read_field(regs::f_rolloff_status(half))?;
        Ok((modcod, short_frame, pilots, rolloff))
    }

    pub fn read_matype(&self, half: DemodHalf) -> Result<(u32, u32)> {
        let matype1 = self.read_reg(path_reg(half, off::MATSTR1))?;
        let matype2 = self.read_reg(path_reg(half, off::MATSTR0))?;
        Ok((matype1 as u32, matype2 as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_offset_decode_is_bit_exact() {
        // Zero offset.
        assert_eq!(decode_carrier_offset(0, 0, 0), 0);
        // Small positive: raw 0x000100 -> (0x000100 << 8) = 0x00010000,
        // 135e6 * 65536 / 2^32 = 2059.9... truncated.
        assert_eq!(decode_carrier_offset(0x00, 0x01, 0x00), 2059);
        // Negative: 0xffffff sign-extends to -256 after the shift,
        // 135e6 * -256 / 2^32 = -8.04 -> -8.
        assert_eq!(decode_carrier_offset(0xff, 0xff, 0xff), -8);
        // Most negative 24-bit value.
        let most_negative = decode_carrier_offset(0x80, 0x00, 0x00);
        assert_eq!(most_negative, -(MCLK_HZ as i64 / 2) as i32);
    }

    #[test]
    fn carrier_offset_round_trips() {
        for raw in [0u32, 1, 0x1234, 0x7fffff, 0x800000, 0xfffffe] {
            let hz = decode_carrier_offset((raw >> 16) as u8, (raw >> 8) as u8, raw as u8);
            // Re-encode: hz = mclk * (raw<<8 as i32) / 2^32.
            let signed = ((raw << 8) as i32) as f64;
            let expect = (MCLK_HZ as f64 * signed / 4294967296.0) as i32;
            assert_eq!(hz, expect);
        }
    }

    #[test]
    fn symbol_rate_decode_matches_programmed_rate() {
        for sr_hz in [33_000u32, 1_500_000, 27_500_000] {
            let raw = (sr_hz as u64 * 4294967296u64 / MCLK_HZ as u64) as u32;
            let decoded = decode_symbol_rate(
                (raw >> 24) as u8,
                (raw >> 16) as u8,
                (raw >> 8) as u8,
                raw as u8,
            );
            assert!(
                (decoded as i64 - sr_hz as i64).abs() <= 1,
                "sr {} decoded as {}",
                sr_hz,
                decoded
            );
        }
    }

    #[test]
    fn sfr_init_normalises_to_master_clock() {
        // 27500 kS/s at 135MHz: (27500 << 16) / 135 / 1000 = 13349.
        assert_eq!(timing_sfr_init(27_500), 13349);
        assert_eq!(timing_sfr_init(1_500), 728);
        assert_eq!(timing_sfr_init(33), 16);
    }

    #[test]
    fn carrier_limits_are_symmetric() {
        let limit = carrier_search_limit(2250);
        assert_eq!(limit, 2250 * 65536 / 135_000);
        assert!(limit > 0);
    }

    #[test]
    fn puncture_codes() {
        assert_eq!(puncture_rate_from(0x0d).unwrap(), 1);
        assert_eq!(puncture_rate_from(0x15).unwrap(), 3);
        assert_eq!(puncture_rate_from(0x1a).unwrap(), 7);
        assert!(matches!(
            puncture_rate_from(0x00),
            Err(Error::ViterbiPunctureRate(0x00))
        ));
    }

    #[test]
    fn charge_pump_table_boundaries() {
        assert_eq!(charge_pump_for(5), 0);
        assert_eq!(charge_pump_for(18), 7); // 135MHz from a 30MHz crystal
        assert_eq!(charge_pump_for(256), 14);
        assert_eq!(charge_pump_for(400), 15);
    }

    #[test]
    fn header_mode_codes() {
        assert_eq!(HeaderMode::from_code(0).unwrap(), HeaderMode::Hunting);
        assert_eq!(HeaderMode::from_code(2).unwrap(), HeaderMode::DvbS2);
        assert!(matches!(
            HeaderMode::from_code(4),
            Err(Error::BadDemodHuntState(4))
        ));
    }
}
