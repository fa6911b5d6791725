// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! STV0910 register map. The chip has a global block at 0xf1xx plus two
//! demodulator paths: P2 ("TOP", 0xf2xx) and P1 ("BOTTOM", 0xf4xx) with
//! identical per-path layouts. Only the registers the control plane touches
//! are named here.

use super::DemodHalf;

/* identity */
pub const REG_MID: u16 = 0xf100;
pub const REG_DID: u16 = 0xf101;
pub const CHIP_MID: u8 = 0x51;
pub const CHIP_DID: u8 = 0x20;

/* global block */
pub const REG_DACR1: u16 = 0xf113;
pub const REG_DACR2: u16 = 0xf114;
pub const REG_PADCFG: u16 = 0xf11a;
pub const REG_OUTCFG2: u16 = 0xf11b;
pub const REG_OUTCFG: u16 = 0xf11c;
pub const REG_IRQSTATUS3: u16 = 0xf120;
pub const REG_IRQSTATUS2: u16 = 0xf121;
pub const REG_IRQSTATUS1: u16 = 0xf122;
pub const REG_IRQSTATUS0: u16 = 0xf123;
pub const REG_IRQMASK3: u16 = 0xf124;
pub const REG_IRQMASK2: u16 = 0xf125;
pub const REG_IRQMASK1: u16 = 0xf126;
pub const REG_IRQMASK0: u16 = 0xf127;
pub const REG_I2CCFG: u16 = 0xf129;
pub const REG_P1_I2CRPT: u16 = 0xf12a;
pub const REG_P2_I2CRPT: u16 = 0xf12b;
pub const REG_GPIO0CFG: u16 = 0xf140;
pub const REG_GPIO1CFG: u16 = 0xf141;
pub const REG_GPIO2CFG: u16 = 0xf142;
pub const REG_GPIO3CFG: u16 = 0xf143;
pub const REG_STRSTATUS1: u16 = 0xf16a;
pub const REG_STRSTATUS2: u16 = 0xf16b;
pub const REG_STRSTATUS3: u16 = 0xf16c;
pub const REG_NCOARSE: u16 = 0xf1b3;
pub const REG_NCOARSE1: u16 = 0xf1b4;
pub const REG_NCOARSE2: u16 = 0xf1b5;
pub const REG_SYNTCTRL: u16 = 0xf1b6;
pub const REG_FILTCTRL: u16 = 0xf1b7;
pub const REG_PLLSTAT: u16 = 0xf1b8;
pub const REG_STOPCLK1: u16 = 0xf1c2;
pub const REG_STOPCLK2: u16 = 0xf1c3;
pub const REG_PREGCTL: u16 = 0xf1c8;
pub const REG_TSTTNR0: u16 = 0xf1df;
pub const REG_TSTTNR1: u16 = 0xf1e0;
pub const REG_TSTTNR2: u16 = 0xf1e1;
pub const REG_TSTTNR3: u16 = 0xf1e2;
pub const REG_TSGENERAL: u16 = 0xf630;
/* FEC status shared by both paths */
pub const REG_LDPCERR1: u16 = 0xf67c;
pub const REG_LDPCERR0: u16 = 0xf67d;
pub const REG_BCHERR: u16 = 0xf67e;
/* test block */
pub const REG_TSTRES0: u16 = 0xff11;
pub const REG_TSTTSRS: u16 = 0xff6d;

/* scratch register with alternating bits used for the bus check */
pub const REG_SCRATCH: u16 = 0xf536;
pub const SCRATCH_PATTERN: u8 = 0xaa;

/* shadow image covers everything we ever write */
pub const SHADOW_START: u16 = 0xf100;
pub const SHADOW_END: u16 = 0xffff;
pub const SHADOW_LEN: usize = (SHADOW_END - SHADOW_START + 1) as usize;

/* per-path register offsets; add to the path base */
pub mod off {
    pub const IQCONST: u16 = 0x00;
    pub const NOSCFG: u16 = 0x01;
    pub const ISYMB: u16 = 0x02;
    pub const QSYMB: u16 = 0x03;
    pub const AGC1CFG: u16 = 0x04;
    pub const AGC1CN: u16 = 0x06;
    pub const AGC1REF: u16 = 0x07;
    pub const AGCIQIN1: u16 = 0x09;
    pub const AGCIQIN0: u16 = 0x0a;
    pub const DEMOD: u16 = 0x10;
    pub const DMDMODCOD: u16 = 0x11;
    pub const DMDCFGMD: u16 = 0x14;
    pub const DMDCFG2: u16 = 0x15;
    pub const DMDISTATE: u16 = 0x16;
    pub const DMDT0M: u16 = 0x17;
    pub const DMDSTATE: u16 = 0x1b;
    pub const DMDCFG3: u16 = 0x1e;
    pub const DMDCFG4: u16 = 0x1f;
    pub const AGC2I1: u16 = 0x36;
    pub const AGC2I0: u16 = 0x37;
    pub const CARCFG: u16 = 0x38;
    pub const CARFREQ: u16 = 0x39;
    pub const CFRUP1: u16 = 0x3e;
    pub const CFRUP0: u16 = 0x3f;
    pub const CFRLOW1: u16 = 0x42;
    pub const CFRLOW0: u16 = 0x43;
    pub const CFRINIT1: u16 = 0x44;
    pub const CFRINIT0: u16 = 0x45;
    pub const CFR2: u16 = 0x48;
    pub const CFR1: u16 = 0x49;
    pub const CFR0: u16 = 0x4a;
    pub const TMGCFG: u16 = 0x50;
    pub const RTC: u16 = 0x51;
    pub const RTCS2: u16 = 0x52;
    pub const SFRINIT1: u16 = 0x5e;
    pub const SFRINIT0: u16 = 0x5f;
    pub const SFR3: u16 = 0x64;
    pub const SFR2: u16 = 0x65;
    pub const SFR1: u16 = 0x66;
    pub const SFR0: u16 = 0x67;
    pub const TMGOBS: u16 = 0x6d;
    pub const POWERI: u16 = 0x8e;
    pub const POWERQ: u16 = 0x8f;
    pub const ACLC: u16 = 0xa1;
    pub const BCLC: u16 = 0xa2;
    pub const NOSRAMCFG: u16 = 0xb8;
    pub const NOSRAMPOS: u16 = 0xb9;
    pub const NOSRAMVAL: u16 = 0xba;
    pub const DISTXCFG: u16 = 0xb0;
    pub const TSSTATEM: u16 = 0xc0;
    pub const TSSTATEL: u16 = 0xc1;
    pub const TSCFGH: u16 = 0xc2;
    pub const VITCURPUN: u16 = 0xd8;
    pub const VERROR: u16 = 0xd9;
    pub const FBERCPT4: u16 = 0xe0;
    pub const FBERCPT3: u16 = 0xe1;
    pub const FBERCPT2: u16 = 0xe2;
    pub const FBERCPT1: u16 = 0xe3;
    pub const FBERCPT0: u16 = 0xe4;
    pub const FBERERR2: u16 = 0xe5;
    pub const FBERERR1: u16 = 0xe6;
    pub const FBERERR0: u16 = 0xe7;
    pub const MATSTR1: u16 = 0xf3;
    pub const MATSTR0: u16 = 0xf4;
}

pub const P2_BASE: u16 = 0xf200;
pub const P1_BASE: u16 = 0xf400;

/// Address of a per-path register for the given demodulator half.
pub fn path_reg(half: DemodHalf, offset: u16) -> u16 {
    match half {
        DemodHalf::Top => P2_BASE + offset,
        DemodHalf::Bottom => P1_BASE + offset,
    }
}

/// A bit field within one register, for shadowed read-modify-write.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub reg: u16,
    pub mask: u8,
    pub shift: u8,
}

/* global PLL fields */
pub const F_CP: Field = Field { reg: REG_NCOARSE, mask: 0xf8, shift: 3 };
pub const F_IDF: Field = Field { reg: REG_NCOARSE, mask: 0x07, shift: 0 };
pub const F_NDIV: Field = Field { reg: REG_NCOARSE1, mask: 0xff, shift: 0 };
pub const F_ODF: Field = Field { reg: REG_NCOARSE2, mask: 0x3f, shift: 0 };
pub const F_STANDBY: Field = Field { reg: REG_SYNTCTRL, mask: 0x80, shift: 7 };
pub const F_BYPASSPLLCORE: Field = Field { reg: REG_SYNTCTRL, mask: 0x40, shift: 6 };
pub const F_PLLLOCK: Field = Field { reg: REG_PLLSTAT, mask: 0x01, shift: 0 };

/* shared FEC status fields */
pub const F_ERRORFLAG: Field = Field { reg: REG_BCHERR, mask: 0x10, shift: 4 };
pub const F_BCH_ERRORS_COUNTER: Field = Field { reg: REG_BCHERR, mask: 0x0f, shift: 0 };
pub const F_LDPC_ERRORS1: Field = Field { reg: REG_LDPCERR1, mask: 0xff, shift: 0 };
pub const F_LDPC_ERRORS0: Field = Field { reg: REG_LDPCERR0, mask: 0xff, shift: 0 };

/* per-path fields */
pub fn f_header_mode(half: DemodHalf) -> Field {
    Field { reg: path_reg(half, off::DMDSTATE), mask: 0x60, shift: 5 }
}

pub fn f_vit_curpun(half: DemodHalf) -> Field {
    Field { reg: path_reg(half, off::VITCURPUN), mask: 0x1f, shift: 0 }
}

pub fn f_rolloff_status(half: DemodHalf) -> Field {
    Field { reg: path_reg(half, off::TMGOBS), mask: 0xc0, shift: 6 }
}

pub fn f_nosram_activation(half: DemodHalf) -> Field {
    Field { reg: path_reg(half, off::NOSRAMCFG), mask: 0x03, shift: 0 }
}

/// Boot register sequence, written in order by `init_registers`. The last
/// entry is the terminator the loop in the C-era tables keyed on; keeping it
/// last preserves the write ordering the silicon wants (clock tree before
/// path config, TS block last).
pub const BOOT_SEQUENCE: &[(u16, u8)] = &[
    (REG_DACR1, 0x00),
    (REG_DACR2, 0x00),
    (REG_PADCFG, 0x05),
    (REG_OUTCFG2, 0x00),
    (REG_OUTCFG, 0x00),
    (REG_IRQSTATUS3, 0x00),
    (REG_IRQSTATUS2, 0x00),
    (REG_IRQSTATUS1, 0x00),
    (REG_IRQSTATUS0, 0x00),
    (REG_IRQMASK3, 0x00),
    (REG_IRQMASK2, 0x00),
    (REG_IRQMASK1, 0x00),
    (REG_IRQMASK0, 0x00),
    (REG_I2CCFG, 0x88),
    (REG_P1_I2CRPT, 0x38),
    (REG_P2_I2CRPT, 0x38),
    (REG_GPIO0CFG, 0x82),
    (REG_GPIO1CFG, 0x82),
    (REG_GPIO2CFG, 0x82),
    (REG_GPIO3CFG, 0x82),
    (REG_STRSTATUS1, 0x60),
    (REG_STRSTATUS2, 0x71),
    (REG_STRSTATUS3, 0x82),
    (REG_NCOARSE, 0x39),
    (REG_NCOARSE1, 0x12),
    (REG_NCOARSE2, 0x04),
    (REG_SYNTCTRL, 0xc2),
    (REG_FILTCTRL, 0x01),
    (REG_PLLSTAT, 0x07),
    (REG_STOPCLK1, 0x00),
    (REG_STOPCLK2, 0x00),
    (REG_PREGCTL, 0x00),
    (REG_TSTTNR0, 0x00),
    (REG_TSTTNR1, 0x46),
    (REG_TSTTNR2, 0x4b),
    (REG_TSTTNR3, 0x46),
    /* P2 (TOP) path */
    (P2_BASE + off::IQCONST, 0x00),
    (P2_BASE + off::NOSCFG, 0x34),
    (P2_BASE + off::ISYMB, 0x0e),
    (P2_BASE + off::QSYMB, 0xfc),
    (P2_BASE + off::AGC1CFG, 0x54),
    (P2_BASE + off::AGC1CN, 0x99),
    (P2_BASE + off::AGC1REF, 0x58),
    (P2_BASE + off::DEMOD, 0x00),
    (P2_BASE + off::DMDMODCOD, 0x10),
    (P2_BASE + off::DMDCFGMD, 0xc9),
    (P2_BASE + off::DMDCFG2, 0x3b),
    (P2_BASE + off::DMDISTATE, 0x5c),
    (P2_BASE + off::DMDT0M, 0x40),
    (P2_BASE + off::DMDCFG3, 0x08),
    (P2_BASE + off::DMDCFG4, 0x04),
    (P2_BASE + off::CARCFG, 0x46),
    (P2_BASE + off::ACLC, 0x2b),
    (P2_BASE + off::BCLC, 0x1a),
    (P2_BASE + off::TMGCFG, 0xd3),
    (P2_BASE + off::RTC, 0x68),
    (P2_BASE + off::RTCS2, 0x68),
    (P2_BASE + off::TSSTATEM, 0xf0),
    (P2_BASE + off::TSSTATEL, 0x12),
    (P2_BASE + off::TSCFGH, 0x80),
    (P2_BASE + off::DISTXCFG, 0x02),
    /* P1 (BOTTOM) path */
    (P1_BASE + off::IQCONST, 0x00),
    (P1_BASE + off::NOSCFG, 0x34),
    (P1_BASE + off::ISYMB, 0x0e),
    (P1_BASE + off::QSYMB, 0xf7),
    (P1_BASE + off::AGC1CFG, 0x54),
    (P1_BASE + off::AGC1CN, 0x99),
    (P1_BASE + off::AGC1REF, 0x58),
    (P1_BASE + off::DEMOD, 0x00),
    (P1_BASE + off::DMDMODCOD, 0x10),
    (P1_BASE + off::DMDCFGMD, 0xc9),
    (P1_BASE + off::DMDCFG2, 0x3b),
    (P1_BASE + off::DMDISTATE, 0x5c),
    (P1_BASE + off::DMDT0M, 0x40),
    (P1_BASE + off::DMDCFG3, 0x08),
    (P1_BASE + off::DMDCFG4, 0x04),
    (P1_BASE + off::CARCFG, 0x46),
    (P1_BASE + off::ACLC, 0x2b),
    (P1_BASE + off::BCLC, 0x1a),
    (P1_BASE + off::TMGCFG, 0xd3),
    (P1_BASE + off::RTC, 0x68),
    (P1_BASE + off::RTCS2, 0x68),
    (P1_BASE + off::TSSTATEM, 0xf0),
    (P1_BASE + off::TSSTATEL, 0x12),
    (P1_BASE + off::TSCFGH, 0x80),
    (P1_BASE + off::DISTXCFG, 0x02),
    (REG_TSGENERAL, 0x00),
    (REG_TSTTSRS, 0x00),
];
