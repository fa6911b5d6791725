// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use mockall::predicate::eq;
use mockall::Sequence;

use crate::device::mock_ftdi::MockFtdiBridge;
use crate::device::{
    BusGateway, DEMOD_REG_I2CRPT, NIM_DEMOD_ADDR, NIM_LNA_TOP_ADDR, NIM_TUNER_ADDR,
};
use crate::error::Error;
use crate::TunerId;

#[test]
fn tuner_access_opens_repeater_once() {
    let mut bridge = MockFtdiBridge::new();
    let mut seq = Sequence::new();

    // First tuner access must raise the repeater bit before touching the
    // tuner address.
    bridge
        .expect_i2c_write_reg16()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_DEMOD_ADDR), eq(DEMOD_REG_I2CRPT), eq(0xb8))
        .returning(|_, _, _| Ok(()));
    bridge
        .expect_i2c_write_reg8()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_TUNER_ADDR), eq(0x02), eq(0x11))
        .returning(|_, _, _| Ok(()));
    // Second access sees the cached repeater state: no further 0xf12a write.
    bridge
        .expect_i2c_read_reg8()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_TUNER_ADDR), eq(0x02))
        .returning(|_, _| Ok(0x11));

    let gateway = BusGateway::with_bridges(vec![bridge], false);
    gateway.tuner_write(TunerId::Tuner1, 0x02, 0x11).unwrap();
    assert_eq!(gateway.tuner_read(TunerId::Tuner1, 0x02).unwrap(), 0x11);
}

#[test]
fn demod_write_closes_repeater_first() {
    let mut bridge = MockFtdiBridge::new();
    let mut seq = Sequence::new();

    bridge
        .expect_i2c_write_reg16()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_DEMOD_ADDR), eq(DEMOD_REG_I2CRPT), eq(0xb8))
        .returning(|_, _, _| Ok(()));
    bridge
        .expect_i2c_read_reg8()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_LNA_TOP_ADDR), eq(0x00))
        .returning(|_, _| Ok(0x20));
    bridge
        .expect_i2c_write_reg16()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_DEMOD_ADDR), eq(DEMOD_REG_I2CRPT), eq(0x38))
        .returning(|_, _, _| Ok(()));
    bridge
        .expect_i2c_write_reg16()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_DEMOD_ADDR), eq(0xf536), eq(0xaa))
        .returning(|_, _, _| Ok(()));

    let gateway = BusGateway::with_bridges(vec![bridge], false);
    gateway.lna_read(TunerId::Tuner1, NIM_LNA_TOP_ADDR, 0x00).unwrap();
    gateway.demod_write(TunerId::Tuner1, 0xf536, 0xaa).unwrap();
}

#[test]
fn repeater_register_write_is_exempt() {
    let mut bridge = MockFtdiBridge::new();

    // A direct write to the repeater register itself must not spawn an extra
    // repeater-off transaction.
    bridge
        .expect_i2c_write_reg16()
        .times(2)
        .with(eq(NIM_DEMOD_ADDR), eq(DEMOD_REG_I2CRPT), mockall::predicate::always())
        .returning(|_, _, _| Ok(()));
    bridge
        .expect_i2c_write_reg8()
        .times(1)
        .returning(|_, _, _| Ok(()));

    let gateway = BusGateway::with_bridges(vec![bridge], false);
    gateway.tuner_write(TunerId::Tuner1, 0x00, 0x00).unwrap(); // repeater on
    gateway
        .demod_write(TunerId::Tuner1, DEMOD_REG_I2CRPT, 0x38)
        .unwrap(); // exactly one more 0xf12a write
}

#[test]
fn single_mode_maps_tuner2_to_endpoint_one() {
    let mut bridge = MockFtdiBridge::new();
    bridge
        .expect_i2c_read_reg16()
        .times(1)
        .with(eq(NIM_DEMOD_ADDR), eq(0xf100))
        .returning(|_, _| Ok(0x51));

    let gateway = BusGateway::with_bridges(vec![bridge], false);
    assert_eq!(gateway.demod_read(TunerId::Tuner2, 0xf100).unwrap(), 0x51);
}

#[test]
fn dual_mode_missing_endpoint_is_bad_device() {
    let bridge = MockFtdiBridge::new();
    let gateway = BusGateway::with_bridges(vec![bridge], true);
    match gateway.demod_read(TunerId::Tuner2, 0xf100) {
        Err(Error::BadDevice) => {}
        other => panic!("expected BadDevice, got {:?}", other),
    }
}

#[test]
fn session_holds_discipline_across_batch() {
    let mut bridge = MockFtdiBridge::new();
    let mut seq = Sequence::new();

    bridge
        .expect_i2c_write_reg16()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_DEMOD_ADDR), eq(0xf416), eq(0x1c))
        .returning(|_, _, _| Ok(()));
    bridge
        .expect_i2c_write_reg16()
        .times(1)
        .in_sequence(&mut seq)
        .with(eq(NIM_DEMOD_ADDR), eq(0xf216), eq(0x1c))
        .returning(|_, _, _| Ok(()));

    let gateway = BusGateway::with_bridges(vec![bridge], false);
    let mut session = gateway.session(TunerId::Tuner1).unwrap();
    session.demod_write(0xf416, 0x1c).unwrap();
    session.demod_write(0xf216, 0x1c).unwrap();
}
