// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mock version of the FTDI bridge for gateway tests.

use crate::device::ftdi::UsbAddress;
use crate::error::Result;
use mockall::mock;

use std::time::Duration;

mock! {
    #[derive(Debug)]
    pub FtdiBridge {
        pub fn open(address: UsbAddress) -> Result<Self>;
        pub fn nim_reset(&self) -> Result<()>;
        pub fn set_polarisation_supply(&self, enable: bool, horizontal: bool) -> Result<()>;
        pub fn i2c_read_reg8(&self, addr: u8, reg: u8) -> Result<u8>;
        pub fn i2c_write_reg8(&self, addr: u8, reg: u8, val: u8) -> Result<()>;
        pub fn i2c_read_reg16(&self, addr: u8, reg: u16) -> Result<u8>;
        pub fn i2c_write_reg16(&self, addr: u8, reg: u16, val: u8) -> Result<()>;
        pub fn ts_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    }
}
