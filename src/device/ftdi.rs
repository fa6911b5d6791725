// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FT2232H bridge: interface A runs MPSSE bit-banged I2C plus the GPIO lines
//! (NIM reset, LNB supply), interface B is the TS FIFO read over bulk.

use crate::error::{Error, Result};
use log::{debug, info};
use rusb::{Context, DeviceHandle, UsbContext};
use std::time::Duration;

const FTDI_VID: u16 = 0x0403;
const FTDI_PID: u16 = 0x6010;

const INTERFACE_I2C: u8 = 0;
const INTERFACE_TS: u8 = 1;

const EP_I2C_OUT: u8 = 0x02;
const EP_I2C_IN: u8 = 0x81;
const EP_TS_IN: u8 = 0x83;

const CTRL_OUT: u8 = 0x40;
const SIO_RESET: u8 = 0x00;
const SIO_SET_LATENCY: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0b;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;
const BITMODE_RESET: u16 = 0x0000;
const BITMODE_MPSSE: u16 = 0x0200;

const CTRL_TIMEOUT: Duration = Duration::from_millis(500);
const I2C_TIMEOUT: Duration = Duration::from_millis(500);

/* MPSSE opcodes */
const MPSSE_WRITE_BYTES_NVE: u8 = 0x11;
const MPSSE_WRITE_BITS_NVE: u8 = 0x13;
const MPSSE_READ_BYTES_PVE: u8 = 0x20;
const MPSSE_READ_BITS_PVE: u8 = 0x22;
const MPSSE_SET_LOW: u8 = 0x80;
const MPSSE_SET_HIGH: u8 = 0x82;
const MPSSE_LOOPBACK_OFF: u8 = 0x85;
const MPSSE_SET_DIVISOR: u8 = 0x86;
const MPSSE_SEND_IMMEDIATE: u8 = 0x87;
const MPSSE_DISABLE_DIV5: u8 = 0x8a;
const MPSSE_ENABLE_3PHASE: u8 = 0x8c;
const MPSSE_DISABLE_ADAPTIVE: u8 = 0x97;

/* Low GPIO byte: bit0 SCL, bit1 SDA out, bit2 SDA in */
const PIN_SCL: u8 = 0x01;
const PIN_SDA_OUT: u8 = 0x02;
const DIR_I2C_ACTIVE: u8 = PIN_SCL | PIN_SDA_OUT;
const DIR_I2C_SDA_RELEASED: u8 = PIN_SCL;

/* High GPIO byte: LNB supply module and NIM reset */
const PIN_LNB_ENABLE: u8 = 0x01;
const PIN_LNB_HORIZONTAL: u8 = 0x02;
const PIN_NIM_RESET: u8 = 0x10;
const DIR_HIGH_GPIO: u8 = PIN_LNB_ENABLE | PIN_LNB_HORIZONTAL | PIN_NIM_RESET;

/// How to pick the FT2232H on the bus: first device found, or a specific
/// USB bus/address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbAddress {
    Any,
    /// Skip the first `n` matching devices (second board in auto-detect).
    Nth(usize),
    BusAddr(u8, u8),
}

#[derive(Debug)]
pub struct FtdiBridge {
    handle_i2c: DeviceHandle<Context>,
    handle_ts: DeviceHandle<Context>,
}

impl FtdiBridge {
    pub fn open(address: UsbAddress) -> Result<FtdiBridge> {
        let context = Context::new()?;
        let devices = context.devices()?;
        let mut matched = 0usize;
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != FTDI_VID || desc.product_id() != FTDI_PID {
                continue;
            }
            let found = match address {
                UsbAddress::Any => true,
                UsbAddress::Nth(n) => {
                    let take = matched == n;
                    matched += 1;
                    take
                }
                UsbAddress::BusAddr(bus, addr) => {
                    device.bus_number() == bus && device.address() == addr
                }
            };
            if !found {
                continue;
            }
            info!(
                "FTDI device found on bus {} address {}",
                device.bus_number(),
                device.address()
            );
            let handle_i2c = device.open()?;
            let handle_ts = device.open()?;
            let mut bridge = FtdiBridge {
                handle_i2c,
                handle_ts,
            };
            bridge.setup()?;
            return Ok(bridge);
        }
        Err(Error::BadDevice)
    }

    fn setup(&mut self) -> Result<()> {
        self.handle_i2c.claim_interface(INTERFACE_I2C)?;
        self.handle_ts.claim_interface(INTERFACE_TS)?;

        /* Interface A: reset, short latency, MPSSE mode */
        self.sio(&self.handle_i2c, SIO_RESET, 0, INTERFACE_I2C)?;
        self.sio(&self.handle_i2c, SIO_SET_LATENCY, 2, INTERFACE_I2C)?;
        self.sio(&self.handle_i2c, SIO_SET_BITMODE, BITMODE_RESET, INTERFACE_I2C)?;
        self.sio(&self.handle_i2c, SIO_SET_BITMODE, BITMODE_MPSSE, INTERFACE_I2C)?;
        self.sio(&self.handle_i2c, SIO_RESET, SIO_RESET_PURGE_RX, INTERFACE_I2C)?;
        self.sio(&self.handle_i2c, SIO_RESET, SIO_RESET_PURGE_TX, INTERFACE_I2C)?;

        /* MPSSE clock: 60MHz/((1+divisor)*2) with /5 off; divisor 0x012b
         * gives the standard 100kHz I2C rate with 3-phase clocking. */
        self.mpsse_write(&[
            MPSSE_DISABLE_DIV5,
            MPSSE_DISABLE_ADAPTIVE,
            MPSSE_ENABLE_3PHASE,
            MPSSE_SET_DIVISOR,
            0x2b,
            0x01,
            MPSSE_LOOPBACK_OFF,
            MPSSE_SET_LOW,
            PIN_SCL | PIN_SDA_OUT,
            DIR_I2C_ACTIVE,
            MPSSE_SET_HIGH,
            PIN_NIM_RESET,
            DIR_HIGH_GPIO,
        ])?;

        /* Interface B: plain FIFO for the TS endpoint */
        self.sio(&self.handle_ts, SIO_RESET, 0, INTERFACE_TS)?;
        self.sio(&self.handle_ts, SIO_SET_LATENCY, 2, INTERFACE_TS)?;
        self.sio(&self.handle_ts, SIO_SET_BITMODE, BITMODE_RESET, INTERFACE_TS)?;
        self.sio(&self.handle_ts, SIO_RESET, SIO_RESET_PURGE_RX, INTERFACE_TS)?;

        self.nim_reset()?;
        Ok(())
    }

    fn sio(&self, handle: &DeviceHandle<Context>, request: u8, value: u16, iface: u8) -> Result<()> {
        handle.write_control(CTRL_OUT, request, value, (iface + 1) as u16, &[], CTRL_TIMEOUT)?;
        Ok(())
    }

    fn mpsse_write(&self, commands: &[u8]) -> Result<()> {
        self.handle_i2c.write_bulk(EP_I2C_OUT, commands, I2C_TIMEOUT)?;
        Ok(())
    }

    /// Read exactly `len` payload bytes from interface A, skipping the 2-byte
    /// modem status that prefixes every read.
    fn mpsse_read(&self, len: usize) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; len + 2];
        let mut out = Vec::with_capacity(len);
        let mut attempts = 0;
        while out.len() < len {
            let n = self.handle_i2c.read_bulk(EP_I2C_IN, &mut raw, I2C_TIMEOUT)?;
            if n > 2 {
                out.extend_from_slice(&raw[2..n]);
            } else {
                attempts += 1;
                if attempts > 50 {
                    return Err(Error::Usb(rusb::Error::Timeout));
                }
            }
        }
        out.truncate(len);
        Ok(out)
    }

    /// Pulse the NIM hardware reset line.
    pub fn nim_reset(&self) -> Result<()> {
        debug!("NIM reset pulse");
        self.mpsse_write(&[MPSSE_SET_HIGH, 0x00, DIR_HIGH_GPIO])?;
        std::thread::sleep(Duration::from_millis(10));
        self.mpsse_write(&[MPSSE_SET_HIGH, PIN_NIM_RESET, DIR_HIGH_GPIO])?;
        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    /// Drive the LNB supply module: enable plus 13V/18V select.
    pub fn set_polarisation_supply(&self, enable: bool, horizontal: bool) -> Result<()> {
        let mut value = PIN_NIM_RESET;
        if enable {
            value |= PIN_LNB_ENABLE;
        }
        if horizontal {
            value |= PIN_LNB_HORIZONTAL;
        }
        self.mpsse_write(&[MPSSE_SET_HIGH, value, DIR_HIGH_GPIO])
    }

    /* ---- raw I2C sequencing ---- */

    fn i2c_start(&self) -> Result<()> {
        let mut cmd = Vec::with_capacity(36);
        for states in [PIN_SCL | PIN_SDA_OUT, PIN_SCL, 0x00] {
            for _ in 0..4 {
                cmd.extend_from_slice(&[MPSSE_SET_LOW, states, DIR_I2C_ACTIVE]);
            }
        }
        self.mpsse_write(&cmd)
    }

    fn i2c_stop(&self) -> Result<()> {
        let mut cmd = Vec::with_capacity(36);
        for states in [0x00, PIN_SCL, PIN_SCL | PIN_SDA_OUT] {
            for _ in 0..4 {
                cmd.extend_from_slice(&[MPSSE_SET_LOW, states, DIR_I2C_ACTIVE]);
            }
        }
        self.mpsse_write(&cmd)
    }

    /// Clock one byte out and sample the acknowledge bit.
    fn i2c_write_byte(&self, byte: u8) -> Result<bool> {
        self.mpsse_write(&[
            MPSSE_WRITE_BYTES_NVE,
            0x00,
            0x00,
            byte,
            /* release SDA and clock the ack bit in */
            MPSSE_SET_LOW,
            0x00,
            DIR_I2C_SDA_RELEASED,
            MPSSE_READ_BITS_PVE,
            0x00,
            MPSSE_SEND_IMMEDIATE,
        ])?;
        let ack = self.mpsse_read(1)?;
        /* reclaim SDA */
        self.mpsse_write(&[MPSSE_SET_LOW, 0x00, DIR_I2C_ACTIVE])?;
        Ok(ack[0] & 0x01 == 0)
    }

    /// Clock one byte in and send ack (or nack on the final byte).
    fn i2c_read_byte(&self, ack: bool) -> Result<u8> {
        self.mpsse_write(&[
            MPSSE_SET_LOW,
            0x00,
            DIR_I2C_SDA_RELEASED,
            MPSSE_READ_BYTES_PVE,
            0x00,
            0x00,
            MPSSE_SET_LOW,
            0x00,
            DIR_I2C_ACTIVE,
            MPSSE_WRITE_BITS_NVE,
            0x00,
            if ack { 0x00 } else { 0xff },
            MPSSE_SEND_IMMEDIATE,
        ])?;
        let data = self.mpsse_read(1)?;
        Ok(data[0])
    }

    fn i2c_transfer(&self, addr: u8, write: &[u8], read: Option<&mut [u8]>) -> Result<()> {
        self.i2c_start()?;
        let mut acked = self.i2c_write_byte(addr & !0x01)?;
        for byte in write {
            if !acked {
                break;
            }
            acked = self.i2c_write_byte(*byte)?;
        }
        if let Some(buf) = read {
            if acked {
                /* repeated start, address with read bit */
                self.i2c_start()?;
                acked = self.i2c_write_byte(addr | 0x01)?;
                if acked {
                    let last = buf.len() - 1;
                    for (i, slot) in buf.iter_mut().enumerate() {
                        *slot = self.i2c_read_byte(i != last)?;
                    }
                }
            }
        }
        self.i2c_stop()?;
        if acked {
            Ok(())
        } else {
            Err(Error::Usb(rusb::Error::Io))
        }
    }

    /* ---- register-level operations used by the bus gateway ---- */

    pub fn i2c_read_reg8(&self, addr: u8, reg: u8) -> Result<u8> {
        let mut data = [0u8; 1];
        self.i2c_transfer(addr, &[reg], Some(&mut data))?;
        Ok(data[0])
    }

    pub fn i2c_write_reg8(&self, addr: u8, reg: u8, val: u8) -> Result<()> {
        self.i2c_transfer(addr, &[reg, val], None)
    }

    pub fn i2c_read_reg16(&self, addr: u8, reg: u16) -> Result<u8> {
        let mut data = [0u8; 1];
        self.i2c_transfer(addr, &[(reg >> 8) as u8, reg as u8], Some(&mut data))?;
        Ok(data[0])
    }

    pub fn i2c_write_reg16(&self, addr: u8, reg: u16, val: u8) -> Result<()> {
        self.i2c_transfer(addr, &[(reg >> 8) as u8, reg as u8, val], None)
    }

    /// Bulk TS read from interface B. Returns raw FTDI framing: every 512
    /// bytes of USB packet starts with 2 bytes of modem status.
    pub fn ts_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.handle_ts.read_bulk(EP_TS_IN, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(Error::Usb(e)),
        }
    }
}
