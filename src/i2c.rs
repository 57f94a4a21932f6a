// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Purpose of this module: I2C bus interface definition - AsyncBus and AsyncDevice
//!
//! Besides plain register access the bus speaks the two SMBus transactions the power
//! regulators need: word reads (two bytes, low byte first) and block reads (the device
//! reports a length byte and then streams that many bytes).

#[cfg(test)]
pub mod test_utils;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use futures::lock::Mutex;

use crate::error::{self, ErrorKind};

/// Longest payload an SMBus block read may carry
pub const MAX_BLOCK_LEN: usize = 32;

/// Struct representing I2C address
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Address(u8);

impl Address {
    /// Build I2C address from 7-bit device address
    pub const fn new(address: u8) -> Self {
        Self(address & 0x7f)
    }

    /// 7-bit address as passed to the Linux I2C driver
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Validate payload of an SMBus block read. The slave reported length must be
/// between 1 and `MAX_BLOCK_LEN`.
pub fn check_block_len(payload: Vec<u8>) -> error::Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_BLOCK_LEN {
        Err(ErrorKind::I2c(format!(
            "block read reported invalid length {}",
            payload.len()
        )))?
    }
    Ok(payload)
}

/// `AsyncBus` represents ops on async I2C bus
#[async_trait]
pub trait AsyncBus
where
    Self: Sync + Send,
{
    async fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8>;

    async fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()>;

    /// SMBus read word, wire order is low byte first
    async fn read_word(&mut self, addr: Address, reg: u8) -> error::Result<[u8; 2]>;

    /// SMBus block read, returns only the payload
    async fn read_block(&mut self, addr: Address, reg: u8) -> error::Result<Vec<u8>>;
}

/// We can make any bus shared by wrapping it in a lock
#[derive(Clone)]
pub struct SharedBus<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> SharedBus<T>
where
    T: AsyncBus,
{
    pub fn new(bus: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }
}

#[async_trait]
impl<T> AsyncBus for SharedBus<T>
where
    T: AsyncBus,
{
    async fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8> {
        let mut bus = self.inner.lock().await;
        bus.read(addr, reg).await
    }

    async fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()> {
        let mut bus = self.inner.lock().await;
        bus.write(addr, reg, val).await
    }

    async fn read_word(&mut self, addr: Address, reg: u8) -> error::Result<[u8; 2]> {
        let mut bus = self.inner.lock().await;
        bus.read_word(addr, reg).await
    }

    async fn read_block(&mut self, addr: Address, reg: u8) -> error::Result<Vec<u8>> {
        let mut bus = self.inner.lock().await;
        bus.read_block(addr, reg).await
    }
}

/// `AsyncDevice` represents (async) ops on a device on I2C bus
#[async_trait]
pub trait AsyncDevice
where
    Self: Sync + Send,
{
    /// Read register
    async fn read(&mut self, reg: u8) -> error::Result<u8>;

    /// Write register
    async fn write(&mut self, reg: u8, val: u8) -> error::Result<()>;

    /// Read 16-bit register as transferred on the wire (low byte first)
    async fn read_word(&mut self, reg: u8) -> error::Result<[u8; 2]>;

    /// Read a length-prefixed block
    async fn read_block(&mut self, reg: u8) -> error::Result<Vec<u8>>;
}

/// We can make a `Device` by tying together some kind of bus (T) and I2C address
#[derive(Clone)]
pub struct Device<T> {
    bus: T,
    address: Address,
}

impl<T> Device<T> {
    pub fn new(bus: T, address: Address) -> Self {
        Self { bus, address }
    }
}

/// We can implement async ops on `Device` just by passing down the operation
/// to I2C bus together with I2C address.
#[async_trait]
impl<T> AsyncDevice for Device<T>
where
    T: Clone + AsyncBus,
{
    async fn read(&mut self, reg: u8) -> error::Result<u8> {
        self.bus.read(self.address, reg).await
    }

    async fn write(&mut self, reg: u8, val: u8) -> error::Result<()> {
        self.bus.write(self.address, reg, val).await
    }

    async fn read_word(&mut self, reg: u8) -> error::Result<[u8; 2]> {
        self.bus.read_word(self.address, reg).await
    }

    async fn read_block(&mut self, reg: u8) -> error::Result<Vec<u8>> {
        self.bus.read_block(self.address, reg).await
    }
}
