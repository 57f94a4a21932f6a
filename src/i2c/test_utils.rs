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

use crate::error::{self, ErrorKind};
use crate::i2c::{self, Address};

use async_trait::async_trait;
use std::collections::HashMap;

/// Register, Value
pub struct InitReg(pub u8, pub u8);

/// FakeI2cBus is I2C bus backed by an array
#[derive(Clone)]
pub struct FakeI2cBus {
    /// Which I2C address to respond on
    respond_addr: Address,
    /// Memory backing the register space
    /// If `None`, reading/writing this register will cause error.
    data: [Option<u8>; 256],
    /// Word registers (PMBus commands are not overlapping byte registers)
    words: HashMap<u8, u16>,
    /// Block registers, payload without the length byte
    blocks: HashMap<u8, Vec<u8>>,
    /// What to return on addresses other than `respond_addr`
    /// If `None`, reading/writing other addresses will cause error.
    other_addr_response: Option<u8>,
}

impl FakeI2cBus {
    /// Constructs fake bus.
    ///
    /// * `respond_addr` - which I2C address to respond on
    /// * array of `(reg,val)` pairs to populate the array backing the bus
    /// * `other_addr_response` - what to return when empty address is read
    pub fn new(
        respond_addr: Address,
        data: &[InitReg],
        default_value: Option<u8>,
        other_addr_response: Option<u8>,
    ) -> Self {
        let mut bus = Self {
            respond_addr,
            data: [default_value; 256],
            words: HashMap::new(),
            blocks: HashMap::new(),
            other_addr_response,
        };
        for InitReg(register, value) in data.iter() {
            bus.data[*register as usize] = Some(*value);
        }
        bus
    }

    pub fn with_word(mut self, reg: u8, value: u16) -> Self {
        self.words.insert(reg, value);
        self
    }

    pub fn with_block(mut self, reg: u8, payload: &[u8]) -> Self {
        self.blocks.insert(reg, payload.to_vec());
        self
    }

    fn check_addr(&self, addr: Address) -> error::Result<()> {
        if addr != self.respond_addr {
            Err(ErrorKind::I2c(format!(
                "Nothing present on I2C address {}!",
                addr
            )))?
        }
        Ok(())
    }
}

#[async_trait]
impl i2c::AsyncBus for FakeI2cBus {
    /// Read register from device on I2C bus
    /// if `addr` doesn't match `respond_addr`, return default read byte or error
    /// if `reg` isn't enabled on device, return error
    async fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8> {
        if addr != self.respond_addr {
            if let Some(val) = self.other_addr_response {
                return Ok(val);
            } else {
                Err(ErrorKind::I2c(format!(
                    "Nothing present on I2C address {}!",
                    addr
                )))?
            }
        } else {
            let reg = reg as usize;
            if let Some(val) = self.data[reg] {
                Ok(val)
            } else {
                Err(ErrorKind::I2c(format!(
                    "Register {:#x} is not accessible!",
                    reg
                )))?
            }
        }
    }

    /// Write register to device on I2C bus
    async fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()> {
        // Try read the register first - if it's not accessible, this will create the error
        self.read(addr, reg).await?;

        // Seems that address is accessible, so write to it if it's not default response
        if addr == self.respond_addr {
            self.data[reg as usize] = Some(val);
        }
        Ok(())
    }

    async fn read_word(&mut self, addr: Address, reg: u8) -> error::Result<[u8; 2]> {
        self.check_addr(addr)?;
        match self.words.get(&reg) {
            Some(word) => Ok(word.to_le_bytes()),
            None => Err(ErrorKind::I2c(format!(
                "Word register {:#x} is not accessible!",
                reg
            )))?,
        }
    }

    async fn read_block(&mut self, addr: Address, reg: u8) -> error::Result<Vec<u8>> {
        self.check_addr(addr)?;
        match self.blocks.get(&reg) {
            Some(payload) => i2c::check_block_len(payload.clone()),
            None => Err(ErrorKind::I2c(format!(
                "Block register {:#x} is not accessible!",
                reg
            )))?,
        }
    }
}
