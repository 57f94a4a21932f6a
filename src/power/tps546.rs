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

//! Driver for the TPS546 digital core voltage regulator (PMBus over SMBus)

use crate::logging::macros::*;

use crate::error;
use crate::i2c::{self, Address};
use crate::pmbus::{self, slinear11, ulinear16};

/// 7-bit SMBus address of the regulator
pub const I2C_ADDRESS: Address = Address::new(0x24);

/// Length of the `IC_DEVICE_ID` block
pub const DEVICE_ID_LEN: usize = 6;

/// What the regulator reported during initialization
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub device_id: Vec<u8>,
    pub revision: u8,
    pub temperature: f32,
    pub vout_mode: u8,
    pub vout_command_mv: i32,
}

pub struct Tps546 {
    i2c_dev: Box<dyn i2c::AsyncDevice>,
}

impl Tps546 {
    pub fn new(i2c_dev: Box<dyn i2c::AsyncDevice>) -> Self {
        Self { i2c_dev }
    }

    /// Read identification and current state of the regulator. Any bus error is
    /// propagated, the caller treats it as fatal.
    pub async fn init(&mut self) -> error::Result<Identity> {
        info!("Initializing the core voltage regulator");

        let device_id = self.i2c_dev.read_block(pmbus::IC_DEVICE_ID).await?;
        if device_id.len() != DEVICE_ID_LEN {
            warn!(
                "TPS546: device ID is {} bytes long, expected {}",
                device_id.len(),
                DEVICE_ID_LEN
            );
        }
        info!("Device ID: {:02x?}", device_id);

        let revision = self.i2c_dev.read(pmbus::PMBUS_REVISION).await?;
        info!("PMBus revision: {:02x}", revision);

        let temperature = self.read_temperature().await?;
        info!("Temp: {:.1}", temperature);

        let vout_mode = self.i2c_dev.read(pmbus::VOUT_MODE).await?;
        let raw = pmbus::word_from_wire(self.i2c_dev.read_word(pmbus::VOUT_COMMAND).await?);
        let vout_command_mv = ulinear16::to_millivolts(raw, vout_mode);
        info!("Vout: {} mV", vout_command_mv);

        Ok(Identity {
            device_id,
            revision,
            temperature,
            vout_mode,
            vout_command_mv,
        })
    }

    /// Temperature in degrees Celsius
    pub async fn read_temperature(&mut self) -> error::Result<f32> {
        let raw = pmbus::word_from_wire(self.i2c_dev.read_word(pmbus::READ_TEMPERATURE_1).await?);
        trace!(
            "TPS546 temperature raw: {:04x} (mantissa, exponent) = {:?}",
            raw,
            slinear11::decode(raw)
        );
        Ok(slinear11::to_f32(raw))
    }

    /// Measured output voltage in millivolts
    pub async fn read_vout_mv(&mut self) -> error::Result<i32> {
        let vout_mode = self.i2c_dev.read(pmbus::VOUT_MODE).await?;
        let raw = pmbus::word_from_wire(self.i2c_dev.read_word(pmbus::READ_VOUT).await?);
        Ok(ulinear16::to_millivolts(raw, vout_mode))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::i2c::test_utils::{FakeI2cBus, InitReg};
    use approx::assert_relative_eq;

    fn make_regulator(bus: FakeI2cBus) -> Tps546 {
        Tps546::new(Box::new(i2c::Device::new(
            i2c::SharedBus::new(bus),
            I2C_ADDRESS,
        )))
    }

    fn populated_bus() -> FakeI2cBus {
        FakeI2cBus::new(
            I2C_ADDRESS,
            &[InitReg(pmbus::PMBUS_REVISION, 0x33), InitReg(pmbus::VOUT_MODE, 0x17)],
            None,
            None,
        )
        .with_block(pmbus::IC_DEVICE_ID, &[0x54, 0x49, 0x54, 0x6d, 0x24, 0x41])
        .with_word(pmbus::READ_TEMPERATURE_1, 0xe832)
        .with_word(pmbus::VOUT_COMMAND, 0x0266)
        .with_word(pmbus::READ_VOUT, 0x0264)
    }

    #[tokio::test]
    async fn test_tps546_init() {
        let mut regulator = make_regulator(populated_bus());
        let identity = regulator.init().await.expect("init failed");
        assert_eq!(identity.device_id, vec![0x54, 0x49, 0x54, 0x6d, 0x24, 0x41]);
        assert_eq!(identity.revision, 0x33);
        assert_relative_eq!(identity.temperature, 6.25);
        assert_eq!(identity.vout_mode, 0x17);
        assert_eq!(identity.vout_command_mv, 1199);

        assert_eq!(regulator.read_vout_mv().await.unwrap(), 1195);
    }

    #[tokio::test]
    async fn test_tps546_init_bus_error() {
        // regulator does not answer the revision query
        let bus = FakeI2cBus::new(I2C_ADDRESS, &[], None, None)
            .with_block(pmbus::IC_DEVICE_ID, &[0x54, 0x49, 0x54, 0x6d, 0x24, 0x41]);
        assert!(make_regulator(bus).init().await.is_err());

        // nothing on the address at all
        let bus = FakeI2cBus::new(Address::new(0x25), &[], None, None);
        assert!(make_regulator(bus).init().await.is_err());
    }
}
