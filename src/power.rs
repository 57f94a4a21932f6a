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

//! Core voltage regulation.
//!
//! Most boards regulate the core rail with a discrete buck converter whose feedback
//! node is trimmed by a DS4432U current DAC. Hex boards carry a TPS546 digital
//! regulator instead which is only initialized and monitored here.

pub mod tps546;

use crate::logging::macros::*;

use crate::context::DeviceModel;
use crate::error::{self, ErrorKind};
use crate::i2c::{self, Address};

use async_trait::async_trait;
use futures::lock::Mutex;

use std::fmt;
use std::path::{Path, PathBuf};

/// 7-bit address of the DS4432U current DAC
pub const DS4432U_ADDRESS: Address = Address::new(0x48);

/// Current code register of output 0, output 1 follows
pub const DS4432U_OUT0_REG: u8 = 0xf8;

/// DAC output wired to the core regulator feedback
pub const DS4432U_CORE_CHANNEL: u8 = 0;

/// Board calibration of the trim network
pub const VFB: f64 = 0.6;
pub const IFS: f64 = 0.000_098_921;
pub const RA: f64 = 4750.0;
pub const RB: f64 = 3320.0;
/// Output voltage with no current injected
pub const VNOM: f32 = 1.451;
pub const VMAX: f32 = 2.39;
pub const VMIN: f32 = 0.046;

/// Bit set in the current code when current is sourced (voltage below nominal)
pub const CODE_SOURCE_BIT: u8 = 0x80;
const CODE_MAGNITUDE_MASK: u8 = 0x7f;

/// Core voltage request as reported in the log
struct VoltageSetting {
    /// Requested voltage of one die
    die: f32,
    rail: f32,
    code: u8,
}

impl fmt::Display for VoltageSetting {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.3}V (rail {:.3}V) [{:#04x}]", self.die, self.rail, self.code)
    }
}

/// Current code the DAC needs to move the regulator output to `volts`.
///
/// Requests outside of `VMIN..=VMAX` yield 0 which leaves the output at nominal.
pub fn voltage_to_code(volts: f32) -> u8 {
    if !(volts >= VMIN && volts <= VMAX) {
        return 0;
    }
    let target = volts as f64;
    let magnitude = (((VFB / RB) - (target - VFB) / RA) / IFS * 127.0).abs() as f32;
    let magnitude = magnitude.ceil().min(CODE_MAGNITUDE_MASK as f32) as u8;
    if volts < VNOM {
        magnitude | CODE_SOURCE_BIT
    } else {
        magnitude
    }
}

/// DS4432U dual current DAC
pub struct Ds4432u {
    i2c_dev: Box<dyn i2c::AsyncDevice>,
}

impl Ds4432u {
    pub fn new(i2c_dev: Box<dyn i2c::AsyncDevice>) -> Self {
        Self { i2c_dev }
    }

    fn register(channel: u8) -> u8 {
        DS4432U_OUT0_REG + channel
    }

    pub async fn set_current_code(&mut self, channel: u8, code: u8) -> error::Result<()> {
        self.i2c_dev.write(Self::register(channel), code).await
    }

    pub async fn get_current_code(&mut self, channel: u8) -> error::Result<u8> {
        self.i2c_dev.read(Self::register(channel)).await
    }
}

/// Analog read-back of the core voltage
#[async_trait]
pub trait AdcSense: Send + Sync {
    async fn read_vcore_mv(&self) -> error::Result<u32>;
}

/// Board without core voltage sensing
pub struct NullAdc;

#[async_trait]
impl AdcSense for NullAdc {
    async fn read_vcore_mv(&self) -> error::Result<u32> {
        Ok(0)
    }
}

/// Linux IIO channel, `raw * scale` gives millivolts
pub struct IioAdc {
    raw_path: PathBuf,
    scale: f32,
}

impl IioAdc {
    pub fn new<P: AsRef<Path>>(raw_path: P, scale: f32) -> Self {
        Self {
            raw_path: raw_path.as_ref().to_path_buf(),
            scale,
        }
    }

    /// Use the channel scale published next to the raw value, if any
    pub async fn open<P: AsRef<Path>>(raw_path: P) -> Self {
        let raw_path = raw_path.as_ref();
        let scale_path = raw_path.with_file_name("in_voltage_scale");
        let scale = match tokio::fs::read_to_string(&scale_path).await {
            Ok(text) => text.trim().parse::<f32>().unwrap_or(1.0),
            Err(_) => 1.0,
        };
        debug!("ADC {} scale {}", raw_path.display(), scale);
        Self::new(raw_path, scale)
    }
}

#[async_trait]
impl AdcSense for IioAdc {
    async fn read_vcore_mv(&self) -> error::Result<u32> {
        let text = tokio::fs::read_to_string(&self.raw_path).await?;
        let raw = text.trim().parse::<u32>().map_err(|e| {
            ErrorKind::Power(format!(
                "invalid ADC value '{}' in {}: {}",
                text.trim(),
                self.raw_path.display(),
                e
            ))
        })?;
        Ok((raw as f32 * self.scale) as u32)
    }
}

/// How the core voltage is controlled
pub enum Strategy {
    DacTrim(Ds4432u),
    Digital(tps546::Tps546),
    /// Unknown board, nothing is driven
    Unavailable,
}

pub struct Regulator {
    strategy: Mutex<Strategy>,
    adc: Box<dyn AdcSense>,
    voltage_domain: u16,
}

impl Regulator {
    pub fn new(strategy: Strategy, adc: Box<dyn AdcSense>, voltage_domain: u16) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            adc,
            voltage_domain: voltage_domain.max(1),
        }
    }

    /// Pick the regulator fitted on given board
    pub fn for_device<T>(
        model: DeviceModel,
        bus: T,
        adc: Box<dyn AdcSense>,
        voltage_domain: u16,
    ) -> Self
    where
        T: i2c::AsyncBus + Clone + 'static,
    {
        let strategy = match model {
            DeviceModel::Max | DeviceModel::Ultra | DeviceModel::Supra => Strategy::DacTrim(
                Ds4432u::new(Box::new(i2c::Device::new(bus, DS4432U_ADDRESS))),
            ),
            DeviceModel::Hex => Strategy::Digital(tps546::Tps546::new(Box::new(
                i2c::Device::new(bus, tps546::I2C_ADDRESS),
            ))),
            DeviceModel::Invalid => Strategy::Unavailable,
        };
        Self::new(strategy, adc, voltage_domain)
    }

    /// Mandatory initialization, bus errors abort the boot
    pub async fn init(&self) -> error::Result<()> {
        match &mut *self.strategy.lock().await {
            Strategy::Digital(tps546) => {
                tps546.init().await?;
            }
            Strategy::DacTrim(_) => {}
            Strategy::Unavailable => warn!("No core voltage regulator on this board"),
        }
        Ok(())
    }

    /// Set core voltage of one die, the rail carries `voltage_domain` dies in series
    pub async fn set_core_voltage(&self, volts: f32) -> error::Result<()> {
        let rail_volts = volts * self.voltage_domain as f32;
        match &mut *self.strategy.lock().await {
            Strategy::DacTrim(dac) => {
                let code = voltage_to_code(rail_volts);
                let setting = VoltageSetting {
                    die: volts,
                    rail: rail_volts,
                    code,
                };
                info!("Set ASIC voltage = {}", setting);
                dac.set_current_code(DS4432U_CORE_CHANNEL, code).await
            }
            Strategy::Digital(_) => {
                debug!(
                    "Core voltage {:.3}V is managed by the digital regulator",
                    rail_volts
                );
                Ok(())
            }
            Strategy::Unavailable => Err(ErrorKind::Power(
                "no core voltage regulator available".to_string(),
            ))?,
        }
    }

    /// Measured voltage of one die
    pub async fn get_core_voltage_mv(&self) -> error::Result<u32> {
        Ok(self.adc.read_vcore_mv().await? / self.voltage_domain as u32)
    }

    /// Temperature reported by the digital regulator, if there is one
    pub async fn read_temperature(&self) -> error::Result<Option<f32>> {
        match &mut *self.strategy.lock().await {
            Strategy::Digital(tps546) => Ok(Some(tps546.read_temperature().await?)),
            _ => Ok(None),
        }
    }

    /// Output voltage reported by the digital regulator, if there is one
    pub async fn read_vout_mv(&self) -> error::Result<Option<i32>> {
        match &mut *self.strategy.lock().await {
            Strategy::Digital(tps546) => Ok(Some(tps546.read_vout_mv().await?)),
            _ => Ok(None),
        }
    }
}
