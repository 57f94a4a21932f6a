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

//! PMBus command codes and the linear data formats used by digital power controllers

use crate::error::{self, ErrorKind};

pub const VOUT_MODE: u8 = 0x20;
pub const VOUT_COMMAND: u8 = 0x21;
pub const READ_VOUT: u8 = 0x8b;
pub const READ_TEMPERATURE_1: u8 = 0x8d;
pub const PMBUS_REVISION: u8 = 0x98;
pub const IC_DEVICE_ID: u8 = 0xad;

/// Reassemble a 16-bit value transferred low byte first
#[inline]
pub fn word_from_wire(data: [u8; 2]) -> u16 {
    ((data[1] as u16) << 8) | data[0] as u16
}

/// Sign-extend the low `bits` bits of `value`
fn sign_extend(value: u16, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value as i32) << shift) >> shift
}

/// SLINEAR11: 11-bit two's complement mantissa in bits 10..0, 5-bit two's complement
/// exponent in bits 15..11. The exponent sign is therefore the MSB of the whole word.
pub mod slinear11 {
    use super::*;

    pub const MANTISSA_MIN: i16 = -1024;
    pub const MANTISSA_MAX: i16 = 1023;
    pub const EXPONENT_MIN: i8 = -16;
    pub const EXPONENT_MAX: i8 = 15;

    /// Split raw word into `(mantissa, exponent)`
    pub fn decode(raw: u16) -> (i16, i8) {
        let mantissa = sign_extend(raw & 0x07ff, 11) as i16;
        let exponent = if raw & 0x8000 != 0 {
            -((((!raw) >> 11) & 0x001f) as i8 + 1)
        } else {
            (raw >> 11) as i8
        };
        (mantissa, exponent)
    }

    /// Build raw word from `(mantissa, exponent)`
    pub fn encode(mantissa: i16, exponent: i8) -> error::Result<u16> {
        if mantissa < MANTISSA_MIN || mantissa > MANTISSA_MAX {
            Err(ErrorKind::Pmbus(format!(
                "SLINEAR11 mantissa {} out of range",
                mantissa
            )))?
        }
        if exponent < EXPONENT_MIN || exponent > EXPONENT_MAX {
            Err(ErrorKind::Pmbus(format!(
                "SLINEAR11 exponent {} out of range",
                exponent
            )))?
        }
        Ok((((exponent as u16) & 0x1f) << 11) | ((mantissa as u16) & 0x07ff))
    }

    pub fn to_f32(raw: u16) -> f32 {
        let (mantissa, exponent) = decode(raw);
        mantissa as f32 * 2f32.powi(exponent as i32)
    }
}

/// ULINEAR16: unsigned 16-bit mantissa, exponent comes from the VOUT_MODE register
pub mod ulinear16 {
    use super::*;

    pub fn to_f32(raw: u16, vout_mode: u8) -> f32 {
        raw as f32 * 2f32.powi(vout_mode_exponent(vout_mode) as i32)
    }

    /// Millivolts truncated toward zero
    pub fn to_millivolts(raw: u16, vout_mode: u8) -> i32 {
        (to_f32(raw, vout_mode) * 1000.0) as i32
    }
}

/// Exponent stored in the low five bits of VOUT_MODE (two's complement)
pub fn vout_mode_exponent(vout_mode: u8) -> i8 {
    sign_extend((vout_mode & 0x1f) as u16, 5) as i8
}
