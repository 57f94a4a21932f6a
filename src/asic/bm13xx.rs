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

//! Wire protocol shared by the BM13xx family: command and job framing, checksums,
//! result frames, ticket mask and PLL parameter search.

use crate::error::{self, ErrorKind};
use crate::work::AsicJob;

use crc::{Algorithm, Crc, CRC_16_IBM_3740};
use packed_struct::prelude::*;

/// Every frame sent to the chain starts with this preamble
pub const PREAMBLE: [u8; 2] = [0x55, 0xaa];

/// Every frame received from the chain starts with this preamble
pub const RESPONSE_PREAMBLE: [u8; 2] = [0xaa, 0x55];

/// Crystal oscillator frequency driving the PLLs
pub const CRYSTAL_MHZ: f32 = 25.0;

/// Registers common to the family
pub const REG_CHIP_ADDRESS: u8 = 0x00;
pub const REG_PLL0_PARAMETER: u8 = 0x08;
pub const REG_HASH_COUNTING_NUMBER: u8 = 0x10;
pub const REG_ORDERED_CLOCK_ENABLE: u8 = 0x20;
pub const REG_TICKET_MASK: u8 = 0x14;
pub const REG_MISC_CONTROL: u8 = 0x18;
pub const REG_FAST_UART_CONFIGURATION: u8 = 0x28;
pub const REG_CORE_REGISTER_CONTROL: u8 = 0x3c;
pub const REG_PLL3_PARAMETER: u8 = 0x68;
pub const REG_PLL0_DIVIDER: u8 = 0x70;
pub const REG_ANALOG_MUX_CONTROL: u8 = 0x54;
pub const REG_IO_DRIVER_STRENGTH: u8 = 0x58;
pub const REG_CLOCK_ORDER_CONTROL0: u8 = 0x80;
pub const REG_CLOCK_ORDER_CONTROL1: u8 = 0x84;
pub const REG_VERSION_MASK: u8 = 0xa4;
/// Undocumented, programmed during the BM1366/BM1368 bring-up
pub const REG_INIT_CONTROL: u8 = 0xa8;

/// Chip addresses are one byte, chips on the chain get evenly spaced addresses
pub const ADDRESS_SPACE: u16 = 256;

/// Command codes (low nibble of the header)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetAddress = 0,
    Write = 1,
    Read = 2,
    Inactive = 3,
}

/// Packet types (top three bits of the header)
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum PacketType {
    Job = 1,
    Cmd = 2,
}

/// Header byte of every frame sent to the chain
#[derive(PackedStruct, Debug, Clone, Copy, PartialEq)]
#[packed_struct(size_bytes = "1", bit_numbering = "lsb0")]
pub struct Header {
    #[packed_field(bits = "0:3")]
    code: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "4")]
    to_all: bool,
    #[packed_field(bits = "5:7", ty = "enum")]
    packet_type: PacketType,
}

impl Header {
    pub fn new(packet_type: PacketType, to_all: bool, command: Command) -> Self {
        Self {
            code: (command as u8).into(),
            to_all,
            packet_type,
        }
    }

    pub fn to_byte(&self) -> error::Result<u8> {
        let bytes = self.pack().map_err(packing_error)?;
        Ok(bytes[0])
    }
}

pub(crate) fn packing_error(e: PackingError) -> error::Error {
    ErrorKind::Asic(format!("packing: {:?}", e)).into()
}

/// CRC-5 over header, length and payload (x^5 + x^2 + 1, initial value all ones)
const CRC5_BM13XX: Algorithm<u8> = Algorithm {
    width: 5,
    poly: 0x05,
    init: 0x1f,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x0f,
    residue: 0x00,
};

const CRC5: Crc<u8> = Crc::<u8>::new(&CRC5_BM13XX);

/// CRC-16/CCITT-FALSE protecting job frames
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc5(data: &[u8]) -> u8 {
    CRC5.checksum(data)
}

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Build command frame `55 AA | header | len | data | crc5`
pub fn command_frame(to_all: bool, command: Command, data: &[u8]) -> error::Result<Vec<u8>> {
    let header = Header::new(PacketType::Cmd, to_all, command).to_byte()?;
    let mut frame = Vec::with_capacity(data.len() + 5);
    frame.extend_from_slice(&PREAMBLE);
    frame.push(header);
    frame.push((data.len() + 3) as u8);
    frame.extend_from_slice(data);
    let crc = crc5(&frame[2..]);
    frame.push(crc);
    Ok(frame)
}

/// Build job frame `55 AA | header | len | data | crc16 (big endian)`
pub fn job_frame(data: &[u8]) -> error::Result<Vec<u8>> {
    let header = Header::new(PacketType::Job, false, Command::Write).to_byte()?;
    let mut frame = Vec::with_capacity(data.len() + 6);
    frame.extend_from_slice(&PREAMBLE);
    frame.push(header);
    frame.push((data.len() + 4) as u8);
    frame.extend_from_slice(data);
    let crc = crc16(&frame[2..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Register write addressed to all chips
pub fn write_register_all(reg: u8, value: [u8; 4]) -> error::Result<Vec<u8>> {
    command_frame(
        true,
        Command::Write,
        &[0x00, reg, value[0], value[1], value[2], value[3]],
    )
}

/// Register write addressed to one chip
pub fn write_register(chip_address: u8, reg: u8, value: [u8; 4]) -> error::Result<Vec<u8>> {
    command_frame(
        false,
        Command::Write,
        &[chip_address, reg, value[0], value[1], value[2], value[3]],
    )
}

/// Register read broadcast, every chip answers with its value
pub fn read_register_all(reg: u8) -> error::Result<Vec<u8>> {
    command_frame(true, Command::Read, &[0x00, reg])
}

pub fn chain_inactive() -> error::Result<Vec<u8>> {
    command_frame(true, Command::Inactive, &[0x00, 0x00])
}

pub fn set_chip_address(chip_address: u8) -> error::Result<Vec<u8>> {
    command_frame(false, Command::SetAddress, &[chip_address, 0x00])
}

/// Address of `index`-th chip when `count` chips share the address space
pub fn chip_address(index: u16, count: u16) -> u8 {
    let interval = ADDRESS_SPACE / count.max(1);
    (index * interval) as u8
}

/// Chips only compare against power of two targets, round the difficulty down
pub fn largest_power_of_two(difficulty: u32) -> u32 {
    if difficulty == 0 {
        return 1;
    }
    1 << (31 - difficulty.leading_zeros())
}

/// Value of the ticket mask register for the difficulty. Chips read every byte of the
/// mask LSB first, so bits are reversed within each byte.
pub fn ticket_mask(difficulty: u32) -> [u8; 4] {
    let mask = largest_power_of_two(difficulty) - 1;
    let mut value = [0u8; 4];
    for i in 0..4 {
        value[3 - i] = ((mask >> (8 * i)) as u8).reverse_bits();
    }
    value
}

/// Result frame of BM1397 (9 bytes)
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(size_bytes = "9")]
pub struct ShortResult {
    #[packed_field(endian = "msb")]
    pub preamble: u16,
    #[packed_field(endian = "lsb")]
    pub nonce: u32,
    pub midstate_num: u8,
    pub job_id: u8,
    pub crc: u8,
}

/// Result frame of BM1366 and BM1368 (11 bytes), carries rolled version bits
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(size_bytes = "11")]
pub struct LongResult {
    #[packed_field(endian = "msb")]
    pub preamble: u16,
    #[packed_field(endian = "lsb")]
    pub nonce: u32,
    pub midstate_num: u8,
    pub job_id: u8,
    #[packed_field(endian = "msb")]
    pub version: u16,
    pub crc: u8,
}

const RESPONSE_PREAMBLE_WORD: u16 = 0xaa55;

pub const SHORT_RESULT_LEN: usize = 9;
pub const LONG_RESULT_LEN: usize = 11;

/// Bit of the last byte telling nonce responses from register read responses
const RESPONSE_IS_JOB: u8 = 0x80;

/// Check preamble and response type shared by both frame layouts
fn is_nonce_frame(frame: &[u8], expected_len: usize) -> bool {
    frame.len() == expected_len
        && frame[..2] == RESPONSE_PREAMBLE
        && frame[expected_len - 1] & RESPONSE_IS_JOB != 0
}

pub fn parse_short_result(frame: &[u8]) -> Option<ShortResult> {
    if !is_nonce_frame(frame, SHORT_RESULT_LEN) {
        return None;
    }
    let result = ShortResult::unpack_from_slice(frame).ok()?;
    debug_assert_eq!(result.preamble, RESPONSE_PREAMBLE_WORD);
    Some(result)
}

pub fn parse_long_result(frame: &[u8]) -> Option<LongResult> {
    if !is_nonce_frame(frame, LONG_RESULT_LEN) {
        return None;
    }
    let result = LongResult::unpack_from_slice(frame).ok()?;
    debug_assert_eq!(result.preamble, RESPONSE_PREAMBLE_WORD);
    Some(result)
}

/// Range of PLL parameters a chip model accepts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllLimits {
    pub fb_div_min: u8,
    pub fb_div_max: u8,
    /// Post dividers must satisfy `postdiv1 > postdiv2` instead of `>=`
    pub strict_post_div: bool,
}

/// PLL register settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllConfig {
    pub flag: u8,
    pub fb_div: u8,
    pub ref_div: u8,
    /// `(postdiv1 - 1) << 4 | (postdiv2 - 1)`
    pub post_div: u8,
}

impl PllConfig {
    pub fn frequency(&self) -> f32 {
        let post_div1 = ((self.post_div >> 4) & 0xf) + 1;
        let post_div2 = (self.post_div & 0xf) + 1;
        CRYSTAL_MHZ * self.fb_div as f32
            / (self.ref_div as f32 * post_div1 as f32 * post_div2 as f32)
    }

    pub fn to_reg(&self) -> [u8; 4] {
        [self.flag, self.fb_div, self.ref_div, self.post_div]
    }
}

impl PllLimits {
    /// Search PLL settings closest to the target frequency
    pub fn calculate(&self, target_mhz: f32) -> PllConfig {
        let mut best: Option<(f32, PllConfig)> = None;

        for &ref_div in [2u8, 1].iter() {
            for post_div1 in (1..=7u8).rev() {
                for post_div2 in (1..=7u8).rev() {
                    let valid = if self.strict_post_div {
                        post_div1 > post_div2
                    } else {
                        post_div1 >= post_div2
                    };
                    if !valid {
                        continue;
                    }
                    let fb_div = ((post_div1 * post_div2) as f32 * target_mhz * ref_div as f32
                        / CRYSTAL_MHZ)
                        .round();
                    if fb_div < self.fb_div_min as f32 || fb_div > self.fb_div_max as f32 {
                        continue;
                    }
                    let fb_div = fb_div as u8;
                    let vco = CRYSTAL_MHZ * fb_div as f32 / ref_div as f32;
                    let config = PllConfig {
                        flag: if vco >= 2400.0 { 0x50 } else { 0x40 },
                        fb_div,
                        ref_div,
                        post_div: ((post_div1 - 1) << 4) | (post_div2 - 1),
                    };
                    let error = (target_mhz - config.frequency()).abs();
                    if best.map_or(true, |(best_error, _)| error < best_error) {
                        best = Some((error, config));
                    }
                }
            }
        }

        // the ranges always contain a solution for some divider, fall back to the
        // lowest feedback divider for absurd targets
        best.map(|(_, config)| config).unwrap_or(PllConfig {
            flag: 0x40,
            fb_div: self.fb_div_min,
            ref_div: 2,
            post_div: 0x55,
        })
    }
}

/// Reverse order of 4-byte words in a hash, the byte order within words is kept
pub fn reverse_words(hash: &[u8; 32]) -> [u8; 32] {
    let mut reversed = [0u8; 32];
    for (i, word) in hash.chunks(4).enumerate() {
        reversed[28 - i * 4..32 - i * 4].copy_from_slice(word);
    }
    reversed
}

/// Length of the job payload used by chips rolling versions on their own
pub const LONG_JOB_LEN: usize = 82;

/// Job payload of BM1366 and BM1368: id, midstate count, starting nonce, nbits, ntime,
/// merkle root, previous hash and version
pub fn long_job_payload(job_id: u8, job: &AsicJob) -> Vec<u8> {
    let mut payload = Vec::with_capacity(LONG_JOB_LEN);
    payload.push(job_id);
    payload.push(0x01);
    payload.extend_from_slice(&job.starting_nonce.to_le_bytes());
    payload.extend_from_slice(&job.nbits.to_le_bytes());
    payload.extend_from_slice(&job.ntime.to_le_bytes());
    payload.extend_from_slice(&reverse_words(&job.merkle_root));
    payload.extend_from_slice(&reverse_words(&job.prev_hash));
    payload.extend_from_slice(&job.version.to_le_bytes());
    payload
}

/// Next value of the masked bits, carries skip the bits outside of the mask
pub fn increment_bitmask(value: u32, mask: u32) -> u32 {
    if mask == 0 {
        return value;
    }
    let masked = (value | !mask).wrapping_add(1) & mask;
    (value & !mask) | masked
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_crc() {
        assert_eq!(crc5(b"123456789"), 0x0f);
        assert_eq!(crc16(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_header() {
        let header = Header::new(PacketType::Cmd, true, Command::Inactive);
        assert_eq!(header.to_byte().unwrap(), 0x53);
        let header = Header::new(PacketType::Cmd, true, Command::Write);
        assert_eq!(header.to_byte().unwrap(), 0x51);
        let header = Header::new(PacketType::Cmd, false, Command::SetAddress);
        assert_eq!(header.to_byte().unwrap(), 0x40);
        let header = Header::new(PacketType::Job, false, Command::Write);
        assert_eq!(header.to_byte().unwrap(), 0x21);
    }

    #[test]
    fn test_command_frames() {
        assert_eq!(
            chain_inactive().unwrap(),
            vec![0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03]
        );
        assert_eq!(
            set_chip_address(0).unwrap(),
            vec![0x55, 0xaa, 0x40, 0x05, 0x00, 0x00, 0x1c]
        );
        assert_eq!(
            write_register_all(REG_FAST_UART_CONFIGURATION, [0x11, 0x30, 0x02, 0x00]).unwrap(),
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0x28, 0x11, 0x30, 0x02, 0x00, 0x03]
        );
        assert_eq!(
            write_register_all(REG_TICKET_MASK, ticket_mask(256)).unwrap(),
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0x14, 0x00, 0x00, 0x00, 0xff, 0x08]
        );
    }

    #[test]
    fn test_job_frame() {
        let data = [0u8; 82];
        let frame = job_frame(&data).unwrap();
        assert_eq!(frame.len(), 88);
        assert_eq!(&frame[..4], &[0x55, 0xaa, 0x21, 86]);
        let crc = crc16(&frame[2..86]);
        assert_eq!(&frame[86..], &crc.to_be_bytes());
    }

    #[test]
    fn test_long_job_payload() {
        let mut job = crate::work::test::block_125552();
        job.starting_nonce = 0x0102_0304;
        let payload = long_job_payload(0x18, &job);
        assert_eq!(payload.len(), LONG_JOB_LEN);
        assert_eq!(&payload[..6], &[0x18, 0x01, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&payload[6..10], &[0xf2, 0xb9, 0x44, 0x1a]);
        assert_eq!(&payload[10..14], &[0xc7, 0xf5, 0xd7, 0x4d]);
        // last word of the merkle root goes first
        assert_eq!(&payload[14..18], &job.merkle_root[28..32]);
        assert_eq!(&payload[46..50], &job.prev_hash[28..32]);
        assert_eq!(&payload[78..], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_chip_address() {
        assert_eq!(chip_address(0, 1), 0);
        assert_eq!(chip_address(1, 2), 128);
        assert_eq!(chip_address(5, 6), 210);
        // zero chips behaves like one
        assert_eq!(chip_address(0, 0), 0);
    }

    #[test]
    fn test_ticket_mask() {
        assert_eq!(largest_power_of_two(256), 256);
        assert_eq!(largest_power_of_two(1000), 512);
        assert_eq!(largest_power_of_two(1), 1);
        assert_eq!(ticket_mask(256), [0x00, 0x00, 0x00, 0xff]);
        // 511 = 0x1ff, 0x01 is reversed into 0x80
        assert_eq!(ticket_mask(512), [0x00, 0x00, 0x80, 0xff]);
        assert_eq!(ticket_mask(1000), [0x00, 0x00, 0x80, 0xff]);
        assert_eq!(ticket_mask(1), [0x00; 4]);
    }

    #[test]
    fn test_parse_results() {
        let short = [0xaa, 0x55, 0x78, 0x56, 0x34, 0x12, 0x01, 0x2a, 0x9c];
        let result = parse_short_result(&short).unwrap();
        assert_eq!(result.nonce, 0x12345678);
        assert_eq!(result.midstate_num, 0x01);
        assert_eq!(result.job_id, 0x2a);

        let long = [0xaa, 0x55, 0x78, 0x56, 0x34, 0x12, 0x00, 0x58, 0x00, 0x3c, 0x95];
        let result = parse_long_result(&long).unwrap();
        assert_eq!(result.nonce, 0x12345678);
        assert_eq!(result.job_id, 0x58);
        assert_eq!(result.version, 0x003c);

        // register responses have the top bit of the last byte cleared
        let mut reply = long;
        reply[10] = 0x15;
        assert!(parse_long_result(&reply).is_none());
        // wrong preamble or length
        let mut bad = short;
        bad[0] = 0x55;
        assert!(parse_short_result(&bad).is_none());
        assert!(parse_short_result(&long).is_none());
        assert!(parse_long_result(&short).is_none());
    }

    #[test]
    fn test_pll() {
        let bm1397 = PllLimits {
            fb_div_min: 0xa0,
            fb_div_max: 0xef,
            strict_post_div: false,
        };
        let bm1366 = PllLimits {
            fb_div_min: 0x90,
            fb_div_max: 0xeb,
            strict_post_div: true,
        };
        for &target in [100.0f32, 200.0, 400.0, 485.0, 500.0, 575.0].iter() {
            for limits in [bm1397, bm1366].iter() {
                let pll = limits.calculate(target);
                assert!(pll.fb_div >= limits.fb_div_min && pll.fb_div <= limits.fb_div_max);
                assert!(pll.ref_div == 1 || pll.ref_div == 2);
                let post_div1 = (pll.post_div >> 4) + 1;
                let post_div2 = (pll.post_div & 0xf) + 1;
                if limits.strict_post_div {
                    assert!(post_div1 > post_div2);
                } else {
                    assert!(post_div1 >= post_div2);
                }
                assert!((pll.frequency() - target).abs() < 1.0, "{} MHz", target);
                let vco = 25.0 * pll.fb_div as f32 / pll.ref_div as f32;
                assert_eq!(pll.flag, if vco >= 2400.0 { 0x50 } else { 0x40 });
            }
        }
    }

    #[test]
    fn test_reverse_words() {
        let mut hash = [0u8; 32];
        for (i, b) in hash.iter_mut().enumerate() {
            *b = i as u8;
        }
        let reversed = reverse_words(&hash);
        assert_eq!(&reversed[..4], &[28, 29, 30, 31]);
        assert_eq!(&reversed[28..], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_increment_bitmask() {
        assert_eq!(increment_bitmask(0x2000_0000, 0), 0x2000_0000);
        assert_eq!(increment_bitmask(0x2000_0000, 0x1fff_e000), 0x2000_2000);
        // wraps inside the mask without touching other bits
        assert_eq!(increment_bitmask(0x3fff_e004, 0x1fff_e000), 0x2000_0004);
        // carry skips the holes of the mask
        assert_eq!(increment_bitmask(0x0000_0100, 0x0000_1100), 0x0000_1000);
    }
}
