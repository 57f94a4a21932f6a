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

//! BM1397 driver. The chip does not roll versions itself, jobs carry up to four
//! midstates instead and results report which one the nonce belongs to.

use crate::logging::macros::*;

use super::bm13xx::{self, PllLimits};
use super::{
    check_chip_count, count_chips, next_job_id, send_all, AsicModel, Driver, INITIAL_DIFFICULTY,
};
use crate::error;
use crate::serial::Transport;
use crate::work::{AsicJob, AsicResult, VersionRoll};

use async_trait::async_trait;

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

pub const CORE_COUNT: u32 = 168;

pub const PLL_LIMITS: PllLimits = PllLimits {
    fb_div_min: 0xa0,
    fb_div_max: 0xef,
    strict_post_div: false,
};

pub const CHIP_ID: [u8; 2] = [0x13, 0x97];

pub const MAX_BAUD_RATE: u32 = 3_125_000;

/// Low two bits of the job id carry the midstate index
pub const JOB_ID_STEP: u8 = 4;

/// Fixed part of the job payload preceding the midstates
pub const JOB_HEADER_LEN: usize = 18;

const MISC_CONTROL_DEFAULT_BAUD: [u8; 4] = [0x00, 0x00, 0x7a, 0x31];
const MISC_CONTROL_MAX_BAUD: [u8; 4] = [0x00, 0x00, 0x60, 0x31];
const PLL3_MAX_BAUD: [u8; 4] = [0xc0, 0x70, 0x01, 0x11];
const FAST_UART_MAX_BAUD: [u8; 4] = [0x06, 0x00, 0x00, 0x0f];

pub struct Bm1397 {
    transport: Arc<dyn Transport>,
    job_id: AtomicU8,
}

impl Bm1397 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            job_id: AtomicU8::new(0),
        }
    }

    async fn send_hash_frequency(&self, frequency_mhz: u16) -> error::Result<()> {
        let pll = PLL_LIMITS.calculate(frequency_mhz as f32);
        info!(
            "BM1397: setting frequency to {:.2} MHz ({} MHz requested)",
            pll.frequency(),
            frequency_mhz
        );
        send_all(
            self.transport.as_ref(),
            vec![
                bm13xx::write_register_all(bm13xx::REG_PLL0_DIVIDER, [0x0f, 0x0f, 0x0f, 0x00]),
                bm13xx::write_register_all(bm13xx::REG_PLL0_PARAMETER, pll.to_reg()),
            ],
        )
        .await
    }
}

/// Job payload: id, midstate count, starting nonce, nbits, ntime, last merkle root word
/// and the midstates (byte reversed)
pub fn job_payload(job_id: u8, job: &AsicJob) -> Vec<u8> {
    let mut payload = Vec::with_capacity(JOB_HEADER_LEN + 32 * job.midstates.len());
    payload.push(job_id);
    payload.push(job.midstates.len() as u8);
    payload.extend_from_slice(&job.starting_nonce.to_le_bytes());
    payload.extend_from_slice(&job.nbits.to_le_bytes());
    payload.extend_from_slice(&job.ntime.to_le_bytes());
    payload.extend_from_slice(&job.merkle_root[28..32]);
    for midstate in job.midstates.iter() {
        payload.extend(midstate.iter().rev());
    }
    payload
}

#[async_trait]
impl Driver for Bm1397 {
    async fn init(&self, frequency_mhz: u16, asic_count: u16) -> error::Result<()> {
        let transport = self.transport.as_ref();

        let detected = count_chips(transport, bm13xx::SHORT_RESULT_LEN, CHIP_ID).await?;
        check_chip_count(AsicModel::Bm1397, detected, asic_count);

        transport.send(&bm13xx::chain_inactive()?).await?;
        for index in 0..asic_count.max(1) {
            transport
                .send(&bm13xx::set_chip_address(bm13xx::chip_address(
                    index, asic_count,
                ))?)
                .await?;
        }
        send_all(
            transport,
            vec![
                bm13xx::write_register_all(bm13xx::REG_CLOCK_ORDER_CONTROL0, [0x00; 4]),
                bm13xx::write_register_all(bm13xx::REG_CLOCK_ORDER_CONTROL1, [0x00; 4]),
                bm13xx::write_register_all(bm13xx::REG_ORDERED_CLOCK_ENABLE, [0x00, 0x00, 0x00, 0x01]),
                bm13xx::write_register_all(
                    bm13xx::REG_CORE_REGISTER_CONTROL,
                    [0x80, 0x00, 0x80, 0x74],
                ),
            ],
        )
        .await?;
        self.set_difficulty_mask(INITIAL_DIFFICULTY).await?;
        send_all(
            transport,
            vec![
                bm13xx::write_register_all(bm13xx::REG_PLL3_PARAMETER, PLL3_MAX_BAUD),
                bm13xx::write_register_all(bm13xx::REG_FAST_UART_CONFIGURATION, FAST_UART_MAX_BAUD),
                bm13xx::write_register_all(bm13xx::REG_MISC_CONTROL, MISC_CONTROL_DEFAULT_BAUD),
            ],
        )
        .await?;
        self.send_hash_frequency(frequency_mhz).await
    }

    async fn configure_max_baud(&self) -> error::Result<u32> {
        info!("BM1397: setting max baud of {}", MAX_BAUD_RATE);
        send_all(
            self.transport.as_ref(),
            vec![
                bm13xx::write_register_all(bm13xx::REG_MISC_CONTROL, MISC_CONTROL_MAX_BAUD),
                bm13xx::write_register_all(bm13xx::REG_PLL3_PARAMETER, PLL3_MAX_BAUD),
                bm13xx::write_register_all(bm13xx::REG_FAST_UART_CONFIGURATION, FAST_UART_MAX_BAUD),
            ],
        )
        .await?;
        Ok(MAX_BAUD_RATE)
    }

    async fn set_difficulty_mask(&self, difficulty: u32) -> error::Result<()> {
        let mask = bm13xx::ticket_mask(difficulty);
        debug!(
            "BM1397: setting difficulty mask to {} ({:02x?})",
            bm13xx::largest_power_of_two(difficulty),
            mask
        );
        self.transport
            .send(&bm13xx::write_register_all(bm13xx::REG_TICKET_MASK, mask)?)
            .await
    }

    async fn submit_work(&self, job: &AsicJob) -> error::Result<u8> {
        let job_id = next_job_id(&self.job_id, JOB_ID_STEP);
        let frame = bm13xx::job_frame(&job_payload(job_id, job))?;
        trace!(
            "BM1397: sending job {:#04x} with {} midstate(s)",
            job_id,
            job.midstates.len()
        );
        self.transport.send(&frame).await?;
        Ok(job_id)
    }

    fn receive_result(&self, frame: &[u8]) -> Option<AsicResult> {
        let result = bm13xx::parse_short_result(frame)?;
        Some(AsicResult {
            job_id: result.job_id & 0xfc,
            nonce: result.nonce,
            version: VersionRoll::Midstate(result.job_id & 0x03),
        })
    }

    fn result_len(&self) -> usize {
        bm13xx::SHORT_RESULT_LEN
    }
}
