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

//! BM1366 driver

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

pub const CORE_COUNT: u32 = 112;

pub const PLL_LIMITS: PllLimits = PllLimits {
    fb_div_min: 0x90,
    fb_div_max: 0xeb,
    strict_post_div: true,
};

pub const CHIP_ID: [u8; 2] = [0x13, 0x66];

pub const MAX_BAUD_RATE: u32 = 1_000_000;

/// Hardware job ids advance by this step
pub const JOB_ID_STEP: u8 = 8;

const VERSION_MASK_ALL: [u8; 4] = [0x90, 0x00, 0xff, 0xff];

pub struct Bm1366 {
    transport: Arc<dyn Transport>,
    job_id: AtomicU8,
}

impl Bm1366 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            job_id: AtomicU8::new(0),
        }
    }

    /// Register writes addressed to each chip during bring-up
    fn chip_setup(chip_address: u8) -> Vec<error::Result<Vec<u8>>> {
        vec![
            bm13xx::write_register(chip_address, bm13xx::REG_INIT_CONTROL, [0x00, 0x07, 0x01, 0xf0]),
            bm13xx::write_register(chip_address, bm13xx::REG_MISC_CONTROL, [0xf0, 0x00, 0xc1, 0x00]),
            bm13xx::write_register(
                chip_address,
                bm13xx::REG_CORE_REGISTER_CONTROL,
                [0x80, 0x00, 0x85, 0x40],
            ),
            bm13xx::write_register(
                chip_address,
                bm13xx::REG_CORE_REGISTER_CONTROL,
                [0x80, 0x00, 0x80, 0x20],
            ),
            bm13xx::write_register(
                chip_address,
                bm13xx::REG_CORE_REGISTER_CONTROL,
                [0x80, 0x00, 0x82, 0xaa],
            ),
        ]
    }
}

#[async_trait]
impl Driver for Bm1366 {
    async fn init(&self, frequency_mhz: u16, asic_count: u16) -> error::Result<()> {
        let transport = self.transport.as_ref();

        for _ in 0..3 {
            transport
                .send(&bm13xx::write_register_all(bm13xx::REG_VERSION_MASK, VERSION_MASK_ALL)?)
                .await?;
        }
        let detected = count_chips(transport, bm13xx::LONG_RESULT_LEN, CHIP_ID).await?;
        check_chip_count(AsicModel::Bm1366, detected, asic_count);

        send_all(
            transport,
            vec![
                bm13xx::write_register_all(bm13xx::REG_INIT_CONTROL, [0x00, 0x07, 0x00, 0x00]),
                bm13xx::write_register_all(bm13xx::REG_MISC_CONTROL, [0xff, 0x0f, 0xc1, 0x00]),
                bm13xx::chain_inactive(),
            ],
        )
        .await?;
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
                bm13xx::write_register_all(
                    bm13xx::REG_CORE_REGISTER_CONTROL,
                    [0x80, 0x00, 0x85, 0x40],
                ),
                bm13xx::write_register_all(
                    bm13xx::REG_CORE_REGISTER_CONTROL,
                    [0x80, 0x00, 0x80, 0x20],
                ),
            ],
        )
        .await?;
        self.set_difficulty_mask(INITIAL_DIFFICULTY).await?;
        send_all(
            transport,
            vec![
                bm13xx::write_register_all(bm13xx::REG_ANALOG_MUX_CONTROL, [0x00, 0x00, 0x00, 0x03]),
                bm13xx::write_register_all(
                    bm13xx::REG_IO_DRIVER_STRENGTH,
                    [0x02, 0x11, 0x11, 0x11],
                ),
            ],
        )
        .await?;
        for index in 0..asic_count.max(1) {
            send_all(
                transport,
                Self::chip_setup(bm13xx::chip_address(index, asic_count)),
            )
            .await?;
        }

        let pll = PLL_LIMITS.calculate(frequency_mhz as f32);
        info!(
            "BM1366: setting frequency to {:.2} MHz ({} MHz requested)",
            pll.frequency(),
            frequency_mhz
        );
        send_all(
            transport,
            vec![
                bm13xx::write_register_all(bm13xx::REG_PLL0_PARAMETER, pll.to_reg()),
                bm13xx::write_register_all(
                    bm13xx::REG_HASH_COUNTING_NUMBER,
                    [0x00, 0x00, 0x15, 0x1c],
                ),
                bm13xx::write_register_all(bm13xx::REG_VERSION_MASK, VERSION_MASK_ALL),
            ],
        )
        .await
    }

    async fn configure_max_baud(&self) -> error::Result<u32> {
        info!("BM1366: setting max baud of {}", MAX_BAUD_RATE);
        self.transport
            .send(&bm13xx::write_register_all(
                bm13xx::REG_FAST_UART_CONFIGURATION,
                [0x11, 0x30, 0x02, 0x00],
            )?)
            .await?;
        Ok(MAX_BAUD_RATE)
    }

    async fn set_difficulty_mask(&self, difficulty: u32) -> error::Result<()> {
        let mask = bm13xx::ticket_mask(difficulty);
        debug!(
            "BM1366: setting difficulty mask to {} ({:02x?})",
            bm13xx::largest_power_of_two(difficulty),
            mask
        );
        self.transport
            .send(&bm13xx::write_register_all(bm13xx::REG_TICKET_MASK, mask)?)
            .await
    }

    async fn submit_work(&self, job: &AsicJob) -> error::Result<u8> {
        let job_id = next_job_id(&self.job_id, JOB_ID_STEP);
        let frame = bm13xx::job_frame(&bm13xx::long_job_payload(job_id, job))?;
        trace!("BM1366: sending job {:#04x}", job_id);
        self.transport.send(&frame).await?;
        Ok(job_id)
    }

    fn receive_result(&self, frame: &[u8]) -> Option<AsicResult> {
        parse_result(frame)
    }

    fn result_len(&self) -> usize {
        bm13xx::LONG_RESULT_LEN
    }
}

/// Decode result frame of the BM1366/BM1368 chips
pub(crate) fn parse_result(frame: &[u8]) -> Option<AsicResult> {
    let result = bm13xx::parse_long_result(frame)?;
    // the chip reports the job id shifted and the small core id in the low nibble
    let job_id = (result.job_id & 0xf0) >> 1;
    trace!(
        "Nonce {:#010x} from job {:#04x}, core {} small core {}",
        result.nonce,
        job_id,
        (result.nonce.swap_bytes() >> 25) & 0x7f,
        result.job_id & 0x0f
    );
    Some(AsicResult {
        job_id,
        nonce: result.nonce,
        version: VersionRoll::Bits((result.version as u32) << 13),
    })
}
