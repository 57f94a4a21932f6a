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

//! BM1368 driver. Framing, job layout and result decoding are shared with BM1366, the
//! bring-up differs in register values.

use crate::logging::macros::*;

use super::bm1366::{parse_result, JOB_ID_STEP};
use super::bm13xx::{self, PllLimits};
use super::{
    check_chip_count, count_chips, next_job_id, send_all, AsicModel, Driver, INITIAL_DIFFICULTY,
};
use crate::error;
use crate::serial::Transport;
use crate::work::{AsicJob, AsicResult};

use async_trait::async_trait;

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

pub const CORE_COUNT: u32 = 80;

pub const PLL_LIMITS: PllLimits = PllLimits {
    fb_div_min: 0x90,
    fb_div_max: 0xeb,
    strict_post_div: false,
};

pub const CHIP_ID: [u8; 2] = [0x13, 0x68];

pub const MAX_BAUD_RATE: u32 = 1_000_000;

const VERSION_MASK_ALL: [u8; 4] = [0x90, 0x00, 0xff, 0xff];

const CORE_CONTROL_FIRST: [u8; 4] = [0x80, 0x00, 0x8b, 0x00];
const CORE_CONTROL_SECOND: [u8; 4] = [0x80, 0x00, 0x80, 0x18];

pub struct Bm1368 {
    transport: Arc<dyn Transport>,
    job_id: AtomicU8,
}

impl Bm1368 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            job_id: AtomicU8::new(0),
        }
    }
}

#[async_trait]
impl Driver for Bm1368 {
    async fn init(&self, frequency_mhz: u16, asic_count: u16) -> error::Result<()> {
        let transport = self.transport.as_ref();

        for _ in 0..3 {
            transport
                .send(&bm13xx::write_register_all(bm13xx::REG_VERSION_MASK, VERSION_MASK_ALL)?)
                .await?;
        }
        let detected = count_chips(transport, bm13xx::LONG_RESULT_LEN, CHIP_ID).await?;
        check_chip_count(AsicModel::Bm1368, detected, asic_count);

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
                bm13xx::write_register_all(bm13xx::REG_CORE_REGISTER_CONTROL, CORE_CONTROL_FIRST),
                bm13xx::write_register_all(bm13xx::REG_CORE_REGISTER_CONTROL, CORE_CONTROL_SECOND),
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
            let address = bm13xx::chip_address(index, asic_count);
            send_all(
                transport,
                vec![
                    bm13xx::write_register(address, bm13xx::REG_INIT_CONTROL, [0x00, 0x07, 0x01, 0xf0]),
                    bm13xx::write_register(address, bm13xx::REG_MISC_CONTROL, [0xf0, 0x00, 0xc1, 0x00]),
                    bm13xx::write_register(address, bm13xx::REG_CORE_REGISTER_CONTROL, CORE_CONTROL_FIRST),
                    bm13xx::write_register(address, bm13xx::REG_CORE_REGISTER_CONTROL, CORE_CONTROL_SECOND),
                ],
            )
            .await?;
        }

        let pll = PLL_LIMITS.calculate(frequency_mhz as f32);
        info!(
            "BM1368: setting frequency to {:.2} MHz ({} MHz requested)",
            pll.frequency(),
            frequency_mhz
        );
        send_all(
            transport,
            vec![
                bm13xx::write_register_all(bm13xx::REG_PLL0_PARAMETER, pll.to_reg()),
                bm13xx::write_register_all(
                    bm13xx::REG_HASH_COUNTING_NUMBER,
                    [0x00, 0x00, 0x1e, 0xb5],
                ),
                bm13xx::write_register_all(bm13xx::REG_VERSION_MASK, VERSION_MASK_ALL),
            ],
        )
        .await
    }

    async fn configure_max_baud(&self) -> error::Result<u32> {
        info!("BM1368: setting max baud of {}", MAX_BAUD_RATE);
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
            "BM1368: setting difficulty mask to {} ({:02x?})",
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
        trace!("BM1368: sending job {:#04x}", job_id);
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::serial::test_utils::FakeTransport;

    #[tokio::test]
    async fn test_init_detects_chips() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_inbound(&[0xaa, 0x55, 0x13, 0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12]);
        let driver = Bm1368::new(transport.clone());
        driver.init(490, 1).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[6], bm13xx::chain_inactive().unwrap());
        assert_eq!(sent[7], bm13xx::set_chip_address(0).unwrap());
        assert_eq!(
            sent[8],
            bm13xx::write_register_all(bm13xx::REG_CORE_REGISTER_CONTROL, CORE_CONTROL_FIRST)
                .unwrap()
        );
        assert!(sent.contains(
            &bm13xx::write_register_all(bm13xx::REG_HASH_COUNTING_NUMBER, [0x00, 0x00, 0x1e, 0xb5])
                .unwrap()
        ));
    }

    #[tokio::test]
    async fn test_difficulty_mask() {
        let transport = Arc::new(FakeTransport::new());
        let driver = Bm1368::new(transport.clone());
        driver.set_difficulty_mask(1000).await.unwrap();
        assert_eq!(
            transport.sent(),
            vec![bm13xx::write_register_all(bm13xx::REG_TICKET_MASK, [0x00, 0x00, 0x80, 0xff])
                .unwrap()]
        );
    }

    #[test]
    fn test_pll_limits() {
        // non-strict post dividers allow equal values
        let pll = PLL_LIMITS.calculate(575.0);
        assert!(pll.fb_div >= 0x90 && pll.fb_div <= 0xeb);
        assert!((pll.frequency() - 575.0).abs() < 5.0);
    }
}
