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

//! Chip families supported by the firmware and the driver interface the rest of the
//! miner talks to.
//!
//! The family is resolved once at boot from the persisted model name. An unknown name
//! yields `AsicSupport::Unsupported` which carries no driver at all, so the mining tasks
//! cannot be started without a complete driver.

pub mod bm1366;
pub mod bm1368;
pub mod bm1397;
pub mod bm13xx;

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::serial::Transport;
use crate::work::{AsicJob, AsicResult};

use async_trait::async_trait;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of the nonce space scanned for one job
pub const NONCE_SPACE: f64 = 4_294_967_296.0;

/// How long the BM1366 takes to scan its whole search space
pub const BM1366_FULL_SCAN_MS: f64 = 2140.0;

/// Share difficulty the chips start with
pub const INITIAL_DIFFICULTY: u32 = 256;

/// How long to wait for chips answering a broadcast register read
const CHIP_ID_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Supported chip families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsicModel {
    Bm1366,
    Bm1368,
    Bm1397,
}

impl AsicModel {
    pub fn name(&self) -> &'static str {
        match self {
            AsicModel::Bm1366 => "BM1366",
            AsicModel::Bm1368 => "BM1368",
            AsicModel::Bm1397 => "BM1397",
        }
    }

    /// Number of hashing cores in one chip
    pub fn core_count(&self) -> u32 {
        match self {
            AsicModel::Bm1366 => bm1366::CORE_COUNT,
            AsicModel::Bm1368 => bm1368::CORE_COUNT,
            AsicModel::Bm1397 => bm1397::CORE_COUNT,
        }
    }

    pub fn initial_difficulty(&self) -> u32 {
        INITIAL_DIFFICULTY
    }

    pub fn pll_limits(&self) -> bm13xx::PllLimits {
        match self {
            AsicModel::Bm1366 => bm1366::PLL_LIMITS,
            AsicModel::Bm1368 => bm1368::PLL_LIMITS,
            AsicModel::Bm1397 => bm1397::PLL_LIMITS,
        }
    }

    /// BM1397 boards cannot run the factory self-test
    pub fn supports_self_test(&self) -> bool {
        *self != AsicModel::Bm1397
    }

    /// Interval between two jobs sent to the chain
    ///
    /// BM1366 is limited by the time to scan its search space, the other families by
    /// the nonce space divided by the expected hash rate.
    pub fn job_cadence_ms(&self, frequency_mhz: u16, asic_count: u16) -> f64 {
        let asic_count = asic_count.max(1) as f64;
        match self {
            AsicModel::Bm1366 => BM1366_FULL_SCAN_MS / asic_count,
            AsicModel::Bm1368 | AsicModel::Bm1397 => {
                let hash_rate = frequency_mhz as f64 * self.core_count() as f64 * 1_000_000.0;
                NONCE_SPACE / hash_rate * 1000.0 / asic_count
            }
        }
    }
}

impl fmt::Display for AsicModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for AsicModel {
    type Err = error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BM1366" => Ok(AsicModel::Bm1366),
            "BM1368" => Ok(AsicModel::Bm1368),
            "BM1397" => Ok(AsicModel::Bm1397),
            _ => Err(ErrorKind::Config(format!("unknown ASIC model '{}'", s)))?,
        }
    }
}

/// Result of resolving the configured ASIC model
#[derive(Debug, Clone, PartialEq)]
pub enum AsicSupport {
    Supported(AsicModel),
    /// Carries the unrecognized model name
    Unsupported(String),
}

impl AsicSupport {
    pub fn resolve(name: &str) -> Self {
        match name.parse::<AsicModel>() {
            Ok(model) => AsicSupport::Supported(model),
            Err(_) => AsicSupport::Unsupported(name.to_string()),
        }
    }

    pub fn model(&self) -> Option<AsicModel> {
        match self {
            AsicSupport::Supported(model) => Some(*model),
            AsicSupport::Unsupported(_) => None,
        }
    }
}

/// Operations every chip family provides
#[async_trait]
pub trait Driver: Send + Sync {
    /// Bring the chain to a known state running at `frequency_mhz`
    async fn init(&self, frequency_mhz: u16, asic_count: u16) -> error::Result<()>;

    /// Switch the chips to their fastest link speed and return the baud rate that
    /// must be applied to the transport
    async fn configure_max_baud(&self) -> error::Result<u32>;

    async fn set_difficulty_mask(&self, difficulty: u32) -> error::Result<()>;

    /// Send job to the chain and return the hardware job id it was assigned
    async fn submit_work(&self, job: &AsicJob) -> error::Result<u8>;

    /// Parse one inbound frame, `None` when it is not a nonce
    fn receive_result(&self, frame: &[u8]) -> Option<AsicResult>;

    /// Length of result frames produced by the chain
    fn result_len(&self) -> usize;
}

/// Driver of the configured chip family
pub enum Chain {
    Bm1366(bm1366::Bm1366),
    Bm1368(bm1368::Bm1368),
    Bm1397(bm1397::Bm1397),
}

impl Chain {
    pub fn new(model: AsicModel, transport: Arc<dyn Transport>) -> Self {
        match model {
            AsicModel::Bm1366 => Chain::Bm1366(bm1366::Bm1366::new(transport)),
            AsicModel::Bm1368 => Chain::Bm1368(bm1368::Bm1368::new(transport)),
            AsicModel::Bm1397 => Chain::Bm1397(bm1397::Bm1397::new(transport)),
        }
    }

    pub fn model(&self) -> AsicModel {
        match self {
            Chain::Bm1366(_) => AsicModel::Bm1366,
            Chain::Bm1368(_) => AsicModel::Bm1368,
            Chain::Bm1397(_) => AsicModel::Bm1397,
        }
    }

    fn inner(&self) -> &dyn Driver {
        match self {
            Chain::Bm1366(driver) => driver,
            Chain::Bm1368(driver) => driver,
            Chain::Bm1397(driver) => driver,
        }
    }
}

#[async_trait]
impl Driver for Chain {
    async fn init(&self, frequency_mhz: u16, asic_count: u16) -> error::Result<()> {
        self.inner().init(frequency_mhz, asic_count).await
    }

    async fn configure_max_baud(&self) -> error::Result<u32> {
        self.inner().configure_max_baud().await
    }

    async fn set_difficulty_mask(&self, difficulty: u32) -> error::Result<()> {
        self.inner().set_difficulty_mask(difficulty).await
    }

    async fn submit_work(&self, job: &AsicJob) -> error::Result<u8> {
        self.inner().submit_work(job).await
    }

    fn receive_result(&self, frame: &[u8]) -> Option<AsicResult> {
        self.inner().receive_result(frame)
    }

    fn result_len(&self) -> usize {
        self.inner().result_len()
    }
}

/// Take current job id and advance the counter by `step` modulo 128
pub(crate) fn next_job_id(counter: &AtomicU8, step: u8) -> u8 {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.wrapping_add(step) % 128;
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return current,
            Err(actual) => current = actual,
        }
    }
}

/// Send frames one after another
pub(crate) async fn send_all(
    transport: &dyn Transport,
    frames: impl IntoIterator<Item = error::Result<Vec<u8>>>,
) -> error::Result<()> {
    for frame in frames {
        transport.send(&frame?).await?;
    }
    Ok(())
}

/// Offset of the first byte after the frame start that may begin a response
fn resync_offset(frame: &[u8]) -> usize {
    let [first, second] = bm13xx::RESPONSE_PREAMBLE;
    (1..frame.len())
        .find(|&i| frame[i] == first && frame.get(i + 1).map_or(true, |b| *b == second))
        .unwrap_or(frame.len())
}

/// Read one `len` byte response. Stray or lost bytes on the link are skipped by
/// realigning on the response preamble.
pub async fn receive_frame(
    transport: &dyn Transport,
    len: usize,
    timeout: Duration,
) -> error::Result<Option<Vec<u8>>> {
    let mut frame = Vec::with_capacity(len);
    loop {
        if frame.len() < len {
            match transport.receive(len - frame.len(), timeout).await? {
                Some(bytes) => frame.extend_from_slice(&bytes),
                None => {
                    if !frame.is_empty() {
                        trace!("Incomplete response {:02x?} dropped", frame);
                    }
                    return Ok(None);
                }
            }
            continue;
        }
        if frame.starts_with(&bm13xx::RESPONSE_PREAMBLE) {
            return Ok(Some(frame));
        }
        let offset = resync_offset(&frame);
        debug!("Chain link out of sync, skipping {:02x?}", &frame[..offset]);
        frame.drain(..offset);
    }
}

/// Broadcast chip id read and count the chips that answered with `chip_id`
pub(crate) async fn count_chips(
    transport: &dyn Transport,
    response_len: usize,
    chip_id: [u8; 2],
) -> error::Result<usize> {
    transport
        .send(&bm13xx::read_register_all(bm13xx::REG_CHIP_ADDRESS)?)
        .await?;

    let mut count = 0;
    while let Some(response) =
        receive_frame(transport, response_len, CHIP_ID_READ_TIMEOUT).await?
    {
        if response.len() >= 4
            && response[..2] == bm13xx::RESPONSE_PREAMBLE
            && response[2..4] == chip_id
        {
            count += 1;
        } else {
            trace!("Ignoring unexpected chip response {:02x?}", response);
        }
    }
    Ok(count)
}

/// Log discrepancy between detected and configured chip count
pub(crate) fn check_chip_count(model: AsicModel, detected: usize, expected: u16) {
    if detected == expected as usize {
        info!("{}: {} chip(s) detected on the chain", model, detected);
    } else {
        warn!(
            "{}: {} chip(s) detected on the chain, {} configured",
            model, detected, expected
        );
    }
}
