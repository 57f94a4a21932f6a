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

//! Source of mining work. The pool protocol client plugs in here; the benchmark
//! frontend generates its own work so the chain can be exercised without a pool.

use crate::logging::macros::*;

use crate::error;
use crate::work::{MiningNotify, Share};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[async_trait]
pub trait Frontend: Send + Sync {
    /// Wait for the next job notification
    async fn next_notify(&self) -> error::Result<MiningNotify>;

    async fn submit_share(&self, share: Share) -> error::Result<()>;
}

/// Frontend producing synthetic jobs at a fixed interval
pub struct BenchmarkFrontend {
    interval: Duration,
    difficulty: u32,
    issued: AtomicU64,
    submitted: AtomicU64,
}

impl BenchmarkFrontend {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_DIFFICULTY: u32 = 1024;

    pub fn new(interval: Duration, difficulty: u32) -> Self {
        Self {
            interval,
            difficulty,
            issued: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn make_notify(&self, sequence: u64) -> MiningNotify {
        let mut prev_hash = [0u8; 32];
        LittleEndian::write_u64(&mut prev_hash[..8], sequence);
        MiningNotify {
            job_id: format!("{:x}", sequence),
            prev_hash,
            coinbase1: b"axeminer benchmark".to_vec(),
            coinbase2: sequence.to_le_bytes().to_vec(),
            merkle_branches: vec![],
            version: 0x2000_0000,
            version_mask: 0x1fff_e000,
            nbits: 0x1705_ae3a,
            ntime: 0x6500_0000 + sequence as u32,
            clean_jobs: true,
            extranonce1: vec![0xab, 0xcd, 0xef, 0x01],
            extranonce2_len: 4,
            difficulty: self.difficulty,
        }
    }
}

impl Default for BenchmarkFrontend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_DIFFICULTY)
    }
}

#[async_trait]
impl Frontend for BenchmarkFrontend {
    async fn next_notify(&self) -> error::Result<MiningNotify> {
        let sequence = self.issued.fetch_add(1, Ordering::Relaxed);
        // the first job is available right away
        if sequence > 0 {
            tokio::time::sleep(self.interval).await;
        }
        debug!("Benchmark: new job {}", sequence);
        Ok(self.make_notify(sequence))
    }

    async fn submit_share(&self, share: Share) -> error::Result<()> {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            "Benchmark: share for job {} nonce {:#010x} version {:#010x} difficulty {:.0}",
            share.pool_job_id, share.nonce, share.version, share.difficulty
        );
        Ok(())
    }
}
