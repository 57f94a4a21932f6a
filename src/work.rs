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

//! Mining work flowing through the pipeline: pool notifications, jobs for the chain,
//! results coming back and the shares derived from them

use crate::asic::bm13xx;

use bitcoin_hashes::{sha256, sha256d, Hash, HashEngine};
use byteorder::{ByteOrder, LittleEndian};

use std::sync::{Arc, Mutex};

/// Hardware job ids are 7-bit
pub const MAX_JOB_ID: usize = 128;

/// Number of midstates prepared for chips rolling versions through midstates
pub const ASIC_BOOST_MIDSTATE_COUNT: usize = 4;

/// Difficulty 1 target expressed as a float (0xffff * 2^208)
const TRUE_DIFF_ONE: f64 = 26959535291011309493156476344723991336010898738574164086137773096960.0;

/// Contents of a pool job notification
#[derive(Debug, Clone, PartialEq)]
pub struct MiningNotify {
    pub job_id: String,
    /// Previous block hash in block header byte order
    pub prev_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub version_mask: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
    pub extranonce1: Vec<u8>,
    pub extranonce2_len: usize,
    /// Share difficulty requested by the pool
    pub difficulty: u32,
}

impl MiningNotify {
    /// Coinbase with the extranonces inserted
    pub fn coinbase(&self, extranonce2: &[u8]) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(
            self.coinbase1.len() + self.extranonce1.len() + extranonce2.len() + self.coinbase2.len(),
        );
        coinbase.extend_from_slice(&self.coinbase1);
        coinbase.extend_from_slice(&self.extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&self.coinbase2);
        coinbase
    }

    pub fn merkle_root(&self, extranonce2: &[u8]) -> [u8; 32] {
        let mut root = sha256d::Hash::hash(&self.coinbase(extranonce2)).to_byte_array();
        for branch in self.merkle_branches.iter() {
            let mut node = [0u8; 64];
            node[..32].copy_from_slice(&root);
            node[32..].copy_from_slice(branch);
            root = sha256d::Hash::hash(&node).to_byte_array();
        }
        root
    }

    /// Extranonce2 rendered to its fixed little endian width
    pub fn extranonce2_bytes(&self, extranonce2: u64) -> Vec<u8> {
        let mut bytes = extranonce2.to_le_bytes().to_vec();
        bytes.resize(self.extranonce2_len, 0);
        bytes
    }

    /// Build job for the chain
    pub fn build_job(&self, extranonce2: u64) -> AsicJob {
        let extranonce2 = self.extranonce2_bytes(extranonce2);
        AsicJob::new(
            self.job_id.clone(),
            extranonce2.clone(),
            self.version,
            self.version_mask,
            self.prev_hash,
            self.merkle_root(&extranonce2),
            self.ntime,
            self.nbits,
            self.difficulty,
        )
    }
}

/// Work prepared for the chain
#[derive(Debug, Clone, PartialEq)]
pub struct AsicJob {
    pub pool_job_id: String,
    pub extranonce2: Vec<u8>,
    pub version: u32,
    pub version_mask: u32,
    pub prev_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub starting_nonce: u32,
    pub pool_difficulty: u32,
    /// SHA-256 midstates of the first header chunk, one per rolled version
    pub midstates: Vec<[u8; 32]>,
}

impl AsicJob {
    pub fn new(
        pool_job_id: String,
        extranonce2: Vec<u8>,
        version: u32,
        version_mask: u32,
        prev_hash: [u8; 32],
        merkle_root: [u8; 32],
        ntime: u32,
        nbits: u32,
        pool_difficulty: u32,
    ) -> Self {
        let mut job = Self {
            pool_job_id,
            extranonce2,
            version,
            version_mask,
            prev_hash,
            merkle_root,
            ntime,
            nbits,
            starting_nonce: 0,
            pool_difficulty,
            midstates: Vec::new(),
        };
        let count = if version_mask == 0 {
            1
        } else {
            ASIC_BOOST_MIDSTATE_COUNT
        };
        let mut rolled = version;
        for _ in 0..count {
            job.midstates.push(job.midstate(rolled));
            rolled = bm13xx::increment_bitmask(rolled, version_mask);
        }
        job
    }

    /// 80-byte block header for the given version and nonce
    pub fn header(&self, version: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        LittleEndian::write_u32(&mut header[0..4], version);
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(&self.merkle_root);
        LittleEndian::write_u32(&mut header[68..72], self.ntime);
        LittleEndian::write_u32(&mut header[72..76], self.nbits);
        LittleEndian::write_u32(&mut header[76..80], nonce);
        header
    }

    /// SHA-256 state after the first 64 bytes of the header
    pub fn midstate(&self, version: u32) -> [u8; 32] {
        let header = self.header(version, 0);
        let mut engine = sha256::Hash::engine();
        engine.input(&header[..64]);
        engine.midstate().to_byte_array()
    }

    /// Difficulty of the share found with given version and nonce
    pub fn share_difficulty(&self, version: u32, nonce: u32) -> f64 {
        let hash = sha256d::Hash::hash(&self.header(version, nonce)).to_byte_array();
        // the hash is a little endian 256-bit number
        let value = hash
            .iter()
            .rev()
            .fold(0f64, |acc, byte| acc * 256.0 + *byte as f64);
        if value == 0.0 {
            return f64::INFINITY;
        }
        TRUE_DIFF_ONE / value
    }
}

/// How the chain reports which version it rolled
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VersionRoll {
    /// Bits to be or-ed into the job version
    Bits(u32),
    /// Index of the midstate the nonce was found in
    Midstate(u8),
}

/// Nonce reported by the chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsicResult {
    pub job_id: u8,
    pub nonce: u32,
    pub version: VersionRoll,
}

impl AsicResult {
    pub fn rolled_version(&self, job: &AsicJob) -> u32 {
        match self.version {
            VersionRoll::Bits(bits) => job.version | bits,
            VersionRoll::Midstate(index) => (0..index).fold(job.version, |version, _| {
                bm13xx::increment_bitmask(version, job.version_mask)
            }),
        }
    }
}

/// Share to be submitted to the pool
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub pool_job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub version: u32,
    pub difficulty: f64,
}

/// Jobs in flight indexed by hardware job id
#[derive(Default)]
pub struct JobRegistry {
    slots: Mutex<Vec<Option<Arc<AsicJob>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![None; MAX_JOB_ID]),
        }
    }

    pub fn insert(&self, job_id: u8, job: Arc<AsicJob>) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(job_id as usize) {
                *slot = Some(job);
            }
        }
    }

    pub fn get(&self, job_id: u8) -> Option<Arc<AsicJob>> {
        self.slots.lock().ok()?.get(job_id as usize)?.clone()
    }

    /// Invalidate all jobs, used when the pool asks to drop stale work
    pub fn clear(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.iter_mut().for_each(|slot| *slot = None);
        }
    }
}
