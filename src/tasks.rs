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

//! Long running tasks of the miner and the way they are spawned.
//!
//! Work flows from the frontend through two bounded queues: pool notifications go to the
//! job builder, finished jobs go to the task feeding the chain. Results are read back by
//! a separate task which validates them against the jobs in flight.

use crate::logging::macros::*;

use crate::asic::{receive_frame, Chain, Driver};
use crate::config::{keys, Store};
use crate::context::{DeviceContext, FrequencyWriter};
use crate::error;
use crate::frontend::Frontend;
use crate::power::Regulator;
use crate::serial::Transport;
use crate::work::{AsicJob, JobRegistry, MiningNotify, Share};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Capacity of both handoff queues
pub const QUEUE_SIZE: usize = 12;

pub const SYSTEM_TASK_PRIORITY: u8 = 3;
pub const USER_INPUT_TASK_PRIORITY: u8 = 5;
pub const POWER_MANAGEMENT_TASK_PRIORITY: u8 = 10;
pub const STRATUM_TASK_PRIORITY: u8 = 5;
pub const CREATE_JOBS_TASK_PRIORITY: u8 = 10;
pub const ASIC_TASK_PRIORITY: u8 = 10;
pub const ASIC_RESULT_TASK_PRIORITY: u8 = 15;

/// How often the system task reports
const SYSTEM_TICK: Duration = Duration::from_secs(5);
/// How often the power management loops run
const POWER_TICK: Duration = Duration::from_secs(2);
/// Wait before retrying a failed frontend request
const FRONTEND_RETRY_DELAY: Duration = Duration::from_secs(5);
/// How long to wait for a result frame before polling again
const RESULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Regulator temperature above which the core frequency is reduced
pub const THROTTLE_TEMPERATURE: f32 = 75.0;
/// Frequency step used when throttling
pub const THROTTLE_STEP_MHZ: u16 = 25;
/// Never throttle below this frequency
pub const MIN_FREQUENCY_MHZ: u16 = 100;

/// Starts tasks. Tokio has no task priorities, the priority is kept for diagnostics.
pub trait Spawner: Send + Sync {
    fn spawn(&self, name: &'static str, priority: u8, task: BoxFuture<'static, ()>);
}

pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, name: &'static str, priority: u8, task: BoxFuture<'static, ()>) {
        info!("Starting task {} (priority {})", name, priority);
        tokio::spawn(task);
    }
}

/// Events of the user button
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ButtonEvent {
    /// Show current status
    ShortPress,
    /// Forget network credentials
    LongPress,
}

#[derive(Default)]
struct StatsInner {
    started: Option<Instant>,
    /// Sum of difficulty of all nonces received from the chain
    work: f64,
    best_difficulty: f64,
}

/// Mining statistics shared between the result task and reporting
#[derive(Default)]
pub struct MiningStats {
    inner: Mutex<StatsInner>,
    nonces: AtomicU64,
    shares_submitted: AtomicU64,
    shares_failed: AtomicU64,
    /// Difficulty the chips currently report nonces at
    asic_difficulty: AtomicU32,
}

impl MiningStats {
    pub fn new(best_difficulty: u64) -> Self {
        let stats = Self::default();
        if let Ok(mut inner) = stats.inner.lock() {
            inner.best_difficulty = best_difficulty as f64;
        }
        stats
    }

    pub fn set_asic_difficulty(&self, difficulty: u32) {
        self.asic_difficulty.store(difficulty, Ordering::Relaxed);
    }

    pub fn nonces(&self) -> u64 {
        self.nonces.load(Ordering::Relaxed)
    }

    pub fn shares_submitted(&self) -> u64 {
        self.shares_submitted.load(Ordering::Relaxed)
    }

    pub fn shares_failed(&self) -> u64 {
        self.shares_failed.load(Ordering::Relaxed)
    }

    pub fn best_difficulty(&self) -> f64 {
        self.inner
            .lock()
            .map(|inner| inner.best_difficulty)
            .unwrap_or(0.0)
    }

    /// Account nonce, returns true when it beats the best difficulty seen so far
    fn record_nonce(&self, difficulty: f64) -> bool {
        self.nonces.fetch_add(1, Ordering::Relaxed);
        let asic_difficulty = self.asic_difficulty.load(Ordering::Relaxed).max(1) as f64;
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.started.get_or_insert_with(Instant::now);
                inner.work += asic_difficulty;
                if difficulty > inner.best_difficulty {
                    inner.best_difficulty = difficulty;
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Estimated hash rate in GH/s
    pub fn hashrate_ghs(&self) -> f64 {
        match self.inner.lock() {
            Ok(inner) => match inner.started {
                Some(started) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    if elapsed > 0.0 {
                        inner.work * 4_294_967_296.0 / elapsed / 1e9
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            },
            Err(_) => 0.0,
        }
    }
}

/// Periodic status report
pub async fn system_task(
    context: Arc<DeviceContext>,
    regulator: Arc<Regulator>,
    stats: Arc<MiningStats>,
) {
    loop {
        tokio::time::sleep(SYSTEM_TICK).await;
        let vcore = match regulator.get_core_voltage_mv().await {
            Ok(mv) => mv.to_string(),
            Err(e) => {
                debug!("Cannot read core voltage: {}", e);
                "?".to_string()
            }
        };
        info!(
            "Status: {:.2} GH/s, {} nonces, {} shares, best {:.0}, {} MHz, Vcore {} mV, wifi '{}'",
            stats.hashrate_ghs(),
            stats.nonces(),
            stats.shares_submitted(),
            stats.best_difficulty(),
            context.core_frequency_mhz(),
            vcore,
            context.wifi_status()
        );
    }
}

/// React to one button event
pub fn handle_button(context: &DeviceContext, store: &dyn Store, event: ButtonEvent) {
    match event {
        ButtonEvent::ShortPress => info!(
            "Device {} ({}), {} MHz, SSID '{}', wifi '{}', system '{}'",
            context.device_model,
            context.hostname,
            context.core_frequency_mhz(),
            context.ssid,
            context.wifi_status(),
            context.system_status()
        ),
        ButtonEvent::LongPress => {
            for key in [keys::WIFI_SSID, keys::WIFI_PASS].iter() {
                if let Err(e) = store.erase(key) {
                    error!("Cannot erase {}: {}", key, e);
                }
            }
            warn!("Network credentials cleared, restart to reconfigure");
        }
    }
}

pub async fn user_input_task(
    context: Arc<DeviceContext>,
    store: Arc<dyn Store>,
    mut events: mpsc::Receiver<ButtonEvent>,
) {
    while let Some(event) = events.recv().await {
        debug!("Button: {:?}", event);
        handle_button(&context, store.as_ref(), event);
    }
    debug!("Button event source closed");
}

/// Standard boards: apply the configured core voltage once and watch the read-back
pub async fn power_management_task(
    context: Arc<DeviceContext>,
    regulator: Arc<Regulator>,
    frequency: FrequencyWriter,
) {
    let volts = context.core_voltage_mv as f32 / 1000.0;
    if let Err(e) = regulator.set_core_voltage(volts).await {
        warn!("Cannot set core voltage to {:.3}V: {}", volts, e);
    }
    loop {
        tokio::time::sleep(POWER_TICK).await;
        match regulator.get_core_voltage_mv().await {
            Ok(mv) => trace!("Vcore {} mV at {} MHz", mv, frequency.get()),
            Err(e) => trace!("Cannot read core voltage: {}", e),
        }
    }
}

/// New frequency after one temperature sample, `None` when it stays
pub fn throttle(temperature: f32, frequency_mhz: u16) -> Option<u16> {
    if temperature > THROTTLE_TEMPERATURE && frequency_mhz > MIN_FREQUENCY_MHZ {
        Some(
            frequency_mhz
                .saturating_sub(THROTTLE_STEP_MHZ)
                .max(MIN_FREQUENCY_MHZ),
        )
    } else {
        None
    }
}

/// Boards with the digital regulator: telemetry and thermal throttling
pub async fn power_management_hex_task(
    context: Arc<DeviceContext>,
    regulator: Arc<Regulator>,
    frequency: FrequencyWriter,
) {
    info!(
        "Enhanced power management on board revision {}",
        context.board_revision
    );
    loop {
        tokio::time::sleep(POWER_TICK).await;
        let temperature = match regulator.read_temperature().await {
            Ok(Some(temperature)) => temperature,
            Ok(None) => continue,
            Err(e) => {
                warn!("Regulator temperature read failed: {}", e);
                continue;
            }
        };
        match regulator.read_vout_mv().await {
            Ok(Some(mv)) => debug!("Regulator {:.1} C, Vout {} mV", temperature, mv),
            Ok(None) => {}
            Err(e) => warn!("Regulator Vout read failed: {}", e),
        }
        if let Some(throttled) = throttle(temperature, frequency.get()) {
            warn!(
                "Regulator at {:.1} C, reducing frequency to {} MHz",
                temperature, throttled
            );
            frequency.set(throttled);
        }
    }
}

/// Pass pool notifications to the job builder
pub async fn stratum_task(frontend: Arc<dyn Frontend>, queue: mpsc::Sender<MiningNotify>) {
    loop {
        match frontend.next_notify().await {
            Ok(notify) => {
                debug!("New pool job {}", notify.job_id);
                if queue.send(notify).await.is_err() {
                    debug!("Stratum queue closed");
                    return;
                }
            }
            Err(e) => {
                warn!("Frontend failed: {}", e);
                tokio::time::sleep(FRONTEND_RETRY_DELAY).await;
            }
        }
    }
}

/// Build jobs from the latest notification until a newer one arrives
pub async fn create_jobs_task(
    mut notifies: mpsc::Receiver<MiningNotify>,
    jobs: mpsc::Sender<AsicJob>,
    registry: Arc<JobRegistry>,
) {
    let mut current = match notifies.recv().await {
        Some(notify) => notify,
        None => return,
    };
    let mut extranonce2: u64 = 0;
    loop {
        match notifies.try_recv() {
            Ok(notify) => {
                if notify.clean_jobs {
                    registry.clear();
                }
                current = notify;
                extranonce2 = 0;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("Stratum queue closed");
                return;
            }
        }
        let job = current.build_job(extranonce2);
        extranonce2 = extranonce2.wrapping_add(1);
        if jobs.send(job).await.is_err() {
            debug!("Job queue closed");
            return;
        }
    }
}

/// Feed jobs to the chain at the job cadence
pub async fn asic_task(
    context: Arc<DeviceContext>,
    chain: Arc<Chain>,
    mut jobs: mpsc::Receiver<AsicJob>,
    registry: Arc<JobRegistry>,
    stats: Arc<MiningStats>,
) {
    let cadence = match Duration::try_from_secs_f64(context.job_cadence_ms / 1000.0) {
        Ok(cadence) => cadence,
        Err(e) => {
            error!("Invalid job cadence {} ms: {}", context.job_cadence_ms, e);
            return;
        }
    };
    let mut difficulty = context.initial_difficulty;
    stats.set_asic_difficulty(difficulty);
    info!("Sending jobs every {:?}", cadence);

    while let Some(job) = jobs.recv().await {
        if job.pool_difficulty != difficulty && job.pool_difficulty > 0 {
            match chain.set_difficulty_mask(job.pool_difficulty).await {
                Ok(()) => {
                    difficulty = job.pool_difficulty;
                    stats.set_asic_difficulty(difficulty);
                }
                Err(e) => warn!("Cannot set difficulty {}: {}", job.pool_difficulty, e),
            }
        }
        let job = Arc::new(job);
        match chain.submit_work(&job).await {
            Ok(job_id) => registry.insert(job_id, job),
            Err(e) => error!("Cannot submit job: {}", e),
        }
        tokio::time::sleep(cadence).await;
    }
    debug!("Job queue closed");
}

/// Validate one result frame, returns the share to submit if it meets the pool target
pub fn process_result(
    chain: &Chain,
    frame: &[u8],
    registry: &JobRegistry,
    stats: &MiningStats,
    store: &dyn Store,
) -> Option<Share> {
    let result = match chain.receive_result(frame) {
        Some(result) => result,
        None => {
            trace!("Ignoring frame {:02x?}", frame);
            return None;
        }
    };
    let job = match registry.get(result.job_id) {
        Some(job) => job,
        None => {
            warn!("Result for unknown job {:#04x}", result.job_id);
            return None;
        }
    };
    let version = result.rolled_version(&job);
    let difficulty = job.share_difficulty(version, result.nonce);
    debug!(
        "Nonce {:#010x} of job {:#04x}, difficulty {:.1} of {}",
        result.nonce, result.job_id, difficulty, job.pool_difficulty
    );

    if stats.record_nonce(difficulty) {
        info!("New best difficulty {:.0}", difficulty);
        if let Err(e) = store.set_u64(keys::BEST_DIFF, difficulty as u64) {
            warn!("Cannot persist best difficulty: {}", e);
        }
    }
    if difficulty >= job.pool_difficulty as f64 {
        Some(Share {
            pool_job_id: job.pool_job_id.clone(),
            extranonce2: job.extranonce2.clone(),
            ntime: job.ntime,
            nonce: result.nonce,
            version,
            difficulty,
        })
    } else {
        None
    }
}

/// Read results from the chain and submit shares
pub async fn asic_result_task(
    chain: Arc<Chain>,
    transport: Arc<dyn Transport>,
    registry: Arc<JobRegistry>,
    frontend: Arc<dyn Frontend>,
    store: Arc<dyn Store>,
    stats: Arc<MiningStats>,
) {
    loop {
        let frame = match receive_frame(transport.as_ref(), chain.result_len(), RESULT_TIMEOUT)
            .await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                error!("Cannot read from the chain: {}", e);
                tokio::time::sleep(FRONTEND_RETRY_DELAY).await;
                continue;
            }
        };
        if let Some(share) = process_result(&chain, &frame, &registry, &stats, store.as_ref()) {
            if let Err(e) = submit_share(frontend.as_ref(), &stats, share).await {
                warn!("Share submission failed: {}", e);
            }
        }
    }
}

async fn submit_share(
    frontend: &dyn Frontend,
    stats: &MiningStats,
    share: Share,
) -> error::Result<()> {
    let result = frontend.submit_share(share).await;
    match &result {
        Ok(()) => stats.shares_submitted.fetch_add(1, Ordering::Relaxed),
        Err(_) => stats.shares_failed.fetch_add(1, Ordering::Relaxed),
    };
    result
}
