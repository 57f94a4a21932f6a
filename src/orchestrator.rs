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

//! Boot sequence of the miner.
//!
//! The sequence runs exactly once. Unknown hardware identity never stops the process:
//! the boot finishes in `BootOutcome::Degraded` with the mining tasks not started. A
//! failed network connection parks the boot in `AwaitingManualReconfiguration` until
//! the device is restarted, with the configuration server still serving.

use crate::logging::macros::*;

use crate::api::{ApiState, ConfigServer};
use crate::asic::{AsicSupport, Chain, Driver};
use crate::config::{Settings, Store};
use crate::context::{BoardClass, DeviceContext, DeviceModel, StatusWriter, WifiStatus};
use crate::error;
use crate::frontend::Frontend;
use crate::network::{ConnectOutcome, Connectivity};
use crate::power::Regulator;
use crate::serial::Transport;
use crate::tasks::{self, MiningStats, Spawner};
use crate::work::JobRegistry;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use std::sync::Arc;
use std::time::Duration;

/// How long the result of the self-test stays on the device
pub const SELF_TEST_HOLD: Duration = Duration::from_secs(60 * 60);
/// Delay before the enhanced power management takes over
pub const HEX_POWER_DELAY: Duration = Duration::from_secs(2);
/// Sleep period while waiting for manual reconfiguration
pub const RECONFIGURATION_POLL: Duration = Duration::from_secs(1);

const BUTTON_QUEUE_SIZE: usize = 4;

/// Tolerance of the core voltage read-back during the self-test
const SELF_TEST_VOLTAGE_TOLERANCE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BootState {
    LoadingConfiguration,
    ResolvingHardware,
    SelfTest,
    ConnectingNetwork,
    AwaitingManualReconfiguration,
    StartingServices,
    Mining,
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootOutcome {
    /// All tasks including the mining pipeline are running
    Mining,
    /// Running without the mining pipeline
    Degraded(String),
}

/// Hardware backends of the board
#[async_trait]
pub trait Platform: Send + Sync {
    async fn regulator(&self, model: DeviceModel, voltage_domain: u16) -> error::Result<Regulator>;

    /// Open the link to the chain at the initial baud rate
    async fn transport(&self) -> error::Result<Arc<dyn Transport>>;
}

/// Factory self-test
#[async_trait]
pub trait SelfTest: Send + Sync {
    /// Returns whether the test passed
    async fn run(&self, context: &DeviceContext, regulator: &Regulator) -> error::Result<bool>;
}

/// Self-test checking the regulator reaches the configured core voltage
pub struct RegulatorSelfTest;

#[async_trait]
impl SelfTest for RegulatorSelfTest {
    async fn run(&self, context: &DeviceContext, regulator: &Regulator) -> error::Result<bool> {
        let expected = context.core_voltage_mv as f32;
        regulator.set_core_voltage(expected / 1000.0).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let measured = regulator.get_core_voltage_mv().await? as f32;
        let passed = (measured - expected).abs() <= expected * SELF_TEST_VOLTAGE_TOLERANCE;
        info!(
            "Self test: core voltage {} mV, expected {} mV",
            measured, expected
        );
        Ok(passed)
    }
}

/// Collaborators of the boot sequence
pub struct Services {
    pub store: Arc<dyn Store>,
    pub platform: Arc<dyn Platform>,
    pub network: Arc<dyn Connectivity>,
    pub config_server: Arc<dyn ConfigServer>,
    pub spawner: Arc<dyn Spawner>,
    pub frontend: Arc<dyn Frontend>,
    pub self_test: Arc<dyn SelfTest>,
}

pub struct Orchestrator {
    services: Services,
    state: watch::Sender<BootState>,
    // keeps the state channel open when nobody subscribed
    _state_rx: watch::Receiver<BootState>,
}

impl Orchestrator {
    pub fn new(services: Services) -> Self {
        let (state, _state_rx) = watch::channel(BootState::LoadingConfiguration);
        Self {
            services,
            state,
            _state_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BootState> {
        self.state.subscribe()
    }

    fn enter(&self, state: BootState) {
        info!("Boot: {:?}", state);
        self.state.send_replace(state);
    }

    fn spawn<F>(&self, name: &'static str, priority: u8, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.services.spawner.spawn(name, priority, task.boxed());
    }

    /// Run the boot sequence. Errors are returned only for bus failures during
    /// mandatory initialization.
    pub async fn run(self) -> error::Result<BootOutcome> {
        let services = &self.services;

        self.enter(BootState::LoadingConfiguration);
        info!("Welcome to the axe!");
        let settings = Settings::load(services.store.as_ref());

        self.enter(BootState::ResolvingHardware);
        let (context, writers) = DeviceContext::build(&settings);
        let context = Arc::new(context);
        let regulator = Arc::new(
            services
                .platform
                .regulator(context.device_model, context.voltage_domain)
                .await?,
        );
        regulator.init().await?;

        if settings.self_test_requested()
            && context.asic.model().map_or(true, |model| model.supports_self_test())
        {
            self.enter(BootState::SelfTest);
            self.self_test(&context, &regulator, &writers.status).await;
        }

        let stats = Arc::new(MiningStats::new(settings.best_diff));
        self.spawn(
            "system",
            tasks::SYSTEM_TASK_PRIORITY,
            tasks::system_task(context.clone(), regulator.clone(), stats.clone()),
        );

        self.enter(BootState::ConnectingNetwork);
        let (buttons, button_rx) = mpsc::channel(BUTTON_QUEUE_SIZE);
        if let Err(e) = services
            .network
            .init(&settings.wifi_ssid, &settings.wifi_pass, &settings.hostname)
            .await
        {
            error!("Network initialization failed: {}", e);
        }
        let api_state = ApiState {
            context: context.clone(),
            store: services.store.clone(),
            stats: stats.clone(),
            boot_state: self.subscribe(),
            buttons,
        };
        if let Err(e) = services.config_server.start(api_state).await {
            error!("Configuration server failed to start: {}", e);
        }
        match services.network.connect(&writers.status).await {
            ConnectOutcome::Connected => {
                info!("Connected to network {}", context.ssid);
                writers.status.set_wifi_status(WifiStatus::Connected);
            }
            outcome => {
                let status = match outcome {
                    ConnectOutcome::Failed => WifiStatus::Failed,
                    _ => WifiStatus::Unexpected,
                };
                error!("Network connection failed: {}", status);
                writers.status.set_wifi_status(status);
                self.enter(BootState::AwaitingManualReconfiguration);
                loop {
                    tokio::time::sleep(RECONFIGURATION_POLL).await;
                }
            }
        }
        writers.startup.mark_complete();

        self.enter(BootState::StartingServices);
        self.spawn(
            "user_input",
            tasks::USER_INPUT_TASK_PRIORITY,
            tasks::user_input_task(context.clone(), services.store.clone(), button_rx),
        );

        match context.board_class {
            BoardClass::Hex => {
                tokio::time::sleep(HEX_POWER_DELAY).await;
                self.spawn(
                    "power_management",
                    tasks::POWER_MANAGEMENT_TASK_PRIORITY,
                    tasks::power_management_hex_task(
                        context.clone(),
                        regulator.clone(),
                        writers.frequency,
                    ),
                );
            }
            BoardClass::Standard => self.spawn(
                "power_management",
                tasks::POWER_MANAGEMENT_TASK_PRIORITY,
                tasks::power_management_task(context.clone(), regulator.clone(), writers.frequency),
            ),
        }

        let model = match &context.asic {
            AsicSupport::Supported(model) => *model,
            AsicSupport::Unsupported(name) => {
                let reason = format!("unsupported ASIC model '{}'", name);
                error!("Mining tasks not started: {}", reason);
                writers.status.set_system_status("Invalid ASIC model");
                self.enter(BootState::Degraded);
                return Ok(BootOutcome::Degraded(reason));
            }
        };

        if let Err(e) = services.network.disable_access_point().await {
            warn!("Cannot disable access point: {}", e);
        }
        let (notify_tx, notify_rx) = mpsc::channel(tasks::QUEUE_SIZE);
        let (job_tx, job_rx) = mpsc::channel(tasks::QUEUE_SIZE);
        let registry = Arc::new(JobRegistry::new());

        let transport = services.platform.transport().await?;
        let chain = Arc::new(Chain::new(model, transport.clone()));
        chain
            .init(context.core_frequency_mhz(), context.asic_count)
            .await?;
        let baud = chain.configure_max_baud().await?;
        transport.set_baud(baud).await?;
        transport.clear_buffer().await?;

        self.spawn(
            "stratum",
            tasks::STRATUM_TASK_PRIORITY,
            tasks::stratum_task(services.frontend.clone(), notify_tx),
        );
        self.spawn(
            "create_jobs",
            tasks::CREATE_JOBS_TASK_PRIORITY,
            tasks::create_jobs_task(notify_rx, job_tx, registry.clone()),
        );
        self.spawn(
            "asic",
            tasks::ASIC_TASK_PRIORITY,
            tasks::asic_task(
                context.clone(),
                chain.clone(),
                job_rx,
                registry.clone(),
                stats.clone(),
            ),
        );
        self.spawn(
            "asic_result",
            tasks::ASIC_RESULT_TASK_PRIORITY,
            tasks::asic_result_task(
                chain,
                transport,
                registry,
                services.frontend.clone(),
                services.store.clone(),
                stats,
            ),
        );

        self.enter(BootState::Mining);
        Ok(BootOutcome::Mining)
    }

    async fn self_test(&self, context: &DeviceContext, regulator: &Regulator, status: &StatusWriter) {
        info!("Running self test");
        let passed = match self.services.self_test.run(context, regulator).await {
            Ok(passed) => passed,
            Err(e) => {
                error!("Self test failed: {}", e);
                false
            }
        };
        status.set_system_status(if passed {
            "SELF TEST PASS"
        } else {
            "SELF TEST FAIL"
        });
        info!("Self test {}", if passed { "passed" } else { "failed" });
        tokio::time::sleep(SELF_TEST_HOLD).await;
    }
}
