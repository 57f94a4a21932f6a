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

//! Boot sequence driven end to end with fake hardware

use axeminer::api::{ApiState, ConfigServer};
use axeminer::config::{keys, Entry, MemoryStore};
use axeminer::context::{DeviceModel, StatusWriter};
use axeminer::error;
use axeminer::frontend::BenchmarkFrontend;
use axeminer::network::{ConnectOutcome, Connectivity};
use axeminer::orchestrator::{
    BootOutcome, BootState, Orchestrator, Platform, SelfTest, Services,
};
use axeminer::power::{NullAdc, Regulator, Strategy};
use axeminer::serial::Transport;
use axeminer::tasks::{self, Spawner};

use async_trait::async_trait;
use futures::future::BoxFuture;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Sent(Vec<u8>),
    Baud(u32),
    Cleared,
    Spawned(&'static str, u8),
}

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Chain link without any chips answering
struct SilentTransport {
    log: EventLog,
}

#[async_trait]
impl Transport for SilentTransport {
    async fn send(&self, frame: &[u8]) -> error::Result<()> {
        self.log.lock().unwrap().push(Event::Sent(frame.to_vec()));
        Ok(())
    }

    async fn receive(&self, _len: usize, _timeout: Duration) -> error::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set_baud(&self, baud: u32) -> error::Result<()> {
        self.log.lock().unwrap().push(Event::Baud(baud));
        Ok(())
    }

    async fn clear_buffer(&self) -> error::Result<()> {
        self.log.lock().unwrap().push(Event::Cleared);
        Ok(())
    }
}

/// Records spawned tasks without running them
struct RecordingSpawner {
    log: EventLog,
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, name: &'static str, priority: u8, _task: BoxFuture<'static, ()>) {
        self.log.lock().unwrap().push(Event::Spawned(name, priority));
    }
}

struct FakePlatform {
    log: EventLog,
}

#[async_trait]
impl Platform for FakePlatform {
    async fn regulator(&self, _model: DeviceModel, voltage_domain: u16) -> error::Result<Regulator> {
        Ok(Regulator::new(
            Strategy::Unavailable,
            Box::new(NullAdc),
            voltage_domain,
        ))
    }

    async fn transport(&self) -> error::Result<Arc<dyn Transport>> {
        Ok(Arc::new(SilentTransport {
            log: self.log.clone(),
        }))
    }
}

struct FakeNetwork {
    outcome: ConnectOutcome,
    access_point_disabled: AtomicUsize,
}

impl FakeNetwork {
    fn new(outcome: ConnectOutcome) -> Self {
        Self {
            outcome,
            access_point_disabled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connectivity for FakeNetwork {
    async fn init(&self, _ssid: &str, _password: &str, _hostname: &str) -> error::Result<()> {
        Ok(())
    }

    async fn connect(&self, _status: &StatusWriter) -> ConnectOutcome {
        self.outcome
    }

    async fn disable_access_point(&self) -> error::Result<()> {
        self.access_point_disabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps the state handed to the server for inspection
#[derive(Default)]
struct FakeConfigServer {
    state: Mutex<Option<ApiState>>,
}

impl FakeConfigServer {
    fn state(&self) -> ApiState {
        self.state.lock().unwrap().clone().expect("server not started")
    }
}

#[async_trait]
impl ConfigServer for FakeConfigServer {
    async fn start(&self, state: ApiState) -> error::Result<()> {
        self.state.lock().unwrap().replace(state);
        Ok(())
    }
}

#[derive(Default)]
struct CountingSelfTest {
    runs: AtomicUsize,
}

#[async_trait]
impl SelfTest for CountingSelfTest {
    async fn run(&self, _context: &axeminer::context::DeviceContext, _regulator: &Regulator) -> error::Result<bool> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct Harness {
    log: EventLog,
    network: Arc<FakeNetwork>,
    config_server: Arc<FakeConfigServer>,
    self_test: Arc<CountingSelfTest>,
}

impl Harness {
    fn new(entries: Vec<(&'static str, Entry)>, outcome: ConnectOutcome) -> (Self, Orchestrator) {
        let log: EventLog = Default::default();
        let network = Arc::new(FakeNetwork::new(outcome));
        let config_server = Arc::new(FakeConfigServer::default());
        let self_test = Arc::new(CountingSelfTest::default());
        let services = Services {
            store: Arc::new(MemoryStore::with_entries(entries)),
            platform: Arc::new(FakePlatform { log: log.clone() }),
            network: network.clone(),
            config_server: config_server.clone(),
            spawner: Arc::new(RecordingSpawner { log: log.clone() }),
            frontend: Arc::new(BenchmarkFrontend::default()),
            self_test: self_test.clone(),
        };
        let harness = Self {
            log,
            network,
            config_server,
            self_test,
        };
        (harness, Orchestrator::new(services))
    }

    fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    fn spawned(&self) -> Vec<(&'static str, u8)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Spawned(name, priority) => Some((name, priority)),
                _ => None,
            })
            .collect()
    }
}

fn text(value: &str) -> Entry {
    Entry::Text(value.to_string())
}

fn ultra_settings(asic: &str) -> Vec<(&'static str, Entry)> {
    vec![
        (keys::DEVICE_MODEL, text("ultra")),
        (keys::BOARD_VERSION, text("204")),
        (keys::ASIC_MODEL, text(asic)),
        (keys::ASIC_FREQUENCY, Entry::Int(485)),
        (keys::ASIC_COUNT, Entry::Int(1)),
    ]
}

#[tokio::test]
async fn test_boot_starts_mining_after_chain_setup() {
    let (harness, orchestrator) = Harness::new(ultra_settings("BM1366"), ConnectOutcome::Connected);
    let state = orchestrator.subscribe();
    let outcome = orchestrator.run().await.expect("boot failed");
    assert_eq!(outcome, BootOutcome::Mining);
    assert_eq!(*state.borrow(), BootState::Mining);

    assert_eq!(
        harness.spawned(),
        vec![
            ("system", tasks::SYSTEM_TASK_PRIORITY),
            ("user_input", tasks::USER_INPUT_TASK_PRIORITY),
            ("power_management", tasks::POWER_MANAGEMENT_TASK_PRIORITY),
            ("stratum", 5),
            ("create_jobs", 10),
            ("asic", 10),
            ("asic_result", 15),
        ]
    );

    // chain is initialized and switched to full speed before mining tasks start
    let events = harness.events();
    let baud = events
        .iter()
        .position(|event| *event == Event::Baud(1_000_000))
        .expect("baud rate not changed");
    let last_frame = events
        .iter()
        .rposition(|event| matches!(event, Event::Sent(_)))
        .expect("no frames sent");
    let stratum = events
        .iter()
        .position(|event| *event == Event::Spawned("stratum", 5))
        .expect("stratum not spawned");
    assert!(last_frame < baud);
    assert_eq!(events[baud + 1], Event::Cleared);
    assert!(baud + 1 < stratum);

    assert_eq!(harness.network.access_point_disabled.load(Ordering::SeqCst), 1);
    let api_state = harness.config_server.state();
    assert!(api_state.context.startup_complete());
    assert_eq!(api_state.context.wifi_status(), "Connected!");
}

#[tokio::test]
async fn test_boot_degrades_on_unknown_asic() {
    let (harness, orchestrator) = Harness::new(ultra_settings("BM9999"), ConnectOutcome::Connected);
    let state = orchestrator.subscribe();
    let outcome = orchestrator.run().await.expect("boot failed");
    assert!(matches!(outcome, BootOutcome::Degraded(_)));
    assert_eq!(*state.borrow(), BootState::Degraded);

    let names: Vec<_> = harness.spawned().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["system", "user_input", "power_management"]);
    assert!(!harness
        .events()
        .iter()
        .any(|event| matches!(event, Event::Sent(_) | Event::Baud(_))));
    assert_eq!(harness.network.access_point_disabled.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.config_server.state().context.system_status(),
        "Invalid ASIC model"
    );
}

#[tokio::test(start_paused = true)]
async fn test_boot_parks_when_network_fails() {
    let (harness, orchestrator) = Harness::new(ultra_settings("BM1366"), ConnectOutcome::Failed);
    let state = orchestrator.subscribe();
    let result =
        tokio::time::timeout(Duration::from_secs(600), orchestrator.run()).await;
    assert!(result.is_err(), "boot must wait for manual reconfiguration");
    assert_eq!(*state.borrow(), BootState::AwaitingManualReconfiguration);

    let names: Vec<_> = harness.spawned().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["system"]);
    let api_state = harness.config_server.state();
    assert!(!api_state.context.startup_complete());
    assert_eq!(api_state.context.wifi_status(), "Failed to connect");
}

#[tokio::test(start_paused = true)]
async fn test_boot_parks_on_unexpected_network_error() {
    let (harness, orchestrator) =
        Harness::new(ultra_settings("BM1366"), ConnectOutcome::Unexpected);
    let state = orchestrator.subscribe();
    let result =
        tokio::time::timeout(Duration::from_secs(600), orchestrator.run()).await;
    assert!(result.is_err(), "boot must wait for manual reconfiguration");
    assert_eq!(*state.borrow(), BootState::AwaitingManualReconfiguration);

    let names: Vec<_> = harness.spawned().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["system"]);
    let api_state = harness.config_server.state();
    assert!(!api_state.context.startup_complete());
    assert_eq!(api_state.context.wifi_status(), "unexpected error");
}

#[tokio::test(start_paused = true)]
async fn test_hex_board_delays_power_management() {
    let entries = vec![
        (keys::DEVICE_MODEL, text("hex")),
        (keys::BOARD_VERSION, text("302")),
        (keys::ASIC_MODEL, text("BM1366")),
        (keys::ASIC_COUNT, Entry::Int(6)),
        (keys::VOLTAGE_DOMAIN, Entry::Int(3)),
    ];
    let (harness, orchestrator) = Harness::new(entries, ConnectOutcome::Connected);
    let started = tokio::time::Instant::now();
    let outcome = orchestrator.run().await.expect("boot failed");
    assert_eq!(outcome, BootOutcome::Mining);
    assert!(started.elapsed() >= axeminer::orchestrator::HEX_POWER_DELAY);

    let names: Vec<_> = harness.spawned().into_iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        vec![
            "system",
            "user_input",
            "power_management",
            "stratum",
            "create_jobs",
            "asic",
            "asic_result"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_self_test_skipped_for_bm1397() {
    let mut entries = ultra_settings("BM1397");
    entries.push((keys::SELF_TEST, Entry::Int(1)));
    let (harness, orchestrator) = Harness::new(entries, ConnectOutcome::Connected);
    let outcome = orchestrator.run().await.expect("boot failed");
    assert_eq!(outcome, BootOutcome::Mining);
    assert_eq!(harness.self_test.runs.load(Ordering::SeqCst), 0);
    // BM1397 runs at the higher baud rate
    assert!(harness.events().contains(&Event::Baud(3_125_000)));
}

#[tokio::test(start_paused = true)]
async fn test_self_test_reports_result() {
    let mut entries = ultra_settings("BM1366");
    entries.push((keys::SELF_TEST, Entry::Int(1)));
    let (harness, orchestrator) = Harness::new(entries, ConnectOutcome::Connected);
    let started = tokio::time::Instant::now();
    orchestrator.run().await.expect("boot failed");
    assert_eq!(harness.self_test.runs.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= axeminer::orchestrator::SELF_TEST_HOLD);
    assert_eq!(
        harness.config_server.state().context.system_status(),
        "SELF TEST PASS"
    );
}
