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

use axeminer::logging::macros::*;

use axeminer::api::ApiServer;
use axeminer::async_i2c::AsyncI2cBus;
use axeminer::config::{self, DaemonConfig, Entry, FileStore, Store};
use axeminer::context::DeviceModel;
use axeminer::error::{self, ErrorKind};
use axeminer::frontend::BenchmarkFrontend;
use axeminer::logging;
use axeminer::network::HostNetwork;
use axeminer::orchestrator::{
    BootOutcome, Orchestrator, Platform, RegulatorSelfTest, Services,
};
use axeminer::power::{AdcSense, IioAdc, NullAdc, Regulator, Strategy};
use axeminer::serial::{SerialTransport, Transport};
use axeminer::tasks::TokioSpawner;

use async_trait::async_trait;

use std::path::Path;
use std::sync::Arc;

/// Board peripherals reachable through Linux device nodes
struct LinuxPlatform {
    config: DaemonConfig,
}

#[cfg(target_os = "linux")]
fn open_i2c(path: &Path) -> error::Result<AsyncI2cBus> {
    AsyncI2cBus::open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_i2c(path: &Path) -> error::Result<AsyncI2cBus> {
    Err(ErrorKind::I2c(format!(
        "cannot open {}: I2C character devices require Linux",
        path.display()
    )))?
}

#[async_trait]
impl Platform for LinuxPlatform {
    async fn regulator(&self, model: DeviceModel, voltage_domain: u16) -> error::Result<Regulator> {
        let adc: Box<dyn AdcSense> = if self.config.adc_path.exists() {
            Box::new(IioAdc::open(&self.config.adc_path).await)
        } else {
            warn!(
                "ADC channel {} not found, core voltage readback disabled",
                self.config.adc_path.display()
            );
            Box::new(NullAdc)
        };
        if !model.is_valid() {
            return Ok(Regulator::new(Strategy::Unavailable, adc, voltage_domain));
        }
        let bus = open_i2c(&self.config.i2c_path)?;
        Ok(Regulator::for_device(model, bus, adc, voltage_domain))
    }

    async fn transport(&self) -> error::Result<Arc<dyn Transport>> {
        Ok(Arc::new(SerialTransport::open(&self.config.serial_path)?))
    }
}

/// Store a single key, numbers are kept as integers
fn set_key(store: &dyn Store, key: &str, value: &str) -> error::Result<()> {
    if !config::keys::ALL.contains(&key) {
        Err(ErrorKind::Config(format!("unknown key '{}'", key)))?
    }
    let entry = match value.parse::<u64>() {
        Ok(number) => Entry::Int(number),
        Err(_) => Entry::Text(value.to_string()),
    };
    store.set(key, entry)
}

/// Flush the log and terminate the process
fn exit(log_guard: logging::LoggingGuard, code: i32) -> ! {
    drop(log_guard);
    std::process::exit(code)
}

#[tokio::main]
async fn main() {
    let app = clap::App::new("axeminer")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set persistent settings file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("serial")
                .long("serial")
                .value_name("DEVICE")
                .help("Serial port connected to the ASIC chain")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("i2c")
                .long("i2c")
                .value_name("DEVICE")
                .help("I2C bus with the voltage regulator")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("adc")
                .long("adc")
                .value_name("PATH")
                .help("IIO raw channel measuring the core voltage")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("api")
                .long("api")
                .value_name("HOSTNAME:PORT")
                .help("Listen address of the configuration server")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("check-address")
                .long("check-address")
                .value_name("HOSTNAME:PORT")
                .help("TCP endpoint reached to check the network is up")
                .required(false)
                .takes_value(true),
        )
        .subcommand(
            clap::SubCommand::with_name("set")
                .about("Write a persistent setting and exit")
                .arg(
                    clap::Arg::with_name("key")
                        .help("Setting name")
                        .required(true)
                        .index(1),
                )
                .arg(
                    clap::Arg::with_name("value")
                        .help("New value, numbers are stored as integers")
                        .required(true)
                        .index(2),
                ),
        );

    let matches = app.get_matches();
    let log_guard = logging::setup_for_app(config::ASYNC_LOGGER_DRAIN_CHANNEL_SIZE);

    let mut daemon_config = DaemonConfig::default();
    if let Some(path) = matches.value_of("config") {
        daemon_config.store_path = path.into();
    }
    if let Some(path) = matches.value_of("serial") {
        daemon_config.serial_path = path.to_string();
    }
    if let Some(path) = matches.value_of("i2c") {
        daemon_config.i2c_path = path.into();
    }
    if let Some(path) = matches.value_of("adc") {
        daemon_config.adc_path = path.into();
    }
    if let Some(address) = matches.value_of("api") {
        daemon_config.api_address = address.to_string();
    }
    if let Some(address) = matches.value_of("check-address") {
        daemon_config.check_address = address.to_string();
    }

    let store = match FileStore::open(&daemon_config.store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                "Cannot open settings file \"{}\"",
                daemon_config.store_path.display()
            );
            error!("Reason: {}", e);
            exit(log_guard, 1);
        }
    };

    // Handle 'set' sub-command used for provisioning
    if let Some(matches) = matches.subcommand_matches("set") {
        let key = matches.value_of("key").unwrap_or_default();
        let value = matches.value_of("value").unwrap_or_default();
        match set_key(store.as_ref(), key, value) {
            Ok(()) => {
                info!("Stored {} = {}", key, value);
                exit(log_guard, 0);
            }
            Err(e) => {
                error!("Cannot store {}: {}", key, e);
                exit(log_guard, 1);
            }
        }
    }

    let services = Services {
        store,
        platform: Arc::new(LinuxPlatform {
            config: daemon_config.clone(),
        }),
        network: Arc::new(HostNetwork::new(daemon_config.check_address.clone())),
        config_server: Arc::new(ApiServer::new(daemon_config.api_address.clone())),
        spawner: Arc::new(TokioSpawner),
        frontend: Arc::new(BenchmarkFrontend::default()),
        self_test: Arc::new(RegulatorSelfTest),
    };

    match Orchestrator::new(services).run().await {
        Ok(BootOutcome::Mining) => info!("Boot complete, mining"),
        Ok(BootOutcome::Degraded(reason)) => warn!("Boot degraded: {}", reason),
        Err(e) => {
            crit!("Boot failed: {}", e);
            exit(log_guard, 1);
        }
    }

    // Spawned tasks keep the firmware running
    futures::future::pending::<()>().await;
}
