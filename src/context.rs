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

//! Device context shared by all tasks for the lifetime of the process.
//!
//! Identity fields are resolved once at boot and never change. The few fields that do
//! change after boot have exactly one writer: the writer handles in `ContextWriters` are
//! handed to the owning task while every other task only holds the read side.

use crate::logging::macros::*;

use crate::asic::AsicSupport;
use crate::config::{Settings, DEFAULT_FREQUENCY};

use tokio::sync::watch;

use std::fmt;
use std::sync::Arc;

/// Status strings are shown on a small display
pub const STATUS_TEXT_LEN: usize = 20;

/// Board family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    Max,
    Ultra,
    Supra,
    Hex,
    Invalid,
}

impl DeviceModel {
    pub fn resolve(name: &str) -> Self {
        match name {
            "max" => DeviceModel::Max,
            "ultra" => DeviceModel::Ultra,
            "supra" => DeviceModel::Supra,
            "hex" => DeviceModel::Hex,
            _ => DeviceModel::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != DeviceModel::Invalid
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DeviceModel::Max => "Max",
            DeviceModel::Ultra => "Ultra",
            DeviceModel::Supra => "Supra",
            DeviceModel::Hex => "Hex",
            DeviceModel::Invalid => "Invalid",
        };
        write!(f, "{}", name)
    }
}

/// Selects the power management loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardClass {
    Standard,
    /// Revisions 300-399 carry the digitally controlled regulator
    Hex,
}

impl BoardClass {
    pub fn from_revision(revision: i32) -> Self {
        if revision >= 300 && revision < 400 {
            BoardClass::Hex
        } else {
            BoardClass::Standard
        }
    }
}

/// Network state shown to the user
#[derive(Debug, Clone, PartialEq)]
pub enum WifiStatus {
    Connected,
    Failed,
    Unexpected,
    Retrying(u32),
    ConnectFailed,
}

impl fmt::Display for WifiStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WifiStatus::Connected => write!(f, "Connected!"),
            WifiStatus::Failed => write!(f, "Failed to connect"),
            WifiStatus::Unexpected => write!(f, "unexpected error"),
            WifiStatus::Retrying(attempt) => write!(f, "Retrying: {}", attempt),
            WifiStatus::ConnectFailed => write!(f, "Connect Failed!"),
        }
    }
}

pub fn truncate_status(text: &str) -> String {
    text.chars().take(STATUS_TEXT_LEN).collect()
}

/// Only writer of the core frequency, owned by the power management task
pub struct FrequencyWriter {
    tx: watch::Sender<u16>,
}

impl FrequencyWriter {
    pub fn set(&self, frequency_mhz: u16) {
        let previous = self.tx.send_replace(frequency_mhz);
        if previous != frequency_mhz {
            info!("Core frequency changed {} -> {} MHz", previous, frequency_mhz);
        }
    }

    pub fn get(&self) -> u16 {
        *self.tx.borrow()
    }
}

/// Write-once startup flag, consumed when the flag is set
pub struct StartupWriter {
    tx: watch::Sender<bool>,
}

impl StartupWriter {
    pub fn mark_complete(self) {
        self.tx.send_replace(true);
    }
}

/// Advisory status texts, any task may update them
#[derive(Clone)]
pub struct StatusWriter {
    wifi: Arc<watch::Sender<String>>,
    system: Arc<watch::Sender<String>>,
}

impl StatusWriter {
    pub fn set_wifi_status(&self, status: WifiStatus) {
        self.wifi.send_replace(truncate_status(&status.to_string()));
    }

    pub fn set_system_status(&self, text: &str) {
        self.system.send_replace(truncate_status(text));
    }
}

/// Write sides of the mutable context fields
pub struct ContextWriters {
    pub frequency: FrequencyWriter,
    pub startup: StartupWriter,
    pub status: StatusWriter,
}

pub struct DeviceContext {
    pub device_model: DeviceModel,
    pub board_revision: i32,
    pub board_class: BoardClass,
    /// Number of dies sharing one regulated rail
    pub voltage_domain: u16,
    pub asic_count: u16,
    pub asic: AsicSupport,
    /// Interval between jobs sent to the chain, zero for unsupported chips
    pub job_cadence_ms: f64,
    pub initial_difficulty: u32,
    pub core_voltage_mv: u16,
    pub ssid: String,
    pub hostname: String,
    frequency: watch::Receiver<u16>,
    startup: watch::Receiver<bool>,
    wifi_status: watch::Receiver<String>,
    system_status: watch::Receiver<String>,
}

impl DeviceContext {
    /// Resolve device identity from raw settings. Unknown device or ASIC models are
    /// logged and leave the context in a degraded but usable state.
    pub fn build(settings: &Settings) -> (Self, ContextWriters) {
        let device_model = DeviceModel::resolve(&settings.device_model);
        if device_model.is_valid() {
            info!("DEVICE: {}", device_model);
        } else {
            error!("Invalid DEVICE model '{}'", settings.device_model);
        }

        let asic = AsicSupport::resolve(&settings.asic_model);
        let asic_count = if settings.asic_count == 0 {
            warn!("ASIC count is zero, assuming a single chip");
            1
        } else {
            settings.asic_count
        };
        let voltage_domain = if settings.voltage_domain == 0 {
            warn!("Voltage domain is zero, assuming a single chip per rail");
            1
        } else {
            settings.voltage_domain
        };
        let frequency = if settings.frequency == 0 {
            warn!("ASIC frequency is zero, using {} MHz", DEFAULT_FREQUENCY);
            DEFAULT_FREQUENCY
        } else {
            settings.frequency
        };
        let (job_cadence_ms, initial_difficulty) = match asic.model() {
            Some(model) => {
                info!("ASIC: {}", model);
                (
                    model.job_cadence_ms(frequency, asic_count),
                    model.initial_difficulty(),
                )
            }
            None => {
                error!("Invalid ASIC model '{}'", settings.asic_model);
                (0.0, 0)
            }
        };

        let board_revision = settings.board_revision();
        let board_class = BoardClass::from_revision(board_revision);
        debug!(
            "Board revision {} ({:?}), job cadence {:.3} ms",
            board_revision, board_class, job_cadence_ms
        );

        let (frequency_tx, frequency) = watch::channel(frequency);
        let (startup_tx, startup) = watch::channel(false);
        let (wifi_tx, wifi_status) = watch::channel(String::new());
        let (system_tx, system_status) = watch::channel(String::new());

        let context = Self {
            device_model,
            board_revision,
            board_class,
            voltage_domain,
            asic_count,
            asic,
            job_cadence_ms,
            initial_difficulty,
            core_voltage_mv: settings.core_voltage_mv,
            ssid: truncate_status(&settings.wifi_ssid),
            hostname: settings.hostname.clone(),
            frequency,
            startup,
            wifi_status,
            system_status,
        };
        let writers = ContextWriters {
            frequency: FrequencyWriter { tx: frequency_tx },
            startup: StartupWriter { tx: startup_tx },
            status: StatusWriter {
                wifi: Arc::new(wifi_tx),
                system: Arc::new(system_tx),
            },
        };
        (context, writers)
    }

    pub fn core_frequency_mhz(&self) -> u16 {
        *self.frequency.borrow()
    }

    /// Receiver notified on every frequency change
    pub fn frequency_watch(&self) -> watch::Receiver<u16> {
        self.frequency.clone()
    }

    pub fn startup_complete(&self) -> bool {
        *self.startup.borrow()
    }

    pub fn wifi_status(&self) -> String {
        self.wifi_status.borrow().clone()
    }

    pub fn system_status(&self) -> String {
        self.system_status.borrow().clone()
    }
}
