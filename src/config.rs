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

//! This module handles the persisted key/value configuration of the miner and the daemon
//! settings that only come from the command line

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Override the default drain channel size as miner tends to burst messages into the logger
pub const ASYNC_LOGGER_DRAIN_CHANNEL_SIZE: usize = 4096;

/// Location of the persisted key/value store
pub const DEFAULT_STORE_PATH: &'static str = "/etc/axeminer.toml";

/// UART connected to the hash chain
pub const DEFAULT_SERIAL_PATH: &'static str = "/dev/ttyS1";

/// I2C master the power regulators sit on
pub const DEFAULT_I2C_PATH: &'static str = "/dev/i2c-0";

/// Core voltage read-back (IIO raw sample in millivolts)
pub const DEFAULT_ADC_PATH: &'static str = "/sys/bus/iio/devices/iio:device0/in_voltage0_raw";

/// Where the configuration API listens
pub const DEFAULT_API_ADDRESS: &'static str = "0.0.0.0:4028";

/// Keys of the persisted store
pub mod keys {
    pub const ASIC_FREQUENCY: &'static str = "asicfrequency";
    pub const ASIC_COUNT: &'static str = "asiccount";
    pub const VOLTAGE_DOMAIN: &'static str = "voltagedomain";
    pub const ASIC_VOLTAGE: &'static str = "asicvoltage";
    pub const DEVICE_MODEL: &'static str = "devicemodel";
    pub const BOARD_VERSION: &'static str = "boardversion";
    pub const ASIC_MODEL: &'static str = "asicmodel";
    pub const BEST_DIFF: &'static str = "bestdiff";
    pub const SELF_TEST: &'static str = "selftest";
    pub const WIFI_SSID: &'static str = "wifissid";
    pub const WIFI_PASS: &'static str = "wifipass";
    pub const HOSTNAME: &'static str = "hostname";
    pub const STRATUM_URL: &'static str = "stratumurl";
    pub const STRATUM_PORT: &'static str = "stratumport";
    pub const STRATUM_USER: &'static str = "stratumuser";

    pub const ALL: [&'static str; 15] = [
        ASIC_FREQUENCY,
        ASIC_COUNT,
        VOLTAGE_DOMAIN,
        ASIC_VOLTAGE,
        DEVICE_MODEL,
        BOARD_VERSION,
        ASIC_MODEL,
        BEST_DIFF,
        SELF_TEST,
        WIFI_SSID,
        WIFI_PASS,
        HOSTNAME,
        STRATUM_URL,
        STRATUM_PORT,
        STRATUM_USER,
    ];
}

/// Default PLL frequency for clocking the chips in MHz
pub const DEFAULT_FREQUENCY: u16 = 485;

/// Default core voltage in millivolts
pub const DEFAULT_VOLTAGE_MV: u16 = 1200;

pub const DEFAULT_ASIC_COUNT: u16 = 1;
pub const DEFAULT_VOLTAGE_DOMAIN: u16 = 1;
pub const DEFAULT_BOARD_VERSION: &'static str = "000";
pub const DEFAULT_WIFI_SSID: &'static str = "myssid";
pub const DEFAULT_WIFI_PASS: &'static str = "mypass";
pub const DEFAULT_HOSTNAME: &'static str = "axeminer";

/// One persisted value
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Entry {
    Int(u64),
    Text(String),
}

/// Persistent key/value storage. Getters fall back to the default when the key is missing
/// or holds a value of another type.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Option<Entry>;

    fn set(&self, key: &str, value: Entry) -> error::Result<()>;

    fn erase(&self, key: &str) -> error::Result<()>;

    /// Snapshot of all stored entries
    fn entries(&self) -> BTreeMap<String, Entry>;

    fn get_u16(&self, key: &str, default: u16) -> u16 {
        match self.get(key) {
            Some(Entry::Int(value)) if value <= u16::MAX as u64 => value as u16,
            Some(other) => {
                warn!("Config: key '{}' holds {:?}, using default {}", key, other, default);
                default
            }
            None => default,
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(Entry::Int(value)) => value,
            Some(other) => {
                warn!("Config: key '{}' holds {:?}, using default {}", key, other, default);
                default
            }
            None => default,
        }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Entry::Text(value)) => value,
            Some(other) => {
                warn!("Config: key '{}' holds {:?}, using default", key, other);
                default.to_string()
            }
            None => default.to_string(),
        }
    }

    fn set_u16(&self, key: &str, value: u16) -> error::Result<()> {
        self.set(key, Entry::Int(value as u64))
    }

    fn set_u64(&self, key: &str, value: u64) -> error::Result<()> {
        self.set(key, Entry::Int(value))
    }

    fn set_string(&self, key: &str, value: &str) -> error::Result<()> {
        self.set(key, Entry::Text(value.to_string()))
    }
}

/// Volatile store, used when no backing file is wanted
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Entry)>,
        K: Into<String>,
    {
        Self {
            entries: Mutex::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }
}

fn poisoned() -> error::Error {
    ErrorKind::Config("store lock poisoned".to_string()).into()
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<Entry> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Entry) -> error::Result<()> {
        self.entries
            .lock()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn erase(&self, key: &str) -> error::Result<()> {
        self.entries.lock().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn entries(&self) -> BTreeMap<String, Entry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Store persisted as a flat TOML table. Every modification rewrites the file atomically.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl FileStore {
    /// Open the store, a missing file means empty store
    pub fn open<P: AsRef<Path>>(path: P) -> error::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            info!("Config: store {} does not exist yet", path.display());
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, Entry>) -> error::Result<()> {
        let content = toml::to_string(entries)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(content.as_bytes())?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Option<Entry> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Entry) -> error::Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    fn erase(&self, key: &str) -> error::Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn entries(&self) -> BTreeMap<String, Entry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Parse leading integer the way C `atoi` does: skip whitespace, optional sign, then
/// as many digits as there are. Anything unparsable is 0.
pub fn parse_board_version(value: &str) -> i32 {
    let value = value.trim_start();
    let (negative, digits) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };
    let number = digits
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .fold(0i64, |acc, b| {
            (acc * 10 + (b - b'0') as i64).min(i32::MAX as i64 + 1)
        });
    let number = if negative { -number } else { number };
    number.max(i32::MIN as i64).min(i32::MAX as i64) as i32
}

/// Raw boot values read from the store
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub frequency: u16,
    pub asic_count: u16,
    pub voltage_domain: u16,
    pub core_voltage_mv: u16,
    pub device_model: String,
    pub board_version: String,
    pub asic_model: String,
    pub best_diff: u64,
    pub self_test: u16,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
}

impl Settings {
    pub fn load(store: &dyn Store) -> Self {
        let settings = Self {
            frequency: store.get_u16(keys::ASIC_FREQUENCY, DEFAULT_FREQUENCY),
            asic_count: store.get_u16(keys::ASIC_COUNT, DEFAULT_ASIC_COUNT),
            voltage_domain: store.get_u16(keys::VOLTAGE_DOMAIN, DEFAULT_VOLTAGE_DOMAIN),
            core_voltage_mv: store.get_u16(keys::ASIC_VOLTAGE, DEFAULT_VOLTAGE_MV),
            device_model: store.get_string(keys::DEVICE_MODEL, ""),
            board_version: store.get_string(keys::BOARD_VERSION, DEFAULT_BOARD_VERSION),
            asic_model: store.get_string(keys::ASIC_MODEL, ""),
            best_diff: store.get_u64(keys::BEST_DIFF, 0),
            self_test: store.get_u16(keys::SELF_TEST, 0),
            wifi_ssid: store.get_string(keys::WIFI_SSID, DEFAULT_WIFI_SSID),
            wifi_pass: store.get_string(keys::WIFI_PASS, DEFAULT_WIFI_PASS),
            hostname: store.get_string(keys::HOSTNAME, DEFAULT_HOSTNAME),
        };
        info!("Config: ASIC frequency {} MHz", settings.frequency);
        info!("Config: ASIC count {}", settings.asic_count);
        info!("Config: voltage domain {}", settings.voltage_domain);
        settings
    }

    pub fn board_revision(&self) -> i32 {
        parse_board_version(&self.board_version)
    }

    /// Self-test is requested explicitly and only until the first share is recorded
    pub fn self_test_requested(&self) -> bool {
        self.self_test == 1 && self.best_diff < 1
    }
}

/// Settings of the daemon process itself
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub store_path: PathBuf,
    pub serial_path: String,
    pub i2c_path: PathBuf,
    pub adc_path: PathBuf,
    pub api_address: String,
    /// TCP endpoint reached to decide the network is up
    pub check_address: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: DEFAULT_STORE_PATH.into(),
            serial_path: DEFAULT_SERIAL_PATH.to_string(),
            i2c_path: DEFAULT_I2C_PATH.into(),
            adc_path: DEFAULT_ADC_PATH.into(),
            api_address: DEFAULT_API_ADDRESS.to_string(),
            check_address: String::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_board_version() {
        assert_eq!(parse_board_version("000"), 0);
        assert_eq!(parse_board_version("204"), 204);
        assert_eq!(parse_board_version("302"), 302);
        assert_eq!(parse_board_version("  401abc"), 401);
        assert_eq!(parse_board_version("-5"), -5);
        assert_eq!(parse_board_version("+7"), 7);
        assert_eq!(parse_board_version("hex"), 0);
        assert_eq!(parse_board_version(""), 0);
        assert_eq!(parse_board_version("99999999999"), i32::MAX);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::load(&MemoryStore::new());
        assert_eq!(settings.frequency, DEFAULT_FREQUENCY);
        assert_eq!(settings.asic_count, 1);
        assert_eq!(settings.voltage_domain, 1);
        assert_eq!(settings.device_model, "");
        assert_eq!(settings.board_revision(), 0);
        assert_eq!(settings.best_diff, 0);
        assert!(!settings.self_test_requested());
    }

    #[test]
    fn test_settings_from_store() {
        let store = MemoryStore::with_entries(vec![
            (keys::ASIC_FREQUENCY, Entry::Int(575)),
            (keys::ASIC_COUNT, Entry::Int(6)),
            (keys::DEVICE_MODEL, Entry::Text("hex".to_string())),
            (keys::BOARD_VERSION, Entry::Text("302".to_string())),
            (keys::SELF_TEST, Entry::Int(1)),
            // wrong type falls back to default
            (keys::VOLTAGE_DOMAIN, Entry::Text("three".to_string())),
        ]);
        let settings = Settings::load(&store);
        assert_eq!(settings.frequency, 575);
        assert_eq!(settings.asic_count, 6);
        assert_eq!(settings.voltage_domain, DEFAULT_VOLTAGE_DOMAIN);
        assert_eq!(settings.device_model, "hex");
        assert_eq!(settings.board_revision(), 302);
        assert!(settings.self_test_requested());

        store.set_u64(keys::BEST_DIFF, 1).unwrap();
        assert!(!Settings::load(&store).self_test_requested());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        {
            let store = FileStore::open(&path).unwrap();
            assert_eq!(store.get_u16(keys::ASIC_COUNT, 1), 1);
            store.set_u16(keys::ASIC_COUNT, 4).unwrap();
            store.set_string(keys::ASIC_MODEL, "BM1368").unwrap();
            store.set_u64(keys::BEST_DIFF, 1 << 40).unwrap();
            store.set_string(keys::WIFI_PASS, "secret").unwrap();
            store.erase(keys::WIFI_PASS).unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_u16(keys::ASIC_COUNT, 1), 4);
        assert_eq!(store.get_string(keys::ASIC_MODEL, ""), "BM1368");
        assert_eq!(store.get_u64(keys::BEST_DIFF, 0), 1 << 40);
        assert_eq!(store.get_string(keys::WIFI_PASS, "none"), "none");
        assert_eq!(store.entries().len(), 3);
    }

    #[test]
    fn test_file_store_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"asiccount = [1, 2").unwrap();
        assert!(FileStore::open(file.path()).is_err());
    }
}
