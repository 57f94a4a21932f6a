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

//! Configuration server: line delimited JSON over TCP.
//!
//! It is started before the network connection is attempted so the device can be
//! reconfigured even when the boot is stuck waiting for manual intervention.

use crate::logging::macros::*;

use crate::config::{keys, Entry, Store};
use crate::context::DeviceContext;
use crate::error::{self, ErrorKind};
use crate::orchestrator::BootState;
use crate::tasks::{ButtonEvent, MiningStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Everything the server exposes
#[derive(Clone)]
pub struct ApiState {
    pub context: Arc<DeviceContext>,
    pub store: Arc<dyn Store>,
    pub stats: Arc<MiningStats>,
    pub boot_state: watch::Receiver<BootState>,
    pub buttons: mpsc::Sender<ButtonEvent>,
}

#[async_trait]
pub trait ConfigServer: Send + Sync {
    async fn start(&self, state: ApiState) -> error::Result<()>;
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
enum Press {
    Short,
    Long,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "command", rename_all = "lowercase")]
enum Request {
    Status,
    Config,
    Set { key: String, value: Value },
    Button { press: Press },
}

#[derive(Serialize, Debug)]
struct StatusResponse {
    boot_state: String,
    device_model: String,
    asic_model: Option<String>,
    board_revision: i32,
    asic_count: u16,
    voltage_domain: u16,
    frequency_mhz: u16,
    job_cadence_ms: f64,
    startup_complete: bool,
    wifi_status: String,
    system_status: String,
    hashrate_ghs: f64,
    nonces: u64,
    shares: u64,
    best_difficulty: f64,
}

fn status(state: &ApiState) -> StatusResponse {
    let context = &state.context;
    StatusResponse {
        boot_state: format!("{:?}", *state.boot_state.borrow()),
        device_model: context.device_model.to_string(),
        asic_model: context.asic.model().map(|model| model.to_string()),
        board_revision: context.board_revision,
        asic_count: context.asic_count,
        voltage_domain: context.voltage_domain,
        frequency_mhz: context.core_frequency_mhz(),
        job_cadence_ms: context.job_cadence_ms,
        startup_complete: context.startup_complete(),
        wifi_status: context.wifi_status(),
        system_status: context.system_status(),
        hashrate_ghs: state.stats.hashrate_ghs(),
        nonces: state.stats.nonces(),
        shares: state.stats.shares_submitted(),
        best_difficulty: state.stats.best_difficulty(),
    }
}

/// Persisted values, the network password is never sent out
fn config(store: &dyn Store) -> BTreeMap<String, Entry> {
    let mut entries = store.entries();
    if let Some(password) = entries.get_mut(keys::WIFI_PASS) {
        *password = Entry::Text("********".to_string());
    }
    entries
}

fn set(store: &dyn Store, key: &str, value: Value) -> error::Result<()> {
    if !keys::ALL.contains(&key) {
        Err(ErrorKind::Config(format!("unknown key '{}'", key)))?
    }
    let entry = match value {
        Value::Number(number) => match number.as_u64() {
            Some(number) => Entry::Int(number),
            None => Err(ErrorKind::Config(format!(
                "value of '{}' must be a non-negative integer",
                key
            )))?,
        },
        Value::String(text) => Entry::Text(text),
        _ => Err(ErrorKind::Config(format!(
            "value of '{}' must be a number or a string",
            key
        )))?,
    };
    info!("API: setting {} = {:?}", key, entry);
    store.set(key, entry)
}

fn error_response(message: String) -> Value {
    json!({ "error": message })
}

/// Answer one request line
pub fn handle_request(state: &ApiState, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return error_response(format!("invalid request: {}", e)),
    };
    debug!("API request {:?}", request);
    match request {
        Request::Status => serde_json::to_value(status(state))
            .unwrap_or_else(|e| error_response(e.to_string())),
        Request::Config => serde_json::to_value(config(state.store.as_ref()))
            .unwrap_or_else(|e| error_response(e.to_string())),
        Request::Set { key, value } => match set(state.store.as_ref(), &key, value) {
            Ok(()) => json!({ "ok": true }),
            Err(e) => error_response(e.to_string()),
        },
        Request::Button { press } => {
            let event = match press {
                Press::Short => ButtonEvent::ShortPress,
                Press::Long => ButtonEvent::LongPress,
            };
            match state.buttons.try_send(event) {
                Ok(()) => json!({ "ok": true }),
                Err(e) => error_response(format!("button event dropped: {}", e)),
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, state: ApiState) -> error::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = handle_request(&state, &line).to_string();
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

async fn serve(listener: TcpListener, state: ApiState) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!("API: connection from {}", peer);
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, state).await {
                        debug!("API: connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("API: accept failed: {}", e),
        }
    }
}

/// TCP configuration server
pub struct ApiServer {
    address: String,
}

impl ApiServer {
    pub fn new(address: String) -> Self {
        Self { address }
    }

    /// Bind and serve in the background, returns the bound address
    pub async fn listen(&self, state: ApiState) -> error::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            ErrorKind::Network(format!("cannot listen on {}: {}", self.address, e))
        })?;
        let address = listener.local_addr()?;
        info!("API: listening on {}", address);
        tokio::spawn(serve(listener, state));
        Ok(address)
    }
}

#[async_trait]
impl ConfigServer for ApiServer {
    async fn start(&self, state: ApiState) -> error::Result<()> {
        self.listen(state).await.map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MemoryStore, Settings};

    fn state() -> (ApiState, mpsc::Receiver<ButtonEvent>, watch::Sender<BootState>) {
        let store = Arc::new(MemoryStore::with_entries(vec![
            (keys::DEVICE_MODEL, Entry::Text("ultra".to_string())),
            (keys::ASIC_MODEL, Entry::Text("BM1366".to_string())),
            (keys::WIFI_PASS, Entry::Text("secret".to_string())),
        ]));
        let (context, _writers) = DeviceContext::build(&Settings::load(store.as_ref()));
        let (boot_tx, boot_state) = watch::channel(BootState::Mining);
        let (buttons, button_rx) = mpsc::channel(1);
        let state = ApiState {
            context: Arc::new(context),
            store,
            stats: Arc::new(MiningStats::new(0)),
            boot_state,
            buttons,
        };
        (state, button_rx, boot_tx)
    }

    #[test]
    fn test_status() {
        let (state, _buttons, _boot) = state();
        let response = handle_request(&state, r#"{"command":"status"}"#);
        assert_eq!(response["device_model"], "Ultra");
        assert_eq!(response["asic_model"], "BM1366");
        assert_eq!(response["boot_state"], "Mining");
        assert_eq!(response["frequency_mhz"], 485);
        assert_eq!(response["startup_complete"], false);
    }

    #[test]
    fn test_config_hides_password() {
        let (state, _buttons, _boot) = state();
        let response = handle_request(&state, r#"{"command":"config"}"#);
        assert_eq!(response["devicemodel"], "ultra");
        assert_eq!(response["wifipass"], "********");
    }

    #[test]
    fn test_set() {
        let (state, _buttons, _boot) = state();
        let response = handle_request(
            &state,
            r#"{"command":"set","key":"asicfrequency","value":550}"#,
        );
        assert_eq!(response, json!({ "ok": true }));
        assert_eq!(state.store.get_u16(keys::ASIC_FREQUENCY, 0), 550);

        let response = handle_request(
            &state,
            r#"{"command":"set","key":"hostname","value":"axe"}"#,
        );
        assert_eq!(response, json!({ "ok": true }));
        assert_eq!(state.store.get_string(keys::HOSTNAME, ""), "axe");

        let response =
            handle_request(&state, r#"{"command":"set","key":"bogus","value":1}"#);
        assert!(response["error"].is_string());
        let response =
            handle_request(&state, r#"{"command":"set","key":"asiccount","value":-1}"#);
        assert!(response["error"].is_string());
    }

    #[test]
    fn test_invalid_request() {
        let (state, _buttons, _boot) = state();
        assert!(handle_request(&state, "not json")["error"].is_string());
        assert!(handle_request(&state, r#"{"command":"reboot"}"#)["error"].is_string());
    }

    #[tokio::test]
    async fn test_button() {
        let (state, mut buttons, _boot) = state();
        let response = handle_request(&state, r#"{"command":"button","press":"long"}"#);
        assert_eq!(response, json!({ "ok": true }));
        assert_eq!(buttons.recv().await, Some(ButtonEvent::LongPress));
    }

    #[tokio::test]
    async fn test_tcp_server() {
        let (state, _buttons, _boot) = state();
        let server = ApiServer::new("127.0.0.1:0".to_string());
        let address = server.listen(state).await.unwrap();

        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(b"{\"command\":\"status\"}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["asic_model"], "BM1366");
    }
}
