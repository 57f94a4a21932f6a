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

//! Network bring-up. The host OS owns the actual interfaces; the miner only decides
//! whether the network is usable by reaching a check endpoint.

use crate::logging::macros::*;

use crate::context::{StatusWriter, WifiStatus};
use crate::error::{self, ErrorKind};

use async_trait::async_trait;
use tokio::net::TcpStream;

use std::time::Duration;

/// Result of the connection attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectOutcome {
    Connected,
    Failed,
    /// Something other than the connection itself went wrong
    Unexpected,
}

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn init(&self, ssid: &str, password: &str, hostname: &str) -> error::Result<()>;

    /// Try to connect, retry progress is reported through `status`
    async fn connect(&self, status: &StatusWriter) -> ConnectOutcome;

    /// Turn off the fallback access point used for provisioning
    async fn disable_access_point(&self) -> error::Result<()>;
}

/// Host networking checked by opening a TCP connection to a check endpoint
pub struct HostNetwork {
    check_address: String,
    max_retries: u32,
    attempt_timeout: Duration,
    retry_delay: Duration,
}

impl HostNetwork {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const RETRY_DELAY: Duration = Duration::from_secs(2);

    /// Empty `check_address` means the network is assumed to be up
    pub fn new(check_address: String) -> Self {
        Self {
            check_address,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            attempt_timeout: Self::ATTEMPT_TIMEOUT,
            retry_delay: Self::RETRY_DELAY,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn reach(&self) -> error::Result<()> {
        match tokio::time::timeout(self.attempt_timeout, TcpStream::connect(&self.check_address))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ErrorKind::Network(format!(
                "cannot reach {}: {}",
                self.check_address, e
            )))?,
            Err(_) => Err(ErrorKind::Network(format!(
                "timeout reaching {}",
                self.check_address
            )))?,
        }
    }
}

#[async_trait]
impl Connectivity for HostNetwork {
    async fn init(&self, ssid: &str, _password: &str, hostname: &str) -> error::Result<()> {
        info!("Network: hostname {}, SSID {}", hostname, ssid);
        if !self.check_address.is_empty() && !self.check_address.contains(':') {
            Err(ErrorKind::Network(format!(
                "check address '{}' has no port",
                self.check_address
            )))?
        }
        Ok(())
    }

    async fn connect(&self, status: &StatusWriter) -> ConnectOutcome {
        if self.check_address.is_empty() {
            return ConnectOutcome::Connected;
        }
        if !self.check_address.contains(':') {
            error!("Network: invalid check address '{}'", self.check_address);
            return ConnectOutcome::Unexpected;
        }
        for attempt in 1..=self.max_retries {
            match self.reach().await {
                Ok(()) => {
                    info!("Network: connected after {} attempt(s)", attempt);
                    return ConnectOutcome::Connected;
                }
                Err(e) => {
                    warn!("Network: attempt {} failed: {}", attempt, e);
                    status.set_wifi_status(WifiStatus::Retrying(attempt));
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
        status.set_wifi_status(WifiStatus::ConnectFailed);
        ConnectOutcome::Failed
    }

    async fn disable_access_point(&self) -> error::Result<()> {
        debug!("Network: no access point to disable");
        Ok(())
    }
}
