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

//! Async wrapper for blocking I2C masters - runs the device in a separate thread and
//! forwards requests from async tasks.

use crate::logging::macros::*;

use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::executor::block_on;
use futures::stream::StreamExt;

use async_trait::async_trait;
use embedded_hal::blocking::i2c::{Write, WriteRead};

use crate::error::{self, ErrorKind};
use crate::i2c::{self, Address};

use std::fmt::Debug;

/// SMBus block read support of a blocking master
pub trait BlockRead {
    type Error;

    /// Write `command`, then read the length byte reported by the slave followed by
    /// exactly that many bytes (the last one NACKed). Returns the payload only.
    fn read_block(&mut self, address: u8, command: u8) -> Result<Vec<u8>, Self::Error>;
}

enum Transfer {
    Write(Vec<u8>),
    WriteRead(Vec<u8>, usize),
    ReadBlock(u8),
}

/// One bus transaction and the channel its result is sent back through
struct Request {
    address: u8,
    transfer: Transfer,
    reply: oneshot::Sender<error::Result<Vec<u8>>>,
}

/// Server for I2C requests
/// Runs in separate thread.
/// Terminates when all request sender sides are dropped.
fn serve_requests<D, E>(mut i2c_device: D, mut request_rx: mpsc::UnboundedReceiver<Request>)
where
    D: Write<Error = E> + WriteRead<Error = E> + BlockRead<Error = E>,
    E: Debug,
{
    while let Some(request) = block_on(request_rx.next()) {
        let result = match request.transfer {
            Transfer::Write(ref bytes) => i2c_device
                .write(request.address, &bytes)
                .map(|_| Vec::new()),
            Transfer::WriteRead(ref bytes, read_len) => {
                let mut buffer = vec![0; read_len];
                i2c_device
                    .write_read(request.address, &bytes, &mut buffer)
                    .map(|_| buffer)
            }
            Transfer::ReadBlock(command) => i2c_device.read_block(request.address, command),
        };
        let result = result.map_err(|e| {
            ErrorKind::I2c(format!("device {:#04x}: {:?}", request.address, e)).into()
        });
        if request.reply.send(result).is_err() {
            warn!("AsyncI2c reply send failed - remote side may have ended");
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::BlockRead;

    use embedded_hal::blocking::i2c::{Write, WriteRead};
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
    use linux_embedded_hal::I2cdev;

    use std::collections::hash_map::{Entry, HashMap};
    use std::path::{Path, PathBuf};

    /// Linux I2C adapter. Plain transfers go through `I2cdev`, SMBus block reads are
    /// issued by the kernel on a separate handle bound to the slave address.
    pub struct LinuxMaster {
        bus: I2cdev,
        path: PathBuf,
        block_devices: HashMap<u8, LinuxI2CDevice>,
    }

    impl LinuxMaster {
        pub fn open(path: &Path) -> Result<Self, LinuxI2CError> {
            Ok(Self {
                bus: I2cdev::new(path)?,
                path: path.to_path_buf(),
                block_devices: HashMap::new(),
            })
        }
    }

    impl Write for LinuxMaster {
        type Error = LinuxI2CError;

        fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), LinuxI2CError> {
            self.bus.write(address, bytes)
        }
    }

    impl WriteRead for LinuxMaster {
        type Error = LinuxI2CError;

        fn write_read(
            &mut self,
            address: u8,
            bytes: &[u8],
            buffer: &mut [u8],
        ) -> Result<(), LinuxI2CError> {
            self.bus.write_read(address, bytes, buffer)
        }
    }

    impl BlockRead for LinuxMaster {
        type Error = LinuxI2CError;

        fn read_block(&mut self, address: u8, command: u8) -> Result<Vec<u8>, LinuxI2CError> {
            let device = match self.block_devices.entry(address) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert(LinuxI2CDevice::new(&self.path, address as u16)?)
                }
            };
            device.smbus_read_block_data(command)
        }
    }
}

/// Clonable async I2C bus. The underlying device is closed when last sender is dropped.
#[derive(Clone)]
pub struct AsyncI2cBus {
    request_tx: mpsc::UnboundedSender<Request>,
}

impl AsyncI2cBus {
    /// Wrap any blocking I2C master. Has to be called from within Tokio context
    /// because it moves the device to the blocking thread pool.
    pub fn new<D, E>(i2c_device: D) -> Self
    where
        D: Write<Error = E> + WriteRead<Error = E> + BlockRead<Error = E> + Send + 'static,
        E: Debug,
    {
        let (request_tx, request_rx) = mpsc::unbounded();
        tokio::task::spawn_blocking(move || serve_requests(i2c_device, request_rx));
        Self { request_tx }
    }

    /// Open Linux I2C character device (e.g. `/dev/i2c-0`)
    #[cfg(target_os = "linux")]
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> error::Result<Self> {
        let path = path.as_ref();
        let i2c_device = linux::LinuxMaster::open(path).map_err(|e| {
            ErrorKind::I2c(format!("cannot open {}: {}", path.display(), e))
        })?;
        Ok(Self::new(i2c_device))
    }

    async fn transfer(&self, address: Address, transfer: Transfer) -> error::Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            address: address.value(),
            transfer,
            reply: reply_tx,
        };
        if self.request_tx.unbounded_send(request).is_err() {
            Err(ErrorKind::I2c("bus server terminated".to_string()))?
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::I2c("bus server dropped the request".to_string()))?,
        }
    }

    async fn write_read(
        &self,
        address: Address,
        bytes: Vec<u8>,
        read_len: usize,
    ) -> error::Result<Vec<u8>> {
        let reply = self
            .transfer(address, Transfer::WriteRead(bytes, read_len))
            .await?;
        if reply.len() != read_len {
            Err(ErrorKind::I2c(format!(
                "device {}: expected {} bytes, got {}",
                address,
                read_len,
                reply.len()
            )))?
        }
        Ok(reply)
    }
}

#[async_trait]
impl i2c::AsyncBus for AsyncI2cBus {
    async fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8> {
        let reply = self.write_read(addr, vec![reg], 1).await?;
        Ok(reply[0])
    }

    async fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()> {
        self.transfer(addr, Transfer::Write(vec![reg, val])).await?;
        Ok(())
    }

    async fn read_word(&mut self, addr: Address, reg: u8) -> error::Result<[u8; 2]> {
        let reply = self.write_read(addr, vec![reg], 2).await?;
        Ok([reply[0], reply[1]])
    }

    async fn read_block(&mut self, addr: Address, reg: u8) -> error::Result<Vec<u8>> {
        let payload = self.transfer(addr, Transfer::ReadBlock(reg)).await?;
        i2c::check_block_len(payload)
    }
}
