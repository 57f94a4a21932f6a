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

//! UART link to the hash chain

#[cfg(test)]
pub mod test_utils;

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};

use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Chips come out of reset talking at this speed
pub const INIT_BAUD_RATE: u32 = 115_200;

/// Byte transport to the chain. Sending and receiving may happen concurrently from
/// different tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &[u8]) -> error::Result<()>;

    /// Read exactly `len` bytes, `None` when nothing complete arrived within `timeout`
    async fn receive(&self, len: usize, timeout: Duration) -> error::Result<Option<Vec<u8>>>;

    async fn set_baud(&self, baud: u32) -> error::Result<()>;

    /// Drop whatever is buffered in both directions
    async fn clear_buffer(&self) -> error::Result<()>;
}

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Run blocking port operation on the blocking thread pool
async fn with_port<F, T>(port: &SharedPort, f: F) -> error::Result<T>
where
    F: FnOnce(&mut Box<dyn SerialPort>) -> error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let port = port.clone();
    tokio::task::spawn_blocking(move || {
        let mut port = port
            .lock()
            .map_err(|_| ErrorKind::Serial("port lock poisoned".to_string()))?;
        f(&mut port)
    })
    .await
    .map_err(|e| ErrorKind::Serial(format!("blocking task failed: {}", e)))?
}

/// Fill `pending` up to `len` bytes from `port`. Bytes of an incomplete frame stay in
/// `pending` when the read times out and are returned by the next call.
fn read_frame<R: Read + ?Sized>(
    port: &mut R,
    pending: &mut Vec<u8>,
    len: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut chunk = vec![0; len];
    while pending.len() < len {
        let wanted = len - pending.len();
        match port.read(&mut chunk[..wanted]) {
            Ok(0) => return Ok(None),
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if !pending.is_empty() {
                    trace!("Partial frame {:02x?} kept for the next read", pending);
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(pending.drain(..len).collect()))
}

/// `serialport` backed transport, reader and writer are separate handles of one port
pub struct SerialTransport {
    writer: SharedPort,
    reader: SharedPort,
    /// Received bytes not yet returned as a whole frame
    pending: Arc<Mutex<Vec<u8>>>,
}

fn lock_pending(pending: &Mutex<Vec<u8>>) -> error::Result<std::sync::MutexGuard<'_, Vec<u8>>> {
    pending
        .lock()
        .map_err(|_| ErrorKind::Serial("receive buffer lock poisoned".to_string()).into())
}

impl SerialTransport {
    pub fn open(path: &str) -> error::Result<Self> {
        info!("Opening {} at {} baud", path, INIT_BAUD_RATE);
        let writer = serialport::new(path, INIT_BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        let reader = writer.try_clone()?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            pending: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&self, frame: &[u8]) -> error::Result<()> {
        let frame = frame.to_vec();
        with_port(&self.writer, move |port| {
            port.write_all(&frame)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn receive(&self, len: usize, timeout: Duration) -> error::Result<Option<Vec<u8>>> {
        let pending = self.pending.clone();
        with_port(&self.reader, move |port| {
            port.set_timeout(timeout)?;
            let mut pending = lock_pending(&pending)?;
            Ok(read_frame(&mut **port, &mut pending, len)?)
        })
        .await
    }

    async fn set_baud(&self, baud: u32) -> error::Result<()> {
        info!("Changing UART baud rate to {}", baud);
        with_port(&self.writer, move |port| {
            port.set_baud_rate(baud)
                .map_err(|e| ErrorKind::BaudRate(format!("{}: {}", baud, e)).into())
        })
        .await
    }

    async fn clear_buffer(&self) -> error::Result<()> {
        let pending = self.pending.clone();
        with_port(&self.writer, move |port| {
            port.clear(ClearBuffer::All)?;
            lock_pending(&pending)?.clear();
            Ok(())
        })
        .await
    }
}
