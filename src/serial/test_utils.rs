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

use crate::error;
use crate::serial::Transport;

use async_trait::async_trait;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What happened on the fake link
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sent(Vec<u8>),
    Baud(u32),
    Cleared,
}

/// Transport that records everything sent and replays scripted inbound frames.
/// Bytes pushed with `push_bytes` form a raw stream served once the frames run out.
#[derive(Clone, Default)]
pub struct FakeTransport {
    events: Arc<Mutex<Vec<Event>>>,
    inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
    stream: Arc<Mutex<VecDeque<u8>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_inbound(&self, frame: &[u8]) {
        self.inbound.lock().unwrap().push_back(frame.to_vec());
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.stream.lock().unwrap().extend(bytes.iter().copied());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Only the frames sent, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Sent(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, frame: &[u8]) -> error::Result<()> {
        self.events.lock().unwrap().push(Event::Sent(frame.to_vec()));
        Ok(())
    }

    async fn receive(&self, len: usize, _timeout: Duration) -> error::Result<Option<Vec<u8>>> {
        if let Some(frame) = self.inbound.lock().unwrap().pop_front() {
            return Ok(Some(frame));
        }
        let mut stream = self.stream.lock().unwrap();
        if stream.len() < len {
            return Ok(None);
        }
        Ok(Some(stream.drain(..len).collect()))
    }

    async fn set_baud(&self, baud: u32) -> error::Result<()> {
        self.events.lock().unwrap().push(Event::Baud(baud));
        Ok(())
    }

    async fn clear_buffer(&self) -> error::Result<()> {
        self.events.lock().unwrap().push(Event::Cleared);
        Ok(())
    }
}
