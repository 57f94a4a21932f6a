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

//! Global logger shared by the library and the daemon binary

use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use slog::{o, Drain, Level, LevelFilter, Logger};
use slog_async::AsyncGuard;

use std::env;
use std::sync::Mutex;

pub use slog;

/// Default size of the channel between the logging call sites and the terminal drain
pub const DEFAULT_DRAIN_CHANNEL_SIZE: usize = 1024;

/// Channel size requested by the application before the first message was logged
static CHANNEL_SIZE: OnceCell<usize> = OnceCell::new();

lazy_static! {
    /// Build static reference to the logger that will be accessible from all modules
    pub static ref LOGGER: Logger = {
        let (logger, guard) = build(*CHANNEL_SIZE.get().unwrap_or(&DEFAULT_DRAIN_CHANNEL_SIZE));
        if let Ok(mut slot) = FLUSH_GUARD.lock() {
            slot.replace(guard);
        }
        logger
    };

    /// Joins the drain thread when taken out and dropped
    static ref FLUSH_GUARD: Mutex<Option<AsyncGuard>> = Mutex::new(None);
}

/// Flushes all pending log messages when dropped. Keep it alive for the whole `main`.
#[must_use]
pub struct LoggingGuard(());

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = FLUSH_GUARD.lock() {
            drop(slot.take());
        }
    }
}

/// Set up the global logger with a custom channel size. The channel size is ignored
/// once something has been logged.
pub fn setup_for_app(channel_size: usize) -> LoggingGuard {
    let _ = CHANNEL_SIZE.set(channel_size);
    lazy_static::initialize(&LOGGER);
    LoggingGuard(())
}

/// Build a terminal logger honouring `RUST_LOG`. Messages logged after the guard is
/// dropped are discarded.
pub fn build(channel_size: usize) -> (Logger, AsyncGuard) {
    let level = Level::Trace;

    // envlogger doesn't allow to set default log level, so this is a workaround
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }

    let terminal_decorator = slog_term::TermDecorator::new().build();
    let terminal_drain = slog_term::FullFormat::new(terminal_decorator).build().fuse();
    let terminal_drain = LevelFilter::new(terminal_drain, level).fuse();
    let terminal_drain = slog_envlogger::new(terminal_drain);
    let (terminal_drain, guard) = slog_async::Async::new(terminal_drain)
        .chan_size(channel_size)
        .build_with_guard();

    (Logger::root(terminal_drain.ignore_res(), o!()), guard)
}

#[macro_export]
macro_rules! trace {
    ($($args:tt)+) => {
        $crate::logging::slog::trace!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)+) => {
        $crate::logging::slog::debug!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)+) => {
        $crate::logging::slog::info!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)+) => {
        $crate::logging::slog::warn!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! error {
    ($($args:tt)+) => {
        $crate::logging::slog::error!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! crit {
    ($($args:tt)+) => {
        $crate::logging::slog::crit!($crate::logging::LOGGER, $($args)+)
    };
}

/// Import with `use crate::logging::macros::*;`
pub mod macros {
    pub use crate::{crit, debug, error, info, trace, warn};
}
