// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Error types for the binding.
//!
//! Recoverable failures (bad configuration, an incomplete upcall table) are
//! [`BindingError`]s. Anything that would corrupt the handshake if execution
//! continued is a [`ProtocolViolation`] and ends the process.

use crate::handshake::WorldState;
use crate::threads::{GcThreadKind, MutatorId};
use std::thread::ThreadId;

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("upcall table is missing `{0}`")]
    MissingUpcall(&'static str),

    #[error("upcall table already installed")]
    AlreadyInstalled,

    #[error("binding has not been initialized")]
    NotInitialized,

    #[error("layout offset `{name}` has invalid value {value}")]
    InvalidLayoutOffset { name: &'static str, value: i64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine rejected option `{key}` = `{value}`")]
    EngineOption { key: String, value: String },

    #[error("failed to parse configuration")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown GC thread kind {0}")]
    UnknownThreadKind(i32),

    #[error("thread {0:?} is already registered with the binding")]
    AlreadyRegistered(ThreadId),

    #[error("failed to spawn {kind:?} thread")]
    SpawnFailed {
        kind: GcThreadKind,
        #[source]
        source: std::io::Error,
    },
}

/// Conditions that break the handshake invariants. These are not returned
/// to callers; see [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("collector thread {0:?} tried to act as a mutator")]
    CollectorAsMutator(ThreadId),

    #[error("mutator thread {0:?} tried to act as a collector")]
    MutatorAsCollector(ThreadId),

    #[error("thread {0:?} is not registered with the binding")]
    UnregisteredThread(ThreadId),

    #[error("mutator {0:?} is not registered with the binding")]
    UnknownMutator(MutatorId),

    #[error("unexpected GC thread kind {0}")]
    UnexpectedThreadKind(i32),

    #[error("illegal world transition {from:?} -> {to:?}")]
    IllegalTransition { from: WorldState, to: WorldState },
}

/// Terminate the process after logging `reason`. Used when neither the host's
/// terminate upcall is available nor continuing is safe.
#[cold]
pub fn fatal(reason: impl std::fmt::Display) -> ! {
    tracing::error!(target: "gcbridge", %reason, "fatal binding error");
    eprintln!("[GC] fatal: {reason}");
    std::process::abort()
}
