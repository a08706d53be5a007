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

//! gcbridge: binds a managed-language runtime to a pluggable garbage
//! collection engine.
//!
//! The host runtime supplies an [`Upcalls`] table (thread control, root
//! enumeration, object introspection, cycle hooks and layout offsets).
//! The engine implements [`GcEngine`]. A [`Binding`] sits between them:
//! it dispatches write barriers for every compiler tier, runs the
//! stop-the-world handshake, enumerates roots into buffered packets and
//! processes weak references after marking.
//!
//! [`gc`] instantiates all of this over MMTk.

pub mod barrier;
pub mod binding;
pub mod closure;
pub mod config;
pub mod engine;
pub mod error;
pub mod gc;
pub mod handshake;
pub mod roots;
pub mod slot;
pub mod threads;
pub mod upcalls;
pub mod weak;

#[cfg(test)]
mod testing;

pub use barrier::{Barrier, BarrierEntryPoints, CompilerTier, Decorators, StoreOperand};
pub use binding::{Binding, MutatorGuard, OutOfMemory};
pub use closure::{SlotSink, SlotVisitor};
pub use config::{BarrierSelector, BindingOptions, WeakProcessingMode};
pub use engine::GcEngine;
pub use error::{BindingError, ProtocolViolation};
pub use roots::{CodeId, RootCategory, ThreadSelector};
pub use slot::{PointerCodec, RefSlot, SlotRange};
pub use threads::{GcThreadKind, MutatorId};
pub use upcalls::Upcalls;
