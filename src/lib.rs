//! Core of a UPS scheduler/dispatcher: the event-driven timer daemon
//! (`upssched`) and the tracked-request IPC layer used to talk to a
//! running driver (`upsdrvquery`).
//!
//! See the individual modules for the six components this crate is built
//! from (`codec` through `tracked`); `config`, `spawn`, `sockutil`, and
//! `error` are the ambient plumbing that ties them into runnable binaries.

pub mod codec;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod registry;
pub mod sockutil;
pub mod spawn;
pub mod timer;
pub mod tracked;

pub use error::{Result, UpsError};
