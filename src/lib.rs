//! Lain – an autonomous chat agent for IRC-style networks
//!
//! This crate implements:
//! - A parser for the wire grammar and for operator-authored commands
//! - An in-process event bus with concurrent, isolated handlers
//! - A durable, ordered message log with one writer and many readers
//! - A generation gateway that turns chat history into replies via a remote model
//! - A transport that frames lines, answers liveness probes and sends replies

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules: grammar, bus, log, gateway and transport
pub mod runtime;

// Re-export key types for convenience
pub use runtime::bus::{Event, EventBus, EventKind};
pub use runtime::message::{Message, parse_authored, parse_wire};
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of Lain
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
