//! correlate-core: Core library for correlate
//!
//! This crate provides request/response correlation for asynchronous
//! transports: register continuations when a request goes out, resolve them
//! when the matching response comes back, and reject them if a timeout fires
//! first.
//!
//! # Architecture
//!
//! ```text
//! Caller ──register──► CorrelationTable ◄──resolve── Transport
//!                          │      ▲
//!                 schedule │      │ expire
//!                          ▼      │
//!                       TimerService
//!
//! MessageTable = CorrelationTable<RequestId, M> + id extractor
//! ```
//!
//! # Modules
//!
//! - `table`: Generic keyed correlation table
//! - `message`: Message-keyed table and request identifiers
//! - `timer`: Timer services (tokio-backed and deterministic)
//! - `delay`: Timeout durations and their serde form
//! - `replay`: Deterministic scripted replays
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod delay;
pub mod error;
pub mod logging;
pub mod message;
pub mod replay;
pub mod table;
pub mod timer;

pub use delay::Delay;
pub use error::{Error, Result, TimedOut};
pub use message::{Correlated, MessageOptions, MessageTable, Registration, RequestId};
pub use table::{CorrelationTable, RegisterOptions, TableStats};
pub use timer::{ManualTimer, TimerService, TimerToken, TokioTimer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
