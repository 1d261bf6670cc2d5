//! Interface exception collector process.
//!
//! The binary in `main.rs` wires the runtime to `PostgreSQL` and Redpanda;
//! this library exposes its configuration so it can be tested without
//! touching the process environment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

pub use config::{Config, DeadLetterTarget};
