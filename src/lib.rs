//! Marionette: a GUI-agent task execution service.
//!
//! Clients submit natural-language instructions; a bounded pool of
//! dispatchers drives a plan/act/reflect loop against a sandboxed display,
//! streams progress events to subscribers and persists task state durably.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod services;

pub use domain::{CoreError, CoreResult};
pub use services::{Config, ConfigError};
