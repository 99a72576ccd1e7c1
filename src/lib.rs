//! Relay - memory-aware task coordination for capacity-limited workers

pub mod commands;
pub mod config;
pub mod coord;
pub mod error;
pub mod subprocess;
pub mod telemetry;
pub mod template;
