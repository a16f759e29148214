//! Application layer: the dashboard views the binary runs.

pub mod error;
pub mod monitor;
