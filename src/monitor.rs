//! Connectivity, app-state, and battery monitors feeding the polling engine.

pub mod connection;
pub mod device;
