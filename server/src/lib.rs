//! FxRates Service
//!
//! Wires the rate engine to Postgres and the HTTP provider and runs the
//! background refresh and cache cleanup tasks.

pub mod config;
pub mod service;

pub use config::ServerConfig;
pub use service::{FxService, ServiceState};
