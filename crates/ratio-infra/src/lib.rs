//! Infrastructure layer for Ratio.
//!
//! Contains implementations of the ports defined in `ratio-core`: the
//! filesystem definition loader, versioned file stores (in-memory and local
//! filesystem), the loopback executor for built-in primitive endpoints, and
//! the `config.toml` loader.

pub mod config;
pub mod executor;
pub mod loader;
pub mod storage;
