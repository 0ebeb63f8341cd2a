//! Shared domain types for Ratio.
//!
//! This crate contains the types passed between the engine, its collaborators,
//! and the CLI: the `Value` union, definition and step documents, condition
//! trees, process records, engine events, configuration, and storage metadata.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod process;
pub mod storage;
pub mod value;
