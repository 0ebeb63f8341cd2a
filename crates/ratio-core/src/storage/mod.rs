//! Storage collaborator port.
//!
//! Defines the versioned file store trait and a credential-bound, caching
//! accessor used by reference resolution and the file builtins.
//! Implementations live in ratio-infra.

pub mod access;
pub mod file_store;

pub use access::FileAccess;
pub use file_store::{FileStore, validate_path};
