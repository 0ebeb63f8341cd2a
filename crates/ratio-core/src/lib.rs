//! Composition execution engine and collaborator traits for Ratio.
//!
//! This crate defines the engine (reference resolution, condition
//! evaluation, the transform pipeline, dependency graphs, and the instance
//! scheduler) plus the "ports" the infrastructure layer implements:
//! [`executor::Executor`], [`definition::DefinitionLoader`], and
//! [`storage::FileStore`]. It depends only on `ratio-types`, never on
//! `ratio-infra` or any filesystem crate.

pub mod condition;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod process;
pub mod reference;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod transform;

pub use error::EngineError;
pub use runtime::{RunHandle, Runtime};
