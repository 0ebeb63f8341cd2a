//! Observability setup for Ratio: subscriber initialization and span field
//! names.

pub mod attrs;
pub mod tracing_setup;
