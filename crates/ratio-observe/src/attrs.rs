//! Span field names shared by Ratio instrumentation.
//!
//! Usable as `tracing::info_span!` field names and as OpenTelemetry attribute
//! keys once spans are bridged.

/// Id of the composite instance being driven.
pub const RATIO_INSTANCE_ID: &str = "ratio.instance_id";

/// Step id inside its parent composite.
pub const RATIO_EXECUTION_ID: &str = "ratio.execution_id";

/// Process record of the invocation.
pub const RATIO_PROCESS_ID: &str = "ratio.process_id";

/// Definition path (or label) being executed.
pub const RATIO_DEFINITION: &str = "ratio.definition";

/// Terminal status of the invocation.
pub const RATIO_STATUS: &str = "ratio.status";
