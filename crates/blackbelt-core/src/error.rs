//! Shared error kinds for the analysis service.

use thiserror::Error;

/// Error kinds shared across store, analysis and boundary layers.
///
/// Tools never surface these: validation failures inside a tool are
/// packaged into the result envelope's `errors` with `success = false`.
/// Everything outside the tool contract propagates `EngineError` with `?`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Input shape or constraint violation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Lookup of an unregistered tool key.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Referenced batch / node / parameter / instruction does not exist.
    /// Some read paths return empty instead; specified per operation.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Not enough data to run an analysis (fewer than 2 points for SPC,
    /// zero categorical total for Pareto).
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Instruction lifecycle transition not permitted from the current
    /// status.
    #[error("bad transition: {0}")]
    BadTransition(String),

    /// Store I/O failure; retry-safe, no partial writes.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}
