//! Bridge and batch errors

use std::time::Duration;

use cadex_core::{CodecError, ErrorPayload, RequestKind};

/// Errors surfaced by [`HostBridge`](crate::HostBridge) calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Execution context not initialized: {0}")]
    Initialization(String),
    #[error("A {0} request is already in flight")]
    RequestInFlight(RequestKind),
    #[error("{kind} request timed out after {}ms", .after.as_millis())]
    Timeout { kind: RequestKind, after: Duration },
    #[error("{0}")]
    Evaluation(ErrorPayload),
    #[error("Execution context terminated")]
    ContextTerminated,
    #[error("Unexpected '{got}' response to {kind} request")]
    UnexpectedResponse { kind: RequestKind, got: &'static str },
    #[error("Import failed: {0}")]
    Import(String),
    #[error("Export failed: {0}")]
    Export(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BridgeError {
    /// Whether the bridge must be recreated
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Initialization(_) | BridgeError::ContextTerminated)
    }
}

/// Errors refusing a whole batch run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("A batch export is already running")]
    AlreadyRunning,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
