//! cadex bridge
//!
//! Host side of the engine:
//! - [`HostBridge`]: request/response proxy to one execution context
//! - [`BatchExporter`]: sequential export jobs with progress and cancellation

pub mod batch;
pub mod bridge;
pub mod error;

pub use batch::{
    BatchExporter, BatchProgress, BatchReport, CancelToken, DirectorySink, ExportItem,
    ExportOptions, ExportSink, ItemFailure, ItemOutput,
};
pub use bridge::{BridgeEvent, ContextState, HostBridge, Observer};
pub use error::{BatchError, BridgeError, BridgeResult};
