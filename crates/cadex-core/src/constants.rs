//! Global constants for cadex-core

/// Chordal deviation for preview meshes
pub const DEFAULT_DEVIATION: f64 = 0.1;

/// Chordal deviation for exported meshes at quality 1.0
pub const EXPORT_DEVIATION: f64 = 0.01;

/// Timeout for evaluate requests (milliseconds)
pub const EVALUATE_TIMEOUT_MS: u64 = 60_000;

/// Timeout for combine-and-render requests (milliseconds)
pub const COMBINE_TIMEOUT_MS: u64 = 10_000;

/// Timeout for import requests (milliseconds)
pub const IMPORT_TIMEOUT_MS: u64 = 60_000;

/// Timeout for one export item (milliseconds)
pub const EXPORT_ITEM_TIMEOUT_MS: u64 = 60_000;

/// Timeout for small control requests such as cache resets (milliseconds)
pub const CONTROL_TIMEOUT_MS: u64 = 5_000;

/// How long to wait for the context to announce readiness (milliseconds)
pub const READY_TIMEOUT_MS: u64 = 10_000;

/// Pause between batch items so an observer can render progress (milliseconds)
pub const BATCH_PAUSE_MS: u64 = 50;

/// Maximum number of script operations per evaluation
pub const SCRIPT_MAX_OPERATIONS: u64 = 5_000_000;

/// Maximum script expression nesting depth
pub const SCRIPT_MAX_EXPR_DEPTH: usize = 64;

/// Stack size of the execution context thread (bytes)
pub const CONTEXT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Name of the execution context thread
pub const CONTEXT_THREAD_NAME: &str = "cadex-context";
