//! cadex core
//!
//! This crate contains everything that runs inside the execution context:
//! - Protocol: messages exchanged with the host bridge
//! - Script: sandboxed Rhai standard library for building shapes
//! - Cache and parameter store owned by the context
//! - Mesh extraction and the STEP/IGES/STL/OBJ codec
//! - Context: the worker thread that serves host requests

pub mod cache;
pub mod codec;
pub mod config;
pub mod constants;
pub mod context;
pub mod mesh;
pub mod params;
pub mod protocol;
pub mod script;

pub use cache::{CacheStats, MemoCache, StructuralHasher};
pub use codec::{CodecError, ExportFormat, ExportSettings, ImportFormat};
pub use config::{ConfigError, EngineConfig, ScriptConfig, TimeoutConfig};
pub use constants::*;
pub use context::{ContextHandle, ExecutionContext, Outbox, spawn};
pub use mesh::{EdgeBuffers, Extraction, MeshBuffers};
pub use params::{Control, ParamError, ParamValue, ParameterEntry, ParameterStore};
pub use protocol::*;
pub use script::{PassSummary, ScriptEngine, ScriptError};
