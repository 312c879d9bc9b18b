//! Host/context message protocol
//!
//! Every message travels inside an [`Envelope`] that serializes as
//! `{kind, payload, id?}`. Requests carry a fresh [`RequestId`]; the
//! context echoes it on the response that settles the request.
//! Notifications (`log`, `error` without id, `progress`, `workingReset`,
//! `ready`) carry no id.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::ExportFormat;
use crate::mesh::{EdgeBuffers, MeshBuffers};
use crate::params::{ParamValue, ParameterEntry};

/// Unique id correlating a request with its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire envelope `{kind, payload, id?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub message: M,
}

impl<M> Envelope<M> {
    /// Envelope correlated to a request
    pub fn request(id: RequestId, message: M) -> Self {
        Self {
            id: Some(id),
            message,
        }
    }

    /// Uncorrelated notification
    pub fn notification(message: M) -> Self {
        Self { id: None, message }
    }
}

/// Request kinds, used for the one-in-flight-per-kind rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Evaluate,
    CombineAndRender,
    ImportFile,
    ExportFile,
    ResetCache,
    GetParameters,
}

impl RequestKind {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Evaluate => "evaluate",
            RequestKind::CombineAndRender => "combineAndRender",
            RequestKind::ImportFile => "importFile",
            RequestKind::ExportFile => "exportFile",
            RequestKind::ResetCache => "resetCache",
            RequestKind::GetParameters => "getParameters",
        }
    }

    /// Whether the host shows a working indicator while this runs
    pub fn shows_working(&self) -> bool {
        matches!(
            self,
            RequestKind::Evaluate
                | RequestKind::CombineAndRender
                | RequestKind::ImportFile
                | RequestKind::ExportFile
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host to context messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum HostMessage {
    Evaluate(EvaluateRequest),
    CombineAndRender(RenderRequest),
    ImportFile(ImportRequest),
    ExportFile(ExportRequest),
    ResetCache,
    GetParameters,
}

impl HostMessage {
    pub fn kind(&self) -> RequestKind {
        match self {
            HostMessage::Evaluate(_) => RequestKind::Evaluate,
            HostMessage::CombineAndRender(_) => RequestKind::CombineAndRender,
            HostMessage::ImportFile(_) => RequestKind::ImportFile,
            HostMessage::ExportFile(_) => RequestKind::ExportFile,
            HostMessage::ResetCache => RequestKind::ResetCache,
            HostMessage::GetParameters => RequestKind::GetParameters,
        }
    }
}

/// Context to host messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum ContextMessage {
    /// Script engine constructed, requests may flow
    Ready,
    CombineAndRender(RenderResult),
    ImportFile(ImportResult),
    ExportFile(ExportResult),
    /// Cache cleared
    ResetCache,
    GetParameters(BTreeMap<String, ParameterEntry>),
    Log(LogPayload),
    Error(ErrorPayload),
    /// Working indicator must clear
    WorkingReset,
    Progress(ProgressPayload),
}

impl ContextMessage {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            ContextMessage::Ready => "ready",
            ContextMessage::CombineAndRender(_) => "combineAndRender",
            ContextMessage::ImportFile(_) => "importFile",
            ContextMessage::ExportFile(_) => "exportFile",
            ContextMessage::ResetCache => "resetCache",
            ContextMessage::GetParameters(_) => "getParameters",
            ContextMessage::Log(_) => "log",
            ContextMessage::Error(_) => "error",
            ContextMessage::WorkingReset => "workingReset",
            ContextMessage::Progress(_) => "progress",
        }
    }
}

/// `evaluate` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub code: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deviation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_options: Option<serde_json::Value>,
}

/// `combineAndRender` request payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deviation: Option<f64>,
    #[serde(default)]
    pub scene_options: serde_json::Value,
}

/// `combineAndRender` response payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    pub mesh: MeshBuffers,
    pub edges: EdgeBuffers,
    pub scene_options: serde_json::Value,
    /// No scene shapes were available
    pub empty: bool,
}

impl RenderResult {
    /// Explicit empty result
    pub fn empty(scene_options: serde_json::Value) -> Self {
        Self {
            scene_options,
            empty: true,
            ..Default::default()
        }
    }
}

/// `importFile` request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub file_name: String,
    /// Lowercase extension: step, stp, iges or igs
    pub file_type: String,
    pub file_content: Vec<u8>,
}

/// Description of an imported shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeInfo {
    #[serde(rename = "type")]
    pub shape_type: String,
    pub source: String,
    pub format: String,
}

/// `importFile` response payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_info: Option<ShapeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshBuffers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportResult {
    pub fn succeeded(shape_info: ShapeInfo, mesh: MeshBuffers) -> Self {
        Self {
            success: true,
            shape_info: Some(shape_info),
            mesh: Some(mesh),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            shape_info: None,
            mesh: None,
            error: Some(error.into()),
        }
    }
}

/// `exportFile` request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub file_name: String,
    /// Mesh quality in (0, 1]; higher is finer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_stl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_normals: Option<bool>,
}

impl ExportRequest {
    pub fn new(format: ExportFormat, file_name: impl Into<String>) -> Self {
        Self {
            format,
            file_name: file_name.into(),
            quality: None,
            binary_stl: None,
            include_normals: None,
        }
    }
}

/// `exportFile` response payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ExportFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportResult {
    pub fn succeeded(format: ExportFormat, file_name: String, data: Vec<u8>) -> Self {
        Self {
            success: true,
            format: Some(format),
            file_name: Some(file_name),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            format: None,
            file_name: None,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// `progress` payload; an empty `op_type` marks completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub op_number: u64,
    pub op_type: String,
}

/// `error` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            operation: None,
            line: None,
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.operation, self.line) {
            (Some(op), Some(line)) => write!(f, "{} (in {} at line {})", self.message, op, line),
            (Some(op), None) => write!(f, "{} (in {})", self.message, op),
            (None, Some(line)) => write!(f, "{} (at line {})", self.message, line),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Severity of a `log` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// `log` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
}
