//! Import/export codec
//!
//! Converts between exchange-file bytes and kernel shapes. The codec never
//! persists anything: imports are staged through auto-deleted scratch files
//! and exports return an in-memory buffer plus a suggested file name.
//! Unsupported extensions and formats are rejected before any kernel call.

mod export;
mod import;

use std::fmt;
use std::path::Path;

use cadex_kernel::{CadError, ExchangeFormat};
use serde::{Deserialize, Serialize};

pub use export::{ExportOutput, ExportSettings, export_shapes};
pub use import::import_bytes;

/// Formats accepted by the importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportFormat {
    Step,
    Iges,
}

impl ImportFormat {
    /// Detect format from an extension (case-insensitive, without the dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "step" | "stp" => Some(ImportFormat::Step),
            "iges" | "igs" => Some(ImportFormat::Iges),
            _ => None,
        }
    }

    /// Detect format from a file name
    pub fn from_file_name(file_name: &str) -> Result<Self, CodecError> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        Self::from_extension(ext).ok_or_else(|| CodecError::UnsupportedExtension(ext.to_string()))
    }

    /// Get format name
    pub fn name(&self) -> &'static str {
        match self {
            ImportFormat::Step => "STEP",
            ImportFormat::Iges => "IGES",
        }
    }

    pub(crate) fn exchange(&self) -> ExchangeFormat {
        match self {
            ImportFormat::Step => ExchangeFormat::Step,
            ImportFormat::Iges => ExchangeFormat::Iges,
        }
    }

    fn scratch_suffix(&self) -> &'static str {
        match self {
            ImportFormat::Step => ".step",
            ImportFormat::Iges => ".iges",
        }
    }
}

/// Extensions replaced when naming an export
const KNOWN_EXTENSIONS: &[&str] = &["step", "stp", "iges", "igs", "stl", "obj"];

/// Formats produced by the exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Step,
    Stl,
    Obj,
}

impl ExportFormat {
    pub const ALL: &'static [ExportFormat] = &[ExportFormat::Step, ExportFormat::Stl, ExportFormat::Obj];

    /// Parse a format name (case-insensitive)
    pub fn parse(name: &str) -> Result<Self, CodecError> {
        match name.trim().to_lowercase().as_str() {
            "step" | "stp" => Ok(ExportFormat::Step),
            "stl" => Ok(ExportFormat::Stl),
            "obj" => Ok(ExportFormat::Obj),
            other => Err(CodecError::UnsupportedFormat(other.to_string())),
        }
    }

    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Step => "step",
            ExportFormat::Stl => "stl",
            ExportFormat::Obj => "obj",
        }
    }

    /// Get format name
    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Step => "STEP",
            ExportFormat::Stl => "STL",
            ExportFormat::Obj => "OBJ",
        }
    }

    /// The requested name with this format's extension.
    ///
    /// Only a known CAD or mesh extension is replaced, so `bracket.v2`
    /// keeps its dotted suffix.
    pub fn file_name(&self, requested: &str) -> String {
        let path = Path::new(requested);
        let known = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| KNOWN_EXTENSIONS.iter().any(|k| e.eq_ignore_ascii_case(k)));
        let base = if known { path.file_stem() } else { path.file_name() };
        let stem = base
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("export");
        format!("{}.{}", stem, self.extension())
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Codec errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported file extension '.{0}' (expected .step, .stp, .iges or .igs)")]
    UnsupportedExtension(String),
    #[error("Unsupported export format '{0}' (expected step, stl or obj)")]
    UnsupportedFormat(String),
    #[error("Import failed: {0}")]
    Import(String),
    #[error("Export failed: {0}")]
    Export(String),
    #[error("no shapes to export")]
    NoShapes,
    #[error("Export quality must be in (0, 1], got {0}")]
    InvalidQuality(f64),
    #[error("IO error: {0}")]
    Io(String),
    #[error(transparent)]
    Kernel(#[from] CadError),
}
