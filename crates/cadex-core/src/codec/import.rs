//! STEP/IGES import through a scratch file

use std::io::Write;

use cadex_kernel::{CadKernel, ReadStatus, Shape};
use tracing::{debug, info};

use super::{CodecError, ImportFormat};

/// Read exchange-file bytes into exactly one shape
///
/// A single root is returned as-is; several roots become one compound.
pub fn import_bytes(
    kernel: &dyn CadKernel,
    format: ImportFormat,
    bytes: &[u8],
) -> Result<Shape, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Import("file is empty".into()));
    }

    let mut scratch = tempfile::Builder::new()
        .prefix("cadex-import-")
        .suffix(format.scratch_suffix())
        .tempfile()
        .map_err(|e| CodecError::Io(e.to_string()))?;
    scratch
        .write_all(bytes)
        .and_then(|_| scratch.flush())
        .map_err(|e| CodecError::Io(e.to_string()))?;

    let outcome = kernel.read_file(format.exchange(), scratch.path())?;
    for message in &outcome.messages {
        debug!("{} reader: {}", format.name(), message);
    }

    if outcome.status != ReadStatus::Done {
        let detail = if outcome.messages.is_empty() {
            String::new()
        } else {
            format!(": {}", outcome.messages.join("; "))
        };
        return Err(CodecError::Import(format!(
            "{} reader returned {:?}{}",
            format.name(),
            outcome.status,
            detail
        )));
    }

    let mut roots = outcome.roots;
    let shape = match roots.len() {
        0 => {
            return Err(CodecError::Import(format!(
                "No valid shapes found in {} file",
                format.name()
            )));
        }
        1 => roots.remove(0),
        n => {
            debug!("Combining {} {} roots into a compound", n, format.name());
            kernel.make_compound(&roots)?
        }
    };
    info!("Imported {} {} shape", format.name(), shape.kind().name());
    Ok(shape)
}
