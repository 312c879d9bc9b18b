//! Batch export scheduler
//!
//! Runs a list of export jobs one after another through a [`HostBridge`],
//! publishing [`BatchProgress`] after every item. Failures are collected
//! without halting the batch; cancellation is cooperative and checked
//! before each item.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cadex_core::{ExportFormat, ExportRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::HostBridge;
use crate::error::BatchError;

/// Per-item export settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportOptions {
    pub quality: Option<f64>,
    pub binary_stl: Option<bool>,
    pub include_normals: Option<bool>,
}

/// One job of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportItem {
    pub id: String,
    pub file_name: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub settings: ExportOptions,
}

impl ExportItem {
    pub fn new(id: impl Into<String>, file_name: impl Into<String>, format: ExportFormat) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            format,
            settings: ExportOptions::default(),
        }
    }

    pub fn to_request(&self) -> ExportRequest {
        ExportRequest {
            format: self.format,
            file_name: self.file_name.clone(),
            quality: self.settings.quality,
            binary_stl: self.settings.binary_stl,
            include_normals: self.settings.include_normals,
        }
    }
}

/// Progress snapshot of a running batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percentage: u32,
}

impl BatchProgress {
    pub fn new(total: usize, completed: usize, failed: usize) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            (100.0 * completed as f64 / total as f64).round() as u32
        };
        Self {
            total,
            completed,
            failed,
            percentage,
        }
    }

    /// Items attempted so far
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

/// A successfully exported item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutput {
    pub id: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// A failed item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of one batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<ItemOutput>,
    pub errors: Vec<ItemFailure>,
    pub cancelled: bool,
    pub progress: BatchProgress,
}

/// Destination for exported bytes
pub trait ExportSink {
    fn persist(&mut self, file_name: &str, data: &[u8]) -> io::Result<()>;
}

impl<F> ExportSink for F
where
    F: FnMut(&str, &[u8]) -> io::Result<()>,
{
    fn persist(&mut self, file_name: &str, data: &[u8]) -> io::Result<()> {
        self(file_name, data)
    }
}

/// Writes every export into one directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl DirectorySink {
    /// Create the sink, creating `dir` if needed
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            written: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Paths written so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl ExportSink for DirectorySink {
    fn persist(&mut self, file_name: &str, data: &[u8]) -> io::Result<()> {
        // Keep only the final component so a name cannot escape the directory
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid file name '{file_name}'")))?;
        let path = self.dir.join(name);
        std::fs::write(&path, data)?;
        debug!("Wrote {} bytes to {}", data.len(), path.display());
        self.written.push(path);
        Ok(())
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    current_item: Option<String>,
}

/// Clears the run state and any cancel request on exit, including unwinding
struct RunGuard {
    state: Arc<Mutex<RunState>>,
    cancel: CancelToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.current_item = None;
        self.cancel.reset();
    }
}

/// Sequential exporter driving one bridge
#[derive(Clone)]
pub struct BatchExporter {
    bridge: HostBridge,
    pause: Duration,
    state: Arc<Mutex<RunState>>,
    cancel: CancelToken,
}

impl BatchExporter {
    pub fn new(bridge: HostBridge) -> Self {
        let pause = bridge.config().batch_pause();
        Self {
            bridge,
            pause,
            state: Arc::new(Mutex::new(RunState::default())),
            cancel: CancelToken::default(),
        }
    }

    /// Override the pause between items
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Id of the item being exported, if any
    pub fn current_item(&self) -> Option<String> {
        self.state.lock().current_item.clone()
    }

    /// Request cancellation; takes effect before the next item.
    ///
    /// A request made while idle cancels the next run before its first
    /// item. The request is cleared when a run finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Export `items` in order
    pub async fn run(
        &self,
        items: Vec<ExportItem>,
        sink: &mut (dyn ExportSink + Send),
        mut on_progress: impl FnMut(&BatchProgress),
    ) -> Result<BatchReport, BatchError> {
        let _guard = {
            let mut state = self.state.lock();
            if state.running {
                return Err(BatchError::AlreadyRunning);
            }
            state.running = true;
            RunGuard {
                state: self.state.clone(),
                cancel: self.cancel.clone(),
            }
        };

        let total = items.len();
        let item_timeout = self.bridge.config().timeouts.export_item();
        let mut report = BatchReport {
            progress: BatchProgress::new(total, 0, 0),
            ..Default::default()
        };
        info!("Batch export of {} item(s) started", total);
        on_progress(&report.progress);

        for (i, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Batch cancelled before item {} of {}", i + 1, total);
                report.cancelled = true;
                break;
            }
            self.state.lock().current_item = Some(item.id.clone());

            let outcome = self
                .bridge
                .export_file_within(item.to_request(), item_timeout)
                .await
                .map_err(|e| e.to_string())
                .and_then(|result| {
                    let file_name = result.file_name.unwrap_or_else(|| item.file_name.clone());
                    let data = result.data.unwrap_or_default();
                    sink.persist(&file_name, &data)
                        .map_err(|e| format!("failed to save {file_name}: {e}"))?;
                    Ok(ItemOutput {
                        id: item.id.clone(),
                        file_name,
                        data,
                    })
                });

            match outcome {
                Ok(output) => {
                    debug!("Item {} exported as {}", output.id, output.file_name);
                    report.results.push(output);
                }
                Err(error) => {
                    warn!("Item {} failed: {}", item.id, error);
                    report.errors.push(ItemFailure {
                        id: item.id.clone(),
                        error,
                    });
                }
            }

            report.progress = BatchProgress::new(total, report.results.len(), report.errors.len());
            on_progress(&report.progress);

            if i + 1 < total && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        info!(
            "Batch export finished: {} succeeded, {} failed{}",
            report.results.len(),
            report.errors.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }
}
