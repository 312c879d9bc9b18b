//! Host bridge
//!
//! Proxy for one execution context. Requests are correlated with their
//! responses by a fresh [`RequestId`]; at most one request of each kind may
//! be outstanding. Every request is bounded by the timeout of its class and
//! settles exactly once: with the correlated response, an `error` response,
//! the timeout, or context termination.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadex_core::{
    ContextMessage, EngineConfig, Envelope, ErrorPayload, EvaluateRequest, ExportRequest,
    ExportResult, HostMessage, ImportFormat, ImportRequest, ImportResult, LogPayload, ParamValue,
    ParameterEntry, ProgressPayload, RenderRequest, RenderResult, RequestId, RequestKind,
};
use cadex_kernel::CadKernel;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

/// Lifecycle of the connected context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Starting,
    Ready,
    Terminated,
}

/// Notifications delivered to the observer outside request/response pairing
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Log(LogPayload),
    Error(ErrorPayload),
    Progress(ProgressPayload),
    WorkingReset,
    Terminated,
}

pub type Observer = Arc<dyn Fn(BridgeEvent) + Send + Sync>;

type Settle = oneshot::Sender<BridgeResult<ContextMessage>>;

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    created_at: Instant,
    settle: Settle,
}

struct Inner {
    sender: Mutex<Option<Sender<Envelope<HostMessage>>>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    state: watch::Sender<ContextState>,
    observer: Option<Observer>,
}

impl Inner {
    fn notify(&self, event: BridgeEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    /// Reject everything still pending and refuse further requests
    fn shut_down(&self) {
        self.sender.lock().take();
        let previous = self.state.send_replace(ContextState::Terminated);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (id, request) in pending {
            debug!("Rejecting pending {} request {}", request.kind, id);
            let _ = request.settle.send(Err(BridgeError::ContextTerminated));
        }
        if previous != ContextState::Terminated {
            info!("Execution context terminated");
            self.notify(BridgeEvent::Terminated);
        }
    }

    fn dispatch(&self, envelope: Envelope<ContextMessage>) {
        let Envelope { id, message } = envelope;
        if let Some(id) = id {
            let Some(request) = self.pending.lock().remove(&id) else {
                debug!("Dropping stale '{}' response for {}", message.name(), id);
                return;
            };
            debug!(
                "{} request {} settled after {:?}",
                request.kind,
                id,
                request.created_at.elapsed()
            );
            let result = match message {
                ContextMessage::Error(payload) => Err(BridgeError::Evaluation(payload)),
                other => Ok(other),
            };
            let _ = request.settle.send(result);
            return;
        }

        match message {
            ContextMessage::Ready => {
                info!("Execution context ready");
                self.state.send_replace(ContextState::Ready);
            }
            ContextMessage::Log(payload) => self.notify(BridgeEvent::Log(payload)),
            ContextMessage::Error(payload) => {
                warn!("Context error: {}", payload);
                self.notify(BridgeEvent::Error(payload));
            }
            ContextMessage::Progress(payload) => self.notify(BridgeEvent::Progress(payload)),
            ContextMessage::WorkingReset => self.notify(BridgeEvent::WorkingReset),
            other => debug!("Ignoring uncorrelated '{}' message", other.name()),
        }
    }
}

async fn pump(inner: Arc<Inner>, mut events: UnboundedReceiver<Envelope<ContextMessage>>) {
    while let Some(envelope) = events.recv().await {
        inner.dispatch(envelope);
    }
    inner.shut_down();
}

/// Main-side proxy to one execution context
#[derive(Clone)]
pub struct HostBridge {
    inner: Arc<Inner>,
    config: Arc<EngineConfig>,
}

impl HostBridge {
    /// Spawn a context thread and connect to it
    ///
    /// Must be called inside a Tokio runtime. Requests are rejected until
    /// the context announces readiness; see [`wait_ready`](Self::wait_ready).
    pub fn spawn(
        kernel: Arc<dyn CadKernel>,
        config: EngineConfig,
        observer: Option<Observer>,
    ) -> BridgeResult<Self> {
        config
            .validate()
            .map_err(|e| BridgeError::Initialization(e.to_string()))?;
        let handle = cadex_core::spawn(kernel, config.clone())
            .map_err(|e| BridgeError::Initialization(format!("failed to start context thread: {e}")))?;
        debug!("Context thread {:?} started", handle.thread.thread().name());
        Ok(Self::connect(handle.sender, handle.events, config, observer))
    }

    /// Spawn a context and wait until it is ready
    pub async fn create(
        kernel: Arc<dyn CadKernel>,
        config: EngineConfig,
        observer: Option<Observer>,
    ) -> BridgeResult<Self> {
        let ready_timeout = config.timeouts.ready();
        let bridge = Self::spawn(kernel, config, observer)?;
        bridge.wait_ready(ready_timeout).await?;
        Ok(bridge)
    }

    /// Attach to an existing pair of channels
    pub fn connect(
        sender: Sender<Envelope<HostMessage>>,
        events: UnboundedReceiver<Envelope<ContextMessage>>,
        config: EngineConfig,
        observer: Option<Observer>,
    ) -> Self {
        let (state, _) = watch::channel(ContextState::Starting);
        let inner = Arc::new(Inner {
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(HashMap::new()),
            state,
            observer,
        });
        tokio::spawn(pump(inner.clone(), events));
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> ContextState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ContextState::Ready
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Wait for the context's `ready` announcement
    pub async fn wait_ready(&self, timeout: Duration) -> BridgeResult<()> {
        let mut state = self.inner.state.subscribe();
        let settled = tokio::time::timeout(timeout, state.wait_for(|s| *s != ContextState::Starting)).await;
        match settled {
            Ok(Ok(s)) if *s == ContextState::Ready => Ok(()),
            Ok(_) => Err(BridgeError::ContextTerminated),
            Err(_) => Err(BridgeError::Initialization(format!(
                "context not ready after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Send a request and await its correlated response
    pub async fn send(&self, message: HostMessage, timeout: Duration) -> BridgeResult<ContextMessage> {
        let kind = message.kind();
        match self.state() {
            ContextState::Starting => {
                return Err(BridgeError::Initialization("context is not ready".into()));
            }
            ContextState::Terminated => return Err(BridgeError::ContextTerminated),
            ContextState::Ready => {}
        }

        let id = RequestId::new();
        let (settle, settled) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.values().any(|p| p.kind == kind) {
                return Err(BridgeError::RequestInFlight(kind));
            }
            pending.insert(
                id,
                PendingRequest {
                    kind,
                    created_at: Instant::now(),
                    settle,
                },
            );
        }

        let sent = match self.inner.sender.lock().as_ref() {
            Some(sender) => sender.send(Envelope::request(id, message)).is_ok(),
            None => false,
        };
        if !sent {
            self.inner.pending.lock().remove(&id);
            self.inner.shut_down();
            return Err(BridgeError::ContextTerminated);
        }
        debug!("Sent {} request {} (timeout {:?})", kind, id, timeout);

        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ContextTerminated),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!("{} request {} timed out after {:?}", kind, id, timeout);
                Err(BridgeError::Timeout { kind, after: timeout })
            }
        }
    }

    /// Evaluate a script; resolves with its render
    pub async fn evaluate(
        &self,
        code: impl Into<String>,
        parameters: BTreeMap<String, ParamValue>,
    ) -> BridgeResult<RenderResult> {
        self.evaluate_with(EvaluateRequest {
            code: code.into(),
            parameters,
            ..Default::default()
        })
        .await
    }

    pub async fn evaluate_with(&self, request: EvaluateRequest) -> BridgeResult<RenderResult> {
        let response = self
            .send(HostMessage::Evaluate(request), self.config.timeouts.evaluate())
            .await?;
        match response {
            ContextMessage::CombineAndRender(result) => Ok(result),
            other => Err(unexpected(RequestKind::Evaluate, &other)),
        }
    }

    pub async fn combine_and_render(
        &self,
        max_deviation: Option<f64>,
        scene_options: serde_json::Value,
    ) -> BridgeResult<RenderResult> {
        let request = RenderRequest {
            max_deviation,
            scene_options,
        };
        let response = self
            .send(HostMessage::CombineAndRender(request), self.config.timeouts.combine())
            .await?;
        match response {
            ContextMessage::CombineAndRender(result) => Ok(result),
            other => Err(unexpected(RequestKind::CombineAndRender, &other)),
        }
    }

    /// Import a STEP/IGES file; the extension is checked before sending
    pub async fn import_file(&self, file_name: &str, content: Vec<u8>) -> BridgeResult<ImportResult> {
        ImportFormat::from_file_name(file_name)?;
        let file_type = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let request = ImportRequest {
            file_name: file_name.to_string(),
            file_type,
            file_content: content,
        };
        let response = self
            .send(HostMessage::ImportFile(request), self.config.timeouts.import())
            .await?;
        match response {
            ContextMessage::ImportFile(result) if result.success => Ok(result),
            ContextMessage::ImportFile(result) => Err(BridgeError::Import(
                result.error.unwrap_or_else(|| "unknown error".into()),
            )),
            other => Err(unexpected(RequestKind::ImportFile, &other)),
        }
    }

    /// Export the context's shapes with the per-item timeout
    pub async fn export_file(&self, request: ExportRequest) -> BridgeResult<ExportResult> {
        self.export_file_within(request, self.config.timeouts.export_item())
            .await
    }

    pub async fn export_file_within(
        &self,
        request: ExportRequest,
        timeout: Duration,
    ) -> BridgeResult<ExportResult> {
        let response = self.send(HostMessage::ExportFile(request), timeout).await?;
        match response {
            ContextMessage::ExportFile(result) if result.success => Ok(result),
            ContextMessage::ExportFile(result) => Err(BridgeError::Export(
                result.error.unwrap_or_else(|| "unknown error".into()),
            )),
            other => Err(unexpected(RequestKind::ExportFile, &other)),
        }
    }

    pub async fn reset_cache(&self) -> BridgeResult<()> {
        match self
            .send(HostMessage::ResetCache, self.config.timeouts.control())
            .await?
        {
            ContextMessage::ResetCache => Ok(()),
            other => Err(unexpected(RequestKind::ResetCache, &other)),
        }
    }

    pub async fn get_parameters(&self) -> BridgeResult<BTreeMap<String, ParameterEntry>> {
        match self
            .send(HostMessage::GetParameters, self.config.timeouts.control())
            .await?
        {
            ContextMessage::GetParameters(params) => Ok(params),
            other => Err(unexpected(RequestKind::GetParameters, &other)),
        }
    }

    /// Disconnect from the context and reject everything pending
    pub fn terminate(&self) {
        self.inner.shut_down();
    }
}

fn unexpected(kind: RequestKind, got: &ContextMessage) -> BridgeError {
    BridgeError::UnexpectedResponse {
        kind,
        got: got.name(),
    }
}
