//! Execution context thread and its message loop

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use cadex_kernel::CadKernel;
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, info, trace};

use super::ExecutionContext;
use crate::config::EngineConfig;
use crate::constants::{CONTEXT_STACK_SIZE, CONTEXT_THREAD_NAME};
use crate::protocol::{ContextMessage, Envelope, HostMessage, RequestId};

/// Context to host half of the message channel
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: UnboundedSender<Envelope<ContextMessage>>,
}

impl Outbox {
    pub fn new(tx: UnboundedSender<Envelope<ContextMessage>>) -> Self {
        Self { tx }
    }

    /// Send an uncorrelated notification
    pub fn notify(&self, message: ContextMessage) {
        self.send(Envelope::notification(message));
    }

    /// Send the response settling request `id`
    pub fn respond(&self, id: Option<RequestId>, message: ContextMessage) {
        self.send(Envelope { id, message });
    }

    fn send(&self, envelope: Envelope<ContextMessage>) {
        trace!("context -> host: {}", envelope.message.name());
        if self.tx.send(envelope).is_err() {
            debug!("Host side closed, dropping message");
        }
    }
}

/// Sends `workingReset` when dropped, including during unwinding
pub(crate) struct WorkingGuard {
    outbox: Outbox,
}

impl WorkingGuard {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

impl Drop for WorkingGuard {
    fn drop(&mut self) {
        self.outbox.notify(ContextMessage::WorkingReset);
    }
}

/// Host-side handle to a running context thread
#[derive(Debug)]
pub struct ContextHandle {
    pub sender: Sender<Envelope<HostMessage>>,
    pub events: UnboundedReceiver<Envelope<ContextMessage>>,
    pub thread: JoinHandle<()>,
}

/// Start an execution context on its own named thread
///
/// The context announces `ready` once its script engine exists and then
/// serves requests in order until every sender is dropped.
pub fn spawn(kernel: Arc<dyn CadKernel>, config: EngineConfig) -> io::Result<ContextHandle> {
    let (sender, inbox) = crossbeam_channel::unbounded();
    let (events_tx, events) = unbounded_channel();
    let outbox = Outbox::new(events_tx);

    let thread = std::thread::Builder::new()
        .name(CONTEXT_THREAD_NAME.to_string())
        .stack_size(CONTEXT_STACK_SIZE)
        .spawn(move || {
            let context = ExecutionContext::new(kernel, config, outbox);
            run(context, inbox);
        })?;

    Ok(ContextHandle {
        sender,
        events,
        thread,
    })
}

fn run(mut context: ExecutionContext, inbox: Receiver<Envelope<HostMessage>>) {
    info!("Execution context ready (kernel: {})", context.kernel_name());
    context.outbox().notify(ContextMessage::Ready);

    for envelope in inbox.iter() {
        context.handle(envelope);
    }
    info!("Execution context stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EvaluateRequest, RenderRequest};
    use cadex_kernel::TruckKernel;

    async fn next(events: &mut UnboundedReceiver<Envelope<ContextMessage>>) -> Envelope<ContextMessage> {
        events.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_ready_then_ordered_responses() {
        let mut handle = spawn(Arc::new(TruckKernel::new()), EngineConfig::default()).unwrap();
        assert_eq!(next(&mut handle.events).await.message, ContextMessage::Ready);

        let eval_id = RequestId::new();
        handle
            .sender
            .send(Envelope::request(
                eval_id,
                HostMessage::Evaluate(EvaluateRequest {
                    code: "Box(10, 10, 10, true);".into(),
                    ..Default::default()
                }),
            ))
            .unwrap();
        let render_id = RequestId::new();
        handle
            .sender
            .send(Envelope::request(
                render_id,
                HostMessage::CombineAndRender(RenderRequest::default()),
            ))
            .unwrap();

        let mut responses = Vec::new();
        while responses.len() < 2 {
            let envelope = next(&mut handle.events).await;
            if envelope.id.is_some() {
                responses.push(envelope);
            }
        }
        assert_eq!(responses[0].id, Some(eval_id));
        match &responses[0].message {
            ContextMessage::CombineAndRender(result) => {
                assert!(!result.empty);
                assert!(result.mesh.vertex_count() >= 8);
                assert!(result.mesh.triangle_count() >= 12);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(responses[1].id, Some(render_id));
        assert!(matches!(
            &responses[1].message,
            ContextMessage::CombineAndRender(result) if result.empty
        ));

        drop(handle.sender);
        handle.thread.join().unwrap();
    }

    #[test]
    fn test_guard_sends_on_drop() {
        let (tx, mut rx) = unbounded_channel();
        let outbox = Outbox::new(tx);
        {
            let _guard = WorkingGuard::new(outbox.clone());
        }
        assert_eq!(rx.try_recv().unwrap().message, ContextMessage::WorkingReset);
    }
}
