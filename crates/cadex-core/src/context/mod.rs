//! Execution context
//!
//! Owns the script engine, the scene, the parameter store and the memo
//! cache, and serves host requests one at a time on its own thread. Every
//! request gets exactly one correlated response: the handler's result, or
//! an `error` message when the handler fails or panics.

mod worker;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use cadex_kernel::{CadKernel, CadResult, Shape};
use tracing::{debug, error, info, warn};

use crate::codec::{ExportSettings, ImportFormat, export_shapes, import_bytes};
use crate::config::EngineConfig;
use crate::mesh::{extract, extract_mesh};
use crate::protocol::{
    ContextMessage, Envelope, ErrorPayload, EvaluateRequest, ExportRequest, ExportResult,
    HostMessage, ImportRequest, ImportResult, LogPayload, ProgressPayload, RenderResult,
    RequestId, ShapeInfo,
};
use crate::script::{LogSink, ScriptEngine};

pub use worker::{ContextHandle, Outbox, spawn};
use worker::WorkingGuard;

/// Per-thread kernel state and request handlers
pub struct ExecutionContext {
    config: EngineConfig,
    script: ScriptEngine,
    outbox: Outbox,
    /// Shapes of the last non-empty render; exported when the scene is empty
    rendered: Vec<Shape>,
    op_number: u64,
}

impl ExecutionContext {
    pub fn new(kernel: Arc<dyn CadKernel>, config: EngineConfig, outbox: Outbox) -> Self {
        let log_outbox = outbox.clone();
        let log: LogSink = Arc::new(move |payload: LogPayload| {
            log_outbox.notify(ContextMessage::Log(payload));
        });
        let script = ScriptEngine::new(kernel, &config.script, log);
        Self {
            config,
            script,
            outbox,
            rendered: Vec::new(),
            op_number: 0,
        }
    }

    pub fn kernel_name(&self) -> &str {
        self.script.kernel().name()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Shapes waiting for the next combine
    pub fn scene_len(&self) -> usize {
        self.script.scene().len()
    }

    /// Serve one request; panics become `error` responses
    pub fn handle(&mut self, envelope: Envelope<HostMessage>) {
        let Envelope { id, message } = envelope;
        let kind = message.kind();
        debug!("Handling {} ({})", kind, id.map(|i| i.to_string()).unwrap_or_default());

        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(id, message)));
        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            error!("{} handler panicked: {}", kind, message);
            let mut payload = ErrorPayload::new(format!("internal error: {message}"));
            payload.operation = Some(kind.name().to_string());
            self.outbox.respond(id, ContextMessage::Error(payload));
        }
    }

    fn dispatch(&mut self, id: Option<RequestId>, message: HostMessage) {
        // Dropped after the response, so `workingReset` always follows it
        let _working = message
            .kind()
            .shows_working()
            .then(|| WorkingGuard::new(self.outbox.clone()));

        let response = match message {
            HostMessage::Evaluate(request) => self.evaluate(request),
            HostMessage::CombineAndRender(request) => {
                self.combine_and_render(request.max_deviation, request.scene_options)
            }
            HostMessage::ImportFile(request) => ContextMessage::ImportFile(self.import_file(request)),
            HostMessage::ExportFile(request) => ContextMessage::ExportFile(self.export_file(&request)),
            HostMessage::ResetCache => {
                let cleared = self.script.reset_cache();
                info!("Cache reset ({} entries dropped)", cleared);
                ContextMessage::ResetCache
            }
            HostMessage::GetParameters => ContextMessage::GetParameters(self.script.parameters()),
        };
        self.outbox.respond(id, response);
    }

    /// Run a script and, on success, render its scene
    pub fn evaluate(&mut self, request: EvaluateRequest) -> ContextMessage {
        match self.script.run(&request.code, request.parameters) {
            Ok(summary) => {
                debug!(
                    "Pass {}: {} operations, {} shapes, {} cache entries evicted",
                    summary.generation, summary.operations, summary.shapes, summary.evicted
                );
                let options = request.scene_options.unwrap_or_default();
                self.combine_and_render(request.max_deviation, options)
            }
            Err(err) => {
                warn!("Evaluation failed: {}", err);
                // A failed pass has no model to export
                self.rendered.clear();
                ContextMessage::Error(err.into())
            }
        }
    }

    /// Mesh every scene shape as one compound and clear the scene
    pub fn combine_and_render(
        &mut self,
        max_deviation: Option<f64>,
        scene_options: serde_json::Value,
    ) -> ContextMessage {
        let scene = self.script.take_scene();
        if scene.is_empty() {
            debug!("Nothing to render");
            return ContextMessage::CombineAndRender(RenderResult::empty(scene_options));
        }

        let deviation = max_deviation
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(self.config.default_deviation);
        match self.render(&scene, deviation) {
            Ok((mesh, edges)) => {
                self.rendered = scene;
                ContextMessage::CombineAndRender(RenderResult {
                    mesh,
                    edges,
                    scene_options,
                    empty: false,
                })
            }
            Err(e) => {
                error!("Render failed: {}", e);
                let mut payload = ErrorPayload::new(e.to_string());
                payload.operation = Some("CombineAndRender".into());
                ContextMessage::Error(payload)
            }
        }
    }

    fn render(
        &mut self,
        scene: &[Shape],
        deviation: f64,
    ) -> CadResult<(crate::mesh::MeshBuffers, crate::mesh::EdgeBuffers)> {
        let kernel = self.script.kernel().clone();

        self.progress("collecting");
        let compound = match scene {
            [single] => single.clone(),
            _ => kernel.make_compound(scene)?,
        };

        self.progress("triangulating");
        let extraction = extract(kernel.as_ref(), &compound, deviation, self.config.extract_edges);
        self.progress("");

        let extraction = extraction?;
        if extraction.skipped_faces > 0 || extraction.skipped_edges > 0 {
            warn!(
                "Render skipped {} faces and {} edge groups",
                extraction.skipped_faces, extraction.skipped_edges
            );
        }
        Ok((extraction.mesh, extraction.edges))
    }

    fn progress(&mut self, op_type: &str) {
        self.op_number += 1;
        self.outbox.notify(ContextMessage::Progress(ProgressPayload {
            op_number: self.op_number,
            op_type: op_type.to_string(),
        }));
    }

    /// Read a STEP/IGES file into the scene
    pub fn import_file(&mut self, request: ImportRequest) -> ImportResult {
        let Some(format) = ImportFormat::from_extension(&request.file_type) else {
            return ImportResult::failed(
                crate::codec::CodecError::UnsupportedExtension(request.file_type).to_string(),
            );
        };

        let kernel = self.script.kernel().clone();
        let imported = import_bytes(kernel.as_ref(), format, &request.file_content).and_then(|shape| {
            let mesh = extract_mesh(kernel.as_ref(), &shape, self.config.default_deviation)?;
            Ok((shape, mesh))
        });
        match imported {
            Ok((shape, mesh)) => {
                info!("Imported {} ({} triangles)", request.file_name, mesh.triangle_count());
                let info = ShapeInfo {
                    shape_type: shape.kind().name().to_string(),
                    source: request.file_name,
                    format: format.name().to_string(),
                };
                self.script.push_shape(shape);
                ImportResult::succeeded(info, mesh)
            }
            Err(e) => {
                warn!("Import of {} failed: {}", request.file_name, e);
                ImportResult::failed(e.to_string())
            }
        }
    }

    /// Encode the scene, or the last rendered shapes, as a file
    pub fn export_file(&mut self, request: &ExportRequest) -> ExportResult {
        let scene = self.script.scene();
        let shapes = if scene.is_empty() { &self.rendered } else { &scene };

        let kernel = self.script.kernel().clone();
        let result = ExportSettings::from_request(request, self.config.export_deviation).and_then(
            |settings| export_shapes(kernel.as_ref(), shapes, request.format, &request.file_name, &settings),
        );
        match result {
            Ok(output) => ExportResult::succeeded(request.format, output.file_name, output.data),
            Err(e) => {
                warn!("Export of {} failed: {}", request.file_name, e);
                ExportResult::failed(e.to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ExportFormat;
    use crate::protocol::LogLevel;
    use cadex_kernel::{
        BooleanType, CadError, ExchangeFormat, TruckKernel, ReadOutcome, Transform, Triangulation,
    };
    use glam::DVec3;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn context() -> (ExecutionContext, UnboundedReceiver<Envelope<ContextMessage>>) {
        context_with(Arc::new(TruckKernel::new()))
    }

    fn context_with(
        kernel: Arc<dyn CadKernel>,
    ) -> (ExecutionContext, UnboundedReceiver<Envelope<ContextMessage>>) {
        let (tx, rx) = unbounded_channel();
        (ExecutionContext::new(kernel, EngineConfig::default(), Outbox::new(tx)), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Envelope<ContextMessage>>) -> Vec<Envelope<ContextMessage>> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    fn evaluate(code: &str) -> HostMessage {
        HostMessage::Evaluate(EvaluateRequest {
            code: code.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_evaluate_renders_with_progress() {
        let (mut ctx, mut rx) = context();
        let id = RequestId::new();
        ctx.handle(Envelope::request(id, evaluate("Box(10, 10, 10, true);")));

        let messages = drain(&mut rx);
        let progress: Vec<_> = messages
            .iter()
            .filter_map(|e| match &e.message {
                ContextMessage::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            progress.iter().map(|p| p.op_type.as_str()).collect::<Vec<_>>(),
            ["collecting", "triangulating", ""]
        );
        assert!(progress.windows(2).all(|w| w[0].op_number < w[1].op_number));

        let terminal: Vec<_> = messages.iter().filter(|e| e.id == Some(id)).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(
            &terminal[0].message,
            ContextMessage::CombineAndRender(r) if r.mesh.vertex_count() >= 8 && r.edges.segment_count() == 12
        ));
        assert!(messages.iter().any(|e| e.message == ContextMessage::WorkingReset));
    }

    #[test]
    fn test_failed_evaluate_is_error_and_working_reset() {
        let (mut ctx, mut rx) = context();
        let id = RequestId::new();
        ctx.handle(Envelope::request(id, evaluate("Box(1, 1, 1);\nCylinder(0, 2);")));

        let messages = drain(&mut rx);
        let terminal: Vec<_> = messages.iter().filter(|e| e.id == Some(id)).collect();
        assert_eq!(terminal.len(), 1);
        match &terminal[0].message {
            ContextMessage::Error(payload) => {
                assert_eq!(payload.operation.as_deref(), Some("Cylinder"));
                assert_eq!(payload.line, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(messages.last().unwrap().message, ContextMessage::WorkingReset);
        assert_eq!(ctx.scene_len(), 0);
    }

    #[test]
    fn test_second_combine_is_empty() {
        let (mut ctx, _rx) = context();
        ctx.script.run("Sphere(1);", BTreeMap::new()).unwrap();
        let first = ctx.combine_and_render(None, serde_json::json!({ "wire": true }));
        assert!(matches!(first, ContextMessage::CombineAndRender(ref r) if !r.empty));
        let second = ctx.combine_and_render(None, serde_json::Value::Null);
        assert!(matches!(second, ContextMessage::CombineAndRender(ref r) if r.empty && r.mesh.is_empty()));
    }

    #[test]
    fn test_scene_options_echoed() {
        let (mut ctx, _rx) = context();
        let options = serde_json::json!({ "groundPlane": false });
        ctx.script.run("Box(1, 1, 1);", BTreeMap::new()).unwrap();
        match ctx.combine_and_render(Some(0.5), options.clone()) {
            ContextMessage::CombineAndRender(result) => assert_eq!(result.scene_options, options),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_kernel_name() {
        let (ctx, _rx) = context();
        assert_eq!(ctx.kernel_name(), "truck");
    }

    #[test]
    fn test_export_without_shapes() {
        let (mut ctx, _rx) = context();
        let result = ctx.export_file(&ExportRequest::new(ExportFormat::Stl, "part"));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no shapes to export"));
    }

    #[test]
    fn test_export_after_render_uses_rendered_shapes() {
        let (mut ctx, mut rx) = context();
        ctx.handle(Envelope::request(RequestId::new(), evaluate("Box(2, 2, 2);")));
        drain(&mut rx);
        assert_eq!(ctx.scene_len(), 0);

        let result = ctx.export_file(&ExportRequest::new(ExportFormat::Step, "cube"));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.file_name.as_deref(), Some("cube.step"));
        assert!(!result.data.unwrap().is_empty());
    }

    #[test]
    fn test_failed_evaluate_drops_rendered_shapes() {
        let (mut ctx, mut rx) = context();
        ctx.handle(Envelope::request(RequestId::new(), evaluate("Box(2, 2, 2);")));
        ctx.handle(Envelope::request(RequestId::new(), evaluate("Sphere(-1);")));
        drain(&mut rx);

        let result = ctx.export_file(&ExportRequest::new(ExportFormat::Stl, "cube"));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no shapes to export"));
    }

    #[test]
    fn test_export_invalid_quality() {
        let (mut ctx, _rx) = context();
        ctx.script.run("Box(2, 2, 2);", BTreeMap::new()).unwrap();
        let mut request = ExportRequest::new(ExportFormat::Obj, "cube");
        request.quality = Some(2.0);
        let result = ctx.export_file(&request);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("quality"));
    }

    #[test]
    fn test_import_round_trip_appends_to_scene() {
        let (mut ctx, _rx) = context();
        ctx.script.run("Box(3, 2, 1);", BTreeMap::new()).unwrap();
        let exported = ctx.export_file(&ExportRequest::new(ExportFormat::Step, "block"));
        ctx.script.take_scene();

        let result = ctx.import_file(ImportRequest {
            file_name: "block.step".into(),
            file_type: "step".into(),
            file_content: exported.data.unwrap(),
        });
        assert!(result.success, "{:?}", result.error);
        let info = result.shape_info.unwrap();
        assert_eq!(info.shape_type, "Solid");
        assert_eq!(info.format, "STEP");
        assert!(result.mesh.unwrap().triangle_count() >= 12);
        assert_eq!(ctx.scene_len(), 1);
    }

    #[test]
    fn test_import_rejects_bad_content_and_type() {
        let (mut ctx, _rx) = context();
        let result = ctx.import_file(ImportRequest {
            file_name: "junk.igs".into(),
            file_type: "igs".into(),
            file_content: b"garbage".to_vec(),
        });
        assert!(!result.success);

        let result = ctx.import_file(ImportRequest {
            file_name: "mesh.xyz".into(),
            file_type: "xyz".into(),
            file_content: b"1 2 3".to_vec(),
        });
        assert!(result.error.unwrap().contains(".xyz"));
        assert_eq!(ctx.scene_len(), 0);
    }

    #[test]
    fn test_parameters_and_cache_reset() {
        let (mut ctx, mut rx) = context();
        ctx.handle(Envelope::request(
            RequestId::new(),
            evaluate(r#"let r = Slider("Radius", 2, 1, 10); Sphere(r);"#),
        ));
        drain(&mut rx);

        let id = RequestId::new();
        ctx.handle(Envelope::request(id, HostMessage::GetParameters));
        match drain(&mut rx).pop().unwrap().message {
            ContextMessage::GetParameters(params) => assert!(params.contains_key("Radius")),
            other => panic!("unexpected {other:?}"),
        }

        ctx.handle(Envelope::request(id, HostMessage::ResetCache));
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, ContextMessage::ResetCache);
        assert_eq!(ctx.script.cache_len(), 0);
    }

    #[test]
    fn test_print_becomes_log_notification() {
        let (mut ctx, mut rx) = context();
        ctx.handle(Envelope::request(RequestId::new(), evaluate(r#"print("hi");"#)));
        let logs: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e.message {
                ContextMessage::Log(payload) => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[0].message, "hi");
    }

    /// Kernel whose triangulation panics
    struct PanickingKernel(TruckKernel);

    impl CadKernel for PanickingKernel {
        fn name(&self) -> &str {
            "panicking"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn make_box(&self, size: DVec3, centered: bool) -> CadResult<Shape> {
            self.0.make_box(size, centered)
        }
        fn make_sphere(&self, radius: f64) -> CadResult<Shape> {
            self.0.make_sphere(radius)
        }
        fn make_cylinder(&self, radius: f64, height: f64, centered: bool) -> CadResult<Shape> {
            self.0.make_cylinder(radius, height, centered)
        }
        fn make_cone(&self, r1: f64, r2: f64, height: f64) -> CadResult<Shape> {
            self.0.make_cone(r1, r2, height)
        }
        fn make_polygon(&self, points: &[DVec3]) -> CadResult<Shape> {
            self.0.make_polygon(points)
        }
        fn extrude(&self, profile: &Shape, direction: DVec3) -> CadResult<Shape> {
            self.0.extrude(profile, direction)
        }
        fn boolean(&self, a: &Shape, b: &Shape, op: BooleanType) -> CadResult<Shape> {
            self.0.boolean(a, b, op)
        }
        fn transform(&self, shape: &Shape, transform: &Transform) -> CadResult<Shape> {
            self.0.transform(shape, transform)
        }
        fn make_compound(&self, shapes: &[Shape]) -> CadResult<Shape> {
            self.0.make_compound(shapes)
        }
        fn triangulate(&self, _shape: &Shape, _deviation: f64) -> CadResult<Triangulation> {
            panic!("mesher exploded")
        }
        fn read_file(&self, format: ExchangeFormat, path: &Path) -> CadResult<ReadOutcome> {
            self.0.read_file(format, path)
        }
        fn write_step(&self, _shape: &Shape, _path: &Path) -> CadResult<()> {
            Err(CadError::StepExport("disabled".into()))
        }
    }

    #[test]
    fn test_panic_becomes_error_response() {
        let (mut ctx, mut rx) = context_with(Arc::new(PanickingKernel(TruckKernel::new())));
        let id = RequestId::new();
        ctx.handle(Envelope::request(id, evaluate("Box(1, 1, 1);")));

        let messages = drain(&mut rx);
        let terminal: Vec<_> = messages.iter().filter(|e| e.id == Some(id)).collect();
        assert_eq!(terminal.len(), 1);
        match &terminal[0].message {
            ContextMessage::Error(payload) => assert!(payload.message.contains("mesher exploded")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(messages.iter().any(|e| e.message == ContextMessage::WorkingReset));

        // The context keeps serving after a panic
        let id = RequestId::new();
        ctx.handle(Envelope::request(id, HostMessage::GetParameters));
        assert!(matches!(
            drain(&mut rx).pop().unwrap().message,
            ContextMessage::GetParameters(_)
        ));
    }
}
