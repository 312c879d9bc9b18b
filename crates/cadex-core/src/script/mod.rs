//! Sandboxed script evaluation
//!
//! User code runs in an embedded Rhai engine that exposes only the modeling
//! standard library registered in [`stdlib`]. Native functions reach the
//! per-context state through the engine's default tag, the same pattern a
//! Rhai host uses to give callbacks access to a shared drawing context.
//!
//! Every kernel-building call goes through the [`MemoCache`]; every shape it
//! produces is appended to the scene, and shapes used as inputs to booleans
//! or transforms are consumed from it.

mod convert;
mod stdlib;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cadex_kernel::{CadKernel, Shape};
use parking_lot::Mutex;
use rhai::{Dynamic, EvalAltResult};
use tracing::{debug, info};

use crate::cache::{CacheStats, MemoCache};
use crate::config::ScriptConfig;
use crate::params::{ParamValue, ParameterEntry, ParameterStore};
use crate::protocol::{ErrorPayload, LogLevel, LogPayload};

/// Receives `print`/`debug` output from scripts
pub type LogSink = Arc<dyn Fn(LogPayload) + Send + Sync>;

/// Evaluation failure tagged with the last operation that ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
    pub operation: Option<String>,
    pub line: Option<usize>,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&ErrorPayload::from(self.clone()), f)
    }
}

impl std::error::Error for ScriptError {}

impl From<ScriptError> for ErrorPayload {
    fn from(err: ScriptError) -> Self {
        ErrorPayload {
            message: err.message,
            operation: err.operation,
            line: err.line,
        }
    }
}

/// Location of the most recent standard-library call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpSite {
    pub name: &'static str,
    pub line: Option<usize>,
}

/// State mutated by native functions during a pass
#[derive(Debug, Default)]
pub(crate) struct EvalState {
    pub scene: Vec<Shape>,
    pub cache: MemoCache,
    pub params: ParameterStore,
    pub last_op: Option<OpSite>,
    pub operations: u64,
}

impl EvalState {
    /// Remove one scene entry for each consumed input
    pub fn consume(&mut self, inputs: &[Shape]) {
        for input in inputs {
            if let Some(pos) = self.scene.iter().position(|s| s.same_handle(input)) {
                self.scene.remove(pos);
            }
        }
    }
}

/// Shared between the engine owner and native functions
pub(crate) struct ScriptShared {
    pub kernel: Arc<dyn CadKernel>,
    pub state: Mutex<EvalState>,
}

/// Result of a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub generation: u64,
    /// Shapes left in the scene
    pub shapes: usize,
    /// Standard-library calls made
    pub operations: u64,
    pub evicted: usize,
}

/// Rhai engine bound to one kernel and one scene
pub struct ScriptEngine {
    engine: rhai::Engine,
    shared: Arc<ScriptShared>,
}

impl ScriptEngine {
    pub fn new(kernel: Arc<dyn CadKernel>, config: &ScriptConfig, log: LogSink) -> Self {
        let mut engine = rhai::Engine::new();

        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.set_max_operations(config.max_operations);
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth / 2);

        let print_sink = log.clone();
        engine.on_print(move |text| {
            print_sink(LogPayload {
                level: LogLevel::Info,
                message: text.to_string(),
            })
        });
        engine.on_debug(move |text, _source, pos| {
            let message = match pos.line() {
                Some(line) => format!("[line {line}] {text}"),
                None => text.to_string(),
            };
            log(LogPayload {
                level: LogLevel::Debug,
                message,
            })
        });

        stdlib::register(&mut engine);

        let shared = Arc::new(ScriptShared {
            kernel,
            state: Mutex::new(EvalState::default()),
        });
        engine.set_default_tag(Dynamic::from(shared.clone()));

        info!(
            "Script engine ready (max operations {}, max depth {})",
            config.max_operations, config.max_expr_depth
        );
        Self { engine, shared }
    }

    /// Run one evaluation pass
    ///
    /// The scene is cleared first. On failure it is left empty so a
    /// following render produces nothing.
    pub fn run(
        &self,
        code: &str,
        overrides: BTreeMap<String, ParamValue>,
    ) -> Result<PassSummary, ScriptError> {
        let generation = {
            let mut state = self.shared.state.lock();
            state.scene.clear();
            state.last_op = None;
            state.operations = 0;
            state.params.begin_pass(overrides);
            state.cache.begin_pass()
        };
        debug!("Evaluation pass {} started", generation);

        // The state lock must not be held here; native functions take it
        let result = self.engine.run(code);

        let mut state = self.shared.state.lock();
        let evicted = state.cache.end_pass();
        state.params.end_pass(result.is_ok());
        match result {
            Ok(()) => Ok(PassSummary {
                generation,
                shapes: state.scene.len(),
                operations: state.operations,
                evicted,
            }),
            Err(err) => {
                state.scene.clear();
                Err(tag_error(*err, state.last_op.as_ref()))
            }
        }
    }

    pub fn kernel(&self) -> &Arc<dyn CadKernel> {
        &self.shared.kernel
    }

    /// Move the scene out, leaving it empty
    pub fn take_scene(&self) -> Vec<Shape> {
        std::mem::take(&mut self.shared.state.lock().scene)
    }

    pub fn scene(&self) -> Vec<Shape> {
        self.shared.state.lock().scene.clone()
    }

    /// Append a shape produced outside a script, e.g. by an import
    pub fn push_shape(&self, shape: Shape) {
        self.shared.state.lock().scene.push(shape);
    }

    pub fn reset_cache(&self) -> usize {
        let mut state = self.shared.state.lock();
        let cleared = state.cache.len();
        state.cache.clear();
        cleared
    }

    pub fn cache_len(&self) -> usize {
        self.shared.state.lock().cache.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.state.lock().cache.stats()
    }

    pub fn parameters(&self) -> BTreeMap<String, ParameterEntry> {
        self.shared.state.lock().params.snapshot()
    }
}

/// Strip Rhai's wrapping and attach the failing operation
fn tag_error(err: EvalAltResult, last_op: Option<&OpSite>) -> ScriptError {
    let line = err.position().line().or(last_op.and_then(|op| op.line));
    ScriptError {
        message: describe(err),
        operation: last_op.map(|op| op.name.to_string()),
        line,
    }
}

fn describe(err: EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => describe(*inner),
        mut other => {
            other.clear_position();
            other.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Control;
    use cadex_kernel::{ShapeKind, TruckKernel};

    fn engine_with_logs() -> (ScriptEngine, Arc<Mutex<Vec<LogPayload>>>) {
        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink_logs = logs.clone();
        let engine = ScriptEngine::new(
            Arc::new(TruckKernel::new()),
            &ScriptConfig::default(),
            Arc::new(move |payload| sink_logs.lock().push(payload)),
        );
        (engine, logs)
    }

    fn engine() -> ScriptEngine {
        engine_with_logs().0
    }

    #[test]
    fn test_box_appends_one_shape() {
        let engine = engine();
        let summary = engine.run("Box(10, 10, 10, true);", BTreeMap::new()).unwrap();
        assert_eq!(summary.shapes, 1);
        assert_eq!(summary.operations, 1);
        let scene = engine.take_scene();
        assert_eq!(scene[0].kind(), ShapeKind::Solid);
        assert!(engine.scene().is_empty());
    }

    #[test]
    fn test_booleans_consume_inputs() {
        let engine = engine();
        let code = r#"
            let body = Box(10, 10, 10, true);
            let hole = Cylinder(2, 20, true);
            let part = Difference(body, [hole]);
            let pin = Translate([20, 0, 0], Sphere(3));
        "#;
        let summary = engine.run(code, BTreeMap::new()).unwrap();
        assert_eq!(summary.shapes, 2);
    }

    #[test]
    fn test_repeated_pass_hits_cache() {
        let engine = engine();
        let code = "Union([Box(1, 1, 1), Translate([0.5, 0.25, 0.25], Box(1, 0.5, 0.5))]);";
        engine.run(code, BTreeMap::new()).unwrap();
        let first = engine.scene()[0].clone();
        let misses = engine.cache_stats().misses;

        engine.run(code, BTreeMap::new()).unwrap();
        let second = engine.scene()[0].clone();
        assert!(first.same_handle(&second));
        assert_eq!(engine.cache_stats().misses, misses);
    }

    #[test]
    fn test_cache_bounded_by_live_inputs() {
        let engine = engine();
        engine.run("Box(1, 2, 3); Sphere(4);", BTreeMap::new()).unwrap();
        assert_eq!(engine.cache_len(), 2);
        engine.run("Box(1, 2, 3);", BTreeMap::new()).unwrap();
        assert_eq!(engine.cache_len(), 1);
        assert_eq!(engine.reset_cache(), 1);
        assert_eq!(engine.cache_len(), 0);
    }

    #[test]
    fn test_error_tagged_with_operation_and_line() {
        let engine = engine();
        let code = "let a = Box(1, 1, 1);\nlet b = Sphere(-2);\n";
        let err = engine.run(code, BTreeMap::new()).unwrap_err();
        assert_eq!(err.operation.as_deref(), Some("Sphere"));
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("radius"), "{}", err.message);
        assert!(engine.scene().is_empty());
    }

    #[test]
    fn test_syntax_error() {
        let engine = engine();
        let err = engine.run("let = ;", BTreeMap::new()).unwrap_err();
        assert!(err.operation.is_none());
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_parameters_register_and_override() {
        let engine = engine();
        let code = r#"
            let size = Slider("Size", 10, 1, 50);
            let round = Checkbox("Round", false);
            if round { Sphere(size) } else { Box(size, size, size) }
        "#;
        engine.run(code, BTreeMap::new()).unwrap();
        let params = engine.parameters();
        assert_eq!(params["Size"].value, ParamValue::Number(10.0));
        assert!(matches!(params["Size"].control, Control::Slider { .. }));

        let overrides = BTreeMap::from([
            ("Size".to_string(), ParamValue::Number(99.0)),
            ("Round".to_string(), ParamValue::Bool(true)),
        ]);
        engine.run(code, overrides).unwrap();
        let params = engine.parameters();
        assert_eq!(params["Size"].value, ParamValue::Number(50.0));
        assert_eq!(engine.scene()[0].kind(), ShapeKind::Solid);
    }

    #[test]
    fn test_print_routed_to_log() {
        let (engine, logs) = engine_with_logs();
        engine.run(r#"print("hello"); debug(42);"#, BTreeMap::new()).unwrap();
        let logs = logs.lock();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[0].message, "hello");
        assert_eq!(logs[1].level, LogLevel::Debug);
        assert!(logs[1].message.contains("42"));
    }

    #[test]
    fn test_sandbox_limits() {
        let engine = engine();
        assert!(engine.run(r#"eval("Box(1, 1, 1)")"#, BTreeMap::new()).is_err());
        assert!(engine.run(r#"import "fs" as fs;"#, BTreeMap::new()).is_err());

        let limited = ScriptEngine::new(
            Arc::new(TruckKernel::new()),
            &ScriptConfig {
                max_operations: 1_000,
                ..Default::default()
            },
            Arc::new(|_| {}),
        );
        assert!(limited.run("loop {}", BTreeMap::new()).is_err());
    }

    #[test]
    fn test_push_shape_joins_scene() {
        let engine = engine();
        let shape = engine.kernel().make_sphere(1.0).unwrap();
        engine.push_shape(shape);
        assert_eq!(engine.scene().len(), 1);
    }
}
