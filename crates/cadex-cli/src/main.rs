//! cadex command-line entry point

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use cadex_bridge::{BatchExporter, BridgeEvent, DirectorySink, ExportItem, ExportOptions, HostBridge, Observer};
use cadex_core::{EngineConfig, EvaluateRequest, ExportFormat, LogLevel, ParamValue, RenderResult};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{debug, info, warn};

/// Evaluate modeling scripts and convert CAD files
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    /// Engine configuration file (RON)
    #[clap(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a script and report its mesh
    Render {
        script: PathBuf,

        #[clap(flatten)]
        eval: EvalSettings,

        /// Print the full render result as JSON
        #[clap(long)]
        json: bool,
    },

    /// Import a STEP or IGES file and report its mesh
    Import { file: PathBuf },

    /// Evaluate a script and export its shapes
    Export {
        script: PathBuf,

        #[clap(flatten)]
        eval: EvalSettings,

        /// Output directory
        #[clap(short, long)]
        out: PathBuf,

        /// Formats to write
        #[clap(short, long, value_delimiter = ',', value_parser = parse_format, default_value = "step")]
        format: Vec<ExportFormat>,

        /// Mesh quality in (0, 1] for STL and OBJ
        #[clap(short, long)]
        quality: Option<f64>,

        /// Write binary STL (`--binary-stl false` for ASCII)
        #[clap(long, action = ArgAction::Set, default_value_t = true)]
        binary_stl: bool,

        /// Include vertex normals in OBJ files
        #[clap(long)]
        normals: bool,
    },
}

#[derive(Parser)]
struct EvalSettings {
    /// Parameter override, as `name=value`
    #[clap(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, ParamValue)>,

    /// Chordal deviation of the preview mesh
    #[clap(short, long)]
    deviation: Option<f64>,
}

impl EvalSettings {
    fn request(&self, code: String) -> EvaluateRequest {
        EvaluateRequest {
            code,
            parameters: self.params.iter().cloned().collect::<BTreeMap<_, _>>(),
            max_deviation: self.deviation,
            scene_options: None,
        }
    }
}

fn parse_param(s: &str) -> Result<(String, ParamValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    let value = match value.trim() {
        "true" => ParamValue::Bool(true),
        "false" => ParamValue::Bool(false),
        v => match v.parse::<f64>() {
            Ok(n) => ParamValue::Number(n),
            Err(_) => ParamValue::Text(v.to_string()),
        },
    };
    Ok((name.to_string(), value))
}

fn parse_format(s: &str) -> Result<ExportFormat, String> {
    ExportFormat::parse(s).map_err(|e| e.to_string())
}

fn observer() -> Observer {
    Arc::new(|event| match event {
        BridgeEvent::Log(log) => match log.level {
            LogLevel::Debug => debug!(target: "cadex::script", "{}", log.message),
            LogLevel::Info => info!(target: "cadex::script", "{}", log.message),
            LogLevel::Warn => warn!(target: "cadex::script", "{}", log.message),
        },
        BridgeEvent::Error(payload) => warn!("Context error: {}", payload),
        BridgeEvent::Progress(p) if !p.op_type.is_empty() => {
            debug!("[{}] {}", p.op_number, p.op_type)
        }
        BridgeEvent::Terminated => debug!("Context terminated"),
        _ => {}
    })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn summarize(result: &RenderResult) {
    if result.empty {
        println!("empty scene");
        return;
    }
    println!(
        "{} vertices, {} triangles, {} edge segments",
        result.mesh.vertex_count(),
        result.mesh.triangle_count(),
        result.edges.segment_count()
    );
    if let Some((min, max)) = result.mesh.bounding_box() {
        println!(
            "bounds [{:.3}, {:.3}, {:.3}] .. [{:.3}, {:.3}, {:.3}]",
            min[0], min[1], min[2], max[0], max[1], max[2]
        );
    }
}

async fn render(bridge: &HostBridge, script: &Path, eval: &EvalSettings, json: bool) -> Result<()> {
    let code = read_script(script)?;
    let result = bridge.evaluate_with(eval.request(code)).await?;
    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        summarize(&result);
    }
    Ok(())
}

async fn import(bridge: &HostBridge, file: &Path) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file name {}", file.display()))?;
    let content = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let result = bridge.import_file(name, content).await?;
    if let Some(info) = &result.shape_info {
        println!("{} from {} ({})", info.shape_type, info.source, info.format);
    }
    if let Some(mesh) = &result.mesh {
        println!("{} vertices, {} triangles", mesh.vertex_count(), mesh.triangle_count());
    }
    Ok(())
}

/// Evaluate `script` and write one file per format into `out`
async fn export(
    bridge: &HostBridge,
    script: &Path,
    eval: &EvalSettings,
    out: &Path,
    formats: &[ExportFormat],
    settings: ExportOptions,
) -> Result<Vec<PathBuf>> {
    let code = read_script(script)?;
    let rendered = bridge.evaluate_with(eval.request(code)).await?;
    if rendered.empty {
        bail!("{} produced no shapes", script.display());
    }

    let stem = script
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("export");
    let items = formats
        .iter()
        .map(|&format| ExportItem {
            id: format.to_string(),
            file_name: format.file_name(stem),
            format,
            settings: settings.clone(),
        })
        .collect();

    let mut sink = DirectorySink::new(out)
        .with_context(|| format!("failed to create {}", out.display()))?;
    let exporter = BatchExporter::new(bridge.clone());
    let report = exporter
        .run(items, &mut sink, |p| {
            println!("[{:>3}%] {}/{} done, {} failed", p.percentage, p.completed, p.total, p.failed)
        })
        .await?;

    for failure in &report.errors {
        warn!("{}: {}", failure.id, failure.error);
    }
    if !report.errors.is_empty() {
        bail!("{} of {} exports failed", report.errors.len(), report.progress.total);
    }
    Ok(sink.written().to_vec())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadex=info,cadex_core=info,cadex_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let bridge = HostBridge::create(cadex_kernel::default_kernel(), config, Some(observer())).await?;

    let result = match &args.cmd {
        Command::Render { script, eval, json } => render(&bridge, script, eval, *json).await,
        Command::Import { file } => import(&bridge, file).await,
        Command::Export {
            script,
            eval,
            out,
            format,
            quality,
            binary_stl,
            normals,
        } => {
            let settings = ExportOptions {
                quality: *quality,
                binary_stl: Some(*binary_stl),
                include_normals: Some(*normals),
            };
            export(&bridge, script, eval, out, format, settings)
                .await
                .map(|written| {
                    for path in written {
                        println!("wrote {}", path.display());
                    }
                })
        }
    };
    bridge.terminate();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use cadex_kernel::TruckKernel;

    #[test]
    fn test_args() {
        Args::command().debug_assert();
        let args = Args::try_parse_from([
            "cadex", "export", "part.rhai", "--out", "out", "--format", "step,stl",
            "-p", "Size=12", "-p", "Round=true", "--binary-stl", "false",
        ])
        .unwrap();
        match args.cmd {
            Command::Export {
                format,
                eval,
                binary_stl,
                ..
            } => {
                assert_eq!(format, vec![ExportFormat::Step, ExportFormat::Stl]);
                assert!(!binary_stl);
                assert_eq!(eval.params[0], ("Size".to_string(), ParamValue::Number(12.0)));
                assert_eq!(eval.params[1], ("Round".to_string(), ParamValue::Bool(true)));
            }
            _ => panic!("expected export"),
        }
        assert!(Args::try_parse_from(["cadex", "export", "a", "--out", "o", "--format", "dxf"]).is_err());
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("label = hello").unwrap(),
            ("label".to_string(), ParamValue::Text("hello".into()))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=3").is_err());
    }

    #[tokio::test]
    async fn test_export_writes_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bracket.rhai");
        std::fs::write(&script, "Translate([0, 0, 1], Box(10, 10, 2));").unwrap();

        let bridge = HostBridge::create(Arc::new(TruckKernel::new()), EngineConfig::default(), None)
            .await
            .unwrap();
        let eval = EvalSettings {
            params: Vec::new(),
            deviation: None,
        };
        let out = dir.path().join("out");
        let written = export(
            &bridge,
            &script,
            &eval,
            &out,
            ExportFormat::ALL,
            ExportOptions::default(),
        )
        .await
        .unwrap();
        bridge.terminate();

        assert_eq!(
            written,
            vec![out.join("bracket.step"), out.join("bracket.stl"), out.join("bracket.obj")]
        );
        for path in &written {
            assert!(std::fs::metadata(path).unwrap().len() > 0);
        }
    }
}
