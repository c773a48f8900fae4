use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shadertoy_lab::renderer::source_transform;
use shadertoy_lab::snapshot::load_snapshot_from_path;
use shadertoy_lab::{Engine, EngineConfig, FrameReport, HeadlessBackend, NodeKind};

#[derive(Debug, Parser)]
#[command(name = "shadertoy-lab", version, about = "Headless driver for ShaderToy Lab graphs")]
struct Cli {
    /// Engine config JSON (defaults apply to missing fields).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the compilable form of a node source.
    Transform {
        file: PathBuf,
        #[arg(long, default_value = "shader")]
        kind: NodeKind,
        /// Also print what was injected (to stderr).
        #[arg(long)]
        report: bool,
    },
    /// Restore a snapshot and report compile diagnostics per node.
    Check { snapshot: PathBuf },
    /// Restore a snapshot, render frames and print the frame reports as JSON.
    Render {
        snapshot: PathBuf,
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Seconds of `iTime` between frames.
        #[arg(long, default_value_t = 1.0 / 60.0)]
        step: f32,
        /// Write each node's presentation surface as `node-<id>.png`.
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_json_path(p),
        None => Ok(EngineConfig::default()),
    }
}

fn restore(snapshot_path: &Path, config: EngineConfig) -> Result<Engine<HeadlessBackend>> {
    let snapshot = load_snapshot_from_path(snapshot_path)?;
    Engine::from_snapshot(HeadlessBackend::new(), config, &snapshot)
        .with_context(|| format!("failed to restore {}", snapshot_path.display()))
}

fn run_transform(file: &Path, kind: NodeKind, report: bool) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read shader source {}", file.display()))?;
    let out = source_transform::transform(&source, kind);
    if report {
        eprintln!("[transform] {:?}", out.report);
    }
    print!("{}", out.source);
    Ok(())
}

fn run_check(snapshot_path: &Path, config: EngineConfig) -> Result<()> {
    let mut engine = restore(snapshot_path, config)?;
    let diagnostics = engine.take_diagnostics();
    for node in engine.graph().nodes() {
        let failures: Vec<_> = diagnostics.iter().filter(|d| d.node == node.id).collect();
        if failures.is_empty() {
            println!("[check] node {} ({}, {}): ok", node.id, node.name, node.kind);
            continue;
        }
        for d in failures {
            println!("[check] node {} ({}, {}): {}", node.id, node.name, node.kind, d.error);
        }
    }
    let lagging = engine.feedback_nodes();
    if !lagging.is_empty() {
        let ids: Vec<String> = lagging.iter().map(ToString::to_string).collect();
        println!("[check] nodes on a feedback cycle: {}", ids.join(", "));
    }
    if !diagnostics.is_empty() {
        bail!("{} node(s) failed to compile", diagnostics.len());
    }
    Ok(())
}

fn run_render(
    snapshot_path: &Path,
    frames: u32,
    step: f32,
    out_dir: Option<&Path>,
    config: EngineConfig,
) -> Result<()> {
    if frames == 0 {
        bail!("--frames must be at least 1");
    }
    let needs_surfaces = out_dir.is_some();
    let config = if needs_surfaces {
        config.with_presentation(true)
    } else {
        config
    };
    let mut engine = restore(snapshot_path, config)?;
    for d in engine.take_diagnostics() {
        eprintln!("[render] node {}: {}", d.node, d.error);
    }

    let reports: Vec<FrameReport> = (0..frames)
        .map(|i| engine.render_frame_at(i as f32 * step))
        .collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);

    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output dir {}", dir.display()))?;
        for node in engine.graph().nodes() {
            let Some(surface) = engine.surface(node.id) else {
                continue;
            };
            let path = dir.join(format!("node-{}.png", node.id));
            surface
                .save(&path)
                .map_err(|e| anyhow!("failed to write {}: {e}", path.display()))?;
            eprintln!("[render] saved: {}", path.display());
        }
    }
    engine.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Transform { file, kind, report } => run_transform(&file, kind, report),
        Command::Check { snapshot } => run_check(&snapshot, config),
        Command::Render {
            snapshot,
            frames,
            step,
            out_dir,
        } => run_render(&snapshot, frames, step, out_dir.as_deref(), config),
    }
}
