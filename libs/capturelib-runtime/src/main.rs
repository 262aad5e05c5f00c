// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! capturelib runtime binary
//!
//! Loads a pipeline description, binds its camera id to a virtual camera and
//! runs the graph until Ctrl+C or until the sinks have received the requested
//! number of frames.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capturelib::{
    MetadataController, Node, PipelineConfig, PipelineGraph, StaticDeviceManager, StreamId,
    VirtualCamera, VirtualCameraConfig, NODE_REGISTRY,
};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONTROL_ENTRY_CAPACITY: usize = 30;
const CONTROL_DATA_CAPACITY: usize = 2000;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "capturelib-runtime")]
#[command(author, version, about = "capturelib pipeline runtime", long_about = None)]
struct Args {
    /// Pipeline file to load (YAML). Falls back to ./pipeline.yaml, then to
    /// the built-in source → face → sink pipeline.
    #[arg(long = "graph-file", value_name = "PATH")]
    graph_file: Option<PathBuf>,

    /// Runtime name, used for the log file (auto-generated if not specified)
    #[arg(long)]
    name: Option<String>,

    /// Stop after the sinks have received this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Virtual camera frame interval
    #[arg(long = "frame-interval-ms", default_value = "33")]
    frame_interval_ms: u64,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn get_logs_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".capturelib").join("logs"))
}

fn setup_file_logging(runtime_name: &str) -> Result<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let logs_dir = get_logs_dir()?;
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create {}", logs_dir.display()))?;

    let file_appender =
        tracing_appender::rolling::never(&logs_dir, format!("{}.log", runtime_name));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn load_config(args: &Args) -> Result<PipelineConfig> {
    match &args.graph_file {
        Some(path) => PipelineConfig::load_file(path)
            .with_context(|| format!("Failed to load pipeline {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
            Ok(PipelineConfig::load_or_default(&cwd))
        }
    }
}

fn frames_consumed(graph: &PipelineGraph) -> u64 {
    graph.nodes().map(|node| node.stats().consumed).sum()
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime_id = format!("R{}", cuid2::create_id());
    let runtime_name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("capture-{}", &runtime_id[1..runtime_id.len().min(9)]));

    let _log_guard = setup_file_logging(&runtime_name)?;
    tracing::info!("Starting runtime: {} ({})", runtime_name, runtime_id);
    tracing::info!(
        "Log file: {}",
        get_logs_dir()?.join(format!("{}.log", runtime_name)).display()
    );

    let config = load_config(&args)?;

    let camera = Arc::new(VirtualCamera::new(VirtualCameraConfig {
        frame_interval_ms: args.frame_interval_ms,
        fill_pattern: true,
    }));
    let devices = Arc::new(
        StaticDeviceManager::new().with_device(config.camera_id.clone(), camera.clone()),
    );
    let metadata = Arc::new(MetadataController::new());

    let graph = PipelineGraph::from_config(&config, &NODE_REGISTRY, metadata, devices)
        .context("Failed to build pipeline graph")?;
    tracing::debug!("Pipeline topology:\n{}", graph.to_dot());

    graph.init_all().context("Failed to initialize pipeline")?;
    graph.start_all().context("Failed to start pipeline")?;

    if let Some(record) = config.control_record(
        StreamId::DEVICE_CONTROL,
        CONTROL_ENTRY_CAPACITY,
        CONTROL_DATA_CAPACITY,
    )? {
        let notified = graph.publish_metadata(record);
        tracing::info!(
            "Applied {} device controls ({} subscribers notified)",
            config.controls.len(),
            notified
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))
        .context("Failed to install Ctrl+C handler")?;

    match args.frames {
        Some(limit) => tracing::info!("Running until {} frames are consumed", limit),
        None => tracing::info!("Press Ctrl+C to stop"),
    }

    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
        if args.frames.is_some_and(|limit| frames_consumed(&graph) >= limit) {
            break;
        }
    }

    let consumed = frames_consumed(&graph);
    let result = graph.shutdown();

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        "Stopped after {:.1}s: {} frames consumed, {} produced by the camera",
        elapsed,
        consumed,
        camera.frames_produced()
    );
    for (name, stats) in graph.stats() {
        tracing::info!("[{}] {:?}", name, stats);
    }

    result.context("Pipeline did not stop cleanly")
}
