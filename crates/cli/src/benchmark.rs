//! `renderfarm benchmark`: saturate a local renderer pool and report fps.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context as _;
use clap::Args;
use renderfarm_core::config::RENDERER_VERSION;
use renderfarm_core::slots::build_server_configs;
use renderfarm_core::{Batch, DeploymentOptions, RemoteRendererConfig};
use renderfarm_executor::{RenderOutput, Renderer};
use tokio::sync::mpsc;

/// Seed stride between ranks so their batches never overlap.
const RANK_SEED_STRIDE: u64 = 11713;

const DEFAULT_CAMERAS: [&str; 3] = ["vision_cam_left", "vision_cam_top", "vision_cam_right"];

#[derive(Args, Debug)]
pub struct BenchmarkArgs {
    #[arg(long, default_value_t = 1)]
    num_gpus: u32,

    #[arg(long, default_value_t = 1)]
    workers_per_gpu: u32,

    /// Timed batches per local worker, after one warmup batch each.
    #[arg(long, default_value_t = 20)]
    iterations: usize,

    #[arg(long, default_value_t = 7000)]
    base_port: u16,

    #[arg(long, default_value_t = false)]
    render_depth: bool,

    #[arg(long, default_value_t = false)]
    render_normals: bool,

    #[arg(long, default_value_t = false)]
    render_segmentation: bool,

    #[arg(long, default_value_t = 200)]
    image_size: u32,

    /// Index of this process among `size` cooperating benchmark processes.
    #[arg(long, default_value_t = 0)]
    rank: usize,

    #[arg(long, default_value_t = 1)]
    size: usize,

    /// Scene assets; model paths below are relative to it.
    #[arg(long, default_value = "assets")]
    asset_basedir: PathBuf,

    /// CSV of scene states, one comma-separated row per batch entry.
    #[arg(long, default_value = "assets/states/qpos.csv")]
    states: PathBuf,

    #[arg(long, default_value = "dactyl.xml")]
    model_xml: PathBuf,

    #[arg(long, default_value = "dactyl.mapping")]
    model_mapping: PathBuf,

    #[arg(long, default_value = "dactyl.renderer_config.json")]
    renderer_config: PathBuf,
}

impl BenchmarkArgs {
    fn remote_config(&self) -> RemoteRendererConfig {
        RemoteRendererConfig {
            camera_names: DEFAULT_CAMERAS.iter().map(|c| c.to_string()).collect(),
            image_width: self.image_size,
            image_height: self.image_size,
            render_depth: self.render_depth,
            render_normals: self.render_normals,
            render_segmentation: self.render_segmentation,
            renderer_version: Some(RENDERER_VERSION.to_string()),
            model_xml_path: Some(self.model_xml.clone()),
            model_mapping_path: Some(self.model_mapping.clone()),
            renderer_config_path: Some(self.renderer_config.clone()),
            asset_basedir: self.asset_basedir.clone(),
            ..Default::default()
        }
    }
}

pub async fn run(args: BenchmarkArgs) -> anyhow::Result<()> {
    let states = load_states(&args.states)?;
    let slots = build_server_configs(
        args.num_gpus,
        args.workers_per_gpu,
        args.base_port,
        args.rank,
        args.size,
    )?;
    let deployment = DeploymentOptions::from_env()?;
    let renderer = Renderer::http("benchmark", slots, args.remote_config(), deployment)?;
    renderer.start().await.context("Renderer failed to start")?;

    let result = drive(&renderer, &args, states).await;
    renderer.shutdown().await;
    result
}

async fn drive<C: renderfarm_server::Connector>(
    renderer: &Renderer<C>,
    args: &BenchmarkArgs,
    states: Vec<Vec<f64>>,
) -> anyhow::Result<()> {
    let local_workers = renderer.slots().len();
    let cameras = renderer.config().camera_names.len();
    let batch_size = states.len();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut seed = args.rank as u64 * RANK_SEED_STRIDE;
    let total = (args.iterations + 1) * local_workers;
    tracing::info!(
        renderer = renderer.name(),
        iterations = args.iterations,
        local_workers,
        batch_size,
        "Queueing benchmark batches plus one warmup batch per worker",
    );
    for _ in 0..total {
        renderer.render_batch_async(Batch::with_batch_seed(states.clone(), seed)?, tx.clone())?;
        seed += batch_size as u64;
    }
    drop(tx);

    for _ in 0..local_workers {
        next_result(&mut rx).await?;
    }
    tracing::info!("Warmup done, starting benchmark");

    let start = Instant::now();
    for _ in 0..args.iterations * local_workers {
        next_result(&mut rx).await?;
    }
    let elapsed = start.elapsed().as_secs_f64();

    let frames = local_workers * args.iterations * batch_size * cameras;
    tracing::info!(
        renderer = renderer.name(),
        frames,
        elapsed_secs = elapsed,
        fps = frames as f64 / elapsed,
        "Benchmark finished",
    );
    Ok(())
}

async fn next_result(rx: &mut mpsc::UnboundedReceiver<RenderOutput>) -> anyhow::Result<Batch> {
    let output = rx
        .recv()
        .await
        .context("Renderer stopped before delivering every batch")?;
    Ok(output?)
}

/// Parse a CSV of scene states.
fn load_states(path: &Path) -> anyhow::Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read states '{}'", path.display()))?;
    parse_states(&text).with_context(|| format!("parse states '{}'", path.display()))
}

fn parse_states(text: &str) -> anyhow::Result<Vec<Vec<f64>>> {
    let states = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(row, line)| {
            line.split(',')
                .map(|v| v.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("row {}", row + 1))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    anyhow::ensure!(!states.is_empty(), "no states found");
    Ok(states)
}
