//! `renderfarm request-batch`: query one running render server directly.
//!
//! Useful against a server started by hand in server mode. Each response is
//! decoded and summarized per stream.

use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use renderfarm_core::decode::convert_render_batch_response;
use renderfarm_core::{build_render_batch_request, Batch, RemoteRendererConfig};
use renderfarm_server::{RenderClient, RenderService};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_CAMERAS: [&str; 3] = ["vision_cam_top", "vision_cam_left", "vision_cam_right"];

#[derive(Args, Debug)]
pub struct RequestBatchArgs {
    #[arg(long, short = 'H', default_value = "localhost")]
    host: String,

    #[arg(long, short, default_value_t = 6666)]
    port: u16,

    #[arg(long, short, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, short = 's', default_value_t = 200)]
    image_size: u32,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    render_depth: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    render_normals: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    render_segmentation: bool,

    /// Length of the all-zero state sent for every entry.
    #[arg(long, default_value_t = 100)]
    qpos_len: usize,

    /// Number of batches to request; the seed advances by the batch size.
    #[arg(long, default_value_t = 1)]
    count: usize,
}

pub async fn run(args: RequestBatchArgs) -> anyhow::Result<()> {
    let client = RenderClient::new(&args.host, args.port);
    client
        .health(HANDSHAKE_TIMEOUT)
        .await
        .with_context(|| format!("render server at {} is not ready", client.base_url()))?;

    let config = RemoteRendererConfig {
        camera_names: DEFAULT_CAMERAS.iter().map(|c| c.to_string()).collect(),
        image_width: args.image_size,
        image_height: args.image_size,
        render_depth: args.render_depth,
        render_normals: args.render_normals,
        render_segmentation: args.render_segmentation,
        spawn_servers: false,
        ..Default::default()
    };

    let mut seed = 0u64;
    for _ in 0..args.count {
        let batch = Batch::with_batch_seed(vec![vec![0.0; args.qpos_len]; args.batch_size], seed)?;
        let request = build_render_batch_request(&batch, &config);
        let response = client.render_batch(&request).await?;
        let streams = convert_render_batch_response(&response, &config, batch.len())?;

        println!("batch seed {seed}:");
        for (name, array) in &streams {
            println!("  {name}: {:?}", array.shape());
        }
        seed += args.batch_size as u64;
    }
    Ok(())
}
