//! `renderfarm` -- drive a pool of render servers from the command line.
//!
//! # Environment variables
//!
//! | Variable                      | Default           | Description                              |
//! |-------------------------------|-------------------|------------------------------------------|
//! | `RUST_LOG`                    | `renderfarm=info` | Log filter                               |
//! | `RENDERFARM_BINARIES_DIR`     | --                | Directory with built renderer packages   |
//! | `RENDERFARM_VERSION_OVERRIDE` | --                | Force a renderer version                 |
//! | `RENDERFARM_DETACHED`         | --                | Do not spawn servers, only connect       |
//! | `RENDERFARM_MINIMAL`          | --                | Use at most this many server slots       |
//! | `RENDERFARM_DISPLAY`          | `0`               | X display for spawned servers            |

mod benchmark;
mod request_batch;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "renderfarm", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure pool throughput in frames per second.
    Benchmark(benchmark::BenchmarkArgs),
    /// Send batches straight to one running server and summarize the output.
    RequestBatch(request_batch::RequestBatchArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renderfarm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Benchmark(args) => benchmark::run(args).await,
        Command::RequestBatch(args) => request_batch::run(args).await,
    }
}
