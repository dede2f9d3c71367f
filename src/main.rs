use anyhow::Context;
use log::{error, info};
use std::process;

pub mod config;
pub mod pipeline;

use crate::config::AppConfig;
use crate::pipeline::{BusMonitor, GraphBuilder, RunOutcome, StageRegistry};

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(err) = run() {
        error!("{err:#}");
        eprintln!("{err:#}");
        process::exit(1);
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let config = AppConfig::parse()?;

    let registry = StageRegistry::with_defaults();
    let mut graph = GraphBuilder::new(&registry, &config)
        .build()
        .context("failed to assemble pipeline")?;

    let perf = graph.perf_counter();
    let mut monitor = BusMonitor::new(
        graph
            .take_bus_receiver()
            .context("pipeline bus already taken")?,
    );

    // Gracefully stop the graph on SIGINT/SIGTERM.
    let stop = graph.cancel_token();
    let ctrlc_stop = stop.clone();
    ctrlc::set_handler(move || {
        ctrlc_stop.cancel();
    })
    .context("failed to install signal handler")?;

    graph.start().context("failed to start pipeline")?;
    info!("Running...");

    let outcome = monitor.run(&stop).await;

    info!("Stopping playback");
    graph.stop().await;

    match perf.average_fps() {
        Some(fps) => {
            info!("Average fps {fps:.6}");
            println!("Average fps {fps:.6}");
        }
        None => info!("No throughput samples collected"),
    }

    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Failed { source, message } => {
            anyhow::bail!("pipeline failed in {source}: {message}")
        }
    }
}
