// Listing Watch - Ingress Server
// Accepts listings from the producer and runs them through the pipeline in
// the background.

use anyhow::Context;
use clap::Parser;
use listing_watch::ingress::{build_router, AppState};
use listing_watch::{init_logging, serve, IngestQueue, ServiceConfig};
use std::sync::Arc;

/// Receives listing events and emails the users watching for them.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    config: ServiceConfig,

    /// Address to listen on.
    #[clap(long, env = "WATCH_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// Listings waiting for a worker before new ones are refused.
    #[clap(long, default_value = "1024")]
    queue_capacity: usize,

    /// Listings ingested at the same time.
    #[clap(long, default_value = "8")]
    max_concurrent_ingestions: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.config.log_format);
    tracing::info!(
        database = ?args.config.database,
        match_mode = ?args.config.match_mode,
        queue_capacity = args.queue_capacity,
        "starting listing watch server"
    );

    let pipeline = Arc::new(args.config.build_pipeline()?);
    let (queue, rx) = IngestQueue::new(args.queue_capacity);
    let worker = tokio::spawn(serve(pipeline, rx, args.max_concurrent_ingestions));

    let app = build_router(AppState { queue });
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", args.bind))?;
    tracing::info!(addr = %args.bind, "listening for listings");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested, no longer accepting listings");
        })
        .await
        .context("serving HTTP")?;

    // The router (and its queue handle) is gone; let queued listings finish.
    let stats = worker.await.context("ingestion worker failed")?;
    tracing::info!(?stats, "ingestion worker finished, exiting");

    Ok(())
}
