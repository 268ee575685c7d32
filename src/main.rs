//! Grabber: MJPEG sink fed by a synthetic capture source

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grabber::sink::Peer;
use grabber::utils::SyntheticSource;
use grabber::{BufferPool, Config, FileStore, SinkNode};

const DEMO_FPS: u32 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grabber=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Grabber launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    grabber::CONFIG.store(Arc::new(config.clone()));

    let store = FileStore::from_config(&config.storage)?;
    let pool = Arc::new(BufferPool::from_config(&config.pool, Box::new(store))?);
    let mut node = SinkNode::new(&config.sink, Arc::clone(&pool));
    let endpoint = Arc::clone(node.endpoint());

    // Negotiate: offer our formats back to the endpoint until one sticks
    let source = Arc::new(SyntheticSource::new(
        "synthetic",
        config.sink.camera_id,
        DEMO_FPS,
    ));
    let format = endpoint
        .enumerate_formats()
        .find(|f| endpoint.accepts(f))
        .ok_or_else(|| eyre!("sink accepts no formats"))?;
    endpoint.connect(Arc::clone(&source) as Arc<dyn Peer>, &format)?;
    node.run(Utc::now());

    let mut ticker = tokio::time::interval(Duration::from_secs(1) / DEMO_FPS);
    let sizes = [48_000usize, 52_000, 61_000, 45_000];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let len = sizes[source.produced() as usize % sizes.len()];
                if source.produced() % 150 == 0 {
                    endpoint.arm_one_shot(source.produced() as u32);
                }
                if let Err(e) = endpoint.push(&source.frame(len)) {
                    warn!("push failed: {e}");
                }
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to listen for ctrl-c: {e}");
                }
                break;
            }
        }
    }

    endpoint.end_of_stream();
    node.stop();
    endpoint.disconnect();
    pool.shutdown();

    info!(frames = source.produced(), stats = ?pool.stats(), "Grabber shutting down");
    Ok(())
}
