use std::path::Path;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use pairflow::{
    Decoder, Engine, HypersyncBlockSource, Indexer, PostgresClient, RpcContractReader, Settings,
};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let settings =
        Settings::new().context("Failed to load config.yaml. Please ensure it exists and is valid")?;

    let level = settings
        .indexer
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    SimpleLogger::new()
        .with_level(level)
        .init()
        .context("Failed to initialize logger")?;

    let postgres = PostgresClient::new(&settings.postgres)
        .await
        .context("Failed to initialize database connection")?;
    postgres.migrate().await?;

    let decoder = match &settings.indexer.abi_dir {
        Some(dir) => {
            info!("Loading interface descriptions from {}", dir);
            Decoder::from_dir(Path::new(dir))?
        },
        None => Decoder::builtin()?,
    };

    let source = HypersyncBlockSource::new(&settings.indexer, &decoder.selectors())?;
    let reader = RpcContractReader::new(&settings.indexer.rpc_url)?;

    info!(
        "Indexing factory {} in {:?} mode",
        settings.indexer.factory_address, settings.indexer.mode
    );

    let engine = Engine::new(reader, postgres, decoder, &settings.indexer, &settings.pricing)?;
    let mut indexer = Indexer::new(
        source,
        engine,
        settings.indexer.start_block,
        settings.indexer.tip_poll_interval_milliseconds,
    );

    let cancellation_token = CancellationToken::new();
    let run = indexer.run(cancellation_token.clone());
    tokio::pin!(run);

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("Indexer running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            // The indexer only returns on its own after a fatal error
            result = &mut run => return result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut run => return result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    // Let the current batch commit, then stop
    cancellation_token.cancel();
    run.await?;

    info!("Indexer stopped");
    Ok(())
}
