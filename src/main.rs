use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use log::info;
use tokio_util::sync::CancellationToken;

use flare_indexer::chain::{ChainApi, NodeClient};
use flare_indexer::config::{self, CliArgs, Config};
use flare_indexer::db::history_drop::{self, HISTORY_DROP_INTERVAL_CHECK};
use flare_indexer::db::states::DbStates;
use flare_indexer::db::Store;
use flare_indexer::error::IndexerError;
use flare_indexer::indexer::BlockIndexer;
use flare_indexer::logging;
use flare_indexer::retry::{retry, retry_any, Backoff};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = CliArgs::parse();
    let cfg = config::load(&args.config).context("Error building config")?;

    logging::init(&cfg.logger)?;

    // SIGINT/SIGTERM cancel the shutdown token; every retry loop, both
    // drivers and the history-drop sweep watch it and wind down at their
    // next boundary.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    match run(cfg, shutdown).await {
        Err(err)
            if matches!(
                err.downcast_ref::<IndexerError>(),
                Some(IndexerError::Cancelled)
            ) =>
        {
            info!("Shut down cleanly");
            Ok(())
        }
        result => result,
    }
}

async fn run(mut cfg: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let node_url = cfg
        .chain
        .full_node_url()
        .context("Invalid node URL in config")?;
    let backoff = cfg.timeout.backoff();

    let chain: Arc<dyn ChainApi> = Arc::new(
        NodeClient::connect(&node_url, cfg.chain.chain_type, cfg.timeout.request_timeout())
            .context("Could not connect to the RPC node")?,
    );

    let store = Arc::new(
        Store::connect_and_initialize(&cfg.db)
            .await
            .context("Database connect and initialize errors")?,
    );
    let states = Arc::new(DbStates::load(&store.pool).await?);

    let chain_ref = chain.as_ref();
    let chain_id = retry(backoff, &shutdown, "ChainId", move || chain_ref.chain_id())
        .await
        .context("failed to get chain ID")?;
    info!("Connected to chain ID {chain_id}");

    let history_drop_seconds = cfg.db.history_drop_seconds(chain_id)?;
    log_history_drop(&cfg, history_drop_seconds);

    cfg.indexer.start_index = resolve_start_index(
        &cfg,
        &store,
        chain.as_ref(),
        backoff,
        &shutdown,
        history_drop_seconds,
    )
    .await?;

    let indexer = BlockIndexer::new(
        &cfg,
        store.clone(),
        states.clone(),
        chain.clone(),
        shutdown.clone(),
    )?;

    if history_drop_seconds > 0 {
        // One inline iteration before indexing starts, so the history
        // loop begins from a post-drop floor.
        let (store_ref, states_ref, shutdown_ref) = (store.as_ref(), states.as_ref(), &shutdown);
        let start_index = cfg.indexer.start_index;
        retry(backoff, &shutdown, "DropHistoryIteration", move || {
            history_drop::drop_history_iteration(
                store_ref,
                states_ref,
                chain_ref,
                backoff,
                shutdown_ref,
                history_drop_seconds,
                start_index,
            )
        })
        .await?;
    }

    let indexer_ref = &indexer;
    retry_any(backoff.unbounded(), &shutdown, "IndexHistory", move || {
        indexer_ref.index_history()
    })
    .await
    .context("Index history fatal error")?;

    let drop_task = (history_drop_seconds > 0).then(|| {
        tokio::spawn(history_drop::drop_history(
            store.clone(),
            states.clone(),
            chain.clone(),
            backoff,
            history_drop_seconds,
            HISTORY_DROP_INTERVAL_CHECK,
            cfg.indexer.start_index,
            shutdown.clone(),
        ))
    });

    let continuous = retry_any(backoff.unbounded(), &shutdown, "IndexContinuous", move || {
        indexer_ref.index_continuous()
    })
    .await;

    // Stop the background sweep at its next iteration boundary and wait
    // for it before the process exits.
    shutdown.cancel();
    if let Some(handle) = drop_task {
        let _ = handle.await;
    }

    continuous.context("Index continuous fatal error")?;

    info!("Finished indexing");

    Ok(())
}

/// Where the history loop starts: right after the last indexed block when
/// the DB holds data, at the configured start index otherwise, or at the
/// retention-window floor when a fresh DB runs with history drop enabled.
async fn resolve_start_index(
    cfg: &Config,
    store: &Store,
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    history_drop_seconds: u64,
) -> Result<u64, IndexerError> {
    if let Some(latest) = store.max_block_number().await? {
        info!("Starting after latest indexed block from DB: {latest}");
        return Ok(latest + 1);
    }

    if history_drop_seconds == 0 {
        info!(
            "No indexed blocks found in DB, starting from configured start index: {}",
            cfg.indexer.start_index
        );
        return Ok(cfg.indexer.start_index);
    }

    let configured_start = cfg.indexer.start_index;
    let first_block = retry(backoff, shutdown, "StartBlockAfterHorizon", move || {
        history_drop::start_block_after_horizon(
            chain,
            backoff,
            shutdown,
            history_drop_seconds,
            configured_start,
        )
    })
    .await?;

    info!(
        "No indexed blocks found in DB, starting from calculated start index based on history drop: {first_block}"
    );

    Ok(first_block)
}

fn log_history_drop(cfg: &Config, history_drop_seconds: u64) {
    let days = history_drop_seconds as f64 / (24.0 * 60.0 * 60.0);

    match cfg.db.history_drop {
        None => info!("Using default history drop value of {days:.1} days"),
        Some(0) => info!("History drop disabled"),
        Some(_) => info!("Using configured history drop value of {days:.1} days"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
