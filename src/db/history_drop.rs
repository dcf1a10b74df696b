//! Sliding retention window. Rows older than the horizon are deleted in
//! small batches and the `first_database_block` marker advances past them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::chain::ChainApi;
use crate::db::models::BlockRow;
use crate::db::states::{DbStates, FIRST_DATABASE_INDEX};
use crate::db::Store;
use crate::error::{classify_db, IndexerError};
use crate::retry::{retry, Backoff};

/// Seconds between background sweep iterations.
pub const HISTORY_DROP_INTERVAL_CHECK: u64 = 60 * 30;

// Only delete up to 1000 rows in a single DB transaction to avoid lock
// timeouts.
const DELETE_BATCH_SIZE: u64 = 1000;

// A block found in the DB is only trusted as the cutoff block when its
// timestamp is this close to the requested one.
const MAX_BLOCK_TIME_DIFF_SECONDS: u64 = 60;

const DELETE_ORDER: [&str; 3] = ["logs", "transactions", "blocks"];

/// Background sweep: runs one iteration every `check_interval` seconds and
/// exits at the next iteration boundary once the shutdown token fires.
pub async fn drop_history(
    store: Arc<Store>,
    states: Arc<DbStates>,
    chain: Arc<dyn ChainApi>,
    backoff: Backoff,
    interval_seconds: u64,
    check_interval: u64,
    start_block_number: u64,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(check_interval)) => {}
            _ = shutdown.cancelled() => {
                info!("history drop task stopped");
                return;
            }
        }

        info!("starting history drop iteration");
        let started = Instant::now();

        match drop_history_iteration(
            &store,
            &states,
            chain.as_ref(),
            backoff,
            &shutdown,
            interval_seconds,
            start_block_number,
        )
        .await
        {
            Ok(_) => info!("finished history drop iteration in {:?}", started.elapsed()),
            Err(IndexerError::Cancelled) => {
                info!("history drop task stopped");
                return;
            }
            Err(err) => error!("history drop error: {err}"),
        }
    }
}

/// One sweep: resolve the cutoff block, delete older rows entity by entity
/// in foreign-key order, then advance the first-block marker.
pub async fn drop_history_iteration(
    store: &Store,
    states: &DbStates,
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    interval_seconds: u64,
    start_block_number: u64,
) -> Result<u64, IndexerError> {
    let head = retry(backoff, shutdown, "HeaderByNumber", move || {
        chain.header_by_number(None)
    })
    .await?;

    let cutoff_timestamp = head.timestamp.saturating_sub(interval_seconds);
    let cutoff_block = nearest_block_by_timestamp(
        store,
        chain,
        backoff,
        shutdown,
        cutoff_timestamp,
        start_block_number,
        head.number,
    )
    .await?;

    for table in DELETE_ORDER {
        delete_in_batches(store, table, cutoff_timestamp).await?;
    }

    states
        .update(&store.pool, FIRST_DATABASE_INDEX, cutoff_block, cutoff_timestamp)
        .await?;

    Ok(cutoff_block)
}

/// Post-horizon start block for a fresh database: the first chain block
/// younger than the retention window.
pub async fn start_block_after_horizon(
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    interval_seconds: u64,
    configured_start: u64,
) -> Result<u64, IndexerError> {
    let head = retry(backoff, shutdown, "HeaderByNumber", move || {
        chain.header_by_number(None)
    })
    .await?;

    let cutoff_timestamp = head.timestamp.saturating_sub(interval_seconds);
    nearest_from_chain(
        chain,
        backoff,
        shutdown,
        cutoff_timestamp,
        configured_start,
        head.number,
    )
    .await
}

impl Store {
    async fn oldest_block_at_or_after(
        &self,
        timestamp: u64,
    ) -> Result<Option<BlockRow>, IndexerError> {
        sqlx::query_as(
            "SELECT hash, number, timestamp FROM blocks \
             WHERE timestamp >= ? ORDER BY timestamp ASC LIMIT 1",
        )
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_db)
    }
}

async fn delete_in_batches(
    store: &Store,
    table: &str,
    cutoff_timestamp: u64,
) -> Result<(), IndexerError> {
    let statement = format!("DELETE FROM {table} WHERE timestamp < ? LIMIT {DELETE_BATCH_SIZE}");

    loop {
        let result = sqlx::query(&statement)
            .bind(cutoff_timestamp)
            .execute(&store.pool)
            .await
            .map_err(classify_db)?;

        if result.rows_affected() == 0 {
            return Ok(());
        }
    }
}

/// The store is consulted first; when it has no usable candidate the block
/// is located on the chain with a binary search over headers.
async fn nearest_block_by_timestamp(
    store: &Store,
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    timestamp: u64,
    start_block_number: u64,
    last_block_number: u64,
) -> Result<u64, IndexerError> {
    let candidate = retry(backoff, shutdown, "OldestBlockAtOrAfter", || {
        store.oldest_block_at_or_after(timestamp)
    })
    .await?;

    if let Some(block) = candidate {
        if db_candidate_acceptable(block.timestamp, timestamp) {
            return Ok(block.number);
        }
        warn!(
            "block {} at timestamp {} is too far from the requested timestamp {}",
            block.number, block.timestamp, timestamp
        );
    }

    nearest_from_chain(
        chain,
        backoff,
        shutdown,
        timestamp,
        start_block_number,
        last_block_number,
    )
    .await
}

fn db_candidate_acceptable(block_timestamp: u64, requested: u64) -> bool {
    block_timestamp >= requested && block_timestamp - requested <= MAX_BLOCK_TIME_DIFF_SECONDS
}

/// Smallest block number in `[start_block_number, end_block_number]` whose
/// timestamp is at or past `timestamp`; `end + 1` when the whole range is
/// older. O(log n) header probes.
pub(crate) async fn nearest_from_chain(
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    timestamp: u64,
    start_block_number: u64,
    end_block_number: u64,
) -> Result<u64, IndexerError> {
    let mut low = start_block_number;
    let mut high = end_block_number + 1;

    while low < high {
        let middle = low + (high - low) / 2;
        let header = retry(backoff, shutdown, "HeaderByNumber", move || {
            chain.header_by_number(Some(middle))
        })
        .await?;

        if header.timestamp >= timestamp {
            high = middle;
        } else {
            low = middle + 1;
        }
    }

    Ok(low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;

    fn fast() -> Backoff {
        Backoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed_time: Some(Duration::from_millis(100)),
        }
    }

    #[test]
    fn db_candidate_window_is_one_minute() {
        assert!(db_candidate_acceptable(1000, 1000));
        assert!(db_candidate_acceptable(1060, 1000));
        assert!(!db_candidate_acceptable(1061, 1000));
        // Older than the cutoff is never acceptable.
        assert!(!db_candidate_acceptable(999, 1000));
    }

    // The mock chain produces one block every two seconds starting at a
    // fixed genesis time, so the expected block number is exact arithmetic.
    #[tokio::test]
    async fn binary_search_finds_the_cutoff_block() {
        let chain = MockChain::with_blocks(2500, 1_700_000_000, 2);
        let shutdown = CancellationToken::new();

        let cutoff = chain.timestamp_of(1700);
        let found = nearest_from_chain(&chain, fast(), &shutdown, cutoff, 0, 2500)
            .await
            .unwrap();
        assert_eq!(found, 1700);

        // A timestamp between two blocks resolves to the younger one.
        let found = nearest_from_chain(&chain, fast(), &shutdown, cutoff - 1, 0, 2500)
            .await
            .unwrap();
        assert_eq!(found, 1700);
    }

    #[tokio::test]
    async fn binary_search_clamps_to_range_edges() {
        let chain = MockChain::with_blocks(100, 1_700_000_000, 1);
        let shutdown = CancellationToken::new();

        // Cutoff before the range start.
        let found = nearest_from_chain(&chain, fast(), &shutdown, 1, 10, 100)
            .await
            .unwrap();
        assert_eq!(found, 10);

        // Cutoff beyond the head.
        let cutoff = chain.timestamp_of(100) + 10_000;
        let found = nearest_from_chain(&chain, fast(), &shutdown, cutoff, 0, 100)
            .await
            .unwrap();
        assert_eq!(found, 101);
    }

    #[tokio::test]
    async fn cancellation_stops_the_search() {
        let chain = MockChain::with_blocks(100, 1_700_000_000, 1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = nearest_from_chain(&chain, fast(), &shutdown, 1, 0, 100).await;
        assert!(matches!(result, Err(IndexerError::Cancelled)));
    }
}
