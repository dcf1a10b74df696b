//! The block indexer: history mode catches up in wide batches, continuous
//! mode tails the confirmed head block by block. Both run the same stages:
//! fetch blocks, filter transactions, fetch receipts, fetch logs, persist.

pub(crate) mod blocks;
pub(crate) mod logs;
pub mod matcher;
pub(crate) mod transactions;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::{Block, Log, Transaction};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainApi, Header};
use crate::config::{Config, IndexerConfig};
use crate::db::models::{BatchData, BlockRow};
use crate::db::states::{DbStates, LAST_CHAIN_INDEX, LAST_DATABASE_INDEX};
use crate::db::Store;
use crate::error::IndexerError;
use crate::retry::{retry, Backoff};

use blocks::fetch_block_range;
use logs::{compile_log_specs, fetch_logs, filter_log_rows, receipt_log_rows, LogSpec};
use matcher::TxMatcher;
use transactions::{count_receipts, fetch_receipts, filter_transactions, transaction_row, TxItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexRange {
    start: u64,
    end: u64,
}

pub struct BlockIndexer {
    store: Arc<Store>,
    states: Arc<DbStates>,
    chain: Arc<dyn ChainApi>,
    params: IndexerConfig,
    matcher: TxMatcher,
    log_specs: Vec<LogSpec>,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl BlockIndexer {
    pub fn new(
        cfg: &Config,
        store: Arc<Store>,
        states: Arc<DbStates>,
        chain: Arc<dyn ChainApi>,
        shutdown: CancellationToken,
    ) -> Result<Self, IndexerError> {
        let matcher = TxMatcher::compile(&cfg.indexer.collect_transactions)?;
        let log_specs = compile_log_specs(&cfg.indexer.collect_logs)?;

        Ok(Self {
            store,
            states,
            chain,
            params: normalize_params(cfg.indexer.clone()),
            matcher,
            log_specs,
            backoff: cfg.timeout.backoff(),
            shutdown,
        })
    }

    /// Catches up from the effective start to the confirmed head in
    /// batches of `batch_size` blocks.
    pub async fn index_history(&self) -> Result<(), IndexerError> {
        let mut range = self.get_index_range().await?;

        info!("Starting to index blocks from {} to {}", range.start, range.end);

        let mut batch_start = range.start;
        while batch_start <= range.end {
            if self.shutdown.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }

            self.index_batch(&range, batch_start).await?;

            // In the second to last batch, refresh the chain head to pick
            // up the blocks produced while the loop was running.
            if should_refresh_head(batch_start, self.params.batch_size, range.end) {
                range = self.refresh_head_history(range).await?;
            }

            batch_start += self.params.batch_size;
        }

        Ok(())
    }

    /// Tails the chain one confirmed block at a time, polling for new
    /// blocks when caught up.
    pub async fn index_continuous(&self) -> Result<(), IndexerError> {
        let mut range = self.get_index_range().await?;

        info!("Continuously indexing blocks from {}", range.start);

        let mut last_new_block = Instant::now();
        let mut block_num = range.start;

        while block_num <= self.params.stop_index {
            if self.shutdown.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }

            if block_num > range.end {
                debug!("Up to date, last block {}", range.end);

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(
                        self.params.new_block_check_millis,
                    )) => {}
                    _ = self.shutdown.cancelled() => return Err(IndexerError::Cancelled),
                }

                range = self.refresh_head_continuous(range).await?;
                self.warn_if_stale(last_new_block);
                continue;
            }

            last_new_block = Instant::now();
            self.index_continuous_iteration(block_num).await?;
            block_num += 1;
        }

        debug!(
            "Stopping the indexer at block {}",
            self.states.index_of(LAST_DATABASE_INDEX).unwrap_or_default()
        );

        Ok(())
    }

    async fn index_batch(&self, range: &IndexRange, batch_start: u64) -> Result<(), IndexerError> {
        let batch_end = (batch_start + self.params.batch_size - 1).min(range.end);
        let chain = self.chain.as_ref();

        // The log queries only need the block range, so they run alongside
        // the block/receipt pipeline.
        let ((blocks, items), filter_logs) = tokio::try_join!(
            async {
                let started = Instant::now();
                let blocks = fetch_block_range(
                    chain,
                    self.backoff,
                    &self.shutdown,
                    batch_start,
                    batch_end,
                    self.params.num_parallel_req,
                )
                .await?;
                info!(
                    "Successfully obtained blocks {} to {} in {} milliseconds",
                    batch_start,
                    batch_end,
                    started.elapsed().as_millis()
                );

                let started = Instant::now();
                let items = filter_transactions(&blocks, &self.matcher);
                info!(
                    "Successfully extracted {} transactions in {} milliseconds",
                    items.len(),
                    started.elapsed().as_millis()
                );

                let started = Instant::now();
                let items = fetch_receipts(
                    chain,
                    self.backoff,
                    &self.shutdown,
                    items,
                    self.params.num_parallel_req,
                )
                .await?;
                info!(
                    "Checked receipts of {} transactions in {} milliseconds",
                    count_receipts(&items),
                    started.elapsed().as_millis()
                );

                Ok::<_, IndexerError>((blocks, items))
            },
            async {
                let started = Instant::now();
                let logs = fetch_logs(
                    chain,
                    self.backoff,
                    &self.shutdown,
                    &self.log_specs,
                    batch_start,
                    batch_end,
                    self.params.log_range,
                    self.params.num_parallel_req,
                )
                .await?;
                info!(
                    "Obtained {} logs by request in {} milliseconds",
                    logs.len(),
                    started.elapsed().as_millis()
                );
                Ok::<_, IndexerError>(logs)
            },
        )?;

        let last_db_timestamp = blocks
            .last()
            .map(|block| block.timestamp.as_u64())
            .unwrap_or_default();

        self.save(&blocks, &items, &filter_logs, batch_start, batch_end, last_db_timestamp)
            .await
    }

    async fn index_continuous_iteration(&self, block_num: u64) -> Result<(), IndexerError> {
        let chain = self.chain.as_ref();

        let block = retry(self.backoff, &self.shutdown, "BlockByNumber", move || {
            chain.block_by_number(Some(block_num))
        })
        .await?;
        let blocks = vec![block];

        let items = filter_transactions(&blocks, &self.matcher);
        let items = fetch_receipts(
            chain,
            self.backoff,
            &self.shutdown,
            items,
            self.params.num_parallel_req,
        )
        .await?;

        let filter_logs = fetch_logs(
            chain,
            self.backoff,
            &self.shutdown,
            &self.log_specs,
            block_num,
            block_num,
            self.params.log_range,
            self.params.num_parallel_req,
        )
        .await?;

        let timestamp = blocks[0].timestamp.as_u64();
        self.save(&blocks, &items, &filter_logs, block_num, block_num, timestamp)
            .await?;

        if block_num % 1000 == 0 {
            info!("Indexer at block {block_num}");
        }

        Ok(())
    }

    async fn save(
        &self,
        blocks: &[Block<Transaction>],
        items: &[TxItem],
        filter_logs: &[Log],
        batch_start: u64,
        last_db_index: u64,
        last_db_timestamp: u64,
    ) -> Result<(), IndexerError> {
        let started = Instant::now();
        let (data, logs_from_receipts) =
            assemble_batch(blocks, items, filter_logs, batch_start, || {
                self.store.next_transaction_id()
            })?;

        info!(
            "Processed {} blocks with {} transactions and extracted {} logs from receipts and {} new logs from requests in {} milliseconds",
            data.blocks.len(),
            data.transactions.len(),
            logs_from_receipts,
            data.logs.len() - logs_from_receipts,
            started.elapsed().as_millis()
        );

        let started = Instant::now();
        self.store
            .save_batch(&self.states, &data, last_db_index, last_db_timestamp)
            .await?;

        info!(
            "Saved {} transactions and {} logs in the DB in {} milliseconds",
            data.transactions.len(),
            data.logs.len(),
            started.elapsed().as_millis()
        );

        Ok(())
    }

    async fn get_index_range(&self) -> Result<IndexRange, IndexerError> {
        let head = self.confirmed_head().await?;

        let chain = self.chain.as_ref();
        let start_index = self.params.start_index;
        let start_header = retry(self.backoff, &self.shutdown, "HeaderByNumber", move || {
            chain.header_by_number(Some(start_index))
        })
        .await?;

        let (start, end) = self
            .states
            .update_at_start(
                &self.store.pool,
                start_index,
                start_header.timestamp,
                head.number,
                head.timestamp,
                self.params.stop_index,
            )
            .await?;

        Ok(IndexRange { start, end })
    }

    async fn refresh_head_history(&self, mut range: IndexRange) -> Result<IndexRange, IndexerError> {
        let head = self.confirmed_head().await?;
        self.states
            .update(&self.store.pool, LAST_CHAIN_INDEX, head.number, head.timestamp)
            .await?;

        if head.number > range.end && self.params.stop_index > range.end {
            range.end = head.number.min(self.params.stop_index);
            info!("Updating the last block to {}", range.end);
        }

        Ok(range)
    }

    async fn refresh_head_continuous(
        &self,
        mut range: IndexRange,
    ) -> Result<IndexRange, IndexerError> {
        let head = self.confirmed_head().await?;
        self.states
            .update(&self.store.pool, LAST_CHAIN_INDEX, head.number, head.timestamp)
            .await?;

        range.end = head.number;
        Ok(range)
    }

    async fn confirmed_head(&self) -> Result<Header, IndexerError> {
        fetch_confirmed_head(
            self.chain.as_ref(),
            self.backoff,
            &self.shutdown,
            self.params.confirmations,
        )
        .await
    }

    fn warn_if_stale(&self, last_new_block: Instant) {
        let threshold = self.params.no_new_blocks_delay_warning;
        if threshold > 0.0 && last_new_block.elapsed().as_secs_f64() > threshold {
            warn!(
                "No new blocks in the last {:.0} seconds",
                last_new_block.elapsed().as_secs_f64()
            );
        }
    }
}

/// Latest header minus the confirmation depth. The indexer never requests
/// blocks past this boundary.
pub(crate) async fn fetch_confirmed_head(
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    confirmations: u64,
) -> Result<Header, IndexerError> {
    let latest = retry(backoff, shutdown, "HeaderByNumber", move || {
        chain.header_by_number(None)
    })
    .await?;

    if latest.number < confirmations {
        return Err(IndexerError::ChainBoundary {
            latest: latest.number,
            confirmations,
        });
    }

    if confirmations == 0 {
        return Ok(latest);
    }

    let confirmed = latest.number - confirmations;
    retry(backoff, shutdown, "HeaderByNumber", move || {
        chain.header_by_number(Some(confirmed))
    })
    .await
}

/// Converts one fetched batch into rows, allocating transaction ids and
/// deduplicating logs across the two sources. Returns the batch data and
/// the number of logs that came from receipts.
pub(crate) fn assemble_batch(
    blocks: &[Block<Transaction>],
    items: &[TxItem],
    filter_logs: &[Log],
    batch_start: u64,
    mut next_id: impl FnMut() -> u64,
) -> Result<(BatchData, usize), IndexerError> {
    let mut data = BatchData::default();

    for block in blocks {
        if let Some(row) = block_row(block) {
            data.blocks.push(row);
        }
    }

    let mut seen = HashSet::new();
    for item in items {
        let id = next_id();
        data.transactions.push(transaction_row(item, id));

        if item.policy.collect_events {
            data.logs.extend(receipt_log_rows(item, id, &mut seen));
        }
    }

    let logs_from_receipts = data.logs.len();
    data.logs
        .extend(filter_log_rows(filter_logs, blocks, batch_start, &seen)?);

    Ok((data, logs_from_receipts))
}

fn block_row(block: &Block<Transaction>) -> Option<BlockRow> {
    Some(BlockRow {
        hash: crate::db::models::format_hash(block.hash?),
        number: block.number?.as_u64(),
        timestamp: block.timestamp.as_u64(),
    })
}

fn should_refresh_head(batch_start: u64, batch_size: u64, end: u64) -> bool {
    batch_start + batch_size <= end && batch_start + 2 * batch_size > end
}

fn normalize_params(mut params: IndexerConfig) -> IndexerConfig {
    if params.stop_index == 0 {
        params.stop_index = u64::MAX;
    }

    if params.num_parallel_req == 0 {
        params.num_parallel_req = 1;
    }

    // Whole batches divide evenly among the workers.
    params.batch_size -= params.batch_size % params.num_parallel_req;

    if params.batch_size == 0 {
        params.batch_size = 1;
    }

    if params.log_range == 0 {
        params.log_range = 1;
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::config::TransactionInfo;
    use crate::indexer::matcher::TxPolicy;
    use ethers::types::{Bytes, TransactionReceipt, H256, U256, U64};

    fn fast() -> Backoff {
        Backoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed_time: Some(Duration::from_millis(100)),
        }
    }

    #[test]
    fn params_normalization() {
        let params = normalize_params(IndexerConfig {
            batch_size: 503,
            num_parallel_req: 4,
            stop_index: 0,
            log_range: 0,
            ..IndexerConfig::default()
        });

        assert_eq!(params.batch_size, 500);
        assert_eq!(params.stop_index, u64::MAX);
        assert_eq!(params.log_range, 1);

        let params = normalize_params(IndexerConfig {
            batch_size: 0,
            num_parallel_req: 0,
            ..IndexerConfig::default()
        });
        assert_eq!(params.batch_size, 1);
        assert_eq!(params.num_parallel_req, 1);
    }

    #[test]
    fn head_refresh_fires_in_the_second_to_last_batch() {
        // Range 0..=999 with batches of 100: refresh at 800, nowhere else.
        assert!(should_refresh_head(800, 100, 999));
        assert!(!should_refresh_head(700, 100, 999));
        assert!(!should_refresh_head(900, 100, 999));
        // A range shorter than one batch never refreshes.
        assert!(!should_refresh_head(0, 100, 50));
    }

    #[tokio::test]
    async fn confirmed_head_stays_behind_latest() {
        let chain = MockChain::with_blocks(100, 1_700_000_000, 1);

        let head = fetch_confirmed_head(&chain, fast(), &CancellationToken::new(), 3)
            .await
            .unwrap();
        assert_eq!(head.number, 97);
        assert_eq!(head.timestamp, chain.timestamp_of(97));

        let head = fetch_confirmed_head(&chain, fast(), &CancellationToken::new(), 0)
            .await
            .unwrap();
        assert_eq!(head.number, 100);
    }

    #[tokio::test]
    async fn short_chain_reports_the_boundary() {
        let chain = MockChain::with_blocks(5, 1_700_000_000, 1);

        let result = fetch_confirmed_head(&chain, fast(), &CancellationToken::new(), 10).await;
        assert!(matches!(
            result,
            Err(IndexerError::ChainBoundary {
                latest: 5,
                confirmations: 10
            })
        ));
    }

    const ADDR: &str = "0x694905ca5f9f6c49f4748e8193b3e8053fa9e7e4";

    fn batch_fixture() -> (Vec<Block<Transaction>>, Vec<TxItem>, Vec<Log>) {
        let tx_hash = H256::from_low_u64_be(0xaa);
        let emitted = Log {
            address: ADDR.parse().unwrap(),
            block_number: Some(U64::from(101)),
            transaction_hash: Some(tx_hash),
            log_index: Some(U256::zero()),
            ..Log::default()
        };

        let blocks: Vec<Block<Transaction>> = (100u64..103)
            .map(|number| Block {
                number: Some(U64::from(number)),
                hash: Some(H256::from_low_u64_be(number)),
                timestamp: U256::from(1_000_000 + number),
                ..Block::default()
            })
            .collect();

        let item = TxItem {
            tx: Transaction {
                hash: tx_hash,
                to: Some(ADDR.parse().unwrap()),
                input: Bytes::from(vec![0xf1, 0x4f, 0xcb, 0xc8]),
                ..Transaction::default()
            },
            policy: TxPolicy {
                status: true,
                collect_events: true,
                collect_signature: false,
            },
            block_number: 101,
            block_hash: H256::from_low_u64_be(101),
            block_timestamp: 1_000_101,
            transaction_index: 0,
            receipt: Some(TransactionReceipt {
                transaction_hash: tx_hash,
                status: Some(U64::one()),
                logs: vec![emitted.clone()],
                ..TransactionReceipt::default()
            }),
        };

        // The filter stage saw the same log plus an unrelated one.
        let stranger = Log {
            address: ADDR.parse().unwrap(),
            block_number: Some(U64::from(102)),
            transaction_hash: Some(H256::from_low_u64_be(0xbb)),
            log_index: Some(U256::zero()),
            ..Log::default()
        };

        (blocks, vec![item], vec![emitted, stranger])
    }

    #[test]
    fn assemble_allocates_ids_and_dedups_logs() {
        let (blocks, items, filter_logs) = batch_fixture();

        let mut next = 41u64;
        let (data, from_receipts) =
            assemble_batch(&blocks, &items, &filter_logs, 100, || {
                next += 1;
                next
            })
            .unwrap();

        assert_eq!(data.blocks.len(), 3);
        assert_eq!(data.transactions.len(), 1);
        assert_eq!(data.transactions[0].id, 42);
        assert_eq!(data.transactions[0].status, 1);

        // One log from the receipt, one from the filter stage; the
        // receipt-sourced copy wins and keeps the transaction id.
        assert_eq!(from_receipts, 1);
        assert_eq!(data.logs.len(), 2);
        assert_eq!(data.logs[0].transaction_id, 42);
        assert_eq!(data.logs[1].transaction_id, 0);
    }

    #[test]
    fn events_not_collected_still_surface_through_the_filter_stage() {
        let (blocks, mut items, filter_logs) = batch_fixture();
        items[0].policy.collect_events = false;

        let (data, from_receipts) =
            assemble_batch(&blocks, &items, &filter_logs, 100, || 1).unwrap();

        // No receipt-sourced rows, but the matching filter rule still
        // captures the emitted log, now without a transaction id.
        assert_eq!(from_receipts, 0);
        assert_eq!(data.logs.len(), 2);
        assert!(data.logs.iter().all(|log| log.transaction_id == 0));
    }

    #[tokio::test]
    async fn matcher_wires_into_the_filter_stage() {
        let chain = MockChain::with_blocks(10, 1_700_000_000, 1);
        let tx = Transaction {
            hash: H256::from_low_u64_be(1),
            to: Some(ADDR.parse().unwrap()),
            input: Bytes::from(vec![0xf1, 0x4f, 0xcb, 0xc8]),
            ..Transaction::default()
        };
        chain.add_transaction(5, tx);

        let matcher = TxMatcher::compile(&[TransactionInfo {
            contract_address: ADDR.to_owned(),
            func_sig: "0xf14fcbc8".to_owned(),
            status: false,
            collect_events: false,
            signature: false,
        }])
        .unwrap();

        let blocks = fetch_block_range(&chain, fast(), &CancellationToken::new(), 4, 6, 2)
            .await
            .unwrap();
        let items = filter_transactions(&blocks, &matcher);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].block_number, 5);
    }
}
