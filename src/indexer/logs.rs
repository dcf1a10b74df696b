//! Event-log collection. Logs arrive from two sources: receipts of matched
//! transactions, and `eth_getLogs` queries driven by the configured log
//! rules (for contracts whose emitting transactions are not themselves
//! matched, e.g. internal-call events). The `(transaction_hash, log_index)`
//! key deduplicates across the two sources.

use std::collections::HashSet;

use ethers::types::{Block, Log, Transaction, H256};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainApi, LogFilter};
use crate::config::LogInfo;
use crate::db::models::{
    format_address, format_hash, LogRow, NULL_TOPIC, NUM_TOPICS,
};
use crate::error::IndexerError;
use crate::indexer::blocks::partition;
use crate::indexer::matcher::{parse_address, WILDCARD};
use crate::indexer::transactions::TxItem;
use crate::retry::{retry, Backoff};

/// One compiled `collect_logs` rule.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogSpec {
    pub address: Option<ethers::types::H160>,
    pub topic0: Option<H256>,
}

pub(crate) fn compile_log_specs(items: &[LogInfo]) -> Result<Vec<LogSpec>, IndexerError> {
    items
        .iter()
        .map(|item| {
            Ok(LogSpec {
                address: parse_address(&item.contract_address)?,
                topic0: parse_topic(&item.topic)?,
            })
        })
        .collect()
}

fn parse_topic(raw: &str) -> Result<Option<H256>, IndexerError> {
    if raw == WILDCARD {
        return Ok(None);
    }

    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped)
        .map_err(|err| IndexerError::Config(format!("invalid topic {raw}: {err}")))?;

    if bytes.len() != 32 {
        return Err(IndexerError::Config(format!("invalid topic length: {raw}")));
    }

    Ok(Some(H256::from_slice(&bytes)))
}

/// Runs every log rule over `[batch_start, batch_end]`, chunked by
/// `log_range` blocks per query; the chunk queries of one rule are
/// partitioned among the workers.
pub(crate) async fn fetch_logs(
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    specs: &[LogSpec],
    batch_start: u64,
    batch_end: u64,
    log_range: u64,
    num_parallel_req: u64,
) -> Result<Vec<Log>, IndexerError> {
    let mut collected = Vec::new();

    let chunk_starts: Vec<u64> = (batch_start..=batch_end)
        .step_by(log_range.max(1) as usize)
        .collect();

    for spec in specs {
        let spec = *spec;

        let workers = partition(chunk_starts.len() as u64, num_parallel_req)
            .into_iter()
            .map(|(part_start, part_stop)| {
                let starts = chunk_starts[part_start as usize..part_stop as usize].to_vec();
                async move {
                    let mut logs = Vec::new();
                    for from_block in starts {
                        let filter = LogFilter {
                            from_block,
                            to_block: (from_block + log_range - 1).min(batch_end),
                            address: spec.address,
                            topic0: spec.topic0,
                        };
                        let chunk = retry(backoff, shutdown, "FilterLogs", || {
                            let filter = filter.clone();
                            async move { chain.filter_logs(&filter).await }
                        })
                        .await?;
                        logs.extend(chunk);
                    }
                    Ok::<_, IndexerError>(logs)
                }
            });

        for logs in try_join_all(workers).await? {
            collected.extend(logs);
        }
    }

    Ok(collected)
}

pub(crate) type LogKey = (String, u64);

fn topics_of(log: &Log) -> [String; NUM_TOPICS] {
    std::array::from_fn(|i| {
        log.topics
            .get(i)
            .map(|topic| format_hash(*topic))
            .unwrap_or_else(|| NULL_TOPIC.to_owned())
    })
}

/// Rows for the logs a matched transaction's receipt carries. Every emitted
/// key is recorded in `seen` so the filter-stage rows cannot duplicate it.
pub(crate) fn receipt_log_rows(
    item: &TxItem,
    transaction_id: u64,
    seen: &mut HashSet<LogKey>,
) -> Vec<LogRow> {
    let Some(receipt) = &item.receipt else {
        return Vec::new();
    };

    receipt
        .logs
        .iter()
        .map(|log| {
            let transaction_hash = format_hash(item.tx.hash);
            let log_index = log.log_index.unwrap_or_default().as_u64();
            seen.insert((transaction_hash.clone(), log_index));

            let [topic0, topic1, topic2, topic3] = topics_of(log);
            LogRow {
                transaction_id,
                transaction_hash,
                log_index,
                address: format_address(log.address),
                data: hex::encode(&log.data),
                topic0,
                topic1,
                topic2,
                topic3,
                block_number: item.block_number,
                timestamp: item.block_timestamp,
            }
        })
        .collect()
}

/// Rows for filter-stage logs, timestamped from the batch blocks and
/// deduplicated against the receipt-sourced keys. Filter-sourced rows carry
/// no internal transaction id.
pub(crate) fn filter_log_rows(
    logs: &[Log],
    blocks: &[Block<Transaction>],
    batch_start: u64,
    seen: &HashSet<LogKey>,
) -> Result<Vec<LogRow>, IndexerError> {
    let mut rows = Vec::new();

    for log in logs {
        let block_number = log
            .block_number
            .ok_or_else(|| IndexerError::RpcPermanent("log without a block number".into()))?
            .as_u64();

        let block = block_number
            .checked_sub(batch_start)
            .and_then(|offset| blocks.get(offset as usize))
            .ok_or_else(|| {
                IndexerError::RpcPermanent(
                    format!("log block {block_number} outside of batch").into(),
                )
            })?;

        if block.number.map(|number| number.as_u64()) != Some(block_number) {
            return Err(IndexerError::RpcPermanent(
                format!("block number mismatch for log in block {block_number}").into(),
            ));
        }

        let transaction_hash = format_hash(log.transaction_hash.unwrap_or_default());
        let log_index = log.log_index.unwrap_or_default().as_u64();
        if seen.contains(&(transaction_hash.clone(), log_index)) {
            continue;
        }

        let [topic0, topic1, topic2, topic3] = topics_of(log);
        rows.push(LogRow {
            transaction_id: 0,
            transaction_hash,
            log_index,
            address: format_address(log.address),
            data: hex::encode(&log.data),
            topic0,
            topic1,
            topic2,
            topic3,
            block_number,
            timestamp: block.timestamp.as_u64(),
        });
    }

    Ok(rows)
}
