//! Row types for the three entity tables and their batched insert
//! builders. All hash and address columns hold lower-case hex without the
//! `0x` prefix.

use ethers::types::{Bytes, H160, H256};
use field_count::FieldCount;
use sqlx::{MySql, QueryBuilder};

use crate::error::{classify_db, IndexerError};

/// Literal stored in unused topic slots.
pub const NULL_TOPIC: &str = "NULL";
pub const NUM_TOPICS: usize = 4;

pub fn format_hash(hash: H256) -> String {
    hex::encode(hash.as_bytes())
}

pub fn format_address(address: H160) -> String {
    hex::encode(address.as_bytes())
}

pub fn format_bytes(bytes: &Bytes) -> String {
    hex::encode(bytes.as_ref())
}

#[derive(Debug, Clone, FieldCount, sqlx::FromRow)]
pub struct BlockRow {
    pub hash: String,
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, FieldCount)]
pub struct TransactionRow {
    pub id: u64,
    pub hash: String,
    pub function_sig: String,
    pub input: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    pub from_address: String,
    pub to_address: String,
    /// 0 failed, 1 success, 2 receipt not fetched.
    pub status: u64,
    pub value: String,
    pub gas_price: String,
    pub gas: u64,
    pub timestamp: u64,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, FieldCount)]
pub struct LogRow {
    /// Zero when the log arrived through `eth_getLogs` rather than from a
    /// matched transaction's receipt.
    pub transaction_id: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub address: String,
    pub data: String,
    pub topic0: String,
    pub topic1: String,
    pub topic2: String,
    pub topic3: String,
    pub block_number: u64,
    pub timestamp: u64,
}

/// Everything one batch commits atomically.
#[derive(Debug, Default)]
pub struct BatchData {
    pub blocks: Vec<BlockRow>,
    pub transactions: Vec<TransactionRow>,
    pub logs: Vec<LogRow>,
}

pub(crate) async fn insert_blocks(
    dbtx: &mut sqlx::Transaction<'_, MySql>,
    blocks: &[BlockRow],
) -> Result<(), IndexerError> {
    if blocks.is_empty() {
        return Ok(());
    }

    for (start, end) in get_chunks(blocks.len(), BlockRow::field_count()) {
        let mut query_builder =
            QueryBuilder::new("INSERT IGNORE INTO blocks (hash, number, timestamp) ");

        query_builder.push_values(&blocks[start..end], |mut row, block| {
            row.push_bind(block.hash.clone())
                .push_bind(block.number)
                .push_bind(block.timestamp);
        });

        query_builder
            .build()
            .execute(&mut **dbtx)
            .await
            .map_err(classify_db)?;
    }

    Ok(())
}

pub(crate) async fn insert_transactions(
    dbtx: &mut sqlx::Transaction<'_, MySql>,
    transactions: &[TransactionRow],
) -> Result<(), IndexerError> {
    if transactions.is_empty() {
        return Ok(());
    }

    for (start, end) in get_chunks(transactions.len(), TransactionRow::field_count()) {
        let mut query_builder = QueryBuilder::new(
            "INSERT IGNORE INTO transactions (id, hash, function_sig, input, block_number, \
             block_hash, transaction_index, from_address, to_address, status, value, gas_price, \
             gas, timestamp, signature) ",
        );

        query_builder.push_values(&transactions[start..end], |mut row, tx| {
            row.push_bind(tx.id)
                .push_bind(tx.hash.clone())
                .push_bind(tx.function_sig.clone())
                .push_bind(tx.input.clone())
                .push_bind(tx.block_number)
                .push_bind(tx.block_hash.clone())
                .push_bind(tx.transaction_index)
                .push_bind(tx.from_address.clone())
                .push_bind(tx.to_address.clone())
                .push_bind(tx.status)
                .push_bind(tx.value.clone())
                .push_bind(tx.gas_price.clone())
                .push_bind(tx.gas)
                .push_bind(tx.timestamp)
                .push_bind(tx.signature.clone());
        });

        query_builder
            .build()
            .execute(&mut **dbtx)
            .await
            .map_err(classify_db)?;
    }

    Ok(())
}

pub(crate) async fn insert_logs(
    dbtx: &mut sqlx::Transaction<'_, MySql>,
    logs: &[LogRow],
) -> Result<(), IndexerError> {
    if logs.is_empty() {
        return Ok(());
    }

    for (start, end) in get_chunks(logs.len(), LogRow::field_count()) {
        let mut query_builder = QueryBuilder::new(
            "INSERT IGNORE INTO logs (transaction_id, transaction_hash, log_index, address, \
             data, topic0, topic1, topic2, topic3, block_number, timestamp) ",
        );

        query_builder.push_values(&logs[start..end], |mut row, log| {
            row.push_bind(log.transaction_id)
                .push_bind(log.transaction_hash.clone())
                .push_bind(log.log_index)
                .push_bind(log.address.clone())
                .push_bind(log.data.clone())
                .push_bind(log.topic0.clone())
                .push_bind(log.topic1.clone())
                .push_bind(log.topic2.clone())
                .push_bind(log.topic3.clone())
                .push_bind(log.block_number)
                .push_bind(log.timestamp);
        });

        query_builder
            .build()
            .execute(&mut **dbtx)
            .await
            .map_err(classify_db)?;
    }

    Ok(())
}

const MAX_SQL_PARAMS: usize = u16::MAX as usize;

/// MySQL caps the number of bind parameters per prepared statement, so an
/// item batch may need to be split based on how many columns each row
/// binds. Returns chunk boundaries as `(start_index, end_index)`.
/// Ref: https://github.com/aptos-labs/aptos-core/blob/main/crates/indexer/src/database.rs#L32
pub fn get_chunks(num_items_to_insert: usize, column_count: usize) -> Vec<(usize, usize)> {
    let max_item_size = MAX_SQL_PARAMS / column_count;
    let mut chunk: (usize, usize) = (0, num_items_to_insert.min(max_item_size));
    let mut chunks = vec![chunk];
    while chunk.1 != num_items_to_insert {
        chunk = (
            chunk.0 + max_item_size,
            num_items_to_insert.min(chunk.1 + max_item_size),
        );
        chunks.push(chunk);
    }
    chunks
}
