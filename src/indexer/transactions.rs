//! Transaction filtering and receipt collection. The filter phase is local
//! and synchronous; the receipt phase fans out over the workers and only
//! touches transactions whose policy actually needs a receipt.

use ethers::types::{Block, Transaction, TransactionReceipt, H256};
use futures::future::try_join_all;
use log::warn;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainApi;
use crate::db::models::{format_address, format_bytes, format_hash, TransactionRow};
use crate::error::IndexerError;
use crate::indexer::matcher::{selector_of, TxMatcher, TxPolicy};
use crate::retry::{retry, Backoff};

/// A matched transaction travelling through the pipeline together with the
/// block context it came from.
#[derive(Debug, Clone)]
pub(crate) struct TxItem {
    pub tx: Transaction,
    pub policy: TxPolicy,
    pub block_number: u64,
    pub block_hash: H256,
    pub block_timestamp: u64,
    pub transaction_index: u64,
    pub receipt: Option<TransactionReceipt>,
}

/// Scans the batch for transactions with a recipient, at least four bytes
/// of calldata and a matching rule.
pub(crate) fn filter_transactions(
    blocks: &[Block<Transaction>],
    matcher: &TxMatcher,
) -> Vec<TxItem> {
    let mut items = Vec::new();

    for block in blocks {
        let (Some(number), Some(hash)) = (block.number, block.hash) else {
            warn!("skipping block without number or hash");
            continue;
        };
        let block_timestamp = block.timestamp.as_u64();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let Some(to) = tx.to else {
                continue;
            };
            let Some(selector) = selector_of(&tx.input) else {
                continue;
            };
            let Some(policy) = matcher.match_tx(to, selector) else {
                continue;
            };

            items.push(TxItem {
                tx: tx.clone(),
                policy,
                block_number: number.as_u64(),
                block_hash: hash,
                block_timestamp,
                transaction_index: tx_index as u64,
                receipt: None,
            });
        }
    }

    items
}

/// Attaches receipts to the matched transactions, partitioned across the
/// workers. An absent receipt is legal and leaves the status unknown.
pub(crate) async fn fetch_receipts(
    chain: &dyn ChainApi,
    backoff: Backoff,
    shutdown: &CancellationToken,
    items: Vec<TxItem>,
    num_parallel_req: u64,
) -> Result<Vec<TxItem>, IndexerError> {
    if items.is_empty() {
        return Ok(items);
    }

    let workers = num_parallel_req.max(1) as usize;
    let per_worker = (items.len() + workers - 1) / workers;

    let mut chunks: Vec<Vec<TxItem>> = Vec::with_capacity(workers);
    let mut remaining = items.into_iter();
    loop {
        let chunk: Vec<TxItem> = remaining.by_ref().take(per_worker).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    let done = try_join_all(chunks.into_iter().map(|mut chunk| async move {
        for item in chunk.iter_mut() {
            if !item.policy.needs_receipt() {
                continue;
            }
            let hash = item.tx.hash;
            item.receipt = retry(backoff, shutdown, "TransactionReceipt", move || {
                chain.transaction_receipt(hash)
            })
            .await?;
        }
        Ok::<_, IndexerError>(chunk)
    }))
    .await?;

    Ok(done.into_iter().flatten().collect())
}

pub(crate) fn count_receipts(items: &[TxItem]) -> usize {
    items.iter().filter(|item| item.receipt.is_some()).count()
}

/// Builds the persisted row for one matched transaction under the
/// allocated internal id.
pub(crate) fn transaction_row(item: &TxItem, id: u64) -> TransactionRow {
    let tx = &item.tx;

    let function_sig = selector_of(&tx.input)
        .map(hex::encode)
        .unwrap_or_default();

    // The node-provided sender is the fallback when the signature does not
    // recover, e.g. on pre-fork transactions with non-standard v values.
    let from_address = tx.recover_from().unwrap_or(tx.from);

    let status = match &item.receipt {
        // A receipt without a status field predates EIP-658 and means the
        // transaction is valid.
        Some(receipt) => receipt.status.map_or(1, |status| status.as_u64()),
        None => 2,
    };

    let signature = item
        .policy
        .collect_signature
        .then(|| pack_signature(tx));

    TransactionRow {
        id,
        hash: format_hash(tx.hash),
        function_sig,
        input: format_bytes(&tx.input),
        block_number: item.block_number,
        block_hash: format_hash(item.block_hash),
        transaction_index: item.transaction_index,
        from_address: format_address(from_address),
        to_address: format_address(tx.to.unwrap_or_default()),
        status,
        value: format!("{:x}", tx.value),
        gas_price: tx.gas_price.unwrap_or_default().to_string(),
        gas: tx.gas.as_u64(),
        timestamp: item.block_timestamp,
        signature,
    }
}

/// 65-byte `r || s || v` with `r` and `s` left-padded to 32 bytes and `v`
/// reduced to its recovery parity form.
pub(crate) fn pack_signature(tx: &Transaction) -> String {
    let mut bytes = [0u8; 65];
    tx.r.to_big_endian(&mut bytes[0..32]);
    tx.s.to_big_endian(&mut bytes[32..64]);
    bytes[64] = normalize_v(tx.v.as_u64());
    hex::encode(bytes)
}

fn normalize_v(v: u64) -> u8 {
    match v {
        // EIP-155: v = chain_id * 2 + 35 + parity.
        v if v >= 35 => 27 + ((v - 35) % 2) as u8,
        0 | 1 => 27 + v as u8,
        v => v as u8,
    }
}
