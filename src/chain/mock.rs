//! Deterministic in-memory chain used by the stage tests: a tape of
//! `height` blocks with a fixed block time, plus transactions, receipts
//! and logs registered by the test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Block, Log, Transaction, TransactionReceipt, H256, U256, U64};

use crate::chain::{ChainApi, Header, LogFilter};
use crate::error::IndexerError;

pub(crate) struct MockChain {
    chain_id: u64,
    genesis_timestamp: u64,
    block_time: u64,
    height: AtomicU64,
    transactions: Mutex<HashMap<u64, Vec<Transaction>>>,
    receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    logs: Mutex<Vec<Log>>,
}

impl MockChain {
    pub fn with_blocks(height: u64, genesis_timestamp: u64, block_time: u64) -> Self {
        Self {
            chain_id: 114,
            genesis_timestamp,
            block_time,
            height: AtomicU64::new(height),
            transactions: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn timestamp_of(&self, number: u64) -> u64 {
        self.genesis_timestamp + number * self.block_time
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn add_transaction(&self, block_number: u64, mut tx: Transaction) {
        tx.block_number = Some(U64::from(block_number));
        tx.block_hash = Some(block_hash(block_number));
        self.transactions
            .lock()
            .unwrap()
            .entry(block_number)
            .or_default()
            .push(tx);
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        self.receipts
            .lock()
            .unwrap()
            .insert(receipt.transaction_hash, receipt);
    }

    pub fn add_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    fn resolve(&self, number: Option<u64>) -> Result<u64, IndexerError> {
        let height = self.height.load(Ordering::SeqCst);
        let number = number.unwrap_or(height);
        if number > height {
            return Err(IndexerError::RpcPermanent(
                format!("block {number} not found").into(),
            ));
        }
        Ok(number)
    }
}

fn block_hash(number: u64) -> H256 {
    H256::from_low_u64_be(number.wrapping_mul(0x9e37_79b9) | 1)
}

#[async_trait]
impl ChainApi for MockChain {
    async fn chain_id(&self) -> Result<U256, IndexerError> {
        Ok(U256::from(self.chain_id))
    }

    async fn block_by_number(
        &self,
        number: Option<u64>,
    ) -> Result<Block<Transaction>, IndexerError> {
        let number = self.resolve(number)?;
        let transactions = self
            .transactions
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default();

        Ok(Block {
            number: Some(U64::from(number)),
            hash: Some(block_hash(number)),
            timestamp: U256::from(self.timestamp_of(number)),
            transactions,
            ..Block::default()
        })
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, IndexerError> {
        let number = self.resolve(number)?;
        Ok(Header {
            number,
            timestamp: self.timestamp_of(number),
        })
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, IndexerError> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, IndexerError> {
        let logs = self.logs.lock().unwrap();

        Ok(logs
            .iter()
            .filter(|log| {
                let number = log.block_number.unwrap_or_default().as_u64();
                if number < filter.from_block || number > filter.to_block {
                    return false;
                }
                if let Some(address) = filter.address {
                    if log.address != address {
                        return false;
                    }
                }
                if let Some(topic0) = filter.topic0 {
                    if log.topics.first() != Some(&topic0) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect())
    }
}
