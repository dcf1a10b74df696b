//! Unified access to Flare-family RPC nodes. The two supported node
//! flavors (geth-style and avalanche coreth) expose the same JSON-RPC
//! methods with slightly different response envelopes; everything behind
//! [`ChainApi`] is already normalized to one internal shape.

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Block, Log, Transaction, TransactionReceipt, H160, H256, U256};
use jsonrpsee::core::{client::ClientT, rpc_params};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{classify_rpc, IndexerError};

#[cfg(test)]
pub(crate) mod mock;

/// Which RPC dialect the configured node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Eth,
    Coreth,
}

impl Default for ChainKind {
    fn default() -> Self {
        ChainKind::Coreth
    }
}

/// Normalized block header: the only parts of a header the indexer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub number: u64,
    pub timestamp: u64,
}

/// One `eth_getLogs` query. `None` fields are omitted from the request.
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Option<H160>,
    pub topic0: Option<H256>,
}

impl LogFilter {
    fn to_value(&self) -> Value {
        let mut filter = serde_json::json!({
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
        });
        if let Some(address) = self.address {
            filter["address"] = serde_json::json!([address]);
        }
        if let Some(topic0) = self.topic0 {
            filter["topics"] = serde_json::json!([[topic0]]);
        }
        filter
    }
}

/// The chain operations the indexer consumes. `None` block numbers mean
/// "latest".
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_id(&self) -> Result<U256, IndexerError>;

    async fn block_by_number(
        &self,
        number: Option<u64>,
    ) -> Result<Block<Transaction>, IndexerError>;

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, IndexerError>;

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, IndexerError>;

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, IndexerError>;
}

/// Avalanche header extensions present on coreth blocks; dropped during
/// normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorethBlock {
    #[serde(flatten)]
    pub block: Block<Transaction>,
    pub block_extra_data: Option<String>,
    pub ext_data_hash: Option<H256>,
    pub block_gas_cost: Option<U256>,
    pub ext_data_gas_used: Option<U256>,
}

pub struct NodeClient {
    client: HttpClient,
    kind: ChainKind,
}

impl NodeClient {
    pub fn connect(node_url: &Url, kind: ChainKind, timeout: Duration) -> Result<Self, IndexerError> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(node_url.as_str())
            .map_err(classify_rpc)?;

        Ok(Self { client, kind })
    }

    async fn request(&self, method: &'static str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let mut builder = rpc_params![];
        for param in params {
            builder
                .insert(param)
                .map_err(|err| IndexerError::RpcPermanent(err.into()))?;
        }

        self.client
            .request(method, builder)
            .await
            .map_err(classify_rpc)
    }
}

fn block_param(number: Option<u64>) -> Value {
    match number {
        Some(number) => Value::String(format!("0x{number:x}")),
        None => Value::String("latest".to_owned()),
    }
}

#[async_trait]
impl ChainApi for NodeClient {
    async fn chain_id(&self) -> Result<U256, IndexerError> {
        let value = self.request("eth_chainId", vec![]).await?;
        serde_json::from_value(value).map_err(|err| IndexerError::malformed("eth_chainId", err))
    }

    async fn block_by_number(
        &self,
        number: Option<u64>,
    ) -> Result<Block<Transaction>, IndexerError> {
        let value = self
            .request(
                "eth_getBlockByNumber",
                vec![block_param(number), Value::Bool(true)],
            )
            .await?;

        if value.is_null() {
            return Err(IndexerError::RpcPermanent(
                format!("block {number:?} not found").into(),
            ));
        }

        match self.kind {
            ChainKind::Eth => serde_json::from_value(value)
                .map_err(|err| IndexerError::malformed("eth_getBlockByNumber", err)),
            ChainKind::Coreth => serde_json::from_value::<CorethBlock>(value)
                .map(|coreth| coreth.block)
                .map_err(|err| IndexerError::malformed("eth_getBlockByNumber (coreth)", err)),
        }
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, IndexerError> {
        let value = self
            .request(
                "eth_getBlockByNumber",
                vec![block_param(number), Value::Bool(false)],
            )
            .await?;

        if value.is_null() {
            return Err(IndexerError::RpcPermanent(
                format!("header {number:?} not found").into(),
            ));
        }

        // Both flavors agree on the header fields the indexer needs, so
        // one parse covers them; coreth extensions are ignored.
        let header: Block<H256> = serde_json::from_value(value)
            .map_err(|err| IndexerError::malformed("eth_getBlockByNumber", err))?;

        normalize_header(&header)
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, IndexerError> {
        let value = self
            .request(
                "eth_getTransactionReceipt",
                vec![serde_json::json!(hash)],
            )
            .await?;

        if value.is_null() {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| IndexerError::malformed("eth_getTransactionReceipt", err))
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, IndexerError> {
        let value = self.request("eth_getLogs", vec![filter.to_value()]).await?;

        serde_json::from_value(value).map_err(|err| IndexerError::malformed("eth_getLogs", err))
    }
}

fn normalize_header(block: &Block<H256>) -> Result<Header, IndexerError> {
    let number = block
        .number
        .ok_or_else(|| IndexerError::RpcPermanent("header without a number".into()))?;

    Ok(Header {
        number: number.as_u64(),
        timestamp: block.timestamp.as_u64(),
    })
}
