use jsonrpsee::http_client::transport::Error as HttpTransportError;
use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Classified failure modes of the indexer. The retry layer keys off
/// `is_transient` for per-call retries and `is_fatal` for the driver-level
/// loops, which retry everything else.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient RPC error: {0}")]
    RpcTransient(#[source] Source),

    #[error("RPC error: {0}")]
    RpcPermanent(#[source] Source),

    #[error("chain has {latest} blocks, need at least {confirmations} confirmations")]
    ChainBoundary { latest: u64, confirmations: u64 },

    #[error("transient database error: {0}")]
    DbTransient(#[source] sqlx::Error),

    #[error("database integrity error: {0}")]
    DbIntegrity(#[source] sqlx::Error),

    #[error("cancelled")]
    Cancelled,
}

impl IndexerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::RpcTransient(_) | IndexerError::DbTransient(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexerError::Config(_) | IndexerError::DbIntegrity(_) | IndexerError::Cancelled
        )
    }

    pub fn malformed(context: &str, err: serde_json::Error) -> Self {
        IndexerError::RpcPermanent(format!("{context}: {err}").into())
    }
}

/// JSON-RPC call errors carry a response from the node and will not succeed
/// on a replay. At the HTTP layer the split runs on the status code: rate
/// limiting and server-side failures are worth retrying, any other client
/// error will just be rejected again.
pub fn classify_rpc(err: jsonrpsee::core::Error) -> IndexerError {
    let status_code = match &err {
        jsonrpsee::core::Error::Call(_) => return IndexerError::RpcPermanent(err.into()),
        jsonrpsee::core::Error::Transport(inner) => http_status_of(inner),
        _ => None,
    };

    match status_code {
        Some(429) => IndexerError::RpcTransient(err.into()),
        Some(status) if (400..500).contains(&status) => IndexerError::RpcPermanent(err.into()),
        // 5xx, connect failures and timeouts carry no usable status.
        _ => IndexerError::RpcTransient(err.into()),
    }
}

fn http_status_of(inner: &anyhow::Error) -> Option<u16> {
    match inner.downcast_ref::<HttpTransportError>() {
        Some(HttpTransportError::RequestFailure { status_code }) => Some(*status_code),
        _ => None,
    }
}

// MySQL lock wait timeout, deadlock, and gone-away server codes.
const MYSQL_TRANSIENT_CODES: [&str; 4] = ["1205", "1213", "2006", "2013"];

pub fn classify_db(err: sqlx::Error) -> IndexerError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default();
            if MYSQL_TRANSIENT_CODES.contains(&code.as_ref()) {
                IndexerError::DbTransient(err)
            } else {
                IndexerError::DbIntegrity(err)
            }
        }
        sqlx::Error::RowNotFound => IndexerError::DbIntegrity(err),
        _ => IndexerError::DbTransient(err),
    }
}
