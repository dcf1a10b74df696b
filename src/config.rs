//! Configuration: a TOML file selected with `--config`, with a handful of
//! environment overrides applied on top.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ethers::types::U256;
use serde::Deserialize;
use url::Url;

use crate::chain::ChainKind;
use crate::error::IndexerError;
use crate::retry::Backoff;

const DAY_SECONDS: u64 = 24 * 60 * 60;
const MAINNET_MIN_HISTORY_DROP_SECONDS: u64 = 10 * DAY_SECONDS;
const TESTNET_MIN_HISTORY_DROP_SECONDS: u64 = 2 * DAY_SECONDS;

pub const CHAIN_ID_FLARE: u64 = 14;
pub const CHAIN_ID_SONGBIRD: u64 = 19;
pub const CHAIN_ID_COSTON: u64 = 16;
pub const CHAIN_ID_COSTON2: u64 = 114;

#[derive(Parser, Debug)]
#[command(
    name = "flare-indexer",
    about = "Indexes blocks, transactions and event logs of Flare-family chains into MySQL."
)]
pub struct CliArgs {
    #[arg(
        long,
        default_value = "config.toml",
        help = "Configuration file (toml format)."
    )]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub logger: LoggerConfig,
    pub chain: ChainConfig,
    pub indexer: IndexerConfig,
    pub timeout: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub log_queries: bool,
    // `None` selects the chain default, `Some(0)` disables history drop.
    pub history_drop: Option<u64>,
    pub drop_table_at_start: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 3306,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            log_queries: false,
            history_drop: None,
            drop_table_at_start: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub file: String,
    /// In megabytes.
    pub max_file_size: u64,
    pub console: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub node_url: String,
    pub api_key: String,
    pub chain_type: ChainKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub batch_size: u64,
    pub start_index: u64,
    pub stop_index: u64,
    pub num_parallel_req: u64,
    pub log_range: u64,
    pub new_block_check_millis: u64,
    pub confirmations: u64,
    pub collect_transactions: Vec<TransactionInfo>,
    pub collect_logs: Vec<LogInfo>,
    /// Warn when continuous mode has seen no new block for this many
    /// seconds; zero disables the warning.
    pub no_new_blocks_delay_warning: f64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 0,
            start_index: 0,
            stop_index: 0,
            num_parallel_req: 0,
            log_range: 0,
            new_block_check_millis: 1000,
            confirmations: 1,
            collect_transactions: Vec::new(),
            collect_logs: Vec::new(),
            no_new_blocks_delay_warning: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionInfo {
    pub contract_address: String,
    pub func_sig: String,
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub collect_events: bool,
    #[serde(default)]
    pub signature: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogInfo {
    pub contract_address: String,
    pub topic: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub backoff_max_elapsed_time_seconds: Option<u64>,
    pub timeout_millis: u64,
}

impl TimeoutConfig {
    /// Per-RPC-call timeout, default one second.
    pub fn request_timeout(&self) -> Duration {
        match self.timeout_millis {
            0 => Duration::from_secs(1),
            millis => Duration::from_millis(millis),
        }
    }

    /// Backoff bounded by `backoff_max_elapsed_time_seconds`; zero means
    /// retry indefinitely.
    pub fn backoff(&self) -> Backoff {
        let max_elapsed_time = match self.backoff_max_elapsed_time_seconds {
            Some(0) => None,
            Some(seconds) => Some(Duration::from_secs(seconds)),
            None => Backoff::default().max_elapsed_time,
        };

        Backoff {
            max_elapsed_time,
            ..Backoff::default()
        }
    }
}

impl ChainConfig {
    /// Node URL with the API key attached as the `x-apikey` query
    /// parameter when one is configured.
    pub fn full_node_url(&self) -> Result<Url, IndexerError> {
        let mut url = Url::parse(&self.node_url)
            .map_err(|err| IndexerError::Config(format!("error parsing node url: {err}")))?;

        if !self.api_key.is_empty() {
            url.query_pairs_mut().append_pair("x-apikey", &self.api_key);
        }

        Ok(url)
    }
}

fn min_history_drop_seconds(chain_id: U256) -> u64 {
    if chain_id > U256::from(u64::MAX) {
        return MAINNET_MIN_HISTORY_DROP_SECONDS;
    }

    match chain_id.as_u64() {
        CHAIN_ID_FLARE | CHAIN_ID_SONGBIRD => MAINNET_MIN_HISTORY_DROP_SECONDS,
        CHAIN_ID_COSTON | CHAIN_ID_COSTON2 => TESTNET_MIN_HISTORY_DROP_SECONDS,
        // Unrecognized chains get the conservative mainnet minimum.
        _ => MAINNET_MIN_HISTORY_DROP_SECONDS,
    }
}

impl DbConfig {
    /// Effective retention window in seconds: the chain minimum when unset,
    /// zero to disable, and a configured value below the chain minimum is a
    /// fatal configuration error.
    pub fn history_drop_seconds(&self, chain_id: U256) -> Result<u64, IndexerError> {
        let min_seconds = min_history_drop_seconds(chain_id);

        match self.history_drop {
            None => Ok(min_seconds),
            Some(0) => Ok(0),
            Some(seconds) if seconds < min_seconds => Err(IndexerError::Config(format!(
                "history drop must be at least {min_seconds} seconds, got {seconds} seconds"
            ))),
            Some(seconds) => Ok(seconds),
        }
    }
}

pub fn load(path: &std::path::Path) -> Result<Config, IndexerError> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| IndexerError::Config(format!("error opening config file: {err}")))?;

    let mut cfg: Config = toml::from_str(&content)
        .map_err(|err| IndexerError::Config(format!("error parsing config file: {err}")))?;

    apply_env_overrides(&mut cfg);

    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) {
    let overrides: [(&str, &mut String); 4] = [
        ("DB_USERNAME", &mut cfg.db.username),
        ("DB_PASSWORD", &mut cfg.db.password),
        ("NODE_URL", &mut cfg.chain.node_url),
        ("NODE_API_KEY", &mut cfg.chain.api_key),
    ];

    for (name, target) in overrides {
        if let Ok(value) = std::env::var(name) {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [db]
        host = "db.internal"
        port = 3307
        database = "flare_indexer"
        username = "indexer"
        password = "hunter2"
        history_drop = 1209600

        [chain]
        node_url = "https://coston2-api.flare.network/ext/C/rpc"
        chain_type = "eth"

        [indexer]
        batch_size = 500
        start_index = 1112
        stop_index = 2400
        num_parallel_req = 4
        log_range = 10
        new_block_check_millis = 200
        confirmations = 2

        [[indexer.collect_transactions]]
        contract_address = "0x694905ca5f9f6c49f4748e8193b3e8053fa9e7e4"
        func_sig = "0xf14fcbc8"
        status = true
        collect_events = true

        [[indexer.collect_logs]]
        contract_address = "undefined"
        topic = "0x91d0280e969157fc6c5b8f952f237b03d934b18534dafcac839075bbc33522f8"

        [logger]
        level = "INFO"
        console = true

        [timeout]
        timeout_millis = 2000
    "#;

    #[test]
    fn parses_full_config() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(cfg.db.port, 3307);
        assert_eq!(cfg.db.history_drop, Some(1_209_600));
        assert_eq!(cfg.chain.chain_type, ChainKind::Eth);
        assert_eq!(cfg.indexer.batch_size, 500);
        assert_eq!(cfg.indexer.confirmations, 2);
        assert_eq!(cfg.indexer.collect_transactions.len(), 1);
        assert!(cfg.indexer.collect_transactions[0].collect_events);
        assert!(!cfg.indexer.collect_transactions[0].signature);
        assert_eq!(cfg.indexer.collect_logs[0].contract_address, "undefined");
        assert_eq!(cfg.timeout.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let cfg: Config = toml::from_str("").unwrap();

        assert_eq!(cfg.db.host, "localhost");
        assert_eq!(cfg.chain.chain_type, ChainKind::Coreth);
        assert_eq!(cfg.indexer.confirmations, 1);
        assert_eq!(cfg.timeout.request_timeout(), Duration::from_secs(1));
        assert_eq!(
            cfg.timeout.backoff().max_elapsed_time,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn zero_backoff_bound_means_unbounded() {
        let timeout = TimeoutConfig {
            backoff_max_elapsed_time_seconds: Some(0),
            timeout_millis: 0,
        };
        assert_eq!(timeout.backoff().max_elapsed_time, None);
    }

    #[test]
    fn api_key_lands_in_query_string() {
        let chain = ChainConfig {
            node_url: "https://flare-api.flare.network/ext/C/rpc".to_owned(),
            api_key: "secret".to_owned(),
            chain_type: ChainKind::Coreth,
        };
        let url = chain.full_node_url().unwrap();

        assert_eq!(url.query(), Some("x-apikey=secret"));
    }

    #[test]
    fn invalid_node_url_is_a_config_error() {
        let chain = ChainConfig {
            node_url: "not a url".to_owned(),
            ..ChainConfig::default()
        };
        assert!(matches!(
            chain.full_node_url(),
            Err(IndexerError::Config(_))
        ));
    }

    #[test]
    fn history_drop_floor_per_chain() {
        let db = DbConfig::default();

        assert_eq!(
            db.history_drop_seconds(U256::from(CHAIN_ID_FLARE)).unwrap(),
            MAINNET_MIN_HISTORY_DROP_SECONDS
        );
        assert_eq!(
            db.history_drop_seconds(U256::from(CHAIN_ID_COSTON2))
                .unwrap(),
            TESTNET_MIN_HISTORY_DROP_SECONDS
        );
        // Unknown chains fall back to the mainnet minimum.
        assert_eq!(
            db.history_drop_seconds(U256::from(31337u64)).unwrap(),
            MAINNET_MIN_HISTORY_DROP_SECONDS
        );
    }

    #[test]
    fn history_drop_below_minimum_is_rejected() {
        let db = DbConfig {
            history_drop: Some(86_400),
            ..DbConfig::default()
        };
        let err = db
            .history_drop_seconds(U256::from(CHAIN_ID_FLARE))
            .unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn history_drop_zero_disables() {
        let db = DbConfig {
            history_drop: Some(0),
            ..DbConfig::default()
        };
        assert_eq!(
            db.history_drop_seconds(U256::from(CHAIN_ID_FLARE)).unwrap(),
            0
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        std::env::set_var("DB_USERNAME", "env-user");
        std::env::set_var("NODE_API_KEY", "env-key");

        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        apply_env_overrides(&mut cfg);

        assert_eq!(cfg.db.username, "env-user");
        assert_eq!(cfg.chain.api_key, "env-key");

        std::env::remove_var("DB_USERNAME");
        std::env::remove_var("NODE_API_KEY");
    }
}
