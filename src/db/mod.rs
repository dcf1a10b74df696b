//! MySQL store: connection setup, schema, the transaction-id allocator and
//! the batch persistence path.

pub mod history_drop;
pub mod models;
pub mod states;

use std::sync::atomic::{AtomicU64, Ordering};

use log::LevelFilter;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::ConnectOptions;

use crate::config::DbConfig;
use crate::error::{classify_db, IndexerError};
use models::BatchData;
use states::{DbStates, LAST_DATABASE_INDEX};

const MAX_CONNECTIONS: u32 = 10;

const DDL: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS blocks (
        hash VARCHAR(64) NOT NULL,
        number BIGINT UNSIGNED NOT NULL,
        timestamp BIGINT UNSIGNED NOT NULL,
        PRIMARY KEY (hash),
        INDEX idx_blocks_number (number),
        INDEX idx_blocks_timestamp (timestamp)
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        id BIGINT UNSIGNED NOT NULL,
        hash VARCHAR(64) NOT NULL,
        function_sig VARCHAR(50) NOT NULL,
        input LONGTEXT NOT NULL,
        block_number BIGINT UNSIGNED NOT NULL,
        block_hash VARCHAR(64) NOT NULL,
        transaction_index BIGINT UNSIGNED NOT NULL,
        from_address VARCHAR(40) NOT NULL,
        to_address VARCHAR(40) NOT NULL,
        status BIGINT UNSIGNED NOT NULL,
        value LONGTEXT NOT NULL,
        gas_price VARCHAR(78) NOT NULL,
        gas BIGINT UNSIGNED NOT NULL,
        timestamp BIGINT UNSIGNED NOT NULL,
        signature VARCHAR(130) NULL,
        PRIMARY KEY (id),
        UNIQUE KEY uniq_transactions_hash (hash),
        INDEX idx_transactions_function_sig (function_sig),
        INDEX idx_transactions_from_address (from_address),
        INDEX idx_transactions_to_address (to_address),
        INDEX idx_transactions_timestamp (timestamp)
    )",
    "CREATE TABLE IF NOT EXISTS logs (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        transaction_id BIGINT UNSIGNED NOT NULL,
        transaction_hash VARCHAR(64) NOT NULL,
        log_index BIGINT UNSIGNED NOT NULL,
        address VARCHAR(40) NOT NULL,
        data LONGTEXT NOT NULL,
        topic0 VARCHAR(64) NOT NULL,
        topic1 VARCHAR(64) NOT NULL,
        topic2 VARCHAR(64) NOT NULL,
        topic3 VARCHAR(64) NOT NULL,
        block_number BIGINT UNSIGNED NOT NULL,
        timestamp BIGINT UNSIGNED NOT NULL,
        PRIMARY KEY (id),
        UNIQUE KEY uniq_logs_tx_hash_index (transaction_hash, log_index),
        INDEX idx_logs_address (address),
        INDEX idx_logs_topic0 (topic0),
        INDEX idx_logs_topic1 (topic1),
        INDEX idx_logs_topic2 (topic2),
        INDEX idx_logs_topic3 (topic3),
        INDEX idx_logs_timestamp (timestamp)
    )",
    "CREATE TABLE IF NOT EXISTS states (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        name VARCHAR(50) NOT NULL,
        `index` BIGINT UNSIGNED NOT NULL,
        block_timestamp BIGINT UNSIGNED NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (id),
        UNIQUE KEY uniq_states_name (name)
    )",
];

// Deletion-safe order for foreign-key style dependencies.
const DROP_ORDER: [&str; 4] = ["logs", "transactions", "blocks", "states"];

pub struct Store {
    pub pool: MySqlPool,
    next_transaction_id: AtomicU64,
}

impl Store {
    pub async fn connect_and_initialize(cfg: &DbConfig) -> Result<Self, IndexerError> {
        let options = MySqlConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.username)
            .password(&cfg.password)
            .database(&cfg.database);

        let options = if cfg.log_queries {
            options.log_statements(LevelFilter::Info)
        } else {
            options.disable_statement_logging()
        };

        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(classify_db)?;

        if cfg.drop_table_at_start {
            for table in DROP_ORDER {
                sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                    .execute(&pool)
                    .await
                    .map_err(classify_db)?;
            }
        }

        for ddl in DDL {
            sqlx::query(ddl).execute(&pool).await.map_err(classify_db)?;
        }

        let max_id: Option<u64> = sqlx::query_scalar("SELECT MAX(id) FROM transactions")
            .fetch_one(&pool)
            .await
            .map_err(classify_db)?;

        Ok(Self {
            pool,
            next_transaction_id: AtomicU64::new(max_id.map_or(1, |id| id + 1)),
        })
    }

    /// Allocates the next internal transaction id. Strictly increasing for
    /// the process lifetime; replays after a restart are discarded by the
    /// unique hash key.
    pub fn next_transaction_id(&self) -> u64 {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn max_block_number(&self) -> Result<Option<u64>, IndexerError> {
        sqlx::query_scalar("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(classify_db)
    }

    /// Commits one prepared batch atomically and advances the
    /// `last_database_block` marker with it. Insertion order is blocks,
    /// transactions, logs, then the marker.
    pub async fn save_batch(
        &self,
        states: &DbStates,
        data: &BatchData,
        last_db_index: u64,
        last_db_timestamp: u64,
    ) -> Result<(), IndexerError> {
        let mut dbtx = self.pool.begin().await.map_err(classify_db)?;

        models::insert_blocks(&mut dbtx, &data.blocks).await?;
        models::insert_transactions(&mut dbtx, &data.transactions).await?;
        models::insert_logs(&mut dbtx, &data.logs).await?;

        states
            .update_in_tx(&mut dbtx, LAST_DATABASE_INDEX, last_db_index, last_db_timestamp)
            .await?;

        dbtx.commit().await.map_err(classify_db)
    }
}
