//! The three progress markers in the `states` table. They capture which
//! blocks are guaranteed to be indexed and are consulted by both the
//! indexer and the history-drop engine.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::info;
use sqlx::{MySql, MySqlPool};

use crate::error::{classify_db, IndexerError};

pub const FIRST_DATABASE_INDEX: &str = "first_database_block";
pub const LAST_DATABASE_INDEX: &str = "last_database_block";
pub const LAST_CHAIN_INDEX: &str = "last_chain_block";

const STATE_NAMES: [&str; 3] = [
    FIRST_DATABASE_INDEX,
    LAST_DATABASE_INDEX,
    LAST_CHAIN_INDEX,
];

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct State {
    pub name: String,
    pub index: u64,
    pub block_timestamp: u64,
    pub updated_at: DateTime<Utc>,
}

/// Process-scoped handle over the marker rows. The in-memory copy is the
/// read path; every mutation also writes the row back. The lock is never
/// held across an await point.
pub struct DbStates {
    states: RwLock<HashMap<String, State>>,
}

impl DbStates {
    /// Reads all three markers, creating missing ones with value 0. A
    /// missing row is expected on first startup, not an error.
    pub async fn load(pool: &MySqlPool) -> Result<Self, IndexerError> {
        let mut states = HashMap::new();

        for name in STATE_NAMES {
            let row: Option<State> = sqlx::query_as(
                "SELECT name, `index`, block_timestamp, updated_at FROM states WHERE name = ?",
            )
            .bind(name)
            .fetch_optional(pool)
            .await
            .map_err(classify_db)?;

            let state = match row {
                Some(state) => state,
                None => {
                    let state = State {
                        name: name.to_owned(),
                        index: 0,
                        block_timestamp: 0,
                        updated_at: Utc::now(),
                    };
                    sqlx::query(
                        "INSERT INTO states (name, `index`, block_timestamp, updated_at) \
                         VALUES (?, ?, ?, ?)",
                    )
                    .bind(&state.name)
                    .bind(state.index)
                    .bind(state.block_timestamp)
                    .bind(state.updated_at)
                    .execute(pool)
                    .await
                    .map_err(classify_db)?;
                    state
                }
            };

            states.insert(name.to_owned(), state);
        }

        Ok(Self {
            states: RwLock::new(states),
        })
    }

    pub fn index_of(&self, name: &str) -> Option<u64> {
        self.states
            .read()
            .expect("states lock poisoned")
            .get(name)
            .map(|state| state.index)
    }

    pub fn snapshot(&self, name: &str) -> Option<State> {
        self.states
            .read()
            .expect("states lock poisoned")
            .get(name)
            .cloned()
    }

    // Advances the in-memory marker and returns the row to persist.
    fn bump(&self, name: &str, index: u64, block_timestamp: u64) -> Result<State, IndexerError> {
        let mut states = self.states.write().expect("states lock poisoned");
        let state = states
            .get_mut(name)
            .ok_or_else(|| IndexerError::Config(format!("state {name} not found")))?;

        state.index = index;
        state.block_timestamp = block_timestamp;
        state.updated_at = Utc::now();

        Ok(state.clone())
    }

    pub async fn update(
        &self,
        pool: &MySqlPool,
        name: &str,
        index: u64,
        block_timestamp: u64,
    ) -> Result<(), IndexerError> {
        let state = self.bump(name, index, block_timestamp)?;

        sqlx::query(
            "UPDATE states SET `index` = ?, block_timestamp = ?, updated_at = ? WHERE name = ?",
        )
        .bind(state.index)
        .bind(state.block_timestamp)
        .bind(state.updated_at)
        .bind(&state.name)
        .execute(pool)
        .await
        .map_err(classify_db)?;

        Ok(())
    }

    /// Same as [`DbStates::update`] but inside the batch transaction, so
    /// the marker only moves if the batch commits.
    pub async fn update_in_tx(
        &self,
        dbtx: &mut sqlx::Transaction<'_, MySql>,
        name: &str,
        index: u64,
        block_timestamp: u64,
    ) -> Result<(), IndexerError> {
        let state = self.bump(name, index, block_timestamp)?;

        sqlx::query(
            "UPDATE states SET `index` = ?, block_timestamp = ?, updated_at = ? WHERE name = ?",
        )
        .bind(state.index)
        .bind(state.block_timestamp)
        .bind(state.updated_at)
        .bind(&state.name)
        .execute(&mut **dbtx)
        .await
        .map_err(classify_db)?;

        Ok(())
    }

    /// Reconciles the markers with the configured range before a history
    /// run and returns the effective `(start, end)` of the loop.
    pub async fn update_at_start(
        &self,
        pool: &MySqlPool,
        start_index: u64,
        start_block_timestamp: u64,
        last_chain_index: u64,
        last_chain_timestamp: u64,
        stop_index: u64,
    ) -> Result<(u64, u64), IndexerError> {
        let (first_index, last_index) = {
            let states = self.states.read().expect("states lock poisoned");
            (
                states[FIRST_DATABASE_INDEX].index,
                states[LAST_DATABASE_INDEX].index,
            )
        };

        let start_index = match resolve_start(first_index, last_index, start_index) {
            StartAction::ResumeAfter(last) => {
                info!("Data from blocks {start_index} to {last} already in the database");
                last + 1
            }
            StartAction::Rewrite => {
                // The configured start lies before the indexed range or
                // would leave a gap, so the first-block guarantee moves.
                self.update(pool, FIRST_DATABASE_INDEX, start_index, start_block_timestamp)
                    .await?;
                start_index
            }
        };

        self.update(pool, LAST_CHAIN_INDEX, last_chain_index, last_chain_timestamp)
            .await?;

        Ok((start_index, stop_index.min(last_chain_index)))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StartAction {
    ResumeAfter(u64),
    Rewrite,
}

pub(crate) fn resolve_start(first_db: u64, last_db: u64, configured_start: u64) -> StartAction {
    if configured_start >= first_db && configured_start <= last_db {
        StartAction::ResumeAfter(last_db)
    } else {
        StartAction::Rewrite
    }
}
