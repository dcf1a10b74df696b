pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod retry;
