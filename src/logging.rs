//! Logger setup from the `[logger]` config section: console and/or file
//! sinks behind the `log` facade.

use std::fs::OpenOptions;
use std::str::FromStr;

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use crate::config::LoggerConfig;
use crate::error::IndexerError;

pub fn init(cfg: &LoggerConfig) -> Result<(), IndexerError> {
    let level = parse_level(&cfg.level);
    let log_config = ConfigBuilder::new().build();

    let mut sinks: Vec<Box<dyn SharedLogger>> = Vec::new();

    if cfg.console {
        sinks.push(TermLogger::new(
            level,
            log_config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }

    if !cfg.file.is_empty() {
        rotate_if_oversized(&cfg.file, cfg.max_file_size);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.file)
            .map_err(|err| {
                IndexerError::Config(format!("cannot open log file {}: {err}", cfg.file))
            })?;
        sinks.push(WriteLogger::new(level, log_config, file));
    }

    if sinks.is_empty() {
        // Nothing configured still gets a console logger so fatal errors
        // are visible.
        sinks.push(TermLogger::new(
            level,
            ConfigBuilder::new().build(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }

    CombinedLogger::init(sinks)
        .map_err(|err| IndexerError::Config(format!("logger init failed: {err}")))
}

fn parse_level(level: &str) -> LevelFilter {
    if level.is_empty() {
        return LevelFilter::Info;
    }

    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

// Move an oversized log file aside before appending to it.
fn rotate_if_oversized(path: &str, max_megabytes: u64) {
    if max_megabytes == 0 {
        return;
    }

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > max_megabytes * 1024 * 1024 {
            let _ = std::fs::rename(path, format!("{path}.old"));
        }
    }
}
