//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use retire_core::{ArchiveLayout, ArchiveRecord, Config};
use retire_index::ArchiveIndex;
use std::path::Path;
use std::sync::Arc;

/// Load and validate the configuration named by `--config`
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.context("No configuration given (use --config <file>)")?;
    let config = Config::load(path)?;
    Ok(config)
}

/// Open the index backend the configuration selects
pub fn open_index(config: &Config) -> Result<Arc<dyn ArchiveIndex>> {
    let path = config.index_path();
    let index = retire_index::open_index(config.database_backend, &path)
        .with_context(|| format!("Failed to open archive index at {}", path.display()))?;
    Ok(Arc::from(index))
}

pub fn layout(config: &Config) -> ArchiveLayout {
    ArchiveLayout::new(&config.archive_root_path, config.pipeline.scratch_dir.clone())
}

/// Parse a `YYYY-MM-DD` date as midnight UTC
pub fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date {:?} (expected YYYY-MM-DD)", value))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("Invalid date {:?}", value))?;
    Ok(midnight.and_utc())
}

/// Format timestamp as relative time ("2 hours ago")
pub fn format_relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - at).num_seconds();
    if seconds < 0 {
        return "in the future".to_string();
    }

    if seconds < 60 {
        format!("{} seconds ago", seconds)
    } else if seconds < 3600 {
        format!("{} minutes ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{} hours ago", seconds / 3600)
    } else if seconds < 604800 {
        format!("{} days ago", seconds / 86400)
    } else {
        format!("{} weeks ago", seconds / 604800)
    }
}

/// Format timestamp as absolute time ("2024-01-03 14:30:00")
pub fn format_absolute_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Container path of a record, or a placeholder for PENDING rows
pub fn display_container(record: &ArchiveRecord) -> String {
    record
        .container_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}
