//! Configuration helpers
//!
//! Prints an example file or the effective values of an existing one.

use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

/// Print the annotated example configuration
pub fn run_example() -> Result<()> {
    print!("{}", retire_core::config::example_config());
    Ok(())
}

/// Validate a configuration and print what it resolves to
pub fn run_show(config_path: Option<&Path>) -> Result<()> {
    let config = util::load_config(config_path)?;

    println!("{}", "Effective Configuration".bold());
    println!();
    println!("  {} = {}", "server_url".cyan(), config.server_url());
    println!(
        "  {} = {} {}",
        "retention_window_days".cyan(),
        config.retention_window_days,
        format!("({} days)", config.retention_policy().retention_window.num_days()).dimmed()
    );
    println!(
        "  {} = {}",
        "archive_root_path".cyan(),
        config.archive_root_path.display()
    );
    println!(
        "  {} = {:?}",
        "database_backend".cyan(),
        config.database_backend
    );
    println!("  {} = {}", "index_path".cyan(), config.index_path().display());

    println!("\n{}", "[source]".yellow());
    println!(
        "  {} = {}",
        "username".cyan(),
        config.source.username.as_deref().unwrap_or("(none)")
    );
    println!(
        "  {} = {}",
        "request_timeout_secs".cyan(),
        config.source.request_timeout_secs
    );

    println!("\n{}", "[pipeline]".yellow());
    println!("  {} = {}", "build_attempts".cyan(), config.pipeline.build_attempts);
    println!("  {} = {}", "fetch_workers".cyan(), config.pipeline.fetch_workers);
    println!("  {} = {}", "retry_backoff_ms".cyan(), config.pipeline.retry_backoff_ms);
    println!(
        "  {} = {}",
        "scratch_dir".cyan(),
        util::layout(&config).scratch_dir().display()
    );

    println!("\n{}", "[logging]".yellow());
    println!("  {} = {}", "level".cyan(), config.logging.level);
    println!(
        "  {} = {}",
        "directory".cyan(),
        config
            .logging
            .directory
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(stderr only)".to_string())
    );

    Ok(())
}
