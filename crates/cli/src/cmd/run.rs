//! Archive every eligible series

use crate::locks::RunLock;
use crate::{logging, util};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use retire_pipeline::{PipelineOptions, RetentionPipeline, RunSummary};
use retire_source::{OrthancClient, SourceClient};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    // 1. Configuration errors are fatal before any network or disk activity
    let config = util::load_config(config_path)?;
    let _log_guard = logging::init(&config.logging)?;

    // 2. One run per archive root
    let lock = RunLock::acquire(&config.archive_root_path).context("Failed to acquire run lock")?;

    // 3. Collaborators
    let index = util::open_index(&config)?;
    let source: Arc<dyn SourceClient> =
        Arc::new(OrthancClient::from_config(&config).context("Failed to create source client")?);
    let pipeline = RetentionPipeline::new(
        PipelineOptions::from_config(&config),
        source,
        index,
        util::layout(&config),
    );

    // 4. Ctrl-C finishes the current step and stops
    let cancel = pipeline.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    println!(
        "{} {} (retention {} days)",
        "Archiving from".bold(),
        config.server_url().cyan(),
        config.retention_window_days
    );

    let summary = pipeline.run().await.context("Retention run aborted")?;
    print_summary(&summary);

    lock.release()?;
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run Summary".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Archived:            {}", summary.archived.to_string().green());
    println!("Within retention:    {}", summary.skipped_ineligible);
    println!("Already archived:    {}", summary.skipped_duplicate);

    if summary.failed > 0 {
        println!("Failed:              {}", summary.failed.to_string().red());
    } else {
        println!("Failed:              0");
    }
    if summary.delete_failed > 0 {
        println!(
            "Delete failed:       {} {}",
            summary.delete_failed.to_string().yellow(),
            "(archived, still on source)".dimmed()
        );
    }
    if summary.recovered_pending > 0 {
        println!(
            "Recovered:           {} {}",
            summary.recovered_pending.to_string().yellow(),
            "(pending records from an interrupted run)".dimmed()
        );
    }
    if summary.cancelled {
        println!("{}", "Run was cancelled before scanning finished".yellow());
    }
}
