//! Show PENDING records

use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = util::load_config(config_path)?;
    let index = util::open_index(&config)?;
    let pending = index.find_pending()?;

    if pending.is_empty() {
        println!("{}", "No pending records".green());
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!("{}", "Pending Records".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for record in &pending {
        println!(
            "{} begun {} ({})",
            record.series_id.yellow(),
            util::format_relative_time(record.begun_at, now),
            util::format_absolute_time(record.begun_at).dimmed()
        );
    }
    println!();
    println!(
        "{}",
        "These are aborted and retried at the start of the next run".dimmed()
    );

    Ok(())
}
