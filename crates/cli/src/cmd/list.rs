//! List committed archive records

use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;
use retire_core::RecordFilter;
use std::path::Path;

pub fn run(
    config_path: Option<&Path>,
    patient: Option<String>,
    study: Option<String>,
    since: Option<&str>,
    until: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let config = util::load_config(config_path)?;
    let index = util::open_index(&config)?;

    let filter = RecordFilter {
        patient_id: patient,
        study_id: study,
        archived_after: since.map(util::parse_date).transpose()?,
        archived_before: until.map(util::parse_date).transpose()?,
    };

    let mut shown = 0usize;
    let mut total_bytes = 0u64;
    for record in index.list_committed(filter).take(limit.unwrap_or(usize::MAX)) {
        let record = record?;
        if shown == 0 {
            println!("{}", "Archived Series".bold());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        }

        let archived_at = record
            .archived_at
            .map(util::format_absolute_time)
            .unwrap_or_default();
        println!(
            "{} {} patient={} study={} instances={} {}",
            record.series_id.yellow(),
            archived_at.dimmed(),
            record.patient_id,
            record.study_id,
            record.instance_count,
            util::format_size(record.container_bytes)
        );
        println!("  {}", util::display_container(&record).dimmed());

        shown += 1;
        total_bytes += record.container_bytes;
    }

    if shown == 0 {
        println!("{}", "No archived series match".dimmed());
    } else {
        println!();
        println!("{} series, {}", shown, util::format_size(total_bytes));
    }

    Ok(())
}
