//! Re-check committed containers on disk

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use retire_core::hash::hash_file;
use retire_core::{ArchiveRecord, ContainerReader, RecordFilter};
use std::path::Path;

pub fn run(config_path: Option<&Path>, series_id: Option<&str>) -> Result<()> {
    let config = util::load_config(config_path)?;
    let index = util::open_index(&config)?;

    let records: Vec<ArchiveRecord> = match series_id {
        Some(id) => {
            let record = index
                .get(id)?
                .with_context(|| format!("Series {} is not in the index", id))?;
            if !record.is_committed() {
                anyhow::bail!("Series {} is pending, not committed", id);
            }
            vec![record]
        }
        None => index
            .list_committed(RecordFilter::default())
            .collect::<Result<_, _>>()?,
    };

    let mut failures = 0usize;
    for record in &records {
        match check(record) {
            Ok(()) => println!("{} {}", "ok  ".green(), record.series_id),
            Err(e) => {
                failures += 1;
                println!("{} {}: {:#}", "FAIL".red(), record.series_id, e);
            }
        }
    }

    println!();
    println!("{} verified, {} failed", records.len() - failures, failures);
    if failures > 0 {
        anyhow::bail!("{} container(s) failed verification", failures);
    }
    Ok(())
}

/// Size, checksum and entry count must all match the committed record
pub fn check(record: &ArchiveRecord) -> Result<()> {
    let path = record
        .container_path
        .as_deref()
        .context("record has no container path")?;

    let digest = hash_file(path).with_context(|| format!("cannot read {}", path.display()))?;
    if digest.len != record.container_bytes {
        anyhow::bail!(
            "size is {} bytes, recorded {}",
            digest.len,
            record.container_bytes
        );
    }
    if record.container_blake3.as_deref() != Some(digest.blake3.as_str()) {
        anyhow::bail!("BLAKE3 checksum does not match");
    }

    let entries = ContainerReader::open(path)?.instance_ids()?.len();
    if entries != record.instance_count as usize {
        anyhow::bail!(
            "holds {} instances, recorded {}",
            entries,
            record.instance_count
        );
    }

    Ok(())
}
