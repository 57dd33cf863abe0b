//! `optmirror query` command implementation
//!
//! Prints the matching rows as CSV on stdout.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use crate::config::IngestConfig;
use crate::query::{DatasetCollection, Predicate};
use crate::JobStatus;

pub async fn run(
    config: &IngestConfig,
    value: &str,
    predicates: &[String],
    dir: Option<PathBuf>,
    count: bool,
) -> Result<JobStatus> {
    let predicates = predicates
        .iter()
        .map(|p| p.parse::<Predicate>())
        .collect::<Result<Vec<_>, _>>()?;

    let dir = dir.unwrap_or_else(|| config.interim_root.clone());
    let datasets = DatasetCollection::discover(&dir, &config.dataset_extension)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    if datasets.is_empty() {
        bail!("No .{} datasets found under {}", config.dataset_extension, dir.display());
    }

    let batches = datasets.query(value, &predicates)?;

    if count {
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        println!("{rows}");
        return Ok(JobStatus::Success);
    }

    let stdout = std::io::stdout();
    let mut writer = arrow::csv::WriterBuilder::new()
        .with_header(true)
        .build(stdout.lock());
    for batch in &batches {
        writer.write(batch)?;
    }

    Ok(JobStatus::Success)
}
