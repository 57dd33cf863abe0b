//! `optmirror fetch` command implementation

use anyhow::{Context, Result};
use optmirror_common::units::format_size;
use std::path::Path;

use crate::config::IngestConfig;
use crate::fetch::{FetchSummary, Fetcher};
use crate::index::Catalog;
use crate::JobStatus;

pub async fn run(config: &IngestConfig, catalog: Option<&Path>, prefix: Option<&Path>) -> Result<JobStatus> {
    let catalog = match catalog {
        Some(path) => {
            let catalog = Catalog::read_csv(path)
                .with_context(|| format!("Failed to read catalog {}", path.display()))?;
            super::index::prepare(catalog, config, prefix)
        },
        None => super::index::crawl(config, prefix).await?,
    };

    let summary = fetch_catalog(config, &catalog).await?;
    print_summary(&summary);

    Ok(if summary.is_success() {
        JobStatus::Success
    } else {
        JobStatus::PartialFailure
    })
}

pub(crate) async fn fetch_catalog(config: &IngestConfig, catalog: &Catalog) -> Result<FetchSummary> {
    let client = config.http_client().context("Failed to build HTTP client")?;
    let fetcher = Fetcher::new(client, config.fetch_policy());
    Ok(fetcher
        .fetch_all(catalog, &config.raw_root, config.fetch_concurrency)
        .await)
}

pub(crate) fn print_summary(summary: &FetchSummary) {
    println!("Downloaded:      {} ({})", summary.downloaded, format_size(summary.bytes));
    println!("Already present: {}", summary.verified);
    if summary.replaced_corrupt > 0 {
        println!("Replaced corrupt: {}", summary.replaced_corrupt);
    }
    if summary.corrupt_removed > 0 {
        println!("Corrupt removed: {}", summary.corrupt_removed);
    }

    if !summary.failures.is_empty() {
        println!("Failed:          {}", summary.failures.len());
        for failure in &summary.failures {
            println!("  {} : {}", failure.entry.url, failure.error);
        }
    }
}
