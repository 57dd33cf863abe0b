//! `optmirror index` command implementation

use anyhow::{Context, Result};
use optmirror_common::units::format_size;
use std::path::Path;
use tracing::info;
use url::Url;

use crate::config::IngestConfig;
use crate::index::{Catalog, Indexer};
use crate::JobStatus;

/// Crawl the tree and print a summary, optionally writing the catalog
pub async fn run(config: &IngestConfig, out: Option<&Path>, prefix: Option<&Path>) -> Result<JobStatus> {
    let catalog = crawl(config, prefix).await?;

    println!("Files:         {}", catalog.len());
    println!("Declared size: {}", format_size(catalog.total_declared_bytes()));

    if let Some(out) = out {
        catalog
            .write_csv(out)
            .with_context(|| format!("Failed to write catalog to {}", out.display()))?;
        println!("Catalog:       {}", out.display());
    }

    Ok(JobStatus::Success)
}

/// Crawl the configured root, then filter and shuffle the result
pub(crate) async fn crawl(config: &IngestConfig, prefix: Option<&Path>) -> Result<Catalog> {
    let root = Url::parse(&config.root_url)
        .with_context(|| format!("Invalid root URL '{}'", config.root_url))?;
    let client = config.http_client().context("Failed to build HTTP client")?;

    info!(root = %root, "Indexing remote tree");
    let indexer = Indexer::new(client, root, config.request_timeout());
    let catalog = indexer.crawl().await.context("Indexing failed")?;

    Ok(prepare(catalog, config, prefix))
}

/// Apply the prefix filter and the configured ordering
pub(crate) fn prepare(mut catalog: Catalog, config: &IngestConfig, prefix: Option<&Path>) -> Catalog {
    if let Some(prefix) = prefix {
        catalog.retain_prefix(prefix);
    }
    if config.shuffle {
        catalog.shuffle();
    }
    info!(
        files = catalog.len(),
        declared = %format_size(catalog.total_declared_bytes()),
        "Catalog ready"
    );
    catalog
}
