//! `optmirror run` command implementation
//!
//! Index, fetch and convert in one go. A fetch failure does not stop the conversion of the
//! archives that did arrive.

use anyhow::Result;
use std::path::Path;
use tracing::warn;

use crate::config::IngestConfig;
use crate::{ConvertArgs, JobStatus};

pub async fn run(config: &IngestConfig, prefix: Option<&Path>, args: &ConvertArgs) -> Result<JobStatus> {
    let config = super::convert::with_overrides(config, args);

    let catalog = super::index::crawl(&config, prefix).await?;
    let fetched = super::fetch::fetch_catalog(&config, &catalog).await?;
    super::fetch::print_summary(&fetched);
    if !fetched.is_success() {
        warn!(failed = fetched.failures.len(), "Some files could not be fetched");
    }

    let converted = super::convert::convert_dir(&config, args).await?;
    super::convert::print_summary(&converted);

    let fetch_status = if fetched.is_success() {
        JobStatus::Success
    } else {
        JobStatus::PartialFailure
    };
    let convert_status = if converted.is_success() {
        JobStatus::Success
    } else {
        JobStatus::PartialFailure
    };
    Ok(fetch_status.combine(convert_status))
}
