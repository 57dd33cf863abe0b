//! Remote tree indexer
//!
//! Crawls a directory-listing hierarchy starting at a root URL and produces a flat
//! [`Catalog`] of every file reachable beneath it. Listing pages are fetched one at a time;
//! any page that cannot be fetched or parsed aborts the crawl, because a partial catalog
//! would silently understate the job.

pub mod listing;

use optmirror_common::CommonError;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub use listing::{as_folder, parse_listing, ListingRow};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Listing request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Listing {url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("Could not parse listing {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("Invalid size for {url}: {source}")]
    Size {
        url: String,
        #[source]
        source: CommonError,
    },

    #[error("{url} is not beneath the root {root}")]
    OutsideRoot { url: String, root: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Catalog file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A remote file to fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub url: Url,
    /// Path beneath the root, used for local placement
    pub relative_path: PathBuf,
    /// Size parsed from the listing; rounded, so only ever compared with a tolerance
    pub declared_size: u64,
}

impl CatalogEntry {
    /// Build an entry for `url`, deriving its relative path from the part after `root`
    pub fn from_url(root: &Url, url: Url, declared_size: u64) -> Result<Self, IndexError> {
        let root = as_folder(root);
        let outside = || IndexError::OutsideRoot {
            url: url.to_string(),
            root: root.to_string(),
        };

        let encoded = url.as_str().strip_prefix(root.as_str()).ok_or_else(outside)?;
        let decoded = urlencoding::decode(encoded).map_err(|_| outside())?;
        let relative_path = PathBuf::from(decoded.as_ref());

        let only_normal = relative_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if relative_path.as_os_str().is_empty() || !only_normal {
            return Err(outside());
        }

        Ok(Self {
            url,
            relative_path,
            declared_size,
        })
    }

    /// `raw_root/<relative_path>`
    pub fn dest_path(&self, raw_root: &Path) -> PathBuf {
        raw_root.join(&self.relative_path)
    }
}

/// Flat list of remote files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CatalogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_declared_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.declared_size).sum()
    }

    /// Randomise the order so that independent runs started at different times spread
    /// their progress across the tree instead of colliding on the same prefix.
    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut rand::thread_rng());
    }

    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.entries.shuffle(rng);
    }

    /// Keep only entries whose relative path starts with `prefix`
    pub fn retain_prefix(&mut self, prefix: &Path) {
        self.entries.retain(|e| e.relative_path.starts_with(prefix));
    }

    /// Write the catalog as CSV for inspection or a later `fetch --catalog`
    pub fn write_csv(&self, path: &Path) -> Result<(), IndexError> {
        let mut writer = csv::Writer::from_path(path)?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self, IndexError> {
        let mut reader = csv::Reader::from_path(path)?;
        let entries = reader
            .deserialize()
            .collect::<Result<Vec<CatalogEntry>, csv::Error>>()?;
        Ok(Self { entries })
    }
}

impl IntoIterator for Catalog {
    type Item = CatalogEntry;
    type IntoIter = std::vec::IntoIter<CatalogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Crawls a directory-listing tree
pub struct Indexer {
    client: Client,
    root: Url,
    timeout: Duration,
}

impl Indexer {
    pub fn new(client: Client, root: Url, timeout: Duration) -> Self {
        Self {
            client,
            root: as_folder(&root),
            timeout,
        }
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    /// Walk every folder beneath the root and collect the files, in crawl order
    pub async fn crawl(&self) -> Result<Catalog, IndexError> {
        let mut folders = vec![self.root.clone()];
        let mut visited = HashSet::new();
        let mut entries = Vec::new();

        while let Some(folder) = folders.pop() {
            if !visited.insert(folder.clone()) {
                continue;
            }

            let (page_url, html) = self.fetch_listing(&folder).await?;
            let rows = parse_listing(&html, &page_url).map_err(|e| match e {
                IndexError::Parse { reason, .. } => IndexError::Parse {
                    url: page_url.to_string(),
                    reason,
                },
                other => other,
            })?;

            let mut files = 0usize;
            for row in rows {
                match row {
                    ListingRow::Folder(url) => {
                        if url.as_str().starts_with(self.root.as_str()) {
                            folders.push(url);
                        }
                    },
                    ListingRow::File { url, size } => {
                        entries.push(CatalogEntry::from_url(&self.root, url, size)?);
                        files += 1;
                    },
                }
            }

            info!(
                folder = %page_url,
                files,
                pending = folders.len(),
                total = entries.len(),
                "Indexed folder"
            );
        }

        Ok(Catalog::new(entries))
    }

    /// Fetch one listing page, returning the URL it was finally served from
    async fn fetch_listing(&self, folder: &Url) -> Result<(Url, String), IndexError> {
        debug!(url = %folder, "Fetching listing");

        let request_error = |source| IndexError::Request {
            url: folder.to_string(),
            source,
        };
        let response = self
            .client
            .get(folder.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Status {
                url: folder.to_string(),
                status,
            });
        }

        let page_url = as_folder(response.url());
        let html = response.text().await.map_err(request_error)?;
        Ok((page_url, html))
    }
}
