//! Stage-then-publish helpers
//!
//! Every artifact this crate produces (downloaded archives, decoded tables, converted datasets)
//! is first written under `<dest>.partial` and only renamed to `<dest>` once it is complete.
//! A path without the suffix is therefore always a finished artifact.
//!
//! Downloads use the fixed `<dest>.partial` name so a later run truncates and reuses it.
//! Decoding and conversion stage under `<dest>.partial-<pid>-<nonce>`, private to one run, so
//! two runs working on the same table never write into or delete each other's staging area.
//! Private staging left behind by a killed run is removed by [`sweep_stale`] once it is old.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Suffix appended to in-progress artifacts
pub const STAGING_SUFFIX: &str = ".partial";

/// Private staging older than this belongs to a run that is no longer alive
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// `<dest>.partial`
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// `<dest>.partial-<pid>-<nonce>`, unique to the calling run
pub fn private_staging_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(format!(
        "{STAGING_SUFFIX}-{}-{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ));
    PathBuf::from(name)
}

/// Whether `path` is a staging artifact, shared or private
pub fn is_staging_path(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.ends_with(STAGING_SUFFIX) || name.contains(&format!("{STAGING_SUFFIX}-"))
        })
        .unwrap_or(false)
}

/// Remove staging siblings of `dest` (files or directories) last modified more than
/// `max_age` ago. Returns how many were removed.
pub async fn sweep_stale(dest: &Path, max_age: Duration) -> io::Result<usize> {
    let (Some(parent), Some(file_name)) = (dest.parent(), dest.file_name()) else {
        return Ok(0);
    };
    let prefix = format!("{}{STAGING_SUFFIX}", file_name.to_string_lossy());

    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let meta = entry.metadata().await?;
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        if meta.is_dir() {
            discard_dir(&entry.path()).await?;
        } else {
            discard_file(&entry.path()).await?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Atomically move a finished staging file or directory to its final name
pub async fn publish(staging: &Path, dest: &Path) -> io::Result<()> {
    tokio::fs::rename(staging, dest).await
}

/// Remove a staging file; a missing file is not an error
pub async fn discard_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove a staging directory tree; a missing directory is not an error
pub async fn discard_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Size of `path` if it exists as a regular file
pub async fn existing_len(path: &Path) -> io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_path_keeps_full_name() {
        let staged = staging_path(Path::new("/raw/optm_lz/opprcd1998.sas7bdat.lz"));
        assert_eq!(staged, PathBuf::from("/raw/optm_lz/opprcd1998.sas7bdat.lz.partial"));
        assert!(is_staging_path(&staged));
        assert!(!is_staging_path(Path::new("/raw/opprcd1998.parq")));
    }

    #[test]
    fn test_private_staging_paths_are_unique() {
        let dest = Path::new("/interim/opprcd1998.parq");
        let first = private_staging_path(dest);
        let second = private_staging_path(dest);

        assert_ne!(first, second);
        assert!(is_staging_path(&first));
        assert!(first
            .to_string_lossy()
            .starts_with("/interim/opprcd1998.parq.partial-"));
    }

    #[tokio::test]
    async fn test_sweep_stale_respects_age() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("opprcd1998.parq");
        let staged = private_staging_path(&dest);
        tokio::fs::create_dir_all(staged.join("secid=1")).await.unwrap();
        tokio::fs::write(dir.path().join("opprcd1999.parq.partial-1-0"), b"x")
            .await
            .unwrap();

        // A fresh staging directory may belong to a live run
        assert_eq!(sweep_stale(&dest, STALE_STAGING_AGE).await.unwrap(), 0);
        assert!(staged.exists());

        assert_eq!(sweep_stale(&dest, Duration::ZERO).await.unwrap(), 1);
        assert!(!staged.exists());
        assert!(dir.path().join("opprcd1999.parq.partial-1-0").exists());
    }

    #[tokio::test]
    async fn test_publish_moves_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file.bin");
        let staged = staging_path(&dest);
        tokio::fs::write(&staged, b"data").await.unwrap();

        publish(&staged, &dest).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_discard_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        discard_file(&dir.path().join("nope")).await.unwrap();
        discard_dir(&dir.path().join("nope")).await.unwrap();
        assert_eq!(existing_len(&dir.path().join("nope")).await.unwrap(), None);
    }
}
