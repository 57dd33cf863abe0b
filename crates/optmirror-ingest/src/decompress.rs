//! Decompression cache
//!
//! Fetched archives under the raw root are decoded on demand into the interim root, keeping
//! the same relative layout with the compression suffix stripped:
//!
//! ```text
//! raw_root/optm_lz/opprcd/opprcd1998.sas7bdat.lz
//!   -> interim_root/optm_lz/opprcd/opprcd1998.sas7bdat
//! ```
//!
//! A decoded file that exists is trusted and never re-derived.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::staging::{discard_file, private_staging_path, publish, sweep_stale, STALE_STAGING_AGE};

#[derive(Error, Debug)]
pub enum DecompressError {
    /// Usage error: the caller handed over a path this cache cannot own
    #[error("Precondition violated for {path}: {reason}")]
    Precondition { path: PathBuf, reason: String },

    #[error("Decompression tool '{program}' is not installed")]
    MissingTool { program: String },

    #[error("'{program}' failed on {src} ({status}): {stderr}")]
    Command {
        program: String,
        src: PathBuf,
        status: ExitStatus,
        stderr: String,
    },

    #[error("IO error decoding {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DecompressError {
    /// Precondition and missing-tool errors abort the whole job
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecompressError::Precondition { .. } | DecompressError::MissingTool { .. }
        )
    }

    fn io(path: &Path) -> impl FnOnce(io::Error) -> DecompressError + '_ {
        move |source| DecompressError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Decodes a single-file archive, leaving the source intact
#[async_trait]
pub trait Decompressor: Send + Sync {
    /// Archive extension handled, without the leading dot
    fn extension(&self) -> &str;

    async fn decode(&self, src: &Path, dst: &Path) -> Result<(), DecompressError>;
}

/// Shells out to `lzip --keep -d SRC -o DST`
#[derive(Debug, Clone)]
pub struct LzipCommand {
    program: String,
}

impl LzipCommand {
    pub fn new() -> Self {
        Self::with_program("lzip")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for LzipCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decompressor for LzipCommand {
    fn extension(&self) -> &str {
        "lz"
    }

    async fn decode(&self, src: &Path, dst: &Path) -> Result<(), DecompressError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("--keep")
            .arg("--force")
            .arg("-d")
            .arg(src)
            .arg("-o")
            .arg(dst)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DecompressError::MissingTool {
                    program: self.program.clone(),
                },
                _ => DecompressError::Io {
                    path: src.to_path_buf(),
                    source: e,
                },
            })?;

        if !output.status.success() {
            return Err(DecompressError::Command {
                program: self.program.clone(),
                src: src.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// In-process gzip decoding with `flate2`
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipDecoder;

#[async_trait]
impl Decompressor for GzipDecoder {
    fn extension(&self) -> &str {
        "gz"
    }

    async fn decode(&self, src: &Path, dst: &Path) -> Result<(), DecompressError> {
        let src_owned = src.to_path_buf();
        let dst_owned = dst.to_path_buf();

        tokio::task::spawn_blocking(move || -> io::Result<u64> {
            let input = std::fs::File::open(&src_owned)?;
            let mut decoder = flate2::read::MultiGzDecoder::new(io::BufReader::new(input));
            let mut output = io::BufWriter::new(std::fs::File::create(&dst_owned)?);
            let written = io::copy(&mut decoder, &mut output)?;
            io::Write::flush(&mut output)?;
            Ok(written)
        })
        .await
        .map_err(|e| DecompressError::Io {
            path: src.to_path_buf(),
            source: io::Error::other(e),
        })?
        .map_err(DecompressError::io(src))?;

        Ok(())
    }
}

/// Maps raw archives to decoded tables and materializes them on demand
#[derive(Clone)]
pub struct DecompressionCache {
    raw_root: PathBuf,
    interim_root: PathBuf,
    decompressor: Arc<dyn Decompressor>,
}

impl DecompressionCache {
    pub fn new(
        raw_root: impl Into<PathBuf>,
        interim_root: impl Into<PathBuf>,
        decompressor: Arc<dyn Decompressor>,
    ) -> Self {
        Self {
            raw_root: raw_root.into(),
            interim_root: interim_root.into(),
            decompressor,
        }
    }

    pub fn extension(&self) -> &str {
        self.decompressor.extension()
    }

    /// Where `raw` decodes to. Pure path arithmetic, no IO.
    pub fn decoded_path(&self, raw: &Path) -> Result<PathBuf, DecompressError> {
        let precondition = |reason: String| DecompressError::Precondition {
            path: raw.to_path_buf(),
            reason,
        };

        let relative = raw.strip_prefix(&self.raw_root).map_err(|_| {
            precondition(format!("not beneath the raw root {}", self.raw_root.display()))
        })?;

        let extension = self.decompressor.extension();
        let matches = relative
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if !matches {
            return Err(precondition(format!("expected a .{extension} archive")));
        }

        Ok(self.interim_root.join(relative.with_extension("")))
    }

    /// Return the decoded path for `raw`, decoding it first when `decode` is set and no
    /// decoded copy exists yet.
    pub async fn materialize(&self, raw: &Path, decode: bool) -> Result<PathBuf, DecompressError> {
        let decoded = self.decoded_path(raw)?;

        if tokio::fs::try_exists(&decoded)
            .await
            .map_err(DecompressError::io(&decoded))?
        {
            debug!(path = %decoded.display(), "Decoded copy already present");
            return Ok(decoded);
        }
        if !decode {
            return Ok(decoded);
        }

        if let Some(parent) = decoded.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DecompressError::io(parent))?;
        }

        if let Err(e) = sweep_stale(&decoded, STALE_STAGING_AGE).await {
            warn!(path = %decoded.display(), error = %e, "Could not sweep stale staging files");
        }

        let staging = private_staging_path(&decoded);

        if let Err(e) = self.decompressor.decode(raw, &staging).await {
            discard_file(&staging).await.map_err(DecompressError::io(&staging))?;
            return Err(e);
        }

        publish(&staging, &decoded)
            .await
            .map_err(DecompressError::io(&decoded))?;
        info!(src = %raw.display(), dst = %decoded.display(), "Decoded archive");
        Ok(decoded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Copies bytes through and counts calls
    #[derive(Default)]
    struct CopyDecompressor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Decompressor for CopyDecompressor {
        fn extension(&self) -> &str {
            "lz"
        }

        async fn decode(&self, src: &Path, dst: &Path) -> Result<(), DecompressError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::copy(src, dst).await.map_err(DecompressError::io(src))?;
            Ok(())
        }
    }

    fn has_staging_sibling(decoded: &Path) -> bool {
        std::fs::read_dir(decoded.parent().unwrap())
            .unwrap()
            .any(|entry| crate::staging::is_staging_path(&entry.unwrap().path()))
    }

    fn roots() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        let interim = dir.path().join("interim");
        (dir, raw, interim)
    }

    #[test]
    fn test_decoded_path_strips_suffix_and_reroots() {
        let cache = DecompressionCache::new("/data/raw", "/data/interim", Arc::new(LzipCommand::new()));
        let decoded = cache
            .decoded_path(Path::new("/data/raw/optm_lz/opprcd/opprcd1998.sas7bdat.lz"))
            .unwrap();
        assert_eq!(
            decoded,
            PathBuf::from("/data/interim/optm_lz/opprcd/opprcd1998.sas7bdat")
        );
    }

    #[test]
    fn test_wrong_extension_is_a_precondition_error() {
        let cache = DecompressionCache::new("/data/raw", "/data/interim", Arc::new(LzipCommand::new()));
        let err = cache
            .decoded_path(Path::new("/data/raw/optm_lz/securd1.sas7bdat"))
            .unwrap_err();
        assert!(matches!(err, DecompressError::Precondition { .. }));
        assert!(err.is_fatal());

        let err = cache.decoded_path(Path::new("/elsewhere/a.lz")).unwrap_err();
        assert!(matches!(err, DecompressError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_materialize_is_idempotent() {
        let (_dir, raw_root, interim_root) = roots();
        let raw = raw_root.join("optm_lz/securd1.sas7bdat.lz");
        tokio::fs::create_dir_all(raw.parent().unwrap()).await.unwrap();
        tokio::fs::write(&raw, b"payload").await.unwrap();

        let decompressor = Arc::new(CopyDecompressor::default());
        let cache = DecompressionCache::new(&raw_root, &interim_root, decompressor.clone());

        let decoded = cache.materialize(&raw, true).await.unwrap();
        assert_eq!(tokio::fs::read(&decoded).await.unwrap(), b"payload");
        assert!(raw.exists());
        assert!(!has_staging_sibling(&decoded));

        cache.materialize(&raw, true).await.unwrap();
        assert_eq!(decompressor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_materialize_keeps_staging_private() {
        let (_dir, raw_root, interim_root) = roots();
        let raw = raw_root.join("optm_lz/securd1.sas7bdat.lz");
        tokio::fs::create_dir_all(raw.parent().unwrap()).await.unwrap();
        tokio::fs::write(&raw, vec![7u8; 1 << 20]).await.unwrap();

        let first = DecompressionCache::new(&raw_root, &interim_root, Arc::new(CopyDecompressor::default()));
        let second = DecompressionCache::new(&raw_root, &interim_root, Arc::new(CopyDecompressor::default()));

        let (a, b) = tokio::join!(first.materialize(&raw, true), second.materialize(&raw, true));
        let decoded = a.unwrap();
        assert_eq!(decoded, b.unwrap());
        assert_eq!(tokio::fs::read(&decoded).await.unwrap().len(), 1 << 20);
        assert!(!has_staging_sibling(&decoded));
    }

    #[tokio::test]
    async fn test_materialize_without_decode_does_no_io() {
        let (_dir, raw_root, interim_root) = roots();
        let decompressor = Arc::new(CopyDecompressor::default());
        let cache = DecompressionCache::new(&raw_root, &interim_root, decompressor.clone());

        let decoded = cache
            .materialize(&raw_root.join("a.sas7bdat.lz"), false)
            .await
            .unwrap();

        assert!(!decoded.exists());
        assert!(!interim_root.exists());
        assert_eq!(decompressor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gzip_decoder() {
        let (_dir, raw_root, interim_root) = roots();
        let raw = raw_root.join("tables/prices.csv.gz");
        std::fs::create_dir_all(raw.parent().unwrap()).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"secid,date\n1,1998-01-02\n").unwrap();
        std::fs::write(&raw, encoder.finish().unwrap()).unwrap();

        let cache = DecompressionCache::new(&raw_root, &interim_root, Arc::new(GzipDecoder));
        let decoded = cache.materialize(&raw, true).await.unwrap();

        assert_eq!(decoded, interim_root.join("tables/prices.csv"));
        assert_eq!(
            std::fs::read_to_string(decoded).unwrap(),
            "secid,date\n1,1998-01-02\n"
        );
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let (_dir, raw_root, interim_root) = roots();
        let raw = raw_root.join("a.sas7bdat.lz");
        std::fs::create_dir_all(&raw_root).unwrap();
        std::fs::write(&raw, b"not really lzip").unwrap();

        let lzip = LzipCommand::with_program("optmirror-no-such-lzip-binary");
        let cache = DecompressionCache::new(&raw_root, &interim_root, Arc::new(lzip));
        let err = cache.materialize(&raw, true).await.unwrap_err();

        assert!(matches!(err, DecompressError::MissingTool { .. }));
        assert!(!interim_root.join("a.sas7bdat").exists());
    }
}
