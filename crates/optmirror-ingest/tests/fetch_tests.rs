//! Integration tests for the resumable fetcher against a wiremock server

use optmirror_common::units::SizeTolerance;
use optmirror_ingest::fetch::{FetchError, FetchOutcome, FetchPolicy, Fetcher};
use optmirror_ingest::index::{Catalog, CatalogEntry};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use walkdir::WalkDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// No waiting between attempts
fn fast_policy(max_attempts: u32) -> FetchPolicy {
    FetchPolicy {
        max_attempts,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        max_jitter: Duration::ZERO,
        stall_timeout: Duration::from_secs(5),
        tolerance: SizeTolerance::SignificantDigits(2),
        redownload_corrupt: true,
        show_progress: false,
    }
}

fn entry(server: &MockServer, relative: &str, declared_size: u64) -> CatalogEntry {
    let root = Url::parse(&format!("{}/optm_lz/", server.uri())).unwrap();
    let url = root.join(relative).unwrap();
    CatalogEntry::from_url(&root, url, declared_size).unwrap()
}

async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

fn staging_leftovers(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| e.path().to_string_lossy().to_string())
        .filter(|p| p.ends_with(".partial"))
        .collect()
}

#[tokio::test]
async fn test_fetch_then_rerun_is_idempotent() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    serve(&server, "/optm_lz/opprcd/opprcd1996.sas7bdat.lz", vec![7u8; 4000]).await;
    serve(&server, "/optm_lz/opprcd/opprcd1997.sas7bdat.lz", vec![9u8; 6000]).await;

    let catalog = Catalog::new(vec![
        entry(&server, "opprcd/opprcd1996.sas7bdat.lz", 4000),
        entry(&server, "opprcd/opprcd1997.sas7bdat.lz", 6000),
    ]);
    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(3));

    let first = fetcher.fetch_all(&catalog, raw.path(), 2).await;
    assert!(first.is_success());
    assert_eq!(first.downloaded, 2);
    assert_eq!(first.bytes, 10_000);

    let dest = raw.path().join("opprcd/opprcd1996.sas7bdat.lz");
    assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4000]);

    let second = fetcher.fetch_all(&catalog, raw.path(), 2).await;
    assert!(second.is_success());
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.verified, 2);
    assert_eq!(second.bytes, 0);

    // Only the first run touched the server
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(staging_leftovers(raw.path()).is_empty());
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/optm_lz/flaky.lz"))
        .respond_with(ResponseTemplate::new(503))
        .expect(8)
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(8));
    let err = fetcher
        .fetch(&entry(&server, "flaky.lz", 100), raw.path())
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), Some(8));
    match err {
        FetchError::Exhausted { last, .. } => {
            assert!(matches!(*last, FetchError::Status { status, .. } if status.as_u16() == 503));
        },
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(!raw.path().join("flaky.lz").exists());
    assert!(staging_leftovers(raw.path()).is_empty());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/optm_lz/missing.lz"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(8));
    let err = fetcher
        .fetch(&entry(&server, "missing.lz", 100), raw.path())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Status { status, .. } if status.as_u16() == 404));
}

#[tokio::test]
async fn test_truncated_body_is_a_size_mismatch() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/optm_lz/short.lz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 500]))
        .expect(3)
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(3));
    let err = fetcher
        .fetch(&entry(&server, "short.lz", 1000), raw.path())
        .await
        .unwrap_err();

    match err {
        FetchError::Exhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                *last,
                FetchError::SizeMismatch { declared: 1000, actual: 500, .. }
            ));
        },
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(!raw.path().join("short.lz").exists());
    assert!(staging_leftovers(raw.path()).is_empty());
}

#[tokio::test]
async fn test_corrupt_file_is_replaced() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    serve(&server, "/optm_lz/opprcd2000.sas7bdat.lz", vec![3u8; 2000]).await;

    let dest = raw.path().join("opprcd2000.sas7bdat.lz");
    std::fs::write(&dest, vec![0u8; 10]).unwrap();

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(3));
    let report = fetcher
        .fetch(&entry(&server, "opprcd2000.sas7bdat.lz", 2000), raw.path())
        .await
        .unwrap();

    assert_eq!(report.outcome, FetchOutcome::Downloaded { replaced_corrupt: true });
    assert_eq!(report.attempts, 1);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 2000);
}

#[tokio::test]
async fn test_corrupt_file_is_removed_without_redownload() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dest = raw.path().join("opprcd2000.sas7bdat.lz");
    std::fs::write(&dest, vec![0u8; 10]).unwrap();

    let policy = FetchPolicy {
        redownload_corrupt: false,
        ..fast_policy(3)
    };
    let fetcher = Fetcher::new(reqwest::Client::new(), policy);
    let report = fetcher
        .fetch(&entry(&server, "opprcd2000.sas7bdat.lz", 2000), raw.path())
        .await
        .unwrap();

    assert_eq!(report.outcome, FetchOutcome::SkippedCorruptRemoved);
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_size_within_tolerance_is_accepted() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    // Listings round sizes, e.g. "1.2M"
    serve(&server, "/optm_lz/rounded.lz", vec![5u8; 1_234_567]).await;

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(1));
    let report = fetcher
        .fetch(&entry(&server, "rounded.lz", 1_200_000), raw.path())
        .await
        .unwrap();

    assert_eq!(report.outcome, FetchOutcome::Downloaded { replaced_corrupt: false });
    assert_eq!(report.bytes, 1_234_567);
}

#[tokio::test]
async fn test_leftover_staging_file_is_overwritten() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    serve(&server, "/optm_lz/resume.lz", vec![8u8; 3000]).await;

    let staging = raw.path().join("resume.lz.partial");
    std::fs::write(&staging, vec![1u8; 9000]).unwrap();

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(2));
    fetcher
        .fetch(&entry(&server, "resume.lz", 3000), raw.path())
        .await
        .unwrap();

    assert_eq!(std::fs::read(raw.path().join("resume.lz")).unwrap(), vec![8u8; 3000]);
    assert!(!staging.exists());
}

#[tokio::test]
async fn test_unreachable_server_exhausts_attempts() {
    let raw = TempDir::new().unwrap();
    // Bind then release a port so nothing is listening on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let root = Url::parse(&format!("http://127.0.0.1:{port}/optm_lz/")).unwrap();
    let url = root.join("gone.lz").unwrap();
    let entry = CatalogEntry::from_url(&root, url, 100).unwrap();

    let fetcher = Fetcher::new(reqwest::Client::new(), fast_policy(8));
    let err = fetcher.fetch(&entry, raw.path()).await.unwrap_err();

    assert_eq!(err.attempts(), Some(8));
    match err {
        FetchError::Exhausted { last, .. } => {
            assert!(matches!(*last, FetchError::Transport { .. }), "got {last:?}");
        },
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(!raw.path().join("gone.lz").exists());
    assert!(staging_leftovers(raw.path()).is_empty());
}

#[tokio::test]
async fn test_stalled_response_is_retried() {
    let server = MockServer::start().await;
    let raw = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/optm_lz/slow.lz"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 100])
                .set_delay(Duration::from_millis(500)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let policy = FetchPolicy {
        stall_timeout: Duration::from_millis(100),
        ..fast_policy(3)
    };
    let fetcher = Fetcher::new(reqwest::Client::new(), policy);
    let err = fetcher
        .fetch(&entry(&server, "slow.lz", 100), raw.path())
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), Some(3));
    match err {
        FetchError::Exhausted { last, .. } => {
            assert!(matches!(*last, FetchError::Stalled { after, .. } if after == Duration::from_millis(100)));
        },
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(!raw.path().join("slow.lz").exists());
}
