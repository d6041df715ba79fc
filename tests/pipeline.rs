//! End-to-end pipeline tests: a mock gallery listing plus a mock CDN,
//! driven through `run` exactly the way a front-end would.

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::time::Duration;

use galrip::{HttpGallerySource, Ledger, LedgerStatus, RetryPolicy, RunConfig, run};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Installs the log subscriber once per test binary; honors `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast-retry configuration pointed at a temp directory.
fn test_config(output_dir: &Path) -> RunConfig {
    init_logging();
    let mut config = RunConfig::new(output_dir);
    config.rate_limit = Duration::ZERO;
    config.retry_policy = RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(10),
        2.0,
    );
    config
}

fn page_json(server_uri: &str, ids: &[&str], next: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "items": ids.iter().map(|id| serde_json::json!({
            "id": id,
            "url": format!("{server_uri}/cdn/{id}.jpg"),
        })).collect::<Vec<_>>(),
        "next_cursor": next,
    })
}

/// Mounts a paginated listing for `source_id`: one mock per page, chained
/// by cursor, plus a 200 CDN response for every listed item.
async fn mount_gallery(server: &MockServer, source_id: &str, pages: &[&[&str]]) {
    let listing_path = format!("/galleries/{source_id}/items");

    for (index, ids) in pages.iter().enumerate() {
        let next = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));
        let body = page_json(&server.uri(), ids, next.as_deref());

        let mut mock = Mock::given(method("GET")).and(path(listing_path.clone()));
        mock = if index == 0 {
            mock.and(query_param_is_missing("cursor"))
        } else {
            mock.and(query_param("cursor", format!("page-{index}")))
        };
        mock.respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;

        for id in *ids {
            Mock::given(method("GET"))
                .and(path(format!("/cdn/{id}.jpg")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-data"))
                .mount(server)
                .await;
        }
    }
}

fn no_part_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .unwrap()
        .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".part"))
}

#[tokio::test]
async fn downloads_multi_page_gallery() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    mount_gallery(&server, "cats", &[&["a", "b"], &["c", "d"], &["e"]]).await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let summary = run(&source, &test_config(temp_dir.path())).await.unwrap();

    assert_eq!(summary.downloaded, 5);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);
    assert!(summary.is_success());

    for id in ["a", "b", "c", "d", "e"] {
        let file = temp_dir.path().join(format!("{id}.jpg"));
        assert_eq!(std::fs::read(&file).unwrap(), b"image-data");
    }
    assert!(no_part_files(temp_dir.path()));
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    mount_gallery(&server, "cats", &[&["a", "b", "c"]]).await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let config = test_config(temp_dir.path());

    let first = run(&source, &config).await.unwrap();
    assert_eq!(first.downloaded, 3);

    let second = run(&source, &config).await.unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, 3);
    assert!(second.is_success());
}

#[tokio::test]
async fn seeded_ledger_suppresses_only_successes() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    mount_gallery(&server, "cats", &[&["a", "b", "c"]]).await;

    // Ledger knows a and b already; c has a failed row and must be retried
    {
        let ledger = Ledger::open(temp_dir.path()).await.unwrap();
        ledger.record("a", LedgerStatus::Success).await.unwrap();
        ledger.record("b", LedgerStatus::Success).await.unwrap();
        ledger.record("c", LedgerStatus::Failed).await.unwrap();
        ledger.close().await;
    }

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let summary = run(&source, &test_config(temp_dir.path())).await.unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.downloaded, 1);
    assert!(summary.is_success());
    assert!(temp_dir.path().join("c.jpg").exists());
    assert!(!temp_dir.path().join("a.jpg").exists());
}

#[tokio::test]
async fn force_refetch_downloads_everything_again() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    mount_gallery(&server, "cats", &[&["a", "b"]]).await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let mut config = test_config(temp_dir.path());

    run(&source, &config).await.unwrap();

    config.force_refetch = true;
    let second = run(&source, &config).await.unwrap();

    assert_eq!(second.downloaded, 2);
    assert_eq!(second.skipped, 0);
}

#[tokio::test]
async fn transient_cdn_failure_is_retried_within_bound() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/galleries/cats/items"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page_json(&server.uri(), &["flaky"], None)),
        )
        .mount(&server)
        .await;

    // Two 500s, then success: within the 3-retry budget
    Mock::given(method("GET"))
        .and(path("/cdn/flaky.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/flaky.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-data"))
        .with_priority(2)
        .mount(&server)
        .await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let summary = run(&source, &test_config(temp_dir.path())).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert!(summary.is_success());
}

#[tokio::test]
async fn exhausted_item_marks_run_unsuccessful_but_completes() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/galleries/cats/items"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page_json(&server.uri(), &["good", "dead"], None)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/good.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-data"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/dead.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let summary = run(&source, &test_config(temp_dir.path())).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.is_success());
    assert!(temp_dir.path().join("good.jpg").exists());
    assert!(no_part_files(temp_dir.path()));

    // The failure is in the ledger but does not suppress a future retry
    let ledger = Ledger::open(temp_dir.path()).await.unwrap();
    assert!(!ledger.has("dead").await.unwrap());
    assert_eq!(
        ledger.entry("dead").await.unwrap().unwrap().status,
        LedgerStatus::Failed
    );
    ledger.close().await;
}

#[tokio::test]
async fn failed_item_recovers_on_next_run() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/galleries/cats/items"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page_json(&server.uri(), &["item"], None)),
        )
        .mount(&server)
        .await;

    // Down for the whole first run (4 attempts), up afterwards
    Mock::given(method("GET"))
        .and(path("/cdn/item.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(4)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/item.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-data"))
        .with_priority(2)
        .mount(&server)
        .await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let config = test_config(temp_dir.path());

    let first = run(&source, &config).await.unwrap();
    assert_eq!(first.failed, 1);

    let second = run(&source, &config).await.unwrap();
    assert_eq!(second.downloaded, 1);
    assert!(second.is_success());
}

#[tokio::test]
async fn summary_is_independent_of_pool_size() {
    let ids: Vec<String> = (0..20).map(|i| format!("img-{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

    for concurrency in [1, 8] {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        mount_gallery(&server, "cats", &[&id_refs[..10], &id_refs[10..]]).await;

        let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
        let mut config = test_config(temp_dir.path());
        config.concurrency = concurrency;

        let summary = run(&source, &config).await.unwrap();

        assert_eq!(summary.downloaded, 20, "concurrency {concurrency}");
        assert_eq!(summary.failed, 0, "concurrency {concurrency}");
        for id in &ids {
            assert!(
                temp_dir.path().join(format!("{id}.jpg")).exists(),
                "missing {id} at concurrency {concurrency}"
            );
        }
    }
}

#[tokio::test]
async fn listing_failure_aborts_but_keeps_progress() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    // Page 1 lists one item; page 2 is permanently gone
    Mock::given(method("GET"))
        .and(path("/galleries/cats/items"))
        .and(query_param_is_missing("cursor"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page_json(&server.uri(), &["a"], Some("page-1"))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/cats/items"))
        .and(query_param("cursor", "page-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdn/a.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-data"))
        .mount(&server)
        .await;

    let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
    let result = run(&source, &test_config(temp_dir.path())).await;

    assert!(result.is_err(), "listing failure must abort the run");
    // The item from the good page still landed and was ledgered
    assert!(temp_dir.path().join("a.jpg").exists());
    let ledger = Ledger::open(temp_dir.path()).await.unwrap();
    assert!(ledger.has("a").await.unwrap());
    ledger.close().await;
}
