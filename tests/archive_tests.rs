//! Archive persistence tests

use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use webreplay::archive::{Archive, ArchiveError, MemoryArchive};
use webreplay::record::{ArchivedRequest, ArchivedResponse, HeaderList, ResponseTiming};

fn chunked_response() -> ArchivedResponse {
    let mut headers = HeaderList::new();
    headers.push("Content-Type", "text/plain");
    headers.push("Transfer-Encoding", "chunked");
    headers.push("Set-Cookie", "a=1");
    headers.push("Set-Cookie", "b=2");

    ArchivedResponse::new(
        11,
        200,
        "OK",
        headers,
        vec![Bytes::from_static(b"Wiki"), Bytes::from_static(b"pedia")],
        ResponseTiming {
            header_delay_ms: -12,
            chunk_delays_ms: vec![3, 40],
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_snapshot_survives_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("archive.json");

    let archive = MemoryArchive::new();
    let get = ArchivedRequest::get("a.com", "/wiki", true);
    let post = ArchivedRequest::new(
        "POST",
        "a.com",
        "/form",
        HeaderList::new(),
        Some(Bytes::from_static(b"q=1")),
        false,
    );
    archive.put(get.clone(), Arc::new(chunked_response())).await;
    archive
        .put(
            post.clone(),
            Arc::new(ArchivedResponse::simple(302, "Found", HeaderList::new(), "")),
        )
        .await;
    archive.set_server_rtt("a.com", 25).await;
    archive.save(&path).await.unwrap();

    let reloaded = MemoryArchive::load(&path).await.unwrap();
    assert_eq!(reloaded.len().await, 2);
    assert_eq!(reloaded.requests().await, vec![get.clone(), post.clone()]);

    let response = reloaded.get(&get).await.unwrap();
    assert_eq!(*response, chunked_response());
    // Negative header delays are stored as-is
    assert_eq!(response.timing().header_delay_ms, -12);
    assert_eq!(response.headers.get_all("set-cookie").count(), 2);

    assert_eq!(reloaded.get(&post).await.unwrap().status_code, 302);
    assert_eq!(reloaded.get_server_rtt("a.com").await, 25);
}

#[tokio::test]
async fn test_put_overwrites_same_identity() {
    let archive = MemoryArchive::new();
    let request = ArchivedRequest::get("a.com", "/", false);

    archive
        .put(request.clone(), Arc::new(ArchivedResponse::simple(200, "OK", HeaderList::new(), "old")))
        .await;
    archive
        .put(request.clone(), Arc::new(ArchivedResponse::simple(200, "OK", HeaderList::new(), "new")))
        .await;

    assert_eq!(archive.len().await, 1);
    assert_eq!(archive.get(&request).await.unwrap().body_text(), "new");
}

#[tokio::test]
async fn test_concurrent_puts_do_not_corrupt() {
    let archive = Arc::new(MemoryArchive::new());

    let mut handles = Vec::new();
    for i in 0..32 {
        let archive = Arc::clone(&archive);
        handles.push(tokio::spawn(async move {
            let request = ArchivedRequest::get("a.com", format!("/{}", i % 8), false);
            let body = format!("body-{}", i);
            archive
                .put(request, Arc::new(ArchivedResponse::simple(200, "OK", HeaderList::new(), body)))
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(archive.len().await, 8);
    for i in 0..8 {
        let response = archive
            .get(&ArchivedRequest::get("a.com", format!("/{}", i), false))
            .await
            .unwrap();
        assert!(response.body_text().starts_with("body-"));
    }
}

#[tokio::test]
async fn test_load_rejects_malformed_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    tokio::fs::write(&path, b"{not json").await.unwrap();

    assert!(matches!(
        MemoryArchive::load(&path).await,
        Err(ArchiveError::Format(_))
    ));
}

#[tokio::test]
async fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        MemoryArchive::load(dir.path().join("missing.json")).await,
        Err(ArchiveError::Io(_))
    ));
}
