//! Chunk store integration tests: staging, resumption, integrity, expiry.

use std::io::Write;
use std::time::Duration;

use fde::archive::extract_zip;
use fde::server::chunks::ChunkStore;
use fde::utils::{md5_hex, sha256_hex};

fn store() -> (tempfile::TempDir, ChunkStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ChunkStore::new(dir.path().join("fde-chunks"));
    (dir, store)
}

fn upload_id_for(bytes: &[u8]) -> String {
    sha256_hex(bytes).chars().take(32).collect()
}

/// A zip holding a single `hello.txt`.
fn hello_zip() -> Vec<u8> {
    let mut raw = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut raw));
        zip.start_file("hello.txt", zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(b"Hello, World!").unwrap();
        zip.finish().unwrap();
    }
    raw
}

#[tokio::test]
async fn test_single_chunk_upload_then_extract() {
    let (_dir, store) = store();
    let bytes = hello_zip();
    let id = upload_id_for(&bytes);

    let init = store.init(&id, 1, "hello.zip", "test", true).await.unwrap();
    assert!(!init.is_resume);
    assert!(init.uploaded_chunks.is_empty());

    store
        .write_chunk(&id, 0, &bytes, Some(&md5_hex(&bytes)))
        .await
        .unwrap();

    let merged = store.complete(&id, Some(&sha256_hex(&bytes))).await.unwrap();
    assert!(merged.checksum_verified);
    assert_eq!(merged.bytes, bytes);
    assert_eq!(merged.meta.file_name, "hello.zip");

    let target = tempfile::tempdir().unwrap();
    extract_zip(&merged.bytes, target.path()).unwrap();
    assert_eq!(
        std::fs::read_to_string(target.path().join("hello.txt")).unwrap(),
        "Hello, World!"
    );

    // Task directory is removed after handoff
    assert!(store.remove(&id).await.unwrap());
    assert!(!store.status(&id).await.unwrap().exists);
}

#[tokio::test]
async fn test_resume_after_partial_upload() {
    let (_dir, store) = store();
    let chunk_size = 1024;
    let bytes: Vec<u8> = (0..(chunk_size * 3)).map(|i| (i % 251) as u8).collect();
    let checksum = sha256_hex(&bytes);
    let id = upload_id_for(&bytes);

    // First run: chunks 0 and 1 land, then the client dies
    store.init(&id, 3, "app.bin", "test", false).await.unwrap();
    store
        .write_chunk(&id, 0, &bytes[..chunk_size], None)
        .await
        .unwrap();
    store
        .write_chunk(&id, 1, &bytes[chunk_size..chunk_size * 2], None)
        .await
        .unwrap();

    // Second run resumes with the surviving chunks
    let init = store.init(&id, 3, "app.bin", "test", false).await.unwrap();
    assert!(init.is_resume);
    assert_eq!(init.uploaded_chunks, vec![0, 1]);

    store
        .write_chunk(&id, 2, &bytes[chunk_size * 2..], None)
        .await
        .unwrap();

    let merged = store.complete(&id, Some(&checksum)).await.unwrap();
    assert_eq!(sha256_hex(&merged.bytes), checksum);
    assert_eq!(merged.bytes, bytes);
}

#[tokio::test]
async fn test_chunk_rewrite_is_idempotent() {
    let (_dir, store) = store();
    store.init("task", 2, "a.bin", "test", false).await.unwrap();

    for _ in 0..3 {
        store.write_chunk("task", 1, b"same bytes", None).await.unwrap();
    }

    let status = store.status("task").await.unwrap();
    assert_eq!(status.uploaded_chunks, vec![1]);

    store.write_chunk("task", 0, b"first", None).await.unwrap();
    let merged = store.complete("task", None).await.unwrap();
    assert_eq!(merged.bytes, b"firstsame bytes".to_vec());
    assert!(!merged.checksum_verified);
}

#[tokio::test]
async fn test_chunk_index_out_of_range() {
    let (_dir, store) = store();
    store.init("task", 3, "a.bin", "test", false).await.unwrap();

    let err = store
        .write_chunk("task", 3, b"overflow", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("out of range"));

    let err = store.write_chunk("ghost", 0, b"x", None).await.unwrap_err();
    assert!(err.to_string().contains("unknown uploadId"));
}

#[tokio::test]
async fn test_incomplete_merge_reports_missing_chunks() {
    let (_dir, store) = store();
    store.init("task", 3, "a.bin", "test", false).await.unwrap();
    store.write_chunk("task", 0, b"zero", None).await.unwrap();
    store.write_chunk("task", 2, b"two", None).await.unwrap();

    let err = store.complete("task", None).await.unwrap_err();
    assert!(err.to_string().contains("missing chunks [1]"));

    // The task survives an incomplete completion attempt
    assert!(store.status("task").await.unwrap().exists);
}

#[tokio::test]
async fn test_md5_mismatch_fails_chunk_only() {
    let (_dir, store) = store();
    store.init("task", 1, "a.bin", "test", false).await.unwrap();

    let err = store
        .write_chunk("task", 0, b"payload", Some("00000000000000000000000000000000"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("MD5 mismatch"));

    // The chunk was not recorded, but the task is intact and retryable
    let status = store.status("task").await.unwrap();
    assert!(status.exists);
    assert!(status.uploaded_chunks.is_empty());

    store
        .write_chunk("task", 0, b"payload", Some(&md5_hex(b"payload")))
        .await
        .unwrap();
    assert_eq!(store.status("task").await.unwrap().uploaded_chunks, vec![0]);
}

#[tokio::test]
async fn test_checksum_mismatch_destroys_task() {
    let (_dir, store) = store();
    store.init("task", 1, "a.bin", "test", false).await.unwrap();
    store.write_chunk("task", 0, b"payload", None).await.unwrap();

    let err = store
        .complete("task", Some(&sha256_hex(b"different")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));

    assert!(!store.status("task").await.unwrap().exists);
}

#[tokio::test]
async fn test_cancel_removes_task() {
    let (_dir, store) = store();
    store.init("task", 2, "a.bin", "test", false).await.unwrap();
    store.write_chunk("task", 0, b"zero", None).await.unwrap();

    assert!(store.remove("task").await.unwrap());
    assert!(!store.status("task").await.unwrap().exists);
    // Cancelling again is a no-op
    assert!(!store.remove("task").await.unwrap());
}

#[tokio::test]
async fn test_init_rejects_total_chunk_mismatch() {
    let (_dir, store) = store();
    store.init("task", 3, "a.bin", "test", false).await.unwrap();

    let err = store.init("task", 5, "a.bin", "test", false).await.unwrap_err();
    assert!(err.to_string().contains("initialised with 3 chunks"));
}

#[tokio::test]
async fn test_sweep_removes_stale_tasks_only() {
    let (_dir, store) = store();
    store.init("stale", 1, "a.bin", "test", false).await.unwrap();
    store.init("fresh", 1, "b.bin", "test", false).await.unwrap();

    // Nothing is older than a day
    assert_eq!(store.sweep(Duration::from_secs(86_400)).await.unwrap(), 0);

    // With a zero threshold every idle task is stale
    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = store.sweep(Duration::ZERO).await.unwrap();
    assert_eq!(removed, 2);
    assert!(!store.status("stale").await.unwrap().exists);
    assert!(!store.status("fresh").await.unwrap().exists);
}

#[tokio::test]
async fn test_status_recomputes_without_metadata() {
    let (_dir, store) = store();
    store.init("task", 2, "a.bin", "test", false).await.unwrap();
    store.write_chunk("task", 1, b"one", None).await.unwrap();

    // Simulate a lost metadata file
    std::fs::remove_file(store.root().join("task").join("metadata.json")).unwrap();

    let status = store.status("task").await.unwrap();
    assert!(status.exists);
    assert_eq!(status.uploaded_chunks, vec![1]);
    assert_eq!(status.total_chunks, None);
}
