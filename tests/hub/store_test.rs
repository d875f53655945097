//! Tests for `src/store.rs` — atomic JSON snapshot persistence.

use std::collections::HashMap;

use straylight::store::{load_snapshot, write_snapshot};

#[tokio::test]
async fn snapshot_roundtrips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");

    let mut value: HashMap<String, u64> = HashMap::new();
    value.insert("alpha".to_owned(), 1);
    value.insert("beta".to_owned(), 2);

    write_snapshot(&value, &path).await.expect("write");
    let loaded: HashMap<String, u64> = load_snapshot(&path).expect("load");
    assert_eq!(loaded, value);
}

#[tokio::test]
async fn missing_file_loads_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let loaded: Vec<String> = load_snapshot(&dir.path().join("absent.json")).expect("load");
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn write_leaves_no_temp_file_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");

    write_snapshot(&vec!["a".to_owned()], &path).await.expect("write");

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["state.json"], "tmp file must be renamed away");
}

#[tokio::test]
async fn rewrite_replaces_previous_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");

    write_snapshot(&vec![1u32, 2, 3], &path).await.expect("first write");
    write_snapshot(&vec![9u32], &path).await.expect("second write");

    let loaded: Vec<u32> = load_snapshot(&path).expect("load");
    assert_eq!(loaded, [9]);
}

#[tokio::test]
async fn corrupt_snapshot_is_an_error_not_a_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"{ not json").expect("write garbage");

    let result: anyhow::Result<Vec<String>> = load_snapshot(&path);
    assert!(result.is_err(), "corruption must surface, not silently reset");
}
