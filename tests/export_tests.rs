//! Resumable export against the SQLite directory.

use std::collections::HashSet;

use wrasse::directory::{Job, ResultStream, SqliteDirectory};
use wrasse::worker::export_stream;

#[tokio::test]
async fn sqlite_export_is_complete_for_any_page_size() {
    let tmp = tempfile::tempdir().unwrap();
    let keys: Vec<String> = (0..37).map(|i| format!("/U1/stor/obj-{:03}", i)).collect();

    for page_size in [1, 2, 5, 36, 37, 100] {
        let directory = SqliteDirectory::open_in_memory()
            .unwrap()
            .with_page_size(page_size);
        directory
            .insert_job(Job::new("J1", "U1", "U1").done())
            .await
            .unwrap();
        directory
            .append_records("J1", ResultStream::Inputs, keys.clone())
            .await
            .unwrap();

        let path = tmp.path().join(format!("in-{}.txt", page_size));
        let summary = export_stream(&directory, "J1", ResultStream::Inputs, &path, 3)
            .await
            .unwrap();
        assert_eq!(summary.lines, 37, "page size {}", page_size);

        let written: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        let unique: HashSet<&String> = written.iter().collect();
        assert_eq!(unique.len(), written.len());
        assert_eq!(written, keys);
    }
}

#[tokio::test]
async fn sqlite_export_of_empty_stream_writes_empty_file() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = SqliteDirectory::open_in_memory().unwrap();
    directory
        .insert_job(Job::new("J1", "U1", "U1").done())
        .await
        .unwrap();

    let path = tmp.path().join("err.txt");
    let summary = export_stream(&directory, "J1", ResultStream::Errors, &path, 3)
        .await
        .unwrap();
    assert_eq!(summary.lines, 0);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
}
