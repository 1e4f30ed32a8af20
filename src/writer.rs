//! Serialized CSV writer.
//!
//! Every write goes through one background task, so a destination file is
//! only ever opened by a single task and concurrent callers never interleave
//! partial rows. Callers still see a synchronous `write` because each
//! request carries a oneshot channel for its result.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::traits::PipelineError;

/// Default number of requests the writer queue holds before `write` waits.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A type that can be persisted as one CSV row.
pub trait CsvRow {
    /// Column names, written once per destination.
    fn header() -> &'static [&'static str];

    /// Field values in header order.
    fn to_row(&self) -> Vec<String>;
}

/// How a batch is applied to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Append rows; the header is written only by the first non-empty batch.
    AppendWithHeaderTracking,

    /// Truncate the destination, then behave as a first append.
    Replace,
}

struct WriteRequest<T> {
    rows: Vec<T>,
    destination: PathBuf,
    mode: WriteMode,
    respond: oneshot::Sender<Result<(), PipelineError>>,
}

/// Per-destination "header already written" flags.
///
/// Kept in memory only; the filesystem is never probed for a header.
#[derive(Debug, Default)]
struct HeaderTable {
    written: Mutex<HashMap<PathBuf, bool>>,
}

impl HeaderTable {
    fn get(&self, destination: &Path) -> bool {
        let written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        written.get(destination).copied().unwrap_or(false)
    }

    fn set(&self, destination: &Path, value: bool) {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        written.insert(destination.to_path_buf(), value);
    }
}

/// Single-consumer persistence queue for rows of type `T`.
pub struct CsvWriter<T> {
    queue: Mutex<Option<mpsc::Sender<WriteRequest<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    headers: Arc<HeaderTable>,
}

impl<T> CsvWriter<T>
where
    T: CsvRow + Send + 'static,
{
    /// Starts the background writer task. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let headers = Arc::new(HeaderTable::default());
        let worker = tokio::spawn(drain_requests(rx, Arc::clone(&headers)));

        Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            headers,
        }
    }

    /// Writes `rows` to `destination` and waits until the batch is on disk.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Shutdown`] if the writer was closed
    /// - [`PipelineError::Write`] if the directory, file or rows could not be written
    pub async fn write(
        &self,
        rows: Vec<T>,
        destination: impl Into<PathBuf>,
        mode: WriteMode,
    ) -> Result<(), PipelineError> {
        let sender = {
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.clone().ok_or_else(PipelineError::writer_shutting_down)?
        };

        let (respond, response) = oneshot::channel();
        let request = WriteRequest {
            rows,
            destination: destination.into(),
            mode,
            respond,
        };

        sender
            .send(request)
            .await
            .map_err(|_| PipelineError::writer_shutting_down())?;
        drop(sender);

        response
            .await
            .map_err(|_| PipelineError::writer_shutting_down())?
    }

    pub async fn append(
        &self,
        rows: Vec<T>,
        destination: impl Into<PathBuf>,
    ) -> Result<(), PipelineError> {
        self.write(rows, destination, WriteMode::AppendWithHeaderTracking)
            .await
    }

    pub async fn replace(
        &self,
        rows: Vec<T>,
        destination: impl Into<PathBuf>,
    ) -> Result<(), PipelineError> {
        self.write(rows, destination, WriteMode::Replace).await
    }

    /// Stops accepting requests and waits for every accepted one to finish.
    ///
    /// Later calls are no-ops.
    pub async fn close(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "CSV writer task ended abnormally");
            }
            debug!("CSV writer closed");
        }
    }

    /// Whether a header has been written to `destination` by this writer.
    pub fn has_header(&self, destination: &Path) -> bool {
        self.headers.get(destination)
    }
}

impl<T> Default for CsvWriter<T>
where
    T: CsvRow + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_requests<T>(mut rx: mpsc::Receiver<WriteRequest<T>>, headers: Arc<HeaderTable>)
where
    T: CsvRow + Send + 'static,
{
    while let Some(request) = rx.recv().await {
        let WriteRequest {
            rows,
            destination,
            mode,
            respond,
        } = request;
        let headers = Arc::clone(&headers);
        let target = destination.clone();

        let result = tokio::task::spawn_blocking(move || {
            write_rows(&headers, &rows, &destination, mode)
        })
        .await
        .unwrap_or_else(|e| Err(PipelineError::Write(format!("Task join error: {}", e))));

        match &result {
            Ok(()) => debug!(path = %target.display(), ?mode, "batch written"),
            Err(e) => warn!(path = %target.display(), error = %e, "batch write failed"),
        }
        // The caller may have gone away; the batch is on disk either way.
        let _ = respond.send(result);
    }
}

fn write_rows<T: CsvRow>(
    headers: &HeaderTable,
    rows: &[T],
    destination: &Path,
    mode: WriteMode,
) -> Result<(), PipelineError> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            PipelineError::Write(format!(
                "creating output directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut has_header = headers.get(destination);
    let opened = if mode == WriteMode::AppendWithHeaderTracking && has_header {
        OpenOptions::new().append(true).open(destination)
    } else {
        if mode == WriteMode::Replace {
            headers.set(destination, false);
            has_header = false;
        }
        File::create(destination)
    };
    let file = opened.map_err(|e| {
        PipelineError::Write(format!("opening CSV file {}: {}", destination.display(), e))
    })?;

    let mut writer = csv::Writer::from_writer(file);
    let write_header = !has_header && !rows.is_empty();

    if write_header {
        writer
            .write_record(T::header())
            .map_err(|e| PipelineError::Write(format!("writing CSV header: {}", e)))?;
    }
    for row in rows {
        writer
            .write_record(row.to_row())
            .map_err(|e| PipelineError::Write(format!("writing CSV record: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::Write(format!("flushing CSV file: {}", e)))?;

    if write_header {
        headers.set(destination, true);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContactRecord;

    fn record(filename: &str, name: &str) -> ContactRecord {
        ContactRecord {
            filename: filename.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .expect("open csv");
        reader
            .records()
            .map(|r| r.expect("csv record").iter().map(str::to_string).collect())
            .collect()
    }

    #[tokio::test]
    async fn test_append_mode_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("append_test.csv");
        let writer = CsvWriter::new();

        let first = ContactRecord {
            filename: "test1.jpg".to_string(),
            name: "John Doe".to_string(),
            email: "john@example.com".to_string(),
            phone: "1234567890".to_string(),
            tags: vec!["tag1".to_string(), "tag2".to_string()],
            text: "Test text 1".to_string(),
        };
        writer.append(vec![first], &output).await.unwrap();
        writer
            .append(vec![record("test2.jpg", "Jane Smith")], &output)
            .await
            .unwrap();
        writer.close().await;

        let rows = read_rows(&output);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ContactRecord::header());
        assert_eq!(rows[1][0], "test1.jpg");
        assert_eq!(rows[1][4], "tag1; tag2");
        assert_eq!(rows[2][0], "test2.jpg");
    }

    #[tokio::test]
    async fn test_replace_mode_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("replace_test.csv");
        let writer = CsvWriter::new();

        writer.append(vec![record("a.jpg", "A")], &output).await.unwrap();
        writer.append(vec![record("b.jpg", "B")], &output).await.unwrap();
        writer.replace(vec![record("c.jpg", "C")], &output).await.unwrap();
        writer.close().await;

        let rows = read_rows(&output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "Filename");
        assert_eq!(rows[1][0], "c.jpg");
    }

    #[tokio::test]
    async fn test_empty_first_write_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("empty_test.csv");
        let writer: CsvWriter<ContactRecord> = CsvWriter::new();

        writer.append(vec![], &output).await.unwrap();
        assert!(!writer.has_header(&output));
        writer.close().await;

        if output.exists() {
            assert!(read_rows(&output).is_empty());
        }
    }

    #[tokio::test]
    async fn test_header_follows_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("late_header.csv");
        let writer = CsvWriter::new();

        writer.append(vec![], &output).await.unwrap();
        writer.append(vec![record("x.png", "X")], &output).await.unwrap();
        assert!(writer.has_header(&output));
        writer.close().await;

        let rows = read_rows(&output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "Filename");
    }

    #[tokio::test]
    async fn test_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/deeper/out.csv");
        let writer = CsvWriter::new();

        writer.append(vec![record("a.jpg", "A")], &output).await.unwrap();
        writer.close().await;

        assert_eq!(read_rows(&output).len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_path_is_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        let writer = CsvWriter::new();

        let err = writer
            .append(vec![record("a.jpg", "A")], blocker.join("out.csv"))
            .await
            .unwrap_err();
        writer.close().await;

        assert!(matches!(err, PipelineError::Write(_)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvWriter::new();
        writer.close().await;
        writer.close().await;

        let err = writer
            .append(vec![record("a.jpg", "A")], dir.path().join("late.csv"))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::writer_shutting_down());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batches_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("concurrent_test.csv");
        let writer = Arc::new(CsvWriter::new());

        let mut tasks = tokio::task::JoinSet::new();
        for id in 0..8 {
            let writer = Arc::clone(&writer);
            let output = output.clone();
            tasks.spawn(async move {
                let batch = (0..3)
                    .map(|row| record(&format!("batch_{}.jpg", id), &format!("row {}", row)))
                    .collect();
                writer.append(batch, output).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        writer.close().await;

        let rows = read_rows(&output);
        assert_eq!(rows.len(), 1 + 8 * 3);
        assert_eq!(rows[0][0], "Filename");
        for chunk in rows[1..].chunks(3) {
            assert!(chunk.iter().all(|row| row[0] == chunk[0][0]));
            let names: Vec<&str> = chunk.iter().map(|row| row[1].as_str()).collect();
            assert_eq!(names, ["row 0", "row 1", "row 2"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_keeps_accepted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("shutdown.csv");
        let writer = Arc::new(CsvWriter::new());

        let mut tasks = tokio::task::JoinSet::new();
        for id in 0..16 {
            let writer = Arc::clone(&writer);
            let output = output.clone();
            tasks.spawn(async move {
                writer
                    .append(vec![record(&format!("{}.jpg", id), "n")], output)
                    .await
            });
        }
        writer.close().await;

        let mut accepted = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(()) => accepted += 1,
                Err(e) => assert_eq!(e, PipelineError::writer_shutting_down()),
            }
        }

        let data_rows = if output.exists() {
            read_rows(&output).len().saturating_sub(1)
        } else {
            0
        };
        assert_eq!(data_rows, accepted);
    }
}
