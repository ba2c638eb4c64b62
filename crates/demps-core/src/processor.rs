//! Serialized, per-file processing of simulator output.
//!
//! A [`FileProcessor`] owns a FIFO of file paths and a single worker task
//! that pulls from it, so at most one file is being read at any instant
//! no matter how many paths are pushed concurrently. Each file is read
//! line by line through a [`LineTransform`], and once it is fully
//! consumed the concatenated records are sent downstream as one
//! [`Aggregation`]. The simulator writes each file once and closes it,
//! so by the time a file is reported it is normally complete.
//!
//! Read errors are logged and skipped; they never stop the queue.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::layout::LineTransform;
use crate::pool::Closeable;

/// The transformed content of one fully read file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    /// Dataset name of the processor that produced it.
    pub dataset: String,
    /// The file that was read.
    pub path: PathBuf,
    /// Concatenated records.
    pub payload: String,
    /// Number of records in `payload`.
    pub records: usize,
}

/// A FIFO of files drained by one worker task.
pub struct FileProcessor {
    dataset: String,
    queue: Mutex<Option<mpsc::UnboundedSender<PathBuf>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    backlog: Arc<AtomicUsize>,
}

impl FileProcessor {
    /// Start a processor for `dataset` that sends one [`Aggregation`] per
    /// pushed file to `output`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: LineTransform>(
        dataset: impl Into<String>,
        transform: Arc<T>,
        output: mpsc::UnboundedSender<Aggregation>,
    ) -> Self {
        let dataset = dataset.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(drain_queue(
            dataset.clone(),
            rx,
            transform,
            output,
            Arc::clone(&backlog),
        ));

        Self {
            dataset,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            backlog,
        }
    }

    /// Dataset name this processor was started for.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Queue `path` for processing.
    ///
    /// Processing starts immediately when the worker is idle; otherwise
    /// the path waits behind the ones pushed before it. Returns `false`
    /// once the processor has been finished or closed.
    pub fn push(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = queue.as_ref() else {
            debug!(dataset = %self.dataset, path = %path.display(), "Processor closed, dropping path");
            return false;
        };
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if tx.send(path).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Number of files pushed but not yet fully processed.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Stop accepting paths. Already queued files are still processed,
    /// after which the worker exits and drops its output sender.
    pub fn finish(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Wait until the worker has exited, either after [`finish`] drained
    /// the queue or after [`close`](Closeable::close).
    ///
    /// [`finish`]: Self::finish
    pub async fn join(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
            && !e.is_cancelled()
        {
            warn!(dataset = %self.dataset, error = %e, "File processor worker failed");
        }
    }
}

impl Closeable for FileProcessor {
    /// Stop accepting paths and abort the worker, discarding the queue.
    fn close(&self) {
        self.finish();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            worker.abort();
        }
    }
}

impl Drop for FileProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for FileProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileProcessor")
            .field("dataset", &self.dataset)
            .field("backlog", &self.backlog())
            .finish_non_exhaustive()
    }
}

/// Worker loop: one file at a time, in push order.
async fn drain_queue<T: LineTransform>(
    dataset: String,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    transform: Arc<T>,
    output: mpsc::UnboundedSender<Aggregation>,
    backlog: Arc<AtomicUsize>,
) {
    while let Some(path) = rx.recv().await {
        let result = aggregate_file(&path, transform.as_ref()).await;
        backlog.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok((payload, records)) => {
                debug!(dataset = %dataset, path = %path.display(), records, "File aggregated");
                let aggregation = Aggregation {
                    dataset: dataset.clone(),
                    path,
                    payload,
                    records,
                };
                if output.send(aggregation).is_err() {
                    debug!(dataset = %dataset, "Aggregation receiver gone, stopping processor");
                    return;
                }
            }
            Err(e) => {
                warn!(dataset = %dataset, path = %path.display(), error = %e, "Failed to read output file");
            }
        }
    }
    debug!(dataset = %dataset, "File processor drained");
}

/// Read `path` to the end, returning the concatenated records and their
/// count.
pub async fn aggregate_file<T: LineTransform + ?Sized>(
    path: &Path,
    transform: &T,
) -> std::io::Result<(String, usize)> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut payload = String::new();
    let mut records: usize = 0;
    let mut is_first_line = true;

    while let Some(line) = lines.next_line().await? {
        if let Some(record) = transform.apply(&line, is_first_line) {
            payload.push_str(&record);
            records = records.saturating_add(1);
        }
        is_first_line = false;
    }

    Ok((payload, records))
}
