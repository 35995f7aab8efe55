//! In-process queue over bounded channels.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{JobQueue, QueueError};
use crate::scheduler::job::{AnalyzeJob, AnalyzeResult};

/// Default capacity of each channel.
pub const DEFAULT_CAPACITY: usize = 10;

/// Queue connecting commander and workers inside one process.
///
/// Publishing waits while a channel is full, which throttles the
/// commander's fan-out to the speed of the workers.
pub struct MemoryQueue {
    jobs_tx: StdMutex<Option<mpsc::Sender<AnalyzeJob>>>,
    jobs_rx: Mutex<mpsc::Receiver<AnalyzeJob>>,
    results_tx: StdMutex<Option<mpsc::Sender<AnalyzeResult>>>,
    results_rx: Mutex<mpsc::Receiver<AnalyzeResult>>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel(capacity.max(1));
        Self {
            jobs_tx: StdMutex::new(Some(jobs_tx)),
            jobs_rx: Mutex::new(jobs_rx),
            results_tx: StdMutex::new(Some(results_tx)),
            results_rx: Mutex::new(results_rx),
        }
    }

    fn sender<T>(slot: &StdMutex<Option<mpsc::Sender<T>>>) -> Result<mpsc::Sender<T>, QueueError> {
        slot.lock()
            .map_err(|_| QueueError::Closed)?
            .as_ref()
            .cloned()
            .ok_or(QueueError::Closed)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish_job(&self, job: &AnalyzeJob) -> Result<(), QueueError> {
        let tx = Self::sender(&self.jobs_tx)?;
        tx.send(job.clone()).await.map_err(|_| QueueError::Closed)?;
        debug!(job = %job.spec, "Job published");
        Ok(())
    }

    async fn next_job(&self) -> Option<AnalyzeJob> {
        self.jobs_rx.lock().await.recv().await
    }

    async fn publish_result(&self, result: &AnalyzeResult) -> Result<(), QueueError> {
        let tx = Self::sender(&self.results_tx)?;
        tx.send(result.clone()).await.map_err(|_| QueueError::Closed)
    }

    async fn next_result(&self) -> Option<AnalyzeResult> {
        self.results_rx.lock().await.recv().await
    }

    async fn close(&self) {
        // Dropping the senders lets receivers drain what is buffered and
        // then observe the end of the stream.
        if let Ok(mut tx) = self.jobs_tx.lock() {
            tx.take();
        }
        if let Ok(mut tx) = self.results_tx.lock() {
            tx.take();
        }
    }
}
