//! Queued background delivery.
//!
//! One bounded channel, one consumer task. Enqueueing never blocks the
//! pipeline: when the queue is full the run is dropped with a warning.
//! Delivery failures are logged and swallowed; the pipeline never sees them.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pipelens_types::PipelineRun;

use crate::client::RunTransport;

pub struct BackgroundSender {
    tx: mpsc::Sender<PipelineRun>,
    worker: JoinHandle<()>,
}

impl BackgroundSender {
    /// Start the consumer task. Must be called from within a tokio runtime.
    pub fn spawn(transport: Arc<dyn RunTransport>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<PipelineRun>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(run) = rx.recv().await {
                match transport.deliver(&run).await {
                    Ok(response) => {
                        log::debug!("[QUEUE] Delivered run {}", response.run_id);
                    }
                    Err(e) => {
                        log::warn!(
                            "[QUEUE] Dropping run {} after failed delivery: {}",
                            run.run_id,
                            e
                        );
                    }
                }
            }
            log::debug!("[QUEUE] Channel closed, worker exiting");
        });

        Self { tx, worker }
    }

    /// Hand a finished run to the worker without waiting.
    pub fn enqueue(&self, run: PipelineRun) {
        match self.tx.try_send(run) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(run)) => {
                log::warn!("[QUEUE] Queue full, dropping run {}", run.run_id);
            }
            Err(mpsc::error::TrySendError::Closed(run)) => {
                log::warn!("[QUEUE] Queue closed, dropping run {}", run.run_id);
            }
        }
    }

    /// Stop accepting runs, drain whatever is queued, and wait for the
    /// worker to finish.
    pub async fn close(self) {
        let Self { tx, worker } = self;
        drop(tx);
        if let Err(e) = worker.await {
            log::warn!("[QUEUE] Worker task did not shut down cleanly: {}", e);
        }
    }
}
