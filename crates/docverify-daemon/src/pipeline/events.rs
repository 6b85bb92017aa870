//! Typed progress channel from a pipeline to its dispatcher.

use tokio::sync::mpsc;
use tracing::debug;

use crate::progress::ProgressUpdate;

/// Sending half owned by one pipeline run. Dropping it closes the channel.
#[derive(Debug)]
pub struct ProgressEmitter {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressEmitter {
    /// Create a bounded channel of `capacity` updates.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send an update, waiting for room. A closed receiver is ignored.
    pub async fn emit(&self, update: ProgressUpdate) {
        if self.tx.send(update).await.is_err() {
            debug!("Progress receiver closed, update discarded");
        }
    }
}
