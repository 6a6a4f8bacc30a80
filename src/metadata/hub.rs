//! In-process metadata hub
//!
//! Re-publishes every package onto a broadcast channel so any number of
//! in-process consumers can follow along. Like every other sink it sits
//! behind its own bounded queue; a subscriber that falls behind loses the
//! oldest broadcast items, never slowing the publisher.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{MetadataPackage, SinkReceiver};

/// A live subscription to the metadata hub.
#[derive(Debug)]
pub struct MetadataSubscription {
    rx: broadcast::Receiver<MetadataPackage>,
}

impl MetadataSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<MetadataPackage>) -> Self {
        Self { rx }
    }

    /// Wait for the next package.
    ///
    /// Lagged subscribers skip ahead; `None` means the pipeline shut down.
    pub async fn recv(&mut self) -> Option<MetadataPackage> {
        loop {
            match self.rx.recv().await {
                Ok(package) => return Some(package),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!("metadata hub subscriber lagged, skipped {missed} items");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Consumer loop for the hub sink.
pub(crate) async fn run(mut rx: SinkReceiver, tx: broadcast::Sender<MetadataPackage>) {
    while let Some(package) = rx.take().await {
        // no subscribers is fine
        let _ = tx.send(package);
    }
}
