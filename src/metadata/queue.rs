//! Bounded per-sink queue
//!
//! Every metadata sink gets its own queue so a slow consumer can never stall
//! the request path: publishing to a full queue drops the item instead of
//! waiting. Consumers block until an item arrives; dropping either end at a
//! suspension point leaves nothing locked and nothing half-consumed.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::MetadataPackage;

/// Items each sink may have in flight before drops begin.
pub const SINK_QUEUE_CAPACITY: usize = 500;

/// Create a bounded queue for one sink.
#[must_use]
pub fn sink_queue(name: &'static str) -> (SinkQueue, SinkReceiver) {
    let (tx, rx) = mpsc::channel(SINK_QUEUE_CAPACITY);
    (SinkQueue { name, tx }, SinkReceiver { rx })
}

/// Producer half of a sink queue.
#[derive(Debug, Clone)]
pub struct SinkQueue {
    name: &'static str,
    tx: mpsc::Sender<MetadataPackage>,
}

/// Why an offered package was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    /// The queue is full; the package was dropped
    Full,
    /// The consumer is gone; the package was dropped
    Closed,
}

impl SinkQueue {
    /// Sink name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Offer a package without waiting.
    ///
    /// A full queue rejects the package — the caller's clone is dropped,
    /// releasing its carrier retain or its data copy.
    ///
    /// # Errors
    /// Returns [`OfferError`] when the package was dropped.
    pub fn offer(&self, package: MetadataPackage) -> Result<(), OfferError> {
        match self.tx.try_send(package) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                match dropped.carrier {
                    Some(ref carrier) => tracing::debug!(
                        "metadata queue \"{}\" full, dropping message item: type {:x}, code {:x}, \
                         length {}, message {}",
                        self.name,
                        dropped.mtype,
                        dropped.code,
                        dropped.data.len(),
                        carrier.index_number
                    ),
                    None => tracing::debug!(
                        "metadata queue \"{}\" full, dropping data item: type {:x}, code {:x}, \
                         length {}",
                        self.name,
                        dropped.mtype,
                        dropped.code,
                        dropped.data.len()
                    ),
                }
                Err(OfferError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(OfferError::Closed),
        }
    }
}

/// Consumer half of a sink queue.
#[derive(Debug)]
pub struct SinkReceiver {
    rx: mpsc::Receiver<MetadataPackage>,
}

impl SinkReceiver {
    /// Wait for the next package. `None` means every producer is gone.
    pub async fn take(&mut self) -> Option<MetadataPackage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rtsp::{RtspMessage, SharedMessage};
    use bytes::Bytes;
    use std::sync::Arc;

    fn package(carrier: Option<SharedMessage>) -> MetadataPackage {
        MetadataPackage {
            mtype: u32::from_be_bytes(*b"ssnc"),
            code: u32::from_be_bytes(*b"test"),
            data: Bytes::from_static(b"payload"),
            carrier,
        }
    }

    #[tokio::test]
    async fn test_offer_take_round_trip() {
        let (q, mut rx) = sink_queue("pipe");
        q.offer(package(None)).unwrap();
        let got = rx.take().await.unwrap();
        assert_eq!(got.data, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let (q, _rx) = sink_queue("pipe");
        for _ in 0..SINK_QUEUE_CAPACITY {
            q.offer(package(None)).unwrap();
        }
        assert_eq!(q.offer(package(None)), Err(OfferError::Full));
    }

    #[tokio::test]
    async fn test_dropped_package_releases_carrier() {
        let carrier = SharedMessage::new(RtspMessage::new());
        let (q, _rx) = sink_queue("pipe");
        for _ in 0..SINK_QUEUE_CAPACITY {
            q.offer(package(None)).unwrap();
        }
        assert_eq!(Arc::strong_count(&carrier), 1);
        let result = q.offer(package(Some(carrier.clone())));
        assert_eq!(result, Err(OfferError::Full));
        // the rejected clone is gone; only our handle remains
        assert_eq!(Arc::strong_count(&carrier), 1);
    }

    #[tokio::test]
    async fn test_drained_packages_release_carrier() {
        let carrier = SharedMessage::new(RtspMessage::new());
        let (q, mut rx) = sink_queue("pipe");
        q.offer(package(Some(carrier.clone()))).unwrap();
        q.offer(package(Some(carrier.clone()))).unwrap();
        assert_eq!(Arc::strong_count(&carrier), 3);
        drop(rx.take().await);
        drop(rx.take().await);
        assert_eq!(Arc::strong_count(&carrier), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_rejects() {
        let (q, rx) = sink_queue("pipe");
        drop(rx);
        assert_eq!(q.offer(package(None)), Err(OfferError::Closed));
    }
}
