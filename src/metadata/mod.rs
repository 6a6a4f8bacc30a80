//! Metadata fan-out
//!
//! Everything the control plane learns about the playing stream — track
//! metadata relayed from the sender, cover art, progress, session events —
//! is published once and fanned out into a bounded queue per sink. Each sink
//! has its own consumer task, so one slow reader never delays another and
//! never delays the RTSP request path; a full queue drops the item.
//!
//! Two four-character codes identify each piece of data: the type is `core`
//! for DMAP tags relayed from the sender and `ssnc` for events generated by
//! the receiver itself, and the code names the item within the type.

mod hub;
mod multicast;
mod pipe;
mod queue;

pub use hub::MetadataSubscription;
pub use queue::{OfferError, SINK_QUEUE_CAPACITY, SinkQueue, SinkReceiver, sink_queue};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::player::MetadataHandler;
use crate::protocol::rtsp::SharedMessage;
use crate::receiver::config::MetadataConfig;

/// Event type and code constants
pub mod codes {
    /// Convert a four-character code to its numeric form.
    #[must_use]
    pub const fn fourcc(code: &[u8; 4]) -> u32 {
        u32::from_be_bytes(*code)
    }

    /// DMAP metadata relayed from the sender
    pub const TYPE_CORE: u32 = fourcc(b"core");
    /// Events generated by the receiver itself
    pub const TYPE_SSNC: u32 = fourcc(b"ssnc");

    /// Source transmission has stalled
    pub const STALLED: u32 = fourcc(b"stal");
    /// Play-progress string (start/current/end RTP timestamps)
    pub const PROGRESS: u32 = fourcc(b"prgr");
    /// Sender's Active-Remote token
    pub const ACTIVE_REMOTE: u32 = fourcc(b"acre");
    /// Sender's DACP-ID
    pub const DACP_ID: u32 = fourcc(b"daid");
    /// Sender's device name (X-Apple-Client-Name)
    pub const CLIENT_NAME: u32 = fourcc(b"snam");
    /// Sender's User-Agent string
    pub const USER_AGENT: u32 = fourcc(b"snua");
    /// A metadata batch is about to start
    pub const METADATA_START: u32 = fourcc(b"mdst");
    /// A metadata batch has ended
    pub const METADATA_END: u32 = fourcc(b"mden");
    /// A picture is about to be sent
    pub const PICTURE_START: u32 = fourcc(b"pcst");
    /// A picture has been sent
    pub const PICTURE_END: u32 = fourcc(b"pcen");
    /// Cover art payload (JPEG or PNG; check the first bytes)
    pub const PICTURE: u32 = fourcc(b"PICT");
}

/// One published metadata item.
///
/// When `carrier` is set, the package keeps the originating RTSP message
/// alive until every consumer has finished with it; dropping the package
/// releases the retain. Packages without a carrier own their data outright.
#[derive(Debug, Clone)]
pub struct MetadataPackage {
    /// Type code (`core` or `ssnc`)
    pub mtype: u32,
    /// Item code within the type
    pub code: u32,
    /// Payload bytes; may be empty
    pub data: Bytes,
    /// Message retained for the lifetime of the package
    pub carrier: Option<SharedMessage>,
}

/// Handle to the running fan-out.
///
/// Cheap to clone; publishing never blocks.
#[derive(Debug, Clone)]
pub struct MetadataPipeline {
    inner: Arc<PipelineInner>,
}

#[derive(Debug)]
struct PipelineInner {
    sinks: Vec<SinkQueue>,
    hub_tx: broadcast::Sender<MetadataPackage>,
    workers: Vec<JoinHandle<()>>,
}

impl MetadataPipeline {
    /// Start the fan-out: one queue and one consumer task per enabled sink.
    ///
    /// The in-process hub is always on. The pipe and multicast sinks run
    /// when metadata is enabled and configured; the external handler sink
    /// runs when a handler is supplied.
    #[must_use]
    pub fn start(config: &MetadataConfig, handler: Option<Arc<dyn MetadataHandler>>) -> Self {
        let mut sinks = Vec::new();
        let mut workers = Vec::new();

        let (hub_tx, _) = broadcast::channel(64);
        let (hub_queue, hub_rx) = sink_queue("hub");
        workers.push(tokio::spawn(hub::run(hub_rx, hub_tx.clone())));
        sinks.push(hub_queue);

        if config.enabled {
            if let Some(path) = &config.pipe_name {
                let (q, rx) = sink_queue("pipe");
                workers.push(tokio::spawn(pipe::run(rx, path.clone())));
                sinks.push(q);
            }
            if let Some(addr) = config.socket_address {
                let (q, rx) = sink_queue("multicast");
                workers.push(tokio::spawn(multicast::run(rx, addr, config.socket_msg_length)));
                sinks.push(q);
            }
        }

        if let Some(handler) = handler {
            let (q, rx) = sink_queue("handler");
            workers.push(tokio::spawn(handler_sink(rx, handler)));
            sinks.push(q);
        }

        Self {
            inner: Arc::new(PipelineInner {
                sinks,
                hub_tx,
                workers,
            }),
        }
    }

    /// A pipeline with no sinks at all, for connections that publish into
    /// the void (tests, metadata disabled end to end).
    #[must_use]
    pub fn disabled() -> Self {
        let (hub_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(PipelineInner {
                sinks: Vec::new(),
                hub_tx,
                workers: Vec::new(),
            }),
        }
    }

    /// Subscribe to the in-process hub.
    #[must_use]
    pub fn subscribe(&self) -> MetadataSubscription {
        MetadataSubscription::new(self.inner.hub_tx.subscribe())
    }

    /// Publish one item into every sink queue.
    ///
    /// The payload is captured once; each sink receives a clone. When
    /// `carrier` is given it is retained per sink for the lifetime of that
    /// sink's package. Full queues drop silently (logged at debug).
    pub fn publish(&self, mtype: u32, code: u32, data: &[u8], carrier: Option<&SharedMessage>) {
        let data = Bytes::copy_from_slice(data);
        for sink in &self.inner.sinks {
            let package = MetadataPackage {
                mtype,
                code,
                data: data.clone(),
                carrier: carrier.cloned(),
            };
            // drop-newest: a rejected package simply falls out of scope here,
            // releasing its carrier retain
            let _ = sink.offer(package);
        }
    }

    /// Publish an `ssnc` event.
    pub fn publish_ssnc(&self, code: u32, data: &[u8], carrier: Option<&SharedMessage>) {
        self.publish(codes::TYPE_SSNC, code, data, carrier);
    }

    /// Stop every sink worker. Queued items are discarded.
    pub fn shutdown(&self) {
        for worker in &self.inner.workers {
            worker.abort();
        }
    }
}

/// Consumer loop for the external handler sink.
async fn handler_sink(mut rx: SinkReceiver, handler: Arc<dyn MetadataHandler>) {
    while let Some(package) = rx.take().await {
        handler
            .handle(package.mtype, package.code, &package.data)
            .await;
    }
}
