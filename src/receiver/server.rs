//! RTSP listener loop
//!
//! Binds IPv4 and IPv6 sockets, accepts connections, spawns one conversation
//! worker per accept and reaps finished workers. Shutdown cancels every
//! worker and withdraws the service advertisement.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::RaopError;
use crate::metadata::{MetadataPipeline, MetadataSubscription};
use crate::player::{MetadataHandler, Player, RtpTransport, ServiceAdvertiser};

use super::config::ReceiverConfig;
use super::connection::{self, ConnHandle};
use super::slot::SessionSlot;

/// Listen backlog.
const BACKLOG: i32 = 5;

/// Everything a conversation worker needs, shared across connections.
#[derive(Clone)]
pub(crate) struct ReceiverContext {
    pub config: Arc<ReceiverConfig>,
    pub slot: Arc<SessionSlot>,
    pub player: Arc<dyn Player>,
    pub rtp: Arc<dyn RtpTransport>,
    pub metadata: MetadataPipeline,
    pub airplay_volume: Arc<RwLock<f32>>,
}

struct RunningState {
    shutdown: Arc<Notify>,
    accept_task: JoinHandle<()>,
    pipeline: MetadataPipeline,
    port: u16,
}

/// The RAOP receiver: listener, session arbitration, metadata fan-out.
pub struct RaopReceiver {
    config: ReceiverConfig,
    player: Arc<dyn Player>,
    rtp: Arc<dyn RtpTransport>,
    advertiser: Option<Arc<dyn ServiceAdvertiser>>,
    metadata_handler: Option<Arc<dyn MetadataHandler>>,
    running: Option<RunningState>,
}

impl RaopReceiver {
    /// Create a receiver around the external player and RTP transport.
    #[must_use]
    pub fn new(config: ReceiverConfig, player: Arc<dyn Player>, rtp: Arc<dyn RtpTransport>) -> Self {
        Self {
            config,
            player,
            rtp,
            advertiser: None,
            metadata_handler: None,
            running: None,
        }
    }

    /// Attach a service advertiser (mDNS registration).
    #[must_use]
    pub fn with_advertiser(mut self, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    /// Attach an external metadata handler (for example an MQTT bridge).
    #[must_use]
    pub fn with_metadata_handler(mut self, handler: Arc<dyn MetadataHandler>) -> Self {
        self.metadata_handler = Some(handler);
        self
    }

    /// Start listening. Returns the bound port.
    ///
    /// # Errors
    /// Returns [`RaopError::AlreadyRunning`] when started twice,
    /// [`RaopError::BindFailed`] when neither address family binds, and
    /// [`RaopError::Advertisement`] when the advertiser refuses.
    pub async fn start(&mut self) -> Result<u16, RaopError> {
        if self.running.is_some() {
            return Err(RaopError::AlreadyRunning);
        }

        let mut listeners = Vec::new();

        let v4_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let mut port = self.config.port;
        match bind_listener(v4_addr) {
            Ok(listener) => {
                port = listener.local_addr()?.port();
                listeners.push(listener);
            }
            Err(e) => {
                tracing::debug!("unable to listen on IPv4 port {}: {e}", self.config.port);
            }
        }

        let v6_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        match bind_listener(v6_addr) {
            Ok(listener) => {
                port = listener.local_addr()?.port();
                listeners.push(listener);
            }
            Err(e) => {
                tracing::debug!("unable to listen on IPv6 port {port}: {e}");
            }
        }

        if listeners.is_empty() {
            return Err(RaopError::BindFailed {
                port: self.config.port,
            });
        }

        if let Some(advertiser) = &self.advertiser {
            advertiser
                .register(&self.config.name, port)
                .await
                .map_err(RaopError::Advertisement)?;
        }

        let pipeline =
            MetadataPipeline::start(&self.config.metadata, self.metadata_handler.clone());

        let ctx = ReceiverContext {
            config: Arc::new(self.config.clone()),
            slot: Arc::new(SessionSlot::new()),
            player: self.player.clone(),
            rtp: self.rtp.clone(),
            metadata: pipeline.clone(),
            airplay_volume: Arc::new(RwLock::new(self.config.initial_volume)),
        };

        let shutdown = Arc::new(Notify::new());
        let accept_task = tokio::spawn(accept_loop(
            listeners,
            ctx,
            shutdown.clone(),
            self.advertiser.clone(),
        ));

        tracing::debug!("listening for RTSP connections on port {port}");
        self.running = Some(RunningState {
            shutdown,
            accept_task,
            pipeline,
            port,
        });
        Ok(port)
    }

    /// The bound port, when running.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    /// Subscribe to the in-process metadata hub. `None` before `start`.
    #[must_use]
    pub fn subscribe(&self) -> Option<MetadataSubscription> {
        self.running.as_ref().map(|r| r.pipeline.subscribe())
    }

    /// Stop listening, cancel every worker and shut the fan-out down.
    pub async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            // notify_one stores a permit in case the accept loop is busy
            running.shutdown.notify_one();
            let _ = running.accept_task.await;
            running.pipeline.shutdown();
        }
    }
}

/// Bind one listening socket with the RTSP socket options.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // avoid double-binding the v4 port through the v6 socket
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_any(listeners: &[TcpListener]) -> io::Result<(TcpStream, SocketAddr)> {
    match listeners {
        [only] => only.accept().await,
        [first, second] => tokio::select! {
            result = first.accept() => result,
            result = second.accept() => result,
        },
        _ => std::future::pending().await,
    }
}

async fn accept_loop(
    listeners: Vec<TcpListener>,
    ctx: ReceiverContext,
    shutdown: Arc<Notify>,
    advertiser: Option<Arc<dyn ServiceAdvertiser>>,
) {
    let mut workers: Vec<(Arc<ConnHandle>, JoinHandle<()>)> = Vec::new();
    let mut next_connection_number: u64 = 1;

    loop {
        tokio::select! {
            result = accept_any(&listeners) => {
                // reap workers that have finished since the last accept
                workers.retain(|(_, task)| !task.is_finished());

                match result {
                    Ok((stream, _remote)) => {
                        let handle = Arc::new(ConnHandle::new(next_connection_number));
                        next_connection_number += 1;
                        handle.set_running(true);
                        let task = tokio::spawn(connection::run(
                            stream,
                            handle.clone(),
                            ctx.clone(),
                        ));
                        workers.push((handle, task));
                    }
                    Err(e) => {
                        tracing::debug!("connection not accepted: {e}");
                    }
                }
            }
            () = shutdown.notified() => break,
        }
    }

    for (handle, _) in &workers {
        tracing::debug!("connection {}: cancelling", handle.number());
        handle.request_stop();
    }
    for (handle, task) in workers {
        let _ = task.await;
        tracing::debug!("connection {}: joined", handle.number());
    }

    if let Some(advertiser) = advertiser {
        advertiser.unregister().await;
    }
}
