//! Test doubles for the collaborator traits
//!
//! Used by this crate's own tests; exported because applications embedding
//! the receiver need the same stand-ins in theirs.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::player::{MetadataHandler, Player, PortTriple, RtpTransport, ServiceAdvertiser};
use crate::receiver::session::StreamConfig;

/// A player that ignores everything.
pub struct NullPlayer;

#[async_trait]
impl Player for NullPlayer {
    async fn play(&self, _connection_number: u64, _stream: &StreamConfig) {}
    async fn flush(&self, _rtptime: u32) {}
    async fn stop(&self) {}
    async fn set_volume(&self, _airplay_volume: f32) {}
}

/// A transport that hands out a fixed port triple without binding anything.
pub struct NullTransport;

#[async_trait]
impl RtpTransport for NullTransport {
    async fn initialise(&self, _connection_number: u64) {}

    async fn setup(
        &self,
        _connection_number: u64,
        _local: SocketAddr,
        _remote: SocketAddr,
        _remote_control_port: u16,
        _remote_timing_port: u16,
    ) -> io::Result<PortTriple> {
        Ok(PortTriple {
            audio: 6000,
            control: 6001,
            timing: 6002,
        })
    }

    async fn terminate(&self, _connection_number: u64) {}

    fn reset_port_range(&self) {}
}

/// What a [`RecordingPlayer`] saw.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// `play` was called for a connection
    Play(u64),
    /// `flush` was called with this rtptime
    Flush(u32),
    /// `stop` was called
    Stop,
    /// `set_volume` was called
    Volume(f32),
}

/// A player that records every call.
#[derive(Default)]
pub struct RecordingPlayer {
    events: Mutex<Vec<PlayerEvent>>,
}

impl RecordingPlayer {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: PlayerEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

#[async_trait]
impl Player for RecordingPlayer {
    async fn play(&self, connection_number: u64, _stream: &StreamConfig) {
        self.record(PlayerEvent::Play(connection_number));
    }

    async fn flush(&self, rtptime: u32) {
        self.record(PlayerEvent::Flush(rtptime));
    }

    async fn stop(&self) {
        self.record(PlayerEvent::Stop);
    }

    async fn set_volume(&self, airplay_volume: f32) {
        self.record(PlayerEvent::Volume(airplay_volume));
    }
}

/// A transport that counts calls and hands out configurable ports.
pub struct FixedPortTransport {
    /// The triple returned from `setup`
    pub ports: PortTriple,
    setup_calls: AtomicUsize,
    resets: AtomicUsize,
}

impl FixedPortTransport {
    /// Create with the given port triple.
    #[must_use]
    pub fn new(ports: PortTriple) -> Self {
        Self {
            ports,
            setup_calls: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    /// Number of `setup` calls so far.
    #[must_use]
    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    /// Number of `reset_port_range` calls so far.
    #[must_use]
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtpTransport for FixedPortTransport {
    async fn initialise(&self, _connection_number: u64) {}

    async fn setup(
        &self,
        _connection_number: u64,
        _local: SocketAddr,
        _remote: SocketAddr,
        _remote_control_port: u16,
        _remote_timing_port: u16,
    ) -> io::Result<PortTriple> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ports)
    }

    async fn terminate(&self, _connection_number: u64) {}

    fn reset_port_range(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// An advertiser that accepts registration silently.
pub struct NullAdvertiser;

#[async_trait]
impl ServiceAdvertiser for NullAdvertiser {
    async fn register(&self, _name: &str, _port: u16) -> Result<(), String> {
        Ok(())
    }

    async fn unregister(&self) {}
}

/// A metadata handler that records the tuples it receives.
#[derive(Default)]
pub struct RecordingMetadataHandler {
    tuples: Mutex<Vec<(u32, u32, Vec<u8>)>>,
}

impl RecordingMetadataHandler {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn tuples(&self) -> Vec<(u32, u32, Vec<u8>)> {
        self.tuples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MetadataHandler for RecordingMetadataHandler {
    async fn handle(&self, mtype: u32, code: u32, payload: &[u8]) {
        self.tuples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((mtype, code, payload.to_vec()));
    }
}
