//! External collaborator traits
//!
//! The control plane drives, but does not contain, the audio player and the
//! RTP transport; service discovery and out-of-process metadata bridges are
//! equally external. These traits are the seams. Implementations must be
//! cheap to call from the request path — anything expensive belongs on the
//! far side of the trait.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::receiver::session::StreamConfig;

/// The local UDP ports allocated for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTriple {
    /// Audio data port
    pub audio: u16,
    /// Control (sync/retransmit) port
    pub control: u16,
    /// Timing port
    pub timing: u16,
}

/// The audio player: decoder, jitter buffer, mixer, output.
#[async_trait]
pub trait Player: Send + Sync {
    /// Start playback for the stream described by `stream`.
    async fn play(&self, connection_number: u64, stream: &StreamConfig);

    /// Discard buffered audio up to (not including) `rtptime`.
    async fn flush(&self, rtptime: u32);

    /// Stop playback and release player resources.
    async fn stop(&self);

    /// Apply an AirPlay volume (0.0 down to -30.0; -144.0 is mute).
    async fn set_volume(&self, airplay_volume: f32);
}

/// The RTP audio/control/timing transport.
#[async_trait]
pub trait RtpTransport: Send + Sync {
    /// Called when a conversation starts, before any session exists.
    async fn initialise(&self, connection_number: u64);

    /// Allocate the local UDP port triple for a session.
    ///
    /// `remote_control_port` and `remote_timing_port` are the sender's ports
    /// from the SETUP Transport header.
    ///
    /// # Errors
    /// Returns an error when the ports cannot be allocated; SETUP then fails
    /// with 451 and the session slot is released.
    async fn setup(
        &self,
        connection_number: u64,
        local: SocketAddr,
        remote: SocketAddr,
        remote_control_port: u16,
        remote_timing_port: u16,
    ) -> io::Result<PortTriple>;

    /// Tear down whatever `setup` allocated for this connection.
    async fn terminate(&self, connection_number: u64);

    /// Return the port allocator to its low watermark.
    ///
    /// Called when a session acquires the player without interrupting
    /// another one.
    fn reset_port_range(&self);
}

/// Service discovery registration.
#[async_trait]
pub trait ServiceAdvertiser: Send + Sync {
    /// Advertise the service; called once the listener is bound.
    ///
    /// # Errors
    /// Returns a description of the failure; the receiver treats this as
    /// fatal at startup.
    async fn register(&self, name: &str, port: u16) -> Result<(), String>;

    /// Withdraw the advertisement; called at shutdown.
    async fn unregister(&self);
}

/// An out-of-process metadata bridge (for example an MQTT publisher).
///
/// Receives every published metadata tuple from its own queue consumer.
#[async_trait]
pub trait MetadataHandler: Send + Sync {
    /// Handle one metadata tuple.
    async fn handle(&self, mtype: u32, code: u32, payload: &[u8]);
}
