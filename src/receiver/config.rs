//! Receiver configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::crypto::RaopKey;

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Device name shown to senders
    pub name: String,

    /// RTSP listen port (0 = auto-assign)
    pub port: u16,

    /// Optional password; enables Digest authentication
    pub password: Option<String>,

    /// Let a new sender pre-empt a playing session
    pub allow_session_interruption: bool,

    /// Idle timeout enforced by the per-connection watchdog; `None` disables
    pub idle_timeout: Option<Duration>,

    /// Delay between body-phase reads; pacing for small senders
    pub body_pacing: Duration,

    /// MAC address signed into Apple-Challenge responses
    pub hw_addr: [u8; 6],

    /// Private key for the challenge handshake and encrypted sessions
    pub airplay_key: Option<Arc<RaopKey>>,

    /// Command run when a play session cannot be cancelled
    pub unfixable_command: Option<String>,

    /// Starting AirPlay volume
    pub initial_volume: f32,

    /// Metadata fan-out settings
    pub metadata: MetadataConfig,
}

/// Metadata sink configuration
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Master switch for the pipe and UDP sinks
    pub enabled: bool,

    /// Path of the named pipe, if the pipe sink is wanted
    pub pipe_name: Option<PathBuf>,

    /// Target address of the UDP sink, if wanted
    pub socket_address: Option<SocketAddr>,

    /// Maximum UDP datagram size; larger payloads are chunked
    pub socket_msg_length: usize,

    /// Forward cover art; senders push pictures whether asked or not
    pub include_cover_art: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            name: "RAOP Receiver".to_string(),
            port: 5000,
            password: None,
            allow_session_interruption: false,
            idle_timeout: Some(Duration::from_secs(120)),
            body_pacing: Duration::from_millis(80),
            hw_addr: [0; 6],
            airplay_key: None,
            unfixable_command: None,
            initial_volume: 0.0,
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pipe_name: None,
            socket_address: None,
            socket_msg_length: 500,
            include_cover_art: true,
        }
    }
}

impl ReceiverConfig {
    /// Create with a custom device name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the listen port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Require a password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Allow a second sender to take over a playing session.
    #[must_use]
    pub fn allow_session_interruption(mut self, allow: bool) -> Self {
        self.allow_session_interruption = allow;
        self
    }

    /// Set or disable the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the RSA key used for the challenge handshake and key recovery.
    #[must_use]
    pub fn airplay_key(mut self, key: Arc<RaopKey>) -> Self {
        self.airplay_key = Some(key);
        self
    }

    /// Set the advertised MAC address.
    #[must_use]
    pub fn hw_addr(mut self, hw_addr: [u8; 6]) -> Self {
        self.hw_addr = hw_addr;
        self
    }

    /// Configure metadata sinks.
    #[must_use]
    pub fn metadata(mut self, metadata: MetadataConfig) -> Self {
        self.metadata = metadata;
        self
    }
}
