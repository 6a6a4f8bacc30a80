//! The RTSP receiver
//!
//! [`RaopReceiver`] ties the pieces together: the listener loop, one
//! conversation worker per connection, the process-wide session slot and the
//! metadata fan-out.

/// Receiver configuration
pub mod config;
/// Conversation worker and connection handles
pub mod connection;
pub(crate) mod handlers;
/// Listener loop and receiver facade
pub mod server;
/// Per-connection stream state
pub mod session;
/// Session admission slot
pub mod slot;

pub use config::{MetadataConfig, ReceiverConfig};
pub use connection::ConnHandle;
pub use server::RaopReceiver;
pub use slot::{AcquireOutcome, SessionSlot};
