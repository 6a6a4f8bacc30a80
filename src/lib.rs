//! # raop
//!
//! The RTSP control-plane core of an AirPlay 1 (RAOP) audio receiver.
//!
//! This crate accepts RTSP/1.0 connections from AirPlay senders, negotiates
//! an audio session (codec parameters, encryption keys, UDP port triples) and
//! drives the lifecycle of a single active playback session: announce, setup,
//! record, flush, pause, teardown. It arbitrates which connection owns the
//! player, optionally pre-empting a running session, and fans metadata out to
//! independent sink queues without ever blocking the request path.
//!
//! The audio player, the RTP transport and service discovery are external
//! collaborators, reached through the traits in [`player`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use raop::receiver::{RaopReceiver, ReceiverConfig};
//! use raop::testing::{NullPlayer, NullTransport};
//!
//! # async fn example() -> Result<(), raop::RaopError> {
//! let config = ReceiverConfig::with_name("Kitchen Speaker");
//! let mut receiver = RaopReceiver::new(config, Arc::new(NullPlayer), Arc::new(NullTransport));
//! let port = receiver.start().await?;
//! println!("listening on {port}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Error types
pub mod error;
/// Metadata fan-out and sinks
pub mod metadata;
/// External collaborator traits
pub mod player;
/// Wire protocol: RTSP framing, SDP, DMAP, crypto
pub mod protocol;
/// RTSP listener, conversation workers and method handlers
pub mod receiver;
/// Test doubles for the collaborator traits
pub mod testing;

pub use error::RaopError;
pub use receiver::{RaopReceiver, ReceiverConfig};
