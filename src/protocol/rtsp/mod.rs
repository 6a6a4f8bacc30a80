//! RTSP/1.0 protocol support for the RAOP control channel
//!
//! AirPlay 1 senders speak plain-text RTSP: one request per frame, bodies
//! delimited by `Content-Length`. The dialect has a few quirks that are
//! deliberately preserved here, most visibly the status line: senders expect
//! `OK` for 200 and the literal word `Unauthorized` for every other status.

mod challenge;
mod codec;
mod digest;
mod message;
mod transport;

pub use challenge::apple_response;
pub use codec::{ParseError, RequestParser, encode_response};
pub use digest::{check_authorization, digest_response, make_nonce};
pub use message::{Headers, RtspMessage, SharedMessage, header_field};
pub use transport::{TransportHeader, TransportParseError, response_transport};

use std::str::FromStr;

/// Server identification sent on every response.
pub const SERVER_IDENT: &str = "AirTunes/105.1";

/// RTSP methods understood by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Capability query
    Options,
    /// Session announcement (SDP body)
    Announce,
    /// Transport negotiation
    Setup,
    /// Start playback
    Record,
    /// Pause playback
    Pause,
    /// Flush buffered audio
    Flush,
    /// End the session
    Teardown,
    /// Parameter query (volume, keep-alive)
    GetParameter,
    /// Parameter update (volume, metadata, artwork)
    SetParameter,
}

impl Method {
    /// Canonical wire spelling
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Announce => "ANNOUNCE",
            Self::Setup => "SETUP",
            Self::Record => "RECORD",
            Self::Pause => "PAUSE",
            Self::Flush => "FLUSH",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIONS" => Ok(Self::Options),
            "ANNOUNCE" => Ok(Self::Announce),
            "SETUP" => Ok(Self::Setup),
            "RECORD" => Ok(Self::Record),
            "PAUSE" => Ok(Self::Pause),
            "FLUSH" => Ok(Self::Flush),
            "TEARDOWN" => Ok(Self::Teardown),
            "GET_PARAMETER" => Ok(Self::GetParameter),
            "SET_PARAMETER" => Ok(Self::SetParameter),
            _ => Err(()),
        }
    }
}

/// RTSP status codes used by the control plane
pub mod status {
    /// Request handled
    pub const OK: u16 = 200;
    /// Default response code before a handler runs
    pub const BAD_REQUEST: u16 = 400;
    /// Digest authentication required or failed
    pub const UNAUTHORIZED: u16 = 401;
    /// Session verb received by a connection that does not own the player
    pub const NO_PLAYER: u16 = 451;
    /// Another connection owns the player and would not yield
    pub const SESSION_BUSY: u16 = 453;
    /// ANNOUNCE carried a codec the receiver cannot process
    pub const UNSUPPORTED_STREAM: u16 = 456;
}

/// Reason phrase for the response status line.
///
/// Only 200 gets `OK`; everything else is spelled `Unauthorized`, matching
/// what AirPlay senders expect on the wire.
#[must_use]
pub fn reason_phrase(code: u16) -> &'static str {
    if code == status::OK { "OK" } else { "Unauthorized" }
}
