//! RTSP Transport header parsing
//!
//! SETUP requests carry the sender's UDP ports:
//! `RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port=6001;timing_port=6002`

/// Parsed Transport header from a SETUP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Sender's control port
    pub control_port: u16,
    /// Sender's timing port
    pub timing_port: u16,
}

impl TransportHeader {
    /// Parse a Transport header value.
    ///
    /// Only `control_port` and `timing_port` matter to the control plane;
    /// unknown parameters are ignored.
    ///
    /// # Errors
    /// Returns [`TransportParseError`] when either port is missing or not a
    /// number.
    pub fn parse(value: &str) -> Result<Self, TransportParseError> {
        let mut control_port = None;
        let mut timing_port = None;

        for part in value.split(';') {
            let part = part.trim();
            if let Some(v) = part.strip_prefix("control_port=") {
                control_port = Some(v.parse().map_err(|_| TransportParseError::InvalidPort)?);
            } else if let Some(v) = part.strip_prefix("timing_port=") {
                timing_port = Some(v.parse().map_err(|_| TransportParseError::InvalidPort)?);
            }
        }

        Ok(Self {
            control_port: control_port.ok_or(TransportParseError::MissingControlPort)?,
            timing_port: timing_port.ok_or(TransportParseError::MissingTimingPort)?,
        })
    }
}

/// Build the Transport header for a successful SETUP response.
#[must_use]
pub fn response_transport(control_port: u16, timing_port: u16, server_port: u16) -> String {
    format!(
        "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;\
         control_port={control_port};timing_port={timing_port};server_port={server_port}"
    )
}

/// Transport header parse failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportParseError {
    /// No `control_port=` parameter
    #[error("Transport header does not specify a control_port")]
    MissingControlPort,

    /// No `timing_port=` parameter
    #[error("Transport header does not specify a timing_port")]
    MissingTimingPort,

    /// A port value was not a number
    #[error("invalid port number in Transport header")]
    InvalidPort,
}
