//! Apple-Challenge / Apple-Response handshake
//!
//! Any request may carry `Apple-Challenge:`; the response to that request
//! must then carry `Apple-Response:`, proving possession of the AirPlay
//! private key. The signed buffer is challenge || server IP || MAC address,
//! zero-padded to at least 32 bytes.

use std::net::IpAddr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::protocol::crypto::RaopKey;

/// Maximum accepted challenge size after base64 decoding.
const MAX_CHALLENGE_LEN: usize = 16;

/// Minimum size of the buffer handed to RSA.
const MIN_SIGNED_LEN: usize = 32;

/// Senders often omit base64 padding; restore it before decoding.
fn decode_unpadded(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim().trim_end_matches('=');
    let mut padded = trimmed.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    BASE64.decode(padded).ok()
}

/// Compute the `Apple-Response` value for a challenge header.
///
/// Returns `None` — and the response simply goes out without the header —
/// when the challenge is oversized or unintelligible, or when signing fails.
#[must_use]
pub fn apple_response(
    key: &RaopKey,
    challenge: &str,
    local_ip: IpAddr,
    hw_addr: &[u8; 6],
) -> Option<String> {
    let Some(chall) = decode_unpadded(challenge) else {
        tracing::warn!("undecodable Apple-Challenge");
        return None;
    };
    if chall.len() > MAX_CHALLENGE_LEN {
        tracing::warn!("oversized Apple-Challenge!");
        return None;
    }

    let mut buf = Vec::with_capacity(MIN_SIGNED_LEN);
    buf.extend_from_slice(&chall);
    match local_ip {
        IpAddr::V4(addr) => buf.extend_from_slice(&addr.octets()),
        IpAddr::V6(addr) => buf.extend_from_slice(&addr.octets()),
    }
    buf.extend_from_slice(hw_addr);
    while buf.len() < MIN_SIGNED_LEN {
        buf.push(0);
    }

    let signed = match key.sign_raw(&buf) {
        Ok(signed) => signed,
        Err(e) => {
            tracing::warn!("could not sign Apple-Challenge: {e}");
            return None;
        }
    };

    let encoded = BASE64.encode(signed);
    Some(encoded.trim_end_matches('=').to_string())
}
