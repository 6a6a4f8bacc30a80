//! HTTP Digest authentication over MD5
//!
//! Enabled only when a password is configured. The nonce is chosen per
//! connection, lazily, on the first 401. A connection that authenticates once
//! stays authorized for its lifetime.

use md5::{Digest, Md5};
use rand::RngCore;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::message::RtspMessage;
use super::status;

/// Realm announced in the `WWW-Authenticate` challenge.
pub const REALM: &str = "raop";

/// Generate a fresh nonce: 8 bytes from the system entropy source, base64.
#[must_use]
pub fn make_nonce() -> String {
    let mut random = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut random);
    BASE64.encode(random)
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compute the expected Digest response for the given credentials.
///
/// `HA1 = MD5(username:realm:password)`, `HA2 = MD5(method:uri)`,
/// response `= MD5(hex(HA1):nonce:hex(HA2))`, all lowercase hex.
#[must_use]
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&[
        username.as_bytes(),
        b":",
        realm.as_bytes(),
        b":",
        password.as_bytes(),
    ]);
    let ha2 = md5_hex(&[method.as_bytes(), b":", uri.as_bytes()]);
    md5_hex(&[
        ha1.as_bytes(),
        b":",
        nonce.as_bytes(),
        b":",
        ha2.as_bytes(),
    ])
}

/// Pull a `key="value"` field out of an Authorization header.
fn quoted_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = header.find(key)?;
    let rest = &header[start + key.len()..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Authenticate one request.
///
/// Returns `true` when the request may proceed. Otherwise the response is
/// turned into a 401 carrying a `WWW-Authenticate` challenge, creating the
/// per-connection nonce if it does not exist yet.
pub fn check_authorization(
    password: Option<&str>,
    nonce: &mut Option<String>,
    req: &RtspMessage,
    resp: &mut RtspMessage,
) -> bool {
    let Some(password) = password else {
        return true;
    };

    let authorized = match nonce {
        None => {
            *nonce = Some(make_nonce());
            false
        }
        Some(nonce) => verify_request(password, nonce, req),
    };

    if !authorized {
        resp.respcode = status::UNAUTHORIZED;
        if let Some(nonce) = nonce {
            resp.headers.add(
                "WWW-Authenticate",
                format!("Digest realm=\"{REALM}\", nonce=\"{nonce}\""),
            );
        }
    }
    authorized
}

fn verify_request(password: &str, nonce: &str, req: &RtspMessage) -> bool {
    let Some(header) = req.headers.get("Authorization") else {
        return false;
    };
    let Some(fields) = header.strip_prefix("Digest ") else {
        return false;
    };

    let (Some(realm), Some(username), Some(response), Some(uri)) = (
        quoted_field(fields, "realm="),
        quoted_field(fields, "username="),
        quoted_field(fields, "response="),
        quoted_field(fields, "uri="),
    ) else {
        return false;
    };

    let method = req.method.as_deref().unwrap_or("");
    let expected = digest_response(username, realm, password, method, uri, nonce);
    if expected == response {
        true
    } else {
        tracing::warn!("password authorization failed");
        false
    }
}
