//! Wire protocol support
//!
//! RTSP framing and headers, the ANNOUNCE SDP dialect, DMAP tagged metadata
//! and the RSA operations behind the RAOP handshake.

/// RAOP RSA key operations
pub mod crypto;
/// DMAP tagged-stream decoding
pub mod dmap;
/// RTSP message types, codec, authentication
pub mod rtsp;
/// ANNOUNCE SDP parsing
pub mod sdp;
