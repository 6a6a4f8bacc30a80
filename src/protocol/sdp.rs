//! ANNOUNCE SDP parsing
//!
//! The SDP body of an ANNOUNCE describes the audio stream: codec, optional
//! AES encryption material and advisory latency bounds. The parser is
//! line-oriented and tolerant; unknown attributes are ignored, and line
//! terminators follow the same relaxed rules as the RTSP codec.

/// The rtpmap line announcing 16-bit stereo PCM at 44.1 kHz.
const RTPMAP_PCM: &str = "a=rtpmap:96 L16/44100/2";

/// Attributes of interest pulled from an ANNOUNCE body.
#[derive(Debug, Clone, Default)]
pub struct AnnounceDescription {
    /// Synchronisation source identifier from `o=iTunes <sid> ...`
    pub session_id: Option<u32>,
    /// `a=rtpmap:96 L16/44100/2` seen: stream is uncompressed CD audio
    pub uncompressed_audio: bool,
    /// Raw value after `a=fmtp:`, present for Apple Lossless streams
    pub fmtp: Option<String>,
    /// Base64 AES IV from `a=aesiv:`
    pub aes_iv: Option<String>,
    /// Base64 RSA-encrypted AES key from `a=rsaaeskey:`
    pub rsa_aes_key: Option<String>,
    /// Advisory minimum latency in frames
    pub min_latency: Option<u32>,
    /// Advisory maximum latency in frames
    pub max_latency: Option<u32>,
}

/// Split text on any of `\r`, `\n` or `\r\n`, skipping blank lines.
pub(crate) fn tolerant_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\r', '\n']).filter(|line| !line.is_empty())
}

impl AnnounceDescription {
    /// Parse an ANNOUNCE body.
    ///
    /// Never fails: missing or unparseable attributes simply stay unset and
    /// the caller decides whether the result describes a usable stream.
    #[must_use]
    pub fn parse(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let mut desc = Self::default();

        for line in tolerant_lines(&text) {
            if line.starts_with(RTPMAP_PCM) {
                desc.uncompressed_audio = true;
            } else if let Some(rest) = line.strip_prefix("o=iTunes") {
                desc.session_id = rest.split_whitespace().next().and_then(|s| s.parse().ok());
            } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
                desc.fmtp = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("a=aesiv:") {
                desc.aes_iv = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("a=rsaaeskey:") {
                desc.rsa_aes_key = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("a=min-latency:") {
                desc.min_latency = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("a=max-latency:") {
                desc.max_latency = rest.trim().parse().ok();
            }
        }

        desc
    }

    /// Whether the sender asked for an encrypted session.
    #[must_use]
    pub fn encrypted(&self) -> bool {
        self.aes_iv.is_some() || self.rsa_aes_key.is_some()
    }
}
