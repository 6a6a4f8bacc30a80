//! Per-connection stream state
//!
//! What a successful ANNOUNCE establishes: the codec surface the player
//! needs, plus the session's encryption material when the sender asked for
//! an encrypted stream.

use crate::protocol::crypto::RaopKey;
use crate::protocol::sdp::AnnounceDescription;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Audio stream kinds the receiver can process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// 16-bit stereo PCM at 44.1 kHz
    UncompressedPcm,
    /// Apple Lossless
    AppleLossless,
}

/// Session encryption material recovered from the ANNOUNCE
#[derive(Clone, PartialEq, Eq)]
pub struct StreamEncryption {
    /// AES initialisation vector
    pub aes_iv: [u8; 16],
    /// AES session key, RSA-recovered
    pub aes_key: [u8; 16],
}

impl std::fmt::Debug for StreamEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // keys stay out of logs
        f.write_str("StreamEncryption(..)")
    }
}

/// fmtp defaults for an Apple Lossless stream.
const ALAC_FMTP_DEFAULTS: [u32; 12] = [96, 352, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44100];

/// Codec parameters negotiated by ANNOUNCE
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Codec of the stream
    pub kind: StreamKind,
    /// The twelve fmtp integers (defaults for PCM streams)
    pub fmtp: [u32; 12],
    /// Encryption material, when the session is encrypted
    pub encryption: Option<StreamEncryption>,
    /// Audio frames per RTP packet
    pub max_frames_per_packet: u32,
    /// Sample rate
    pub input_rate: u32,
    /// Channel count
    pub input_num_channels: u32,
    /// Bits per sample
    pub input_bit_depth: u32,
    /// Bytes per audio frame, derived
    pub input_bytes_per_frame: u32,
    /// Sender's advisory minimum latency in frames
    pub minimum_latency: Option<u32>,
    /// Sender's advisory maximum latency in frames
    pub maximum_latency: Option<u32>,
}

/// Why an ANNOUNCE could not be turned into a playable stream
#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    /// Neither PCM nor ALAC was announced
    #[error("unknown or unsupported stream type")]
    UnknownCodec,

    /// `a=aesiv:` was missing or did not decode to 16 bytes
    #[error("announced aesiv of {0} bytes, wanted 16")]
    BadIv(usize),

    /// `a=rsaaeskey:` was missing, undecodable, or did not recover 16 bytes
    #[error("announced rsaaeskey recovered {0} bytes, wanted 16")]
    BadKey(usize),

    /// Encrypted session announced but no RSA key is configured
    #[error("encrypted session announced but no AirPlay key is configured")]
    NoKey,
}

impl StreamConfig {
    /// Build the stream configuration from a parsed ANNOUNCE.
    ///
    /// # Errors
    /// Returns [`AnnounceError`] when the description does not name a codec
    /// the receiver supports or its encryption material is unusable. Every
    /// failure maps to RTSP 456.
    pub fn from_announce(
        desc: &AnnounceDescription,
        key: Option<&RaopKey>,
    ) -> Result<Self, AnnounceError> {
        let encryption = if desc.encrypted() {
            Some(Self::recover_encryption(desc, key)?)
        } else {
            None
        };

        let (kind, fmtp) = if let Some(raw) = &desc.fmtp {
            let mut fmtp = ALAC_FMTP_DEFAULTS;
            for (slot, field) in fmtp.iter_mut().zip(raw.split_ascii_whitespace()) {
                if let Ok(v) = field.parse() {
                    *slot = v;
                }
            }
            (StreamKind::AppleLossless, fmtp)
        } else if desc.uncompressed_audio {
            (StreamKind::UncompressedPcm, ALAC_FMTP_DEFAULTS)
        } else {
            return Err(AnnounceError::UnknownCodec);
        };

        let (max_frames_per_packet, input_rate, input_num_channels, input_bit_depth) = match kind {
            StreamKind::UncompressedPcm => (352, 44100, 2, 16),
            StreamKind::AppleLossless => (fmtp[1], fmtp[11], fmtp[7], fmtp[3]),
        };

        Ok(Self {
            kind,
            fmtp,
            encryption,
            max_frames_per_packet,
            input_rate,
            input_num_channels,
            input_bit_depth,
            input_bytes_per_frame: input_num_channels * input_bit_depth.div_ceil(8),
            minimum_latency: desc.min_latency,
            maximum_latency: desc.max_latency,
        })
    }

    fn recover_encryption(
        desc: &AnnounceDescription,
        key: Option<&RaopKey>,
    ) -> Result<StreamEncryption, AnnounceError> {
        let iv_b64 = desc.aes_iv.as_deref().ok_or(AnnounceError::BadIv(0))?;
        let key_b64 = desc.rsa_aes_key.as_deref().ok_or(AnnounceError::BadKey(0))?;
        let key = key.ok_or(AnnounceError::NoKey)?;

        let iv = BASE64
            .decode(iv_b64)
            .map_err(|_| AnnounceError::BadIv(0))?;
        let iv_len = iv.len();
        let aes_iv: [u8; 16] = iv.try_into().map_err(|_| AnnounceError::BadIv(iv_len))?;

        let wrapped = BASE64
            .decode(key_b64)
            .map_err(|_| AnnounceError::BadKey(0))?;
        let recovered = key
            .decrypt_key(&wrapped)
            .map_err(|_| AnnounceError::BadKey(0))?;
        let recovered_len = recovered.len();
        let aes_key: [u8; 16] = recovered
            .try_into()
            .map_err(|_| AnnounceError::BadKey(recovered_len))?;

        Ok(StreamEncryption { aes_iv, aes_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::Pkcs1v15Encrypt;

    fn pcm_desc() -> AnnounceDescription {
        AnnounceDescription::parse(b"o=iTunes 1 0\r\na=rtpmap:96 L16/44100/2\r\n")
    }

    #[test]
    fn test_pcm_parameters() {
        let config = StreamConfig::from_announce(&pcm_desc(), None).unwrap();
        assert_eq!(config.kind, StreamKind::UncompressedPcm);
        assert_eq!(config.max_frames_per_packet, 352);
        assert_eq!(config.input_rate, 44100);
        assert_eq!(config.input_num_channels, 2);
        assert_eq!(config.input_bit_depth, 16);
        assert_eq!(config.input_bytes_per_frame, 4);
        assert!(config.encryption.is_none());
    }

    #[test]
    fn test_alac_parameters_from_fmtp() {
        let desc = AnnounceDescription::parse(
            b"a=fmtp:96 352 0 16 40 10 14 2 255 0 0 44100\r\n",
        );
        let config = StreamConfig::from_announce(&desc, None).unwrap();
        assert_eq!(config.kind, StreamKind::AppleLossless);
        assert_eq!(config.fmtp[0], 96);
        assert_eq!(config.max_frames_per_packet, 352);
        assert_eq!(config.input_rate, 44100);
        assert_eq!(config.input_num_channels, 2);
        assert_eq!(config.input_bit_depth, 16);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let desc = AnnounceDescription::parse(b"a=rtpmap:97 mpeg4-generic/44100/2\r\n");
        assert!(matches!(
            StreamConfig::from_announce(&desc, None),
            Err(AnnounceError::UnknownCodec)
        ));
    }

    #[test]
    fn test_encrypted_session_round_trip() {
        let raop_key = RaopKey::generate().unwrap();
        let mut rng = rand::rngs::OsRng;

        let aes_key = [9u8; 16];
        let aes_iv: [u8; 16] = core::array::from_fn(|i| u8::try_from(i).unwrap());
        let wrapped = raop_key
            .public_key()
            .encrypt(&mut rng, Pkcs1v15Encrypt, &aes_key)
            .unwrap();

        let sdp = format!(
            "a=rtpmap:96 L16/44100/2\r\na=aesiv:{}\r\na=rsaaeskey:{}\r\n",
            BASE64.encode(aes_iv),
            BASE64.encode(&wrapped),
        );
        let desc = AnnounceDescription::parse(sdp.as_bytes());
        let config = StreamConfig::from_announce(&desc, Some(&raop_key)).unwrap();

        let enc = config.encryption.unwrap();
        assert_eq!(enc.aes_iv, aes_iv);
        assert_eq!(enc.aes_key, aes_key);
    }

    #[test]
    fn test_short_iv_rejected() {
        let raop_key = RaopKey::generate().unwrap();
        let sdp = format!(
            "a=rtpmap:96 L16/44100/2\r\na=aesiv:{}\r\na=rsaaeskey:{}\r\n",
            BASE64.encode([0u8; 8]),
            BASE64.encode([0u8; 16]),
        );
        let desc = AnnounceDescription::parse(sdp.as_bytes());
        assert!(matches!(
            StreamConfig::from_announce(&desc, Some(&raop_key)),
            Err(AnnounceError::BadIv(8))
        ));
    }

    #[test]
    fn test_encrypted_without_key_rejected() {
        let sdp = "a=rtpmap:96 L16/44100/2\r\na=aesiv:AAAA\r\na=rsaaeskey:AAAA\r\n";
        let desc = AnnounceDescription::parse(sdp.as_bytes());
        assert!(matches!(
            StreamConfig::from_announce(&desc, None),
            Err(AnnounceError::NoKey)
        ));
    }
}
