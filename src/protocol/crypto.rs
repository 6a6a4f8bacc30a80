//! RAOP RSA key operations
//!
//! The RAOP handshake uses one 1024-bit RSA key two ways: `ANNOUNCE` carries
//! the session AES key encrypted to it (PKCS#1 v1.5), and `Apple-Challenge`
//! asks for a raw PKCS#1 v1.5 signature over a short buffer. The key itself
//! is supplied by the embedding application.

use std::fmt;

use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

/// Modulus size of the AirPlay key
const MODULUS_BITS: usize = 1024;

/// The receiver's RSA private key
#[derive(Clone)]
pub struct RaopKey {
    inner: RsaPrivateKey,
}

impl RaopKey {
    /// Load from a PKCS#8 PEM-encoded private key.
    ///
    /// # Errors
    /// Returns [`KeyError::InvalidKey`] when the PEM does not parse.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| KeyError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Generate a fresh key pair.
    ///
    /// Useful for tests and for deployments that do not need to answer the
    /// sender's challenge with the well-known AirPlay key.
    ///
    /// # Errors
    /// Returns [`KeyError::GenerationFailed`] when key generation fails.
    pub fn generate() -> Result<Self, KeyError> {
        let mut rng = rand::rngs::OsRng;
        let inner =
            RsaPrivateKey::new(&mut rng, MODULUS_BITS).map_err(|_| KeyError::GenerationFailed)?;
        Ok(Self { inner })
    }

    /// Recover a session key encrypted to this key (PKCS#1 v1.5 decrypt).
    ///
    /// # Errors
    /// Returns [`KeyError::DecryptFailed`] when the ciphertext does not
    /// decrypt under this key.
    pub fn decrypt_key(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.inner
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| KeyError::DecryptFailed)
    }

    /// Produce a raw PKCS#1 v1.5 signature over `message`.
    ///
    /// The challenge handshake signs the buffer directly, without a digest
    /// prefix, so the unprefixed scheme is used.
    ///
    /// # Errors
    /// Returns [`KeyError::SignFailed`] when the message cannot be signed,
    /// for example because it exceeds the modulus.
    pub fn sign_raw(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.inner
            .sign(Pkcs1v15Sign::new_unprefixed(), message)
            .map_err(|_| KeyError::SignFailed)
    }

    /// The corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        self.inner.to_public_key()
    }
}

impl fmt::Debug for RaopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RaopKey(..)")
    }
}

/// RSA key failures
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// PEM did not contain a usable RSA private key
    #[error("invalid RSA private key")]
    InvalidKey,

    /// Key generation failed
    #[error("RSA key generation failed")]
    GenerationFailed,

    /// Ciphertext did not decrypt under this key
    #[error("RSA decryption failed")]
    DecryptFailed,

    /// Message could not be signed
    #[error("RSA signing failed")]
    SignFailed,
}
