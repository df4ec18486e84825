//! Symmetric sealing for enclave traffic.
//!
//! Every request and response between the workstation and the enclave is
//! ChaCha20-Poly1305 sealed under the session key from pairing. The relay may
//! drop, delay or duplicate frames, so nonces are random per message rather
//! than counter-based; replay suppression happens at the correlation layer
//! (a terminal request id simply ignores late frames).
//!
//! Frame layout: `nonce(12) || ciphertext+tag`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand_core::RngCore;
use zeroize::Zeroize;

/// Minimum sealed frame: 12-byte nonce + 16-byte Poly1305 tag.
const MIN_FRAME_LEN: usize = 12 + 16;

/// Errors that can occur when sealing/opening enclave frames.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("sealed frame shorter than nonce + tag")]
    Truncated,

    #[error("AEAD authentication failed")]
    AuthFailed,

    /// Underlying AEAD failure on the encrypt side.
    #[error("AEAD seal failure")]
    SealFailed,
}

/// 32-byte symmetric session key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SymmetricKey(..)")
    }
}

/// Fill an N-byte array from the OS RNG.
#[must_use]
pub fn rand_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Seal `plaintext` under `key`. Returns `nonce || ciphertext+tag`.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce_bytes: [u8; 12] = rand_bytes();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(12 + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a frame produced by [`seal`]; expects `nonce || ciphertext+tag`.
pub fn open(key: &SymmetricKey, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ct) = frame.split_at(12);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ct)
        .map_err(|_| CryptoError::AuthFailed)
}
