//! Pairing secret and the X25519 handshake that produces it.
//!
//! Pairing is a one-time ceremony: the workstation generates a fresh relay
//! queue name and an ephemeral X25519 keypair, publishes both out-of-band
//! (rendered as a QR code by the UI layer), and waits for the enclave device
//! to answer with its own public key. Both sides then derive the same
//! symmetric session key:
//!
//!   X25519(eph, enclave_pub) → HKDF-SHA256(info = PAIR_HKDF_INFO) → 32B key
//!
//! The ephemeral secret lives only inside [`PairingHandshake`] and is consumed
//! on completion; only the finished [`PairingSecret`] is ever persisted.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::crypto::{rand_bytes, SymmetricKey};

/// HKDF info label binding derived keys to this protocol version.
pub const PAIR_HKDF_INFO: &[u8] = b"tether-pair-v1";

/// Relay queue names are 16 random bytes, hex encoded.
const QUEUE_ID_LEN: usize = 16;

/// The bootstrapped session: relay addressing plus (once pairing completes)
/// the symmetric session key.
///
/// Once the key is present it is immutable for the life of the session;
/// re-pairing builds a whole new `PairingSecret`.
#[derive(Clone)]
pub struct PairingSecret {
    queue: String,
    workstation_public: [u8; 32],
    symmetric_key: Option<SymmetricKey>,
}

impl PairingSecret {
    /// Rebuild a secret from persisted parts.
    pub fn from_parts(
        queue: String,
        workstation_public: [u8; 32],
        symmetric_key: Option<SymmetricKey>,
    ) -> Self {
        Self {
            queue,
            workstation_public,
            symmetric_key,
        }
    }

    /// Relay queue/channel identifier the enclave sends responses to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workstation_public(&self) -> &[u8; 32] {
        &self.workstation_public
    }

    /// The session key, present only after the handshake completed.
    pub fn symmetric_key(&self) -> Option<&SymmetricKey> {
        self.symmetric_key.as_ref()
    }

    /// True iff the handshake finished and a session key is loaded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.symmetric_key.is_some()
    }
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSecret")
            .field("queue", &self.queue)
            .field("workstation_public", &hex::encode(self.workstation_public))
            .field("paired", &self.is_complete())
            .finish()
    }
}

/// Derive the session key from a raw X25519 shared secret.
///
/// Exposed so the enclave side (and test doubles standing in for it) can run
/// the identical derivation.
#[must_use]
pub fn derive_session_key(shared: [u8; 32]) -> SymmetricKey {
    let hk = Hkdf::<Sha256>::new(None, &shared);
    let mut okm = [0u8; 32];
    hk.expand(PAIR_HKDF_INFO, &mut okm).expect("HKDF expand");

    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    key
}

/// An in-flight pairing ceremony. Holds the one-shot ephemeral secret.
pub struct PairingHandshake {
    secret: Option<EphemeralSecret>,
    pairing: PairingSecret,
}

impl PairingHandshake {
    /// Start a fresh ceremony: new queue name, new ephemeral keypair.
    #[must_use]
    pub fn begin() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let pairing = PairingSecret {
            queue: hex::encode(rand_bytes::<QUEUE_ID_LEN>()),
            workstation_public: public.to_bytes(),
            symmetric_key: None,
        };

        Self {
            secret: Some(secret),
            pairing,
        }
    }

    /// The (still incomplete) pairing info to publish out-of-band.
    pub fn pairing(&self) -> &PairingSecret {
        &self.pairing
    }

    pub fn workstation_public(&self) -> &[u8; 32] {
        &self.pairing.workstation_public
    }

    /// Consume the ephemeral against the enclave's public key, yielding the
    /// completed secret.
    #[must_use]
    pub fn complete(mut self, enclave_public: &[u8; 32]) -> PairingSecret {
        let secret = self
            .secret
            .take()
            .expect("pairing ephemeral already consumed");
        let shared = secret.diffie_hellman(&PublicKey::from(*enclave_public));

        let mut pairing = self.pairing;
        pairing.symmetric_key = Some(derive_session_key(shared.to_bytes()));
        pairing
    }
}
