//! Request/response envelopes carried (sealed) over the relay.
//!
//! Every request gets a fresh random [`RequestId`]; the enclave echoes it in
//! the response so the client can correlate replies off an unordered relay.
//! Acks are NOT envelopes: the transport layer surfaces them as a separate
//! variant carrying only the request id.

use serde::{Deserialize, Serialize};

use crate::crypto::rand_bytes;
use crate::profile::Profile;

/// Serde helper: `Vec<u8>` as a hex string field.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Unique per-request correlation token: 16 random bytes, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId([u8; 16]);

impl RequestId {
    /// Fresh collision-resistant identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(rand_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> String {
        hex::encode(id.0)
    }
}

impl TryFrom<String> for RequestId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&s).map_err(|e| format!("bad request id hex: {e}"))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| "request id must be 16 bytes".to_string())?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

/// A signature request: which key (by fingerprint) and what digest to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(with = "hex_bytes")]
    pub public_key_fingerprint: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
}

/// The enclave's answer to a sign request. `signature` absent means the
/// enclave explicitly declined; `error` carries its reason if it gave one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Plaintext pairing handshake answer, sent before any session key exists.
/// Correlated by `workstation_public` (the queue itself scopes delivery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairResponse {
    #[serde(with = "hex_bytes")]
    pub workstation_public: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub enclave_public: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RequestBody {
    /// Ask the enclave for its identity profile.
    Me,
    /// Ask the enclave to sign a digest.
    Sign(SignRequest),
    /// Liveness probe; fire-and-forget, no reply expected.
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: RequestId,

    #[serde(flatten)]
    pub body: RequestBody,
}

impl RequestEnvelope {
    #[must_use]
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: RequestId::random(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ResponseBody {
    Me(Profile),
    Sign(SignResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: RequestId,

    #[serde(flatten)]
    pub body: ResponseBody,
}
