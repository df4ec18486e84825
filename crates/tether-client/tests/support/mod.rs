//! Test doubles: a fake enclave and scenario-driven relay transports.
//!
//! Each scenario is a [`Transport`] implementation of its own behavior
//! (immediate pair, duplicate pair, respond / respond-after-alert / never
//! respond, ack with or without a late response), so the client under test
//! never branches on "test mode".

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use tether_client::transport::{Incoming, Transport, TransportError};
use tether_client::{ClientConfig, EnclaveClient, Timeouts};
use tether_core::crypto::{self, rand_bytes, SymmetricKey};
use tether_core::pairing::{derive_session_key, PairingSecret};
use tether_core::profile::Profile;
use tether_core::protocol::{
    PairResponse, RequestBody, RequestEnvelope, RequestId, ResponseBody, ResponseEnvelope,
    SignResponse,
};

/// The device on the far side of the relay: holds a signing key and answers
/// requests the way a paired phone would.
pub struct FakeEnclave {
    signing: SigningKey,
    profile: Profile,
}

impl FakeEnclave {
    pub fn new() -> Self {
        let signing = SigningKey::from_bytes(&rand_bytes::<32>());
        let profile = Profile {
            device_name: "test-enclave".into(),
            public_key_wire: signing.verifying_key().to_bytes().to_vec(),
        };
        Self { signing, profile }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    fn answer(&self, envelope: &RequestEnvelope) -> Option<ResponseEnvelope> {
        let body = match &envelope.body {
            RequestBody::Me => ResponseBody::Me(self.profile.clone()),
            RequestBody::Sign(req) => {
                assert_eq!(
                    req.public_key_fingerprint,
                    self.profile.public_key_fingerprint().to_vec(),
                    "sign request addressed the wrong key"
                );
                let sig = self.signing.sign(&req.digest);
                ResponseBody::Sign(SignResponse {
                    signature: Some(sig.to_bytes().to_vec()),
                    error: None,
                })
            }
            RequestBody::NoOp => return None,
        };
        Some(ResponseEnvelope {
            id: envelope.id,
            body,
        })
    }
}

/// Knobs for one relay behavior. All off = pair immediately, answer every
/// request on first delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scenario {
    /// Enclave retries the pairing message (relay duplication).
    pub pair_twice: bool,
    /// Enclave never completes the ceremony.
    pub never_pair: bool,
    /// Swallow the first delivery; answer only the alert re-send.
    pub respond_to_alert_only: bool,
    /// Never answer Me/Sign at all.
    pub do_not_respond: bool,
    /// Send a bare ack for Sign/Me instead of answering right away.
    pub ack: bool,
    /// With `ack`: deliver the real answer at half the ack delay.
    pub respond_after_half_ack_delay: bool,
    /// Deliver the answer only after this long (for late-response tests).
    pub response_delay: Option<Duration>,
}

struct TransportState {
    key: Option<SymmetricKey>,
    deliveries: HashMap<RequestId, u32>,
}

pub struct TestTransport {
    enclave: FakeEnclave,
    scenario: Scenario,
    ack_delay: Duration,
    incoming_tx: Sender<Incoming>,
    incoming_rx: Mutex<Receiver<Incoming>>,
    state: Mutex<TransportState>,
    no_ops_received: AtomicU64,
    requests_received: AtomicU64,
}

impl TestTransport {
    pub fn with_scenario(scenario: Scenario) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel();
        Arc::new(Self {
            enclave: FakeEnclave::new(),
            scenario,
            ack_delay: Timeouts::short().ack_delay,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            state: Mutex::new(TransportState {
                key: None,
                deliveries: HashMap::new(),
            }),
            no_ops_received: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
        })
    }

    pub fn responsive() -> Arc<Self> {
        Self::with_scenario(Scenario::default())
    }

    pub fn alert_only() -> Arc<Self> {
        Self::with_scenario(Scenario {
            respond_to_alert_only: true,
            ..Scenario::default()
        })
    }

    pub fn unresponsive() -> Arc<Self> {
        Self::with_scenario(Scenario {
            do_not_respond: true,
            ..Scenario::default()
        })
    }

    pub fn acking(with_response: bool) -> Arc<Self> {
        Self::with_scenario(Scenario {
            ack: true,
            respond_after_half_ack_delay: with_response,
            ..Scenario::default()
        })
    }

    pub fn pair_twice() -> Arc<Self> {
        Self::with_scenario(Scenario {
            pair_twice: true,
            ..Scenario::default()
        })
    }

    pub fn never_pairs() -> Arc<Self> {
        Self::with_scenario(Scenario {
            never_pair: true,
            ..Scenario::default()
        })
    }

    pub fn enclave(&self) -> &FakeEnclave {
        &self.enclave
    }

    /// The session key the fake enclave derived during pairing.
    pub fn symmetric_key(&self) -> Option<SymmetricKey> {
        self.state.lock().expect("state lock").key.clone()
    }

    pub fn no_ops_received(&self) -> u64 {
        self.no_ops_received.load(Ordering::SeqCst)
    }

    /// Decrypted non-noop requests seen so far (counting re-deliveries).
    pub fn requests_received(&self) -> u64 {
        self.requests_received.load(Ordering::SeqCst)
    }

    fn push(&self, item: Incoming) {
        let _ = self.incoming_tx.send(item);
    }

    fn push_sealed_later(&self, key: SymmetricKey, envelope: ResponseEnvelope, delay: Duration) {
        let tx = self.incoming_tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let bytes = seal_response(&key, &envelope);
            let _ = tx.send(Incoming::Sealed(bytes));
        });
    }
}

fn seal_response(key: &SymmetricKey, envelope: &ResponseEnvelope) -> Vec<u8> {
    let plaintext = serde_json::to_vec(envelope).expect("serialize response");
    crypto::seal(key, &plaintext).expect("seal response")
}

impl Transport for TestTransport {
    fn setup(&self, pairing: &PairingSecret) -> Result<(), TransportError> {
        if self.scenario.never_pair {
            return Ok(());
        }

        // Enclave side of the ceremony.
        let enclave_secret = EphemeralSecret::random_from_rng(OsRng);
        let enclave_public = PublicKey::from(&enclave_secret);
        let workstation_public = PublicKey::from(*pairing.workstation_public());
        let key = derive_session_key(enclave_secret.diffie_hellman(&workstation_public).to_bytes());

        self.state.lock().expect("state lock").key = Some(key);

        let resp = PairResponse {
            workstation_public: pairing.workstation_public().to_vec(),
            enclave_public: enclave_public.to_bytes().to_vec(),
        };
        let bytes = serde_json::to_vec(&resp).expect("serialize pair response");

        let copies = if self.scenario.pair_twice { 2 } else { 1 };
        for _ in 0..copies {
            self.push(Incoming::Plain(bytes.clone()));
        }
        Ok(())
    }

    fn send(&self, ciphertext: Vec<u8>) -> Result<(), TransportError> {
        let (key, delivery) = {
            let mut state = self.state.lock().expect("state lock");
            let key = state
                .key
                .clone()
                .ok_or_else(|| TransportError::new("no session established"))?;

            let plaintext = crypto::open(&key, &ciphertext)
                .map_err(|e| TransportError::new(format!("bad request frame: {e}")))?;
            let envelope: RequestEnvelope = serde_json::from_slice(&plaintext)
                .map_err(|e| TransportError::new(format!("bad request envelope: {e}")))?;

            let count = state.deliveries.entry(envelope.id).or_insert(0);
            *count += 1;
            (key, (envelope, *count))
        };
        let (envelope, count) = delivery;

        if matches!(envelope.body, RequestBody::NoOp) {
            self.no_ops_received.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.requests_received.fetch_add(1, Ordering::SeqCst);

        if self.scenario.do_not_respond {
            return Ok(());
        }
        if self.scenario.respond_to_alert_only && count == 1 {
            // Pretend the relay lost the first delivery.
            return Ok(());
        }

        if self.scenario.ack {
            if count == 1 {
                self.push(Incoming::Ack(envelope.id));
                if self.scenario.respond_after_half_ack_delay {
                    if let Some(response) = self.enclave.answer(&envelope) {
                        self.push_sealed_later(key, response, self.ack_delay / 2);
                    }
                }
            }
            return Ok(());
        }

        if let Some(response) = self.enclave.answer(&envelope) {
            match self.scenario.response_delay {
                Some(delay) => self.push_sealed_later(key, response, delay),
                None => self.push(Incoming::Sealed(seal_response(&key, &response))),
            }
        }
        Ok(())
    }

    fn recv(&self, wait: Duration) -> Result<Option<Incoming>, TransportError> {
        let rx = self.incoming_rx.lock().expect("incoming lock");
        match rx.recv_timeout(wait) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// Client wired to an in-memory persister and millisecond timeouts.
pub fn short_client(transport: Arc<TestTransport>) -> EnclaveClient {
    EnclaveClient::new(
        transport,
        Arc::new(tether_client::persist::MemoryPersister::default()),
        ClientConfig::short(),
    )
}

/// Start and pair, asserting both succeed.
pub fn pair_client(client: &EnclaveClient) -> PairingSecret {
    client.start().expect("start");
    let ps = client.pair().expect("pair");
    assert!(client.is_paired());
    ps
}

/// Poll `predicate` until it holds or `deadline` passes.
pub fn true_before(predicate: impl Fn() -> bool, deadline: Instant) {
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

/// A notifier that records every notice, for asserting on alert behavior.
#[derive(Default)]
pub struct CapturingNotifier {
    notices: Mutex<Vec<Vec<u8>>>,
}

impl CapturingNotifier {
    pub fn count(&self) -> usize {
        self.notices.lock().expect("notices lock").len()
    }
}

impl tether_client::notify::Notifier for CapturingNotifier {
    fn notify(&self, body: &[u8]) -> std::io::Result<()> {
        self.notices.lock().expect("notices lock").push(body.to_vec());
        Ok(())
    }
}
