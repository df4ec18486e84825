//! The enclave client: pairing bootstrap, request dispatch, response
//! correlation, and the Alert → Fail escalation with ack extension.
//!
//! One background thread drains the transport for the life of a started
//! client. Each blocking request owns its own deadline pair (Alert, Fail)
//! measured from submission; an ack from the enclave moves the Fail deadline
//! to `ack_time + ack_delay`, never earlier. Waiters park on a per-request
//! channel, so `stop()` unblocks every caller by dropping the senders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use tether_core::crypto::{self, CryptoError, SymmetricKey};
use tether_core::pairing::{PairingHandshake, PairingSecret};
use tether_core::profile::Profile;
use tether_core::protocol::{
    PairResponse, RequestBody, RequestEnvelope, RequestId, ResponseBody, ResponseEnvelope,
    SignRequest, SignResponse,
};

use crate::config::{ClientConfig, Phases};
use crate::notify::{Notifier, NullNotifier};
use crate::persist::{Persister, PersistError};
use crate::tracking::{NullTracker, Tracker};
use crate::transport::{Incoming, Transport, TransportError};

/// How long the receive loop parks in `Transport::recv` before rechecking
/// the stop flag.
const RECV_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Fail deadline reached with no response. Distinct from a response that
    /// explicitly carries nothing.
    #[error("timed out waiting for the enclave")]
    Timeout,

    #[error("not paired with an enclave")]
    NotPaired,

    #[error("client not started")]
    NotStarted,

    /// The client was stopped while this request was in flight.
    #[error("client stopped")]
    Stopped,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// What the receive loop delivers to a parked waiter.
enum Event {
    Response(ResponseBody),
    Paired(PairingSecret),
    Ack,
}

/// Terminal success of a wait.
enum Outcome {
    Response(ResponseBody),
    Paired(PairingSecret),
}

struct CachedMe {
    profile: Profile,
    refreshed_at: Instant,
}

struct Inner {
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    notifier: Arc<dyn Notifier>,
    tracker: Arc<dyn Tracker>,
    config: ClientConfig,

    /// Current session. Written by `pair`/`start`/`stop`/`unpair`, read
    /// everywhere.
    session: RwLock<Option<PairingSecret>>,

    /// In-flight pairing ceremony, consumed by the receive loop on completion.
    handshake: Mutex<Option<PairingHandshake>>,
    pair_waiter: Mutex<Option<Sender<Event>>>,

    /// Outstanding requests by correlation id. Inserted by dispatching
    /// callers, drained by the receive loop and by `stop`.
    pending: Mutex<HashMap<RequestId, Sender<Event>>>,

    /// Last successful Me response. Written only by the receive loop.
    me_cache: RwLock<Option<CachedMe>>,

    running: AtomicBool,
    no_ops_sent: AtomicU64,
}

pub struct EnclaveClient {
    inner: Arc<Inner>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EnclaveClient {
    /// Build an unstarted client around its collaborators. Notifications and
    /// analytics default to no-ops; see [`Self::with_notifier`] and
    /// [`Self::with_tracker`].
    pub fn new(
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                persister,
                notifier: Arc::new(NullNotifier),
                tracker: Arc::new(NullTracker),
                config,
                session: RwLock::new(None),
                handshake: Mutex::new(None),
                pair_waiter: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                me_cache: RwLock::new(None),
                running: AtomicBool::new(false),
                no_ops_sent: AtomicU64::new(0),
            }),
            recv_thread: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_notifier before start")
            .notifier = notifier;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_tracker before start")
            .tracker = tracker;
        self
    }

    /// Load any persisted pairing secret and spawn the receive loop.
    /// Corrupt persisted state surfaces here; the client stays unstarted.
    pub fn start(&self) -> Result<(), ClientError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.inner.persister.load() {
            Ok(loaded) => {
                *self.inner.session.write().expect("session lock") = loaded;
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("tether-recv".into())
            .spawn(move || receive_loop(&inner))
            .expect("spawn receive loop");
        *self.recv_thread.lock().expect("thread slot") = Some(handle);

        debug!(paired = self.is_paired(), "enclave client started");
        Ok(())
    }

    /// Terminate the receive loop and unblock every parked waiter with a
    /// `Stopped` outcome. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.recv_thread.lock().expect("thread slot").take() {
            let _ = handle.join();
        }

        self.cancel_in_flight();
        *self.inner.session.write().expect("session lock") = None;
        debug!("enclave client stopped");
    }

    /// True iff a completed pairing secret is currently loaded. Never blocks
    /// on the network.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.inner
            .session
            .read()
            .expect("session lock")
            .as_ref()
            .is_some_and(PairingSecret::is_complete)
    }

    /// Run the pairing ceremony: publish fresh addressing, wait for the
    /// enclave's half of the handshake, persist the completed secret.
    ///
    /// On success every previously outstanding request is cancelled: a new
    /// session invalidates all old correlation state.
    pub fn pair(&self) -> Result<PairingSecret, ClientError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ClientError::NotStarted);
        }

        let handshake = PairingHandshake::begin();
        let published = handshake.pairing().clone();

        let (tx, rx) = mpsc::channel();
        *self.inner.pair_waiter.lock().expect("pair waiter") = Some(tx);
        *self.inner.handshake.lock().expect("handshake slot") = Some(handshake);

        if let Err(e) = self.inner.transport.setup(&published) {
            self.clear_ceremony();
            return Err(e.into());
        }

        let timeouts = self.inner.config.timeouts;
        let outcome = wait_for_outcome(&rx, timeouts.pair, timeouts.ack_delay, || {
            self.best_effort_notify(b"Pairing in progress. Approve this workstation on your enclave device.");
        });
        self.clear_ceremony();

        match outcome {
            Ok(Outcome::Paired(ps)) => {
                self.inner.persister.save(&ps)?;
                *self.inner.session.write().expect("session lock") = Some(ps.clone());
                // New session: old correlation ids are meaningless now.
                self.cancel_pending();
                self.inner.tracker.event("pair.success");
                Ok(ps)
            }
            Ok(Outcome::Response(_)) => {
                Err(ClientError::Protocol("response during pairing".into()))
            }
            Err(e) => {
                if matches!(e, ClientError::Timeout) {
                    self.inner.tracker.event("pair.timeout");
                }
                Err(e)
            }
        }
    }

    /// Forget the current session, durably.
    pub fn unpair(&self) -> Result<(), ClientError> {
        *self.inner.session.write().expect("session lock") = None;
        self.inner.persister.clear()?;
        self.cancel_pending();
        Ok(())
    }

    /// Fetch the enclave's identity profile. With `fresh == false` a recent
    /// cached profile is served without a round trip.
    pub fn request_me(&self, fresh: bool) -> Result<Profile, ClientError> {
        if !fresh {
            if let Some(profile) = self.recent_cached_me() {
                trace!("serving profile from cache");
                return Ok(profile);
            }
        }

        let phases = self.inner.config.timeouts.me;
        let body = self.dispatch_blocking(
            RequestBody::Me,
            phases,
            b"Still waiting for the enclave to identify itself.",
        );

        match body {
            Ok(ResponseBody::Me(profile)) => {
                self.inner.tracker.event("me.success");
                Ok(profile)
            }
            Ok(other) => Err(unexpected_kind("me", &other)),
            Err(e) => {
                if matches!(e, ClientError::Timeout) {
                    self.inner.tracker.event("me.timeout");
                }
                Err(e)
            }
        }
    }

    /// Last profile a successful Me response delivered, if any. Never blocks,
    /// never fails; unaffected by timed-out or alerted requests.
    #[must_use]
    pub fn cached_me(&self) -> Option<Profile> {
        self.inner
            .me_cache
            .read()
            .expect("me cache lock")
            .as_ref()
            .map(|c| c.profile.clone())
    }

    /// Ask the enclave to sign `request.digest` with the key addressed by
    /// `request.public_key_fingerprint`. Blocks through Alert and (possibly
    /// ack-extended) Fail.
    pub fn request_signature(&self, request: SignRequest) -> Result<SignResponse, ClientError> {
        let phases = self.inner.config.timeouts.sign;
        let body = self.dispatch_blocking(
            RequestBody::Sign(request),
            phases,
            b"Still waiting for the enclave to approve a signature.",
        );

        match body {
            Ok(ResponseBody::Sign(resp)) => {
                self.inner.tracker.event("sign.success");
                Ok(resp)
            }
            Ok(other) => Err(unexpected_kind("sign", &other)),
            Err(e) => {
                if matches!(e, ClientError::Timeout) {
                    self.inner.tracker.event("sign.timeout");
                }
                Err(e)
            }
        }
    }

    /// Fire-and-forget liveness probe. Returns as soon as the frame is
    /// handed to the transport; no reply is awaited.
    pub fn request_no_op(&self) -> Result<(), ClientError> {
        let key = self.session_key()?;
        let envelope = RequestEnvelope::new(RequestBody::NoOp);
        let sealed = seal_envelope(&key, &envelope)?;
        self.inner.transport.send(sealed)?;
        self.inner.no_ops_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// How many no-op probes this client has handed to the transport.
    #[must_use]
    pub fn no_ops_sent(&self) -> u64 {
        self.inner.no_ops_sent.load(Ordering::SeqCst)
    }

    // ---- internals ----

    fn session_key(&self) -> Result<SymmetricKey, ClientError> {
        self.inner
            .session
            .read()
            .expect("session lock")
            .as_ref()
            .and_then(|ps| ps.symmetric_key().cloned())
            .ok_or(ClientError::NotPaired)
    }

    fn recent_cached_me(&self) -> Option<Profile> {
        let cache = self.inner.me_cache.read().expect("me cache lock");
        cache.as_ref().and_then(|c| {
            (c.refreshed_at.elapsed() < self.inner.config.me_stale_after)
                .then(|| c.profile.clone())
        })
    }

    /// Seal, send, and wait out the Alert/Fail machine for one request.
    /// The Alert side effect is a user notice plus a one-shot re-send of the
    /// same sealed frame, which wakes an enclave that missed first delivery.
    fn dispatch_blocking(
        &self,
        body: RequestBody,
        phases: Phases,
        alert_text: &[u8],
    ) -> Result<ResponseBody, ClientError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ClientError::NotStarted);
        }
        let key = self.session_key()?;

        let envelope = RequestEnvelope::new(body);
        let id = envelope.id;
        let sealed = seal_envelope(&key, &envelope)?;

        let (tx, rx) = mpsc::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock")
            .insert(id, tx);

        if let Err(e) = self.inner.transport.send(sealed.clone()) {
            self.remove_pending(&id);
            return Err(e.into());
        }
        trace!(%id, "request dispatched");

        let ack_delay = self.inner.config.timeouts.ack_delay;
        let outcome = wait_for_outcome(&rx, phases, ack_delay, || {
            debug!(%id, "alert phase reached");
            self.best_effort_notify(alert_text);
            if let Err(e) = self.inner.transport.send(sealed.clone()) {
                warn!(%id, error = %e, "alert re-send failed");
            }
        });
        self.remove_pending(&id);

        match outcome {
            Ok(Outcome::Response(body)) => Ok(body),
            Ok(Outcome::Paired(_)) => Err(ClientError::Protocol(
                "pairing completion routed to a request".into(),
            )),
            Err(e) => Err(e),
        }
    }

    fn remove_pending(&self, id: &RequestId) {
        self.inner.pending.lock().expect("pending lock").remove(id);
    }

    /// Drop every pending sender; parked waiters see a disconnect and return
    /// `Stopped` instead of hanging.
    fn cancel_pending(&self) {
        self.inner.pending.lock().expect("pending lock").clear();
    }

    fn cancel_in_flight(&self) {
        self.cancel_pending();
        self.clear_ceremony();
    }

    fn clear_ceremony(&self) {
        *self.inner.handshake.lock().expect("handshake slot") = None;
        *self.inner.pair_waiter.lock().expect("pair waiter") = None;
    }

    fn best_effort_notify(&self, body: &[u8]) {
        if let Err(e) = self.inner.notifier.notify(body) {
            warn!(error = %e, "notification dropped");
        }
    }
}

impl Drop for EnclaveClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn unexpected_kind(expected: &str, got: &ResponseBody) -> ClientError {
    let got = match got {
        ResponseBody::Me(_) => "me",
        ResponseBody::Sign(_) => "sign",
    };
    ClientError::Protocol(format!("expected {expected} response, got {got}"))
}

fn seal_envelope(key: &SymmetricKey, envelope: &RequestEnvelope) -> Result<Vec<u8>, ClientError> {
    let plaintext =
        serde_json::to_vec(envelope).map_err(|e| ClientError::Protocol(e.to_string()))?;
    Ok(crypto::seal(key, &plaintext)?)
}

/// Park on `rx` until a terminal event, running the Alert/Fail machine:
///
/// * Alert expiry fires `on_alert` once and keeps waiting.
/// * An ack recomputes the Fail deadline as `now + ack_delay`, extending but
///   never shortening it.
/// * Fail expiry is a `Timeout`; a dropped sender is `Stopped`.
fn wait_for_outcome(
    rx: &Receiver<Event>,
    phases: Phases,
    ack_delay: Duration,
    mut on_alert: impl FnMut(),
) -> Result<Outcome, ClientError> {
    let submitted = Instant::now();
    let mut fail_at = submitted + phases.fail;
    let mut alert_at = Some(submitted + phases.alert);

    loop {
        let now = Instant::now();
        if now >= fail_at {
            return Err(ClientError::Timeout);
        }

        let wake_at = match alert_at {
            Some(a) if a < fail_at => a,
            _ => fail_at,
        };

        match rx.recv_timeout(wake_at.saturating_duration_since(now)) {
            Ok(Event::Response(body)) => return Ok(Outcome::Response(body)),
            Ok(Event::Paired(ps)) => return Ok(Outcome::Paired(ps)),
            Ok(Event::Ack) => {
                let extended = Instant::now() + ack_delay;
                if extended > fail_at {
                    fail_at = extended;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(a) = alert_at {
                    if Instant::now() >= a {
                        on_alert();
                        alert_at = None;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Stopped),
        }
    }
}

/// Background loop: drain the transport until stopped. Per-item failures are
/// logged and dropped; nothing in here is fatal.
fn receive_loop(inner: &Inner) {
    trace!("receive loop running");
    while inner.running.load(Ordering::SeqCst) {
        match inner.transport.recv(RECV_POLL) {
            Ok(Some(item)) => route_incoming(inner, item),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "transport receive failure"),
        }
    }
    trace!("receive loop exited");
}

fn route_incoming(inner: &Inner, item: Incoming) {
    match item {
        Incoming::Ack(id) => {
            let pending = inner.pending.lock().expect("pending lock");
            match pending.get(&id) {
                Some(waiter) => {
                    debug!(%id, "ack received; extending deadline");
                    let _ = waiter.send(Event::Ack);
                }
                None => trace!(%id, "ack for unknown or terminal request; dropped"),
            }
        }
        Incoming::Plain(bytes) => handle_pair_message(inner, &bytes),
        Incoming::Sealed(bytes) => handle_sealed(inner, &bytes),
    }
}

fn handle_pair_message(inner: &Inner, bytes: &[u8]) {
    let resp: PairResponse = match serde_json::from_slice(bytes) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "malformed pairing message dropped");
            return;
        }
    };
    let enclave_public: [u8; 32] = match resp.enclave_public.as_slice().try_into() {
        Ok(pk) => pk,
        Err(_) => {
            debug!("pairing message with bad enclave key dropped");
            return;
        }
    };

    let mut slot = inner.handshake.lock().expect("handshake slot");
    let matches = slot
        .as_ref()
        .is_some_and(|hs| hs.workstation_public()[..] == resp.workstation_public[..]);
    if !matches {
        trace!("pairing message without a matching ceremony; dropped");
        return;
    }

    let completed = slot.take().expect("checked above").complete(&enclave_public);
    drop(slot);

    if let Some(waiter) = inner.pair_waiter.lock().expect("pair waiter").take() {
        let _ = waiter.send(Event::Paired(completed));
    }
}

fn handle_sealed(inner: &Inner, bytes: &[u8]) {
    let key = match inner
        .session
        .read()
        .expect("session lock")
        .as_ref()
        .and_then(|ps| ps.symmetric_key().cloned())
    {
        Some(k) => k,
        None => {
            trace!("sealed frame before pairing completed; dropped");
            return;
        }
    };

    let plaintext = match crypto::open(&key, bytes) {
        Ok(pt) => pt,
        Err(e) => {
            debug!(error = %e, "undecryptable frame dropped");
            return;
        }
    };

    let envelope: ResponseEnvelope = match serde_json::from_slice(&plaintext) {
        Ok(env) => env,
        Err(e) => {
            debug!(error = %e, "malformed response envelope dropped");
            return;
        }
    };

    let pending = inner.pending.lock().expect("pending lock");
    let Some(waiter) = pending.get(&envelope.id) else {
        trace!(id = %envelope.id, "response for terminal or unknown request; dropped");
        return;
    };

    // Cache writes happen only for deliverable Me responses, so a response
    // that arrives after its request went terminal cannot touch the cache.
    if let ResponseBody::Me(profile) = &envelope.body {
        *inner.me_cache.write().expect("me cache lock") = Some(CachedMe {
            profile: profile.clone(),
            refreshed_at: Instant::now(),
        });
    }

    let _ = waiter.send(Event::Response(envelope.body));
}
