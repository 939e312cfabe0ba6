//! Shared in-memory fakes for the integration tests: a signaling log with
//! Firebase-like replay-then-tail semantics, an invite hub routing between
//! devices, and a scriptable peer connection.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use videocall_rust::auth::Identity;
use videocall_rust::config::IceServerConfig;
use videocall_rust::invite::{DeliveryError, InviteNotification, InviteTransport};
use videocall_rust::media::{
    MediaError, PeerConnection, PeerConnectionFactory, PeerConnectionState,
};
use videocall_rust::signaling::{
    SignalPayload, SignalingMessage, SignalingTransport, TransportError,
};
use videocall_rust::state::CallState;
use videocall_rust::types::SessionId;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn identity(subject: &str) -> Identity {
    Identity {
        subject: subject.to_string(),
        expiry: Utc::now() + ChronoDuration::hours(1),
    }
}

/// Wait until the watched call state satisfies the predicate.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<CallState>,
    mut pred: impl FnMut(&CallState) -> bool,
) -> CallState {
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let current = rx.borrow().clone();
            if pred(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                if pred(&last) {
                    return last;
                }
                panic!("state channel closed in state {last:?}");
            }
        }
    })
    .await
    .expect("timed out waiting for call state")
}

#[derive(Default)]
struct SessionLog {
    entries: Vec<SignalingMessage>,
    subscribers: Vec<mpsc::Sender<SignalingMessage>>,
}

#[derive(Default)]
struct SignalingState {
    logs: HashMap<SessionId, SessionLog>,
    /// When non-zero, the next `hold_size` appends are delivered together in
    /// reverse order, simulating out-of-order delivery.
    hold_size: usize,
    held: Vec<(SessionId, SignalingMessage)>,
}

/// In-memory per-session append-only log. Subscribers get every existing
/// entry replayed, then tail new ones; writers see their own entries echoed.
#[derive(Default)]
pub struct InMemorySignaling {
    state: Mutex<SignalingState>,
    fail_next_appends: AtomicU32,
}

impl InMemorySignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` appends with a transport error.
    pub fn fail_appends(&self, n: u32) {
        self.fail_next_appends.store(n, Ordering::SeqCst);
    }

    /// Deliver the next `n` appends as one reversed batch.
    pub fn scramble_next(&self, n: usize) {
        self.state.lock().unwrap().hold_size = n;
    }

    pub fn log(&self, session_id: &SessionId) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(session_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    fn deliver(state: &mut SignalingState, session_id: &SessionId, msg: SignalingMessage) {
        if let Some(log) = state.logs.get_mut(session_id) {
            log.subscribers
                .retain(|tx| tx.try_send(msg.clone()).is_ok());
        }
    }
}

#[async_trait]
impl SignalingTransport for InMemorySignaling {
    async fn append(
        &self,
        session_id: &SessionId,
        payload: SignalPayload,
    ) -> Result<u64, TransportError> {
        if self.fail_next_appends.load(Ordering::SeqCst) > 0 {
            self.fail_next_appends.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Unavailable("injected outage".into()));
        }

        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry(session_id.clone()).or_default();
        let seq = log.entries.len() as u64 + 1;
        let msg = SignalingMessage { seq, payload };
        log.entries.push(msg.clone());

        if state.hold_size > 0 {
            state.held.push((session_id.clone(), msg));
            if state.held.len() >= state.hold_size {
                state.hold_size = 0;
                let held = std::mem::take(&mut state.held);
                for (sid, held_msg) in held.into_iter().rev() {
                    Self::deliver(&mut state, &sid, held_msg);
                }
            }
        } else {
            Self::deliver(&mut state, session_id, msg);
        }
        Ok(seq)
    }

    async fn subscribe(&self, session_id: &SessionId) -> mpsc::Receiver<SignalingMessage> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry(session_id.clone()).or_default();
        for entry in &log.entries {
            let _ = tx.try_send(entry.clone());
        }
        log.subscribers.push(tx);
        rx
    }
}

/// Routes invites between the devices under test by callee id.
#[derive(Default)]
pub struct InviteHub {
    inboxes: Mutex<HashMap<String, mpsc::Sender<InviteNotification>>>,
}

impl InviteHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>, user: &str) -> Arc<InviteEndpoint> {
        let (tx, rx) = mpsc::channel(16);
        self.inboxes.lock().unwrap().insert(user.to_string(), tx);
        Arc::new(InviteEndpoint {
            hub: self.clone(),
            rx: Mutex::new(Some(rx)),
        })
    }
}

pub struct InviteEndpoint {
    hub: Arc<InviteHub>,
    rx: Mutex<Option<mpsc::Receiver<InviteNotification>>>,
}

#[async_trait]
impl InviteTransport for InviteEndpoint {
    async fn send_invite(&self, invite: &InviteNotification) -> Result<(), DeliveryError> {
        let tx = self
            .hub
            .inboxes
            .lock()
            .unwrap()
            .get(&invite.callee_id)
            .cloned()
            .ok_or_else(|| DeliveryError::Unreachable(invite.callee_id.clone()))?;
        tx.try_send(invite.clone())
            .map_err(|_| DeliveryError::Throttled)
    }

    async fn incoming(&self) -> mpsc::Receiver<InviteNotification> {
        match self.rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => mpsc::channel(1).1,
        }
    }
}

/// Scriptable peer connection. Reports `Connected` once a remote description
/// is applied and `connect_after_candidates` remote candidates were added.
pub struct PcInner {
    label: String,
    connect_after_candidates: usize,
    state_tx: watch::Sender<PeerConnectionState>,
    local_candidates: Mutex<Option<mpsc::Receiver<String>>>,
    pub remote_description: Mutex<Option<String>>,
    pub remote_candidates: Mutex<Vec<String>>,
    pub close_calls: AtomicUsize,
}

impl PcInner {
    pub fn set_state(&self, state: PeerConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn maybe_connect(&self) {
        let described = self.remote_description.lock().unwrap().is_some();
        let candidates = self.remote_candidates.lock().unwrap().len();
        if described && candidates >= self.connect_after_candidates {
            let _ = self.state_tx.send(PeerConnectionState::Connected);
        }
    }
}

pub struct FakePeerConnection {
    inner: Arc<PcInner>,
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<String, MediaError> {
        Ok(format!("offer-from-{}", self.inner.label))
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String, MediaError> {
        *self.inner.remote_description.lock().unwrap() = Some(remote_offer.to_string());
        self.inner.maybe_connect();
        Ok(format!("answer-from-{}", self.inner.label))
    }

    async fn set_remote_description(&self, desc: &str) -> Result<(), MediaError> {
        *self.inner.remote_description.lock().unwrap() = Some(desc.to_string());
        self.inner.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        if self.inner.remote_description.lock().unwrap().is_none() {
            return Err(MediaError::InvalidState(
                "candidate before remote description".into(),
            ));
        }
        self.inner
            .remote_candidates
            .lock()
            .unwrap()
            .push(candidate.to_string());
        self.inner.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.state_tx.send(PeerConnectionState::Closed);
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.inner.state_tx.subscribe()
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<String>> {
        self.inner.local_candidates.lock().unwrap().take()
    }
}

pub struct FakeMediaFactory {
    label: String,
    connect_after_candidates: usize,
    local_candidates: Vec<String>,
    pub created: Mutex<Vec<Arc<PcInner>>>,
}

impl FakeMediaFactory {
    pub fn new(
        label: &str,
        connect_after_candidates: usize,
        local_candidates: &[&str],
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            connect_after_candidates,
            local_candidates: local_candidates.iter().map(|c| c.to_string()).collect(),
            created: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeMediaFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<Box<dyn PeerConnection>, MediaError> {
        let (cand_tx, cand_rx) = mpsc::channel(self.local_candidates.len().max(1));
        for candidate in &self.local_candidates {
            let _ = cand_tx.try_send(candidate.clone());
        }
        // Sender dropped here: the session drains the pre-loaded candidates
        // and then stops polling the stream.
        let inner = Arc::new(PcInner {
            label: self.label.clone(),
            connect_after_candidates: self.connect_after_candidates,
            state_tx: watch::channel(PeerConnectionState::New).0,
            local_candidates: Mutex::new(Some(cand_rx)),
            remote_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(inner.clone());
        Ok(Box::new(FakePeerConnection { inner }))
    }
}
