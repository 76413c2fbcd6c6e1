#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for TeamSync client integration tests.
//!
//! Provides a scripted [`MockApi`], a journaling storage wrapper, a
//! controllable identity, and a channel-driven [`MockConnector`] whose
//! transports are fed by the test. Every remote call, storage mutation and
//! stream connect is appended to one shared [`Journal`] so tests can assert
//! on ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use teamsync_client::channel::ChannelConnector;
use teamsync_client::{
    IdentityProvider, JsonClient, MemoryStorage, Method, RoomSession, SessionConfig,
    SessionController, SessionEvent, SessionServices, SessionSnapshot, SessionStore, Storage,
    TeamSyncError, Transport, UserIdentity,
};

/// The signed-in user of every default rig.
pub const ME: &str = "u1";
/// The credential of every default rig.
pub const TOKEN: &str = "tok-u1";

// ── Journal ─────────────────────────────────────────────────────────

/// Ordered record of everything observable the controller did.
#[derive(Clone, Default)]
pub struct Journal(Arc<StdMutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }
}

// ── MockApi ─────────────────────────────────────────────────────────

/// One scripted answer of the [`MockApi`].
#[derive(Clone, Debug)]
pub enum Reply {
    Ok(Value),
    /// Answer after a delay.
    Delayed(Duration, Value),
    /// Fail with a status and optional `detail`.
    Fail(u16, Option<&'static str>),
    /// Never answer.
    Hang,
}

#[derive(Default)]
struct Route {
    script: VecDeque<Reply>,
    sticky: Option<Reply>,
}

/// Scripted [`JsonClient`].
///
/// Each route (`"GET /rooms/my"`) answers from its one-shot script first,
/// then with its sticky reply. Unscripted routes answer 404.
pub struct MockApi {
    routes: StdMutex<HashMap<String, Route>>,
    journal: Journal,
}

impl MockApi {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            routes: StdMutex::new(HashMap::new()),
            journal,
        })
    }

    /// Answer every call to the route with `reply`.
    pub fn on(&self, method: Method, path: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        routes.entry(format!("{method} {path}")).or_default().sticky = Some(reply);
    }

    /// Answer the next unscripted call to the route with `reply`.
    pub fn once(&self, method: Method, path: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        routes
            .entry(format!("{method} {path}"))
            .or_default()
            .script
            .push_back(reply);
    }

    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.journal.count(&format!("{method} {path}"))
    }

    fn next_reply(&self, key: &str) -> Reply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(key) {
            Some(route) => match route.script.pop_front() {
                Some(reply) => reply,
                None => route.sticky.clone().unwrap_or(Reply::Fail(404, None)),
            },
            None => Reply::Fail(404, Some("Not Found")),
        }
    }
}

#[async_trait]
impl JsonClient for MockApi {
    async fn request(
        &self,
        method: Method,
        path: &str,
        _body: Option<Value>,
    ) -> Result<Value, TeamSyncError> {
        let key = format!("{method} {path}");
        self.journal.record(key.clone());
        match self.next_reply(&key) {
            Reply::Ok(value) => Ok(value),
            Reply::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Reply::Fail(status, detail) => Err(TeamSyncError::Api {
                status,
                detail: detail.map(str::to_string),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────────

/// In-memory storage that journals every write and removal.
pub struct JournalingStorage {
    inner: MemoryStorage,
    journal: Journal,
}

impl JournalingStorage {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::new(),
            journal,
        })
    }
}

impl Storage for JournalingStorage {
    fn get(&self, key: &str) -> teamsync_client::Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> teamsync_client::Result<()> {
        self.journal.record(format!("store:set {key}"));
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> teamsync_client::Result<()> {
        self.journal.record(format!("store:remove {key}"));
        self.inner.remove(key)
    }
}

// ── Identity ────────────────────────────────────────────────────────

/// Identity the test can sign in, sign out, or hold in the loading state.
pub struct TestIdentity {
    user: StdMutex<Option<UserIdentity>>,
    token: StdMutex<Option<String>>,
    loading: AtomicBool,
}

impl TestIdentity {
    pub fn signed_in(user_id: &str, token: &str) -> Arc<Self> {
        Arc::new(Self {
            user: StdMutex::new(Some(
                UserIdentity::new(user_id).with_username(format!("{user_id}-handle")),
            )),
            token: StdMutex::new(Some(token.to_string())),
            loading: AtomicBool::new(false),
        })
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self {
            user: StdMutex::new(None),
            token: StdMutex::new(None),
            loading: AtomicBool::new(false),
        })
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    pub fn drop_token(&self) {
        *self.token.lock().unwrap() = None;
    }
}

impl IdentityProvider for TestIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.user.lock().unwrap().clone()
    }

    fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }
}

// ── Room stream ─────────────────────────────────────────────────────

/// Transport fed by the [`MockConnector`]. Counts itself as live until
/// dropped.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    sent: Arc<StdMutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), TeamSyncError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TeamSyncError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TeamSyncError> {
        self.incoming.close();
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`ChannelConnector`] that hands out [`MockTransport`]s.
///
/// The test plays the server through [`push`](Self::push) and
/// [`hang_up`](Self::hang_up), which act on the most recent connection.
pub struct MockConnector {
    journal: Journal,
    server: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    sent: Arc<StdMutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            server: StdMutex::new(None),
            sent: Arc::new(StdMutex::new(Vec::new())),
            live: Arc::new(AtomicUsize::new(0)),
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    /// Frames the client sent, across all connections.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Transports that have not been dropped yet.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make every following connect attempt fail.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Deliver one inbound frame on the latest connection.
    pub fn push(&self, frame: Value) {
        let server = self.server.lock().unwrap();
        let tx = server.as_ref().expect("no room stream connected");
        tx.send(frame.to_string()).unwrap();
    }

    /// Close the latest connection from the server side.
    pub fn hang_up(&self) {
        self.server.lock().unwrap().take();
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(
        &self,
        room_id: &str,
        token: &str,
    ) -> Result<Box<dyn Transport>, TeamSyncError> {
        self.journal.record(format!("connect {room_id} {token}"));
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TeamSyncError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        let (tx, incoming) = mpsc::unbounded_channel();
        *self.server.lock().unwrap() = Some(tx);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            incoming,
            sent: Arc::clone(&self.sent),
            live: Arc::clone(&self.live),
        }))
    }
}

// ── Rig ─────────────────────────────────────────────────────────────

/// All collaborators of a controller, sharing one journal.
pub struct Rig {
    pub journal: Journal,
    pub api: Arc<MockApi>,
    pub connector: Arc<MockConnector>,
    pub storage: Arc<JournalingStorage>,
    pub identity: Arc<TestIdentity>,
}

impl Rig {
    /// A rig signed in as [`ME`].
    pub fn new() -> Self {
        Self::with_identity(TestIdentity::signed_in(ME, TOKEN))
    }

    pub fn with_identity(identity: Arc<TestIdentity>) -> Self {
        let journal = Journal::default();
        Self {
            api: MockApi::new(journal.clone()),
            connector: MockConnector::new(journal.clone()),
            storage: JournalingStorage::new(journal.clone()),
            identity,
            journal,
        }
    }

    pub fn services(&self) -> SessionServices {
        SessionServices::new(
            self.api.clone(),
            self.identity.clone(),
            self.storage.clone(),
            self.connector.clone(),
        )
    }

    pub fn start(&self) -> (SessionController, mpsc::Receiver<SessionEvent>) {
        self.start_with(SessionConfig::new().with_avatar_base_url("seed:"))
    }

    pub fn start_with(
        &self,
        config: SessionConfig,
    ) -> (SessionController, mpsc::Receiver<SessionEvent>) {
        SessionController::start(config, self.services())
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.storage.clone())
    }

    pub fn seed_session(&self, session: &RoomSession) {
        self.store().save(session).unwrap();
    }

    pub fn stored_session(&self) -> Option<RoomSession> {
        self.store().load().unwrap()
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Let every ready task run. Under paused time this also fires any timer
/// due within the next few milliseconds.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait until a published snapshot satisfies `pred`.
pub async fn wait_until(
    controller: &SessionController,
    what: &str,
    pred: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = controller.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred)).await;
    let snapshot = match waited {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("controller stopped while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    };
    snapshot
}

/// Every event delivered so far.
pub fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ── Fixtures ────────────────────────────────────────────────────────

/// A backend room record with flat `{user_id, username}` members.
pub fn room_json(room_id: &str, leader_id: &str, member_ids: &[&str]) -> Value {
    let members: Vec<Value> = member_ids
        .iter()
        .map(|id| serde_json::json!({"user_id": id, "username": format!("{id}-handle")}))
        .collect();
    serde_json::json!({"id": room_id, "leader_id": leader_id, "members": members})
}

/// A `users_list` stream frame.
pub fn users_list_frame(member_ids: &[&str]) -> Value {
    let members: Vec<Value> = member_ids
        .iter()
        .map(|id| serde_json::json!({"user_id": id, "username": format!("{id}-handle")}))
        .collect();
    serde_json::json!({"type": "users_list", "data": members})
}

/// A `chat` stream frame.
pub fn chat_frame(user_id: &str, text: &str) -> Value {
    serde_json::json!({
        "type": "chat",
        "data": {"user_id": user_id, "username": format!("{user_id}-handle"), "text": text}
    })
}
