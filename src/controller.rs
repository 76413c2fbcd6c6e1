//! The session controller: matchmaking and room lifecycle.
//!
//! [`SessionController`] is a thin handle over a background task that owns
//! every piece of session state. Public operations queue a command and return
//! immediately. The task reacts to commands and to asynchronous completions
//! (join and revalidation responses, discovery results, stream notices) one
//! at a time, then publishes a fresh [`SessionSnapshot`] on a `watch` channel
//! and emits [`SessionEvent`]s on a bounded channel.
//!
//! # Stale completions
//!
//! Every state entry bumps a generation counter. Spawned requests and the
//! discovery engine carry the generation that started them, and the task
//! drops any completion whose generation is no longer current. Stream notices
//! are matched against the epoch of the channel that is currently open.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{JsonClient, RemoteService};
use crate::channel::{ChannelConnector, ChannelEvent, ChannelNotice, StreamChannel};
use crate::discovery::{
    default_probes, DiscoveryEngine, DiscoveryEvent, Probe, DEFAULT_POLL_INTERVAL,
};
use crate::error::{Result, TeamSyncError};
use crate::event::SessionEvent;
use crate::failure::FailureKind;
use crate::identity::IdentityProvider;
use crate::model::{
    normalize_members, ChatMessage, MessageOrigin, RoomLifecycle, RoomSession, SessionStatus,
    DEFAULT_AVATAR_BASE_URL,
};
use crate::protocol::{ChatPayload, JoinOutcome, RemoteMember, RemoteRoom, RoomId, UserId};
use crate::store::{SessionStore, Storage};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default time given to the controller task (and a closing room stream) to
/// exit gracefully.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default window after a leave during which resume is suppressed.
const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(3);

/// Default number of ended sessions kept in the history.
const DEFAULT_HISTORY_LIMIT: usize = 20;

// ── Configuration ───────────────────────────────────────────────────

/// Tuning for a [`SessionController`].
///
/// ```
/// use teamsync_client::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::new()
///     .with_poll_interval(Duration::from_millis(500))
///     .with_exit_grace(Duration::from_secs(10));
/// assert_eq!(config.poll_interval, Duration::from_millis(500));
/// assert_eq!(config.event_channel_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between discovery ticks. Defaults to **2 seconds**.
    pub poll_interval: Duration,
    /// How long after a leave `resume_from_storage` is ignored.
    ///
    /// Defaults to **3 seconds**.
    pub exit_grace: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) instead of blocking the controller. Defaults to **256**.
    /// Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for graceful shutdown of the controller task and for closing
    /// a room stream. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Number of ended sessions kept in memory. Defaults to **20**.
    pub history_limit: usize,
    /// Prefix for generated avatar references.
    pub avatar_base_url: String,
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            exit_grace: DEFAULT_EXIT_GRACE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            avatar_base_url: DEFAULT_AVATAR_BASE_URL.to_string(),
        }
    }

    /// Set the discovery interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the resume suppression window that follows a leave.
    #[must_use]
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Set the capacity of the bounded event channel. Clamped to at least 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the graceful shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set how many ended sessions are remembered.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Set the avatar reference prefix.
    #[must_use]
    pub fn with_avatar_base_url(mut self, url: impl Into<String>) -> Self {
        self.avatar_base_url = url.into();
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Collaborators ───────────────────────────────────────────────────

/// The external collaborators a controller talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub client: Arc<dyn JsonClient>,
    pub identity: Arc<dyn IdentityProvider>,
    pub storage: Arc<dyn Storage>,
    pub connector: Arc<dyn ChannelConnector>,
    /// Discovery strategies. `None` uses [`default_probes`].
    pub probes: Option<Vec<Arc<dyn Probe>>>,
}

impl SessionServices {
    pub fn new(
        client: Arc<dyn JsonClient>,
        identity: Arc<dyn IdentityProvider>,
        storage: Arc<dyn Storage>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        Self {
            client,
            identity,
            storage,
            connector,
            probes: None,
        }
    }

    /// Replace the default discovery chain.
    #[must_use]
    pub fn with_probes(mut self, probes: Vec<Arc<dyn Probe>>) -> Self {
        self.probes = Some(probes);
        self
    }
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("custom_probes", &self.probes.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Everything a consumer can observe about the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// Present exactly when `status` is [`SessionStatus::Matched`].
    pub session: Option<RoomSession>,
    /// Chat log of the current session, oldest first.
    pub messages: Vec<ChatMessage>,
    /// `true` while a persisted session is being revalidated and reopened.
    pub is_reconnecting: bool,
    /// `true` while the discovery timer is armed.
    pub discovery_active: bool,
    /// `true` while the room stream is open.
    pub channel_open: bool,
    /// Last user-facing error, cleared when a new operation starts.
    pub last_error: Option<String>,
    /// Ended sessions, oldest first.
    pub history: Vec<RoomSession>,
}

impl SessionSnapshot {
    /// `true` between search start and match or cancel.
    pub fn is_searching(&self) -> bool {
        self.status == SessionStatus::Searching
    }
}

// ── Controller handle ───────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    StartSearch,
    CancelSearch,
    Leave,
    SendMessage(String),
    Resume,
}

/// Handle to a running session controller.
///
/// Created via [`SessionController::start`], which spawns the controller task
/// and returns this handle together with the event receiver. Every operation
/// queues a command and returns without waiting for the network.
pub struct SessionController {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionSnapshot>,
    identity: Arc<dyn IdentityProvider>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SessionController {
    /// Spawn the controller task.
    ///
    /// Must be called from within a Tokio runtime. Nothing is restored
    /// automatically; call [`resume_from_storage`](Self::resume_from_storage)
    /// once the identity provider has resolved the user.
    pub fn start(
        config: SessionConfig,
        services: SessionServices,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let service = RemoteService::new(services.client);
        let probes = services
            .probes
            .unwrap_or_else(|| default_probes(&service));
        let shutdown_timeout = config.shutdown_timeout;
        let identity = Arc::clone(&services.identity);

        let controller = Controller {
            config,
            service,
            probes,
            identity: services.identity,
            store: SessionStore::new(services.storage),
            connector: services.connector,
            event_tx,
            state_tx,
            completion_tx,
            discovery_tx,
            notice_tx,
            status: SessionStatus::Idle,
            session: None,
            messages: Vec::new(),
            history: Vec::new(),
            user_id: None,
            generation: 0,
            channel_epoch: 0,
            next_message_id: 0,
            discovery: None,
            channel: None,
            reconnecting: false,
            exit_intent_until: None,
            last_error: None,
        };

        let task = tokio::spawn(controller_loop(
            controller,
            cmd_rx,
            completion_rx,
            discovery_rx,
            notice_rx,
            shutdown_rx,
        ));

        let handle = Self {
            cmd_tx,
            state_rx,
            identity,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (handle, event_rx)
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Join the matchmaking queue. Ignored unless the status is `Idle`.
    ///
    /// # Errors
    ///
    /// [`TeamSyncError::IdentityLoading`] or [`TeamSyncError::NotSignedIn`]
    /// when no user is available, [`TeamSyncError::ControllerStopped`] after
    /// shutdown.
    pub fn start_search(&self) -> Result<()> {
        self.require_user()?;
        self.send(Command::StartSearch)
    }

    /// Leave the queue. Ignored unless the status is `Searching`.
    pub fn cancel_search(&self) -> Result<()> {
        self.send(Command::CancelSearch)
    }

    /// Leave the current room. Ignored unless the status is `Matched`.
    pub fn leave(&self) -> Result<()> {
        self.send(Command::Leave)
    }

    /// Same as [`leave`](Self::leave).
    pub fn end_session(&self) -> Result<()> {
        self.leave()
    }

    /// Send a chat line over the room stream.
    ///
    /// When the stream is not open nothing is sent or logged and an
    /// [`SessionEvent::Error`] reports the disconnection.
    pub fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendMessage(text.into()))
    }

    /// Restore a persisted session, if there is one and no leave happened
    /// within the exit grace window.
    ///
    /// # Errors
    ///
    /// [`TeamSyncError::IdentityLoading`] while the identity provider is
    /// still resolving; call again once it is done.
    pub fn resume_from_storage(&self) -> Result<()> {
        if self.identity.is_loading() {
            return Err(TeamSyncError::IdentityLoading);
        }
        self.send(Command::Resume)
    }

    /// Stop the controller task.
    ///
    /// Stops discovery and closes the room stream. The persisted session is
    /// left in place so a later process can resume it. If the task does not
    /// exit within the shutdown timeout it is aborted.
    pub async fn shutdown(&mut self) {
        debug!("SessionController: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("controller task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("controller task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("controller task aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    /// A receiver that observes every published state.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state_rx.borrow().status
    }

    pub fn session(&self) -> Option<RoomSession> {
        self.state_rx.borrow().session.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state_rx.borrow().messages.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state_rx.borrow().is_reconnecting
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn require_user(&self) -> Result<()> {
        if self.identity.is_loading() {
            return Err(TeamSyncError::IdentityLoading);
        }
        if self.identity.current_user().is_none() {
            return Err(TeamSyncError::NotSignedIn);
        }
        Ok(())
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| TeamSyncError::ControllerStopped)
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("status", &self.status())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // No executor to drive a graceful close here; aborting drops the
        // discovery engine and the room stream with the task.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Controller task ─────────────────────────────────────────────────

/// Results of spawned requests, posted back to the controller task.
enum Completion {
    Joined {
        generation: u64,
        result: Result<JoinOutcome>,
    },
    Revalidated {
        generation: u64,
        stored: RoomSession,
        result: Result<Option<RemoteRoom>>,
    },
}

struct ActiveChannel {
    channel: StreamChannel,
    /// Reopened after a resume; suppresses `TeamFormed`.
    reconnect: bool,
}

struct Controller {
    config: SessionConfig,
    service: RemoteService,
    probes: Vec<Arc<dyn Probe>>,
    identity: Arc<dyn IdentityProvider>,
    store: SessionStore,
    connector: Arc<dyn ChannelConnector>,

    event_tx: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionSnapshot>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    notice_tx: mpsc::UnboundedSender<ChannelNotice>,

    status: SessionStatus,
    session: Option<RoomSession>,
    messages: Vec<ChatMessage>,
    history: Vec<RoomSession>,
    user_id: Option<UserId>,
    generation: u64,
    channel_epoch: u64,
    next_message_id: u64,
    discovery: Option<DiscoveryEngine>,
    channel: Option<ActiveChannel>,
    reconnecting: bool,
    exit_intent_until: Option<Instant>,
    last_error: Option<String>,
}

async fn controller_loop(
    mut ctl: Controller,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    mut discovery_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    mut notice_rx: mpsc::UnboundedReceiver<ChannelNotice>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("controller task started");
    ctl.publish();

    loop {
        // Commands are handled before results that arrived alongside them.
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("command channel closed, stopping controller");
                    break;
                };
                ctl.handle_command(cmd).await;
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            Some(done) = completion_rx.recv() => ctl.handle_completion(done).await,

            Some(event) = discovery_rx.recv() => ctl.handle_discovery(event).await,

            Some(notice) = notice_rx.recv() => ctl.handle_notice(notice),
        }
    }

    ctl.teardown().await;
    debug!("controller task exited");
}

impl Controller {
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartSearch => self.start_search(),
            Command::CancelSearch => self.cancel_search(),
            Command::Leave => self.leave().await,
            Command::SendMessage(text) => self.send_message(text),
            Command::Resume => self.resume(),
        }
    }

    // ── Search ──────────────────────────────────────────────────────

    fn start_search(&mut self) {
        if self.status != SessionStatus::Idle || self.reconnecting {
            debug!(status = %self.status, reconnecting = self.reconnecting, "start_search ignored");
            return;
        }
        if self.identity.is_loading() {
            self.report_error(TeamSyncError::IdentityLoading.user_message());
            return;
        }
        let Some(user) = self.identity.current_user() else {
            self.report_error(TeamSyncError::NotSignedIn.user_message());
            return;
        };

        self.user_id = Some(user.id);
        self.messages.clear();
        self.last_error = None;
        self.enter(SessionStatus::Searching);

        let generation = self.generation;
        let service = self.service.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = service.join_queue().await;
            let _ = completions.send(Completion::Joined { generation, result });
        });
    }

    async fn on_joined(&mut self, result: Result<JoinOutcome>) {
        match result {
            Ok(JoinOutcome::Matched {
                room_id,
                leader_id,
                room,
            }) => {
                info!(room_id = %room_id, "matched immediately");
                let bootstrap = room.map(|room| room.members).unwrap_or_default();
                self.enter_matched(room_id, leader_id, &bootstrap).await;
            }
            Ok(outcome) => {
                if outcome == JoinOutcome::Unrecognized {
                    warn!("unrecognized join response; falling back to discovery");
                } else {
                    info!("queued for matchmaking");
                }
                self.emit(SessionEvent::SearchStarted);
                self.start_discovery();
            }
            Err(e) => {
                warn!("join request failed: {e}");
                self.enter(SessionStatus::Idle);
                if e.is_unauthorized() {
                    self.emit(SessionEvent::AuthorizationRequired);
                }
                self.report_error(e.user_message());
            }
        }
    }

    fn start_discovery(&mut self) {
        self.stop_discovery();
        let Some(user_id) = self.user_id.clone() else {
            return;
        };
        self.discovery = Some(DiscoveryEngine::start(
            self.probes.clone(),
            user_id,
            self.config.poll_interval,
            self.generation,
            self.discovery_tx.clone(),
        ));
        self.publish();
    }

    fn stop_discovery(&mut self) {
        if let Some(mut engine) = self.discovery.take() {
            engine.stop();
        }
    }

    async fn handle_discovery(&mut self, event: DiscoveryEvent) {
        if event.generation() != self.generation || self.status != SessionStatus::Searching {
            debug!(
                event_generation = event.generation(),
                generation = self.generation,
                "discarding stale discovery result"
            );
            return;
        }
        self.stop_discovery();

        match event {
            DiscoveryEvent::Found { lead, .. } => {
                let (leader_id, bootstrap) = match lead.room {
                    Some(room) => (room.leader_id, room.members),
                    None => (None, Vec::new()),
                };
                self.enter_matched(lead.room_id, leader_id, &bootstrap).await;
            }
            DiscoveryEvent::Unauthorized { .. } => {
                self.enter(SessionStatus::Idle);
                self.emit(SessionEvent::AuthorizationRequired);
                self.report_error(FailureKind::Unauthorized.description().to_string());
            }
        }
    }

    fn cancel_search(&mut self) {
        if self.status != SessionStatus::Searching {
            debug!(status = %self.status, "cancel_search ignored");
            return;
        }
        self.stop_discovery();
        self.enter(SessionStatus::Idle);
        self.emit(SessionEvent::SearchCancelled);

        let service = self.service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.leave_queue().await {
                warn!("best-effort dequeue failed: {e}");
            }
        });
    }

    // ── Matched ─────────────────────────────────────────────────────

    async fn enter_matched(
        &mut self,
        room_id: RoomId,
        leader_id: Option<UserId>,
        bootstrap: &[RemoteMember],
    ) {
        self.stop_discovery();
        let members = normalize_members(
            bootstrap,
            leader_id.as_deref(),
            &self.config.avatar_base_url,
        );
        self.session = Some(RoomSession::new(room_id, leader_id, members));
        self.enter(SessionStatus::Matched);
        self.persist();
        self.open_channel(false).await;
    }

    async fn open_channel(&mut self, reconnect: bool) {
        self.close_channel().await;
        let Some(room_id) = self.session.as_ref().map(|s| s.room_id.clone()) else {
            return;
        };
        let Some(token) = self.identity.token() else {
            warn!(room_id = %room_id, "no credential for the room stream");
            self.reconnecting = false;
            self.report_error(TeamSyncError::NotSignedIn.user_message());
            return;
        };

        self.channel_epoch += 1;
        let channel = StreamChannel::open(
            Arc::clone(&self.connector),
            room_id,
            token,
            self.channel_epoch,
            self.notice_tx.clone(),
            self.config.shutdown_timeout,
        );
        self.channel = Some(ActiveChannel { channel, reconnect });
        self.publish();
    }

    async fn close_channel(&mut self) {
        if let Some(mut active) = self.channel.take() {
            active.channel.close().await;
        }
    }

    fn handle_notice(&mut self, notice: ChannelNotice) {
        let (reconnect, room_id) = match self.channel.as_ref() {
            Some(active) if active.channel.epoch() == notice.epoch => {
                (active.reconnect, active.channel.room_id().to_string())
            }
            _ => {
                debug!(epoch = notice.epoch, "discarding notice from a replaced channel");
                return;
            }
        };

        match notice.event {
            ChannelEvent::Opened => {
                self.reconnecting = false;
                if !reconnect {
                    if let Some(session) = self.session.clone() {
                        self.emit(SessionEvent::TeamFormed(session));
                    }
                }
                self.emit(SessionEvent::ChannelOpened { room_id });
            }
            ChannelEvent::Snapshot(remote) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let members = normalize_members(
                    &remote,
                    session.leader_id.as_deref(),
                    &self.config.avatar_base_url,
                );
                session.apply_snapshot(members);
                let updated = session.clone();
                self.persist();
                self.emit(SessionEvent::MembersUpdated(updated));
            }
            ChannelEvent::Chat(payload) => {
                let message = self.chat_message(payload);
                self.messages.push(message.clone());
                self.emit(SessionEvent::MessageReceived(message));
            }
            ChannelEvent::Closed { reason } => {
                info!(room_id = %room_id, ?reason, "room stream closed");
                self.channel = None;
                self.reconnecting = false;
                self.emit(SessionEvent::ChannelClosed { room_id, reason });
            }
        }
        self.publish();
    }

    fn chat_message(&mut self, payload: ChatPayload) -> ChatMessage {
        self.next_message_id += 1;
        let origin = if self.user_id.as_deref() == Some(payload.user_id.as_str()) {
            MessageOrigin::Own
        } else {
            MessageOrigin::Peer
        };
        let sender_name = payload
            .username
            .or_else(|| {
                self.session.as_ref().and_then(|s| {
                    s.members
                        .iter()
                        .find(|m| m.id == payload.user_id)
                        .map(|m| m.display_name.clone())
                })
            })
            .unwrap_or_else(|| "User".to_string());
        ChatMessage {
            id: self.next_message_id,
            sender_id: payload.user_id,
            sender_name,
            text: payload.text,
            received_at: SystemTime::now(),
            origin,
        }
    }

    fn send_message(&mut self, text: String) {
        if text.trim().is_empty() {
            debug!("ignoring empty chat line");
            return;
        }
        let sent = match self.channel.as_ref() {
            Some(active) if self.status == SessionStatus::Matched && active.channel.is_open() => {
                active.channel.send(text)
            }
            _ => Err(TeamSyncError::NotConnected),
        };
        if let Err(e) = sent {
            debug!("room stream refused chat line: {e}");
            self.report_error(e.user_message());
        }
    }

    async fn leave(&mut self) {
        if self.status != SessionStatus::Matched {
            debug!(status = %self.status, "leave ignored: not in a room");
            return;
        }

        self.exit_intent_until = Some(Instant::now() + self.config.exit_grace);
        // Cleared before any remote call so a crash mid-leave cannot
        // resurrect the room.
        if let Err(e) = self.store.clear() {
            warn!("failed to clear persisted session: {e}");
        }
        self.close_channel().await;

        let Some(session) = self.session.take() else {
            self.enter(SessionStatus::Idle);
            return;
        };
        let room_id = session.room_id.clone();
        self.push_history(session.ended());
        self.messages.clear();
        self.reconnecting = false;
        self.last_error = None;
        self.enter(SessionStatus::Idle);
        self.emit(SessionEvent::Left {
            room_id: room_id.clone(),
        });
        info!(room_id = %room_id, "left room");

        let service = self.service.clone();
        tokio::spawn(async move {
            let Err(primary) = service.leave_room(&room_id).await else {
                return;
            };
            warn!(room_id = %room_id, "leave request failed: {primary}; trying membership removal");
            if let Err(fallback) = service.remove_membership(&room_id).await {
                warn!(room_id = %room_id, "membership removal failed: {fallback}");
            }
        });
    }

    fn push_history(&mut self, session: RoomSession) {
        if self.config.history_limit == 0 {
            return;
        }
        self.history.push(session);
        let excess = self.history.len().saturating_sub(self.config.history_limit);
        self.history.drain(..excess);
    }

    // ── Resume ──────────────────────────────────────────────────────

    fn resume(&mut self) {
        if self.status != SessionStatus::Idle || self.reconnecting {
            debug!(status = %self.status, reconnecting = self.reconnecting, "resume ignored");
            return;
        }
        if self
            .exit_intent_until
            .is_some_and(|until| Instant::now() < until)
        {
            info!("resume suppressed after a recent leave");
            return;
        }
        let Some(user) = self.identity.current_user() else {
            debug!("resume skipped: no signed-in user");
            return;
        };
        let stored = match self.store.load() {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!("no persisted session to resume");
                return;
            }
            Err(e) => {
                warn!("failed to read persisted session: {e}");
                return;
            }
        };

        info!(room_id = %stored.room_id, "revalidating persisted session");
        self.user_id = Some(user.id);
        self.reconnecting = true;
        self.generation += 1;
        self.publish();

        let generation = self.generation;
        let service = self.service.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match service.get_room(&stored.room_id).await {
                Ok(room) => Ok(Some(room)),
                Err(e) => {
                    debug!(
                        room_id = %stored.room_id,
                        "stored room failed revalidation: {e}; asking for my room"
                    );
                    service.my_room().await
                }
            };
            let _ = completions.send(Completion::Revalidated {
                generation,
                stored,
                result,
            });
        });
    }

    async fn on_revalidated(&mut self, stored: RoomSession, result: Result<Option<RemoteRoom>>) {
        match result {
            Ok(Some(room)) => {
                let session = merge_resumed(stored, room, &self.config.avatar_base_url);
                info!(room_id = %session.room_id, "resumed persisted session");
                self.session = Some(session.clone());
                self.enter(SessionStatus::Matched);
                self.persist();
                self.emit(SessionEvent::Resumed(session));
                self.open_channel(true).await;
            }
            other => {
                if let Err(e) = &other {
                    warn!("revalidation failed: {e}");
                    if e.is_unauthorized() {
                        self.emit(SessionEvent::AuthorizationRequired);
                    }
                }
                info!(room_id = %stored.room_id, "persisted session is gone; clearing");
                if let Err(e) = self.store.clear() {
                    warn!("failed to clear persisted session: {e}");
                }
                self.reconnecting = false;
                self.publish();
            }
        }
    }

    // ── Completions ─────────────────────────────────────────────────

    async fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Joined { generation, result } => {
                if generation != self.generation || self.status != SessionStatus::Searching {
                    debug!(generation, current = self.generation, "discarding stale join response");
                    return;
                }
                self.on_joined(result).await;
            }
            Completion::Revalidated {
                generation,
                stored,
                result,
            } => {
                if generation != self.generation || self.status != SessionStatus::Idle {
                    debug!(generation, current = self.generation, "discarding stale revalidation");
                    return;
                }
                self.on_revalidated(stored, result).await;
            }
        }
    }

    // ── Bookkeeping ─────────────────────────────────────────────────

    /// Enter `status`, invalidating everything started under the previous
    /// generation.
    fn enter(&mut self, status: SessionStatus) {
        self.generation += 1;
        if status != SessionStatus::Matched {
            self.session = None;
        }
        let changed = self.status != status;
        self.status = status;
        debug!(status = %status, generation = self.generation, "state entered");
        if changed {
            self.emit(SessionEvent::StatusChanged(status));
        }
        self.publish();
    }

    fn persist(&self) {
        if let Some(session) = &self.session {
            if let Err(e) = self.store.save(session) {
                warn!(room_id = %session.room_id, "failed to persist session: {e}");
            }
        }
    }

    fn report_error(&mut self, message: String) {
        self.last_error = Some(message.clone());
        self.emit(SessionEvent::Error { message });
        self.publish();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            session: self.session.clone(),
            messages: self.messages.clone(),
            is_reconnecting: self.reconnecting,
            discovery_active: self
                .discovery
                .as_ref()
                .is_some_and(DiscoveryEngine::is_running),
            channel_open: self
                .channel
                .as_ref()
                .is_some_and(|active| active.channel.is_open()),
            last_error: self.last_error.clone(),
            history: self.history.clone(),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }

    /// Emit an event. If the channel is full, log a warning and drop the
    /// event so the controller never blocks on a slow consumer.
    fn emit(&self, event: SessionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    async fn teardown(&mut self) {
        self.stop_discovery();
        self.close_channel().await;
        self.publish();
    }
}

/// Combine a persisted session with the room the service confirmed.
///
/// Fetched membership wins when it is non-empty. If the fallback lookup
/// returned a different room, that room replaces the persisted one.
fn merge_resumed(stored: RoomSession, room: RemoteRoom, avatar_base_url: &str) -> RoomSession {
    let leader_id = room.leader_id.clone().or_else(|| stored.leader_id.clone());
    let fetched = normalize_members(&room.members, leader_id.as_deref(), avatar_base_url);

    if room.id != stored.room_id {
        return RoomSession::new(room.id, leader_id, fetched);
    }

    let mut session = stored;
    session.status = RoomLifecycle::Active;
    session.set_leader(room.leader_id);
    if !fetched.is_empty() {
        session.apply_snapshot(fetched);
    }
    session
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::model::{Member, MemberRole};
    use serde_json::json;

    fn room(value: serde_json::Value) -> RemoteRoom {
        serde_json::from_value(value).unwrap()
    }

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.into(),
            display_name: name.into(),
            handle: name.to_lowercase(),
            role: MemberRole::Member,
            avatar_ref: format!("seed:{}", name.to_lowercase()),
        }
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.exit_grace, Duration::from_secs(3));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.avatar_base_url, DEFAULT_AVATAR_BASE_URL);
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = SessionConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn resume_merge_prefers_fetched_members() {
        let stored = RoomSession::new("7", Some("1".into()), vec![member("1", "Ana")]);
        let fetched = room(json!({
            "id": 7,
            "leader_id": 1,
            "members": [
                {"user_id": 1, "username": "ana"},
                {"user_id": 2, "username": "bo"}
            ]
        }));

        let merged = merge_resumed(stored, fetched, "seed:");
        assert_eq!(merged.room_id, "7");
        assert_eq!(merged.members.len(), 2);
        assert_eq!(merged.members[0].role, MemberRole::Leader);
        assert_eq!(merged.members[1].id, "2");
        assert_eq!(merged.status, RoomLifecycle::Active);
    }

    #[test]
    fn resume_merge_keeps_stored_members_when_fetch_has_none() {
        let stored = RoomSession::new("7", Some("1".into()), vec![member("1", "Ana")]);
        let merged = merge_resumed(stored.clone(), room(json!({"id": "7"})), "seed:");
        assert_eq!(merged.members, stored.members);
        assert_eq!(merged.leader_id.as_deref(), Some("1"));
    }

    #[test]
    fn resume_merge_adopts_a_different_room_from_fallback() {
        let stored = RoomSession::new("7", None, vec![member("1", "Ana")]);
        let merged = merge_resumed(
            stored,
            room(json!({"id": "9", "leader_id": "5", "members": [{"id": "5", "name": "Cy"}]})),
            "seed:",
        );
        assert_eq!(merged.room_id, "9");
        assert_eq!(merged.members.len(), 1);
        assert_eq!(merged.members[0].role, MemberRole::Leader);
    }

    #[test]
    fn snapshot_reports_searching() {
        let snapshot = SessionSnapshot {
            status: SessionStatus::Searching,
            ..SessionSnapshot::default()
        };
        assert!(snapshot.is_searching());
        assert!(!SessionSnapshot::default().is_searching());
    }
}
