//! Room stream channel.
//!
//! [`StreamChannel`] owns one real-time connection to a room. A background
//! task connects through a [`ChannelConnector`], then multiplexes outbound
//! chat frames and inbound frames with `tokio::select!`. Everything the task
//! observes is reported as a [`ChannelNotice`] tagged with the channel's
//! epoch, so the owner can tell notices from a replaced channel apart from
//! notices of the current one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Result, TeamSyncError};
use crate::protocol::{ChatPayload, OutboundFrame, RemoteMember, RoomId, StreamFrame};
use crate::transport::Transport;

/// Opens a connected [`Transport`] to the stream endpoint of one room.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    /// Connect to the stream of `room_id`, authenticating with `token`.
    async fn connect(&self, room_id: &str, token: &str) -> Result<Box<dyn Transport>>;
}

/// Something the channel task observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The connection is established and `send` is now effective.
    Opened,
    /// Full membership snapshot in backend shape.
    Snapshot(Vec<RemoteMember>),
    /// One chat line.
    Chat(ChatPayload),
    /// The connection ended. Always the last notice of a channel.
    Closed { reason: Option<String> },
}

/// A [`ChannelEvent`] tagged with the epoch of the channel that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelNotice {
    pub epoch: u64,
    pub event: ChannelEvent,
}

/// Handle to one room stream connection.
///
/// Dropping the handle aborts the background task, which drops the
/// transport. Prefer [`close`](Self::close) for a graceful close frame.
pub struct StreamChannel {
    room_id: RoomId,
    epoch: u64,
    cmd_tx: mpsc::UnboundedSender<OutboundFrame>,
    open: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl StreamChannel {
    /// Spawn the channel task for `room_id`.
    ///
    /// Returns immediately; [`ChannelEvent::Opened`] or
    /// [`ChannelEvent::Closed`] follows on `notices`.
    pub fn open(
        connector: Arc<dyn ChannelConnector>,
        room_id: impl Into<RoomId>,
        token: String,
        epoch: u64,
        notices: mpsc::UnboundedSender<ChannelNotice>,
        shutdown_timeout: Duration,
    ) -> Self {
        let room_id = room_id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(channel_loop(
            connector,
            room_id.clone(),
            token,
            epoch,
            cmd_rx,
            notices,
            Arc::clone(&open),
            shutdown_rx,
        ));

        Self {
            room_id,
            epoch,
            cmd_tx,
            open,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        }
    }

    /// The room this channel is scoped to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The epoch stamped on this channel's notices.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `true` while the connection is established.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a chat line.
    ///
    /// # Errors
    ///
    /// Returns [`TeamSyncError::NotConnected`] unless the channel is open.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_open() {
            return Err(TeamSyncError::NotConnected);
        }
        self.cmd_tx
            .send(OutboundFrame::Chat { text: text.into() })
            .map_err(|_| TeamSyncError::NotConnected)
    }

    /// Close the connection and wait for the task to finish.
    ///
    /// Idempotent. If the task does not exit within the shutdown timeout it
    /// is aborted.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("channel task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!(
                        room_id = %self.room_id,
                        "channel task did not exit within timeout; aborting"
                    );
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("channel task aborted: {join_err}");
                    }
                }
            }
        }

        self.open.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("room_id", &self.room_id)
            .field("epoch", &self.epoch)
            .field("open", &self.is_open())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Channel task ────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn channel_loop(
    connector: Arc<dyn ChannelConnector>,
    room_id: RoomId,
    token: String,
    epoch: u64,
    mut cmd_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
    open: Arc<AtomicBool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let notify = |event: ChannelEvent| {
        if notices.send(ChannelNotice { epoch, event }).is_err() {
            debug!("channel notice receiver dropped");
        }
    };

    let connected = tokio::select! {
        result = connector.connect(&room_id, &token) => result,
        _ = &mut shutdown_rx => {
            debug!(room_id = %room_id, "channel closed before it connected");
            notify(ChannelEvent::Closed { reason: Some("closed by client".into()) });
            return;
        }
    };

    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            warn!(room_id = %room_id, "room stream connect failed: {e}");
            notify(ChannelEvent::Closed {
                reason: Some(format!("connect failed: {e}")),
            });
            return;
        }
    };

    open.store(true, Ordering::Release);
    debug!(room_id = %room_id, epoch, "room stream open");
    notify(ChannelEvent::Opened);

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(frame) = cmd else {
                    let _ = transport.close().await;
                    break Some("channel handle dropped".to_string());
                };
                match frame.to_json() {
                    Ok(json) => {
                        if let Err(e) = transport.send(json).await {
                            error!(room_id = %room_id, "room stream send error: {e}");
                            break Some(format!("send error: {e}"));
                        }
                    }
                    Err(e) => error!("failed to serialize outbound frame: {e}"),
                }
            }

            _ = &mut shutdown_rx => {
                if let Err(e) = transport.close().await {
                    debug!(room_id = %room_id, "room stream close handshake failed: {e}");
                }
                break Some("closed by client".to_string());
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match StreamFrame::parse(&text) {
                        Ok(Some(StreamFrame::UsersList(members))) => {
                            notify(ChannelEvent::Snapshot(members));
                        }
                        Ok(Some(StreamFrame::Chat(payload))) => notify(ChannelEvent::Chat(payload)),
                        Ok(None) => {
                            debug!(room_id = %room_id, "ignoring unrecognized stream frame");
                        }
                        Err(e) => {
                            warn!(
                                room_id = %room_id,
                                "failed to parse stream frame: {e} (raw: {text})"
                            );
                        }
                    },
                    Some(Err(e)) => {
                        error!(room_id = %room_id, "room stream receive error: {e}");
                        break Some(format!("receive error: {e}"));
                    }
                    None => {
                        debug!(room_id = %room_id, "room stream closed by server");
                        break None;
                    }
                }
            }
        }
    };

    open.store(false, Ordering::Release);
    notify(ChannelEvent::Closed { reason });
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
    use std::sync::Mutex as StdMutex;

    /// Transport fed by an mpsc sender the test keeps.
    struct PipeTransport {
        incoming: mpsc::UnboundedReceiver<String>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn send(&mut self, frame: String) -> Result<()> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PipeConnector {
        pipe: StdMutex<Option<PipeTransport>>,
        seen: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelConnector for PipeConnector {
        async fn connect(&self, room_id: &str, token: &str) -> Result<Box<dyn Transport>> {
            self.seen
                .lock()
                .unwrap()
                .push((room_id.to_string(), token.to_string()));
            match self.pipe.lock().unwrap().take() {
                Some(pipe) => Ok(Box::new(pipe)),
                None => Err(TeamSyncError::TransportClosed),
            }
        }
    }

    struct Harness {
        channel: StreamChannel,
        notices: mpsc::UnboundedReceiver<ChannelNotice>,
        server: mpsc::UnboundedSender<String>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        connector: Arc<PipeConnector>,
    }

    fn harness() -> Harness {
        let (server, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(PipeConnector {
            pipe: StdMutex::new(Some(PipeTransport {
                incoming,
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            })),
            seen: StdMutex::new(Vec::new()),
        });
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let channel = StreamChannel::open(
            connector.clone(),
            "r9",
            "tok".into(),
            4,
            notice_tx,
            Duration::from_secs(1),
        );
        Harness {
            channel,
            notices,
            server,
            sent,
            closed,
            connector,
        }
    }

    #[tokio::test]
    async fn opens_scoped_to_room_and_token() {
        let mut h = harness();
        let notice = h.notices.recv().await.unwrap();
        assert_eq!(
            notice,
            ChannelNotice {
                epoch: 4,
                event: ChannelEvent::Opened
            }
        );
        assert!(h.channel.is_open());
        assert_eq!(
            h.connector.seen.lock().unwrap().clone(),
            vec![("r9".to_string(), "tok".to_string())]
        );
        h.channel.close().await;
    }

    #[tokio::test]
    async fn inbound_frames_become_notices_and_unknown_tags_are_skipped() {
        let mut h = harness();
        h.notices.recv().await.unwrap();

        h.server
            .send(r#"{"type":"presence","data":{"who":"x"}}"#.into())
            .unwrap();
        h.server.send("garbage".into()).unwrap();
        h.server
            .send(r#"{"type":"users_list","data":[{"user_id":"u1","username":"ana"}]}"#.into())
            .unwrap();
        h.server
            .send(r#"{"type":"chat","data":{"user_id":"u1","username":"ana","text":"hey"}}"#.into())
            .unwrap();

        match h.notices.recv().await.unwrap().event {
            ChannelEvent::Snapshot(members) => assert_eq!(members[0].member_id(), Some("u1")),
            other => panic!("expected Snapshot, got {other:?}"),
        }
        match h.notices.recv().await.unwrap().event {
            ChannelEvent::Chat(payload) => assert_eq!(payload.text, "hey"),
            other => panic!("expected Chat, got {other:?}"),
        }
        h.channel.close().await;
    }

    #[tokio::test]
    async fn send_is_refused_until_open_and_after_close() {
        let mut h = harness();
        // The task has not run yet on a current-thread runtime.
        assert!(matches!(h.channel.send("early"), Err(TeamSyncError::NotConnected)));

        h.notices.recv().await.unwrap();
        h.channel.send("hello").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            h.sent.lock().unwrap().clone(),
            vec![r#"{"type":"chat","text":"hello"}"#.to_string()]
        );

        h.channel.close().await;
        assert!(h.closed.load(Ordering::SeqCst));
        assert!(matches!(h.channel.send("late"), Err(TeamSyncError::NotConnected)));

        // Closing twice is fine.
        h.channel.close().await;
    }

    #[tokio::test]
    async fn server_close_is_reported_once() {
        let mut h = harness();
        h.notices.recv().await.unwrap();
        drop(h.server);

        let notice = h.notices.recv().await.unwrap();
        assert_eq!(notice.event, ChannelEvent::Closed { reason: None });
        assert!(!h.channel.is_open());
    }

    #[tokio::test]
    async fn failed_connect_reports_closed() {
        let connector = Arc::new(PipeConnector {
            pipe: StdMutex::new(None),
            seen: StdMutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel =
            StreamChannel::open(connector, "r1", "tok".into(), 1, tx, Duration::from_secs(1));

        let notice = rx.recv().await.unwrap();
        assert!(matches!(notice.event, ChannelEvent::Closed { reason: Some(_) }));
        assert!(!channel.is_open());
    }
}
