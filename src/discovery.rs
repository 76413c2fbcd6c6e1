//! Room discovery for a queued user.
//!
//! While the user is queued the backend may report the match in several
//! places, and not all of them work for every member (the "my room" lookup
//! only answers for leaders on some deployments). Discovery therefore runs an
//! ordered chain of [`Probe`]s on a fixed interval; the first probe that finds
//! a room wins the tick and ends the engine.
//!
//! A failing probe does not end the tick; later probes still run. The only
//! error that stops the engine is an authorization failure, which is reported
//! as [`DiscoveryEvent::Unauthorized`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::RemoteService;
use crate::error::Result;
use crate::protocol::{RemoteRoom, RoomId, UserId};

/// Default interval between discovery ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A room found by a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomLead {
    pub room_id: RoomId,
    /// Full room record when the probe had one; used as bootstrap members.
    pub room: Option<RemoteRoom>,
    /// Name of the probe that found it.
    pub source: &'static str,
}

/// One discovery strategy.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Look for the room of `user_id`. `Ok(None)` means "not yet".
    async fn attempt(&self, user_id: &str) -> Result<Option<RoomLead>>;
}

/// Asks the matchmaking queue whether we have been matched.
#[derive(Debug, Clone)]
pub struct QueueStatusProbe {
    service: RemoteService,
}

impl QueueStatusProbe {
    pub fn new(service: RemoteService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Probe for QueueStatusProbe {
    fn name(&self) -> &'static str {
        "queue-status"
    }

    async fn attempt(&self, _user_id: &str) -> Result<Option<RoomLead>> {
        let status = self.service.queue_status().await?;
        Ok(status.matched_room().map(|room_id| RoomLead {
            room_id: room_id.to_string(),
            room: None,
            source: self.name(),
        }))
    }
}

/// Asks for "my room" directly.
#[derive(Debug, Clone)]
pub struct MyRoomProbe {
    service: RemoteService,
}

impl MyRoomProbe {
    pub fn new(service: RemoteService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Probe for MyRoomProbe {
    fn name(&self) -> &'static str {
        "my-room"
    }

    async fn attempt(&self, _user_id: &str) -> Result<Option<RoomLead>> {
        Ok(self.service.my_room().await?.map(|room| RoomLead {
            room_id: room.id.clone(),
            room: Some(room),
            source: self.name(),
        }))
    }
}

/// Fetches every room and looks for the user as leader or member.
#[derive(Debug, Clone)]
pub struct RoomScanProbe {
    service: RemoteService,
}

impl RoomScanProbe {
    pub fn new(service: RemoteService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Probe for RoomScanProbe {
    fn name(&self) -> &'static str {
        "room-scan"
    }

    async fn attempt(&self, user_id: &str) -> Result<Option<RoomLead>> {
        let rooms = self.service.list_rooms().await?;
        Ok(rooms
            .into_iter()
            .find(|room| room.includes(user_id))
            .map(|room| RoomLead {
                room_id: room.id.clone(),
                room: Some(room),
                source: self.name(),
            }))
    }
}

/// The standard probe chain: queue status, then my room, then a room scan.
pub fn default_probes(service: &RemoteService) -> Vec<Arc<dyn Probe>> {
    vec![
        Arc::new(QueueStatusProbe::new(service.clone())),
        Arc::new(MyRoomProbe::new(service.clone())),
        Arc::new(RoomScanProbe::new(service.clone())),
    ]
}

/// Result of running the chain once.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Found(RoomLead),
    Unauthorized,
    NotYet,
}

/// Run every probe in order until one finds a room.
pub async fn probe_once(probes: &[Arc<dyn Probe>], user_id: &str) -> TickOutcome {
    for probe in probes {
        match probe.attempt(user_id).await {
            Ok(Some(lead)) => return TickOutcome::Found(lead),
            Ok(None) => {}
            Err(e) if e.is_unauthorized() => {
                warn!(probe = probe.name(), "discovery probe rejected credential");
                return TickOutcome::Unauthorized;
            }
            Err(e) if e.failure_kind().is_some_and(|kind| !kind.is_transient()) => {
                warn!(probe = probe.name(), "discovery probe rejected: {e}");
            }
            Err(e) => debug!(probe = probe.name(), "discovery probe failed: {e}"),
        }
    }
    TickOutcome::NotYet
}

/// What the engine reports back. Both variants are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Found { generation: u64, lead: RoomLead },
    Unauthorized { generation: u64 },
}

impl DiscoveryEvent {
    /// The generation the engine was started with.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Found { generation, .. } | Self::Unauthorized { generation } => *generation,
        }
    }
}

/// Timer-driven probe loop, owned by the session controller.
///
/// Dropping the engine stops it.
#[derive(Debug)]
pub struct DiscoveryEngine {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryEngine {
    /// Spawn the probe loop. The first tick fires one `interval` from now.
    pub fn start(
        probes: Vec<Arc<dyn Probe>>,
        user_id: UserId,
        interval: Duration,
        generation: u64,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        debug!(generation, ?interval, "discovery started");
        let task = tokio::spawn(discovery_loop(probes, user_id, interval, generation, events));
        Self {
            generation,
            task: Some(task),
        }
    }

    /// `true` until the loop exits or [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and release its timer. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(generation = self.generation, "discovery stopped");
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn discovery_loop(
    probes: Vec<Arc<dyn Probe>>,
    user_id: UserId,
    interval: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ticks: u64 = 0;
    loop {
        ticker.tick().await;
        ticks += 1;
        match probe_once(&probes, &user_id).await {
            TickOutcome::Found(lead) => {
                info!(
                    generation,
                    ticks,
                    room_id = %lead.room_id,
                    source = lead.source,
                    "discovery found room"
                );
                let _ = events.send(DiscoveryEvent::Found { generation, lead });
                return;
            }
            TickOutcome::Unauthorized => {
                let _ = events.send(DiscoveryEvent::Unauthorized { generation });
                return;
            }
            TickOutcome::NotYet => debug!(generation, ticks, "discovery tick found nothing"),
        }
        if events.is_closed() {
            return;
        }
    }
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
    use crate::error::TeamSyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies from a fixed script, then keeps repeating the last entry.
    struct ScriptedProbe {
        name: &'static str,
        script: Vec<fn() -> Result<Option<RoomLead>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(name: &'static str, script: Vec<fn() -> Result<Option<RoomLead>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn attempt(&self, _user_id: &str) -> Result<Option<RoomLead>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script[n.min(self.script.len() - 1)];
            step()
        }
    }

    fn miss() -> Result<Option<RoomLead>> {
        Ok(None)
    }

    fn not_found() -> Result<Option<RoomLead>> {
        Err(TeamSyncError::Api {
            status: 404,
            detail: None,
        })
    }

    fn server_error() -> Result<Option<RoomLead>> {
        Err(TeamSyncError::Api {
            status: 500,
            detail: None,
        })
    }

    fn forbidden() -> Result<Option<RoomLead>> {
        Err(TeamSyncError::Api {
            status: 403,
            detail: Some("Not a member".into()),
        })
    }

    fn unauthorized() -> Result<Option<RoomLead>> {
        Err(TeamSyncError::Api {
            status: 401,
            detail: None,
        })
    }

    fn hit() -> Result<Option<RoomLead>> {
        Ok(Some(RoomLead {
            room_id: "r1".into(),
            room: None,
            source: "test",
        }))
    }

    #[tokio::test]
    async fn failing_probe_does_not_abort_the_tick() {
        let first = ScriptedProbe::new("first", vec![server_error]);
        let second = ScriptedProbe::new("second", vec![not_found]);
        let third = ScriptedProbe::new("third", vec![hit]);
        let probes: Vec<Arc<dyn Probe>> = vec![first.clone(), second.clone(), third.clone()];

        let outcome = probe_once(&probes, "u1").await;
        assert!(matches!(outcome, TickOutcome::Found(ref lead) if lead.room_id == "r1"));
        assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 1));
    }

    #[tokio::test]
    async fn rejected_probe_is_skipped_not_fatal() {
        let first = ScriptedProbe::new("first", vec![forbidden]);
        let second = ScriptedProbe::new("second", vec![hit]);
        let probes: Vec<Arc<dyn Probe>> = vec![first.clone(), second.clone()];

        let outcome = probe_once(&probes, "u1").await;
        assert!(matches!(outcome, TickOutcome::Found(_)));
        assert_eq!((first.calls(), second.calls()), (1, 1));
    }

    #[tokio::test]
    async fn first_success_short_circuits_the_chain() {
        let first = ScriptedProbe::new("first", vec![hit]);
        let second = ScriptedProbe::new("second", vec![hit]);
        let probes: Vec<Arc<dyn Probe>> = vec![first.clone(), second.clone()];

        probe_once(&probes, "u1").await;
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn unauthorized_ends_the_tick() {
        let first = ScriptedProbe::new("first", vec![unauthorized]);
        let second = ScriptedProbe::new("second", vec![hit]);
        let probes: Vec<Arc<dyn Probe>> = vec![first, second.clone()];

        assert_eq!(probe_once(&probes, "u1").await, TickOutcome::Unauthorized);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_reports_once_and_exits() {
        let probe = ScriptedProbe::new("p", vec![miss, miss, hit]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = DiscoveryEngine::start(
            vec![probe.clone() as Arc<dyn Probe>],
            "u1".into(),
            Duration::from_secs(2),
            7,
            tx,
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation(), 7);
        assert!(matches!(event, DiscoveryEvent::Found { .. }));
        assert_eq!(probe.calls(), 3);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(probe.calls(), 3);
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let probe = ScriptedProbe::new("p", vec![miss]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let _engine = DiscoveryEngine::start(
            vec![probe.clone() as Arc<dyn Probe>],
            "u1".into(),
            Duration::from_secs(2),
            1,
            tx,
        );

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(probe.calls(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_the_timer() {
        let probe = ScriptedProbe::new("p", vec![miss]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = DiscoveryEngine::start(
            vec![probe.clone() as Arc<dyn Probe>],
            "u1".into(),
            Duration::from_secs(2),
            1,
            tx,
        );

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(probe.calls(), 2);

        engine.stop();
        engine.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls(), 2);
        assert!(!engine.is_running());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_engine_stops_it() {
        let probe = ScriptedProbe::new("p", vec![miss]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = DiscoveryEngine::start(
            vec![probe.clone() as Arc<dyn Probe>],
            "u1".into(),
            Duration::from_secs(2),
            1,
            tx,
        );
        drop(engine);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_terminates_the_engine() {
        let probe = ScriptedProbe::new("p", vec![miss, unauthorized]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _engine = DiscoveryEngine::start(
            vec![probe.clone() as Arc<dyn Probe>],
            "u1".into(),
            Duration::from_secs(2),
            3,
            tx,
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event, DiscoveryEvent::Unauthorized { generation: 3 });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls(), 2);
    }
}
