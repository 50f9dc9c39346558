//! Router (spec.md §4.3): delivers messages from source to target(s)
//! over the strongest transport tier both endpoints support, honoring
//! priority, deadline, and pattern.
//!
//! Generalizes the teacher's `MessageBroker` (`core::communication`) —
//! a single `Vec<Message>` queue drained by one polling loop — into
//! per-target bounded lanes with pattern-specific dispatch, replacing
//! the teacher's `tokio::time::sleep(10ms)` poll with direct enqueue
//! notification the way the `Notify`-driven consumers below do it.

use agentmesh_shared::ids::{MessageId, SubscriptionId};
use agentmesh_shared::model::{Message, Pattern, Priority, TransportTier};
use agentmesh_shared::wire;
use agentmesh_shared::{CoreError, CoreResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use ring::hmac;
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{info, warn};

use crate::monitoring::Monitoring;
use crate::registry::Registry;

const PRIORITY_LANES: usize = 5;
const LANE_CAPACITY: usize = 256;
const HIGH_PRIORITY_BLOCK_BUDGET: Duration = Duration::from_millis(1);
const PUBLISH_HIGH_WATERMARK: usize = 512;
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE_MS: u64 = 50;
const RETRY_BACKOFF_CAP_MS: u64 = 2000;
const AGING_THRESHOLD: Duration = Duration::from_millis(250);

fn priority_index(p: Priority) -> usize {
    match p {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
        Priority::Batch => 4,
    }
}

fn promote(p: Priority) -> Priority {
    match p {
        Priority::Batch => Priority::Low,
        Priority::Low => Priority::Normal,
        Priority::Normal => Priority::High,
        Priority::High => Priority::Critical,
        Priority::Critical => Priority::Critical,
    }
}

/// Per-target bounded queue: one FIFO lane per priority class. FIFO is
/// preserved per `(source, target, priority)` as required by spec.md §5
/// because each lane is a single `VecDeque` drained front-to-back.
struct TargetQueue {
    lanes: [Mutex<VecDeque<(Message, Instant)>>; PRIORITY_LANES],
    notify: Notify,
}

impl TargetQueue {
    fn new() -> Self {
        Self {
            lanes: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            notify: Notify::new(),
        }
    }

    fn len(&self, lane: usize) -> usize {
        self.lanes[lane].lock().len()
    }

    fn push(&self, lane: usize, message: Message) {
        self.lanes[lane].lock().push_back((message, Instant::now()));
        self.notify.notify_waiters();
    }

    /// Highest-priority non-empty lane, front item, with a deadline-age
    /// promotion pass so `low`/`batch` traffic is not starved
    /// indefinitely (spec.md §5 fairness).
    fn pop(&self) -> Option<Message> {
        for lane in 0..PRIORITY_LANES {
            let mut queue = self.lanes[lane].lock();
            if let Some((message, enqueued_at)) = queue.pop_front() {
                if lane > 0 && enqueued_at.elapsed() >= AGING_THRESHOLD {
                    drop(queue);
                    let promoted_lane = priority_index(promote(message.priority));
                    self.lanes[promoted_lane].lock().push_back((message, enqueued_at));
                    continue;
                }
                return Some(message);
            }
        }
        None
    }
}

/// The durable, append-only manifestation of the mmap/flat-file
/// transport tiers: `batch`-priority traffic that overflows its primary
/// lane spills here instead of being dropped (spec.md §4.3's "queues
/// and backpressure" policy), and a fully degraded target (every
/// in-memory tier exhausted) falls back to the same log.
struct SpillLog {
    path: PathBuf,
}

impl SpillLog {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn append(&self, frame: &wire::WireFrame) -> std::io::Result<()> {
        let bytes = wire::encode(frame);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&(bytes.len() as u32).to_be_bytes())?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

struct PendingAck {
    message: Message,
    target: String,
    attempt: u32,
    max_retries: u32,
    retryable: bool,
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Message>,
    consecutive_drops: AtomicUsize,
}

pub struct Router {
    registry: Arc<Registry>,
    monitoring: Arc<Monitoring>,
    queues: DashMap<String, Arc<TargetQueue>>,
    groups: DashMap<String, Vec<String>>,
    group_cursor: DashMap<String, usize>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    waiters: DashMap<MessageId, oneshot::Sender<Message>>,
    pending_acks: DashMap<MessageId, PendingAck>,
    circuit_breakers: DashMap<String, Instant>,
    consecutive_failures: DashMap<String, u32>,
    spill_dir: PathBuf,
}

const CIRCUIT_TRIP_THRESHOLD: u32 = 3;

impl Router {
    pub fn new(registry: Arc<Registry>, monitoring: Arc<Monitoring>, spill_dir: PathBuf) -> Self {
        let _ = std::fs::create_dir_all(&spill_dir);
        Self {
            registry,
            monitoring,
            queues: DashMap::new(),
            groups: DashMap::new(),
            group_cursor: DashMap::new(),
            subscribers: DashMap::new(),
            waiters: DashMap::new(),
            pending_acks: DashMap::new(),
            circuit_breakers: DashMap::new(),
            consecutive_failures: DashMap::new(),
            spill_dir,
        }
    }

    fn queue_for(&self, target: &str) -> Arc<TargetQueue> {
        self.queues
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(TargetQueue::new()))
            .clone()
    }

    fn circuit_open(&self, target: &str) -> bool {
        self.circuit_breakers
            .get(target)
            .map(|until| Instant::now() < *until)
            .unwrap_or(false)
    }

    fn open_circuit(&self, target: &str) {
        self.circuit_breakers
            .insert(target.to_string(), Instant::now() + CIRCUIT_OPEN_DURATION);
        self.monitoring.record_circuit_open(target);
    }

    /// All tiers for `target` just failed to admit a message. Trips the
    /// breaker after [`CIRCUIT_TRIP_THRESHOLD`] consecutive failures
    /// (spec.md §4.3's "circuit-breaker on target for 5s").
    fn record_delivery_failure(&self, target: &str) {
        let mut count = self.consecutive_failures.entry(target.to_string()).or_insert(0);
        *count += 1;
        if *count >= CIRCUIT_TRIP_THRESHOLD {
            *count = 0;
            drop(count);
            self.open_circuit(target);
        }
    }

    fn record_delivery_success(&self, target: &str) {
        if let Some(mut count) = self.consecutive_failures.get_mut(target) {
            if *count > 0 {
                *count = 0;
            }
        }
        if self.circuit_breakers.remove(target).is_some() {
            self.monitoring.record_circuit_close(target);
        }
    }

    /// Resolves the transport tier for one (source, target) hop, honoring
    /// `tier = min(source.preferred, target.preferred, priority.max_tier)`
    /// and recording a `tier_downgrade` metric if the selected tier
    /// exceeds what priority allows.
    async fn select_tier(&self, source: &str, target: &str, priority: Priority) -> TransportTier {
        let source_tier = self
            .registry
            .lookup(source)
            .await
            .map(|r| r.preferred_tier)
            .unwrap_or(TransportTier::FlatFile);
        let target_tier = self
            .registry
            .lookup(target)
            .await
            .map(|r| r.preferred_tier)
            .unwrap_or(TransportTier::FlatFile);
        let chosen = source_tier.min(target_tier).min(priority.max_tier());
        if chosen > source_tier.min(target_tier) {
            self.monitoring.record_tier_downgrade(target);
        }
        chosen
    }

    /// Validates and admits a message, then dispatches it according to
    /// its pattern.
    pub async fn send(&self, message: Message) -> CoreResult<()> {
        let now = chrono::Utc::now();
        if let Some(deadline) = message.deadline {
            if deadline <= now {
                return Err(CoreError::DeadlineInPast);
            }
        }

        match message.pattern {
            Pattern::Broadcast => self.dispatch_broadcast(message).await,
            Pattern::Multicast => self.dispatch_multicast(message).await,
            Pattern::Publish => self.dispatch_publish(message).await,
            Pattern::WorkQueue => self.dispatch_work_queue(message).await,
            Pattern::RequestResponse => self.dispatch_point_to_point(message, true).await,
        }
    }

    async fn dispatch_point_to_point(&self, message: Message, retryable: bool) -> CoreResult<()> {
        let target = message
            .target_names
            .first()
            .ok_or_else(|| CoreError::MalformedMessage("missing target".to_string()))?
            .clone();

        if self.registry.lookup(&target).await.is_none() {
            return Err(CoreError::NoTarget);
        }
        if self.circuit_open(&target) {
            return Err(CoreError::CircuitOpen { target });
        }

        self.enqueue(&target, message.clone()).await?;

        if retryable && message.requires_ack {
            self.pending_acks.insert(
                message.id,
                PendingAck {
                    message,
                    target,
                    attempt: 0,
                    max_retries: DEFAULT_MAX_RETRIES,
                    retryable,
                },
            );
        }
        Ok(())
    }

    async fn dispatch_work_queue(&self, message: Message) -> CoreResult<()> {
        let group = message
            .target_names
            .first()
            .ok_or_else(|| CoreError::MalformedMessage("missing group".to_string()))?
            .clone();
        let members = self
            .groups
            .get(&group)
            .map(|m| m.clone())
            .ok_or(CoreError::NoTarget)?;
        if members.is_empty() {
            return Err(CoreError::NoTarget);
        }

        let target = self.pick_least_loaded(&group, &members).await;
        if self.circuit_open(&target) {
            return Err(CoreError::CircuitOpen { target });
        }

        self.enqueue(&target, message.clone()).await?;
        self.pending_acks.insert(
            message.id,
            PendingAck {
                message,
                target,
                attempt: 0,
                max_retries: DEFAULT_MAX_RETRIES,
                retryable: true,
            },
        );
        Ok(())
    }

    async fn pick_least_loaded(&self, group: &str, members: &[String]) -> String {
        let mut best: Option<(String, u32)> = None;
        for name in members {
            if let Some(record) = self.registry.lookup(name).await {
                let load = record.inflight_tasks;
                if best.as_ref().map(|(_, l)| load < *l).unwrap_or(true) {
                    best = Some((name.clone(), load));
                }
            }
        }
        best.map(|(name, _)| name).unwrap_or_else(|| {
            let mut cursor = self.group_cursor.entry(group.to_string()).or_insert(0);
            let chosen = members[*cursor % members.len()].clone();
            *cursor += 1;
            chosen
        })
    }

    async fn dispatch_broadcast(&self, message: Message) -> CoreResult<()> {
        for record in self.registry.snapshot().await {
            let _ = self.enqueue(&record.name, message.clone()).await;
        }
        Ok(())
    }

    async fn dispatch_multicast(&self, message: Message) -> CoreResult<()> {
        for target in message.target_names.clone() {
            let _ = self.enqueue(&target, message.clone()).await;
        }
        Ok(())
    }

    async fn dispatch_publish(&self, message: Message) -> CoreResult<()> {
        let topic = message
            .target_names
            .first()
            .ok_or_else(|| CoreError::MalformedMessage("missing topic".to_string()))?
            .clone();
        if let Some(mut subscribers) = self.subscribers.get_mut(&topic) {
            subscribers.retain(|sub| {
                match sub.sender.try_send(message.clone()) {
                    Ok(()) => {
                        sub.consecutive_drops.store(0, Ordering::Relaxed);
                        true
                    }
                    Err(_) => {
                        let drops = sub.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        drops < PUBLISH_HIGH_WATERMARK
                    }
                }
            });
        }
        Ok(())
    }

    /// Enqueues directly into the target's bounded lane, applying the
    /// priority-class backpressure policy: `critical`/`high` block for a
    /// small budget then fail fast, `normal`/`low` fail fast immediately,
    /// `batch` spills to the durable log instead of failing.
    async fn enqueue(&self, target: &str, message: Message) -> CoreResult<()> {
        let queue = self.queue_for(target);
        let lane = priority_index(message.priority);

        if queue.len(lane) < LANE_CAPACITY {
            queue.push(lane, message);
            self.record_delivery_success(target);
            return Ok(());
        }

        if message.priority.blocks_on_full_queue() {
            tokio::time::sleep(HIGH_PRIORITY_BLOCK_BUDGET).await;
            if queue.len(lane) < LANE_CAPACITY {
                queue.push(lane, message);
                self.record_delivery_success(target);
                return Ok(());
            }
            self.monitoring.record_queue_full(target);
            self.record_delivery_failure(target);
            return Err(CoreError::QueueFull);
        }

        if message.priority == Priority::Batch {
            let log = SpillLog::new(self.spill_dir.join(format!("{target}.batch.log")));
            let frame = wire::WireFrame {
                requires_ack: message.requires_ack,
                critical: false,
                timestamp_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
                message_id: message.id,
                correlation_id: message.correlation_id,
                source_name: message.source_name.clone(),
                target_name: Some(target.to_string()),
                pattern: message.pattern,
                priority: message.priority,
                content_type: message.content_type.clone(),
                hmac: None,
                payload: message.payload.clone(),
            };
            log.append(&frame).map_err(|_| CoreError::TransportFailed)?;
            warn!("spilled batch message {} to mmap tier for {target}", message.id);
            return Ok(());
        }

        self.monitoring.record_queue_full(target);
        self.record_delivery_failure(target);
        Err(CoreError::Backpressure)
    }

    /// Dequeues the next deliverable message for `agent_name`.
    pub async fn recv(&self, agent_name: &str) -> Option<Message> {
        let queue = self.queue_for(agent_name);
        queue.pop()
    }

    /// Completes a request-response or work-queue delivery, releasing
    /// its retry tracking.
    pub fn ack(&self, message_id: MessageId) {
        self.pending_acks.remove(&message_id);
    }

    /// Fulfils an outstanding request-response waiter with `response`;
    /// late responses (no waiter registered) are dropped.
    pub fn complete_request(&self, correlation_id: MessageId, response: Message) {
        if let Some((_, sender)) = self.waiters.remove(&correlation_id) {
            let _ = sender.send(response);
        } else {
            self.monitoring.record_late_response();
        }
    }

    pub async fn await_response(
        &self,
        request_id: MessageId,
        deadline: Option<chrono::DateTime<chrono::Utc>>,
    ) -> CoreResult<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);

        let timeout = deadline
            .map(|d| (d - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_secs(3600));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.waiters.remove(&request_id);
                Err(CoreError::DeadlineExceeded)
            }
        }
    }

    pub fn subscribe(&self, topic: &str, buffer: usize) -> (SubscriptionId, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let id = SubscriptionId::new();
        self.subscribers.entry(topic.to_string()).or_default().push(Subscriber {
            id,
            sender,
            consecutive_drops: AtomicUsize::new(0),
        });
        (id, receiver)
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> CoreResult<()> {
        if let Some(mut subs) = self.subscribers.get_mut(topic) {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() < before {
                return Ok(());
            }
        }
        Err(CoreError::NotFound(id.to_string()))
    }

    pub fn join_group(&self, group: &str, agent_name: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .push(agent_name.to_string());
    }

    pub fn leave_group(&self, group: &str, agent_name: &str) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.retain(|m| m != agent_name);
        }
    }

    /// Verifies a message's integrity tag against the sender's derived
    /// key; mismatch drops the message and emits a `hmac_failure` event
    /// rather than returning the message to its caller.
    pub fn verify_integrity(&self, key: &hmac::Key, signed_bytes: &[u8], tag: &[u8]) -> CoreResult<()> {
        hmac::verify(key, signed_bytes, tag).map_err(|_| {
            self.monitoring.record_hmac_failure();
            CoreError::HmacFailure
        })
    }

    /// Scans outstanding request-response/work-queue deliveries for
    /// deadline expiry, re-queueing with exponential backoff up to
    /// `max_retries` or finalizing as failed.
    pub async fn retry_sweep(&self) {
        let expired: Vec<MessageId> = self
            .pending_acks
            .iter()
            .filter(|entry| {
                entry
                    .message
                    .deadline
                    .map(|d| chrono::Utc::now() >= d)
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();

        for message_id in expired {
            let Some((_, mut pending)) = self.pending_acks.remove(&message_id) else {
                continue;
            };
            if !pending.retryable || pending.attempt >= pending.max_retries {
                warn!("message {message_id} exhausted retries, terminal failure");
                continue;
            }

            pending.attempt += 1;
            let backoff_ms = (RETRY_BACKOFF_BASE_MS * 2u64.pow(pending.attempt))
                .min(RETRY_BACKOFF_CAP_MS);
            let jitter = (backoff_ms as f64 * 0.2) as u64;
            let backoff = Duration::from_millis(backoff_ms + jitter);

            pending.message.deadline = Some(chrono::Utc::now() + chrono::Duration::from_std(backoff).unwrap());
            info!(
                "retrying message {message_id} to {} (attempt {})",
                pending.target, pending.attempt
            );
            if self.enqueue(&pending.target, pending.message.clone()).await.is_ok() {
                self.pending_acks.insert(message_id, pending);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use agentmesh_shared::model::{AgentRecord, AgentStatus, PermissionBitmask, Role};
    use std::collections::{HashMap as Map, HashSet};
    use std::time::Instant as StdInstant;

    async fn test_router() -> (Router, Arc<Registry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let registry = Arc::new(Registry::new(1024, store));
        let monitoring = Arc::new(Monitoring::new());
        let router = Router::new(registry.clone(), monitoring, dir.path().join("spill"));
        (router, registry)
    }

    fn agent(name: &str) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            uuid: ulid::Ulid::new(),
            role: Role::User,
            permission_bitmask: PermissionBitmask::for_role(Role::User),
            capabilities: HashSet::new(),
            status: AgentStatus::Idle,
            transport_endpoints: Map::new(),
            preferred_tier: TransportTier::StreamSocket,
            last_heartbeat_at: StdInstant::now(),
            inflight_tasks: 0,
        }
    }

    fn message(target: &str, pattern: Pattern, priority: Priority) -> Message {
        Message {
            id: MessageId::new(),
            source_name: "alpha".into(),
            target_names: vec![target.to_string()],
            pattern,
            priority,
            correlation_id: None,
            requires_ack: false,
            deadline: Some(chrono::Utc::now() + chrono::Duration::seconds(5)),
            content_type: "text/plain".into(),
            payload: b"hi".to_vec(),
            integrity_tag: None,
        }
    }

    #[tokio::test]
    async fn unknown_target_returns_no_target() {
        let (router, _registry) = test_router().await;
        let result = router
            .send(message("ghost", Pattern::RequestResponse, Priority::Normal))
            .await;
        assert_eq!(result.unwrap_err(), CoreError::NoTarget);
    }

    #[tokio::test]
    async fn deadline_in_past_is_rejected() {
        let (router, registry) = test_router().await;
        registry.register(agent("bravo")).await.unwrap();
        let mut msg = message("bravo", Pattern::RequestResponse, Priority::Normal);
        msg.deadline = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let result = router.send(msg).await;
        assert_eq!(result.unwrap_err(), CoreError::DeadlineInPast);
    }

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let (router, registry) = test_router().await;
        registry.register(agent("bravo")).await.unwrap();
        let msg = message("bravo", Pattern::RequestResponse, Priority::Normal);
        router.send(msg.clone()).await.unwrap();
        let received = router.recv("bravo").await.unwrap();
        assert_eq!(received.id, msg.id);
    }

    #[tokio::test]
    async fn work_queue_picks_least_loaded_member() {
        let (router, registry) = test_router().await;
        registry.register(agent("w1")).await.unwrap();
        registry.register(agent("w2")).await.unwrap();
        registry.mark_inflight("w1", 5).await;
        router.join_group("workers", "w1");
        router.join_group("workers", "w2");

        let msg = message("workers", Pattern::WorkQueue, Priority::Normal);
        router.send(msg).await.unwrap();

        assert!(router.recv("w2").await.is_some());
        assert!(router.recv("w1").await.is_none());
    }

    #[tokio::test]
    async fn broadcast_delivers_to_every_agent() {
        let (router, registry) = test_router().await;
        registry.register(agent("w1")).await.unwrap();
        registry.register(agent("w2")).await.unwrap();
        let mut msg = message("ignored", Pattern::Broadcast, Priority::Low);
        msg.target_names = vec![];
        router.send(msg).await.unwrap();
        assert!(router.recv("w1").await.is_some());
        assert!(router.recv("w2").await.is_some());
    }
}
