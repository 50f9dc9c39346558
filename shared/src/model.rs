//! Core data model: agent records, messages, task nodes, and sessions.
//!
//! Shapes mirror the teacher's `Agent`/`Message`/`Task` structs
//! (`core::agents`, `core::communication`, `core::orchestration`) but are
//! generalized from the teacher's fixed six-layer hierarchy and flat task
//! queue to the spec's named-agent directory and dependency DAG.

use crate::ids::{MessageId, PlanId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Coarse-grained RBAC role. Bitmasks carry the fine-grained rights;
/// the role only selects a role's default bitmask and is kept for
/// display/audit purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Operator,
    User,
    Observer,
}

/// Fine-grained permission bits checked by the auth gate on every
/// registration and message send.
pub mod permission {
    pub const REGISTER: u64 = 1 << 0;
    pub const DEREGISTER: u64 = 1 << 1;
    pub const HEARTBEAT: u64 = 1 << 2;
    pub const SEND: u64 = 1 << 3;
    pub const BROADCAST: u64 = 1 << 4;
    pub const SUBSCRIBE: u64 = 1 << 5;
    pub const PLAN_SUBMIT: u64 = 1 << 6;
    pub const PLAN_CANCEL: u64 = 1 << 7;
    pub const ADMIN: u64 = 1 << 8;

    pub const ALL: u64 = REGISTER
        | DEREGISTER
        | HEARTBEAT
        | SEND
        | BROADCAST
        | SUBSCRIBE
        | PLAN_SUBMIT
        | PLAN_CANCEL
        | ADMIN;
}

/// A 64-bit set of fine-grained rights. Immutable for the lifetime of a
/// session (spec.md §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionBitmask(pub u64);

impl PermissionBitmask {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn contains(&self, required: u64) -> bool {
        self.0 & required == required
    }

    /// The default bitmask granted to a freshly issued session of `role`.
    pub fn for_role(role: Role) -> Self {
        use permission::*;
        let bits = match role {
            Role::Admin => ALL,
            Role::Operator => {
                REGISTER | DEREGISTER | HEARTBEAT | SEND | BROADCAST | SUBSCRIBE | PLAN_SUBMIT
                    | PLAN_CANCEL
            }
            Role::User => REGISTER | DEREGISTER | HEARTBEAT | SEND | SUBSCRIBE | PLAN_SUBMIT,
            Role::Observer => HEARTBEAT | SUBSCRIBE,
        };
        Self(bits)
    }
}

/// Lifecycle state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Registering,
    Idle,
    Running,
    Blocked,
    Failed,
    Completed,
    Evicted,
}

/// One transport tier of the layered message fabric, ordered from most
/// to least preferred. Derived `Ord` follows declaration order, so
/// `a.min(b)` picks the stronger-preferred tier exactly as spec.md §4.3
/// requires for `tier = min(source.preferred, target.preferred, ...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransportTier {
    SharedMemoryRing,
    KernelAsyncRing,
    StreamSocket,
    MmapFileQueue,
    FlatFile,
}

impl TransportTier {
    pub fn degrade(self) -> Option<TransportTier> {
        match self {
            TransportTier::SharedMemoryRing => Some(TransportTier::KernelAsyncRing),
            TransportTier::KernelAsyncRing => Some(TransportTier::StreamSocket),
            TransportTier::StreamSocket => Some(TransportTier::MmapFileQueue),
            TransportTier::MmapFileQueue => Some(TransportTier::FlatFile),
            TransportTier::FlatFile => None,
        }
    }
}

/// A declared endpoint for one transport tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEndpoint {
    SharedMemorySegment { segment_id: String },
    RingBuffer { ring_id: String },
    SocketPath(String),
    MmapFile(String),
    FlatFile(String),
}

/// One live agent as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub uuid: ulid::Ulid,
    pub role: Role,
    pub permission_bitmask: PermissionBitmask,
    pub capabilities: HashSet<String>,
    pub status: AgentStatus,
    pub transport_endpoints: HashMap<TransportTier, TransportEndpoint>,
    pub preferred_tier: TransportTier,
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat_at: Instant,
    pub inflight_tasks: u32,
}

impl AgentRecord {
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat_at.elapsed()
    }
}

/// The semantic shape of a message exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    RequestResponse,
    Publish,
    WorkQueue,
    Broadcast,
    Multicast,
}

/// Delivery priority. Derived `Ord` follows declaration order, so
/// `Priority::Critical < Priority::Batch` — lower sorts first in a
/// priority queue built with a `BinaryHeap<Reverse<Priority>>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Batch,
}

impl Priority {
    /// The weakest tier traffic of this priority may spill to before the
    /// router gives up rather than degrading further. Only `Batch`
    /// traffic is capped (to the mmap tier, per spec.md §4.3's queue
    /// policy); everything else is free to degrade to `FlatFile`.
    pub fn max_tier(self) -> TransportTier {
        match self {
            Priority::Batch => TransportTier::MmapFileQueue,
            _ => TransportTier::FlatFile,
        }
    }

    /// Whether the router should block the sender briefly (bounded by a
    /// small budget) rather than failing fast when the target queue is
    /// full.
    pub fn blocks_on_full_queue(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

/// A routable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub source_name: String,
    pub target_names: Vec<String>,
    pub pattern: Pattern,
    pub priority: Priority,
    pub correlation_id: Option<MessageId>,
    pub requires_ack: bool,
    /// `None` means "never expires".
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub integrity_tag: Option<[u8; 32]>,
}

impl Message {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.pattern, Pattern::Broadcast)
    }
}

/// Planner-local task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    ThermalDeferred,
}

/// A node in a plan's dependency DAG. `depends_on` references task ids
/// within the same plan (spec.md §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub action: String,
    pub assigned_agent: Option<String>,
    pub required_capability: Option<String>,
    pub priority: Priority,
    pub inputs: serde_json::Value,
    pub depends_on: HashSet<TaskId>,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub retries: u32,
}

/// Per-plan failure handling policy (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FailurePolicy {
    FailFast,
    Skip,
    Retry { max_attempts: u32, backoff_ms: u64 },
}

/// Overall status of a submitted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Planning,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

/// A submitted plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub tasks: Vec<TaskNode>,
    pub failure_policy: FailurePolicy,
    pub status: PlanStatus,
}

/// An admission context derived from a verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token_id: String,
    pub agent_name: String,
    pub role: Role,
    pub permission_bitmask: PermissionBitmask,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub revoked: bool,
}

impl Session {
    pub fn is_valid(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Append-only audit trail entry (spec.md §3 `security_events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub agent: Option<String>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_min_picks_stronger_preference() {
        assert_eq!(
            TransportTier::SharedMemoryRing.min(TransportTier::StreamSocket),
            TransportTier::SharedMemoryRing
        );
    }

    #[test]
    fn admin_bitmask_contains_every_permission() {
        let mask = PermissionBitmask::for_role(Role::Admin);
        assert!(mask.contains(permission::ADMIN));
        assert!(mask.contains(permission::BROADCAST));
    }

    #[test]
    fn observer_cannot_send() {
        let mask = PermissionBitmask::for_role(Role::Observer);
        assert!(!mask.contains(permission::SEND));
    }

    #[test]
    fn session_expires() {
        let now = chrono::Utc::now();
        let session = Session {
            token_id: "t1".into(),
            agent_name: "director".into(),
            role: Role::User,
            permission_bitmask: PermissionBitmask::for_role(Role::User),
            expires_at: now - chrono::Duration::seconds(1),
            revoked: false,
        };
        assert!(!session.is_valid(now));
    }
}
