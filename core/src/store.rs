//! Persistent store adapter (spec.md §4.5).
//!
//! A narrow trait the rest of the core depends on; the shipped
//! implementation backs it with `sled` + `bincode`, mirroring how the
//! teacher reached for the same pair of crates (declared in its
//! `Cargo.toml` but never wired to a concrete adapter). Only durable
//! identity, session lifecycle, the audit trail, and planner checkpoints
//! live here — an `AgentRecord`'s transient fields (status, heartbeat,
//! inflight count) stay in the Registry's in-memory map.

use agentmesh_shared::ids::{PlanId, TaskId};
use agentmesh_shared::model::{Role, Session};
use agentmesh_shared::{CoreError, CoreResult};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};
use ulid::Ulid;

/// The durable slice of an `agents(name, uuid, role_id, created_at)` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub uuid: Ulid,
    pub role: Role,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A durable record that one task in one plan completed with a known
/// result hash, enabling idempotent restart (spec.md glossary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub plan_id: PlanId,
    pub task_id: TaskId,
    pub result_hash: [u8; 32],
}

/// Mocked via `mockall` in dependents' unit tests (e.g. `auth::tests`)
/// to exercise degraded-store behavior without standing up a real `sled`
/// database.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_agent(&self, identity: &AgentIdentity) -> CoreResult<()>;
    async fn get_agent(&self, name: &str) -> CoreResult<Option<AgentIdentity>>;
    async fn list_agents(&self, role: Option<Role>) -> CoreResult<Vec<AgentIdentity>>;
    async fn remove_agent(&self, name: &str) -> CoreResult<()>;

    async fn put_session(&self, session: &Session) -> CoreResult<()>;
    async fn revoke_session(&self, token_id: &str) -> CoreResult<()>;
    async fn get_session(&self, token_id: &str) -> CoreResult<Option<Session>>;

    async fn append_event(&self, event: &agentmesh_shared::model::SecurityEvent) -> CoreResult<()>;

    /// Commits every checkpoint in `checkpoints` or none of them.
    async fn bulk_append_checkpoints(&self, checkpoints: &[Checkpoint]) -> CoreResult<()>;
    async fn get_checkpoint(&self, plan_id: PlanId, task_id: TaskId) -> CoreResult<Option<Checkpoint>>;

    /// Whether the last operation against the backing store failed. The
    /// core consults this to enter degraded mode (spec.md §7):
    /// registrations are refused while `true`; in-memory operations
    /// continue regardless.
    fn is_degraded(&self) -> bool;
}

const TREE_AGENTS: &str = "agents";
const TREE_SESSIONS: &str = "sessions";
const TREE_EVENTS: &str = "security_events";
const TREE_CHECKPOINTS: &str = "checkpoints";

/// `sled`-backed implementation. One `sled::Tree` per persisted entity
/// keeps the four namespaces from colliding inside a single embedded
/// database file, the way the teacher's `sled`/`bincode` pair was
/// earmarked to be used but never wired up.
pub struct SledStore {
    db: sled::Db,
    degraded: Arc<AtomicBool>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let db = sled::open(path).map_err(|e| {
            error!("failed to open store: {e}");
            CoreError::StoreUnavailable
        })?;
        Ok(Self {
            db,
            degraded: Arc::new(AtomicBool::new(false)),
        })
    }

    fn tree(&self, name: &str) -> CoreResult<sled::Tree> {
        self.db.open_tree(name).map_err(|e| {
            warn!("store tree {name} unavailable: {e}");
            self.degraded.store(true, Ordering::SeqCst);
            CoreError::StoreUnavailable
        })
    }

    fn mark_ok(&self) {
        self.degraded.store(false, Ordering::SeqCst);
    }

    fn mark_failed<E: std::fmt::Display>(&self, e: E) -> CoreError {
        warn!("store operation failed: {e}");
        self.degraded.store(true, Ordering::SeqCst);
        CoreError::StoreUnavailable
    }
}

#[async_trait]
impl Store for SledStore {
    async fn put_agent(&self, identity: &AgentIdentity) -> CoreResult<()> {
        let tree = self.tree(TREE_AGENTS)?;
        let bytes = bincode::serialize(identity).map_err(|e| self.mark_failed(e))?;
        tree.insert(identity.name.as_bytes(), bytes)
            .map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> CoreResult<Option<AgentIdentity>> {
        let tree = self.tree(TREE_AGENTS)?;
        let found = tree.get(name.as_bytes()).map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        found
            .map(|ivec| bincode::deserialize(&ivec).map_err(|e| self.mark_failed(e)))
            .transpose()
    }

    async fn list_agents(&self, role: Option<Role>) -> CoreResult<Vec<AgentIdentity>> {
        let tree = self.tree(TREE_AGENTS)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry.map_err(|e| self.mark_failed(e))?;
            let identity: AgentIdentity = bincode::deserialize(&value).map_err(|e| self.mark_failed(e))?;
            if role.map(|r| r == identity.role).unwrap_or(true) {
                out.push(identity);
            }
        }
        self.mark_ok();
        Ok(out)
    }

    async fn remove_agent(&self, name: &str) -> CoreResult<()> {
        let tree = self.tree(TREE_AGENTS)?;
        tree.remove(name.as_bytes()).map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn put_session(&self, session: &Session) -> CoreResult<()> {
        let tree = self.tree(TREE_SESSIONS)?;
        let bytes = bincode::serialize(session).map_err(|e| self.mark_failed(e))?;
        tree.insert(session.token_id.as_bytes(), bytes)
            .map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn revoke_session(&self, token_id: &str) -> CoreResult<()> {
        let tree = self.tree(TREE_SESSIONS)?;
        if let Some(ivec) = tree.get(token_id.as_bytes()).map_err(|e| self.mark_failed(e))? {
            let mut session: Session = bincode::deserialize(&ivec).map_err(|e| self.mark_failed(e))?;
            session.revoked = true;
            let bytes = bincode::serialize(&session).map_err(|e| self.mark_failed(e))?;
            tree.insert(token_id.as_bytes(), bytes).map_err(|e| self.mark_failed(e))?;
        }
        self.mark_ok();
        Ok(())
    }

    async fn get_session(&self, token_id: &str) -> CoreResult<Option<Session>> {
        let tree = self.tree(TREE_SESSIONS)?;
        let found = tree.get(token_id.as_bytes()).map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        found
            .map(|ivec| bincode::deserialize(&ivec).map_err(|e| self.mark_failed(e)))
            .transpose()
    }

    async fn append_event(&self, event: &agentmesh_shared::model::SecurityEvent) -> CoreResult<()> {
        let tree = self.tree(TREE_EVENTS)?;
        let key = format!("{}-{}", event.ts.timestamp_nanos_opt().unwrap_or_default(), Ulid::new());
        let bytes = bincode::serialize(event).map_err(|e| self.mark_failed(e))?;
        tree.insert(key.as_bytes(), bytes).map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn bulk_append_checkpoints(&self, checkpoints: &[Checkpoint]) -> CoreResult<()> {
        let tree = self.tree(TREE_CHECKPOINTS)?;
        let result = tree.transaction(|tx| {
            for checkpoint in checkpoints {
                let key = checkpoint_key(checkpoint.plan_id, checkpoint.task_id);
                let bytes = bincode::serialize(checkpoint)
                    .map_err(|e| sled::transaction::ConflictableTransactionError::Abort(e))?;
                tx.insert(key.as_slice(), bytes)?;
            }
            Ok(())
        });
        result.map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        Ok(())
    }

    async fn get_checkpoint(&self, plan_id: PlanId, task_id: TaskId) -> CoreResult<Option<Checkpoint>> {
        let tree = self.tree(TREE_CHECKPOINTS)?;
        let key = checkpoint_key(plan_id, task_id);
        let found = tree.get(key).map_err(|e| self.mark_failed(e))?;
        self.mark_ok();
        found
            .map(|ivec| bincode::deserialize(&ivec).map_err(|e| self.mark_failed(e)))
            .transpose()
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

fn checkpoint_key(plan_id: PlanId, task_id: TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&plan_id.to_bytes());
    key.extend_from_slice(&task_id.to_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_shared::model::PermissionBitmask;

    fn temp_store() -> SledStore {
        let dir = tempfile::tempdir().unwrap();
        SledStore::open(dir.path().join("db")).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_agent_round_trips() {
        let store = temp_store();
        let identity = AgentIdentity {
            name: "director".into(),
            uuid: Ulid::new(),
            role: Role::Operator,
            created_at: chrono::Utc::now(),
        };
        store.put_agent(&identity).await.unwrap();
        let fetched = store.get_agent("director").await.unwrap().unwrap();
        assert_eq!(fetched, identity);
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn revoke_session_sets_flag() {
        let store = temp_store();
        let session = Session {
            token_id: "t1".into(),
            agent_name: "director".into(),
            role: Role::User,
            permission_bitmask: PermissionBitmask::for_role(Role::User),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            revoked: false,
        };
        store.put_session(&session).await.unwrap();
        store.revoke_session("t1").await.unwrap();
        let fetched = store.get_session("t1").await.unwrap().unwrap();
        assert!(fetched.revoked);
    }

    #[tokio::test]
    async fn bulk_checkpoints_are_retrievable() {
        let store = temp_store();
        let plan_id = PlanId::new();
        let checkpoints = vec![
            Checkpoint { plan_id, task_id: TaskId::new(), result_hash: [1u8; 32] },
            Checkpoint { plan_id, task_id: TaskId::new(), result_hash: [2u8; 32] },
        ];
        store.bulk_append_checkpoints(&checkpoints).await.unwrap();
        for checkpoint in &checkpoints {
            let fetched = store
                .get_checkpoint(checkpoint.plan_id, checkpoint.task_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(fetched.result_hash, checkpoint.result_hash);
        }
    }
}
