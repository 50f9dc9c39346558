//! Registry & Discovery (spec.md §4.2).
//!
//! Generalizes the teacher's `AgentManager` (`core::agents`) — which
//! pre-populated a fixed six-layer hierarchy of `Agent`s at startup —
//! into a registry of dynamically discovered, externally-reached
//! `AgentRecord`s (spec.md §9's "dynamic dispatch by agent name" note).
//! The single-writer-lock concurrency model is kept verbatim: the
//! teacher already guarded its map with `tokio::sync::RwLock`, which is
//! exactly the "one global lock" spec.md §5 calls for.

use agentmesh_shared::model::{AgentRecord, AgentStatus, Role, SecurityEvent};
use agentmesh_shared::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::store::{AgentIdentity, Store};

const BLOCKED_AFTER: Duration = Duration::from_secs(30);
const EVICTED_AFTER: Duration = Duration::from_secs(120);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Registry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    max_agents: u32,
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(max_agents: u32, store: Arc<dyn Store>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            max_agents,
            store,
        }
    }

    /// Atomic insert; duplicate names are rejected unless the prior
    /// entry is evicted.
    pub async fn register(&self, mut record: AgentRecord) -> CoreResult<()> {
        let name_key = record.name.to_ascii_lowercase();
        let mut agents = self.agents.write().await;

        if let Some(existing) = agents.get(&name_key) {
            if existing.status != AgentStatus::Evicted {
                self.emit_event("register", false, Some(&record.name), "conflict").await;
                return Err(CoreError::Conflict(record.name.clone()));
            }
        }

        if agents.len() as u32 >= self.max_agents && !agents.contains_key(&name_key) {
            self.emit_event("register", false, Some(&record.name), "registry_full").await;
            return Err(CoreError::RegistryFull);
        }

        record.status = AgentStatus::Idle;
        record.last_heartbeat_at = Instant::now();
        agents.insert(name_key, record.clone());
        drop(agents);

        let _ = self
            .store
            .put_agent(&AgentIdentity {
                name: record.name.clone(),
                uuid: record.uuid,
                role: record.role,
                created_at: chrono::Utc::now(),
            })
            .await;

        self.emit_event("register", true, Some(&record.name), "ok").await;
        info!("registered agent {}", record.name);
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> CoreResult<()> {
        let name_key = name.to_ascii_lowercase();
        let mut agents = self.agents.write().await;
        if agents.remove(&name_key).is_none() {
            return Err(CoreError::NotFound(name.to_string()));
        }
        drop(agents);

        let _ = self.store.remove_agent(name).await;
        self.emit_event("deregister", true, Some(name), "ok").await;
        info!("deregistered agent {}", name);
        Ok(())
    }

    pub async fn heartbeat(&self, name: &str) -> CoreResult<()> {
        let name_key = name.to_ascii_lowercase();
        let mut agents = self.agents.write().await;
        match agents.get_mut(&name_key) {
            Some(record) => {
                record.last_heartbeat_at = Instant::now();
                if record.status == AgentStatus::Blocked {
                    record.status = AgentStatus::Idle;
                }
                Ok(())
            }
            None => Err(CoreError::NotFound(name.to_string())),
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<AgentRecord> {
        let name_key = name.to_ascii_lowercase();
        self.agents.read().await.get(&name_key).cloned()
    }

    /// Used by the planner for agent selection: agents exposing
    /// `capability`, optionally filtered by `role`, alive (not evicted).
    pub async fn query(&self, capability: Option<&str>, role: Option<Role>) -> Vec<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .filter(|record| record.status != AgentStatus::Evicted)
            .filter(|record| capability.map(|c| record.capabilities.contains(c)).unwrap_or(true))
            .filter(|record| role.map(|r| record.role == r).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn mark_inflight(&self, name: &str, delta: i32) {
        let name_key = name.to_ascii_lowercase();
        if let Some(record) = self.agents.write().await.get_mut(&name_key) {
            record.inflight_tasks = (record.inflight_tasks as i64 + delta as i64).max(0) as u32;
        }
    }

    /// Runs every [`SWEEP_INTERVAL`] until `cancel` is notified,
    /// demoting stale entries to `blocked` at 30 s and `evicted` at
    /// 120 s (spec.md §3).
    pub async fn run_sweeper(self: Arc<Self>, cancel: Arc<Notify>) {
        info!("registry sweeper started");
        loop {
            tokio::select! {
                _ = cancel.notified() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    self.sweep_once().await;
                }
            }
        }
        info!("registry sweeper stopped");
    }

    async fn sweep_once(&self) {
        let mut agents = self.agents.write().await;
        let mut evicted = Vec::new();
        for (key, record) in agents.iter_mut() {
            let age = record.last_heartbeat_at.elapsed();
            if age >= EVICTED_AFTER && record.status != AgentStatus::Evicted {
                record.status = AgentStatus::Evicted;
                evicted.push(key.clone());
            } else if age >= BLOCKED_AFTER && record.status == AgentStatus::Idle {
                record.status = AgentStatus::Blocked;
            }
        }
        drop(agents);
        for name in evicted {
            warn!("evicted stale agent {name}");
            self.emit_event("eviction", true, Some(&name), "stale_heartbeat").await;
        }
    }

    async fn emit_event(&self, event_type: &str, success: bool, agent: Option<&str>, reason: &str) {
        let event = SecurityEvent {
            ts: chrono::Utc::now(),
            event_type: event_type.to_string(),
            severity: if success {
                agentmesh_shared::model::EventSeverity::Info
            } else {
                agentmesh_shared::model::EventSeverity::Warning
            },
            agent: agent.map(|a| a.to_string()),
            details: serde_json::json!({ "reason": reason }),
        };
        if let Err(e) = self.store.append_event(&event).await {
            warn!("failed to persist registry event {event_type}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use agentmesh_shared::model::{PermissionBitmask, TransportTier};
    use std::collections::{HashMap as Map, HashSet};

    fn sample_record(name: &str) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            uuid: ulid::Ulid::new(),
            role: Role::User,
            permission_bitmask: PermissionBitmask::for_role(Role::User),
            capabilities: HashSet::from(["ping".to_string()]),
            status: AgentStatus::Registering,
            transport_endpoints: Map::new(),
            preferred_tier: TransportTier::StreamSocket,
            last_heartbeat_at: Instant::now(),
            inflight_tasks: 0,
        }
    }

    async fn registry(max_agents: u32) -> Registry {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        Registry::new(max_agents, store)
    }

    #[tokio::test]
    async fn register_then_lookup_round_trips() {
        let reg = registry(10).await;
        reg.register(sample_record("director")).await.unwrap();
        let found = reg.lookup("director").await.unwrap();
        assert_eq!(found.name, "director");
        assert_eq!(found.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn deregister_then_lookup_returns_none() {
        let reg = registry(10).await;
        reg.register(sample_record("director")).await.unwrap();
        reg.deregister("director").await.unwrap();
        assert!(reg.lookup("director").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let reg = registry(10).await;
        reg.register(sample_record("director")).await.unwrap();
        let result = reg.register(sample_record("director")).await;
        assert_eq!(result.unwrap_err(), CoreError::Conflict("director".to_string()));
    }

    #[tokio::test]
    async fn registry_full_at_boundary() {
        let reg = registry(1).await;
        reg.register(sample_record("a")).await.unwrap();
        let result = reg.register(sample_record("b")).await;
        assert_eq!(result.unwrap_err(), CoreError::RegistryFull);
    }

    #[tokio::test]
    async fn query_filters_by_capability() {
        let reg = registry(10).await;
        reg.register(sample_record("director")).await.unwrap();
        let mut other = sample_record("watcher");
        other.capabilities = HashSet::from(["monitor".to_string()]);
        reg.register(other).await.unwrap();

        let found = reg.query(Some("ping"), None).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "director");
    }
}
