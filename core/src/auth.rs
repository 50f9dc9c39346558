//! Auth Gate (spec.md §4.1): authentication, authorization, and token
//! issuance guarding every admitted call into the Registry and Router.
//!
//! Structurally this is the teacher's `SecurityManager` (`core::security`)
//! generalized from a fixed `Capability` enum + bearer tokens to the
//! spec's session/bitmask model, with a sliding-window rate limiter and
//! an HKDF-derived per-session signing key added to close the two gaps
//! the teacher's version left (`// In production, this should use a
//! secure key management system`).

use agentmesh_shared::model::{PermissionBitmask, Role, SecurityEvent};
use agentmesh_shared::{CoreError, CoreResult};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use ring::hkdf;
use ring::hmac;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::Store;

const RATE_LIMIT_WINDOW_S: i64 = 60;
const RATE_LIMIT_MAX_FAILURES: usize = 10;
const RATE_LIMIT_LOCKOUT_S: i64 = 300;

/// Session admission context, re-exported for callers that only need the
/// auth gate's surface.
pub type Session = agentmesh_shared::model::Session;

struct FailureWindow {
    failures: VecDeque<chrono::DateTime<chrono::Utc>>,
    locked_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for FailureWindow {
    fn default() -> Self {
        Self {
            failures: VecDeque::new(),
            locked_until: None,
        }
    }
}

/// Guards admission into the rest of the core. One instance is shared
/// (via `Arc`) across the registry, router, and planner.
pub struct AuthGate {
    sessions: DashMap<String, Session>,
    rate_limits: DashMap<String, FailureWindow>,
    master_secret: Vec<u8>,
    session_ttl: Duration,
    store: Arc<dyn Store>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn Store>, session_ttl_s: u64, master_secret: Vec<u8>) -> Self {
        Self {
            sessions: DashMap::new(),
            rate_limits: DashMap::new(),
            master_secret,
            session_ttl: Duration::seconds(session_ttl_s as i64),
            store,
        }
    }

    /// Only callable via a trusted in-process path (bootstrap of agents
    /// by the parent runtime); there is no network-facing entry point
    /// that reaches this method.
    pub async fn issue(&self, agent_name: &str, role: Role) -> CoreResult<Session> {
        let token_id = ulid::Ulid::new().to_string();
        let session = Session {
            token_id: token_id.clone(),
            agent_name: agent_name.to_string(),
            role,
            permission_bitmask: PermissionBitmask::for_role(role),
            expires_at: Utc::now() + self.session_ttl,
            revoked: false,
        };

        self.sessions.insert(token_id.clone(), session.clone());
        let _ = self.store.put_session(&session).await;
        self.emit_event(
            "token_issued",
            EventSeverity::Info,
            Some(agent_name),
            serde_json::json!({ "token_id": token_id, "role": role }),
        )
        .await;

        info!("issued session {} for agent {}", token_id, agent_name);
        Ok(session)
    }

    /// Verifies a bearer token id against the in-memory session cache
    /// (falling back to the store on a cache miss), checks expiry and
    /// revocation, and records an audit event. Rate-limits repeated
    /// failures per `source` with a sliding window.
    pub async fn authenticate(&self, source: &str, token_id: &str) -> CoreResult<Session> {
        if let Some(retry_after) = self.check_rate_limit(source) {
            return Err(CoreError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let session = match self.sessions.get(token_id).map(|s| s.clone()) {
            Some(s) => Some(s),
            None => self.store.get_session(token_id).await.unwrap_or(None),
        };

        let now = Utc::now();
        let result = match session {
            None => Err(CoreError::InvalidToken),
            Some(s) if s.revoked => Err(CoreError::RevokedToken),
            Some(s) if now >= s.expires_at => Err(CoreError::ExpiredToken),
            Some(s) => Ok(s),
        };

        match &result {
            Ok(session) => {
                self.record_success(source);
                self.emit_event(
                    "authenticate",
                    EventSeverity::Info,
                    Some(&session.agent_name),
                    serde_json::json!({ "token_id": token_id, "outcome": "ok" }),
                )
                .await;
            }
            Err(err) => {
                self.record_failure(source);
                self.emit_event(
                    "authenticate",
                    EventSeverity::Info,
                    None,
                    serde_json::json!({ "token_id": token_id, "outcome": err.code() }),
                )
                .await;
            }
        }

        result
    }

    /// Bitmask AND against the action-specific permission bit.
    pub fn authorize(&self, session: &Session, required_permission: u64) -> CoreResult<()> {
        if session.permission_bitmask.contains(required_permission) {
            Ok(())
        } else {
            Err(CoreError::Unauthorized)
        }
    }

    pub async fn revoke(&self, token_id: &str) -> CoreResult<()> {
        if let Some(mut entry) = self.sessions.get_mut(token_id) {
            entry.revoked = true;
        }
        self.store.revoke_session(token_id).await?;
        self.emit_event(
            "session_revoked",
            EventSeverity::Info,
            None,
            serde_json::json!({ "token_id": token_id }),
        )
        .await;
        Ok(())
    }

    /// Derives a per-session HMAC-SHA256 signing key via HKDF-SHA256,
    /// salted with the session's `token_id` (spec.md §9 open question;
    /// decision recorded in DESIGN.md). The process-wide master secret
    /// never leaves this function.
    pub fn derive_signing_key(&self, session: &Session) -> hmac::Key {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, session.token_id.as_bytes());
        let prk = salt.extract(&self.master_secret);
        let okm = prk
            .expand(&[b"agentmesh-message-hmac"], HkdfLen)
            .expect("hkdf expand with fixed 32-byte length cannot fail");
        let mut key_bytes = [0u8; 32];
        okm.fill(&mut key_bytes).expect("hkdf fill of exactly 32 bytes cannot fail");
        hmac::Key::new(hmac::HMAC_SHA256, &key_bytes)
    }

    fn check_rate_limit(&self, source: &str) -> Option<u64> {
        let now = Utc::now();
        let window = self.rate_limits.get(source)?;
        let locked_until = window.locked_until?;
        if now < locked_until {
            Some((locked_until - now).num_seconds().max(1) as u64)
        } else {
            None
        }
    }

    fn record_failure(&self, source: &str) {
        let now = Utc::now();
        let mut window = self.rate_limits.entry(source.to_string()).or_default();
        while let Some(front) = window.failures.front() {
            if now.signed_duration_since(*front).num_seconds() > RATE_LIMIT_WINDOW_S {
                window.failures.pop_front();
            } else {
                break;
            }
        }
        window.failures.push_back(now);
        if window.failures.len() >= RATE_LIMIT_MAX_FAILURES {
            window.locked_until = Some(now + Duration::seconds(RATE_LIMIT_LOCKOUT_S));
            warn!("rate-limit lockout engaged for {source}");
        }
    }

    fn record_success(&self, source: &str) {
        if let Some(mut window) = self.rate_limits.get_mut(source) {
            window.failures.clear();
            window.locked_until = None;
        }
    }

    async fn emit_event(
        &self,
        event_type: &str,
        severity: EventSeverity,
        agent: Option<&str>,
        details: serde_json::Value,
    ) {
        let event = SecurityEvent {
            ts: Utc::now(),
            event_type: event_type.to_string(),
            severity: severity.into(),
            agent: agent.map(|a| a.to_string()),
            details,
        };
        if let Err(e) = self.store.append_event(&event).await {
            warn!("failed to persist security event {event_type}: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EventSeverity {
    Info,
}

impl From<EventSeverity> for agentmesh_shared::model::EventSeverity {
    fn from(s: EventSeverity) -> Self {
        match s {
            EventSeverity::Info => agentmesh_shared::model::EventSeverity::Info,
        }
    }
}

struct HkdfLen;

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockStore, SledStore};

    async fn gate() -> AuthGate {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        AuthGate::new(store, 3600, b"test-master-secret".to_vec())
    }

    /// `issue`/`authenticate` must stay usable off the in-memory session
    /// cache even when the persistent store is unreachable (spec.md §7:
    /// persistence errors degrade the core, they don't block admission).
    #[tokio::test]
    async fn issue_survives_a_failing_store() {
        let mut mock = MockStore::new();
        mock.expect_put_session().returning(|_| Err(CoreError::StoreUnavailable));
        mock.expect_append_event().returning(|_| Err(CoreError::StoreUnavailable));
        let gate = AuthGate::new(Arc::new(mock), 3600, b"test-master-secret".to_vec());

        let session = gate.issue("director", Role::Operator).await.unwrap();
        let fetched = gate.authenticate("127.0.0.1", &session.token_id).await.unwrap();
        assert_eq!(fetched.agent_name, "director");
    }

    #[tokio::test]
    async fn issue_then_authenticate_round_trips() {
        let gate = gate().await;
        let session = gate.issue("director", Role::Operator).await.unwrap();
        let fetched = gate.authenticate("127.0.0.1", &session.token_id).await.unwrap();
        assert_eq!(fetched.agent_name, "director");
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let gate = gate().await;
        let result = gate.authenticate("127.0.0.1", "nonexistent").await;
        assert_eq!(result.unwrap_err(), CoreError::InvalidToken);
    }

    #[tokio::test]
    async fn revoked_session_fails_every_subsequent_admission() {
        let gate = gate().await;
        let session = gate.issue("director", Role::Operator).await.unwrap();
        gate.revoke(&session.token_id).await.unwrap();
        let result = gate.authenticate("127.0.0.1", &session.token_id).await;
        assert_eq!(result.unwrap_err(), CoreError::RevokedToken);
    }

    #[tokio::test]
    async fn rate_limit_locks_out_after_ten_failures() {
        let gate = gate().await;
        for _ in 0..RATE_LIMIT_MAX_FAILURES {
            let _ = gate.authenticate("attacker", "bad-token").await;
        }
        let result = gate.authenticate("attacker", "bad-token").await;
        assert!(matches!(result, Err(CoreError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn derived_keys_differ_per_session() {
        let gate = gate().await;
        let s1 = gate.issue("a", Role::User).await.unwrap();
        let s2 = gate.issue("b", Role::User).await.unwrap();
        let k1 = gate.derive_signing_key(&s1);
        let k2 = gate.derive_signing_key(&s2);
        let tag1 = hmac::sign(&k1, b"payload");
        let tag2 = hmac::sign(&k2, b"payload");
        assert_ne!(tag1.as_ref(), tag2.as_ref());
    }

    #[tokio::test]
    async fn observer_cannot_send() {
        let gate = gate().await;
        let session = gate.issue("watcher", Role::Observer).await.unwrap();
        let result = gate.authorize(&session, agentmesh_shared::model::permission::SEND);
        assert_eq!(result.unwrap_err(), CoreError::Unauthorized);
    }
}
