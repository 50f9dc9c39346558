//! AgentMesh runtime library.
//!
//! Wires together the four subsystems — Auth Gate, Registry, Router, and
//! Planner — into a single [`Runtime`] the binary and integration tests
//! both construct the same way, mirroring how the teacher's
//! `init_system()` stood up its components before handing them to an
//! `OrchestratorEngine`.

pub mod auth;
pub mod config;
pub mod ipc;
pub mod monitoring;
pub mod planner;
pub mod registry;
pub mod router;
pub mod store;

use anyhow::{Context, Result};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

/// Live handles to every subsystem, plus the cancellation signal shared
/// by their background loops (registry sweeper, degraded-store watch).
pub struct Runtime {
    pub config: config::CoreConfig,
    pub auth: Arc<auth::AuthGate>,
    pub registry: Arc<registry::Registry>,
    pub router: Arc<router::Router>,
    pub planner: Arc<planner::Planner>,
    pub monitoring: Arc<monitoring::Monitoring>,
    store: Arc<dyn store::Store>,
    shutdown: Arc<Notify>,
}

impl Runtime {
    pub async fn bootstrap(config: config::CoreConfig) -> Result<Self> {
        let store: Arc<dyn store::Store> = Arc::new(
            store::SledStore::open(&config.store_url).context("failed to open persistent store")?,
        );

        let auth = Arc::new(auth::AuthGate::new(
            store.clone(),
            config.session_ttl_s,
            master_secret(),
        ));
        let registry = Arc::new(registry::Registry::new(config.max_agents, store.clone()));
        let monitoring = Arc::new(monitoring::Monitoring::new());

        let spill_dir = PathBuf::from(&config.store_url).join("spill");
        let router = Arc::new(router::Router::new(registry.clone(), monitoring.clone(), spill_dir));

        let planner = Arc::new(planner::Planner::new(
            registry.clone(),
            router.clone(),
            store.clone(),
            Arc::new(planner::AlwaysNormal),
            Arc::new(planner::AlwaysNormal),
        ));

        Ok(Self {
            config,
            auth,
            registry,
            router,
            planner,
            monitoring,
            store,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Spawns the registry sweeper and the degraded-store watch. Callers
    /// own the returned join handles only incidentally; shutdown is
    /// driven by [`Self::shutdown`], not by aborting these tasks.
    pub fn spawn_background_tasks(&self) {
        tokio::spawn(self.registry.clone().run_sweeper(self.shutdown.clone()));
        tokio::spawn(
            self.monitoring
                .clone()
                .run_degraded_store_watch(self.store.clone(), self.shutdown.clone()),
        );
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }
}

/// A process-wide HMAC master secret, read from `CORE_MASTER_SECRET`
/// (hex-encoded) if present, otherwise freshly generated. Per-session
/// signing keys are derived from this via HKDF in [`auth::AuthGate`];
/// it never goes on the wire itself.
fn master_secret() -> Vec<u8> {
    if let Ok(encoded) = std::env::var("CORE_MASTER_SECRET") {
        if let Ok(bytes) = hex::decode(encoded) {
            return bytes;
        }
        tracing::warn!("CORE_MASTER_SECRET is set but not valid hex; generating an ephemeral secret");
    }
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; 32];
    rng.fill(&mut bytes).expect("system RNG must be available");
    bytes
}

/// Installs the global `tracing` subscriber, honoring `RUST_LOG` when
/// set and falling back to `config.log_level` otherwise.
pub fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
