//! Planner / Dependency Scheduler (spec.md §4.4).
//!
//! Generalizes the teacher's `OrchestratorEngine` (`core::orchestration`) —
//! a single priority-sorted `Vec<Task>` drained by one polling loop — into
//! a DAG executor that computes dependency waves and dispatches each wave
//! through the router. The teacher's `tokio::sync::RwLock<TaskQueue>` plus
//! a 100ms poll becomes a `RwLock<HashMap<PlanId, Plan>>` plus one
//! `tokio::spawn`'d driver per submitted plan — same concurrency shape,
//! different scheduling discipline.
//!
//! Cyclic dependencies are never modeled as a pointer graph (spec.md §9
//! redesign note): [`build_graph`] lowers a plan's tasks to two parallel
//! arrays — `ids` and `edges`, both indexed by position — and cycle
//! detection plus wave computation both run as one Kahn's-algorithm pass
//! over that representation.

use agentmesh_shared::ids::{PlanId, TaskId};
use agentmesh_shared::model::{
    FailurePolicy, Plan, PlanStatus, Priority, TaskNode, TaskStatus,
};
use agentmesh_shared::{CoreError, CoreResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::registry::Registry;
use crate::router::Router;
use crate::store::{Checkpoint, Store};

const REPLAN_FAILURE_RATIO: f64 = 0.30;
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Live thermal state, supplied by a platform-specific sensor outside
/// the core (spec.md §4.4). The core only ever reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalState {
    Normal,
    Hot,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub max_parallel: u32,
    pub backpressure_level: u8,
}

pub trait ThermalSensor: Send + Sync {
    fn thermal_state(&self) -> ThermalState;
}

pub trait CapacitySensor: Send + Sync {
    fn capacity(&self) -> Capacity;
}

/// Default sensor pair for deployments with no platform-specific hook
/// wired in: always reports a calm, unconstrained system.
pub struct AlwaysNormal;

impl ThermalSensor for AlwaysNormal {
    fn thermal_state(&self) -> ThermalState {
        ThermalState::Normal
    }
}

impl CapacitySensor for AlwaysNormal {
    fn capacity(&self) -> Capacity {
        Capacity {
            max_parallel: 64,
            backpressure_level: 0,
        }
    }
}

/// The two-parallel-array DAG representation used for both cycle
/// detection and wave computation.
struct Graph {
    ids: Vec<TaskId>,
    /// `edges[i]` holds the indices of tasks that index `i` depends on.
    edges: Vec<Vec<usize>>,
}

fn build_graph(tasks: &[TaskNode]) -> CoreResult<Graph> {
    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
    let index_of: HashMap<TaskId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut edges = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut deps = Vec::with_capacity(task.depends_on.len());
        for dep in &task.depends_on {
            let idx = index_of
                .get(dep)
                .ok_or_else(|| CoreError::PlanInvalid(format!("unknown dependency {dep}")))?;
            deps.push(*idx);
        }
        edges.push(deps);
    }

    Ok(Graph { ids, edges })
}

/// Kahn's algorithm over `graph`, returning waves of indices. An error
/// means a cycle was found before every node was scheduled.
fn topological_waves(graph: &Graph) -> CoreResult<Vec<Vec<usize>>> {
    let n = graph.ids.len();
    let mut in_degree = vec![0usize; n];
    for deps in &graph.edges {
        // in_degree here tracks "number of unresolved dependents", i.e.
        // how many nodes point to this one as a dependency consumer is
        // irrelevant; we need reverse adjacency for Kahn on "depends_on".
        let _ = deps;
    }
    // Build reverse adjacency: dependents[i] = nodes that depend on i.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, deps) in graph.edges.iter().enumerate() {
        in_degree[i] = deps.len();
        for &dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut waves = Vec::new();
    let mut remaining = in_degree.clone();
    let mut scheduled = vec![false; n];
    let mut scheduled_count = 0;

    loop {
        let wave: Vec<usize> = (0..n)
            .filter(|&i| !scheduled[i] && remaining[i] == 0)
            .collect();
        if wave.is_empty() {
            break;
        }
        for &i in &wave {
            scheduled[i] = true;
            scheduled_count += 1;
            for &dependent in &dependents[i] {
                remaining[dependent] -= 1;
            }
        }
        waves.push(wave);
    }

    if scheduled_count != n {
        return Err(CoreError::PlanInvalid("cycle detected".to_string()));
    }
    Ok(waves)
}

pub struct Planner {
    registry: Arc<Registry>,
    router: Arc<Router>,
    store: Arc<dyn Store>,
    thermal: Arc<dyn ThermalSensor>,
    capacity: Arc<dyn CapacitySensor>,
    plans: RwLock<HashMap<PlanId, Plan>>,
}

impl Planner {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        store: Arc<dyn Store>,
        thermal: Arc<dyn ThermalSensor>,
        capacity: Arc<dyn CapacitySensor>,
    ) -> Self {
        Self {
            registry,
            router,
            store,
            thermal,
            capacity,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Validates the DAG (acyclic, every dependency and assigned
    /// agent/capability resolvable) and admits the plan for execution.
    /// Does not itself drive execution — callers spawn [`Self::run`].
    pub async fn submit(&self, mut plan: Plan) -> CoreResult<PlanId> {
        let graph = build_graph(&plan.tasks)?;
        topological_waves(&graph)?;

        for task in &plan.tasks {
            if let Some(agent) = &task.assigned_agent {
                if self.registry.lookup(agent).await.is_none() {
                    return Err(CoreError::PlanInvalid(format!("assigned agent {agent} not registered")));
                }
            } else if let Some(capability) = &task.required_capability {
                if self.registry.query(Some(capability), None).await.is_empty() {
                    return Err(CoreError::NoCapableAgent(capability.clone()));
                }
            } else {
                return Err(CoreError::PlanInvalid(format!(
                    "task {} has neither an assigned agent nor a required capability",
                    task.id
                )));
            }
        }

        plan.status = PlanStatus::Planning;
        let plan_id = plan.id;
        self.plans.write().await.insert(plan_id, plan);
        info!("plan {plan_id} admitted");
        Ok(plan_id)
    }

    pub async fn status(&self, plan_id: PlanId) -> CoreResult<PlanStatus> {
        self.plans
            .read()
            .await
            .get(&plan_id)
            .map(|p| p.status)
            .ok_or_else(|| CoreError::NotFound(plan_id.to_string()))
    }

    pub async fn get(&self, plan_id: PlanId) -> CoreResult<Plan> {
        self.plans
            .read()
            .await
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(plan_id.to_string()))
    }

    pub async fn cancel(&self, plan_id: PlanId) -> CoreResult<()> {
        let mut plans = self.plans.write().await;
        let plan = plans.get_mut(&plan_id).ok_or_else(|| CoreError::NotFound(plan_id.to_string()))?;
        for task in plan.tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Running | TaskStatus::ThermalDeferred) {
                task.status = TaskStatus::Cancelled;
            }
        }
        plan.status = PlanStatus::Cancelled;
        Ok(())
    }

    /// Drives a submitted plan to completion, wave by wave, until
    /// `cancel` is notified or no tasks remain eligible to run.
    pub async fn run(self: Arc<Self>, plan_id: PlanId, cancel: Arc<Notify>) {
        {
            let mut plans = self.plans.write().await;
            if let Some(plan) = plans.get_mut(&plan_id) {
                plan.status = PlanStatus::Running;
            }
        }

        loop {
            if tokio::select! {
                _ = cancel.notified() => true,
                _ = tokio::time::sleep(Duration::from_millis(0)) => false,
            } {
                let _ = self.cancel(plan_id).await;
                break;
            }

            let should_stop = self.run_one_wave(plan_id).await;
            if should_stop {
                break;
            }
        }

        self.finalize(plan_id).await;
    }

    /// Executes exactly one wave (respecting thermal/capacity gating)
    /// and applies its results. Returns `true` when there is nothing
    /// left runnable (plan is done, blocked, or failed-fast).
    async fn run_one_wave(&self, plan_id: PlanId) -> bool {
        let (graph, failure_policy, tasks_snapshot) = {
            let plans = self.plans.read().await;
            let Some(plan) = plans.get(&plan_id) else { return true };
            match build_graph(&plan.tasks) {
                Ok(g) => (g, plan.failure_policy.clone(), plan.tasks.clone()),
                Err(_) => return true,
            }
        };

        self.propagate_skips(plan_id, &graph, &failure_policy).await;

        let tasks_snapshot = self.get(plan_id).await.map(|p| p.tasks).unwrap_or(tasks_snapshot);
        let ready = self.ready_indices(&graph, &tasks_snapshot);
        if ready.is_empty() {
            return true;
        }

        let thermal = self.thermal.thermal_state();
        let capacity = self.capacity.capacity();
        let live_agents = self.registry.snapshot().await.len() as u32;
        let base_parallelism = capacity.max_parallel.min(live_agents.max(1));

        let (dispatchable, deferred, parallelism) = match thermal {
            ThermalState::Critical => {
                let (critical, rest): (Vec<usize>, Vec<usize>) = ready
                    .into_iter()
                    .partition(|&i| tasks_snapshot[i].priority == Priority::Critical);
                (critical, rest, 1u32)
            }
            ThermalState::Hot => (ready, Vec::new(), (base_parallelism / 2).max(1)),
            ThermalState::Normal => (ready, Vec::new(), base_parallelism),
        };

        if !deferred.is_empty() {
            let mut plans = self.plans.write().await;
            if let Some(plan) = plans.get_mut(&plan_id) {
                for &i in &deferred {
                    plan.tasks[i].status = TaskStatus::ThermalDeferred;
                }
            }
        }

        if dispatchable.is_empty() {
            return false;
        }

        let wave: Vec<usize> = dispatchable.into_iter().take(parallelism as usize).collect();
        let fail_fast = matches!(failure_policy, FailurePolicy::FailFast);

        let mut outcomes = Vec::with_capacity(wave.len());
        for &idx in &wave {
            let task = tasks_snapshot[idx].clone();
            let outcome = self.execute_task(plan_id, &task).await;
            let failed = outcome.is_err();
            outcomes.push((idx, outcome));
            if fail_fast && failed {
                break;
            }
        }

        let mut checkpoints = Vec::new();
        {
            let mut plans = self.plans.write().await;
            if let Some(plan) = plans.get_mut(&plan_id) {
                for (idx, outcome) in outcomes {
                    match outcome {
                        Ok(result_hash) => {
                            plan.tasks[idx].status = TaskStatus::Completed;
                            checkpoints.push(Checkpoint {
                                plan_id,
                                task_id: plan.tasks[idx].id,
                                result_hash,
                            });
                        }
                        Err(_) => {
                            plan.tasks[idx].status = TaskStatus::Failed;
                        }
                    }
                }
            }
        }
        if !checkpoints.is_empty() {
            let _ = self.store.bulk_append_checkpoints(&checkpoints).await;
        }

        if fail_fast && self.get(plan_id).await.map(|p| p.tasks.iter().any(|t| t.status == TaskStatus::Failed)).unwrap_or(false) {
            return true;
        }

        if self.should_replan(plan_id).await {
            warn!("plan {plan_id} triggered a replan");
        }

        false
    }

    fn ready_indices(&self, graph: &Graph, tasks: &[TaskNode]) -> Vec<usize> {
        (0..graph.ids.len())
            .filter(|&i| matches!(tasks[i].status, TaskStatus::Pending | TaskStatus::ThermalDeferred))
            .filter(|&i| {
                graph.edges[i]
                    .iter()
                    .all(|&dep| matches!(tasks[dep].status, TaskStatus::Completed | TaskStatus::Skipped))
            })
            .collect()
    }

    /// Marks any pending task `Skipped` when `failure_policy == Skip`
    /// and at least one of its transitive dependencies has failed
    /// (spec.md §8 scenario 4).
    async fn propagate_skips(&self, plan_id: PlanId, graph: &Graph, policy: &FailurePolicy) {
        if !matches!(policy, FailurePolicy::Skip) {
            return;
        }
        let mut plans = self.plans.write().await;
        let Some(plan) = plans.get_mut(&plan_id) else { return };

        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..graph.ids.len() {
                if !matches!(plan.tasks[i].status, TaskStatus::Pending) {
                    continue;
                }
                let blocked = graph.edges[i].iter().any(|&dep| {
                    matches!(plan.tasks[dep].status, TaskStatus::Failed | TaskStatus::Skipped)
                });
                if blocked {
                    plan.tasks[i].status = TaskStatus::Skipped;
                    changed = true;
                }
            }
        }
    }

    async fn should_replan(&self, plan_id: PlanId) -> bool {
        let Ok(plan) = self.get(plan_id).await else { return false };
        let remaining: Vec<&TaskNode> = plan
            .tasks
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Cancelled))
            .collect();
        if remaining.is_empty() {
            return false;
        }
        let failed = remaining.iter().filter(|t| t.status == TaskStatus::Failed).count();
        failed as f64 / remaining.len() as f64 >= REPLAN_FAILURE_RATIO
    }

    /// Selects the least-loaded agent offering `task`'s capability (or
    /// its explicit assignment), dispatches via the router, and awaits
    /// the result up to the task's deadline or a default timeout.
    async fn execute_task(&self, plan_id: PlanId, task: &TaskNode) -> CoreResult<[u8; 32]> {
        if let Some(checkpoint) = self.store.get_checkpoint(plan_id, task.id).await.ok().flatten() {
            info!("task {} already checkpointed, skipping re-execution", task.id);
            return Ok(checkpoint.result_hash);
        }

        let target = if let Some(agent) = &task.assigned_agent {
            agent.clone()
        } else {
            let capability = task.required_capability.as_deref();
            let mut candidates = self.registry.query(capability, None).await;
            candidates.sort_by_key(|r| (r.inflight_tasks, r.heartbeat_age()));
            candidates
                .into_iter()
                .next()
                .map(|r| r.name)
                .ok_or_else(|| CoreError::NoCapableAgent(capability.unwrap_or("").to_string()))?
        };

        self.registry.mark_inflight(&target, 1).await;
        let result = self.dispatch_and_await(&target, task).await;
        self.registry.mark_inflight(&target, -1).await;
        result
    }

    async fn dispatch_and_await(&self, target: &str, task: &TaskNode) -> CoreResult<[u8; 32]> {
        use agentmesh_shared::ids::MessageId;
        use agentmesh_shared::model::{Message, Pattern};

        let message_id = MessageId::new();
        let deadline = Some(chrono::Utc::now() + chrono::Duration::from_std(DEFAULT_TASK_TIMEOUT).unwrap());
        let message = Message {
            id: message_id,
            source_name: "planner".to_string(),
            target_names: vec![target.to_string()],
            pattern: Pattern::RequestResponse,
            priority: task.priority,
            correlation_id: None,
            requires_ack: true,
            deadline,
            content_type: "application/json".to_string(),
            payload: serde_json::to_vec(&task.inputs).unwrap_or_default(),
            integrity_tag: None,
        };

        self.router.send(message).await?;
        let response = self.router.await_response(message_id, deadline).await?;

        let mut hash = [0u8; 32];
        let digest_input = &response.payload;
        for (i, chunk) in digest_input.chunks(32).enumerate() {
            for (j, byte) in chunk.iter().enumerate() {
                hash[j] ^= byte.wrapping_add(i as u8);
            }
        }
        Ok(hash)
    }

    async fn finalize(&self, plan_id: PlanId) {
        let mut plans = self.plans.write().await;
        let Some(plan) = plans.get_mut(&plan_id) else { return };
        if plan.status == PlanStatus::Cancelled {
            return;
        }

        let statuses: HashSet<TaskStatus> = plan.tasks.iter().map(|t| t.status).collect();
        plan.status = if statuses.iter().all(|s| *s == TaskStatus::Completed) {
            PlanStatus::Completed
        } else if statuses.contains(&TaskStatus::Failed)
            && matches!(plan.failure_policy, FailurePolicy::FailFast)
        {
            PlanStatus::Failed
        } else if statuses.contains(&TaskStatus::Failed) || statuses.contains(&TaskStatus::Skipped) {
            PlanStatus::Partial
        } else {
            PlanStatus::Running
        };
        info!("plan {plan_id} finalized as {:?}", plan.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::Monitoring;
    use crate::store::SledStore;
    use agentmesh_shared::model::{AgentRecord, AgentStatus, PermissionBitmask, Role, TransportTier};
    use std::collections::{HashMap as Map, HashSet};
    use std::time::Instant;

    struct FixedThermal(std::sync::Mutex<ThermalState>);
    impl ThermalSensor for FixedThermal {
        fn thermal_state(&self) -> ThermalState {
            *self.0.lock().unwrap()
        }
    }

    async fn planner_with(thermal: ThermalState) -> (Arc<Planner>, Arc<Registry>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let registry = Arc::new(Registry::new(1024, store.clone()));
        let monitoring = Arc::new(Monitoring::new());
        let router = Arc::new(Router::new(registry.clone(), monitoring, dir.path().join("spill")));
        let thermal_sensor = Arc::new(FixedThermal(std::sync::Mutex::new(thermal)));
        let planner = Arc::new(Planner::new(
            registry.clone(),
            router,
            store,
            thermal_sensor,
            Arc::new(AlwaysNormal),
        ));
        (planner, registry)
    }

    fn agent(name: &str, capability: &str) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            uuid: ulid::Ulid::new(),
            role: Role::User,
            permission_bitmask: PermissionBitmask::for_role(Role::User),
            capabilities: HashSet::from([capability.to_string()]),
            status: AgentStatus::Idle,
            transport_endpoints: Map::new(),
            preferred_tier: TransportTier::StreamSocket,
            last_heartbeat_at: Instant::now(),
            inflight_tasks: 0,
        }
    }

    fn task(id: TaskId, depends_on: &[TaskId], priority: Priority) -> TaskNode {
        TaskNode {
            id,
            action: "noop".to_string(),
            assigned_agent: None,
            required_capability: Some("run".to_string()),
            priority,
            inputs: serde_json::json!({}),
            depends_on: depends_on.iter().copied().collect(),
            status: TaskStatus::Pending,
            result: None,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn cyclic_dag_is_rejected() {
        let (planner, registry) = planner_with(ThermalState::Normal).await;
        registry.register(agent("w1", "run")).await.unwrap();

        let t1 = TaskId::new();
        let t2 = TaskId::new();
        let n1 = task(t1, &[t2], Priority::Normal);
        let n2 = task(t2, &[t1], Priority::Normal);

        let plan = Plan {
            id: PlanId::new(),
            name: "cycle".into(),
            tasks: vec![n1, n2],
            failure_policy: FailurePolicy::FailFast,
            status: PlanStatus::Planning,
        };
        let result = planner.submit(plan).await;
        assert!(matches!(result, Err(CoreError::PlanInvalid(_))));
    }

    #[tokio::test]
    async fn independent_tasks_land_in_the_same_wave() {
        let (_planner, _registry) = planner_with(ThermalState::Normal).await;
        let t1 = TaskId::new();
        let t2 = TaskId::new();
        let tasks = vec![task(t1, &[], Priority::Normal), task(t2, &[], Priority::Normal)];
        let graph = build_graph(&tasks).unwrap();
        let waves = topological_waves(&graph).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected() {
        let (planner, registry) = planner_with(ThermalState::Normal).await;
        registry.register(agent("w1", "run")).await.unwrap();

        let t1 = TaskId::new();
        let ghost = TaskId::new();
        let plan = Plan {
            id: PlanId::new(),
            name: "dangling".into(),
            tasks: vec![task(t1, &[ghost], Priority::Normal)],
            failure_policy: FailurePolicy::FailFast,
            status: PlanStatus::Planning,
        };
        let result = planner.submit(plan).await;
        assert!(matches!(result, Err(CoreError::PlanInvalid(_))));
    }

    #[tokio::test]
    async fn skip_propagates_past_a_failed_dependency() {
        let (planner, registry) = planner_with(ThermalState::Normal).await;
        registry.register(agent("w1", "run")).await.unwrap();

        let t1 = TaskId::new();
        let t2 = TaskId::new();
        let t3 = TaskId::new();
        let t4 = TaskId::new();
        let plan_id = PlanId::new();
        let mut plan = Plan {
            id: plan_id,
            name: "skip-policy".into(),
            tasks: vec![
                task(t1, &[], Priority::Normal),
                task(t2, &[t1], Priority::Normal),
                task(t3, &[t1], Priority::Normal),
                task(t4, &[t2], Priority::Normal),
            ],
            failure_policy: FailurePolicy::Skip,
            status: PlanStatus::Planning,
        };
        plan.tasks[0].status = TaskStatus::Completed;
        plan.tasks[1].status = TaskStatus::Failed;
        plan.tasks[2].status = TaskStatus::Completed;

        planner.plans.write().await.insert(plan_id, plan);
        let graph = build_graph(&planner.get(plan_id).await.unwrap().tasks).unwrap();
        planner.propagate_skips(plan_id, &graph, &FailurePolicy::Skip).await;

        let final_plan = planner.get(plan_id).await.unwrap();
        assert_eq!(final_plan.tasks[3].status, TaskStatus::Skipped);
        planner.finalize(plan_id).await;
        assert_eq!(planner.status(plan_id).await.unwrap(), PlanStatus::Partial);
    }

    #[tokio::test]
    async fn thermal_critical_defers_non_critical_tasks() {
        let (planner, registry) = planner_with(ThermalState::Critical).await;
        registry.register(agent("w1", "run")).await.unwrap();

        let t1 = TaskId::new();
        let t2 = TaskId::new();
        let plan_id = PlanId::new();
        let plan = Plan {
            id: plan_id,
            name: "thermal".into(),
            tasks: vec![
                task(t1, &[], Priority::Critical),
                task(t2, &[], Priority::Normal),
            ],
            failure_policy: FailurePolicy::FailFast,
            status: PlanStatus::Planning,
        };
        planner.plans.write().await.insert(plan_id, plan);

        planner.run_one_wave(plan_id).await;

        let after = planner.get(plan_id).await.unwrap();
        let deferred = after.tasks.iter().find(|t| t.id == t2).unwrap();
        assert_eq!(deferred.status, TaskStatus::ThermalDeferred);
    }
}
