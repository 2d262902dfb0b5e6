//! Agent registry and lifecycle state machine.
//!
//! Every mutation goes through [`AgentManager`], which enforces the status
//! graph and fans out a [`LifecycleEvent`] to observers once the mutation
//! has committed. Observers run after the registry lock is released, so a
//! handler may call back into the manager. A per-agent emit lock is held
//! from commit through fan-out, so each agent's events reach observers in
//! the order their transitions committed.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use alphie_core::{AgentId, TaskId};

use crate::critique::RubricScore;
use crate::error::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Paused,
    WaitingApproval,
    Done,
    Failed,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 6] = [
        AgentStatus::Pending,
        AgentStatus::Running,
        AgentStatus::Paused,
        AgentStatus::WaitingApproval,
        AgentStatus::Done,
        AgentStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed)
                | (Running, Paused | WaitingApproval | Done | Failed)
                | (Paused, Running | Failed)
                | (WaitingApproval, Running | Failed)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record for one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub task_id: TaskId,
    pub status: AgentStatus,
    pub worktree_path: PathBuf,
    /// Runner process id, 0 when not running.
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub tokens_used: u64,
    pub cost: f64,
    pub ralph_iteration: u32,
    pub ralph_score: Option<RubricScore>,
    pub error: Option<String>,
}

impl Agent {
    fn new(id: AgentId, task_id: TaskId, worktree_path: PathBuf) -> Self {
        Self {
            id,
            task_id,
            status: AgentStatus::Pending,
            worktree_path,
            pid: 0,
            created_at: Utc::now(),
            started_at: None,
            tokens_used: 0,
            cost: 0.0,
            ralph_iteration: 0,
            ralph_score: None,
            error: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Created,
    Started,
    Paused,
    Resumed,
    WaitingApproval,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    /// `None` for `created`.
    pub from: Option<AgentStatus>,
    pub to: AgentStatus,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

pub type LifecycleHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    agents: HashMap<AgentId, Agent>,
    handlers: Vec<LifecycleHandler>,
}

#[derive(Default)]
pub struct AgentManager {
    inner: Mutex<Registry>,
    // Reentrant so a handler may drive the same agent from inside a callback.
    emit_locks: DashMap<AgentId, Arc<ReentrantMutex<()>>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.lock().handlers.push(Arc::new(handler));
    }

    pub fn create(&self, task_id: TaskId, worktree_path: PathBuf) -> Result<Agent, AgentError> {
        self.create_with_id(AgentId::new(), task_id, worktree_path)
    }

    pub fn create_with_id(
        &self,
        id: AgentId,
        task_id: TaskId,
        worktree_path: PathBuf,
    ) -> Result<Agent, AgentError> {
        let order = self.emit_lock(&id);
        let _ordered = order.lock();
        let (agent, handlers) = {
            let mut reg = self.inner.lock();
            if reg.agents.contains_key(&id) {
                return Err(AgentError::AlreadyExists(id));
            }
            let agent = Agent::new(id.clone(), task_id, worktree_path);
            let _ = reg.agents.insert(id, agent.clone());
            (agent, reg.handlers.clone())
        };

        info!(agent_id = %agent.id, task_id = %agent.task_id, "agent created");
        emit(
            &handlers,
            &LifecycleEvent {
                kind: LifecycleEventKind::Created,
                agent_id: agent.id.clone(),
                task_id: agent.task_id.clone(),
                from: None,
                to: AgentStatus::Pending,
                timestamp: Utc::now(),
                error: None,
            },
        );
        Ok(agent)
    }

    /// `pending → running`.
    pub fn start(&self, id: &AgentId, pid: u32) -> Result<Agent, AgentError> {
        self.transition(id, AgentStatus::Running, LifecycleEventKind::Started, Some(pid), None)
    }

    pub fn pause(&self, id: &AgentId) -> Result<Agent, AgentError> {
        self.transition(id, AgentStatus::Paused, LifecycleEventKind::Paused, None, None)
    }

    /// `paused | waiting_approval → running`.
    pub fn resume(&self, id: &AgentId, pid: u32) -> Result<Agent, AgentError> {
        self.transition(id, AgentStatus::Running, LifecycleEventKind::Resumed, Some(pid), None)
    }

    pub fn wait_approval(&self, id: &AgentId) -> Result<Agent, AgentError> {
        self.transition(
            id,
            AgentStatus::WaitingApproval,
            LifecycleEventKind::WaitingApproval,
            None,
            None,
        )
    }

    pub fn complete(&self, id: &AgentId) -> Result<Agent, AgentError> {
        self.transition(id, AgentStatus::Done, LifecycleEventKind::Completed, None, None)
    }

    pub fn fail(&self, id: &AgentId, reason: &str) -> Result<Agent, AgentError> {
        self.transition(
            id,
            AgentStatus::Failed,
            LifecycleEventKind::Failed,
            None,
            Some(reason.to_string()),
        )
    }

    fn transition(
        &self,
        id: &AgentId,
        to: AgentStatus,
        kind: LifecycleEventKind,
        pid: Option<u32>,
        error: Option<String>,
    ) -> Result<Agent, AgentError> {
        let order = self.emit_lock(id);
        let _ordered = order.lock();
        let (agent, from, handlers) = {
            let mut reg = self.inner.lock();
            let agent = reg
                .agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.clone()))?;
            let from = agent.status;
            if !from.can_transition_to(to) {
                warn!(agent_id = %id, %from, %to, "rejected invalid transition");
                return Err(AgentError::InvalidTransition { from, to });
            }

            agent.status = to;
            if to == AgentStatus::Running {
                agent.pid = pid.unwrap_or(agent.pid);
                if agent.started_at.is_none() {
                    agent.started_at = Some(Utc::now());
                }
            } else {
                agent.pid = 0;
            }
            if error.is_some() {
                agent.error.clone_from(&error);
            }
            let snapshot = agent.clone();
            (snapshot, from, reg.handlers.clone())
        };

        debug!(agent_id = %id, %from, %to, "agent transition");
        emit(
            &handlers,
            &LifecycleEvent {
                kind,
                agent_id: agent.id.clone(),
                task_id: agent.task_id.clone(),
                from: Some(from),
                to,
                timestamp: Utc::now(),
                error,
            },
        );
        Ok(agent)
    }

    pub fn get(&self, id: &AgentId) -> Result<Agent, AgentError> {
        self.inner
            .lock()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(id.clone()))
    }

    pub fn get_status(&self, id: &AgentId) -> Result<AgentStatus, AgentError> {
        self.inner
            .lock()
            .agents
            .get(id)
            .map(|a| a.status)
            .ok_or_else(|| AgentError::NotFound(id.clone()))
    }

    /// All agents, oldest first.
    pub fn list(&self) -> Vec<Agent> {
        self.filtered(|_| true)
    }

    pub fn list_by_task(&self, task_id: &TaskId) -> Vec<Agent> {
        self.filtered(|a| &a.task_id == task_id)
    }

    pub fn list_by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.filtered(|a| a.status == status)
    }

    fn filtered(&self, pred: impl Fn(&Agent) -> bool) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .inner
            .lock()
            .agents
            .values()
            .filter(|a| pred(a))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    /// Record cumulative token and cost totals. Counters never decrease.
    pub fn update_usage(&self, id: &AgentId, tokens: u64, cost: f64) -> Result<(), AgentError> {
        let mut reg = self.inner.lock();
        let agent = reg
            .agents
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        agent.tokens_used = agent.tokens_used.max(tokens);
        agent.cost = agent.cost.max(cost);
        Ok(())
    }

    pub fn update_ralph(
        &self,
        id: &AgentId,
        iteration: u32,
        score: Option<RubricScore>,
    ) -> Result<(), AgentError> {
        let mut reg = self.inner.lock();
        let agent = reg
            .agents
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        agent.ralph_iteration = iteration;
        agent.ralph_score = score;
        Ok(())
    }

    /// Drop the record. Does not touch the underlying runner.
    pub fn remove(&self, id: &AgentId) -> Result<Agent, AgentError> {
        let removed = self
            .inner
            .lock()
            .agents
            .remove(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        let _ = self.emit_locks.remove(id);
        Ok(removed)
    }

    fn emit_lock(&self, id: &AgentId) -> Arc<ReentrantMutex<()>> {
        self.emit_locks.entry(id.clone()).or_default().clone()
    }

    /// Insert an existing record, e.g. when recovering a session.
    pub fn load(&self, agent: Agent) -> Result<(), AgentError> {
        let mut reg = self.inner.lock();
        if reg.agents.contains_key(&agent.id) {
            return Err(AgentError::AlreadyExists(agent.id));
        }
        let _ = reg.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn emit(handlers: &[LifecycleHandler], event: &LifecycleEvent) {
    for handler in handlers {
        handler(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Weak;

    fn recorder(mgr: &AgentManager) -> Arc<Mutex<Vec<LifecycleEventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mgr.on_event(move |e| sink.lock().push(e.kind));
        seen
    }

    #[test]
    fn happy_path_emits_in_order() {
        let mgr = AgentManager::new();
        let seen = recorder(&mgr);
        let agent = mgr.create(TaskId::from("t1"), PathBuf::from("/wt")).unwrap();
        assert_eq!(agent.status, AgentStatus::Pending);

        let running = mgr.start(&agent.id, 1234).unwrap();
        assert_eq!(running.pid, 1234);
        assert!(running.started_at.is_some());

        let done = mgr.complete(&agent.id).unwrap();
        assert_eq!(done.status, AgentStatus::Done);
        assert_eq!(done.pid, 0);
        assert_eq!(
            *seen.lock(),
            vec![
                LifecycleEventKind::Created,
                LifecycleEventKind::Started,
                LifecycleEventKind::Completed
            ]
        );
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let mgr = AgentManager::new();
        let agent = mgr.create(TaskId::from("t1"), PathBuf::new()).unwrap();
        let _ = mgr.start(&agent.id, 1).unwrap();
        let _ = mgr.complete(&agent.id).unwrap();
        let err = mgr.start(&agent.id, 2).unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidTransition {
                from: AgentStatus::Done,
                to: AgentStatus::Running
            }
        ));
        assert_eq!(err.to_string(), "invalid state transition: done -> running");
        assert_eq!(mgr.get_status(&agent.id).unwrap(), AgentStatus::Done);
        assert_eq!(mgr.get(&agent.id).unwrap().pid, 0);
    }

    #[test]
    fn pending_to_done_is_rejected() {
        let mgr = AgentManager::new();
        let agent = mgr.create(TaskId::from("t"), PathBuf::new()).unwrap();
        assert!(mgr.complete(&agent.id).is_err());
        assert_eq!(mgr.get_status(&agent.id).unwrap(), AgentStatus::Pending);
    }

    #[test]
    fn pause_resume_and_approval() {
        let mgr = AgentManager::new();
        let seen = recorder(&mgr);
        let id = mgr.create(TaskId::from("t"), PathBuf::new()).unwrap().id;
        let _ = mgr.start(&id, 10).unwrap();
        assert_eq!(mgr.pause(&id).unwrap().pid, 0);
        assert_eq!(mgr.resume(&id, 11).unwrap().pid, 11);
        let _ = mgr.wait_approval(&id).unwrap();
        let _ = mgr.resume(&id, 12).unwrap();
        let failed = mgr.fail(&id, "boom").unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(seen.lock().last(), Some(&LifecycleEventKind::Failed));
    }

    #[test]
    fn duplicate_ids_and_load() {
        let mgr = AgentManager::new();
        let id = AgentId::from("a1");
        let agent = mgr.create_with_id(id.clone(), TaskId::from("t"), PathBuf::new()).unwrap();
        let err = mgr
            .create_with_id(id.clone(), TaskId::from("t"), PathBuf::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "agent already exists: a1");
        assert!(mgr.load(agent.clone()).is_err());

        let _ = mgr.remove(&id).unwrap();
        mgr.load(agent).unwrap();
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn missing_agent() {
        let mgr = AgentManager::new();
        let err = mgr.start(&AgentId::from("nope"), 1).unwrap_err();
        assert_eq!(err.to_string(), "agent not found: nope");
        assert!(mgr.update_usage(&AgentId::from("nope"), 1, 0.1).is_err());
    }

    #[test]
    fn listing_and_counters() {
        let mgr = AgentManager::new();
        let a = mgr.create(TaskId::from("t1"), PathBuf::new()).unwrap().id;
        let _b = mgr.create(TaskId::from("t2"), PathBuf::new()).unwrap().id;
        let _ = mgr.start(&a, 5).unwrap();
        assert_eq!(mgr.list().len(), 2);
        assert_eq!(mgr.list_by_task(&TaskId::from("t1")).len(), 1);
        assert_eq!(mgr.list_by_status(AgentStatus::Running).len(), 1);

        mgr.update_usage(&a, 100, 0.5).unwrap();
        mgr.update_usage(&a, 50, 0.1).unwrap();
        let agent = mgr.get(&a).unwrap();
        assert_eq!(agent.tokens_used, 100);
        assert!((agent.cost - 0.5).abs() < f64::EPSILON);

        let score = RubricScore::new(3, 2, 2).unwrap();
        mgr.update_ralph(&a, 2, Some(score)).unwrap();
        assert_eq!(mgr.get(&a).unwrap().ralph_score, Some(score));
    }

    #[test]
    fn handlers_may_reenter() {
        let mgr = Arc::new(AgentManager::new());
        let weak: Weak<AgentManager> = Arc::downgrade(&mgr);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        mgr.on_event(move |e| {
            if let Some(mgr) = weak.upgrade() {
                sink.lock().push(mgr.get_status(&e.agent_id).ok());
                let _ = mgr.list();
            }
        });
        let id = mgr.create(TaskId::from("t"), PathBuf::new()).unwrap().id;
        let _ = mgr.start(&id, 1).unwrap();
        assert_eq!(
            *observed.lock(),
            vec![Some(AgentStatus::Pending), Some(AgentStatus::Running)]
        );
    }

    #[test]
    fn racing_transitions_emit_a_continuous_chain() {
        for _ in 0..50 {
            let mgr = Arc::new(AgentManager::new());
            let chain = Arc::new(Mutex::new(Vec::new()));
            let sink = chain.clone();
            mgr.on_event(move |e| {
                if let Some(from) = e.from {
                    sink.lock().push((from, e.to));
                }
            });
            let id = mgr.create(TaskId::from("t"), PathBuf::new()).unwrap().id;
            let _ = mgr.start(&id, 1).unwrap();

            let workers: Vec<_> = (0..4)
                .map(|n| {
                    let mgr = mgr.clone();
                    let id = id.clone();
                    std::thread::spawn(move || {
                        for _ in 0..20 {
                            let _ = mgr.pause(&id);
                            let _ = mgr.resume(&id, n);
                        }
                        if n == 3 {
                            let _ = mgr.fail(&id, "stop");
                        }
                    })
                })
                .collect();
            for w in workers {
                w.join().unwrap();
            }

            let chain = chain.lock();
            assert_eq!(chain[0], (AgentStatus::Pending, AgentStatus::Running));
            for pair in chain.windows(2) {
                assert_eq!(pair[0].1, pair[1].0, "events out of order: {chain:?}");
            }
            assert_eq!(chain.last().unwrap().1, mgr.get_status(&id).unwrap());
        }
    }

    #[test]
    fn concurrent_reads_do_not_deadlock() {
        let mgr = Arc::new(AgentManager::new());
        let id = mgr.create(TaskId::from("t"), PathBuf::from("/wt")).unwrap().id;
        let _ = mgr.start(&id, 42).unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let mgr = mgr.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    let agent = mgr.get(&id).unwrap();
                    assert_eq!(agent.pid, 42);
                    assert_eq!(mgr.get_status(&id).unwrap(), AgentStatus::Running);
                    assert_eq!(mgr.list().len(), 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[derive(Clone, Debug)]
    enum Op {
        Start,
        Pause,
        Resume,
        WaitApproval,
        Complete,
        Fail,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Pause),
            Just(Op::Resume),
            Just(Op::WaitApproval),
            Just(Op::Complete),
            Just(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn status_follows_graph(ops in proptest::collection::vec(arb_op(), 0..20)) {
            let mgr = AgentManager::new();
            let id = mgr.create(TaskId::from("t"), PathBuf::new()).unwrap().id;
            for op in ops {
                let before = mgr.get(&id).unwrap();
                let result = match op {
                    Op::Start => mgr.start(&id, 7),
                    Op::Pause => mgr.pause(&id),
                    Op::Resume => mgr.resume(&id, 8),
                    Op::WaitApproval => mgr.wait_approval(&id),
                    Op::Complete => mgr.complete(&id),
                    Op::Fail => mgr.fail(&id, "x"),
                };
                let after = mgr.get(&id).unwrap();
                match result {
                    Ok(agent) => {
                        prop_assert!(before.status.can_transition_to(agent.status));
                        prop_assert_eq!(agent.status, after.status);
                    }
                    Err(_) => prop_assert_eq!(&before, &after),
                }
                if after.status.is_terminal() {
                    prop_assert_eq!(after.pid, 0);
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_edges() {
        for to in AgentStatus::ALL {
            assert!(!AgentStatus::Done.can_transition_to(to));
            assert!(!AgentStatus::Failed.can_transition_to(to));
        }
    }
}
