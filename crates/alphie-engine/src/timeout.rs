//! Soft per-agent deadlines.
//!
//! A timer never stops a runner on its own. When it expires a
//! [`TimeoutEvent`] is offered on the agent's channel and the caller picks a
//! [`TimeoutAction`]. Only `Kill` reaches the registered kill callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use alphie_core::{AgentId, Tier};
use alphie_settings::tier_table;

use crate::error::AgentError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub agent_id: AgentId,
    pub elapsed: Duration,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Stop the timer, close the channel and call the kill callback.
    Kill,
    /// Push the deadline out by half the tier timeout.
    Extend,
    /// Re-arm with the original tier timeout.
    Continue,
}

pub type KillCallback = Arc<dyn Fn(&AgentId) + Send + Sync>;

struct Timer {
    tier: Tier,
    base: Duration,
    started: Instant,
    deadline: Instant,
    tx: mpsc::Sender<TimeoutEvent>,
    task: JoinHandle<()>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct State {
    timers: HashMap<AgentId, Timer>,
    timeouts: HashMap<Tier, Duration>,
}

#[derive(Default)]
pub struct TimeoutHandler {
    state: Mutex<State>,
    on_kill: Mutex<Option<KillCallback>>,
}

fn arm(agent_id: AgentId, started: Instant, deadline: Instant, tx: mpsc::Sender<TimeoutEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let event = TimeoutEvent {
            agent_id: agent_id.clone(),
            elapsed: started.elapsed(),
            timeout: deadline - started,
        };
        match tx.try_send(event) {
            Ok(()) => info!(agent_id = %agent_id, "soft timeout expired"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(agent_id = %agent_id, "soft timeout dropped, previous expiry not handled yet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    })
}

impl TimeoutHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&AgentId) + Send + Sync + 'static,
    {
        *self.on_kill.lock() = Some(Arc::new(callback));
        self
    }

    pub fn set_kill_callback<F>(&self, callback: F)
    where
        F: Fn(&AgentId) + Send + Sync + 'static,
    {
        *self.on_kill.lock() = Some(Arc::new(callback));
    }

    /// Override the timeout used for `tier`. Running timers keep theirs.
    pub fn set_timeout(&self, tier: Tier, timeout: Duration) {
        let _ = self.state.lock().timeouts.insert(tier, timeout);
    }

    pub fn timeout_for(&self, tier: Tier) -> Duration {
        self.state
            .lock()
            .timeouts
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier_table().get(tier).timeout())
    }

    /// Arm a timer for `agent_id`, replacing any existing one. Expiries
    /// arrive on the returned receiver, which holds at most one event.
    pub fn start_timer(&self, agent_id: &AgentId, tier: Tier) -> mpsc::Receiver<TimeoutEvent> {
        let base = self.timeout_for(tier);
        let (tx, rx) = mpsc::channel(1);
        let started = Instant::now();
        let deadline = started + base;
        let task = arm(agent_id.clone(), started, deadline, tx.clone());
        let previous = self.state.lock().timers.insert(
            agent_id.clone(),
            Timer {
                tier,
                base,
                started,
                deadline,
                tx,
                task,
            },
        );
        if previous.is_some() {
            debug!(agent_id = %agent_id, "replaced existing timer");
        }
        debug!(agent_id = %agent_id, tier = %tier.as_str(), timeout_secs = base.as_secs(), "timer started");
        rx
    }

    pub fn handle_timeout(&self, agent_id: &AgentId, action: TimeoutAction) -> Result<(), AgentError> {
        match action {
            TimeoutAction::Kill => {
                let removed = self.state.lock().timers.remove(agent_id);
                if removed.is_none() {
                    return Err(AgentError::NotFound(agent_id.clone()));
                }
                drop(removed);
                info!(agent_id = %agent_id, "soft timeout: kill");
                let callback = self.on_kill.lock().clone();
                if let Some(callback) = callback {
                    callback(agent_id);
                }
                Ok(())
            }
            TimeoutAction::Extend => self.extend_timer(agent_id),
            TimeoutAction::Continue => {
                let mut state = self.state.lock();
                let timer = state
                    .timers
                    .get_mut(agent_id)
                    .ok_or_else(|| AgentError::NotFound(agent_id.clone()))?;
                timer.task.abort();
                timer.started = Instant::now();
                timer.deadline = timer.started + timer.base;
                timer.task = arm(agent_id.clone(), timer.started, timer.deadline, timer.tx.clone());
                debug!(agent_id = %agent_id, tier = %timer.tier.as_str(), "timer restarted");
                Ok(())
            }
        }
    }

    /// Push the deadline out by half the tier timeout, counted from now if
    /// it already passed.
    pub fn extend_timer(&self, agent_id: &AgentId) -> Result<(), AgentError> {
        let mut state = self.state.lock();
        let timer = state
            .timers
            .get_mut(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.clone()))?;
        timer.task.abort();
        timer.deadline = timer.deadline.max(Instant::now()) + timer.base / 2;
        timer.task = arm(agent_id.clone(), timer.started, timer.deadline, timer.tx.clone());
        debug!(agent_id = %agent_id, "timer extended");
        Ok(())
    }

    /// Remove the timer and close its channel. Returns whether one existed.
    pub fn stop_timer(&self, agent_id: &AgentId) -> bool {
        self.state.lock().timers.remove(agent_id).is_some()
    }

    pub fn stop_all(&self) {
        let timers: Vec<Timer> = self.state.lock().timers.drain().map(|(_, t)| t).collect();
        drop(timers);
    }

    pub fn is_timer_active(&self, agent_id: &AgentId) -> bool {
        self.state.lock().timers.contains_key(agent_id)
    }

    pub fn get_elapsed(&self, agent_id: &AgentId) -> Option<Duration> {
        self.state
            .lock()
            .timers
            .get(agent_id)
            .map(|t| t.started.elapsed())
    }

    pub fn active_timers(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.state.lock().timers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler(secs: u64) -> TimeoutHandler {
        let h = TimeoutHandler::new();
        h.set_timeout(Tier::Scout, Duration::from_secs(secs));
        h
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_deadline() {
        let h = handler(10);
        let id = AgentId::from("a1");
        let mut rx = h.start_timer(&id, Tier::Scout);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.agent_id, id);
        assert_eq!(event.timeout, Duration::from_secs(10));
        assert!(event.elapsed >= Duration::from_secs(10));
        assert!(h.is_timer_active(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_timer() {
        let h = handler(10);
        let id = AgentId::from("a1");
        let mut old = h.start_timer(&id, Tier::Scout);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut new = h.start_timer(&id, Tier::Scout);
        assert!(old.recv().await.is_none());
        let event = new.recv().await.unwrap();
        assert!(event.elapsed >= Duration::from_secs(10));
        assert_eq!(h.active_timers(), vec![id]);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(new.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_adds_half_the_timeout() {
        let h = handler(10);
        let id = AgentId::from("a1");
        let mut rx = h.start_timer(&id, Tier::Scout);
        let _ = rx.recv().await.unwrap();
        h.handle_timeout(&id, TimeoutAction::Extend).unwrap();
        let start = Instant::now();
        let event = rx.recv().await.unwrap();
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(event.timeout, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn continue_rearms_with_tier_timeout() {
        let h = handler(10);
        let id = AgentId::from("a1");
        let mut rx = h.start_timer(&id, Tier::Scout);
        let _ = rx.recv().await.unwrap();
        h.handle_timeout(&id, TimeoutAction::Continue).unwrap();
        assert!(h.get_elapsed(&id).unwrap() < Duration::from_secs(1));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn kill_invokes_callback_outside_lock() {
        let kills = Arc::new(AtomicUsize::new(0));
        let h = Arc::new(handler(10));
        let weak = Arc::downgrade(&h);
        let counter = kills.clone();
        h.set_kill_callback(move |id| {
            // Re-entering the handler must not deadlock.
            if let Some(h) = weak.upgrade() {
                assert!(!h.is_timer_active(id));
            }
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = AgentId::from("a1");
        let mut rx = h.start_timer(&id, Tier::Scout);
        h.handle_timeout(&id, TimeoutAction::Kill).unwrap();
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_none());
        assert!(h.handle_timeout(&id, TimeoutAction::Kill).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_second_expiry_is_dropped() {
        let h = handler(10);
        let id = AgentId::from("a1");
        let mut rx = h.start_timer(&id, Tier::Scout);
        tokio::time::sleep(Duration::from_secs(11)).await;
        h.extend_timer(&id).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_clears_everything() {
        let h = handler(10);
        let _a = h.start_timer(&AgentId::from("a"), Tier::Scout);
        let _b = h.start_timer(&AgentId::from("b"), Tier::Builder);
        assert_eq!(h.active_timers().len(), 2);
        assert!(h.stop_timer(&AgentId::from("a")));
        assert!(!h.stop_timer(&AgentId::from("a")));
        h.stop_all();
        assert!(h.active_timers().is_empty());
        assert!(h.get_elapsed(&AgentId::from("b")).is_none());
    }
}
