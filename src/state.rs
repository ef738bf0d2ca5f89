//! Task state machine.
//!
//! `TaskState` is an explicit value owned by whoever drives the task; every
//! mutating operation writes a fresh snapshot through its [`SnapshotStore`]
//! so the task can be picked up again after the page reloads.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BreakReason;
use crate::store::SnapshotStore;
use crate::types::{
    ActionDecision, ActionResult, MAX_ATTEMPTS_PER_STEP, MAX_STEPS_PER_TASK,
    MAX_TASK_DURATION_SECS,
};

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    CircuitBroken(BreakReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: u32,
    pub max_attempts: u32,
    pub max_duration: Duration,
    pub min_call_delay: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS_PER_TASK,
            max_attempts: MAX_ATTEMPTS_PER_STEP,
            max_duration: Duration::from_secs(MAX_TASK_DURATION_SECS),
            min_call_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: u32,
    pub action: ActionDecision,
    pub result: ActionResult,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub step: u32,
    pub error: String,
    pub timestamp: i64,
}

/// Serializable projection of a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    #[serde(rename = "isRunning")]
    pub running: bool,
    pub goal: String,
    pub current_step: u32,
    #[serde(default)]
    pub attempts: u32,
    pub start_time: i64,
    #[serde(default)]
    pub completed_actions: Vec<HistoryEntry>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub pending_action: Option<ActionDecision>,
    pub saved_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    Proceed,
    Blocked(BreakReason),
}

/// Compact history line handed to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSummary {
    pub step: u32,
    pub kind: String,
    pub target: Option<String>,
    pub reasoning: String,
    pub success: bool,
    pub note: Option<String>,
}

pub struct TaskState {
    goal: String,
    status: TaskStatus,
    current_step: u32,
    attempts: u32,
    limits: Limits,
    start_time: i64,
    completed_actions: Vec<HistoryEntry>,
    errors: Vec<ErrorEntry>,
    pending_action: Option<ActionDecision>,
    last_result: Option<ActionResult>,
    resumed: bool,
    store: SnapshotStore,
}

impl TaskState {
    pub fn new(limits: Limits, store: SnapshotStore) -> Self {
        Self {
            goal: String::new(),
            status: TaskStatus::Idle,
            current_step: 0,
            attempts: 0,
            limits,
            start_time: 0,
            completed_actions: Vec::new(),
            errors: Vec::new(),
            pending_action: None,
            last_result: None,
            resumed: false,
            store,
        }
    }

    /// Start a fresh task from any state.
    pub fn initiate(&mut self, goal: &str) {
        self.goal = goal.to_string();
        self.status = TaskStatus::Running;
        self.current_step = 0;
        self.attempts = 0;
        self.start_time = now_millis();
        self.completed_actions.clear();
        self.errors.clear();
        self.pending_action = None;
        self.last_result = None;
        self.resumed = false;

        info!(
            goal,
            max_steps = self.limits.max_steps,
            timeout_secs = self.limits.max_duration.as_secs(),
            "task initiated"
        );
        self.store.accept_saves();
        self.persist();
    }

    /// Rebuild a running task from a snapshot. A pending action means the
    /// previous page went away mid-action; it is recorded as a success
    /// because the navigation was most likely its effect, and retrying it
    /// could repeat a side effect.
    pub fn restore(snapshot: PersistedSnapshot, limits: Limits, store: SnapshotStore) -> Self {
        let mut task = Self {
            goal: snapshot.goal,
            status: TaskStatus::Running,
            current_step: snapshot.current_step,
            attempts: snapshot.attempts,
            limits,
            start_time: snapshot.start_time,
            completed_actions: snapshot.completed_actions,
            errors: snapshot.errors,
            pending_action: None,
            last_result: None,
            resumed: true,
            store,
        };

        if let Some(action) = snapshot.pending_action {
            warn!(kind = %action.kind, "promoting action interrupted by navigation");
            let result = ActionResult::assumed_after_navigation();
            task.completed_actions.push(HistoryEntry {
                step: task.current_step,
                action,
                result: result.clone(),
                timestamp: snapshot.saved_at,
            });
            task.current_step += 1;
            task.last_result = Some(result);
        }

        info!(goal = %task.goal, step = task.current_step, "task restored");
        task.persist();
        task
    }

    pub fn mark_pending(&mut self, action: &ActionDecision) {
        self.pending_action = Some(action.clone());
        info!(kind = %action.kind, "action pending");
        self.persist();
    }

    pub fn record_action(&mut self, action: &ActionDecision, result: ActionResult) {
        self.pending_action = None;
        self.completed_actions.push(HistoryEntry {
            step: self.current_step,
            action: action.clone(),
            result: result.clone(),
            timestamp: now_millis(),
        });
        self.last_result = Some(result);
        self.current_step += 1;
        self.attempts = 0;
        self.resumed = false;

        info!(
            step = self.current_step,
            max_steps = self.limits.max_steps,
            kind = %action.kind,
            target = action.target_label().as_deref().unwrap_or("n/a"),
            "step recorded"
        );
        self.persist();
    }

    pub fn record_error(&mut self, message: &str) {
        self.pending_action = None;
        self.errors.push(ErrorEntry {
            step: self.current_step,
            error: message.to_string(),
            timestamp: now_millis(),
        });
        self.attempts += 1;
        self.resumed = false;

        warn!(
            attempt = self.attempts,
            max_attempts = self.limits.max_attempts,
            "{}",
            message
        );
        self.persist();
    }

    /// First violated limit, checked as: stopped, steps, wall time, attempts.
    pub fn evaluate_continuation(&self) -> Continuation {
        if self.status != TaskStatus::Running {
            return Continuation::Blocked(BreakReason::Stopped);
        }
        if self.current_step >= self.limits.max_steps {
            return Continuation::Blocked(BreakReason::MaxSteps {
                limit: self.limits.max_steps,
            });
        }
        if self.elapsed() > self.limits.max_duration {
            return Continuation::Blocked(BreakReason::Timeout {
                limit: self.limits.max_duration,
            });
        }
        if self.attempts >= self.limits.max_attempts {
            return Continuation::Blocked(BreakReason::MaxAttempts {
                limit: self.limits.max_attempts,
            });
        }
        Continuation::Proceed
    }

    /// Cooperative stop: the loop notices at its next continuation check.
    pub fn stop(&mut self) {
        self.status = TaskStatus::Stopped;
        info!("task stopped");
        self.store.clear();
    }

    pub fn complete(&mut self) {
        self.store.clear();
        self.status = TaskStatus::Completed;
    }

    pub fn trip(&mut self, reason: BreakReason) {
        self.store.clear();
        self.status = match reason {
            BreakReason::Stopped => TaskStatus::Stopped,
            reason => TaskStatus::CircuitBroken(reason),
        };
    }

    pub fn reset(&mut self) {
        self.goal.clear();
        self.status = TaskStatus::Idle;
        self.current_step = 0;
        self.attempts = 0;
        self.start_time = 0;
        self.completed_actions.clear();
        self.errors.clear();
        self.pending_action = None;
        self.last_result = None;
        self.resumed = false;
        self.store.clear();
    }

    pub fn snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            running: self.is_running(),
            goal: self.goal.clone(),
            current_step: self.current_step,
            attempts: self.attempts,
            start_time: self.start_time,
            completed_actions: self.completed_actions.clone(),
            errors: self.errors.clone(),
            pending_action: self.pending_action.clone(),
            saved_at: now_millis(),
        }
    }

    fn persist(&self) {
        if self.is_running() {
            self.store.save(&self.snapshot());
        }
    }

    pub fn history(&self) -> Vec<ActionSummary> {
        self.completed_actions
            .iter()
            .map(|entry| ActionSummary {
                step: entry.step,
                kind: entry.action.kind.to_string(),
                target: entry.action.target_label(),
                reasoning: entry.action.reasoning.clone(),
                success: entry.result.success,
                note: entry.result.note(),
            })
            .collect()
    }

    pub fn elapsed(&self) -> Duration {
        let ms = now_millis().saturating_sub(self.start_time).max(0);
        Duration::from_millis(ms as u64)
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn completed_actions(&self) -> &[HistoryEntry] {
        &self.completed_actions
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn pending_action(&self) -> Option<&ActionDecision> {
        self.pending_action.as_ref()
    }

    pub fn last_result(&self) -> Option<&ActionResult> {
        self.last_result.as_ref()
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }
}
