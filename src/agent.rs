//! The orchestrator loop.
//!
//! One iteration: continuation check, scan, rank, ask the oracle, mark the
//! decision pending, execute, record, wait for the page to settle. A task
//! either starts fresh from a goal or resumes from a persisted snapshot.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::brain::{DecisionContext, Oracle, OracleDecision};
use crate::config::AgentConfig;
use crate::error::{BreakReason, Disposition, ExecutorError, OracleError, PageError};
use crate::hands::ActionExecutor;
use crate::page::{Page, PageIdentity};
use crate::scanner::{Scanner, condense_text};
use crate::scorer::rank;
use crate::state::{Continuation, TaskState};
use crate::store::{KeyValueStore, SnapshotStore};
use crate::types::{ActionDecision, ActionKind, ActionOutcome, ActionResult, InteractiveElement};

const DEBUG_COMMAND: &str = "/debug";
const DEBUG_LISTING: usize = 20;
const ECHO_LABEL_CHARS: usize = 15;

/// User-visible progress, streamed to whoever drives the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Started { goal: String },
    Resumed { goal: String, step: u32 },
    Thinking { step: u32 },
    Decision { step: u32, kind: String, reasoning: String },
    Target { description: String },
    Step { number: u32, description: String, success: bool },
    StepError { message: String },
    Notice { message: String },
    TaskComplete { summary: String },
    TaskError { message: String },
    Ready,
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Started { .. } => "started",
            AgentEvent::Resumed { .. } => "resumed",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Decision { .. } => "decision",
            AgentEvent::Target { .. } => "target",
            AgentEvent::Step { .. } => "step",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::Notice { .. } => "notice",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::TaskError { .. } => "task_error",
            AgentEvent::Ready => "ready",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    Completed,
    /// The oracle declared the goal unreachable.
    GaveUp(String),
    Broken(BreakReason),
    NoElements,
    Fatal(String),
    /// A `/debug` listing was produced instead of running a task.
    DebugReport(String),
}

/// Cross-task view of a running agent: stop requests in, busy state out.
#[derive(Clone, Default)]
pub struct AgentHandle {
    stop: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    snapshots: Arc<OnceLock<SnapshotStore>>,
}

impl AgentHandle {
    /// The snapshot is discarded right away so a reload cannot resume the
    /// task. The loop observes the stop at its next continuation check;
    /// in-flight work finishes.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(snapshots) = self.snapshots.get() {
            snapshots.halt();
        }
        info!("stop requested");
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn attach(&self, snapshots: &SnapshotStore) {
        if self.snapshots.set(snapshots.clone()).is_err() {
            debug!("handle already bound to a snapshot store");
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::SeqCst)
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

/// Per-run counters for the closing summary.
#[derive(Default)]
struct RunStats {
    oracle_calls: u32,
}

pub struct Agent<P: Page, O: Oracle> {
    page: P,
    oracle: O,
    config: AgentConfig,
    snapshots: SnapshotStore,
    task: TaskState,
    scanner: Scanner,
    executor: ActionExecutor,
    events: broadcast::Sender<AgentEvent>,
    handle: AgentHandle,
    last_call: Option<Instant>,
    stats: RunStats,
}

impl<P: Page, O: Oracle> Agent<P, O> {
    pub fn new(
        page: P,
        oracle: O,
        config: AgentConfig,
        kv: Arc<dyn KeyValueStore>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        let snapshots = SnapshotStore::new(kv, config.snapshot_freshness());
        let handle = AgentHandle::default();
        handle.attach(&snapshots);
        Self {
            task: TaskState::new(config.task_limits(), snapshots.clone()),
            scanner: Scanner::new(config.label_cap),
            executor: ActionExecutor::new(config.timing),
            page,
            oracle,
            config,
            snapshots,
            events,
            handle,
            last_call: None,
            stats: RunStats::default(),
        }
    }

    /// Share a handle created before the agent existed, e.g. by a UI that
    /// starts accepting stop requests early.
    pub fn with_handle(mut self, handle: AgentHandle) -> Self {
        handle.attach(&self.snapshots);
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    pub fn task(&self) -> &TaskState {
        &self.task
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn notice(&self, message: impl Into<String>) {
        self.emit(AgentEvent::Notice {
            message: message.into(),
        });
    }

    /// Run a command: `/debug [filter]` lists ranked elements, anything else
    /// starts a fresh task with that goal.
    pub async fn run(&mut self, command: &str) -> LoopExit {
        let command = command.trim();
        self.handle.set_busy(true);
        let exit = if let Some(filter) = command.strip_prefix(DEBUG_COMMAND) {
            self.debug_report(filter.trim()).await
        } else {
            self.handle.take_stop();
            self.executor.forget_clicks();
            self.task.initiate(command);
            self.emit(AgentEvent::Started {
                goal: command.to_string(),
            });
            self.notice("🚀 Starting analysis...");
            self.drive().await
        };
        self.finish(&exit);
        exit
    }

    /// Pick up a task persisted by an earlier page. `None` when there is
    /// nothing fresh to resume.
    pub async fn resume(&mut self) -> Option<LoopExit> {
        let snapshot = self.snapshots.load()?;
        self.handle.set_busy(true);
        self.handle.take_stop();
        self.executor.forget_clicks();
        self.task = TaskState::restore(snapshot, self.config.task_limits(), self.snapshots.clone());
        self.announce_resume();
        self.config.after_resume.stabilizer().settle_page(&self.page).await;

        let exit = self.drive().await;
        self.finish(&exit);
        Some(exit)
    }

    fn announce_resume(&self) {
        let step = self.task.current_step();
        info!(goal = %self.task.goal(), step = step + 1, "resuming task");
        self.emit(AgentEvent::Resumed {
            goal: self.task.goal().to_string(),
            step: step + 1,
        });
        self.notice(format!(
            "🔄 Resuming task \"{}\" from step {}",
            self.task.goal(),
            step + 1
        ));
    }

    fn finish(&mut self, exit: &LoopExit) {
        if !matches!(exit, LoopExit::DebugReport(_)) {
            info!(
                oracle_calls = self.stats.oracle_calls,
                steps = self.task.current_step(),
                errors = self.task.errors().len(),
                elapsed_secs = self.task.elapsed().as_secs(),
                outcome = ?exit,
                "run finished"
            );
        }
        self.stats = RunStats::default();
        self.handle.set_busy(false);
        self.emit(AgentEvent::Ready);
    }

    async fn drive(&mut self) -> LoopExit {
        loop {
            if self.handle.take_stop() {
                self.task.stop();
            }
            if let Continuation::Blocked(reason) = self.task.evaluate_continuation() {
                warn!(%reason, "circuit breaker tripped");
                self.task.trip(reason.clone());
                self.emit(AgentEvent::TaskError {
                    message: format!("⚠️ {reason}"),
                });
                return LoopExit::Broken(reason);
            }

            let mut inventory = match self.scanner.scan(&self.page).await {
                Ok(inventory) => inventory,
                Err(e) => {
                    self.page_trouble("scan failed", e).await;
                    continue;
                }
            };
            if inventory.is_empty() {
                warn!("no interactive elements on the page");
                self.task.stop();
                self.emit(AgentEvent::TaskError {
                    message: "No interactive elements found on this page.".into(),
                });
                return LoopExit::NoElements;
            }

            let context = match self.build_context(&inventory).await {
                Ok(context) => context,
                Err(e) => {
                    self.page_trouble("reading the page failed", e).await;
                    continue;
                }
            };

            let decision = match self.consult(&context).await {
                Ok(decision) => decision,
                Err(e) => match e.disposition() {
                    Disposition::Fatal => {
                        error!("oracle failure: {}", e);
                        self.task.reset();
                        self.emit(AgentEvent::TaskError {
                            message: format!("❌ {}", user_message(&e)),
                        });
                        return LoopExit::Fatal(e.to_string());
                    }
                    Disposition::CoolDown => {
                        let cooldown = self.config.rate_limit_cooldown();
                        warn!(cooldown_ms = cooldown.as_millis() as u64, "rate limited");
                        self.notice("⚠️ Rate limit reached. Waiting...");
                        sleep(cooldown).await;
                        continue;
                    }
                    Disposition::StepLocal => {
                        self.task.record_error(&e.to_string());
                        self.emit(AgentEvent::StepError {
                            message: format!("⚠️ Error: {e}"),
                        });
                        continue;
                    }
                },
            };

            if decision.is_complete {
                return self.conclude(decision);
            }

            let Some(action) = decision.action else {
                self.task.record_error("oracle returned no action");
                continue;
            };
            if !decision.thought.is_empty() {
                debug!(thought = %decision.thought, "oracle reasoning");
            }
            self.emit(AgentEvent::Decision {
                step: self.task.current_step() + 1,
                kind: action.kind.to_string(),
                reasoning: action.reasoning.clone(),
            });

            self.task.mark_pending(&action);
            if let Some(description) = action.index.and_then(|i| inventory.get(i)).map(echo_target)
            {
                self.emit(AgentEvent::Target { description });
            }

            let result = match self
                .executor
                .execute(&self.page, &mut self.scanner, &action, &mut inventory)
                .await
            {
                Ok(result) => result,
                Err(ExecutorError::NavigatedAway) => {
                    if self.recover_from_navigation().await {
                        continue;
                    }
                    self.emit(AgentEvent::TaskError {
                        message: "The page navigated away and the task could not be restored."
                            .into(),
                    });
                    return LoopExit::Fatal("navigation without a resumable snapshot".into());
                }
            };

            self.record(&action, result);
            self.config
                .after_action
                .stabilizer()
                .settle_page(&self.page)
                .await;
        }
    }

    fn record(&mut self, action: &ActionDecision, result: ActionResult) {
        let number = self.task.current_step() + 1;
        let failure = result.error().map(str::to_string);
        self.emit(AgentEvent::Step {
            number,
            description: describe(action, &result),
            success: result.success,
        });
        self.task.record_action(action, result);

        if let Some(message) = failure {
            self.task.record_error(&message);
            self.emit(AgentEvent::StepError { message });
            self.notice("⚠️ Retrying...");
        }
    }

    fn conclude(&mut self, decision: OracleDecision) -> LoopExit {
        self.task.complete();
        match decision.action {
            Some(action) if action.kind == ActionKind::Error => {
                info!(reason = %action.reasoning, "oracle gave up");
                self.emit(AgentEvent::TaskError {
                    message: format!("❌ {}", action.reasoning),
                });
                LoopExit::GaveUp(action.reasoning)
            }
            _ => {
                info!("goal reached");
                self.emit(AgentEvent::TaskComplete {
                    summary: "✅ Goal reached!".into(),
                });
                LoopExit::Completed
            }
        }
    }

    async fn build_context(
        &self,
        inventory: &[InteractiveElement],
    ) -> Result<DecisionContext, PageError> {
        let identity = match self.page.identity().await {
            Ok(identity) => identity,
            Err(PageError::Navigated) => return Err(PageError::Navigated),
            Err(e) => {
                warn!("page identity unavailable: {}", e);
                PageIdentity::default()
            }
        };
        let page_text = match self.page.text_blocks().await {
            Ok(blocks) => condense_text(&blocks, self.config.page_text_cap),
            Err(PageError::Navigated) => return Err(PageError::Navigated),
            Err(e) => {
                warn!("page text unavailable: {}", e);
                String::new()
            }
        };

        let ranked = rank(inventory, self.config.inventory_cap);
        debug!(
            total = inventory.len(),
            shown = ranked.len(),
            "inventory ranked"
        );
        Ok(DecisionContext::build(&self.task, identity, page_text, &ranked))
    }

    /// Honour the minimum gap between oracle calls, then ask.
    async fn consult(&mut self, context: &DecisionContext) -> Result<OracleDecision, OracleError> {
        let min_gap = self.task.limits().min_call_delay;
        if let Some(last) = self.last_call {
            let since = last.elapsed();
            if since < min_gap {
                let wait = min_gap - since;
                debug!(wait_ms = wait.as_millis() as u64, "pacing oracle calls");
                sleep(wait).await;
            }
        }

        self.emit(AgentEvent::Thinking {
            step: self.task.current_step() + 1,
        });
        self.last_call = Some(Instant::now());
        self.stats.oracle_calls += 1;
        info!(
            call = self.stats.oracle_calls,
            step = self.task.current_step() + 1,
            "asking oracle"
        );
        self.oracle.decide(context).await
    }

    /// A page read failed outside of an action. A navigation just means
    /// waiting for the new document; anything else costs an attempt.
    async fn page_trouble(&mut self, what: &str, e: PageError) {
        match e {
            PageError::Navigated => {
                info!("{}: page is navigating, waiting for it to settle", what);
                self.config
                    .after_resume
                    .stabilizer()
                    .settle_page(&self.page)
                    .await;
            }
            e => {
                let message = format!("{what}: {e}");
                self.task.record_error(&message);
                self.emit(AgentEvent::StepError { message });
            }
        }
    }

    /// Treat a navigation during an action like a page reload: restore from
    /// the snapshot, which promotes the pending action.
    async fn recover_from_navigation(&mut self) -> bool {
        self.executor.forget_clicks();
        if self.handle.stop_requested() {
            info!("action triggered a navigation after a stop request, not restoring");
            return true;
        }
        info!("action triggered a navigation, restoring task from snapshot");
        let Some(snapshot) = self.snapshots.load() else {
            warn!("no resumable snapshot after navigation");
            self.task.reset();
            return false;
        };

        self.task = TaskState::restore(snapshot, self.config.task_limits(), self.snapshots.clone());
        self.announce_resume();
        self.config
            .after_resume
            .stabilizer()
            .settle_page(&self.page)
            .await;
        true
    }

    async fn debug_report(&mut self, filter: &str) -> LoopExit {
        match self.debug_scan(filter).await {
            Ok(report) => {
                self.notice(report.clone());
                LoopExit::DebugReport(report)
            }
            Err(e) => {
                let message = format!("debug scan failed: {e}");
                self.emit(AgentEvent::StepError {
                    message: message.clone(),
                });
                LoopExit::DebugReport(message)
            }
        }
    }

    /// Ranked elements, optionally filtered by a case-insensitive substring.
    pub async fn debug_scan(&mut self, filter: &str) -> Result<String, PageError> {
        let inventory = self.scanner.scan(&self.page).await?;
        let ranked = rank(&inventory, self.config.inventory_cap);

        let mut report = format!("📊 Debug scan\nTotal elements: {}\n\n", ranked.len());
        let needle = filter.to_lowercase();
        let shown: Vec<&InteractiveElement> = if needle.is_empty() {
            ranked
        } else {
            let matching: Vec<_> = ranked
                .into_iter()
                .filter(|e| e.text.to_lowercase().contains(&needle))
                .collect();
            report.push_str(&format!(
                "Filtered by \"{}\": {}\n\n",
                filter,
                matching.len()
            ));
            matching
        };

        for element in shown.iter().take(DEBUG_LISTING) {
            report.push_str(&format!(
                "[{}] {} \"{}\"\n",
                element.index, element.tag, element.text
            ));
        }
        if shown.len() > DEBUG_LISTING {
            report.push_str(&format!("...and {} more", shown.len() - DEBUG_LISTING));
        }
        Ok(report)
    }
}

fn user_message(e: &OracleError) -> &'static str {
    match e {
        OracleError::CredentialMissing => "API key not configured.",
        OracleError::CredentialInvalid => "API key is not valid.",
        OracleError::Network(_) => "Connection error.",
        OracleError::RateLimited => "Rate limit reached.",
        OracleError::Malformed(_) | OracleError::Unknown(_) => "Oracle error.",
    }
}

/// `🎯 Target [i]: <TAG> "label" #id`
pub fn echo_target(element: &InteractiveElement) -> String {
    let label: String = element
        .text
        .chars()
        .take(ECHO_LABEL_CHARS)
        .collect::<String>()
        .replace('\n', " ");
    let mut echo = format!("🎯 Target [{}]: <{}>", element.index, element.tag);
    if !label.is_empty() {
        echo.push_str(&format!(" \"{label}\""));
    }
    if let Some(id) = &element.id {
        echo.push_str(&format!(" #{id}"));
    }
    echo
}

fn describe(action: &ActionDecision, result: &ActionResult) -> String {
    let what = match &result.outcome {
        ActionOutcome::Clicked { label } => format!("clicked \"{label}\""),
        ActionOutcome::AlreadyClicked { label } => format!("\"{label}\" already clicked"),
        ActionOutcome::Hovered { label } => format!("hovered \"{label}\""),
        ActionOutcome::ForcedOpen { label } => format!("forced open \"{label}\""),
        ActionOutcome::Typed { text } => format!("typed \"{text}\""),
        ActionOutcome::Waited { duration_ms } => format!("waited {duration_ms}ms"),
        ActionOutcome::Assumed { note } => note.clone(),
        ActionOutcome::Failed { error } => format!("failed: {error}"),
    };
    if action.reasoning.is_empty() {
        what
    } else {
        format!("{what} ({})", action.reasoning)
    }
}
