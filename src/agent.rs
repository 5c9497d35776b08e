use crate::action::{Action, ParsedResponse, ResponseStatus};
use crate::parser;
use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

// ========================= Core Types =========================

/// A single still frame of the display, already encoded for transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Screenshot {
    pub id: String,
    pub mime_type: String,
    pub image_base64: String,
    pub captured_at_ms: u128,
}

impl Screenshot {
    pub fn new(mime_type: impl Into<String>, image_base64: impl Into<String>) -> Self {
        Self {
            id: nanoid!(),
            mime_type: mime_type.into(),
            image_base64: image_base64.into(),
            captured_at_ms: now_ms(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.image_base64)
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgentError {
    #[error("screen capture error: {0}")]
    Capture(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("a run is already active on this agent")]
    Busy,
}

/// What the executor reports back for one action.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

/// One loop iteration. Created once, never modified afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub screenshot: Screenshot,
    pub thought: String,
    pub action: Action,
    pub result: String,
    pub success: bool,
    pub status: ResponseStatus,
    pub error: Option<AgentError>,
    /// Milliseconds since the run started.
    pub elapsed_ms: u128,
}

/// Text-only recollection of an earlier step; images are never replayed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub step: usize,
    pub thought: String,
    pub action: String,
    pub result: String,
    pub success: bool,
}

impl From<&Step> for HistoryEntry {
    fn from(step: &Step) -> Self {
        Self {
            step: step.index,
            thought: step.thought.clone(),
            action: step.action.to_string(),
            result: step.result.clone(),
            success: step.success,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunHistory {
    entries: Vec<HistoryEntry>,
}

impl RunHistory {
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest `limit` entries, or all of them.
    pub fn recent(&self, limit: Option<usize>) -> &[HistoryEntry] {
        match limit {
            Some(n) if n < self.entries.len() => &self.entries[self.entries.len() - n..],
            _ => &self.entries,
        }
    }
}

/// Renders history entries as the plain-text block sent to the model.
pub fn render_history(entries: &[HistoryEntry]) -> String {
    let mut s = String::new();
    for e in entries {
        let outcome = if e.success { "ok" } else { "failed" };
        s.push_str(&format!("Step {}: ", e.step));
        if !e.thought.trim().is_empty() {
            s.push_str(&format!("thought: {} | ", e.thought.trim()));
        }
        s.push_str(&format!("action: {} | result ({outcome}): {}\n", e.action, e.result));
    }
    s
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Failed,
    StepLimit,
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub run_id: String,
    pub task: String,
    pub success: bool,
    pub steps_executed: usize,
    pub termination_reason: TerminationReason,
    pub final_message: String,
    pub steps: Vec<Step>,
    pub time_ms: u128,
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Screen: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, AgentError>;
}

/// Everything the reasoning backend gets for one turn.
pub struct ThinkRequest<'a> {
    pub task: &'a str,
    pub first_turn: bool,
    pub screenshot: &'a Screenshot,
    pub history: &'a [HistoryEntry],
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Returns the raw reply text. Unreachable or failing backends must be
    /// reported as [`AgentError::Transport`] so they get retried.
    async fn ask(&self, request: &ThinkRequest<'_>) -> Result<String, AgentError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Must not error: bad coordinates and host failures are failed outcomes.
    async fn execute(&self, action: &Action) -> ActionOutcome;
}

pub type StepCallback = Box<dyn Fn(&Step) + Send + Sync>;

// ========================= Cancellation =========================

#[derive(Default)]
struct StopState {
    requested: AtomicBool,
    notify: Notify,
}

/// Cooperative stop flag shared between the loop and whoever may interrupt it.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Sleeps for `dur` unless a stop arrives first. Returns true if stopped.
    pub async fn sleep(&self, dur: Duration) -> bool {
        if dur.is_zero() {
            return self.is_requested();
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_requested(),
            _ = &mut notified => true,
        }
    }
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub step_delay: Duration,
    /// Attempts per reasoning call, the first one included.
    pub reasoning_attempts: u32,
    /// Base delay between retries; doubled after each failed attempt.
    pub retry_backoff: Duration,
    pub capture_attempts: u32,
    /// Unparsable replies tolerated in a row before the run fails.
    pub max_consecutive_parse_failures: u32,
    pub history_limit: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            step_delay: Duration::from_millis(1000),
            reasoning_attempts: 3,
            retry_backoff: Duration::from_millis(1000),
            capture_attempts: 1,
            max_consecutive_parse_failures: 3,
            history_limit: None,
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `PILOT_*` environment variables.
    pub fn from_env() -> Result<Self, AgentError> {
        let d = Self::default();
        let history_limit = match env::var("PILOT_HISTORY_LIMIT") {
            Ok(v) if !v.trim().is_empty() => Some(parse_setting("PILOT_HISTORY_LIMIT", &v)?),
            _ => d.history_limit,
        };
        Ok(Self {
            max_steps: env_setting("PILOT_MAX_STEPS", d.max_steps)?,
            step_delay: Duration::from_millis(env_setting(
                "PILOT_STEP_DELAY_MS",
                d.step_delay.as_millis() as u64,
            )?),
            reasoning_attempts: env_setting("PILOT_REASONING_ATTEMPTS", d.reasoning_attempts)?,
            retry_backoff: Duration::from_millis(env_setting(
                "PILOT_RETRY_BACKOFF_MS",
                d.retry_backoff.as_millis() as u64,
            )?),
            capture_attempts: env_setting("PILOT_CAPTURE_ATTEMPTS", d.capture_attempts)?,
            max_consecutive_parse_failures: env_setting(
                "PILOT_MAX_PARSE_FAILURES",
                d.max_consecutive_parse_failures,
            )?,
            history_limit,
        })
    }
}

fn parse_setting<T: FromStr>(key: &str, raw: &str) -> Result<T, AgentError> {
    raw.trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{key}: cannot parse '{raw}'")))
}

pub(crate) fn env_setting<T: FromStr>(key: &str, default: T) -> Result<T, AgentError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => parse_setting(key, &v),
        _ => Ok(default),
    }
}

enum ThinkOutcome {
    Reply(String),
    Stopped,
    Failed(AgentError),
}

struct ActiveRun<'a>(&'a AtomicBool);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Agent<S, R, E>
where
    S: Screen,
    R: Reasoner,
    E: Executor,
{
    screen: S,
    reasoner: R,
    executor: E,
    cfg: AgentConfig,
    on_step: Option<StepCallback>,
    stop: StopHandle,
    active: AtomicBool,
}

impl<S, R, E> Agent<S, R, E>
where
    S: Screen,
    R: Reasoner,
    E: Executor,
{
    pub fn new(screen: S, reasoner: R, executor: E, cfg: AgentConfig) -> Self {
        Self {
            screen,
            reasoner,
            executor,
            cfg,
            on_step: None,
            stop: StopHandle::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Registers the progress callback. It runs on the loop, so a slow callback
    /// delays the next iteration.
    pub fn with_step_callback(mut self, f: impl Fn(&Step) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Box::new(f));
        self
    }

    /// Uses an existing stop handle, e.g. one the executor's failsafe also holds.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub async fn run(&self, task: &str) -> Result<TaskResult, AgentError> {
        self.run_with_limit(task, self.cfg.max_steps).await
    }

    /// Runs one task. The only error is [`AgentError::Busy`]; every other
    /// outcome, including failures, comes back as a [`TaskResult`].
    pub async fn run_with_limit(&self, task: &str, max_steps: usize) -> Result<TaskResult, AgentError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::Busy);
        }
        let _active = ActiveRun(&self.active);
        self.stop.reset();
        Ok(self.run_loop(task, max_steps).await)
    }

    async fn run_loop(&self, task: &str, max_steps: usize) -> TaskResult {
        let run_id = nanoid!();
        let start = Instant::now();
        let mut steps: Vec<Step> = Vec::new();
        let mut history = RunHistory::default();
        let mut parse_failures = 0u32;

        info!(run_id = %run_id, max_steps, "run started: {}", task);
        if max_steps == 0 {
            return self.finish(run_id, task, steps, start, TerminationReason::StepLimit, "Step limit is zero; nothing was executed".into());
        }

        let mut index = 0;
        loop {
            index += 1;

            let screenshot = match self.observe(index).await {
                Ok(s) => s,
                Err(_) if self.stop.is_requested() => {
                    return self.finish(run_id, task, steps, start, TerminationReason::Stopped, stopped_message(index - 1));
                }
                Err(err) => {
                    return self.finish(run_id, task, steps, start, TerminationReason::Failed, format!("Screen capture failed: {err}"));
                }
            };

            if self.stop.is_requested() {
                return self.finish(run_id, task, steps, start, TerminationReason::Stopped, stopped_message(index - 1));
            }

            let request = ThinkRequest {
                task,
                first_turn: index == 1,
                screenshot: &screenshot,
                history: history.recent(self.cfg.history_limit),
            };
            let reply = match self.think(index, &request).await {
                ThinkOutcome::Reply(reply) => reply,
                ThinkOutcome::Stopped => {
                    return self.finish(run_id, task, steps, start, TerminationReason::Stopped, stopped_message(index - 1));
                }
                ThinkOutcome::Failed(err) => {
                    return self.finish(run_id, task, steps, start, TerminationReason::Failed, format!("Reasoning backend failed: {err}"));
                }
            };

            let parsed = parser::parse(&reply);
            info!(step = index, action = %parsed.action, status = parsed.status.as_str(), "agent step");

            if parsed.is_unparsable() {
                parse_failures += 1;
            } else {
                parse_failures = 0;
            }

            let (outcome, error) = self.act(index, &parsed).await;
            let step = Step {
                index,
                screenshot,
                thought: parsed.thought.clone(),
                action: parsed.action.clone(),
                result: outcome.message,
                success: outcome.success,
                status: parsed.status,
                error,
                elapsed_ms: start.elapsed().as_millis(),
            };
            history.push(HistoryEntry::from(&step));
            if let Some(cb) = &self.on_step {
                cb(&step);
            }
            steps.push(step);

            match &parsed.action {
                Action::Done { message } => {
                    return self.finish(run_id, task, steps, start, TerminationReason::Completed, message.clone());
                }
                Action::Failed { reason } => {
                    return self.finish(run_id, task, steps, start, TerminationReason::Failed, format!("Task failed: {reason}"));
                }
                Action::Unparsable { reason } if parse_failures > self.cfg.max_consecutive_parse_failures => {
                    let msg = format!("Model reply could not be parsed {parse_failures} times in a row; last error: {reason}");
                    return self.finish(run_id, task, steps, start, TerminationReason::Failed, msg);
                }
                _ => {}
            }

            if index >= max_steps {
                let msg = format!("Max steps ({max_steps}) reached without completion");
                return self.finish(run_id, task, steps, start, TerminationReason::StepLimit, msg);
            }
            if self.stop.is_requested() || self.stop.sleep(self.cfg.step_delay).await {
                return self.finish(run_id, task, steps, start, TerminationReason::Stopped, stopped_message(index));
            }
        }
    }

    async fn observe(&self, index: usize) -> Result<Screenshot, AgentError> {
        let attempts = self.cfg.capture_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.screen.capture().await {
                Ok(shot) => return Ok(shot),
                Err(err) => {
                    warn!(step = index, attempt, attempts, error = %err, "screen capture failed");
                    last_error = Some(err);
                    if attempt < attempts && self.stop.sleep(self.cfg.retry_backoff).await {
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AgentError::Capture("no capture attempted".into())))
    }

    async fn think(&self, index: usize, request: &ThinkRequest<'_>) -> ThinkOutcome {
        let attempts = self.cfg.reasoning_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.reasoner.ask(request).await {
                Ok(reply) => return ThinkOutcome::Reply(reply),
                Err(err @ AgentError::Transport(_)) => {
                    warn!(step = index, attempt, attempts, error = %err, "reasoning call failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        let backoff = self.cfg.retry_backoff.saturating_mul(1u32 << (attempt - 1).min(16));
                        if self.stop.sleep(backoff).await {
                            return ThinkOutcome::Stopped;
                        }
                    }
                }
                Err(err) => return ThinkOutcome::Failed(err),
            }
        }
        ThinkOutcome::Failed(last_error.unwrap_or_else(|| AgentError::Transport("no attempt made".into())))
    }

    async fn act(&self, index: usize, parsed: &ParsedResponse) -> (ActionOutcome, Option<AgentError>) {
        match &parsed.action {
            Action::Done { message } => (ActionOutcome::ok(message.clone()), None),
            Action::Failed { reason } => (ActionOutcome::failed(format!("Model gave up: {reason}")), None),
            Action::Unparsable { reason } => (
                ActionOutcome::failed(format!("Could not parse model reply: {reason}")),
                Some(AgentError::Parse(reason.clone())),
            ),
            action if self.stop.is_requested() => {
                info!(step = index, action = %action, "stop requested, action skipped");
                (ActionOutcome::failed("Skipped: stop requested"), None)
            }
            action => {
                let outcome = self.executor.execute(action).await;
                if outcome.success {
                    info!(step = index, result = %outcome.message, "action result");
                    (outcome, None)
                } else {
                    warn!(step = index, result = %outcome.message, "action failed");
                    let err = AgentError::Execution(outcome.message.clone());
                    (outcome, Some(err))
                }
            }
        }
    }

    fn finish(
        &self,
        run_id: String,
        task: &str,
        steps: Vec<Step>,
        start: Instant,
        reason: TerminationReason,
        message: String,
    ) -> TaskResult {
        let result = TaskResult {
            run_id,
            task: task.to_string(),
            success: reason == TerminationReason::Completed,
            steps_executed: steps.len(),
            termination_reason: reason,
            final_message: message,
            steps,
            time_ms: start.elapsed().as_millis(),
        };
        info!(
            run_id = %result.run_id,
            reason = ?result.termination_reason,
            steps = result.steps_executed,
            "run finished: {}",
            result.final_message
        );
        result
    }
}

fn stopped_message(steps: usize) -> String {
    format!("Stopped by operator after {steps} step(s)")
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

// ========================= Defaults & Helpers =========================

/// Always returns the same frame. Handy for dry runs and tests.
#[derive(Clone)]
pub struct StaticScreen {
    mime_type: String,
    image_base64: String,
}

impl StaticScreen {
    pub fn new(mime_type: impl Into<String>, image_base64: impl Into<String>) -> Self {
        Self { mime_type: mime_type.into(), image_base64: image_base64.into() }
    }
}

#[async_trait]
impl Screen for StaticScreen {
    async fn capture(&self) -> Result<Screenshot, AgentError> {
        Ok(Screenshot::new(self.mime_type.clone(), self.image_base64.clone()))
    }
}

/// Logs actions instead of performing them.
#[derive(Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl Executor for DryRunExecutor {
    async fn execute(&self, action: &Action) -> ActionOutcome {
        info!(action = %action, "dry run");
        ActionOutcome::ok(format!("dry run: {action}"))
    }
}
