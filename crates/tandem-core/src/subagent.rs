// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process scheduler for asynchronous child agents.
//!
//! A controller is instantiated once per parent tool loop and exposes five
//! tools — `spawn_agent`, `send_input`, `resume_agent`, `wait`,
//! `close_agent` — over a shared agent table.  Children run through a
//! caller-injected [`SubagentRunner`], which keeps this module free of any
//! dependency on the loop engine even though children are, in practice,
//! loops themselves.
//!
//! State discipline: every mutation bumps the agent's `version` and wakes
//! waiters through one controller-wide notifier; `wait` re-reads the table
//! after every wakeup, so it never returns a stale snapshot for a running
//! agent.  Abort reasons are strings (`"send_input_interrupt"`,
//! `"close_agent"`) so an interrupted run can tell redirection from
//! shutdown.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_model::{AbortHandle, Content, LlmError, LoopResult, Provider};

use crate::tool::{Tool, ToolInput, ToolSchema, ToolSet};

/// Abort reason used by `send_input` with `interrupt=true`.
pub const ABORT_REASON_INTERRUPT: &str = "send_input_interrupt";
/// Abort reason used by `close_agent` and controller shutdown.
pub const ABORT_REASON_CLOSE: &str = "close_agent";

/// How long controller shutdown waits for aborted children.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptPattern {
    /// Items serialized as `## <Role>` sections.
    Codex,
    /// Items joined as plain paragraphs.
    Plain,
}

#[derive(Debug, Clone)]
pub struct SubagentConfig {
    /// Maximum simultaneously non-closed agents.
    pub max_agents: usize,
    /// Maximum child depth; spawning is disabled once the parent sits at it.
    pub max_depth: u32,
    pub min_wait: Duration,
    pub default_wait: Duration,
    pub max_wait: Duration,
    pub prompt_pattern: PromptPattern,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_agents: 6,
            max_depth: 1,
            min_wait: Duration::from_secs(10),
            default_wait: Duration::from_secs(30),
            max_wait: Duration::from_secs(3600),
            prompt_pattern: PromptPattern::Codex,
        }
    }
}

impl SubagentConfig {
    /// Clamp every knob into its valid range.  Zero durations and counts
    /// mean "unset" and fall back to the defaults.
    pub fn clamped(mut self) -> Self {
        let defaults = Self::default();
        if self.max_agents == 0 {
            self.max_agents = defaults.max_agents;
        }
        self.max_agents = self.max_agents.min(64);
        self.max_depth = self.max_depth.min(4);
        if self.max_wait.is_zero() {
            self.max_wait = defaults.max_wait;
        }
        if self.min_wait.is_zero() {
            self.min_wait = defaults.min_wait;
        }
        self.min_wait = self.min_wait.clamp(Duration::from_secs(1), self.max_wait);
        if self.default_wait.is_zero() {
            self.default_wait = defaults.default_wait;
        }
        self.default_wait = self.default_wait.clamp(self.min_wait, self.max_wait);
        self
    }
}

// ─── Roles and state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Default,
    Researcher,
    Worker,
    Reviewer,
}

impl AgentRole {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "researcher" => Some(Self::Researcher),
            "worker" => Some(Self::Worker),
            "reviewer" => Some(Self::Reviewer),
            _ => None,
        }
    }

    fn nickname_prefix(&self) -> &'static str {
        match self {
            Self::Default => "Agent",
            Self::Researcher => "Researcher",
            Self::Worker => "Worker",
            Self::Reviewer => "Reviewer",
        }
    }

    /// Fixed role description injected as the child's system instructions.
    pub fn instructions(&self) -> &'static str {
        match self {
            Self::Default => {
                "You are a subagent working on a task delegated by a parent agent. \
                 Complete the task and report your result as plain text."
            }
            Self::Researcher => {
                "You are a research subagent. Gather the requested information, \
                 verify it against the available sources, and report findings \
                 concisely. Do not modify any state."
            }
            Self::Worker => {
                "You are a worker subagent. Execute the assigned task end-to-end \
                 using the tools available to you, then report what you did and \
                 the outcome."
            }
            Self::Reviewer => {
                "You are a review subagent. Examine the provided work, list \
                 concrete problems ordered by severity, and suggest fixes. Do \
                 not rewrite the work yourself."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Idle,
    Failed,
    Closed,
}

struct ManagedAgent {
    id: String,
    nickname: String,
    depth: u32,
    model: String,
    role: AgentRole,
    status: AgentStatus,
    pending_inputs: VecDeque<String>,
    history: Vec<Content>,
    instructions: String,
    max_steps: Option<u32>,
    turns: u32,
    spawned_at: DateTime<Utc>,
    first_run_started_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
    last_result: Option<LoopResult>,
    last_error: Option<String>,
    /// Present exactly while a run is in flight (`status == Running`).
    abort: Option<AbortHandle>,
    version: u64,
}

impl ManagedAgent {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            nickname: self.nickname.clone(),
            status: self.status,
            depth: self.depth,
            role: self.role,
            model: self.model.clone(),
            pending_inputs: self.pending_inputs.len(),
            turns: self.turns,
            spawned_at: self.spawned_at,
            spawn_startup_latency_ms: self
                .first_run_started_at
                .map(|t| (t - self.spawned_at).num_milliseconds().max(0)),
            last_result: self.last_result.as_ref().map(|r| LastResult {
                text: r.text.clone(),
                total_cost_usd: r.total_cost_usd,
            }),
            last_error: self.last_error.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastResult {
    pub text: String,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub nickname: String,
    pub status: AgentStatus,
    pub depth: u32,
    pub role: AgentRole,
    pub model: String,
    pub pending_inputs: usize,
    pub turns: u32,
    pub spawned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_startup_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<LastResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub version: u64,
}

// ─── Runner contract ──────────────────────────────────────────────────────────

/// One unit of child work handed to the runner.
pub struct SubagentJob {
    pub agent_id: String,
    pub depth: u32,
    pub model: String,
    pub input: String,
    pub instructions: Option<String>,
    pub history: Vec<Content>,
    pub max_steps: Option<u32>,
    pub abort: AbortHandle,
}

/// Drives one child run.  In production this delegates back to the tool
/// loop; the indirection keeps the loop engine and the controller acyclic.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(&self, job: SubagentJob) -> Result<LoopResult, LlmError>;
}

pub type BackgroundSender = Arc<dyn Fn(String) + Send + Sync>;
pub type ChildInstructionsFn = Arc<dyn Fn(AgentRole) -> String + Send + Sync>;

// ─── Controller ───────────────────────────────────────────────────────────────

pub struct SubagentControllerParams {
    pub config: SubagentConfig,
    pub parent_depth: u32,
    pub parent_model: String,
    /// Parent history given to children spawned with `fork_context=true`.
    pub fork_context_messages: Option<Vec<Content>>,
    pub runner: Arc<dyn SubagentRunner>,
    pub on_background_message: Option<BackgroundSender>,
    pub build_child_instructions: Option<ChildInstructionsFn>,
}

struct ControllerState {
    config: SubagentConfig,
    parent_depth: u32,
    parent_model: String,
    fork_context: Option<Vec<Content>>,
    runner: Arc<dyn SubagentRunner>,
    on_background: Option<BackgroundSender>,
    build_child_instructions: Option<ChildInstructionsFn>,
    agents: Mutex<HashMap<String, ManagedAgent>>,
    role_counters: Mutex<HashMap<&'static str, u32>>,
    /// Join handles of every run task, for the best-effort shutdown await.
    run_handles: Mutex<Vec<JoinHandle<()>>>,
    notify: Notify,
}

#[derive(Clone)]
pub struct SubagentController {
    state: Arc<ControllerState>,
}

/// Parameters accepted by `spawn_agent`.
#[derive(Debug, Default, Deserialize)]
pub struct SpawnParams {
    pub prompt: Option<String>,
    pub message: Option<String>,
    pub items: Option<Vec<SpawnItem>>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub fork_context: bool,
}

#[derive(Debug, Deserialize)]
pub struct SpawnItem {
    #[serde(default)]
    pub role: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Reopened,
    Started,
    AlreadyRunning,
    NoPendingInput,
}

#[derive(Debug, Serialize)]
pub struct WaitOutcome {
    pub statuses: BTreeMap<String, AgentSnapshot>,
    pub timed_out: bool,
}

#[derive(Debug, Serialize)]
pub struct CloseOutcome {
    pub id: String,
    pub cancelled: bool,
}

impl SubagentController {
    pub fn new(params: SubagentControllerParams) -> Self {
        Self {
            state: Arc::new(ControllerState {
                config: params.config.clamped(),
                parent_depth: params.parent_depth,
                parent_model: params.parent_model,
                fork_context: params.fork_context_messages,
                runner: params.runner,
                on_background: params.on_background_message,
                build_child_instructions: params.build_child_instructions,
                agents: Mutex::new(HashMap::new()),
                role_counters: Mutex::new(HashMap::new()),
                run_handles: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Spawning is possible only while the child depth stays within bounds.
    pub fn enabled(&self) -> bool {
        self.state.parent_depth < self.state.config.max_depth
    }

    /// The five subagent tools, ready to merge into a parent tool set.
    /// Empty when the controller is disabled by depth.
    pub fn install_tools(&self, set: &mut ToolSet) -> Result<(), LlmError> {
        if !self.enabled() {
            return Ok(());
        }
        set.register_reserved(Arc::new(SpawnAgentTool(self.clone())))?;
        set.register_reserved(Arc::new(SendInputTool(self.clone())))?;
        set.register_reserved(Arc::new(ResumeAgentTool(self.clone())))?;
        set.register_reserved(Arc::new(WaitTool(self.clone())))?;
        set.register_reserved(Arc::new(CloseAgentTool(self.clone())))?;
        Ok(())
    }

    // ── Operations ────────────────────────────────────────────────────────────

    pub fn spawn(&self, params: SpawnParams) -> Result<AgentSnapshot, LlmError> {
        let state = &self.state;
        let input = resolve_spawn_input(&params, state.config.prompt_pattern)?;

        let child_depth = state.parent_depth + 1;
        if child_depth > state.config.max_depth {
            return Err(LlmError::limit_exceeded(format!(
                "spawning at depth {child_depth} would exceed max_depth ({})",
                state.config.max_depth
            )));
        }

        let model = match params.model {
            Some(model) => {
                Provider::classify(&model)?;
                model
            }
            None => state.parent_model.clone(),
        };

        let role = match params.role.as_deref() {
            None => AgentRole::Default,
            Some(raw) => AgentRole::parse(raw)
                .ok_or_else(|| LlmError::invalid_argument(format!("unknown role: '{raw}'")))?,
        };
        let instructions = match &state.build_child_instructions {
            Some(build) => build(role),
            None => role.instructions().to_string(),
        };

        let nickname = {
            let mut counters = state.role_counters.lock().unwrap();
            let n = counters.entry(role.nickname_prefix()).or_insert(0);
            *n += 1;
            format!("{}_{}", role.nickname_prefix(), n)
        };

        let history = if params.fork_context {
            state.fork_context.clone().unwrap_or_default()
        } else {
            Vec::new()
        };

        let id = Uuid::new_v4().to_string();
        {
            let mut agents = state.agents.lock().unwrap();
            let active = agents
                .values()
                .filter(|a| a.status != AgentStatus::Closed)
                .count();
            if active >= state.config.max_agents {
                return Err(LlmError::limit_exceeded(format!(
                    "active subagent count has reached max_agents ({})",
                    state.config.max_agents
                )));
            }
            let mut pending = VecDeque::new();
            pending.push_back(input);
            agents.insert(
                id.clone(),
                ManagedAgent {
                    id: id.clone(),
                    nickname,
                    depth: child_depth,
                    model,
                    role,
                    status: AgentStatus::Idle,
                    pending_inputs: pending,
                    history,
                    instructions,
                    max_steps: params.max_steps,
                    turns: 0,
                    spawned_at: Utc::now(),
                    first_run_started_at: None,
                    last_finished_at: None,
                    last_result: None,
                    last_error: None,
                    abort: None,
                    version: 0,
                },
            );
        }

        // Begin running immediately.
        let started = Self::try_start_run(&self.state, &id);
        debug!(agent_id = %id, ?started, "spawned subagent");

        let agents = state.agents.lock().unwrap();
        Ok(agents[&id].snapshot())
    }

    pub fn send_input(
        &self,
        id: &str,
        message: String,
        interrupt: bool,
    ) -> Result<AgentSnapshot, LlmError> {
        let abort_in_flight = {
            let mut agents = self.state.agents.lock().unwrap();
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| LlmError::invalid_argument(format!("unknown subagent id: {id}")))?;
            if agent.status == AgentStatus::Closed {
                return Err(LlmError::invalid_argument(format!(
                    "subagent {id} is closed"
                )));
            }
            if interrupt {
                agent.pending_inputs.push_front(message);
            } else {
                agent.pending_inputs.push_back(message);
            }
            agent.version += 1;
            let abort = (interrupt && agent.status == AgentStatus::Running)
                .then(|| agent.abort.clone())
                .flatten();
            (abort, agent.snapshot())
        };
        self.state.notify.notify_waiters();

        let (abort, snapshot) = abort_in_flight;
        if let Some(abort) = abort {
            abort.abort(Some(ABORT_REASON_INTERRUPT));
        }
        Ok(snapshot)
    }

    pub fn resume(&self, id: &str) -> Result<ResumeOutcome, LlmError> {
        {
            let mut agents = self.state.agents.lock().unwrap();
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| LlmError::invalid_argument(format!("unknown subagent id: {id}")))?;
            if agent.status == AgentStatus::Closed {
                agent.status = AgentStatus::Idle;
                agent.version += 1;
                self.state.notify.notify_waiters();
                return Ok(ResumeOutcome::Reopened);
            }
        }
        Ok(Self::try_start_run(&self.state, id))
    }

    pub async fn wait(
        &self,
        ids: &[String],
        timeout_ms: Option<i64>,
    ) -> Result<WaitOutcome, LlmError> {
        if ids.is_empty() {
            return Err(LlmError::invalid_argument("wait requires at least one id"));
        }
        let timeout = match timeout_ms {
            Some(ms) if ms <= 0 => {
                return Err(LlmError::invalid_argument("timeout_ms must be positive"));
            }
            Some(ms) => Duration::from_millis(ms as u64),
            None => self.state.config.default_wait,
        };
        let timeout = timeout.clamp(self.state.config.min_wait, self.state.config.max_wait);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for wakeups before reading state so a version bump
            // between the read and the sleep cannot be missed.
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = {
                let agents = self.state.agents.lock().unwrap();
                let mut finished = BTreeMap::new();
                for id in ids {
                    let agent = agents.get(id).ok_or_else(|| {
                        LlmError::invalid_argument(format!("unknown subagent id: {id}"))
                    })?;
                    if agent.status != AgentStatus::Running {
                        finished.insert(id.clone(), agent.snapshot());
                    }
                }
                finished
            };
            if !finished.is_empty() {
                return Ok(WaitOutcome {
                    statuses: finished,
                    timed_out: false,
                });
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(WaitOutcome {
                    statuses: BTreeMap::new(),
                    timed_out: true,
                });
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(WaitOutcome {
                    statuses: BTreeMap::new(),
                    timed_out: true,
                });
            }
        }
    }

    pub fn close(&self, id: &str) -> Result<CloseOutcome, LlmError> {
        let (abort, notification) = {
            let mut agents = self.state.agents.lock().unwrap();
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| LlmError::invalid_argument(format!("unknown subagent id: {id}")))?;
            if agent.status == AgentStatus::Closed {
                return Ok(CloseOutcome {
                    id: id.to_string(),
                    cancelled: false,
                });
            }
            agent.pending_inputs.clear();
            let abort = agent.abort.take();
            agent.status = AgentStatus::Closed;
            agent.version += 1;
            (
                abort,
                background_payload("closed", agent, None, None),
            )
        };
        self.state.notify.notify_waiters();

        let cancelled = abort.is_some();
        if let Some(abort) = abort {
            abort.abort(Some(ABORT_REASON_CLOSE));
        }
        self.deliver_background(notification);
        Ok(CloseOutcome {
            id: id.to_string(),
            cancelled,
        })
    }

    /// Abort every running child and wait for them briefly.  Called when the
    /// parent loop closes.
    pub async fn shutdown(&self) {
        {
            let mut agents = self.state.agents.lock().unwrap();
            for agent in agents.values_mut() {
                if let Some(abort) = agent.abort.take() {
                    abort.abort(Some(ABORT_REASON_CLOSE));
                }
                if agent.status == AgentStatus::Running {
                    agent.status = AgentStatus::Closed;
                    agent.version += 1;
                }
            }
        }
        let handles: Vec<JoinHandle<()>> =
            self.state.run_handles.lock().unwrap().drain(..).collect();
        self.state.notify.notify_waiters();

        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;
    }

    /// Snapshot of one agent (used by tests and embedders).
    pub fn snapshot(&self, id: &str) -> Result<AgentSnapshot, LlmError> {
        let agents = self.state.agents.lock().unwrap();
        agents
            .get(id)
            .map(|a| a.snapshot())
            .ok_or_else(|| LlmError::invalid_argument(format!("unknown subagent id: {id}")))
    }

    // ── Run lifecycle ─────────────────────────────────────────────────────────

    fn try_start_run(state: &Arc<ControllerState>, id: &str) -> ResumeOutcome {
        let job = {
            let mut agents = state.agents.lock().unwrap();
            let Some(agent) = agents.get_mut(id) else {
                return ResumeOutcome::NoPendingInput;
            };
            if agent.status == AgentStatus::Running {
                return ResumeOutcome::AlreadyRunning;
            }
            let Some(input) = agent.pending_inputs.pop_front() else {
                return ResumeOutcome::NoPendingInput;
            };
            let abort = AbortHandle::new();
            agent.status = AgentStatus::Running;
            agent.abort = Some(abort.clone());
            agent.turns += 1;
            let now = Utc::now();
            agent.first_run_started_at.get_or_insert(now);
            agent.version += 1;
            SubagentJob {
                agent_id: agent.id.clone(),
                depth: agent.depth,
                model: agent.model.clone(),
                input,
                instructions: Some(agent.instructions.clone()),
                history: agent.history.clone(),
                max_steps: agent.max_steps,
                abort,
            }
        };
        state.notify.notify_waiters();

        let task_state = Arc::clone(state);
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            let input = job.input.clone();
            let abort = job.abort.clone();
            let result = task_state.runner.run(job).await;
            Self::finish_run(&task_state, &task_id, input, abort, result);
        });
        state.run_handles.lock().unwrap().push(handle);
        ResumeOutcome::Started
    }

    fn finish_run(
        state: &Arc<ControllerState>,
        id: &str,
        input: String,
        abort: AbortHandle,
        result: Result<LoopResult, LlmError>,
    ) {
        let notification = {
            let mut agents = state.agents.lock().unwrap();
            let Some(agent) = agents.get_mut(id) else {
                return;
            };
            agent.abort = None;
            agent.last_finished_at = Some(Utc::now());

            // Once closed, an agent only leaves that state through an
            // explicit `resume_agent`; a run finishing late (close raced the
            // completion) must not resurrect it.
            if agent.status == AgentStatus::Closed {
                agent.version += 1;
                state.notify.notify_waiters();
                return;
            }

            let notification = match abort.reason().as_deref() {
                Some(ABORT_REASON_INTERRUPT) => {
                    // Interrupted and redirected: idle, no completion.
                    agent.status = AgentStatus::Idle;
                    agent.version += 1;
                    Some(background_payload("input_queued", agent, None, None))
                }
                _ => match result {
                    Ok(run) => {
                        agent.history.push(Content::user(input));
                        agent.history.push(Content::assistant(run.text.clone()));
                        agent.last_result = Some(run);
                        agent.last_error = None;
                        agent.status = AgentStatus::Idle;
                        agent.version += 1;
                        let text = agent.last_result.as_ref().map(|r| r.text.clone());
                        Some(background_payload(
                            "run_completed",
                            agent,
                            text.as_deref(),
                            None,
                        ))
                    }
                    Err(err) if err.is_cancelled() => {
                        // Cancelled without a recognized reason; treat like an
                        // interrupt rather than a failure.
                        agent.status = AgentStatus::Idle;
                        agent.version += 1;
                        Some(background_payload("input_queued", agent, None, None))
                    }
                    Err(err) => {
                        warn!(agent_id = %id, error = %err, "subagent run failed");
                        agent.last_error = Some(err.to_string());
                        agent.status = AgentStatus::Failed;
                        agent.version += 1;
                        let error = agent.last_error.clone();
                        Some(background_payload(
                            "run_failed",
                            agent,
                            None,
                            error.as_deref(),
                        ))
                    }
                },
            };
            notification
        };
        state.notify.notify_waiters();
        if let Some(payload) = notification {
            deliver_background_to(&state.on_background, payload);
        }
    }

    fn deliver_background(&self, payload: String) {
        deliver_background_to(&self.state.on_background, payload);
    }
}

fn background_payload(
    kind: &str,
    agent: &ManagedAgent,
    text: Option<&str>,
    error: Option<&str>,
) -> String {
    let mut body = json!({
        "type": kind,
        "agent_id": agent.id,
        "nickname": agent.nickname,
        "status": agent.status,
    });
    if let Some(text) = text {
        body["text"] = json!(text);
    }
    if let Some(error) = error {
        body["error"] = json!(error);
    }
    format!("<subagent_notification>{body}</subagent_notification>")
}

fn deliver_background_to(sender: &Option<BackgroundSender>, payload: String) {
    // Delivery errors are swallowed; background messages are best-effort.
    if let Some(sender) = sender {
        sender(payload);
    }
}

/// Exactly one of `prompt` / `message` / `items` supplies the child's first
/// input.
fn resolve_spawn_input(
    params: &SpawnParams,
    pattern: PromptPattern,
) -> Result<String, LlmError> {
    let mut sources = 0;
    if params.prompt.is_some() {
        sources += 1;
    }
    if params.message.is_some() {
        sources += 1;
    }
    if params.items.is_some() {
        sources += 1;
    }
    if sources != 1 {
        return Err(LlmError::invalid_argument(
            "exactly one of 'prompt', 'message', or 'items' must be supplied",
        ));
    }
    if let Some(prompt) = &params.prompt {
        return non_empty(prompt);
    }
    if let Some(message) = &params.message {
        return non_empty(message);
    }
    let items = params.items.as_ref().unwrap();
    if items.is_empty() {
        return Err(LlmError::invalid_argument("'items' must not be empty"));
    }
    let rendered: Vec<String> = items
        .iter()
        .map(|item| match pattern {
            PromptPattern::Codex => {
                let role = item.role.as_deref().unwrap_or("message");
                let mut label: String = role.to_string();
                if let Some(first) = label.get_mut(..1) {
                    first.make_ascii_uppercase();
                }
                format!("## {label}\n\n{}", item.text)
            }
            PromptPattern::Plain => item.text.clone(),
        })
        .collect();
    non_empty(&rendered.join("\n\n"))
}

fn non_empty(text: &str) -> Result<String, LlmError> {
    if text.trim().is_empty() {
        return Err(LlmError::invalid_argument("empty prompt"));
    }
    Ok(text.to_string())
}

// ─── Tools ────────────────────────────────────────────────────────────────────

fn to_anyhow(err: LlmError) -> anyhow::Error {
    anyhow::Error::new(err)
}

struct SpawnAgentTool(SubagentController);

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Spawn an asynchronous child agent. Supply exactly one of 'prompt', \
         'message', or 'items'. The child starts working immediately; use \
         'wait' to collect its result."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::Function {
            parameters: json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Task for the child agent" },
                    "message": { "type": "string", "description": "Alias for 'prompt'" },
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "role": { "type": "string" },
                                "text": { "type": "string" }
                            },
                            "required": ["text"]
                        },
                        "description": "Structured prompt sections"
                    },
                    "role": {
                        "type": "string",
                        "enum": ["default", "researcher", "worker", "reviewer"]
                    },
                    "model": { "type": "string", "description": "Model override for the child" },
                    "max_steps": { "type": "integer" },
                    "fork_context": {
                        "type": "boolean",
                        "description": "Start the child with the parent's conversation history"
                    }
                }
            }),
        }
    }

    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value> {
        let params: SpawnParams = serde_json::from_value(input.into_value())?;
        let snapshot = self.0.spawn(params).map_err(to_anyhow)?;
        Ok(serde_json::to_value(snapshot)?)
    }
}

struct SendInputTool(SubagentController);

#[async_trait]
impl Tool for SendInputTool {
    fn name(&self) -> &str {
        "send_input"
    }

    fn description(&self) -> &str {
        "Queue a new input for a child agent. With interrupt=true the input \
         jumps the queue and any in-flight run is aborted."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::Function {
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "message": { "type": "string" },
                    "interrupt": { "type": "boolean" }
                },
                "required": ["id", "message"]
            }),
        }
    }

    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value> {
        let v = input.into_value();
        let id = required_str(&v, "id")?;
        let message = required_str(&v, "message")?;
        let interrupt = v["interrupt"].as_bool().unwrap_or(false);
        let snapshot = self
            .0
            .send_input(&id, message, interrupt)
            .map_err(to_anyhow)?;
        Ok(serde_json::to_value(snapshot)?)
    }
}

struct ResumeAgentTool(SubagentController);

#[async_trait]
impl Tool for ResumeAgentTool {
    fn name(&self) -> &str {
        "resume_agent"
    }

    fn description(&self) -> &str {
        "Start a child agent's next queued input, or re-open a closed agent."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::Function {
            parameters: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"]
            }),
        }
    }

    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value> {
        let v = input.into_value();
        let id = required_str(&v, "id")?;
        let outcome = self.0.resume(&id).map_err(to_anyhow)?;
        Ok(json!({ "id": id, "outcome": outcome }))
    }
}

struct WaitTool(SubagentController);

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Block until any of the named child agents is no longer running, or \
         the timeout elapses. Returns a snapshot per finished agent."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::Function {
            parameters: json!({
                "type": "object",
                "properties": {
                    "ids": { "type": "array", "items": { "type": "string" } },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["ids"]
            }),
        }
    }

    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value> {
        let v = input.into_value();
        let ids: Vec<String> = serde_json::from_value(v["ids"].clone())
            .map_err(|e| anyhow::anyhow!("'ids' must be an array of strings: {e}"))?;
        let timeout_ms = v["timeout_ms"].as_i64();
        let outcome = self.0.wait(&ids, timeout_ms).await.map_err(to_anyhow)?;
        Ok(serde_json::to_value(outcome)?)
    }
}

struct CloseAgentTool(SubagentController);

#[async_trait]
impl Tool for CloseAgentTool {
    fn name(&self) -> &str {
        "close_agent"
    }

    fn description(&self) -> &str {
        "Close a child agent: clear its queue, abort any in-flight run, and \
         release its slot. Closing an already-closed agent is a no-op."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::Function {
            parameters: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"]
            }),
        }
    }

    async fn execute(&self, input: ToolInput) -> anyhow::Result<Value> {
        let v = input.into_value();
        let id = required_str(&v, "id")?;
        let outcome = self.0.close(&id).map_err(to_anyhow)?;
        Ok(serde_json::to_value(outcome)?)
    }
}

fn required_str(v: &Value, key: &str) -> anyhow::Result<String> {
    v[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing required string field '{key}'"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runner that completes after a configurable delay, echoing the input.
    struct EchoRunner {
        delay: Duration,
        runs: AtomicU32,
    }

    impl EchoRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                runs: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SubagentRunner for EchoRunner {
        async fn run(&self, job: SubagentJob) -> Result<LoopResult, LlmError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = job.abort.aborted() => Err(LlmError::cancelled(job.abort.reason())),
                _ = tokio::time::sleep(self.delay) => Ok(LoopResult {
                    text: format!("{}-done", job.input),
                    thoughts: String::new(),
                    steps: Vec::new(),
                    total_cost_usd: 0.0,
                }),
            }
        }
    }

    fn controller_with(runner: Arc<dyn SubagentRunner>) -> SubagentController {
        SubagentController::new(SubagentControllerParams {
            config: SubagentConfig {
                min_wait: Duration::from_millis(10),
                default_wait: Duration::from_millis(500),
                ..Default::default()
            },
            parent_depth: 0,
            parent_model: "mock-parent".into(),
            fork_context_messages: None,
            runner,
            on_background_message: None,
            build_child_instructions: None,
        })
    }

    fn spawn_prompt(prompt: &str) -> SpawnParams {
        SpawnParams {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn spawn_wait_returns_result() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(20)));
        let snapshot = c.spawn(spawn_prompt("A")).unwrap();
        assert_eq!(snapshot.status, AgentStatus::Running);
        assert_eq!(snapshot.depth, 1);

        let outcome = c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        assert!(!outcome.timed_out);
        let done = &outcome.statuses[&snapshot.id];
        assert_eq!(done.status, AgentStatus::Idle);
        assert_eq!(done.last_result.as_ref().unwrap().text, "A-done");
        assert!(done.spawn_startup_latency_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn close_running_agent_reports_cancelled() {
        let c = controller_with(EchoRunner::new(Duration::from_secs(5)));
        let snapshot = c.spawn(spawn_prompt("long")).unwrap();
        let closed = c.close(&snapshot.id).unwrap();
        assert!(closed.cancelled);
        // Closing again is a no-op.
        let again = c.close(&snapshot.id).unwrap();
        assert!(!again.cancelled);
        // A wait on a closed agent resolves immediately.
        let outcome = c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        assert_eq!(outcome.statuses[&snapshot.id].status, AgentStatus::Closed);
    }

    #[tokio::test]
    async fn interrupt_transitions_to_idle_not_failed() {
        let c = controller_with(EchoRunner::new(Duration::from_secs(5)));
        let snapshot = c.spawn(spawn_prompt("long")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        c.send_input(&snapshot.id, "short".into(), true).unwrap();
        let outcome = c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        let after = &outcome.statuses[&snapshot.id];
        assert_eq!(after.status, AgentStatus::Idle);
        assert!(after.last_error.is_none());
        assert_eq!(after.pending_inputs, 1, "interrupt input stays queued");

        // Resume starts the queued input and the run completes normally.
        assert_eq!(c.resume(&snapshot.id).unwrap(), ResumeOutcome::Started);
        assert_eq!(c.snapshot(&snapshot.id).unwrap().status, AgentStatus::Running);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn resumed_interrupt_input_produces_its_result() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(40)));
        let snapshot = c.spawn(spawn_prompt("long")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.send_input(&snapshot.id, "short".into(), true).unwrap();
        c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        assert_eq!(c.resume(&snapshot.id).unwrap(), ResumeOutcome::Started);
        let outcome = c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        assert_eq!(
            outcome.statuses[&snapshot.id]
                .last_result
                .as_ref()
                .unwrap()
                .text,
            "short-done"
        );
    }

    #[tokio::test]
    async fn depth_limit_rejects_spawn() {
        let c = SubagentController::new(SubagentControllerParams {
            config: SubagentConfig {
                max_depth: 1,
                ..Default::default()
            },
            parent_depth: 1,
            parent_model: "mock-parent".into(),
            fork_context_messages: None,
            runner: EchoRunner::new(Duration::from_millis(1)),
            on_background_message: None,
            build_child_instructions: None,
        });
        assert!(!c.enabled());
        let err = c.spawn(spawn_prompt("x")).unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::LimitExceeded);
    }

    #[tokio::test]
    async fn max_agents_bounds_active_count() {
        let c = SubagentController::new(SubagentControllerParams {
            config: SubagentConfig {
                max_agents: 2,
                ..Default::default()
            },
            parent_depth: 0,
            parent_model: "mock-parent".into(),
            fork_context_messages: None,
            runner: EchoRunner::new(Duration::from_secs(5)),
            on_background_message: None,
            build_child_instructions: None,
        });
        let a = c.spawn(spawn_prompt("a")).unwrap();
        let _b = c.spawn(spawn_prompt("b")).unwrap();
        let err = c.spawn(spawn_prompt("c")).unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::LimitExceeded);
        // Closing one frees a slot.
        c.close(&a.id).unwrap();
        c.spawn(spawn_prompt("d")).unwrap();
        c.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_requires_exactly_one_input_source() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(1)));
        let err = c.spawn(SpawnParams::default()).unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
        let err = c
            .spawn(SpawnParams {
                prompt: Some("a".into()),
                message: Some("b".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn items_render_as_codex_sections() {
        let params = SpawnParams {
            items: Some(vec![
                SpawnItem {
                    role: Some("context".into()),
                    text: "the repo uses tabs".into(),
                },
                SpawnItem {
                    role: None,
                    text: "fix the formatter".into(),
                },
            ]),
            ..Default::default()
        };
        let input = resolve_spawn_input(&params, PromptPattern::Codex).unwrap();
        assert_eq!(
            input,
            "## Context\n\nthe repo uses tabs\n\n## Message\n\nfix the formatter"
        );
        let plain = resolve_spawn_input(&params, PromptPattern::Plain).unwrap();
        assert_eq!(plain, "the repo uses tabs\n\nfix the formatter");
    }

    #[tokio::test]
    async fn wait_timeout_returns_empty_map() {
        let c = controller_with(EchoRunner::new(Duration::from_secs(30)));
        let snapshot = c.spawn(spawn_prompt("slow")).unwrap();
        let outcome = c.wait(&[snapshot.id.clone()], Some(50)).await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.statuses.is_empty());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn wait_rejects_bad_arguments() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(1)));
        let err = c.wait(&[], Some(100)).await.unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
        let snapshot = c.spawn(spawn_prompt("a")).unwrap();
        let err = c.wait(&[snapshot.id.clone()], Some(0)).await.unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
        let err = c
            .wait(&["not-an-agent".to_string()], Some(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn resume_reopens_closed_agent() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(5)));
        let snapshot = c.spawn(spawn_prompt("a")).unwrap();
        c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        c.close(&snapshot.id).unwrap();
        assert_eq!(c.resume(&snapshot.id).unwrap(), ResumeOutcome::Reopened);
        assert_eq!(c.snapshot(&snapshot.id).unwrap().status, AgentStatus::Idle);
        assert_eq!(
            c.resume(&snapshot.id).unwrap(),
            ResumeOutcome::NoPendingInput
        );
    }

    #[tokio::test]
    async fn background_notifications_are_framed() {
        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let c = SubagentController::new(SubagentControllerParams {
            config: SubagentConfig {
                min_wait: Duration::from_millis(10),
                ..Default::default()
            },
            parent_depth: 0,
            parent_model: "mock-parent".into(),
            fork_context_messages: None,
            runner: EchoRunner::new(Duration::from_millis(5)),
            on_background_message: Some(Arc::new(move |msg| {
                sink.lock().unwrap().push(msg);
            })),
            build_child_instructions: None,
        });
        let snapshot = c.spawn(spawn_prompt("a")).unwrap();
        c.wait(&[snapshot.id.clone()], Some(10_000)).await.unwrap();
        let messages = received.lock().unwrap();
        assert!(!messages.is_empty());
        let msg = &messages[0];
        assert!(msg.starts_with("<subagent_notification>"));
        assert!(msg.ends_with("</subagent_notification>"));
        let inner = msg
            .strip_prefix("<subagent_notification>")
            .unwrap()
            .strip_suffix("</subagent_notification>")
            .unwrap();
        let parsed: Value = serde_json::from_str(inner).unwrap();
        assert_eq!(parsed["type"], json!("run_completed"));
        assert_eq!(parsed["text"], json!("a-done"));
    }

    #[tokio::test]
    async fn nicknames_count_per_role() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(1)));
        let a = c
            .spawn(SpawnParams {
                prompt: Some("x".into()),
                role: Some("researcher".into()),
                ..Default::default()
            })
            .unwrap();
        let b = c
            .spawn(SpawnParams {
                prompt: Some("y".into()),
                role: Some("researcher".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(a.nickname, "Researcher_1");
        assert_eq!(b.nickname, "Researcher_2");
    }

    #[tokio::test]
    async fn model_override_must_be_recognized() {
        let c = controller_with(EchoRunner::new(Duration::from_millis(1)));
        let err = c
            .spawn(SpawnParams {
                prompt: Some("x".into()),
                model: Some("made-up-model".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), tandem_model::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn fork_context_seeds_child_history() {
        let history = vec![Content::user("earlier"), Content::assistant("context")];
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        struct HistoryProbe(Arc<Mutex<Vec<usize>>>);
        #[async_trait]
        impl SubagentRunner for HistoryProbe {
            async fn run(&self, job: SubagentJob) -> Result<LoopResult, LlmError> {
                self.0.lock().unwrap().push(job.history.len());
                Ok(LoopResult {
                    text: "ok".into(),
                    thoughts: String::new(),
                    steps: Vec::new(),
                    total_cost_usd: 0.0,
                })
            }
        }

        let c = SubagentController::new(SubagentControllerParams {
            config: SubagentConfig {
                min_wait: Duration::from_millis(10),
                ..Default::default()
            },
            parent_depth: 0,
            parent_model: "mock-parent".into(),
            fork_context_messages: Some(history),
            runner: Arc::new(HistoryProbe(Arc::clone(&seen))),
            on_background_message: None,
            build_child_instructions: None,
        });
        let forked = c
            .spawn(SpawnParams {
                prompt: Some("x".into()),
                fork_context: true,
                ..Default::default()
            })
            .unwrap();
        let plain = c.spawn(spawn_prompt("y")).unwrap();
        c.wait(&[forked.id, plain.id], Some(10_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&2), "forked child sees parent history");
        assert!(seen.contains(&0), "plain child starts fresh");
    }
}
