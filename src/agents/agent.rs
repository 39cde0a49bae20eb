//! The agent and its run loop.
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   Planning ──► Selecting ──► Executing ──► Recording ──► Summarising?
//!   (memory)     (oracle)      (capability)  (history)     (every N)
//!                    │
//!                    └─► Finish ──► Completed
//!
//!   recorded == max_subtasks ──► Partial
//! ```
//!
//! Every cycle that reaches Recording produces exactly one subtask record,
//! failures included, so the budget bounds oracle work even when every
//! step fails.

use std::sync::Arc;

use async_recursion::async_recursion;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::action::{Action, CODE_ACTION, DIRECT_ANSWER};
use super::oracle::{Decision, Oracle, SelectionRequest};
use super::types::{AgentError, AgentId, ConfigurationError, RunResult, RunStatus, TerminalReason};
use crate::capability::{ExecutionMode, Function, FunctionBody};
use crate::config::{Config, RetrievalFallback};
use crate::memory::{MemoryBank, MemoryStore, RetrievalError};
use crate::runner::{CodeRunner, ShellRunner};
use crate::shared::SharedVariables;
use crate::task::{SubtaskHistory, SubtaskRecord};
use crate::usage::{self, RawResponse, UsageTotals};
use crate::util::{fill_placeholders, truncate};

/// Computes extra global context from the agent and its shared variables.
pub type GlobalContextFn = Arc<dyn Fn(&Agent, &SharedVariables) -> String + Send + Sync>;

const DEFAULT_MAX_SUBTASKS: usize = 5;
const DEFAULT_SUMMARISE_COUNT: usize = 5;

/// A validated selection: finish, or run the menu entry at `index`.
enum Chosen {
    Finish(Value),
    Invoke {
        index: usize,
        text: String,
        arguments: Map<String, Value>,
    },
}

/// An agent that completes goals by choosing capabilities step by step.
///
/// Agents are immutable once built; sub-agents are shared through `Arc`.
pub struct Agent {
    id: AgentId,
    name: String,
    description: String,
    max_subtasks: usize,
    summarise_subtasks_count: usize,
    compulsory: Vec<Arc<Function>>,
    functions: Vec<Arc<Function>>,
    function_memory: Option<MemoryStore<Arc<Function>>>,
    sub_agents: Vec<Arc<Agent>>,
    agent_memory: Option<MemoryStore<Arc<Agent>>>,
    shared_variables: SharedVariables,
    default_to_llm: bool,
    code_action: bool,
    execution_mode: ExecutionMode,
    global_context: String,
    global_context_fn: Option<GlobalContextFn>,
    retrieval_fallback: RetrievalFallback,
    oracle: Arc<dyn Oracle>,
    code_runner: Option<Arc<dyn CodeRunner>>,
}

impl Agent {
    pub fn builder(
        name: impl Into<String>,
        description: impl Into<String>,
        oracle: Arc<dyn Oracle>,
    ) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            description: description.into(),
            oracle,
            max_subtasks: DEFAULT_MAX_SUBTASKS,
            summarise_subtasks_count: DEFAULT_SUMMARISE_COUNT,
            memory_bank: MemoryBank::default(),
            functions: Vec::new(),
            sub_agents: Vec::new(),
            shared_variables: SharedVariables::new(),
            default_to_llm: true,
            code_action: false,
            execution_mode: ExecutionMode::Sync,
            global_context: String::new(),
            global_context_fn: None,
            retrieval_fallback: RetrievalFallback::default(),
            code_runner: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn max_subtasks(&self) -> usize {
        self.max_subtasks
    }

    pub fn summarise_subtasks_count(&self) -> usize {
        self.summarise_subtasks_count
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn shared_variables(&self) -> &SharedVariables {
        &self.shared_variables
    }

    /// Compulsory functions followed by retrievable ones.
    pub fn functions(&self) -> impl Iterator<Item = &Arc<Function>> {
        self.compulsory.iter().chain(self.functions.iter())
    }

    pub fn sub_agents(&self) -> &[Arc<Agent>] {
        &self.sub_agents
    }

    /// Default text this agent is ranked by in a parent's agent memory.
    pub fn memory_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }

    /// Run towards `goal` using this agent's own shared variables.
    pub async fn run(&self, goal: &str) -> Result<RunResult, AgentError> {
        self.run_with_shared(goal, &self.shared_variables).await
    }

    /// Run towards `goal` against `shared`.
    ///
    /// Only oracle transport failures end a run early. Selection, retrieval
    /// and capability failures become failed subtask records.
    #[async_recursion]
    pub async fn run_with_shared(
        &self,
        goal: &str,
        shared: &SharedVariables,
    ) -> Result<RunResult, AgentError> {
        let mut history = SubtaskHistory::new();
        info!(agent = %self.name, goal = %truncate(goal, 120), "Starting run");

        while history.recorded() < self.max_subtasks {
            let index = history.recorded() + 1;
            let query = Self::retrieval_query(goal, &history);

            let menu = match self.plan(&query).await {
                Ok(menu) => menu,
                Err(e) => match self.retrieval_fallback {
                    RetrievalFallback::CompulsoryOnly => {
                        warn!(
                            agent = %self.name,
                            error = %e,
                            "Retrieval failed, offering compulsory functions only"
                        );
                        self.fallback_menu()
                    }
                    RetrievalFallback::AbortSubtask => {
                        warn!(agent = %self.name, error = %e, "Retrieval failed, aborting subtask");
                        let error = AgentError::Retrieval(e).to_string();
                        let record = SubtaskRecord::failed(index, "retrieval", json!(query), error);
                        history.record(record);
                        self.maybe_summarise(goal, &mut history).await?;
                        continue;
                    }
                },
            };

            let mut raw: Vec<RawResponse> = Vec::new();
            let chosen = self.select(goal, &menu, shared, &history, &mut raw).await?;

            let record = match chosen {
                Ok(Chosen::Finish(output)) => {
                    history.add_usage(&totals_of(&raw));
                    info!(agent = %self.name, subtasks = history.recorded(), "Goal completed");
                    return Ok(self.conclude(history, output, TerminalReason::Finished));
                }
                Ok(Chosen::Invoke {
                    index: choice,
                    text,
                    arguments,
                }) => {
                    let action = &menu[choice];
                    info!(
                        agent = %self.name,
                        subtask = index,
                        action = %action.name(),
                        "Executing subtask"
                    );
                    self.execute(index, action, text, arguments, shared, &mut raw)
                        .await?
                }
                Err(reason) => {
                    let error = AgentError::Selection(reason).to_string();
                    warn!(
                        agent = %self.name,
                        subtask = index,
                        %error,
                        "Recording failed selection"
                    );
                    SubtaskRecord::failed(index, "invalid_selection", Value::Null, error)
                }
            };

            let mut envelope = Map::new();
            usage::attach(&raw, &mut envelope);
            history.record(record.with_usage(envelope));
            self.maybe_summarise(goal, &mut history).await?;
        }

        info!(agent = %self.name, max_subtasks = self.max_subtasks, "Subtask budget exhausted");
        let output = history.last_output().cloned().unwrap_or(Value::Null);
        Ok(self.conclude(history, output, TerminalReason::MaxSubtasks))
    }

    /// Goal plus the most recent history entry.
    fn retrieval_query(goal: &str, history: &SubtaskHistory) -> String {
        match history.latest_entry() {
            Some(entry) => format!("{}\n{}", goal, entry),
            None => goal.to_string(),
        }
    }

    async fn plan(&self, query: &str) -> Result<Vec<Action>, RetrievalError> {
        let (functions, agents) =
            futures::try_join!(self.retrieve_functions(query), self.retrieve_agents(query))?;

        let mut menu: Vec<Action> = self.compulsory.iter().cloned().map(Action::Function).collect();
        menu.extend(functions.into_iter().map(Action::Function));
        menu.extend(agents.into_iter().map(Action::SubAgent));
        self.push_synthetic(&mut menu);
        debug!(agent = %self.name, menu = ?menu, "Planned menu");
        Ok(menu)
    }

    async fn retrieve_functions(&self, query: &str) -> Result<Vec<Arc<Function>>, RetrievalError> {
        match &self.function_memory {
            Some(store) => Ok(store.retrieve(query).await?.into_iter().cloned().collect()),
            None => Ok(self.functions.clone()),
        }
    }

    async fn retrieve_agents(&self, query: &str) -> Result<Vec<Arc<Agent>>, RetrievalError> {
        match &self.agent_memory {
            Some(store) => Ok(store.retrieve(query).await?.into_iter().cloned().collect()),
            None => Ok(self.sub_agents.clone()),
        }
    }

    /// Menu used when ranking fails: nothing that needed ranking.
    fn fallback_menu(&self) -> Vec<Action> {
        let mut menu: Vec<Action> = self.compulsory.iter().cloned().map(Action::Function).collect();
        if self.function_memory.is_none() {
            menu.extend(self.functions.iter().cloned().map(Action::Function));
        }
        menu.extend(self.sub_agents.iter().cloned().map(Action::SubAgent));
        self.push_synthetic(&mut menu);
        menu
    }

    fn push_synthetic(&self, menu: &mut Vec<Action>) {
        if self.default_to_llm {
            menu.push(Action::DirectAnswer);
        }
        if self.code_action {
            menu.push(Action::CodeAction);
        }
    }

    /// Ask for a decision, re-prompting once if it does not name a menu entry.
    async fn select(
        &self,
        goal: &str,
        menu: &[Action],
        shared: &SharedVariables,
        history: &SubtaskHistory,
        raw: &mut Vec<RawResponse>,
    ) -> Result<Result<Chosen, String>, AgentError> {
        let snapshot = shared.snapshot();
        let global_context = self.render_global_context(shared, &snapshot);
        let mut correction: Option<String> = None;

        for attempt in 1..=2 {
            let request = SelectionRequest {
                agent_name: &self.name,
                agent_description: &self.description,
                goal,
                menu,
                shared_variables: snapshot.clone(),
                global_context: global_context.clone(),
                history: history.condensed(),
                correction: correction.take(),
            };
            let reply = self.oracle.select(&request).await.map_err(AgentError::Llm)?;
            raw.extend(reply.raw);

            let checked = reply.value.and_then(|decision| match decision {
                Decision::Finish { output } => Ok(Chosen::Finish(output)),
                Decision::Invoke {
                    action,
                    text,
                    arguments,
                } => match menu.iter().position(|a| a.name() == action) {
                    Some(index) => Ok(Chosen::Invoke {
                        index,
                        text,
                        arguments,
                    }),
                    None => Err(format!("'{}' is not one of the available actions", action)),
                },
            });

            match checked {
                Ok(chosen) => return Ok(Ok(chosen)),
                Err(reason) if attempt == 1 => {
                    warn!(agent = %self.name, %reason, "Invalid selection, re-prompting");
                    correction = Some(reason);
                }
                Err(reason) => return Ok(Err(reason)),
            }
        }

        Ok(Err("no valid selection".to_string()))
    }

    /// The filled template followed by the computed context, if any.
    fn render_global_context(
        &self,
        shared: &SharedVariables,
        snapshot: &Map<String, Value>,
    ) -> String {
        let mut context = fill_placeholders(&self.global_context, snapshot);
        if let Some(compute) = &self.global_context_fn {
            let computed = compute(self, shared);
            if !computed.trim().is_empty() {
                if !context.is_empty() {
                    context.push('\n');
                }
                context.push_str(&computed);
            }
        }
        context
    }

    async fn execute(
        &self,
        index: usize,
        action: &Action,
        text: String,
        arguments: Map<String, Value>,
        shared: &SharedVariables,
        raw: &mut Vec<RawResponse>,
    ) -> Result<SubtaskRecord, AgentError> {
        let input = json!({ "text": text, "arguments": arguments });
        let failure = |message: String| AgentError::CapabilityExecution {
            capability: action.name().to_string(),
            message,
        };

        let result: Result<Value, AgentError> = match action {
            Action::Function(function) => match function.body() {
                FunctionBody::Llm => {
                    let reply = self
                        .oracle
                        .fill_function(function, &text, &arguments)
                        .await
                        .map_err(AgentError::Llm)?;
                    raw.extend(reply.raw);
                    function
                        .shape_output(reply.value)
                        .map_err(|e| failure(e.to_string()))
                }
                FunctionBody::Sync(_) | FunctionBody::Async(_) => function
                    .invoke(shared, arguments)
                    .await
                    .map_err(|e| failure(format!("{:#}", e))),
            },
            Action::SubAgent(agent) => {
                let instruction = arguments
                    .get("instruction")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(&text);
                let sub = agent.run_with_shared(instruction, shared).await?;
                Ok(json!({
                    "output": sub.output,
                    "status": sub.status,
                    "subtasks": sub.subtask_count,
                    "usage": sub.usage,
                }))
            }
            Action::DirectAnswer => Ok(Value::String(text)),
            Action::CodeAction => self.run_code(&arguments, shared).await.map_err(failure),
        };

        Ok(match result {
            Ok(output) => SubtaskRecord::succeeded(index, action.name(), input, output),
            Err(e) => {
                warn!(agent = %self.name, subtask = index, error = %e, "Capability failed");
                SubtaskRecord::failed(index, action.name(), input, e.to_string())
            }
        })
    }

    async fn run_code(
        &self,
        arguments: &Map<String, Value>,
        shared: &SharedVariables,
    ) -> Result<Value, String> {
        let runner = self
            .code_runner
            .as_ref()
            .ok_or_else(|| "no code runner configured".to_string())?;
        let code = arguments
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing 'code' argument".to_string())?;

        let output = runner
            .run(code, &shared.snapshot())
            .await
            .map_err(|e| format!("{:#}", e))?;
        if !output.success() {
            return Err(format!(
                "exit code {:?}: {}",
                output.exit_code,
                truncate(&output.stderr, 2000)
            ));
        }
        serde_json::to_value(&output).map_err(|e| e.to_string())
    }

    async fn maybe_summarise(
        &self,
        goal: &str,
        history: &mut SubtaskHistory,
    ) -> Result<(), AgentError> {
        if !history.needs_summary(self.summarise_subtasks_count) {
            return Ok(());
        }

        let reply = self
            .oracle
            .summarise(goal, history.summary(), history.live())
            .await
            .map_err(AgentError::Llm)?;
        history.add_usage(&totals_of(&reply.raw));
        let dropped = history.compact(reply.value);
        debug!(agent = %self.name, dropped = dropped.len(), "Summarised subtask history");
        Ok(())
    }

    fn conclude(
        &self,
        history: SubtaskHistory,
        output: Value,
        reason: TerminalReason,
    ) -> RunResult {
        let status = match reason {
            TerminalReason::Finished => RunStatus::Completed,
            TerminalReason::MaxSubtasks => RunStatus::Partial,
        };
        let subtask_count = history.recorded();
        let usage = history.usage();
        let (summary, records) = history.into_parts();
        RunResult {
            agent: self.name.clone(),
            output,
            status,
            terminal_reason: reason,
            subtask_count,
            summary,
            records,
            usage,
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_subtasks", &self.max_subtasks)
            .field("functions", &self.functions().map(|f| f.name()).collect::<Vec<_>>())
            .field(
                "sub_agents",
                &self.sub_agents.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field("execution_mode", &self.execution_mode)
            .finish()
    }
}

fn totals_of(raw: &[RawResponse]) -> UsageTotals {
    let mut envelope = Map::new();
    usage::attach(raw, &mut envelope);
    UsageTotals::from_envelope(&envelope)
}

/// Builder for [`Agent`]; all validation happens in [`AgentBuilder::build`].
pub struct AgentBuilder {
    name: String,
    description: String,
    oracle: Arc<dyn Oracle>,
    max_subtasks: usize,
    summarise_subtasks_count: usize,
    memory_bank: MemoryBank,
    functions: Vec<Function>,
    sub_agents: Vec<Arc<Agent>>,
    shared_variables: SharedVariables,
    default_to_llm: bool,
    code_action: bool,
    execution_mode: ExecutionMode,
    global_context: String,
    global_context_fn: Option<GlobalContextFn>,
    retrieval_fallback: RetrievalFallback,
    code_runner: Option<Arc<dyn CodeRunner>>,
}

impl AgentBuilder {
    /// Take budgets, direct answering, code actions and the fallback policy
    /// from `config`.
    ///
    /// With `config.code_action` set and no runner given yet, code runs in a
    /// [`ShellRunner`] built from the config.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.max_subtasks = config.max_subtasks;
        self.summarise_subtasks_count = config.summarise_subtasks_count;
        self.default_to_llm = config.default_to_llm;
        self.retrieval_fallback = config.retrieval_fallback;
        if config.code_action {
            self.code_action = true;
            if self.code_runner.is_none() {
                self.code_runner = Some(Arc::new(ShellRunner::from_config(config)));
            }
        }
        self
    }

    pub fn max_subtasks(mut self, max_subtasks: usize) -> Self {
        self.max_subtasks = max_subtasks;
        self
    }

    pub fn summarise_subtasks_count(mut self, count: usize) -> Self {
        self.summarise_subtasks_count = count;
        self
    }

    pub fn memory_bank(mut self, memory_bank: MemoryBank) -> Self {
        self.memory_bank = memory_bank;
        self
    }

    pub fn shared_variables(mut self, shared_variables: SharedVariables) -> Self {
        self.shared_variables = shared_variables;
        self
    }

    pub fn default_to_llm(mut self, enabled: bool) -> Self {
        self.default_to_llm = enabled;
        self
    }

    pub fn code_action(mut self, enabled: bool) -> Self {
        self.code_action = enabled;
        self
    }

    pub fn code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.code_runner = Some(runner);
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Text shown on every step; `<key>` is replaced by shared variable `key`.
    pub fn global_context(mut self, template: impl Into<String>) -> Self {
        self.global_context = template.into();
        self
    }

    /// Context computed before every selection, appended after the template.
    pub fn global_context_fn<F>(mut self, compute: F) -> Self
    where
        F: Fn(&Agent, &SharedVariables) -> String + Send + Sync + 'static,
    {
        self.global_context_fn = Some(Arc::new(compute));
        self
    }

    pub fn retrieval_fallback(mut self, policy: RetrievalFallback) -> Self {
        self.retrieval_fallback = policy;
        self
    }

    pub fn assign_functions(mut self, functions: impl IntoIterator<Item = Function>) -> Self {
        self.functions.extend(functions);
        self
    }

    pub fn assign_agents(mut self, agents: impl IntoIterator<Item = Arc<Agent>>) -> Self {
        self.sub_agents.extend(agents);
        self
    }

    /// Validate and assemble the agent.
    ///
    /// # Errors
    /// Any [`ConfigurationError`]: empty name, zero budgets, duplicate or
    /// reserved capability names, functions not matching the execution
    /// mode, delegation cycles, code actions without a runner, or nothing
    /// to do.
    pub fn build(self) -> Result<Agent, ConfigurationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName("agent"));
        }
        if self.max_subtasks == 0 {
            return Err(ConfigurationError::ZeroBudget("max_subtasks"));
        }
        if self.summarise_subtasks_count == 0 {
            return Err(ConfigurationError::ZeroBudget("summarise_subtasks_count"));
        }
        if self.code_action && self.code_runner.is_none() {
            return Err(ConfigurationError::CodeActionWithoutRunner);
        }

        let mut seen: Vec<&str> = vec![DIRECT_ANSWER, CODE_ACTION];
        let names = self
            .functions
            .iter()
            .map(Function::name)
            .chain(self.sub_agents.iter().map(|a| a.name()));
        for capability in names {
            if seen.contains(&capability) {
                return Err(ConfigurationError::DuplicateName(capability.to_string()));
            }
            seen.push(capability);
        }

        if let Some(function) = self
            .functions
            .iter()
            .find(|f| !f.body().compatible_with(self.execution_mode))
        {
            return Err(ConfigurationError::ModeMismatch {
                function: function.name().to_string(),
                mode: self.execution_mode,
            });
        }

        let id = AgentId::new();
        for sub in &self.sub_agents {
            if delegates_to(sub, id, &name) {
                return Err(ConfigurationError::DelegationCycle(sub.name().to_string()));
            }
        }

        if self.functions.is_empty()
            && self.sub_agents.is_empty()
            && !self.default_to_llm
            && !self.code_action
        {
            return Err(ConfigurationError::NoCapabilities(name));
        }

        let (compulsory, functions): (Vec<_>, Vec<_>) = self
            .functions
            .into_iter()
            .map(Arc::new)
            .partition(|f| f.is_compulsory());

        let function_memory = self.memory_bank.function.map(|settings| {
            let text: Arc<dyn Fn(&Function) -> String + Send + Sync> = match settings.mapper {
                Some(mapper) => mapper,
                None => Arc::new(Function::memory_text),
            };
            MemoryStore::new(
                functions.clone(),
                settings.top_k,
                move |f: &Arc<Function>| text(f.as_ref()),
                settings.strategy,
            )
        });
        let agent_memory = self.memory_bank.agent.map(|settings| {
            let text: Arc<dyn Fn(&Agent) -> String + Send + Sync> = match settings.mapper {
                Some(mapper) => mapper,
                None => Arc::new(Agent::memory_text),
            };
            MemoryStore::new(
                self.sub_agents.clone(),
                settings.top_k,
                move |a: &Arc<Agent>| text(a.as_ref()),
                settings.strategy,
            )
        });

        Ok(Agent {
            id,
            name,
            description: self.description,
            max_subtasks: self.max_subtasks,
            summarise_subtasks_count: self.summarise_subtasks_count,
            compulsory,
            functions,
            function_memory,
            sub_agents: self.sub_agents,
            agent_memory,
            shared_variables: self.shared_variables,
            default_to_llm: self.default_to_llm,
            code_action: self.code_action,
            execution_mode: self.execution_mode,
            global_context: self.global_context,
            global_context_fn: self.global_context_fn,
            retrieval_fallback: self.retrieval_fallback,
            oracle: self.oracle,
            code_runner: self.code_runner,
        })
    }
}

/// Whether `root` or anything it delegates to is the agent `(id, name)`.
fn delegates_to(root: &Arc<Agent>, id: AgentId, name: &str) -> bool {
    let mut stack: Vec<&Arc<Agent>> = vec![root];
    while let Some(agent) = stack.pop() {
        if agent.id == id || agent.name == name {
            return true;
        }
        stack.extend(agent.sub_agents.iter());
    }
    false
}
