//! The decision oracle consulted at every step of a run.
//!
//! The orchestrator never talks to a model directly. It hands an [`Oracle`]
//! a [`SelectionRequest`] and gets back a [`Decision`] together with the raw
//! host responses that produced it, which feed usage accounting.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::action::{render_menu, Action};
use crate::capability::Function;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::task::SubtaskRecord;
use crate::usage::RawResponse;
use crate::util::extract_json_object;

/// What the oracle wants to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The goal is achieved; `output` is the run's result.
    Finish { output: Value },
    /// Run `action` with `arguments`. `text` carries the subtask
    /// description, or the answer itself for a direct answer.
    Invoke {
        action: String,
        text: String,
        arguments: Map<String, Value>,
    },
}

/// A value produced by the oracle plus the host responses behind it.
#[derive(Debug, Clone)]
pub struct OracleReply<T> {
    pub value: T,
    pub raw: Vec<RawResponse>,
}

impl<T> OracleReply<T> {
    pub fn new(value: T, raw: Vec<RawResponse>) -> Self {
        Self { value, raw }
    }
}

/// Outcome of asking for a decision: a reply the oracle could not turn
/// into a decision is `Err(reason)`, not a transport failure.
pub type Selection = Result<Decision, String>;

/// Everything the oracle sees when choosing an action.
#[derive(Debug)]
pub struct SelectionRequest<'a> {
    pub agent_name: &'a str,
    pub agent_description: &'a str,
    pub goal: &'a str,
    pub menu: &'a [Action],
    pub shared_variables: Map<String, Value>,
    pub global_context: String,
    pub history: String,
    /// Set on the single re-prompt after an invalid selection
    pub correction: Option<String>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Choose the next action, or finish.
    ///
    /// `Err` is reserved for transport failures.
    async fn select(
        &self,
        request: &SelectionRequest<'_>,
    ) -> anyhow::Result<OracleReply<Selection>>;

    /// Fold `previous` and `entries` into one condensed summary.
    async fn summarise(
        &self,
        goal: &str,
        previous: Option<&str>,
        entries: &[SubtaskRecord],
    ) -> anyhow::Result<OracleReply<String>>;

    /// Produce the declared outputs of a function that has no callable.
    async fn fill_function(
        &self,
        function: &Function,
        instruction: &str,
        arguments: &Map<String, Value>,
    ) -> anyhow::Result<OracleReply<Value>>;
}

/// Oracle backed by a chat-completion model.
pub struct LlmOracle {
    client: Arc<dyn LlmClient>,
    model: String,
    options: ChatOptions,
}

impl LlmOracle {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            options: ChatOptions {
                temperature: Some(0.0),
                max_tokens: None,
                json_mode: true,
            },
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn ask(
        &self,
        id: &str,
        system: String,
        user: String,
    ) -> anyhow::Result<(String, RawResponse)> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let response = self
            .client
            .chat_completion_with_options(&self.model, &messages, self.options.clone())
            .await?;
        if response.finish_reason.as_deref() == Some("length") {
            warn!(model = %self.model, call = id, "Oracle reply hit the token limit");
        }
        let raw = RawResponse::new(id, self.client.host(), response.raw);
        Ok((response.content.unwrap_or_default(), raw))
    }

    fn selection_prompt(request: &SelectionRequest<'_>) -> (String, String) {
        let system = format!(
            r#"You are {name}, an agent that completes a goal one subtask at a time.
Description: {description}

Available actions:
{menu}

Respond with a single JSON object, either
{{"decision": "finish", "output": <final result for the goal>}}
when the goal is fully achieved, or
{{"decision": "invoke", "action": "<action name>", "text": "<what this subtask should do>", "arguments": {{...}}}}
to run one action. Only use action names from the list above."#,
            name = request.agent_name,
            description = request.agent_description,
            menu = render_menu(request.menu),
        );

        let mut user = format!("Goal: {}\n", request.goal);
        if !request.global_context.is_empty() {
            user.push_str(&format!("Global context: {}\n", request.global_context));
        }
        user.push_str(&format!(
            "Shared variables: {}\nProgress so far:\n{}",
            Value::Object(request.shared_variables.clone()),
            request.history
        ));
        if let Some(correction) = &request.correction {
            user.push_str(&format!("\n\nYour previous reply was invalid: {}", correction));
        }
        (system, user)
    }
}

/// Interpret a model reply as a decision.
pub fn parse_decision(reply: &str) -> Selection {
    let object = extract_json_object(reply).ok_or_else(|| {
        format!(
            "reply is not a JSON object: {}",
            crate::util::truncate(reply, 200)
        )
    })?;

    let decision = object
        .get("decision")
        .and_then(Value::as_str)
        .unwrap_or_else(|| {
            if object.contains_key("action") {
                "invoke"
            } else {
                "finish"
            }
        });

    match decision {
        "finish" | "end_task" => Ok(Decision::Finish {
            output: object.get("output").cloned().unwrap_or(Value::Null),
        }),
        "invoke" => {
            let action = object
                .get("action")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| "missing 'action'".to_string())?;
            let text = object
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = match object.get("arguments") {
                Some(Value::Object(map)) => map.clone(),
                None | Some(Value::Null) => Map::new(),
                Some(other) => return Err(format!("'arguments' must be an object, got {}", other)),
            };
            Ok(Decision::Invoke {
                action: action.to_string(),
                text,
                arguments,
            })
        }
        other => Err(format!("unknown decision '{}'", other)),
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn select(
        &self,
        request: &SelectionRequest<'_>,
    ) -> anyhow::Result<OracleReply<Selection>> {
        let (system, user) = Self::selection_prompt(request);
        debug!(
            agent = request.agent_name,
            menu = request.menu.len(),
            "Asking oracle for next action"
        );
        let (content, raw) = self.ask("select", system, user).await?;
        Ok(OracleReply::new(parse_decision(&content), vec![raw]))
    }

    async fn summarise(
        &self,
        goal: &str,
        previous: Option<&str>,
        entries: &[SubtaskRecord],
    ) -> anyhow::Result<OracleReply<String>> {
        let system = r#"Summarise the progress of an agent towards its goal.
Keep every fact needed to continue: values produced, failures, what is left.
Respond with JSON: {"summary": "<text>"}"#
            .to_string();
        let entries_text = entries
            .iter()
            .map(SubtaskRecord::condensed)
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "Goal: {}\nPrevious summary: {}\nNew subtasks:\n{}",
            goal,
            previous.unwrap_or("none"),
            entries_text
        );

        let (content, raw) = self.ask("summarise", system, user).await?;
        let summary = extract_json_object(&content)
            .and_then(|obj| obj.get("summary").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| content.trim().to_string());
        Ok(OracleReply::new(summary, vec![raw]))
    }

    async fn fill_function(
        &self,
        function: &Function,
        instruction: &str,
        arguments: &Map<String, Value>,
    ) -> anyhow::Result<OracleReply<Value>> {
        let system = format!(
            "You perform this function: {}\nRespond with a JSON object with exactly these keys: {}",
            function.describe(),
            json!(function.output_format())
        );
        let user = format!(
            "Instruction: {}\nArguments: {}",
            instruction,
            Value::Object(arguments.clone())
        );

        let (content, raw) = self.ask(function.name(), system, user).await?;
        let value = match extract_json_object(&content) {
            Some(object) => Value::Object(object),
            None => Value::String(content.trim().to_string()),
        };
        Ok(OracleReply::new(value, vec![raw]))
    }
}
