//! Menu entries the oracle chooses between.

use std::sync::Arc;

use super::Agent;
use crate::capability::Function;

/// Name of the synthetic action that lets the oracle answer directly.
pub const DIRECT_ANSWER: &str = "use_llm";

/// Name of the synthetic action that runs oracle-written code.
pub const CODE_ACTION: &str = "generate_and_run_code";

/// One selectable action.
#[derive(Clone)]
pub enum Action {
    Function(Arc<Function>),
    SubAgent(Arc<Agent>),
    DirectAnswer,
    CodeAction,
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Function(f) => f.name(),
            Action::SubAgent(agent) => agent.name(),
            Action::DirectAnswer => DIRECT_ANSWER,
            Action::CodeAction => CODE_ACTION,
        }
    }

    /// Text shown for this action in the oracle's menu.
    pub fn describe(&self) -> String {
        match self {
            Action::Function(f) => f.describe(),
            Action::SubAgent(agent) => format!(
                "{}: Delegates to agent. {} Arguments: {{\"instruction\": <goal for the agent>}}",
                agent.name(),
                agent.description()
            ),
            Action::DirectAnswer => format!(
                "{}: Answers the subtask directly without calling a tool. Put the answer in `text`.",
                DIRECT_ANSWER
            ),
            Action::CodeAction => format!(
                "{}: Runs a shell script. Arguments: {{\"code\": <script>}}. \
                 Shared variables are exported as TASKGEN_VAR_<KEY>.",
                CODE_ACTION
            ),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Function(func) => write!(f, "Function({})", func.name()),
            Action::SubAgent(agent) => write!(f, "SubAgent({})", agent.name()),
            Action::DirectAnswer => f.write_str("DirectAnswer"),
            Action::CodeAction => f.write_str("CodeAction"),
        }
    }
}

/// Render a menu as the numbered list given to the oracle.
pub fn render_menu(menu: &[Action]) -> String {
    menu.iter()
        .enumerate()
        .map(|(i, action)| format!("{}. {}", i + 1, action.describe()))
        .collect::<Vec<_>>()
        .join("\n")
}
