//! End-to-end runs of the agent loop against a scripted oracle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use taskgen::agents::{
    AgentError, Decision, Oracle, OracleReply, RunStatus, Selection, SelectionRequest,
    TerminalReason, DIRECT_ANSWER,
};
use taskgen::config::RetrievalFallback;
use taskgen::llm::Embedder;
use taskgen::task::{SubtaskRecord, SubtaskStatus};
use taskgen::usage::{envelope_records, RawResponse};
use taskgen::{
    Agent, ExecutionMode, Function, MemoryBank, MemorySettings, Ranker, RetrievalStrategy,
    SharedVariables, ADDITIONAL_DATA_KEY,
};

#[derive(Default)]
struct Log {
    goals: Vec<String>,
    menus: Vec<Vec<String>>,
    corrections: Vec<Option<String>>,
    contexts: Vec<String>,
    summaries: Vec<(Option<String>, usize)>,
}

/// Plays back selections in order, repeating the last one when exhausted.
struct ScriptedOracle {
    script: Vec<Selection>,
    cursor: AtomicUsize,
    fail_transport: bool,
    log: Mutex<Log>,
}

impl ScriptedOracle {
    fn new(script: Vec<Selection>) -> Arc<Self> {
        Arc::new(Self {
            script,
            cursor: AtomicUsize::new(0),
            fail_transport: false,
            log: Mutex::new(Log::default()),
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            cursor: AtomicUsize::new(0),
            fail_transport: true,
            log: Mutex::new(Log::default()),
        })
    }

    fn select_calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn menu(&self, call: usize) -> Vec<String> {
        self.log.lock().menus[call].clone()
    }
}

fn raw(id: &str) -> RawResponse {
    RawResponse::new(
        id,
        "openai",
        json!({
            "model": "gpt-4o-mini",
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        }),
    )
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn select(
        &self,
        request: &SelectionRequest<'_>,
    ) -> anyhow::Result<OracleReply<Selection>> {
        if self.fail_transport {
            anyhow::bail!("connection reset by peer");
        }
        {
            let mut log = self.log.lock();
            log.goals.push(request.goal.to_string());
            log.menus
                .push(request.menu.iter().map(|a| a.name().to_string()).collect());
            log.corrections.push(request.correction.clone());
            log.contexts.push(request.global_context.clone());
        }
        let call = self.cursor.fetch_add(1, Ordering::SeqCst);
        let selection = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(Ok(Decision::Finish { output: Value::Null }));
        Ok(OracleReply::new(selection, vec![raw("select")]))
    }

    async fn summarise(
        &self,
        _goal: &str,
        previous: Option<&str>,
        entries: &[SubtaskRecord],
    ) -> anyhow::Result<OracleReply<String>> {
        let mut log = self.log.lock();
        log.summaries
            .push((previous.map(str::to_string), entries.len()));
        let summary = format!("summary #{}", log.summaries.len());
        Ok(OracleReply::new(summary, vec![raw("summarise")]))
    }

    async fn fill_function(
        &self,
        function: &Function,
        instruction: &str,
        _arguments: &Map<String, Value>,
    ) -> anyhow::Result<OracleReply<Value>> {
        let value = json!({ "output_1": format!("{} via {}", instruction, function.name()) });
        Ok(OracleReply::new(value, vec![raw(function.name())]))
    }
}

fn invoke(action: &str, arguments: Value) -> Selection {
    Ok(Decision::Invoke {
        action: action.to_string(),
        text: format!("run {}", action),
        arguments: arguments.as_object().cloned().unwrap_or_default(),
    })
}

fn finish(output: Value) -> Selection {
    Ok(Decision::Finish { output })
}

fn counter(name: &str) -> Function {
    let calls = Arc::new(AtomicUsize::new(0));
    Function::builder(name, format!("Counts how often {} ran", name))
        .output_format([("output_1", "int")])
        .sync_fn(move |_, _| Ok(json!(calls.fetch_add(1, Ordering::SeqCst) + 1)))
        .build()
        .unwrap()
}

fn compulsory(name: &str) -> Function {
    Function::builder(name, "Always available")
        .output_format([("output_1", "str")])
        .compulsory(true)
        .sync_fn(|_, _| Ok(json!("done")))
        .build()
        .unwrap()
}

fn counting_strategy(calls: Arc<AtomicUsize>) -> RetrievalStrategy {
    RetrievalStrategy::custom(move |_, text| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(text.len() as f64)
    })
}

#[tokio::test]
async fn budget_ends_run_after_exactly_max_subtasks() {
    let oracle = ScriptedOracle::new(vec![invoke("tick", json!({}))]);
    let agent = Agent::builder("Ticker", "Ticks", oracle.clone())
        .max_subtasks(3)
        .summarise_subtasks_count(10)
        .assign_functions([counter("tick")])
        .build()
        .unwrap();

    let result = agent.run("tick forever").await.unwrap();

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.terminal_reason, TerminalReason::MaxSubtasks);
    assert_eq!(result.subtask_count, 3);
    assert_eq!(result.records.len(), 3);
    assert_eq!(oracle.select_calls(), 3);
    assert_eq!(result.output, json!({"output_1": 3}));
    let indices: Vec<usize> = result.records.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
}

#[tokio::test]
async fn finish_completes_the_run() {
    let oracle = ScriptedOracle::new(vec![
        invoke("tick", json!({})),
        finish(json!({"answer": 1})),
    ]);
    let agent = Agent::builder("Ticker", "Ticks", oracle.clone())
        .assign_functions([counter("tick")])
        .build()
        .unwrap();

    let result = agent.run("tick once").await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.terminal_reason, TerminalReason::Finished);
    assert_eq!(result.subtask_count, 1);
    assert_eq!(result.output, json!({"answer": 1}));
}

#[tokio::test]
async fn compulsory_functions_survive_top_k_zero() {
    let scored = Arc::new(AtomicUsize::new(0));
    let oracle = ScriptedOracle::new(vec![finish(Value::Null)]);
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .memory_bank(MemoryBank::new().with_function_memory(MemorySettings::new(
            0,
            counting_strategy(scored.clone()),
        )))
        .assign_functions([counter("weather"), compulsory("dish_price"), counter("stocks")])
        .build()
        .unwrap();

    agent.run("price the menu").await.unwrap();

    assert_eq!(oracle.menu(0), vec!["dish_price", DIRECT_ANSWER]);
    assert_eq!(scored.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn top_k_limits_retrievable_functions() {
    let scored = Arc::new(AtomicUsize::new(0));
    let oracle = ScriptedOracle::new(vec![finish(Value::Null)]);
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .default_to_llm(false)
        .memory_bank(MemoryBank::new().with_function_memory(MemorySettings::new(
            1,
            counting_strategy(scored.clone()),
        )))
        .assign_functions([counter("ab"), counter("abcd"), compulsory("dish_price")])
        .build()
        .unwrap();

    agent.run("q").await.unwrap();

    // Longer description text scores higher under the counting strategy.
    assert_eq!(oracle.menu(0), vec!["dish_price", "abcd"]);
    assert_eq!(scored.load(Ordering::SeqCst), 2);
}

struct PanickingEmbedder;

#[async_trait]
impl Embedder for PanickingEmbedder {
    fn model(&self) -> &str {
        "never"
    }

    async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        panic!("ranker must not be consulted");
    }
}

#[tokio::test]
async fn registry_within_top_k_is_not_ranked() {
    let price = Function::builder("A", "price")
        .sync_fn(|_, _| Ok(json!("$5")))
        .build()
        .unwrap();
    let ingredients = Function::builder("B", "ingredients")
        .sync_fn(|_, _| Ok(json!(["flour"])))
        .build()
        .unwrap();
    let ranker = Arc::new(Ranker::new(Arc::new(PanickingEmbedder)));
    let oracle = ScriptedOracle::new(vec![invoke("B", json!({})), finish(Value::Null)]);
    let agent = Agent::builder("Chef", "Cooks", oracle.clone())
        .memory_bank(MemoryBank::new().with_function_memory(MemorySettings::new(
            2,
            RetrievalStrategy::Ranker(ranker.clone()),
        )))
        .assign_functions([price, ingredients])
        .build()
        .unwrap();

    let result = agent.run("what goes in bread").await.unwrap();

    assert_eq!(oracle.menu(0), vec!["A", "B", DIRECT_ANSWER]);
    assert_eq!(oracle.menu(1), vec!["A", "B", DIRECT_ANSWER]);
    assert_eq!(result.records[0].output, json!(["flour"]));
    assert_eq!(ranker.cached_embeddings(), 0);
}

#[tokio::test]
async fn compulsory_pair_is_offered_without_ranking() {
    let ranker = Arc::new(Ranker::new(Arc::new(PanickingEmbedder)));
    let oracle = ScriptedOracle::new(vec![invoke("A", json!({}))]);
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .max_subtasks(3)
        .default_to_llm(false)
        .memory_bank(MemoryBank::new().with_function_memory(MemorySettings::new(
            1,
            RetrievalStrategy::Ranker(ranker.clone()),
        )))
        .assign_functions([compulsory("A"), compulsory("B")])
        .build()
        .unwrap();

    let result = agent.run("price and list ingredients").await.unwrap();

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(oracle.select_calls(), 3);
    for call in 0..3 {
        assert_eq!(oracle.menu(call), vec!["A", "B"]);
    }
    assert_eq!(ranker.cached_embeddings(), 0);
}

fn recording_strategy(texts: Arc<Mutex<Vec<String>>>) -> RetrievalStrategy {
    RetrievalStrategy::custom(move |_, text| {
        texts.lock().push(text.to_string());
        Ok(text.len() as f64)
    })
}

#[tokio::test]
async fn memory_mappers_choose_the_ranked_text() {
    let wordy = Function::builder("x", "a very long description about dish prices")
        .sync_fn(|_, _| Ok(Value::Null))
        .build()
        .unwrap();
    let terse = Function::builder("yyyyyy", "short")
        .sync_fn(|_, _| Ok(Value::Null))
        .build()
        .unwrap();
    let chef = Arc::new(
        Agent::builder("Chef", "Cooks every dish on the menu", ScriptedOracle::new(vec![]))
            .build()
            .unwrap(),
    );
    let critic = Arc::new(
        Agent::builder("Critic", "Tastes", ScriptedOracle::new(vec![]))
            .build()
            .unwrap(),
    );

    let function_texts = Arc::new(Mutex::new(Vec::new()));
    let agent_texts = Arc::new(Mutex::new(Vec::new()));
    let memory = MemoryBank::new()
        .with_function_memory(
            MemorySettings::new(1, recording_strategy(function_texts.clone()))
                .with_mapper(|f: &Function| f.name().to_string()),
        )
        .with_agent_memory(
            MemorySettings::new(1, recording_strategy(agent_texts.clone()))
                .with_mapper(|a: &Agent| a.description().to_string()),
        );

    let oracle = ScriptedOracle::new(vec![finish(Value::Null)]);
    let agent = Agent::builder("Restaurant", "Runs a restaurant", oracle.clone())
        .default_to_llm(false)
        .memory_bank(memory)
        .assign_functions([wordy, terse])
        .assign_agents([chef, critic])
        .build()
        .unwrap();

    agent.run("plan dinner").await.unwrap();

    assert_eq!(*function_texts.lock(), vec!["x", "yyyyyy"]);
    assert_eq!(*agent_texts.lock(), vec!["Cooks every dish on the menu", "Tastes"]);
    assert_eq!(oracle.menu(0), vec!["yyyyyy", "Chef"]);
}

#[tokio::test]
async fn default_memory_text_is_name_and_description() {
    let texts = Arc::new(Mutex::new(Vec::new()));
    let oracle = ScriptedOracle::new(vec![finish(Value::Null)]);
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .memory_bank(MemoryBank::new().with_function_memory(MemorySettings::new(
            1,
            recording_strategy(texts.clone()),
        )))
        .assign_functions([counter("tick"), counter("tock")])
        .build()
        .unwrap();

    agent.run("q").await.unwrap();
    assert_eq!(
        *texts.lock(),
        vec!["tick: Counts how often tick ran", "tock: Counts how often tock ran"]
    );
}

#[tokio::test]
async fn invalid_selection_is_reprompted_once() {
    let oracle = ScriptedOracle::new(vec![
        Err("reply is not a JSON object".to_string()),
        invoke("tick", json!({})),
        finish(Value::Null),
    ]);
    let agent = Agent::builder("Ticker", "Ticks", oracle.clone())
        .assign_functions([counter("tick")])
        .build()
        .unwrap();

    let result = agent.run("tick").await.unwrap();

    let corrections = oracle.log.lock().corrections.clone();
    assert_eq!(corrections[0], None);
    assert_eq!(corrections[1].as_deref(), Some("reply is not a JSON object"));
    assert_eq!(corrections[2], None);
    assert_eq!(result.subtask_count, 1);
    assert!(result.records[0].status.is_success());

    // Both selection calls of the first cycle are accounted to its record.
    assert_eq!(envelope_records(&result.records[0].usage).len(), 2);
}

#[tokio::test]
async fn second_invalid_selection_records_a_failed_subtask() {
    let oracle = ScriptedOracle::new(vec![
        invoke("teleport", json!({})),
        invoke("teleport", json!({})),
        finish(json!("gave up")),
    ]);
    let agent = Agent::builder("Ticker", "Ticks", oracle.clone())
        .assign_functions([counter("tick")])
        .build()
        .unwrap();

    let result = agent.run("tick").await.unwrap();

    assert_eq!(oracle.select_calls(), 3);
    assert_eq!(result.subtask_count, 1);
    let record = &result.records[0];
    assert_eq!(record.action_taken, "invalid_selection");
    let SubtaskStatus::Failed { error } = &record.status else {
        panic!("expected a failed record");
    };
    assert!(error.contains("teleport"));
    assert_eq!(result.output, json!("gave up"));
}

fn failing_memory() -> MemoryBank {
    MemoryBank::new().with_function_memory(MemorySettings::new(
        1,
        RetrievalStrategy::custom(|_, _| anyhow::bail!("ranker offline")),
    ))
}

#[tokio::test]
async fn retrieval_failure_falls_back_to_compulsory_functions() {
    let oracle = ScriptedOracle::new(vec![invoke("dish_price", json!({})), finish(Value::Null)]);
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .memory_bank(failing_memory())
        .retrieval_fallback(RetrievalFallback::CompulsoryOnly)
        .assign_functions([counter("weather"), counter("stocks"), compulsory("dish_price")])
        .build()
        .unwrap();

    let result = agent.run("price").await.unwrap();

    assert_eq!(oracle.menu(0), vec!["dish_price", DIRECT_ANSWER]);
    assert!(result.records[0].status.is_success());
    assert!(result.is_complete());
}

#[tokio::test]
async fn retrieval_failure_can_abort_the_subtask() {
    let oracle = ScriptedOracle::new(vec![finish(Value::Null)]);
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .max_subtasks(2)
        .memory_bank(failing_memory())
        .retrieval_fallback(RetrievalFallback::AbortSubtask)
        .assign_functions([counter("weather"), counter("stocks")])
        .build()
        .unwrap();

    let result = agent.run("price").await.unwrap();

    assert_eq!(oracle.select_calls(), 0);
    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.subtask_count, 2);
    assert!(result
        .records
        .iter()
        .all(|r| r.action_taken == "retrieval" && !r.status.is_success()));
}

#[tokio::test]
async fn capability_errors_are_recorded_and_the_run_continues() {
    let broken = Function::builder("split", "Splits a bill")
        .output_format([("left", "float"), ("right", "float")])
        .sync_fn(|_, _| Ok(json!({"left": 1.5})))
        .build()
        .unwrap();
    let oracle = ScriptedOracle::new(vec![
        invoke("split", json!({"total": 3})),
        finish(json!("done")),
    ]);
    let agent = Agent::builder("Accountant", "Splits bills", oracle.clone())
        .assign_functions([broken])
        .build()
        .unwrap();

    let result = agent.run("split the bill").await.unwrap();

    let record = &result.records[0];
    assert_eq!(record.action_taken, "split");
    assert_eq!(record.input["arguments"], json!({"total": 3}));
    let SubtaskStatus::Failed { error } = &record.status else {
        panic!("expected a failed record");
    };
    assert!(error.contains("right"));
    assert!(result.is_complete());
}

#[tokio::test]
async fn sub_agents_share_the_callers_variables() {
    let child_oracle = ScriptedOracle::new(vec![
        invoke("write_menu", json!({"dishes": ["soup", "pie"]})),
        finish(json!({"menu_written": true})),
    ]);
    let write_menu = Function::builder("write_menu", "Stores <dishes: list> as the menu")
        .sync_fn(|shared, args| {
            let dishes = args.get("dishes").cloned().unwrap_or(Value::Null);
            shared.set("menu", dishes);
            Ok(json!("stored"))
        })
        .build()
        .unwrap();
    let chef = Arc::new(
        Agent::builder("Chef", "Designs menus", child_oracle.clone())
            .assign_functions([write_menu])
            .build()
            .unwrap(),
    );

    let parent_oracle = ScriptedOracle::new(vec![
        invoke("Chef", json!({"instruction": "Write a two-dish menu"})),
        finish(Value::Null),
    ]);
    let shared = SharedVariables::new();
    let parent = Agent::builder("MenuCreator", "Creates menus", parent_oracle.clone())
        .shared_variables(shared.clone())
        .assign_agents([chef])
        .build()
        .unwrap();

    let result = parent.run("make a menu").await.unwrap();

    assert_eq!(shared.get("menu"), Some(json!(["soup", "pie"])));
    assert_eq!(child_oracle.log.lock().goals[0], "Write a two-dish menu");
    assert_eq!(parent_oracle.menu(0), vec!["Chef", DIRECT_ANSWER]);
    let output = &result.records[0].output;
    assert_eq!(output["output"], json!({"menu_written": true}));
    assert_eq!(output["status"], json!("Completed"));
    assert_eq!(output["subtasks"], json!(1));
}

#[tokio::test]
async fn history_is_summarised_every_n_subtasks() {
    let oracle = ScriptedOracle::new(vec![
        invoke("tick", json!({})),
        invoke("tick", json!({})),
        invoke("tick", json!({})),
        invoke("tick", json!({})),
        invoke("tick", json!({})),
        finish(Value::Null),
    ]);
    let agent = Agent::builder("Ticker", "Ticks", oracle.clone())
        .max_subtasks(10)
        .summarise_subtasks_count(2)
        .assign_functions([counter("tick")])
        .build()
        .unwrap();

    let result = agent.run("tick five times").await.unwrap();

    let summaries = oracle.log.lock().summaries.clone();
    assert_eq!(
        summaries,
        vec![(None, 2), (Some("summary #1".to_string()), 2)]
    );
    assert_eq!(result.subtask_count, 5);
    assert_eq!(result.summary.as_deref(), Some("summary #2"));
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].index, 5);
}

#[tokio::test]
async fn records_carry_usage_envelopes() {
    let oracle = ScriptedOracle::new(vec![invoke("tick", json!({})), finish(Value::Null)]);
    let agent = Agent::builder("Ticker", "Ticks", oracle.clone())
        .assign_functions([counter("tick")])
        .build()
        .unwrap();

    let result = agent.run("tick").await.unwrap();

    let usage = &result.records[0].usage;
    assert_eq!(usage.len(), 1);
    let records = usage[ADDITIONAL_DATA_KEY]["usage"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["prompt_tokens"], 100);
    assert_eq!(records[0]["model_name"], "gpt-4o-mini");
    assert_eq!(records[0]["host"], "openai");

    // One selection per cycle plus the finishing selection.
    assert_eq!(result.usage.calls, 2);
    assert_eq!(result.usage.input_tokens, 200);
    assert_eq!(result.usage.output_tokens, 40);
}

#[tokio::test]
async fn direct_answers_and_llm_functions_use_the_oracle() {
    let translate = Function::builder("translate", "Translates <text> to French")
        .output_format([("output_1", "str")])
        .build()
        .unwrap();
    let oracle = ScriptedOracle::new(vec![
        invoke(DIRECT_ANSWER, json!({})),
        invoke("translate", json!({"text": "bread"})),
        finish(Value::Null),
    ]);
    let agent = Agent::builder("Linguist", "Answers language questions", oracle.clone())
        .execution_mode(ExecutionMode::Async)
        .assign_functions([translate])
        .build()
        .unwrap();

    let result = agent.run("say bread in French").await.unwrap();

    assert_eq!(result.records[0].output, json!(format!("run {}", DIRECT_ANSWER)));
    assert_eq!(
        result.records[1].output,
        json!({"output_1": "run translate via translate"})
    );
    // The fill call is accounted alongside the selection.
    assert_eq!(envelope_records(&result.records[1].usage).len(), 2);
}

#[tokio::test]
async fn global_context_is_filled_from_shared_variables() {
    let oracle = ScriptedOracle::new(vec![finish(Value::Null)]);
    let shared = SharedVariables::new();
    shared.set("budget", json!(40));
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .shared_variables(shared)
        .global_context("Keep the total under $<budget>")
        .build()
        .unwrap();

    agent.run("price").await.unwrap();
    assert_eq!(oracle.log.lock().contexts[0], "Keep the total under $40");
}

#[tokio::test]
async fn computed_global_context_follows_shared_state() {
    let note = Function::builder("note", "Writes a note")
        .sync_fn(|shared, _| {
            shared.set("noted", json!(true));
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    let oracle = ScriptedOracle::new(vec![invoke("note", json!({})), finish(Value::Null)]);
    let shared = SharedVariables::new();
    shared.set("budget", json!(40));
    let agent = Agent::builder("Economist", "Prices dishes", oracle.clone())
        .shared_variables(shared)
        .global_context("Budget $<budget>")
        .global_context_fn(|agent, shared| {
            format!("{} tracks {} variables", agent.name(), shared.len())
        })
        .assign_functions([note])
        .build()
        .unwrap();

    agent.run("price").await.unwrap();

    let contexts = oracle.log.lock().contexts.clone();
    assert_eq!(contexts[0], "Budget $40\nEconomist tracks 1 variables");
    assert_eq!(contexts[1], "Budget $40\nEconomist tracks 2 variables");
}

#[tokio::test]
async fn oracle_transport_failure_ends_the_run() {
    let agent = Agent::builder("Ticker", "Ticks", ScriptedOracle::broken())
        .build()
        .unwrap();
    let err = agent.run("tick").await.unwrap_err();
    assert!(matches!(err, AgentError::Llm(_)));
}
