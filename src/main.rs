//! taskgen - command line entry point
//!
//! Runs the demo Economist agent on the goal given as arguments and prints
//! the run result as JSON.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use taskgen::{
    config::Config,
    llm::{EmbeddingClient, OpenAiClient},
    Agent, Function, LlmOracle, MemoryBank, MemorySettings, Ranker, RetrievalStrategy,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stable pseudo-price for a dish name, in dollars.
fn price_from_name(name: &str) -> u32 {
    let hash = name
        .bytes()
        .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    5 + hash % 26
}

/// Price every dish named in `list_of_dish_names` (a list or a single name).
fn price_dishes(args: &Map<String, Value>) -> Value {
    let dishes: Vec<String> = match args.get("list_of_dish_names") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    };
    let prices: Map<String, Value> = dishes
        .into_iter()
        .map(|dish| {
            let price = format!("${}", price_from_name(&dish));
            (dish, Value::String(price))
        })
        .collect();
    json!({ "output_1": prices })
}

fn dish_price() -> anyhow::Result<Function> {
    let function = Function::builder(
        "dish_price",
        "Takes in <list_of_dish_names: list> and outputs price of each dish",
    )
    .output_format([("output_1", "dict")])
    .compulsory(true)
    .sync_fn(|_, args| Ok(price_dishes(&args)))
    .build()?;
    Ok(function)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskgen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let goal = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if goal.trim().is_empty() {
        anyhow::bail!("usage: taskgen <goal...>");
    }

    let config = Config::from_env()?;
    info!(model = %config.default_model, host = %config.host, "Loaded configuration");

    let client = Arc::new(OpenAiClient::new(
        config.api_key.clone(),
        config.base_url.clone(),
        config.host.clone(),
    ));
    let oracle = Arc::new(LlmOracle::new(client, config.default_model.clone()));
    let embedder = Arc::new(EmbeddingClient::new(
        config.api_key.clone(),
        config.base_url.clone(),
        config.memory.embed_model.clone(),
    ));
    let ranker = Arc::new(Ranker::new(embedder));

    let economist = Agent::builder(
        "Economist",
        "Takes in dish names and comes up with pricing for each of them",
        oracle,
    )
    .with_config(&config)
    .memory_bank(MemoryBank::new().with_function_memory(MemorySettings::new(
        config.memory.top_k,
        RetrievalStrategy::Ranker(ranker),
    )))
    .assign_functions([dish_price()?])
    .build()?;

    let result = economist.run(&goal).await?;
    info!(
        status = ?result.status,
        subtasks = result.subtask_count,
        cost_nanodollars = result.usage.cost_nanodollars,
        "Run finished"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
