//! Callable capabilities an agent can present to its oracle.
//!
//! A [`Function`] wraps a body with the metadata the oracle needs to pick it:
//! a name, a natural-language description, the declared output keys and
//! optional worked examples. Bodies come in three flavours:
//! - `Sync`: plain closure, run inline
//! - `Async`: closure returning a boxed future
//! - `Llm`: no callable; the oracle produces the declared outputs itself
//!
//! Which of `Sync`/`Async` an agent accepts is fixed by its
//! [`ExecutionMode`] and checked when functions are assigned.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::panic::Location;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::ConfigurationError;
use crate::shared::SharedVariables;
use crate::source::{signature_of, CallableSource};

/// Synchronous function body.
pub type SyncFn =
    Arc<dyn Fn(&SharedVariables, Map<String, Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Asynchronous function body.
pub type AsyncFn = Arc<
    dyn Fn(SharedVariables, Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// How an agent runs its function bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

#[derive(Clone)]
pub enum FunctionBody {
    Sync(SyncFn),
    Async(AsyncFn),
    /// Outputs are generated by the oracle from the description.
    Llm,
}

impl FunctionBody {
    /// Whether this body may be registered on an agent running in `mode`.
    pub fn compatible_with(&self, mode: ExecutionMode) -> bool {
        match self {
            FunctionBody::Sync(_) => mode == ExecutionMode::Sync,
            FunctionBody::Async(_) => mode == ExecutionMode::Async,
            FunctionBody::Llm => true,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FunctionBody::Sync(_) => "sync",
            FunctionBody::Async(_) => "async",
            FunctionBody::Llm => "llm",
        }
    }
}

/// Worked input/output pair shown to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub input: Value,
    pub output: Value,
}

/// A named, described callable.
#[derive(Clone)]
pub struct Function {
    fn_name: String,
    fn_description: String,
    output_format: BTreeMap<String, String>,
    examples: Vec<Example>,
    body: FunctionBody,
    is_compulsory: bool,
    source: Option<CallableSource>,
}

impl Function {
    pub fn builder(name: impl Into<String>, description: impl Into<String>) -> FunctionBuilder {
        FunctionBuilder {
            fn_name: name.into(),
            fn_description: description.into(),
            output_format: BTreeMap::new(),
            examples: Vec::new(),
            body: None,
            is_compulsory: false,
            source: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.fn_name
    }

    pub fn description(&self) -> &str {
        &self.fn_description
    }

    pub fn output_format(&self) -> &BTreeMap<String, String> {
        &self.output_format
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn is_compulsory(&self) -> bool {
        self.is_compulsory
    }

    /// Source text of the body, when it was supplied and can be recovered.
    pub fn signature(&self) -> Option<String> {
        self.source.as_ref().and_then(signature_of)
    }

    /// Text the ranker scores against a query.
    pub fn memory_text(&self) -> String {
        format!("{}: {}", self.fn_name, self.fn_description)
    }

    /// Menu entry shown to the oracle.
    pub fn describe(&self) -> String {
        let mut out = format!("{}: {}", self.fn_name, self.fn_description);
        if !self.output_format.is_empty() {
            let format = serde_json::to_string(&self.output_format).unwrap_or_default();
            let _ = write!(out, "\n  Output format: {}", format);
        }
        for example in &self.examples {
            let _ = write!(
                out,
                "\n  Example: input {} -> output {}",
                example.input, example.output
            );
        }
        if let Some(signature) = self.signature() {
            let _ = write!(out, "\n  Source: {}", signature);
        }
        out
    }

    /// Run a `Sync` or `Async` body and shape its result.
    ///
    /// `Llm` bodies are not callable here; the orchestrator routes them to
    /// the oracle.
    pub async fn invoke(
        &self,
        shared: &SharedVariables,
        arguments: Map<String, Value>,
    ) -> anyhow::Result<Value> {
        let raw = match &self.body {
            FunctionBody::Sync(f) => f(shared, arguments)?,
            FunctionBody::Async(f) => f(shared.clone(), arguments).await?,
            FunctionBody::Llm => {
                anyhow::bail!("Function '{}' has no callable body", self.fn_name)
            }
        };
        self.shape_output(raw)
    }

    /// Check the result against the declared output keys.
    ///
    /// A non-object result is wrapped under the single declared key when
    /// there is exactly one. Types are not enforced.
    pub fn shape_output(&self, output: Value) -> anyhow::Result<Value> {
        if self.output_format.is_empty() {
            return Ok(output);
        }

        let output = match output {
            Value::Object(map) => Value::Object(map),
            other if self.output_format.len() == 1 => {
                let key = self.output_format.keys().next().cloned().unwrap_or_default();
                let mut map = Map::new();
                map.insert(key, other);
                Value::Object(map)
            }
            other => anyhow::bail!(
                "Function '{}' returned {} but declares {} output keys",
                self.fn_name,
                other,
                self.output_format.len()
            ),
        };

        let missing: Vec<&str> = self
            .output_format
            .keys()
            .filter(|key| output.get(key.as_str()).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "Function '{}' output is missing declared keys: {}",
                self.fn_name,
                missing.join(", ")
            );
        }

        Ok(output)
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("fn_name", &self.fn_name)
            .field("fn_description", &self.fn_description)
            .field("output_format", &self.output_format)
            .field("body", &self.body.label())
            .field("is_compulsory", &self.is_compulsory)
            .finish()
    }
}

pub struct FunctionBuilder {
    fn_name: String,
    fn_description: String,
    output_format: BTreeMap<String, String>,
    examples: Vec<Example>,
    body: Option<FunctionBody>,
    is_compulsory: bool,
    source: Option<CallableSource>,
}

impl FunctionBuilder {
    /// Declare output keys and their semantic type names.
    pub fn output_format<K, V>(mut self, format: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.output_format
            .extend(format.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn example(mut self, input: Value, output: Value) -> Self {
        self.examples.push(Example { input, output });
        self
    }

    pub fn compulsory(mut self, is_compulsory: bool) -> Self {
        self.is_compulsory = is_compulsory;
        self
    }

    /// Synchronous body. Unless a source is set, the call site is recorded
    /// so a closure written on this line shows up in [`Function::describe`].
    #[track_caller]
    pub fn sync_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&SharedVariables, Map<String, Value>) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.body = Some(FunctionBody::Sync(Arc::new(f)));
        self.record_call_site(Location::caller());
        self
    }

    #[track_caller]
    pub fn async_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SharedVariables, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.body = Some(FunctionBody::Async(Arc::new(move |shared, args| {
            Box::pin(f(shared, args))
        })));
        self.record_call_site(Location::caller());
        self
    }

    fn record_call_site(&mut self, caller: &Location<'_>) {
        self.source.get_or_insert_with(|| CallableSource::Location {
            file: caller.file().to_string(),
            line: caller.line(),
        });
    }

    /// Let the oracle produce this function's outputs.
    pub fn llm_fn(mut self) -> Self {
        self.body = Some(FunctionBody::Llm);
        self
    }

    /// Explicit body source, replacing any recorded call site.
    pub fn source(mut self, source: CallableSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Validate and build.
    ///
    /// Without an explicit body the function is LLM-backed; compulsory
    /// functions must have a callable.
    pub fn build(self) -> Result<Function, ConfigurationError> {
        let fn_name = self.fn_name.trim().to_string();
        if fn_name.is_empty() {
            return Err(ConfigurationError::EmptyName("function"));
        }
        if self.fn_description.trim().is_empty() {
            return Err(ConfigurationError::MissingDescription(fn_name));
        }

        let body = match self.body {
            Some(FunctionBody::Llm) | None if self.is_compulsory => {
                return Err(ConfigurationError::MissingCallable(fn_name));
            }
            Some(body) => body,
            None => FunctionBody::Llm,
        };

        Ok(Function {
            fn_name,
            fn_description: self.fn_description,
            output_format: self.output_format,
            examples: self.examples,
            body,
            is_compulsory: self.is_compulsory,
            source: self.source,
        })
    }
}
