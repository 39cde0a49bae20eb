//! Usage accounting for model-host calls.
//!
//! Every oracle interaction may hit one or more hosts. Each raw response is
//! reduced to a [`UsageRecord`] and appended, in call order, under
//! [`ADDITIONAL_DATA_KEY`] of the response object:
//!
//! ```text
//! {
//!   ...caller keys...,
//!   "additional_data_1983c80c": {
//!     "usage": [
//!       {"prompt_tokens": 12, ..., "model_name": "gpt-4o-mini", "host": "openai"},
//!       {"error": "Unknown host"}
//!     ]
//!   }
//! }
//! ```
//!
//! Extraction never fails: a malformed response becomes an error record.

pub mod pricing;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use pricing::{cost_nanodollars, TokenCounts};

/// Envelope key under which accounting data is attached.
pub const ADDITIONAL_DATA_KEY: &str = "additional_data_1983c80c";

const USAGE_FIELD: &str = "usage";

/// Hosts whose usage objects we know how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsageShape {
    /// `prompt_tokens` / `completion_tokens` (OpenAI, OpenRouter)
    OpenAi,
    /// `input_tokens` / `output_tokens`
    Anthropic,
}

impl UsageShape {
    fn for_host(host: &str) -> Option<Self> {
        match host.trim().to_lowercase().as_str() {
            "openai" | "openrouter" | "azure" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    fn required_fields(&self) -> [&'static str; 2] {
        match self {
            Self::OpenAi => ["prompt_tokens", "completion_tokens"],
            Self::Anthropic => ["input_tokens", "output_tokens"],
        }
    }
}

/// One raw host response awaiting accounting.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Caller-chosen identifier (e.g. `"select"`, `"summarise"`)
    pub id: String,
    pub host: String,
    pub body: Value,
}

impl RawResponse {
    pub fn new(id: impl Into<String>, host: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            body,
        }
    }
}

/// Usage extracted from one host call, or the reason it could not be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UsageRecord {
    Error { error: String },
    Usage(Map<String, Value>),
}

impl UsageRecord {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Error { error } => serde_json::json!({ "error": error }),
            Self::Usage(map) => Value::Object(map.clone()),
        }
    }
}

/// Reduce a raw response body to a usage record for `host`.
pub fn extract_usage(raw: &Value, host: &str) -> UsageRecord {
    let Some(body) = raw.as_object() else {
        return UsageRecord::error("LLM response is not a dictionary");
    };

    let Some(shape) = UsageShape::for_host(host) else {
        return UsageRecord::error("Unknown host");
    };

    let Some(usage) = body.get(USAGE_FIELD).and_then(Value::as_object) else {
        return UsageRecord::error(
            "Usage object not found in the response or is not a dictionary",
        );
    };

    for field in shape.required_fields() {
        if !usage.get(field).map(Value::is_u64).unwrap_or(false) {
            return UsageRecord::error(format!("Usage object is missing numeric '{}'", field));
        }
    }

    let model_name = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let mut record = usage.clone();
    if let Some(cost) = cost_nanodollars(&model_name, &token_counts(&record)) {
        record.insert("cost_nanodollars".to_string(), Value::from(cost));
    }
    record.insert("model_name".to_string(), Value::String(model_name));
    record.insert("host".to_string(), Value::String(host.to_string()));

    UsageRecord::Usage(record)
}

/// Append one usage record per raw response to `response`'s envelope.
///
/// Existing caller keys are never touched. A pre-existing envelope is
/// extended; a malformed one is replaced.
pub fn attach(raw_responses: &[RawResponse], response: &mut Map<String, Value>) {
    let envelope = response
        .entry(ADDITIONAL_DATA_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !envelope.is_object() {
        *envelope = Value::Object(Map::new());
    }
    let Value::Object(envelope) = envelope else {
        return;
    };

    let usage = envelope
        .entry(USAGE_FIELD.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !usage.is_array() {
        *usage = Value::Array(Vec::new());
    }
    let Value::Array(usage) = usage else {
        return;
    };

    for raw in raw_responses {
        let record = extract_usage(&raw.body, &raw.host);
        if let UsageRecord::Error { error } = &record {
            tracing::debug!(id = %raw.id, host = %raw.host, "Usage extraction failed: {}", error);
        }
        usage.push(record.to_value());
    }
}

/// Same as [`attach`] for an arbitrary JSON value; non-objects are returned unchanged.
pub fn attach_to_value(raw_responses: &[RawResponse], response: &mut Value) {
    if let Value::Object(map) = response {
        attach(raw_responses, map);
    }
}

/// Read the usage list of an envelope, if any.
pub fn envelope_records(response: &Map<String, Value>) -> &[Value] {
    response
        .get(ADDITIONAL_DATA_KEY)
        .and_then(|e| e.get(USAGE_FIELD))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Aggregated usage across one or more envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: u64,
}

impl UsageTotals {
    /// Sum every record of `response`'s envelope.
    pub fn from_envelope(response: &Map<String, Value>) -> Self {
        let mut totals = Self::default();
        for record in envelope_records(response) {
            totals.add_record(record);
        }
        totals
    }

    fn add_record(&mut self, record: &Value) {
        let Some(map) = record.as_object() else {
            return;
        };
        self.calls += 1;
        if map.contains_key("error") {
            self.errors += 1;
            return;
        }
        let counts = token_counts(map);
        self.input_tokens += counts.input_tokens;
        self.output_tokens += counts.output_tokens;
        self.cost_nanodollars += map
            .get("cost_nanodollars")
            .and_then(Value::as_u64)
            .unwrap_or(0);
    }

    pub fn merge(&mut self, other: &UsageTotals) {
        self.calls += other.calls;
        self.errors += other.errors;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_nanodollars += other.cost_nanodollars;
    }
}

/// Host-independent token counts from either usage shape.
fn token_counts(usage: &Map<String, Value>) -> TokenCounts {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64);

    let input_tokens = field("prompt_tokens")
        .or_else(|| {
            // Anthropic reports cache tokens separately from input_tokens.
            field("input_tokens").map(|base| {
                base + field("cache_creation_input_tokens").unwrap_or(0)
                    + field("cache_read_input_tokens").unwrap_or(0)
            })
        })
        .unwrap_or(0);
    let output_tokens = field("completion_tokens")
        .or_else(|| field("output_tokens"))
        .unwrap_or(0);
    let cached_input_tokens = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
        .or_else(|| field("cache_read_input_tokens"))
        .unwrap_or(0);

    TokenCounts {
        input_tokens,
        output_tokens,
        cached_input_tokens,
    }
}
