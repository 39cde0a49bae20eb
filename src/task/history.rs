//! Bounded subtask history with periodic summarisation.

use serde::Serialize;
use serde_json::Value;

use super::SubtaskRecord;
use crate::usage::UsageTotals;

/// History of one agent run.
///
/// Live records accumulate until [`SubtaskHistory::needs_summary`] says so;
/// [`SubtaskHistory::compact`] then folds them into the running summary.
/// Totals and the last output survive compaction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubtaskHistory {
    summary: Option<String>,
    live: Vec<SubtaskRecord>,
    recorded: usize,
    last_output: Option<Value>,
    usage: UsageTotals,
}

impl SubtaskHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Returns the number of cycles recorded so far.
    pub fn record(&mut self, record: SubtaskRecord) -> usize {
        self.recorded += 1;
        self.usage.merge(&record.usage_totals());
        if record.status.is_success() {
            self.last_output = Some(record.output.clone());
        }
        self.live.push(record);
        self.recorded
    }

    /// Whether the count just reached a positive multiple of `every`.
    pub fn needs_summary(&self, every: usize) -> bool {
        every > 0 && self.recorded > 0 && self.recorded % every == 0 && !self.live.is_empty()
    }

    /// Replace the summary and drop every live record.
    pub fn compact(&mut self, summary: String) -> Vec<SubtaskRecord> {
        self.summary = Some(summary);
        std::mem::take(&mut self.live)
    }

    /// Account for oracle calls that belong to no record (summaries).
    pub fn add_usage(&mut self, totals: &UsageTotals) {
        self.usage.merge(totals);
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn live(&self) -> &[SubtaskRecord] {
        &self.live
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn last_output(&self) -> Option<&Value> {
        self.last_output.as_ref()
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    /// Most recent entry: the latest live record, else the summary.
    pub fn latest_entry(&self) -> Option<String> {
        self.live
            .last()
            .map(SubtaskRecord::condensed)
            .or_else(|| self.summary.clone())
    }

    /// Summary followed by the live records, one per line.
    pub fn condensed(&self) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(self.live.len() + 1);
        if let Some(summary) = &self.summary {
            lines.push(format!("Summary of earlier subtasks: {}", summary));
        }
        lines.extend(self.live.iter().map(SubtaskRecord::condensed));
        if lines.is_empty() {
            "No subtasks completed yet.".to_string()
        } else {
            lines.join("\n")
        }
    }

    pub fn into_parts(self) -> (Option<String>, Vec<SubtaskRecord>) {
        (self.summary, self.live)
    }
}
