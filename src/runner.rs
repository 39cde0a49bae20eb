//! Execution of oracle-written code for the code action.
//!
//! [`ShellRunner`] runs the emitted script with `sh -c` in a working
//! directory, under a timeout. Each shared variable is exported to the
//! script as `TASKGEN_VAR_<KEY>` (key upper-cased; non-alphanumerics become
//! `_`), strings verbatim and other values as JSON.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::config::Config;

/// Prefix of the environment variables shared variables are exported as.
pub const VAR_PREFIX: &str = "TASKGEN_VAR_";

/// What a code action produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CodeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Execute `code` with a read-only view of the shared variables.
    async fn run(&self, code: &str, shared: &Map<String, Value>) -> anyhow::Result<CodeOutput>;
}

/// Commands refused outright, with a hint for the oracle.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "This would destroy the entire system"),
    ("rm -rf /*", "This would destroy the entire system"),
    ("rm -rf ~", "Deleting the home directory is blocked"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    ("mkfs", "Formatting filesystems is blocked"),
    (":(){ :|:& };:", "Fork bombs are blocked"),
    ("shutdown", "Power management is blocked"),
    ("reboot", "Power management is blocked"),
];

const COMMAND_PREFIXES: &[&str] = &["sudo ", "time ", "nice ", "nohup "];

/// Reject scripts where any line starts with a dangerous pattern.
pub fn validate_code(code: &str) -> Result<(), String> {
    for line in code.lines().map(str::trim) {
        let stripped = COMMAND_PREFIXES
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
            .unwrap_or(line);
        for (pattern, hint) in DANGEROUS_PATTERNS {
            if stripped.starts_with(pattern) {
                return Err(format!("Blocked dangerous command pattern '{}'. {}", pattern, hint));
            }
        }
    }
    Ok(())
}

/// Decode process output, replacing mostly-binary output with a notice.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable > bytes.len() / 10 {
        return format!(
            "[Binary output - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

/// Environment variable name for shared variable `key`.
pub fn env_name(key: &str) -> String {
    let body: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", VAR_PREFIX, body)
}

/// Runs code as a POSIX shell script.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// Runner in `config.code_dir` with the configured timeout.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.code_dir.clone(), config.code_timeout())
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CodeRunner for ShellRunner {
    async fn run(&self, code: &str, shared: &Map<String, Value>) -> anyhow::Result<CodeOutput> {
        validate_code(code).map_err(|e| anyhow::anyhow!(e))?;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(code)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in shared {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            command.env(env_name(key), rendered);
        }

        tracing::debug!(shell = %self.shell, bytes = code.len(), "Running code action");
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "Code action timed out after {} seconds",
                self.timeout.as_secs()
            ),
        };

        Ok(CodeOutput {
            exit_code: output.status.code(),
            stdout: sanitize_output(&output.stdout),
            stderr: sanitize_output(&output.stderr),
        })
    }
}
