/// Core types and configuration for the render worker jail
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default quota used when no configuration says otherwise
pub const DEFAULT_MAX_WORKER_COUNT: usize = 8;

/// Execution strategy used to spawn workers
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Each worker is a subprocess forked from the server
    Process,
    /// Each worker is a thread of the server process
    Thread,
    /// Each worker is a forked subprocess running under a seccomp sandbox
    SandboxedProcess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Thread => "thread",
            BackendKind::SandboxedProcess => "sandboxed_process",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "process" => Ok(BackendKind::Process),
            "thread" => Ok(BackendKind::Thread),
            "sandboxed_process" | "sandboxed" | "minijail" => Ok(BackendKind::SandboxedProcess),
            other => Err(JailError::Config(format!("Unknown worker backend: {}", other))),
        }
    }
}

/// Which kind of seccomp policy the jail loads at construction
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SeccompMode {
    /// No syscall filter
    #[default]
    None,
    /// Pre-compiled BPF program: a file of raw `sock_filter` records
    Bpf,
    /// Textual policy file
    Policy,
    /// Textual policy file, with kernel logging of filter failures
    PolicyLog,
}

impl SeccompMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeccompMode::None => "none",
            SeccompMode::Bpf => "bpf",
            SeccompMode::Policy => "policy",
            SeccompMode::PolicyLog => "policy_log",
        }
    }
}

impl fmt::Display for SeccompMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeccompMode {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(SeccompMode::None),
            "bpf" => Ok(SeccompMode::Bpf),
            "policy" | "minijail_policy" => Ok(SeccompMode::Policy),
            "policy_log" | "minijail_policy_log" => Ok(SeccompMode::PolicyLog),
            other => Err(JailError::Config(format!("Unknown seccomp mode: {}", other))),
        }
    }
}

/// Jail configuration, fixed at construction time
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JailConfig {
    /// Maximum number of concurrently registered workers
    pub max_worker_count: usize,
    /// Backend used by `Jail::from_config`
    pub backend: BackendKind,
    /// Seccomp policy kind
    pub seccomp: SeccompMode,
    /// Policy source; required unless `seccomp` is `none`
    pub seccomp_policy: Option<PathBuf>,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            max_worker_count: DEFAULT_MAX_WORKER_COUNT,
            backend: BackendKind::Process,
            seccomp: SeccompMode::None,
            seccomp_policy: None,
        }
    }
}

impl JailConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| {
            JailError::Config(format!("Invalid jail config {}: {}", path.display(), e))
        })
    }

    /// Check the parts of the configuration that do not depend on the backend
    pub fn validate(&self) -> Result<()> {
        if self.max_worker_count == 0 {
            return Err(JailError::Config(
                "max_worker_count must be positive".to_string(),
            ));
        }
        if self.seccomp != SeccompMode::None && self.seccomp_policy.is_none() {
            return Err(JailError::Config(format!(
                "seccomp mode {} requires a policy path",
                self.seccomp
            )));
        }
        Ok(())
    }
}

/// How a reclaimed worker terminated
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum WorkerExit {
    /// Normal exit with the entry routine's exit code, masked to 8 bits
    Exited(i32),
    /// Killed by a signal (raw signal number)
    Signaled(i32),
    /// The entry routine of a thread worker panicked
    Panicked,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            WorkerExit::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Error type for jail and worker operations
#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed seccomp filter {path}: {reason}")]
    MalformedFilter { path: PathBuf, reason: String },

    #[error("Seccomp policy error at line {line}: {message}")]
    Policy { line: usize, message: String },

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Too many workers (max {max})")]
    QuotaExceeded { max: usize },

    #[error("Worker {pid} not reclaimed (observed {observed:?})")]
    ReclaimMismatch { pid: i32, observed: Option<i32> },

    #[error("Wait failed: {0}")]
    Wait(nix::Error),
}

impl JailError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JailError::QuotaExceeded { .. } | JailError::ReclaimMismatch { .. } | JailError::Wait(_)
        )
    }
}

/// Result type alias for jail operations
pub type Result<T> = std::result::Result<T, JailError>;
