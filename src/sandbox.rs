/// Sandbox templates and per-worker sandbox contexts
///
/// The template is built once when the jail is created and never changes. Each
/// sandboxed spawn derives a fresh `SandboxContext` from it; the child enters that
/// context right after fork, before the entry routine runs.
use crate::policy::SeccompPolicy;
use crate::seccomp::{self, FilterProgram};
use crate::types::{JailError, Result, SeccompMode};
use std::path::Path;
use std::sync::Arc;

/// Immutable, shareable sandbox configuration
#[derive(Clone, Debug)]
pub struct SandboxTemplate {
    mode: SeccompMode,
    no_new_privs: bool,
    log_failures: bool,
    filter: Option<Arc<FilterProgram>>,
}

impl SandboxTemplate {
    /// Build a template for the given seccomp mode
    ///
    /// `policy` is only read here; nothing keeps a reference to the path.
    pub fn new(mode: SeccompMode, policy: Option<&Path>) -> Result<Self> {
        let filter = match mode {
            SeccompMode::None => None,
            SeccompMode::Bpf => Some(FilterProgram::load(require_path(mode, policy)?)?),
            SeccompMode::Policy | SeccompMode::PolicyLog => {
                let path = require_path(mode, policy)?;
                Some(SeccompPolicy::from_file(path)?.compile()?)
            }
        };

        if let Some(ref program) = filter {
            log::info!(
                "Sandbox template ready: seccomp {} with {} instructions",
                mode,
                program.len()
            );
        } else {
            log::info!("Sandbox template ready: no seccomp filter");
        }

        Ok(Self {
            mode,
            no_new_privs: true,
            log_failures: mode == SeccompMode::PolicyLog,
            filter: filter.map(Arc::new),
        })
    }

    pub fn mode(&self) -> SeccompMode {
        self.mode
    }

    pub fn filter(&self) -> Option<&FilterProgram> {
        self.filter.as_deref()
    }

    pub fn logs_failures(&self) -> bool {
        self.log_failures
    }

    /// Derive a fresh context for one spawn. The template is not modified.
    pub fn derive(&self) -> Result<SandboxContext> {
        if let Some(ref filter) = self.filter {
            if u16::try_from(filter.len()).is_err() {
                return Err(JailError::SpawnFailed(format!(
                    "seccomp filter too long to install ({} instructions)",
                    filter.len()
                )));
            }
        }

        Ok(SandboxContext {
            no_new_privs: self.no_new_privs,
            log_failures: self.log_failures,
            filter: self.filter.clone(),
        })
    }
}

fn require_path(mode: SeccompMode, policy: Option<&Path>) -> Result<&Path> {
    policy.ok_or_else(|| {
        JailError::Config(format!("seccomp mode {} requires a policy path", mode))
    })
}

/// Sandbox state for a single worker, consumed by the child after fork
#[derive(Debug)]
pub struct SandboxContext {
    no_new_privs: bool,
    log_failures: bool,
    filter: Option<Arc<FilterProgram>>,
}

impl SandboxContext {
    /// Apply the context to the calling process
    ///
    /// Runs in the forked child: no allocation, no logging, raw syscalls only.
    pub fn enter(&self) -> std::io::Result<()> {
        if self.no_new_privs {
            seccomp::set_no_new_privs()?;
        }
        if let Some(ref filter) = self.filter {
            filter.install(self.log_failures)?;
        }
        Ok(())
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }
}
