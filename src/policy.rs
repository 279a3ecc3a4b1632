/// Textual seccomp policies
///
/// Parses a minijail-style policy file and generates a filter program from it.
///
/// ```text
/// # comment
/// read: 1
/// write: allow
/// openat: return 13
/// ptrace: kill
/// ```
///
/// Syscalls without a rule kill the process.
use crate::seccomp::FilterProgram;
use crate::types::{JailError, Result};
use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// What the filter does when a listed syscall is made
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Errno(u16),
    Kill,
    Trap,
    Log,
}

impl PolicyAction {
    fn scmp_action(&self) -> ScmpAction {
        match self {
            PolicyAction::Allow => ScmpAction::Allow,
            PolicyAction::Errno(errno) => ScmpAction::Errno(*errno as i32),
            PolicyAction::Kill => ScmpAction::KillProcess,
            PolicyAction::Trap => ScmpAction::Trap,
            PolicyAction::Log => ScmpAction::Log,
        }
    }
}

/// One parsed policy line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRule {
    pub syscall: String,
    pub action: PolicyAction,
    pub line: usize,
}

/// A parsed textual policy
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeccompPolicy {
    rules: Vec<PolicyRule>,
}

impl SeccompPolicy {
    /// Read and parse a policy file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let policy = Self::parse(&text)?;
        log::debug!(
            "Parsed seccomp policy {} ({} rules)",
            path.display(),
            policy.rules.len()
        );
        Ok(policy)
    }

    /// Parse policy text
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        let mut seen = HashSet::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }

            let (name, action) = content.split_once(':').ok_or_else(|| JailError::Policy {
                line,
                message: format!("expected `syscall: action`, got `{}`", content),
            })?;
            let name = name.trim();
            let action = parse_action(action.trim(), line)?;

            // Names resolve against the native architecture
            ScmpSyscall::from_name(name).map_err(|_| JailError::Policy {
                line,
                message: format!("unknown syscall `{}`", name),
            })?;
            if !seen.insert(name) {
                return Err(JailError::Policy {
                    line,
                    message: format!("duplicate rule for `{}`", name),
                });
            }

            rules.push(PolicyRule {
                syscall: name.to_string(),
                action,
                line,
            });
        }

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Look up the action for a syscall name, if the policy lists it
    pub fn action_for(&self, syscall: &str) -> Option<PolicyAction> {
        self.rules
            .iter()
            .find(|rule| rule.syscall == syscall)
            .map(|rule| rule.action)
    }

    /// Generate the filter program with libseccomp
    ///
    /// Unlisted syscalls kill the process. The exported program carries
    /// libseccomp's own architecture check.
    pub fn compile(&self) -> Result<FilterProgram> {
        let mut ctx = ScmpFilterContext::new_filter(ScmpAction::KillProcess)
            .map_err(|e| JailError::Config(format!("Failed to create seccomp context: {}", e)))?;

        for rule in &self.rules {
            // libseccomp refuses rules that repeat the default action
            if rule.action == PolicyAction::Kill {
                log::debug!("Rule for `{}` matches the default action", rule.syscall);
                continue;
            }
            let syscall = ScmpSyscall::from_name(&rule.syscall).map_err(|_| JailError::Policy {
                line: rule.line,
                message: format!("unknown syscall `{}`", rule.syscall),
            })?;
            ctx.add_rule(rule.action.scmp_action(), syscall)
                .map_err(|e| JailError::Policy {
                    line: rule.line,
                    message: format!("failed to add rule for `{}`: {}", rule.syscall, e),
                })?;
        }

        let mut exported = tempfile::tempfile()?;
        ctx.export_bpf(&mut exported)
            .map_err(|e| JailError::Config(format!("Failed to export seccomp filter: {}", e)))?;
        exported.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        exported.read_to_end(&mut data)?;

        FilterProgram::from_bytes(&data)
    }
}

fn parse_action(action: &str, line: usize) -> Result<PolicyAction> {
    if action.contains("arg") {
        return Err(JailError::Policy {
            line,
            message: "argument filters are not supported".to_string(),
        });
    }

    match action {
        "1" | "allow" => Ok(PolicyAction::Allow),
        "kill" => Ok(PolicyAction::Kill),
        "trap" => Ok(PolicyAction::Trap),
        "log" => Ok(PolicyAction::Log),
        other => {
            if let Some(errno) = other.strip_prefix("return") {
                let errno = errno.trim().parse::<u16>().map_err(|_| JailError::Policy {
                    line,
                    message: format!("invalid errno in `{}`", other),
                })?;
                Ok(PolicyAction::Errno(errno))
            } else {
                Err(JailError::Policy {
                    line,
                    message: format!("unknown action `{}`", other),
                })
            }
        }
    }
}
