/// Worker backends: how a new execution unit is started
///
/// Exactly one backend is active per jail. It is chosen at configuration time and
/// handed to the jail as a strategy object.
use crate::sandbox::{SandboxContext, SandboxTemplate};
use crate::types::{BackendKind, JailError, Result};
use crate::worker::{CancelToken, EntryRoutine, UnitHandle, WorkerContext, WorkerIdentity};
use nix::unistd::{fork, ForkResult, Pid};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Exit code of a forked worker whose entry routine panicked
pub const PANIC_EXIT_CODE: i32 = 101;

/// Exit code of a forked worker that could not enter its sandbox
pub const SANDBOX_SETUP_FAILURE_EXIT_CODE: i32 = 126;

/// Keep the low byte of an exit code, as `waitpid` reports it for processes
pub fn exit_status_byte(code: i32) -> i32 {
    code & 0xff
}

/// Strategy for spawning workers
pub trait WorkerBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Whether the jail may attach a sandbox template to this backend
    fn supports_sandbox(&self) -> bool {
        false
    }

    /// Start a unit running `entry` with `payload`
    ///
    /// `sandbox` is the jail's template, present only when `supports_sandbox` is true.
    fn spawn(
        &self,
        name: &str,
        sandbox: Option<&SandboxTemplate>,
        entry: EntryRoutine,
        payload: Arc<[u8]>,
    ) -> Result<UnitHandle>;
}

/// Build the backend for a configured kind
pub fn backend_for(kind: BackendKind) -> Box<dyn WorkerBackend> {
    match kind {
        BackendKind::Process => Box::new(ProcessBackend),
        BackendKind::Thread => Box::new(ThreadBackend),
        BackendKind::SandboxedProcess => Box::new(SandboxedProcessBackend),
    }
}

/// Workers are subprocesses forked from the caller
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBackend;

impl WorkerBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn spawn(
        &self,
        name: &str,
        _sandbox: Option<&SandboxTemplate>,
        entry: EntryRoutine,
        payload: Arc<[u8]>,
    ) -> Result<UnitHandle> {
        let pid = fork_worker(name, None, entry, payload)?;
        Ok(UnitHandle::Process { pid })
    }
}

/// Workers are threads of the caller's process
///
/// There is no forced termination for this backend. `kill` only raises the
/// cooperative cancellation flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadBackend;

impl WorkerBackend for ThreadBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Thread
    }

    fn spawn(
        &self,
        name: &str,
        _sandbox: Option<&SandboxTemplate>,
        entry: EntryRoutine,
        payload: Arc<[u8]>,
    ) -> Result<UnitHandle> {
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let identity = WorkerIdentity::Thread(thread::current().id());
                let code = entry(WorkerContext::new(identity, payload, worker_cancel));
                exit_status_byte(code)
            })
            .map_err(|e| JailError::SpawnFailed(format!("thread creation failed: {}", e)))?;

        Ok(UnitHandle::Thread {
            id: handle.thread().id(),
            handle: Some(handle),
            cancel,
        })
    }
}

/// Workers are forked subprocesses that enter a seccomp sandbox before running
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxedProcessBackend;

impl WorkerBackend for SandboxedProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SandboxedProcess
    }

    fn supports_sandbox(&self) -> bool {
        true
    }

    fn spawn(
        &self,
        name: &str,
        sandbox: Option<&SandboxTemplate>,
        entry: EntryRoutine,
        payload: Arc<[u8]>,
    ) -> Result<UnitHandle> {
        let template = sandbox.ok_or_else(|| {
            JailError::SpawnFailed("sandboxed backend used without a sandbox template".to_string())
        })?;
        let context = template.derive()?;
        let pid = fork_worker(name, Some(&context), entry, payload)?;
        Ok(UnitHandle::Process { pid })
    }
}

/// Fork a child that runs `entry` and exits with its return value
///
/// The child never returns from this function. Everything it needs is prepared
/// before the fork; after it, the child only enters the sandbox, runs the entry
/// routine and calls `_exit`.
fn fork_worker(
    name: &str,
    sandbox: Option<&SandboxContext>,
    entry: EntryRoutine,
    payload: Arc<[u8]>,
) -> Result<Pid> {
    let context = WorkerContext::new(
        WorkerIdentity::Process(Pid::from_raw(0)),
        payload,
        CancelToken::new(),
    );

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            log::debug!("Forked {} as pid {}", name, child);
            // The parent's copies of the routine and context are dropped here
            drop(entry);
            drop(context);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            if let Some(sandbox) = sandbox {
                if sandbox.enter().is_err() {
                    unsafe { libc::_exit(SANDBOX_SETUP_FAILURE_EXIT_CODE) };
                }
            }
            let code = panic::catch_unwind(AssertUnwindSafe(move || entry(context)))
                .unwrap_or(PANIC_EXIT_CODE);
            unsafe { libc::_exit(exit_status_byte(code)) }
        }
        Err(e) => Err(JailError::SpawnFailed(format!("fork failed: {}", e))),
    }
}
