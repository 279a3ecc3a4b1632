/// Worker records: identity, termination and reclamation of one spawned unit
use crate::types::{JailError, Result, WorkerExit};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Registry key of a worker inside its jail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl WorkerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// OS-level identity of a spawned unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerIdentity {
    /// Process id as returned by fork: the child's pid in the parent, 0 in the child
    Process(Pid),
    Thread(ThreadId),
}

impl WorkerIdentity {
    /// True when called from outside the unit this identity names
    pub fn is_externally_observed(&self) -> bool {
        match self {
            WorkerIdentity::Process(pid) => pid.as_raw() > 0,
            WorkerIdentity::Thread(id) => *id != thread::current().id(),
        }
    }
}

/// Cooperative cancellation flag shared between a worker and its record
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an entry routine receives inside the new unit
#[derive(Debug)]
pub struct WorkerContext {
    identity: WorkerIdentity,
    payload: Arc<[u8]>,
    cancel: CancelToken,
}

impl WorkerContext {
    pub(crate) fn new(identity: WorkerIdentity, payload: Arc<[u8]>, cancel: CancelToken) -> Self {
        Self {
            identity,
            payload,
            cancel,
        }
    }

    /// Private copy of the initialization blob
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The unit's identity as seen from inside the unit
    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    /// Always false when called from the worker's own execution context
    pub fn is_externally_observed(&self) -> bool {
        self.identity.is_externally_observed()
    }

    /// Set once the parent has asked a thread worker to stop.
    /// Process workers are killed instead and never see this flag.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Entry routine run exactly once in the new unit
///
/// Only the low 8 bits of the returned code are reported, on every backend.
pub type EntryRoutine = Box<dyn FnOnce(WorkerContext) -> i32 + Send + 'static>;

/// Backend-specific handle to a running unit
#[derive(Debug)]
pub enum UnitHandle {
    Process {
        pid: Pid,
    },
    Thread {
        id: ThreadId,
        handle: Option<JoinHandle<i32>>,
        cancel: CancelToken,
    },
}

impl UnitHandle {
    fn identity(&self) -> WorkerIdentity {
        match self {
            UnitHandle::Process { pid } => WorkerIdentity::Process(*pid),
            UnitHandle::Thread { id, .. } => WorkerIdentity::Thread(*id),
        }
    }
}

/// One spawned execution unit, owned by a jail
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    unit: UnitHandle,
    payload: Arc<[u8]>,
    exit: Option<WorkerExit>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, unit: UnitHandle, payload: Arc<[u8]>) -> Self {
        Self {
            id,
            unit,
            payload,
            exit: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn identity(&self) -> WorkerIdentity {
        self.unit.identity()
    }

    /// Process id for process-backed workers
    pub fn pid(&self) -> Option<Pid> {
        match self.unit {
            UnitHandle::Process { pid } => Some(pid),
            UnitHandle::Thread { .. } => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_reclaimed(&self) -> bool {
        self.exit.is_some()
    }

    /// Exit status, once reclaimed
    pub fn exit(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// False when called from within the worker's own execution context
    pub fn is_externally_observed(&self) -> bool {
        self.identity().is_externally_observed()
    }

    /// Request termination
    ///
    /// Process workers get SIGKILL. Thread workers cannot be forced to stop: their
    /// cancellation token is set and the entry routine is trusted to return in
    /// finite time. Either way a later `reap` is needed to reclaim the unit.
    /// Once reclaimed the pid may belong to another process, so nothing is sent.
    pub fn kill(&self) {
        assert!(
            self.is_externally_observed(),
            "{} cannot kill itself",
            self.id
        );
        if self.exit.is_some() {
            log::debug!("{} already reclaimed, not signalling", self.id);
            return;
        }

        match &self.unit {
            UnitHandle::Process { pid } => {
                if let Err(e) = signal::kill(*pid, Signal::SIGKILL) {
                    log::warn!("Failed to kill {} (pid {}): {}", self.id, pid, e);
                } else {
                    log::debug!("Sent SIGKILL to {} (pid {})", self.id, pid);
                }
            }
            UnitHandle::Thread { cancel, .. } => {
                log::debug!("Requested cooperative cancellation of {}", self.id);
                cancel.cancel();
            }
        }
    }

    /// Reclaim the unit's exit status
    ///
    /// Idempotent once reclaimed. With `wait` false a process worker is polled
    /// once; thread workers are always joined, which blocks. Failures leave the
    /// worker unreclaimed and may be retried.
    pub fn reap(&mut self, wait: bool) -> Result<WorkerExit> {
        assert!(
            self.is_externally_observed(),
            "{} cannot reap itself",
            self.id
        );

        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let exit = match &mut self.unit {
            UnitHandle::Process { pid } => reap_process(*pid, wait)?,
            UnitHandle::Thread { handle, .. } => {
                let handle = handle.take().ok_or_else(|| {
                    JailError::SpawnFailed(format!("{} has no thread handle", self.id))
                })?;
                match handle.join() {
                    Ok(code) => WorkerExit::Exited(code),
                    Err(_) => {
                        log::warn!("{} panicked", self.id);
                        WorkerExit::Panicked
                    }
                }
            }
        };

        log::debug!("Reclaimed {}: {:?}", self.id, exit);
        self.exit = Some(exit);
        Ok(exit)
    }
}

fn reap_process(pid: Pid, wait: bool) -> Result<WorkerExit> {
    let flags = if wait { None } else { Some(WaitPidFlag::WNOHANG) };

    let status = waitpid(pid, flags).map_err(JailError::Wait)?;
    let mismatch = |observed: Option<Pid>| JailError::ReclaimMismatch {
        pid: pid.as_raw(),
        observed: observed.map(|p| p.as_raw()),
    };

    match status {
        WaitStatus::Exited(reaped, code) if reaped == pid => Ok(WorkerExit::Exited(code)),
        WaitStatus::Signaled(reaped, sig, _) if reaped == pid => {
            Ok(WorkerExit::Signaled(sig as i32))
        }
        other => Err(mismatch(other.pid())),
    }
}
