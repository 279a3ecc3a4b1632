//! render-jail: worker isolation for a render server
//! Spawns workers as subprocesses, threads or seccomp-sandboxed subprocesses under a quota

pub mod backend;
pub mod jail;
pub mod policy;
pub mod sandbox;
pub mod seccomp;
pub mod types;
pub mod worker;

pub use backend::{ProcessBackend, SandboxedProcessBackend, ThreadBackend, WorkerBackend};
pub use jail::Jail;
pub use types::{BackendKind, JailConfig, JailError, Result, SeccompMode, WorkerExit};
pub use worker::{Worker, WorkerContext, WorkerId, WorkerIdentity};
