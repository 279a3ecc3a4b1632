/// Worker jail: quota, sandbox template and registry of live workers
///
/// A `Jail` is single-writer. Every registry mutation takes `&mut self`, so a jail
/// shared between threads must be wrapped in a `Mutex` by its owner.
use crate::backend::{self, WorkerBackend};
use crate::sandbox::SandboxTemplate;
use crate::types::{BackendKind, JailConfig, JailError, Result, SeccompMode, WorkerExit};
use crate::worker::{Worker, WorkerContext, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Jail {
    max_worker_count: usize,
    backend: Box<dyn WorkerBackend>,
    sandbox: Option<SandboxTemplate>,
    workers: HashMap<WorkerId, Worker>,
    next_id: u64,
}

impl Jail {
    /// Create a jail using the backend named in the configuration
    pub fn from_config(config: &JailConfig) -> Result<Self> {
        Self::new(backend::backend_for(config.backend), config)
    }

    /// Create a jail around an explicit backend
    ///
    /// `config.backend` is ignored; the backend passed in wins.
    pub fn new(backend: Box<dyn WorkerBackend>, config: &JailConfig) -> Result<Self> {
        config.validate()?;

        let sandbox = if backend.supports_sandbox() {
            Some(SandboxTemplate::new(
                config.seccomp,
                config.seccomp_policy.as_deref(),
            )?)
        } else if config.seccomp != SeccompMode::None {
            return Err(JailError::Config(format!(
                "{} workers do not support seccomp mode {}",
                backend.kind(),
                config.seccomp
            )));
        } else {
            None
        };

        log::info!(
            "Created {} jail with max {} workers",
            backend.kind(),
            config.max_worker_count
        );

        Ok(Self {
            max_worker_count: config.max_worker_count,
            backend,
            sandbox,
            workers: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn max_worker_count(&self) -> usize {
        self.max_worker_count
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox.is_some()
    }

    pub fn sandbox(&self) -> Option<&SandboxTemplate> {
        self.sandbox.as_ref()
    }

    /// Spawn a worker running `entry` with a private copy of `payload`
    ///
    /// Fails with `QuotaExceeded` when the jail is full; the registry is left
    /// untouched and the caller may retry after destroying a worker.
    pub fn create_worker<F>(&mut self, entry: F, payload: &[u8]) -> Result<WorkerId>
    where
        F: FnOnce(WorkerContext) -> i32 + Send + 'static,
    {
        if self.workers.len() >= self.max_worker_count {
            log::warn!("too many workers ({} max)", self.max_worker_count);
            return Err(JailError::QuotaExceeded {
                max: self.max_worker_count,
            });
        }

        let id = WorkerId(self.next_id);
        let payload: Arc<[u8]> = Arc::from(payload);

        let unit = self.backend.spawn(
            &id.to_string(),
            self.sandbox.as_ref(),
            Box::new(entry),
            Arc::clone(&payload),
        )?;

        self.next_id += 1;
        let worker = Worker::new(id, unit, payload);
        log::info!("Created {} ({:?})", id, worker.identity());
        self.workers.insert(id, worker);

        Ok(id)
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    pub fn worker_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(&id)
    }

    /// Ids of all registered workers, in no particular order
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    /// Kill a registered worker. Panics if `id` is not registered here.
    pub fn kill(&self, id: WorkerId) {
        self.registered(id).kill();
    }

    /// Reap a registered worker. Panics if `id` is not registered here.
    pub fn reap(&mut self, id: WorkerId, wait: bool) -> Result<WorkerExit> {
        self.registered_mut(id).reap(wait)
    }

    /// Poll every unreclaimed worker once without blocking
    ///
    /// Returns the workers reclaimed by this call. Thread workers are skipped,
    /// since reaping them always blocks.
    pub fn reap_finished(&mut self) -> Vec<(WorkerId, WorkerExit)> {
        let mut reaped = Vec::new();
        for worker in self.workers.values_mut() {
            if worker.is_reclaimed() || worker.pid().is_none() {
                continue;
            }
            match worker.reap(false) {
                Ok(exit) => reaped.push((worker.id(), exit)),
                Err(JailError::ReclaimMismatch { .. }) => {}
                Err(e) => log::warn!("Polling {} failed: {}", worker.id(), e),
            }
        }
        reaped
    }

    /// Remove a worker from the registry and release it
    ///
    /// No reaping happens here. Panics if `id` is not registered in this jail.
    pub fn destroy_worker(&mut self, id: WorkerId) {
        let worker = self
            .workers
            .remove(&id)
            .unwrap_or_else(|| panic!("{} is not registered in this jail", id));

        if !worker.is_reclaimed() {
            log::warn!(
                "Destroying {} before it was reaped; its resources are leaked",
                id
            );
        }
        log::debug!("Destroyed {}", id);
    }

    /// Destroy the jail. Panics if any worker is still registered.
    pub fn destroy(mut self) {
        assert!(
            self.workers.is_empty(),
            "jail destroyed with {} live workers",
            self.workers.len()
        );
        self.sandbox = None;
        log::info!("Destroyed {} jail", self.backend.kind());
    }

    fn registered(&self, id: WorkerId) -> &Worker {
        self.workers
            .get(&id)
            .unwrap_or_else(|| panic!("{} is not registered in this jail", id))
    }

    fn registered_mut(&mut self, id: WorkerId) -> &mut Worker {
        self.workers
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{} is not registered in this jail", id))
    }
}

impl Drop for Jail {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            log::error!(
                "Jail dropped with {} live workers; they are leaked",
                self.workers.len()
            );
        }
    }
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail")
            .field("backend", &self.backend.kind())
            .field("max_worker_count", &self.max_worker_count)
            .field("worker_count", &self.workers.len())
            .field("sandboxed", &self.sandbox.is_some())
            .finish()
    }
}
