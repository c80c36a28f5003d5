//! Worker threads for pooled loading and the priority gate between them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use glib::MainContext;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::backend::BackendRegistry;
use crate::config::LoaderConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// An unbounded pool: every queued job runs without waiting for another
/// job to finish. Idle threads are reused, otherwise a new one is spawned.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    idle: Arc<AtomicUsize>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            idle: Arc::new(AtomicUsize::new(0)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Queue `job`. Returns `false` once the pool has shut down.
    pub fn push<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        let claimed = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !claimed && !self.spawn_worker() {
            return false;
        }

        sender.send(Box::new(job)).is_ok()
    }

    fn spawn_worker(&self) -> bool {
        let mut threads = self.threads.lock();
        let receiver = self.receiver.clone();
        let idle = Arc::clone(&self.idle);
        let name = format!("image-loader-{}", threads.len());

        let spawned = thread::Builder::new().name(name).spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
                idle.fetch_add(1, Ordering::AcqRel);
            }
            trace!("Worker thread exiting");
        });

        match spawned {
            Ok(handle) => {
                threads.push(handle);
                debug!(threads = threads.len(), "Image loader thread pool grown");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn image loader thread");
                false
            }
        }
    }

    /// Number of threads spawned so far.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Stop accepting jobs, let queued jobs finish and join every thread.
    ///
    /// Must not be called from a pool thread.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("Image loader thread panicked");
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counts active high priority loaders; background loaders wait for zero.
#[derive(Debug, Default)]
pub struct PriorityGate {
    active: Mutex<usize>,
    cleared: Condvar,
}

impl PriorityGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_high(&self) {
        *self.active.lock() += 1;
    }

    pub fn leave_high(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.cleared.notify_all();
        }
    }

    /// Block while any high priority loader is active.
    pub fn wait_high(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.cleared.wait(&mut active);
        }
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }
}

/// Everything loaders need to run: the consumer context, the worker pool,
/// the priority gate and the available backends.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) context: MainContext,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) gate: Arc<PriorityGate>,
    pub(crate) registry: Arc<BackendRegistry>,
    pub(crate) config: LoaderConfig,
}

impl Scheduler {
    pub fn new(context: MainContext, config: LoaderConfig) -> Self {
        Self::with_registry(context, config, BackendRegistry::with_builtins())
    }

    pub fn with_registry(
        context: MainContext,
        config: LoaderConfig,
        registry: BackendRegistry,
    ) -> Self {
        Self {
            context,
            pool: Arc::new(WorkerPool::new()),
            gate: Arc::new(PriorityGate::new()),
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn context(&self) -> &MainContext {
        &self.context
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn gate(&self) -> &PriorityGate {
        &self.gate
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool", &self.pool)
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish()
    }
}
