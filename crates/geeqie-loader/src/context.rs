//! Consumer-side dispatch on a GLib main context.
//!
//! Any thread may attach sources; only the thread iterating the
//! [`MainContext`] runs them. Loader notifications are delivered through
//! here so consumers always see them on their own thread.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use glib::{MainContext, Priority, Source};
use parking_lot::Mutex;

/// Idle sources attached on behalf of one object, destroyed together.
#[derive(Default)]
pub struct SourceGroup {
    sources: Mutex<Vec<Source>>,
}

impl SourceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a recurring callback at `priority`. It runs on every
    /// iteration of `context` until it returns `Break`.
    pub fn add<F>(&self, context: &MainContext, priority: Priority, mut callback: F) -> Source
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let source = glib::source::idle_source_new(None, priority, move || match callback() {
            ControlFlow::Continue(()) => glib::ControlFlow::Continue,
            ControlFlow::Break(()) => glib::ControlFlow::Break,
        });
        source.attach(Some(context));

        let mut sources = self.sources.lock();
        sources.retain(|s| !s.is_destroyed());
        sources.push(source.clone());
        source
    }

    /// Attach a callback that runs once at `priority`.
    pub fn add_once<F>(&self, context: &MainContext, priority: Priority, callback: F) -> Source
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callback = Some(callback);
        self.add(context, priority, move || {
            if let Some(callback) = callback.take() {
                callback();
            }
            ControlFlow::Break(())
        })
    }

    /// Number of sources that have not run to completion or been destroyed.
    pub fn len(&self) -> usize {
        let mut sources = self.sources.lock();
        sources.retain(|s| !s.is_destroyed());
        sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every live source. Returns how many there were.
    ///
    /// A source destroyed while it runs finishes that dispatch and is not
    /// run again.
    pub fn destroy_all(&self) -> usize {
        let sources = std::mem::take(&mut *self.sources.lock());
        sources
            .into_iter()
            .filter(|s| !s.is_destroyed())
            .inspect(|s| s.destroy())
            .count()
    }
}

impl std::fmt::Debug for SourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceGroup")
            .field("live", &self.len())
            .finish()
    }
}

/// Iterate `context` until `done` holds or `timeout` passes.
///
/// Returns the final value of `done`.
pub fn run_until<P>(context: &MainContext, mut done: P, timeout: Duration) -> bool
where
    P: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    // Wakes a blocking iteration once the deadline is reached
    let timer = glib::source::timeout_source_new(timeout, None, Priority::HIGH, || {
        glib::ControlFlow::Break
    });
    timer.attach(Some(context));

    while !done() && Instant::now() < deadline {
        context.iteration(true);
    }
    timer.destroy();
    done()
}

/// Iterate `context` without blocking until nothing is ready.
///
/// Returns how many iterations dispatched a source.
pub fn run_pending(context: &MainContext) -> usize {
    let mut count = 0;
    while context.iteration(false) {
        count += 1;
    }
    count
}
