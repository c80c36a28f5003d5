//! The feed engine: pushes source bytes into the backend and decides when
//! a session is done.

use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::observer::LoaderObserver;
use super::LoaderShared;
use crate::backend::{run_select, select_backend, BackendRequest, ImageBackend};
use crate::source::{map_source, SourceBuffer, SourceOptions};
use crate::types::{is_background, LoadError, LoadState, LoaderEvent, Priority};

/// What the execution lock guards: the source bytes and the backend.
pub(crate) struct FeedEngine {
    source: Option<SourceBuffer>,
    backend: Option<Box<dyn ImageBackend>>,
}

impl FeedEngine {
    pub(crate) fn new() -> Self {
        Self {
            source: None,
            backend: None,
        }
    }
}

/// Write `len` source bytes starting at `offset` to the backend.
fn feed_chunk(engine: &mut FeedEngine, offset: usize, len: usize) -> Result<(), LoadError> {
    let FeedEngine { source, backend } = engine;
    let (Some(source), Some(backend)) = (source.as_ref(), backend.as_mut()) else {
        return Err(LoadError::Decode("Loader has no backend".to_string()));
    };
    let bytes = source.as_bytes();
    backend.write(&bytes[offset..offset + len], bytes.len())
}

impl LoaderShared {
    /// Claim the session for one start. Fails if it already ran.
    pub(super) fn mark_started(&self, pooled: bool) -> Result<(), LoadError> {
        let mut state = self.state.lock();
        if state.started {
            return Err(LoadError::AlreadyStarted);
        }
        state.started = true;
        state.pooled = pooled;
        state.load_state = LoadState::Feeding;
        Ok(())
    }

    /// Map the file. A failure leaves the session in the error state without
    /// emitting anything.
    pub(super) fn setup_source(&self) -> Result<(), LoadError> {
        let options = {
            let state = self.state.lock();
            SourceOptions {
                use_exif_preview: self.use_exif_preview,
                requested_width: state.requested_width,
                requested_height: state.requested_height,
            }
        };

        match map_source(&self.file, options) {
            Ok(source) => {
                let total = source.len();
                self.engine.lock().source = Some(source);
                let mut state = self.state.lock();
                state.bytes_total = total;
                state.bytes_read = 0;
                Ok(())
            }
            Err(e) => {
                warn!(path = ?self.file.path(), error = %e, "Failed to map image source");
                let mut state = self.state.lock();
                state.record_error(e.clone());
                state.load_state = LoadState::Error;
                Err(e)
            }
        }
    }

    /// Pick and bind the backend for the mapped bytes.
    fn setup_backend(self: &Arc<Self>, engine: &mut FeedEngine) -> Result<(), LoadError> {
        let Some(source) = engine.source.as_ref() else {
            return Err(LoadError::Source("No source mapped".to_string()));
        };

        let external_accepted = self
            .external
            .as_ref()
            .is_some_and(|config| run_select(config, self.file.path()));
        let kind = select_backend(source.as_bytes(), &self.file, external_accepted);

        let request = BackendRequest {
            kind,
            file: &self.file,
            external: self.external.as_ref(),
        };
        let mut backend = self
            .registry
            .create(&request)
            .ok_or(LoadError::UnknownFormat)?;

        backend.init(Arc::new(LoaderObserver::new(Arc::downgrade(self))));
        backend.set_page_num(self.file.page_num);

        {
            let mut state = self.state.lock();
            state.format_name = Some(backend.format_name().to_string());
            state.format_tag = backend.format_tag();
        }
        engine.backend = Some(backend);
        Ok(())
    }

    /// Copy format details from the backend; guessing backends only know
    /// them after some data.
    fn sync_format(&self, engine: &FeedEngine) {
        if let Some(backend) = engine.backend.as_ref() {
            let name = backend.format_name().to_string();
            let tag = backend.format_tag();
            let pages = backend.page_total();
            let mut state = self.state.lock();
            state.format_name = Some(name);
            state.format_tag = tag;
            state.page_total = pages;
        }
    }

    /// Take the backend's pixel buffer if the session has none yet.
    fn sync_pixbuf(&self, engine: &FeedEngine) {
        let pixbuf = engine.backend.as_ref().and_then(|b| b.pixbuf());
        if let Some(pixbuf) = pixbuf {
            self.adopt_pixbuf(&mut self.state.lock(), &pixbuf);
        }
    }

    /// Close the backend and drop it, keeping its pixel buffer.
    ///
    /// Returns the close error, if any.
    fn release_backend(&self, engine: &mut FeedEngine) -> Option<LoadError> {
        let mut backend = engine.backend.take()?;
        let closed = backend.close();

        let name = backend.format_name().to_string();
        let tag = backend.format_tag();
        if let Some(pixbuf) = backend.pixbuf() {
            self.adopt_pixbuf(&mut self.state.lock(), &pixbuf);
        }
        {
            let mut state = self.state.lock();
            state.format_name = Some(name);
            state.format_tag = tag;
        }
        drop(backend);

        match closed {
            Ok(()) => None,
            Err(e) => {
                debug!(error = %e, "Loader close failed");
                Some(e)
            }
        }
    }

    /// Move the session into its terminal state and emit done or error.
    ///
    /// Does nothing if the session is already terminal. Returns whether the
    /// session succeeded.
    fn finish(self: &Arc<Self>, engine: &mut FeedEngine, outcome: Result<(), LoadError>) -> bool {
        if let Err(e) = &outcome {
            if let Some(backend) = engine.backend.as_mut() {
                backend.abort();
            }
            trace!(error = %e, "Feeding failed");
        }
        let close_error = self.release_backend(engine);

        let (done, priority) = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return state.load_state == LoadState::Done;
            }

            let failure = match outcome {
                Err(e) => Some(e),
                Ok(()) => close_error.or_else(|| {
                    if state.pixbuf.is_none() {
                        Some(LoadError::NoPixbuf)
                    } else {
                        None
                    }
                }),
            };

            let done = match failure {
                Some(e) => {
                    state.record_error(e);
                    state.load_state = LoadState::Error;
                    false
                }
                None => {
                    state.load_state = LoadState::Done;
                    true
                }
            };
            (done, state.priority)
        };

        let event = if done {
            LoaderEvent::Done
        } else {
            LoaderEvent::Error
        };
        self.queue_event(priority, move |_| Some(event));
        done
    }

    /// Feed until the backend has a pixel buffer or the data runs out.
    ///
    /// Returns `false` if the session failed; the error has been emitted.
    pub(super) fn begin(self: &Arc<Self>, engine: &mut FeedEngine) -> bool {
        let (total, buffer_size) = {
            let state = self.state.lock();
            (state.bytes_total, state.read_buffer_size)
        };
        if total == 0 {
            let error = LoadError::Source(format!("{}: file is empty", self.file.path().display()));
            return self.finish(engine, Err(error));
        }

        if let Err(e) = self.setup_backend(engine) {
            return self.finish(engine, Err(e));
        }

        let mut chunk = buffer_size.min(total);
        if let Err(e) = feed_chunk(engine, 0, chunk) {
            return self.finish(engine, Err(e));
        }
        let mut read = chunk;
        self.sync_format(engine);
        self.state.lock().bytes_read = read;

        loop {
            let has_pixbuf = engine
                .backend
                .as_ref()
                .is_some_and(|backend| backend.pixbuf().is_some());
            if has_pixbuf || chunk == 0 || self.state.lock().stopping {
                break;
            }
            if read > total {
                return self.finish(engine, Err(LoadError::Overrun { read, total }));
            }

            chunk = buffer_size.min(total - read);
            if chunk == 0 {
                break;
            }
            if let Err(e) = feed_chunk(engine, read, chunk) {
                return self.finish(engine, Err(e));
            }
            read += chunk;
            self.state.lock().bytes_read = read;
        }

        self.sync_pixbuf(engine);
        self.sync_format(engine);

        if read == total || chunk == 0 {
            return self.finish(engine, Ok(()));
        }
        if self.state.lock().pixbuf.is_none() {
            return self.finish(engine, Err(LoadError::NoPixbuf));
        }
        true
    }

    /// Feed up to the loop count of chunks.
    ///
    /// `Break` once the session is terminal or stopping.
    pub(super) fn step(self: &Arc<Self>, engine: &mut FeedEngine) -> ControlFlow<()> {
        let (mut count, buffer_size) = {
            let state = self.state.lock();
            if state.is_terminal() {
                return ControlFlow::Break(());
            }
            (state.read_loop_count.max(1), state.read_buffer_size)
        };

        while count > 0 {
            let (read, total) = {
                let state = self.state.lock();
                if state.stopping {
                    return ControlFlow::Break(());
                }
                (state.bytes_read, state.bytes_total)
            };

            if read == total {
                self.finish(engine, Ok(()));
                return ControlFlow::Break(());
            }
            if read > total {
                self.finish(engine, Err(LoadError::Overrun { read, total }));
                return ControlFlow::Break(());
            }

            let chunk = buffer_size.min(total - read);
            if let Err(e) = feed_chunk(engine, read, chunk) {
                self.finish(engine, Err(e));
                return ControlFlow::Break(());
            }
            self.state.lock().bytes_read = read + chunk;
            count -= 1;
        }

        let total = self.state.lock().bytes_total;
        if total > 0 {
            self.queue_event(Priority::HIGH, |state| {
                Some(LoaderEvent::Percent(state.percent()))
            });
        }
        ControlFlow::Continue(())
    }

    /// One dispatch of the cooperative task.
    pub(super) fn run_idle_step(self: &Arc<Self>) -> ControlFlow<()> {
        let flow = {
            let mut engine = self.engine.lock();
            self.step(&mut engine)
        };
        if flow.is_break() {
            self.state.lock().idle_source = None;
        }
        flow
    }

    /// Body of the pool task for a pooled session.
    pub(super) fn run_pooled(self: Arc<Self>) {
        let background = is_background(self.state.lock().priority);
        if background {
            self.gate.wait_high();
        } else {
            self.gate.enter_high();
        }

        {
            let mut engine = self.engine.lock();
            let mut running = self.begin(&mut engine);
            while running {
                {
                    let state = self.state.lock();
                    if state.stopping || state.is_terminal() {
                        break;
                    }
                }
                if background {
                    self.gate.wait_high();
                }
                running = self.step(&mut engine).is_continue();
            }

            // Stopped early: the backend is released without an event
            if let Some(e) = self.release_backend(&mut engine) {
                trace!(error = %e, "Ignoring close error of stopped loader");
            }
        }

        if !background {
            self.gate.leave_high();
        }

        let mut state = self.state.lock();
        state.can_destroy = true;
        self.can_destroy_cond.notify_all();
    }

    /// Release everything the feeding side held. Called by teardown once no
    /// worker touches the session.
    pub(super) fn release_for_teardown(&self) {
        let mut engine = self.engine.lock();
        if let Some(backend) = engine.backend.as_mut() {
            backend.abort();
        }
        if let Some(e) = self.release_backend(&mut engine) {
            trace!(error = %e, "Ignoring close error at teardown");
        }
        engine.source = None;
    }
}
