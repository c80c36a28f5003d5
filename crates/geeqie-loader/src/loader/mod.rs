//! Loader sessions.
//!
//! An [`ImageLoader`] feeds one file through one backend, either in steps on
//! the consumer context ([`ImageLoader::start_idle`]) or on a pool thread
//! ([`ImageLoader::start`]). Progress is reported as [`LoaderEvent`]s,
//! always delivered on the consumer context.

mod feed;
mod observer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glib::{MainContext, Source};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::backend::{BackendRegistry, FormatTag, Pixbuf};
use crate::config::{ExternalPreviewConfig, LoaderConfig, READ_BUFFER_SIZE_DEFAULT};
use crate::context::SourceGroup;
use crate::notify::AreaQueue;
use crate::pool::{PriorityGate, Scheduler};
use crate::types::{FileItem, LoadError, LoadState, LoaderEvent, Priority};

use feed::FeedEngine;

/// Identifies a connected event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER: AtomicU64 = AtomicU64::new(1);

type Handler = Arc<dyn Fn(&LoaderView<'_>, &LoaderEvent) + Send + Sync>;

/// Mutable session fields, all behind one lock.
struct LoaderState {
    bytes_read: usize,
    bytes_total: usize,
    pixbuf: Option<Pixbuf>,
    error: Option<LoadError>,
    load_state: LoadState,
    /// Set by teardown; the feeding side stops at the next check.
    stopping: bool,
    /// Cleared while a pool thread runs the session.
    can_destroy: bool,
    requested_width: u32,
    requested_height: u32,
    actual_width: u32,
    actual_height: u32,
    /// Set by the first size announcement from the backend.
    size_known: bool,
    shrunk: bool,
    delay_area_ready: bool,
    areas: AreaQueue,
    delayed_areas: AreaQueue,
    read_buffer_size: usize,
    read_loop_count: u32,
    priority: Priority,
    format_name: Option<String>,
    format_tag: FormatTag,
    page_total: u32,
    started: bool,
    pooled: bool,
    idle_source: Option<Source>,
    /// No events are delivered once set.
    disposed: bool,
}

impl LoaderState {
    fn new(config: &LoaderConfig) -> Self {
        Self {
            bytes_read: 0,
            bytes_total: 0,
            pixbuf: None,
            error: None,
            load_state: LoadState::NotStarted,
            stopping: false,
            can_destroy: true,
            requested_width: 0,
            requested_height: 0,
            actual_width: 0,
            actual_height: 0,
            size_known: false,
            shrunk: false,
            delay_area_ready: false,
            areas: AreaQueue::new(),
            delayed_areas: AreaQueue::new(),
            read_buffer_size: normalize_buffer_size(config.read_buffer_size),
            read_loop_count: config.read_loop_count.max(1),
            priority: config.default_priority,
            format_name: None,
            format_tag: FormatTag::Other,
            page_total: 0,
            started: false,
            pooled: false,
            idle_source: None,
            disposed: false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.load_state, LoadState::Done | LoadState::Error)
    }

    /// Keep the first error only.
    fn record_error(&mut self, error: LoadError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            self.bytes_read as f64 / self.bytes_total as f64
        }
    }
}

fn normalize_buffer_size(size: usize) -> usize {
    if size == 0 {
        READ_BUFFER_SIZE_DEFAULT
    } else {
        size
    }
}

/// State shared between the consumer handle, the worker and queued events.
pub(crate) struct LoaderShared {
    file: FileItem,
    state: Mutex<LoaderState>,
    can_destroy_cond: Condvar,
    /// Serialises backend access between the feeding side and teardown.
    engine: Mutex<FeedEngine>,
    context: MainContext,
    gate: Arc<PriorityGate>,
    registry: Arc<BackendRegistry>,
    external: Option<ExternalPreviewConfig>,
    use_exif_preview: bool,
    /// Sources attached for this session, so teardown can drop them.
    sources: SourceGroup,
    handlers: Mutex<Vec<(HandlerId, Handler)>>,
}

impl LoaderShared {
    /// Call every handler. Runs on the consumer context.
    fn dispatch(&self, event: &LoaderEvent) {
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let view = LoaderView { shared: self };
        for handler in handlers {
            handler(&view, event);
        }
    }
}

/// Read access to a session from inside an event handler.
pub struct LoaderView<'a> {
    shared: &'a LoaderShared,
}

macro_rules! session_getters {
    () => {
        /// The pixel buffer, once the backend has allocated it.
        pub fn pixbuf(&self) -> Option<Pixbuf> {
            self.shared().state.lock().pixbuf.clone()
        }

        pub fn is_done(&self) -> bool {
            self.shared().state.lock().load_state == LoadState::Done
        }

        /// The first error recorded for the session.
        pub fn error(&self) -> Option<LoadError> {
            self.shared().state.lock().error.clone()
        }

        /// Fraction of the source fed so far, `0.0` before the size is known.
        pub fn percent(&self) -> f64 {
            self.shared().state.lock().percent()
        }

        /// Whether the backend decodes at a reduced size.
        pub fn is_shrunk(&self) -> bool {
            self.shared().state.lock().shrunk
        }

        pub fn state(&self) -> LoadState {
            self.shared().state.lock().load_state
        }

        /// Size of the pixel buffer as announced by the last size event.
        pub fn size(&self) -> (u32, u32) {
            let state = self.shared().state.lock();
            (state.actual_width, state.actual_height)
        }

        pub fn bytes_read(&self) -> usize {
            self.shared().state.lock().bytes_read
        }

        pub fn bytes_total(&self) -> usize {
            self.shared().state.lock().bytes_total
        }

        /// Name of the selected backend's format.
        pub fn format_name(&self) -> Option<String> {
            self.shared().state.lock().format_name.clone()
        }

        pub fn page_total(&self) -> u32 {
            self.shared().state.lock().page_total
        }

        pub fn file(&self) -> &FileItem {
            &self.shared().file
        }
    };
}

impl LoaderView<'_> {
    fn shared(&self) -> &LoaderShared {
        self.shared
    }

    session_getters!();
}

/// One load of one file.
///
/// Dropping the loader tears the session down. For pooled sessions this
/// blocks until the worker has stopped touching the backend; no event is
/// delivered afterwards.
pub struct ImageLoader {
    shared: Arc<LoaderShared>,
    scheduler: Scheduler,
}

impl ImageLoader {
    pub fn new(scheduler: &Scheduler, file: FileItem) -> Self {
        let config = scheduler.config();
        debug!(path = ?file.path(), "new image loader");

        let shared = Arc::new(LoaderShared {
            state: Mutex::new(LoaderState::new(config)),
            can_destroy_cond: Condvar::new(),
            engine: Mutex::new(FeedEngine::new()),
            context: scheduler.context.clone(),
            gate: Arc::clone(&scheduler.gate),
            registry: Arc::clone(&scheduler.registry),
            external: config.external_preview.clone(),
            use_exif_preview: config.use_exif_preview,
            sources: SourceGroup::new(),
            handlers: Mutex::new(Vec::new()),
            file,
        });

        Self {
            shared,
            scheduler: scheduler.clone(),
        }
    }

    fn shared(&self) -> &LoaderShared {
        &self.shared
    }

    session_getters!();

    /// Ask for a reduced size. Decoders that support it scale the image to
    /// fit inside `width x height`; `(0, 0)` keeps the natural size.
    pub fn set_requested_size(&self, width: u32, height: u32) {
        let mut state = self.shared.state.lock();
        state.requested_width = width;
        state.requested_height = height;
    }

    /// Bytes handed to the backend per write. Zero restores the default.
    pub fn set_read_buffer_size(&self, size: usize) {
        self.shared.state.lock().read_buffer_size = normalize_buffer_size(size);
    }

    /// Writes per scheduler step. Zero is treated as one.
    pub fn set_read_loop_count(&self, count: u32) {
        self.shared.state.lock().read_loop_count = count.max(1);
    }

    /// Ignored once the session has started.
    pub fn set_priority(&self, priority: Priority) {
        let mut state = self.shared.state.lock();
        if !state.started {
            state.priority = priority;
        }
    }

    pub fn priority(&self) -> Priority {
        self.shared.state.lock().priority
    }

    /// Hold area events back until delaying is turned off again, then
    /// deliver everything held, oldest first.
    pub fn set_delay_area_ready(&self, delay: bool) {
        let flushed = {
            let mut state = self.shared.state.lock();
            let was_delayed = state.delay_area_ready;
            state.delay_area_ready = delay;
            if was_delayed && !delay && !state.disposed {
                state.delayed_areas.drain()
            } else {
                Vec::new()
            }
        };

        for rect in flushed {
            self.shared.dispatch(&LoaderEvent::AreaReady(rect));
        }
    }

    /// Register a handler for every event of this session.
    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&LoaderView<'_>, &LoaderEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(NEXT_HANDLER.fetch_add(1, Ordering::Relaxed));
        self.shared.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.shared.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Start feeding on a pool thread.
    ///
    /// # Errors
    ///
    /// Fails if the session already started or the file cannot be mapped.
    /// Such failures are not reported as events.
    pub fn start(&self) -> Result<(), LoadError> {
        self.shared.mark_started(true)?;
        self.shared.setup_source()?;

        self.shared.state.lock().can_destroy = false;
        let shared = Arc::clone(&self.shared);
        if !self.scheduler.pool.push(move || shared.run_pooled()) {
            let mut state = self.shared.state.lock();
            state.can_destroy = true;
            let error = LoadError::Source("Worker pool is shut down".to_string());
            state.record_error(error.clone());
            state.load_state = LoadState::Error;
            return Err(error);
        }
        Ok(())
    }

    /// Start feeding in steps on the consumer context.
    ///
    /// The first chunks are fed before this returns, until the backend has
    /// allocated its pixel buffer.
    ///
    /// # Errors
    ///
    /// Fails if the session already started, the file cannot be mapped or
    /// the first chunks are rejected. The last case is also reported as an
    /// [`LoaderEvent::Error`].
    pub fn start_idle(&self) -> Result<(), LoadError> {
        self.shared.mark_started(false)?;
        self.shared.setup_source()?;

        let ok = {
            let mut engine = self.shared.engine.lock();
            self.shared.begin(&mut engine)
        };
        if !ok {
            return Err(self.error().unwrap_or(LoadError::NoPixbuf));
        }

        let mut state = self.shared.state.lock();
        if !state.is_terminal() {
            let priority = state.priority;
            let weak = Arc::downgrade(&self.shared);
            let source = self
                .shared
                .sources
                .add(&self.shared.context, priority, move || match weak.upgrade() {
                    Some(shared) => shared.run_idle_step(),
                    None => std::ops::ControlFlow::Break(()),
                });
            state.idle_source = Some(source);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        let idle = self.shared.state.lock().idle_source.take();
        if let Some(source) = idle {
            source.destroy();
        }

        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            while !state.can_destroy {
                self.shared.can_destroy_cond.wait(&mut state);
            }
        }

        self.shared.release_for_teardown();

        let bytes_read = {
            let mut state = self.shared.state.lock();
            if state.started && !state.is_terminal() {
                state.record_error(LoadError::Cancelled);
                state.load_state = LoadState::Error;
            }
            state.disposed = true;
            state.bytes_read
        };

        let pending = self.shared.sources.destroy_all();
        if pending > 0 {
            debug!(pending, "pending signals detected");
        }
        debug!(path = ?self.shared.file.path(), bytes_read, "freeing image loader");
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ImageLoader")
            .field("file", &self.shared.file.path())
            .field("state", &state.load_state)
            .field("pooled", &state.pooled)
            .field("bytes_read", &state.bytes_read)
            .field("bytes_total", &state.bytes_total)
            .finish()
    }
}

/// Load `file` far enough to learn the pixel buffer size.
///
/// Runs a cooperative start synchronously on the calling thread.
pub fn load_dimensions(scheduler: &Scheduler, file: FileItem) -> Option<(u32, u32)> {
    let loader = ImageLoader::new(scheduler, file);
    loader.start_idle().ok()?;
    loader.pixbuf().map(|pixbuf| pixbuf.dimensions())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use image::ImageFormat;

    use super::*;
    use crate::backend::tests::encode_test_image;
    use crate::context::{run_pending, run_until};
    use crate::backend::{BackendKind, BackendObserver, ImageBackend, PixelBuffer};
    use crate::types::{FormatClass, Rect};

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Show loader logs with `RUST_LOG=geeqie_loader=trace`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn write_fixture(name: &str, bytes: &[u8]) -> (tempfile::TempDir, FileItem) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, FileItem::new(path))
    }

    /// Record every event delivered to `loader`.
    fn record(loader: &ImageLoader) -> Arc<Mutex<Vec<LoaderEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        loader.connect(move |_, event| sink.lock().push(event.clone()));
        events
    }

    fn terminal_count(events: &[LoaderEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, LoaderEvent::Done | LoaderEvent::Error))
            .count()
    }

    /// Backend that pretends to decode an image of a fixed size, one row
    /// per write.
    struct ScriptedBackend {
        observer: Option<Arc<dyn BackendObserver>>,
        natural: (u32, u32),
        tag: FormatTag,
        target: Option<(u32, u32)>,
        pixbuf: Option<Pixbuf>,
        row: u32,
        fail_on_write: Option<usize>,
        fail_on_close: bool,
        produce_pixbuf: bool,
        repeat_size: bool,
        write_delay: Duration,
        writes: Arc<AtomicUsize>,
        page_num: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    struct Script {
        natural: (u32, u32),
        tag: FormatTag,
        fail_on_write: Option<usize>,
        fail_on_close: bool,
        produce_pixbuf: bool,
        /// Announce the size again on every write.
        repeat_size: bool,
        write_delay: Duration,
        writes: Arc<AtomicUsize>,
        page_num: Arc<AtomicUsize>,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                natural: (40, 30),
                tag: FormatTag::Other,
                fail_on_write: None,
                fail_on_close: false,
                produce_pixbuf: true,
                repeat_size: false,
                write_delay: Duration::ZERO,
                writes: Arc::new(AtomicUsize::new(0)),
                page_num: Arc::new(AtomicUsize::new(usize::MAX)),
            }
        }
    }

    impl Script {
        fn backend(&self) -> ScriptedBackend {
            ScriptedBackend {
                observer: None,
                natural: self.natural,
                tag: self.tag,
                target: None,
                pixbuf: None,
                row: 0,
                fail_on_write: self.fail_on_write,
                fail_on_close: self.fail_on_close,
                produce_pixbuf: self.produce_pixbuf,
                repeat_size: self.repeat_size,
                write_delay: self.write_delay,
                writes: Arc::clone(&self.writes),
                page_num: Arc::clone(&self.page_num),
            }
        }

        fn scheduler(&self) -> Scheduler {
            let mut registry = BackendRegistry::empty();
            let script = self.clone();
            registry.register(BackendKind::Default, move |_| Box::new(script.backend()));
            Scheduler::with_registry(MainContext::new(), LoaderConfig::default(), registry)
        }
    }

    impl ImageBackend for ScriptedBackend {
        fn init(&mut self, observer: Arc<dyn BackendObserver>) {
            self.observer = Some(observer);
        }

        fn write(&mut self, _chunk: &[u8], _total: usize) -> Result<(), LoadError> {
            let count = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.write_delay.is_zero() {
                thread::sleep(self.write_delay);
            }
            if self.fail_on_write == Some(count) {
                return Err(LoadError::Decode("scripted write failure".to_string()));
            }
            let observer = self.observer.clone().unwrap();

            if self.pixbuf.is_none() && self.produce_pixbuf {
                if let Some(size) = observer.size_prepared(self.natural.0, self.natural.1) {
                    self.set_size(size.0, size.1);
                }
                let (w, h) = self.target.unwrap_or(self.natural);
                let pixbuf = PixelBuffer::new(w, h);
                observer.area_prepared(&pixbuf);
                self.pixbuf = Some(pixbuf);
            } else if self.repeat_size {
                let answer = observer.size_prepared(self.natural.0, self.natural.1);
                assert_eq!(answer, self.target);
            }

            if let Some(pixbuf) = &self.pixbuf {
                if self.row < pixbuf.height() {
                    let rect = Rect::new(0, self.row, pixbuf.width(), 1);
                    self.row += 1;
                    if observer.area_updated(pixbuf, rect).is_break() {
                        self.abort();
                    }
                }
            }
            Ok(())
        }

        fn pixbuf(&self) -> Option<Pixbuf> {
            self.pixbuf.clone()
        }

        fn close(&mut self) -> Result<(), LoadError> {
            if self.fail_on_close {
                return Err(LoadError::Decode("scripted close failure".to_string()));
            }
            Ok(())
        }

        fn abort(&mut self) {}

        fn format_name(&self) -> &str {
            "scripted"
        }

        fn mime_types(&self) -> Vec<&'static str> {
            Vec::new()
        }

        fn format_tag(&self) -> FormatTag {
            self.tag
        }

        fn page_total(&self) -> u32 {
            3
        }

        fn set_page_num(&mut self, page_num: u32) {
            self.page_num.store(page_num as usize, Ordering::SeqCst);
        }

        fn set_size(&mut self, width: u32, height: u32) {
            self.target = Some((width, height));
        }
    }

    #[test]
    fn test_idle_load_png() {
        init_tracing();
        let scheduler = Scheduler::new(MainContext::new(), LoaderConfig::default());
        let png = encode_test_image(64, 48, ImageFormat::Png);
        let (_dir, file) = write_fixture("photo.png", &png);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(512);
        let events = record(&loader);
        loader.start_idle().unwrap();

        assert!(run_until(
            scheduler.context(),
            || terminal_count(&events.lock()) > 0,
            TIMEOUT
        ));
        run_pending(scheduler.context());

        assert!(loader.is_done());
        assert_eq!(loader.state(), LoadState::Done);
        assert_eq!(loader.pixbuf().unwrap().dimensions(), (64, 48));
        assert_eq!(loader.bytes_read(), png.len());
        assert_eq!(loader.percent(), 1.0);
        assert_eq!(loader.format_name().as_deref(), Some("png"));

        let events = events.lock();
        assert_eq!(events.last(), Some(&LoaderEvent::Done));
        assert_eq!(terminal_count(&events), 1);
        assert!(events.contains(&LoaderEvent::Size {
            width: 64,
            height: 48
        }));
        let rows: u32 = events
            .iter()
            .filter_map(|e| match e {
                LoaderEvent::AreaReady(rect) => Some(rect.height),
                _ => None,
            })
            .sum();
        assert_eq!(rows, 48);
    }

    #[test]
    fn test_pooled_load_jpeg() {
        init_tracing();
        let scheduler = Scheduler::new(MainContext::new(), LoaderConfig::default());
        let jpeg = encode_test_image(80, 60, ImageFormat::Jpeg);
        let (_dir, file) = write_fixture("photo.jpg", &jpeg);

        let loader = ImageLoader::new(&scheduler, file);
        let events = record(&loader);
        loader.start().unwrap();

        assert!(run_until(
            scheduler.context(),
            || terminal_count(&events.lock()) > 0,
            TIMEOUT
        ));
        assert!(loader.is_done());
        assert_eq!(loader.format_name().as_deref(), Some("jpeg"));
        assert_eq!(loader.pixbuf().unwrap().dimensions(), (80, 60));
        assert!(!loader.is_shrunk());
    }

    #[test]
    fn test_jpeg_shrinks_to_requested_box() {
        let script = Script {
            natural: (4000, 3000),
            tag: FormatTag::Jpeg,
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("big.bin", &[0u8; 64]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_requested_size(100, 100);
        let events = record(&loader);
        loader.start_idle().unwrap();
        run_until(
            scheduler.context(),
            || loader.state() != LoadState::Feeding,
            TIMEOUT,
        );
        run_pending(scheduler.context());

        assert!(loader.is_shrunk());
        assert_eq!(loader.size(), (100, 75));
        assert_eq!(loader.pixbuf().unwrap().dimensions(), (100, 75));
        assert!(events.lock().contains(&LoaderEvent::Size {
            width: 100,
            height: 75
        }));
    }

    #[test]
    fn test_zero_request_keeps_natural_size() {
        let script = Script {
            natural: (400, 300),
            tag: FormatTag::Jpeg,
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("big.bin", &[0u8; 16]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_requested_size(0, 0);
        loader.start_idle().unwrap();

        assert!(!loader.is_shrunk());
        assert_eq!(loader.size(), (400, 300));
    }

    #[test]
    fn test_non_jpeg_is_not_shrunk() {
        let script = Script {
            natural: (400, 300),
            tag: FormatTag::Png,
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("big.bin", &[0u8; 16]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_requested_size(100, 100);
        loader.start_idle().unwrap();
        assert!(!loader.is_shrunk());
        assert_eq!(loader.size(), (400, 300));
    }

    #[test]
    fn test_video_class_shrinks() {
        let script = Script {
            natural: (1920, 1080),
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("clip.bin", &[0u8; 16]);

        let loader = ImageLoader::new(&scheduler, file.with_class(FormatClass::Video));
        loader.set_requested_size(192, 192);
        loader.start_idle().unwrap();
        assert!(loader.is_shrunk());
        assert_eq!(loader.size(), (192, 108));
    }

    #[test]
    fn test_size_decided_once() {
        let script = Script {
            natural: (4000, 3000),
            tag: FormatTag::Jpeg,
            repeat_size: true,
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("big.bin", &[0u8; 8]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_requested_size(100, 100);
        loader.set_read_buffer_size(1);
        let events = record(&loader);
        loader.start_idle().unwrap();
        // A new request after the first announcement changes nothing
        loader.set_requested_size(10, 10);
        run_pending(scheduler.context());

        assert!(loader.is_done());
        assert_eq!(script.writes.load(Ordering::SeqCst), 8);
        assert_eq!(loader.size(), (100, 75));
        let sizes: Vec<LoaderEvent> = events
            .lock()
            .iter()
            .filter(|e| matches!(e, LoaderEvent::Size { .. }))
            .cloned()
            .collect();
        assert_eq!(
            sizes,
            vec![LoaderEvent::Size {
                width: 100,
                height: 75
            }]
        );
    }

    #[test]
    fn test_bytes_read_monotonic_and_bounded() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[7u8; 1000]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(64);
        loader.set_read_loop_count(2);
        loader.start_idle().unwrap();

        let mut last = loader.bytes_read();
        while scheduler.context().iteration(false) {
            let read = loader.bytes_read();
            assert!(read >= last);
            assert!(read <= loader.bytes_total());
            last = read;
        }
        assert!(loader.is_done());
        assert_eq!(last, 1000);
        // One write in the start, then two per step
        assert_eq!(script.writes.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_write_failure_reports_error_once() {
        let script = Script {
            fail_on_write: Some(3),
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 100]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(10);
        let events = record(&loader);
        loader.start_idle().unwrap();
        run_pending(scheduler.context());

        assert_eq!(loader.state(), LoadState::Error);
        assert!(!loader.is_done());
        assert!(matches!(loader.error(), Some(LoadError::Decode(msg)) if msg.contains("write")));
        assert_eq!(loader.bytes_read(), 20);
        let events = events.lock();
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(events.last(), Some(&LoaderEvent::Error));
    }

    #[test]
    fn test_first_write_failure_fails_start() {
        let script = Script {
            fail_on_write: Some(1),
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 100]);

        let loader = ImageLoader::new(&scheduler, file);
        let events = record(&loader);
        assert!(matches!(loader.start_idle(), Err(LoadError::Decode(_))));
        run_pending(scheduler.context());
        assert_eq!(*events.lock(), vec![LoaderEvent::Error]);
    }

    #[test]
    fn test_close_failure_is_error() {
        let script = Script {
            fail_on_close: true,
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 50]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(10);
        let events = record(&loader);
        loader.start_idle().unwrap();
        run_pending(scheduler.context());

        assert!(matches!(loader.error(), Some(LoadError::Decode(msg)) if msg.contains("close")));
        assert_eq!(terminal_count(&events.lock()), 1);
        // The buffer outlives the backend
        assert!(loader.pixbuf().is_some());
    }

    #[test]
    fn test_no_pixbuf_is_failure() {
        let script = Script {
            produce_pixbuf: false,
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 30]);

        let loader = ImageLoader::new(&scheduler, file);
        let events = record(&loader);
        assert!(matches!(loader.start_idle(), Err(LoadError::NoPixbuf)));
        run_pending(scheduler.context());
        assert_eq!(*events.lock(), vec![LoaderEvent::Error]);
    }

    #[test]
    fn test_missing_file_fails_without_event() {
        let scheduler = Scheduler::new(MainContext::new(), LoaderConfig::default());
        let loader = ImageLoader::new(&scheduler, FileItem::new("/nonexistent/x.jpg"));
        let events = record(&loader);

        assert!(matches!(loader.start(), Err(LoadError::Io(_))));
        run_pending(scheduler.context());
        assert!(events.lock().is_empty());
        assert!(loader.error().is_some());
    }

    #[test]
    fn test_start_twice_rejected() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 10]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.start_idle().unwrap();
        assert_eq!(loader.start(), Err(LoadError::AlreadyStarted));
        assert_eq!(loader.start_idle(), Err(LoadError::AlreadyStarted));
    }

    #[test]
    fn test_empty_file_fails() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("empty.bin", &[]);

        let loader = ImageLoader::new(&scheduler, file);
        assert!(loader.start_idle().is_err());
        assert_eq!(script.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_page_bookkeeping() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("doc.bin", &[1u8; 10]);

        let loader = ImageLoader::new(&scheduler, file.with_page(2));
        loader.start_idle().unwrap();
        assert_eq!(script.page_num.load(Ordering::SeqCst), 2);
        assert_eq!(loader.page_total(), 3);
        assert_eq!(loader.format_name().as_deref(), Some("scripted"));
    }

    #[test]
    fn test_strips_coalesce_into_one_event() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 10]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(1);
        loader.set_read_loop_count(100);
        let events = record(&loader);
        loader.start_idle().unwrap();
        run_pending(scheduler.context());

        let areas: Vec<Rect> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LoaderEvent::AreaReady(rect) => Some(*rect),
                _ => None,
            })
            .collect();
        // The first row is delivered on its own before the step runs
        assert_eq!(areas, vec![Rect::new(0, 0, 40, 1), Rect::new(0, 1, 40, 9)]);
    }

    #[test]
    fn test_delayed_areas_flush_oldest_first() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 5]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(1);
        loader.set_delay_area_ready(true);
        let events = record(&loader);
        loader.start_idle().unwrap();
        run_pending(scheduler.context());

        let areas = |events: &[LoaderEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, LoaderEvent::AreaReady(_)))
                .count()
        };
        assert_eq!(areas(&events.lock()[..]), 0);

        loader.set_delay_area_ready(false);
        let events = events.lock();
        assert_eq!(areas(&events[..]), 1);
        assert_eq!(events.last(), Some(&LoaderEvent::AreaReady(Rect::new(0, 0, 40, 5))));
    }

    #[test]
    fn test_percent_events_report_progress() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 40]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(10);
        let percents = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&percents);
        loader.connect(move |_, event| {
            if let LoaderEvent::Percent(p) = event {
                sink.lock().push(*p);
            }
        });

        loader.start_idle().unwrap();
        // Each step queues a percent event ahead of the next step
        while scheduler.context().iteration(false) {}

        let percents = percents.lock();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_handler_can_read_pixbuf() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 4]);

        let loader = ImageLoader::new(&scheduler, file);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        loader.connect(move |view, event| {
            if *event == LoaderEvent::Done {
                *sink.lock() = view.pixbuf().map(|p| p.dimensions());
            }
        });
        loader.start_idle().unwrap();
        run_pending(scheduler.context());
        assert_eq!(*seen.lock(), Some((40, 30)));
    }

    #[test]
    fn test_disconnect() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 4]);

        let loader = ImageLoader::new(&scheduler, file);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = loader.connect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(loader.disconnect(id));
        assert!(!loader.disconnect(id));

        loader.start_idle().unwrap();
        run_pending(scheduler.context());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pooled_teardown_blocks_and_silences() {
        init_tracing();
        let script = Script {
            write_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 4000]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(1);
        let events = record(&loader);
        loader.start().unwrap();

        while script.writes.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(loader);

        let writes_at_drop = script.writes.load(Ordering::SeqCst);
        assert!(writes_at_drop < 4000);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(script.writes.load(Ordering::SeqCst), writes_at_drop);

        run_pending(scheduler.context());
        assert!(events.lock().is_empty());
        assert!(!scheduler.context().pending());
    }

    #[test]
    fn test_background_waits_for_high_priority() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 8]);

        scheduler.gate().enter_high();

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_priority(Priority::LOW);
        loader.start().unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(script.writes.load(Ordering::SeqCst), 0);

        scheduler.gate().leave_high();
        assert!(run_until(
            scheduler.context(),
            || loader.state() != LoadState::Feeding,
            TIMEOUT
        ));
        assert!(loader.is_done());
    }

    #[test]
    fn test_background_pauses_between_steps_for_high_priority() {
        let script = Script {
            write_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 50]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(1);
        loader.set_priority(Priority::LOW);
        loader.start().unwrap();

        while script.writes.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        scheduler.gate().enter_high();

        // Let the write in progress finish, then nothing more may run
        thread::sleep(Duration::from_millis(50));
        let held = script.writes.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(script.writes.load(Ordering::SeqCst), held);
        assert!(held < 50);
        assert_eq!(loader.state(), LoadState::Feeding);

        scheduler.gate().leave_high();
        assert!(run_until(
            scheduler.context(),
            || loader.state() != LoadState::Feeding,
            TIMEOUT
        ));
        assert!(loader.is_done());
        assert_eq!(script.writes.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_high_priority_loader_holds_gate() {
        let script = Script {
            write_delay: Duration::from_millis(2),
            ..Default::default()
        };
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 50]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(1);
        loader.set_priority(Priority::HIGH);
        loader.start().unwrap();

        while script.writes.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(scheduler.gate().active(), 1);

        run_until(
            scheduler.context(),
            || loader.state() != LoadState::Feeding,
            TIMEOUT,
        );
        drop(loader);
        assert_eq!(scheduler.gate().active(), 0);
    }

    #[test]
    fn test_priority_fixed_after_start() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 8]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_priority(Priority::HIGH_IDLE);
        loader.start_idle().unwrap();
        loader.set_priority(Priority::LOW);
        assert_eq!(loader.priority(), Priority::HIGH_IDLE);
    }

    #[test]
    fn test_drop_unfinished_idle_session() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 100]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(10);
        let events = record(&loader);
        loader.start_idle().unwrap();
        assert!(scheduler.context().pending());

        drop(loader);
        assert!(!scheduler.context().pending());
        run_pending(scheduler.context());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_load_dimensions() {
        let scheduler = Scheduler::new(MainContext::new(), LoaderConfig::default());
        let png = encode_test_image(33, 17, ImageFormat::Png);
        let (_dir, file) = write_fixture("dims.png", &png);
        assert_eq!(load_dimensions(&scheduler, file), Some((33, 17)));

        let (_dir, file) = write_fixture("junk.bin", b"not an image at all, really");
        assert_eq!(load_dimensions(&scheduler, file), None);
        assert!(!scheduler.context().pending());
    }

    #[test]
    fn test_stereo_tag_for_jps() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("pair.jps", &[1u8; 4]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.start_idle().unwrap();
        assert!(loader.pixbuf().unwrap().is_stereo_cross());
    }

    #[test]
    fn test_area_prepared_clears_buffer() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 4]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.start_idle().unwrap();
        let pixbuf = loader.pixbuf().unwrap();
        assert!(pixbuf.read().pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn test_idle_step_yields_between_chunks() {
        let script = Script::default();
        let scheduler = script.scheduler();
        let (_dir, file) = write_fixture("data.bin", &[1u8; 30]);

        let loader = ImageLoader::new(&scheduler, file);
        loader.set_read_buffer_size(10);
        loader.start_idle().unwrap();
        assert_eq!(loader.bytes_read(), 10);

        // Run the high priority area event, then one step
        let mut steps = 0;
        while loader.bytes_read() == 10 {
            assert!(scheduler.context().iteration(false));
            steps += 1;
            assert!(steps < 10);
        }
        assert_eq!(loader.bytes_read(), 20);
        assert!(!loader.is_done());
    }
}
