//! Geeqie Loader - Asynchronous image loading
//!
//! This crate feeds image files through pluggable decoder backends, either
//! cooperatively on a consumer-driven event context or on a pool of worker
//! threads, and reports progress as coalesced events on that context.
//!
//! ```ignore
//! let context = glib::MainContext::new();
//! let scheduler = Scheduler::new(context.clone(), LoaderConfig::default());
//! let loader = ImageLoader::new(&scheduler, FileItem::new("photo.jpg"));
//! loader.set_requested_size(256, 256);
//! loader.connect(|view, event| {
//!     if let LoaderEvent::Done = event {
//!         println!("{:?}", view.pixbuf().map(|p| p.dimensions()));
//!     }
//! });
//! loader.start()?;
//! run_until(&context, || loader.state() != LoadState::Feeding, Duration::from_secs(5));
//! ```

pub mod backend;
pub mod config;
pub mod container;
pub mod context;
pub mod loader;
pub mod notify;
pub mod pool;
pub mod scale;
pub mod source;
pub mod types;

pub use backend::{
    select_backend, BackendKind, BackendObserver, BackendRegistry, BackendRequest, FormatTag,
    ImageBackend, PixelBuffer, Pixbuf,
};
pub use config::{ExternalPreviewConfig, LoaderConfig};
pub use context::{run_pending, run_until, SourceGroup};
pub use loader::{load_dimensions, HandlerId, ImageLoader, LoaderView};
pub use notify::{merge_area, AreaQueue};
pub use pool::{PriorityGate, Scheduler, WorkerPool};
pub use source::{map_source, PreviewOrigin, SourceBuffer, SourceOptions};
pub use types::{
    is_background, FileItem, FormatClass, LoadError, LoadState, LoaderEvent, Priority, Rect,
};
