//! Mapping from backend kinds to backend constructors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::ImageFormat;
use tracing::debug;

use super::{
    BackendKind, ExternalBackend, ImageBackend, ImageRsBackend, JpegBackend, ZxScreenBackend,
};
use crate::config::ExternalPreviewConfig;
use crate::types::FileItem;

/// What a factory gets to build a backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub kind: BackendKind,
    pub file: &'a FileItem,
    pub external: Option<&'a ExternalPreviewConfig>,
}

/// Builds a fresh backend for one session.
pub type BackendFactory = Arc<dyn Fn(&BackendRequest<'_>) -> Box<dyn ImageBackend> + Send + Sync>;

/// The backends available to a scheduler.
///
/// Kinds without a registered factory are served by the `Default` entry.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
}

impl BackendRegistry {
    /// A registry with no backends at all, not even a default.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(BackendKind::Default, |_| Box::new(ImageRsBackend::new()));
        registry.register(BackendKind::Jpeg, |_| Box::new(JpegBackend::new()));
        registry.register(BackendKind::Tiff, |_| {
            Box::new(ImageRsBackend::with_format(ImageFormat::Tiff))
        });
        registry.register(BackendKind::WebP, |_| {
            Box::new(ImageRsBackend::with_format(ImageFormat::WebP))
        });
        registry.register(BackendKind::Dds, |_| {
            Box::new(ImageRsBackend::with_format(ImageFormat::Dds))
        });
        registry.register(BackendKind::OpenExr, |_| {
            Box::new(ImageRsBackend::with_format(ImageFormat::OpenExr))
        });
        registry.register(BackendKind::ZxScreen, |_| Box::new(ZxScreenBackend::new()));
        registry.register(BackendKind::External, |request| match request.external {
            Some(config) => Box::new(ExternalBackend::new(
                config.extract.clone(),
                request.file.path().to_path_buf(),
            )),
            None => Box::new(ImageRsBackend::new()),
        });
        registry
    }

    /// Register or replace the factory for `kind`.
    pub fn register<F>(&mut self, kind: BackendKind, factory: F)
    where
        F: Fn(&BackendRequest<'_>) -> Box<dyn ImageBackend> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build the backend for `request.kind`, falling back to the default.
    pub fn create(&self, request: &BackendRequest<'_>) -> Option<Box<dyn ImageBackend>> {
        if let Some(factory) = self.factories.get(&request.kind) {
            debug!(kind = request.kind.name(), "Using {} loader", request.kind.name());
            return Some(factory(request));
        }

        let factory = self.factories.get(&BackendKind::Default)?;
        debug!(
            kind = request.kind.name(),
            "No {} loader registered, using default loader",
            request.kind.name()
        );
        Some(factory(request))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("BackendRegistry").field("kinds", &kinds).finish()
    }
}
