//! Previews produced by user-configured external commands.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{publish_bands, BackendObserver, FormatTag, ImageBackend, PixelBuffer, Pixbuf};
use crate::config::{expand_tilde, ExternalPreviewConfig};
use crate::scale::{resize, FilterType};
use crate::types::LoadError;

/// Ask the external selector whether it handles `path`.
///
/// The selector accepts the file by exiting with status 0. A selector that
/// cannot be run accepts nothing.
pub fn run_select(config: &ExternalPreviewConfig, path: &Path) -> bool {
    let program = expand_tilde(&config.select);
    match Command::new(&program)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(?program, error = %e, "Failed to run external preview selector");
            false
        }
    }
}

/// Runs the extract command on the file and decodes what it prints.
///
/// The bytes fed by the loader are not used; the command reads the file
/// itself.
pub struct ExternalBackend {
    extract: PathBuf,
    path: PathBuf,
    observer: Option<Arc<dyn BackendObserver>>,
    pixbuf: Option<Pixbuf>,
    target: Option<(u32, u32)>,
    ran: bool,
    aborted: bool,
}

impl ExternalBackend {
    pub fn new(extract: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            extract: extract.into(),
            path: path.into(),
            observer: None,
            pixbuf: None,
            target: None,
            ran: false,
            aborted: false,
        }
    }

    fn extract_image(&self) -> Result<image::RgbaImage, LoadError> {
        let program = expand_tilde(&self.extract);
        debug!(?program, path = ?self.path, "Running external preview extractor");

        let output = Command::new(&program)
            .arg(&self.path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| LoadError::External(format!("{}: {}", program.display(), e)))?;

        if !output.status.success() {
            return Err(LoadError::External(format!(
                "{} exited with {}",
                program.display(),
                output.status
            )));
        }
        if output.stdout.is_empty() {
            return Err(LoadError::External(format!(
                "{} produced no output",
                program.display()
            )));
        }

        let decoded = image::load_from_memory(&output.stdout)
            .map_err(|e| LoadError::Decode(e.to_string()))?;
        Ok(decoded.into_rgba8())
    }

    fn run(&mut self) -> Result<(), LoadError> {
        self.ran = true;
        let mut image = self.extract_image()?;

        let Some(observer) = self.observer.clone() else {
            return Err(LoadError::Decode("Backend used before init".to_string()));
        };

        let (width, height) = image.dimensions();
        if let Some(size) = observer.size_prepared(width, height) {
            self.set_size(size.0, size.1);
        }
        if let Some((w, h)) = self.target {
            image = resize(image, w, h, FilterType::Bilinear);
        }

        let pixbuf = PixelBuffer::new(image.width(), image.height());
        self.pixbuf = Some(Arc::clone(&pixbuf));
        observer.area_prepared(&pixbuf);

        if publish_bands(observer.as_ref(), &pixbuf, &image).is_break() {
            self.abort();
        }
        Ok(())
    }
}

impl ImageBackend for ExternalBackend {
    fn init(&mut self, observer: Arc<dyn BackendObserver>) {
        self.observer = Some(observer);
    }

    fn write(&mut self, _chunk: &[u8], _total: usize) -> Result<(), LoadError> {
        if self.ran || self.aborted {
            return Ok(());
        }
        self.run()
    }

    fn pixbuf(&self) -> Option<Pixbuf> {
        self.pixbuf.clone()
    }

    fn close(&mut self) -> Result<(), LoadError> {
        if self.ran || self.aborted {
            return Ok(());
        }
        self.run()
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    fn format_name(&self) -> &str {
        "external"
    }

    fn mime_types(&self) -> Vec<&'static str> {
        vec!["application/octet-stream"]
    }

    fn format_tag(&self) -> FormatTag {
        FormatTag::External
    }

    fn set_size(&mut self, width: u32, height: u32) {
        self.target = Some((width, height));
    }
}
