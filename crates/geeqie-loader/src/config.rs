//! Loader configuration.

use std::path::{Path, PathBuf};

use directories::UserDirs;
use serde::{Deserialize, Serialize};

use crate::types::Priority;

/// Default number of bytes handed to a backend per write.
pub const READ_BUFFER_SIZE_DEFAULT: usize = 4096;

/// Default number of writes per scheduler step.
pub const READ_LOOP_COUNT_DEFAULT: u32 = 1;

/// Settings applied to every loader created by a [`crate::Scheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Bytes per backend write.
    pub read_buffer_size: usize,
    /// Backend writes per scheduler step.
    pub read_loop_count: u32,
    /// Prefer size-bounded previews embedded in the file metadata.
    pub use_exif_preview: bool,
    /// Priority for new loaders, by name (`"high"`, `"default"`,
    /// `"high_idle"`, `"default_idle"` or `"low"`).
    #[serde(with = "priority_name")]
    pub default_priority: Priority,
    /// Optional external preview generator.
    pub external_preview: Option<ExternalPreviewConfig>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: READ_BUFFER_SIZE_DEFAULT,
            read_loop_count: READ_LOOP_COUNT_DEFAULT,
            use_exif_preview: false,
            default_priority: Priority::DEFAULT_IDLE,
            external_preview: None,
        }
    }
}

/// External commands used to produce previews for files no backend handles.
///
/// `select` is run with the file path and exits with status 0 if it accepts
/// the file. `extract` is then run with the file path and writes an encoded
/// image to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPreviewConfig {
    pub select: PathBuf,
    pub extract: PathBuf,
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match UserDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

mod priority_name {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::Priority;

    const NAMES: [(&str, Priority); 5] = [
        ("high", Priority::HIGH),
        ("default", Priority::DEFAULT),
        ("high_idle", Priority::HIGH_IDLE),
        ("default_idle", Priority::DEFAULT_IDLE),
        ("low", Priority::LOW),
    ];

    pub fn serialize<S: Serializer>(priority: &Priority, serializer: S) -> Result<S::Ok, S::Error> {
        let Some((name, _)) = NAMES.iter().find(|(_, p)| p == priority) else {
            return Err(S::Error::custom(format!("unnamed priority {priority:?}")));
        };
        serializer.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Priority, D::Error> {
        let name = String::deserialize(deserializer)?;
        NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| *p)
            .ok_or_else(|| {
                D::Error::unknown_variant(
                    &name,
                    &["high", "default", "high_idle", "default_idle", "low"],
                )
            })
    }
}
