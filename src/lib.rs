pub mod capture;
pub mod enumerator;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

pub use capture::{FormatDescriptor, Frame, SampleMetadata};
pub use error::{SinkError, SinkResult};
pub use pipeline::{BufferPool, FileStore, ShutdownPolicy};
pub use sink::{SinkEndpoint, SinkNode};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variables override file settings, e.g. `GRABBER__POOL__RESERVE_BUFFERS=8`
const ENV_PREFIX: &str = "GRABBER";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sink: SinkConfig,
    pub pool: PoolConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub name: String,
    /// Camera id the upstream source stamps on its frames
    pub camera_id: u32,
    /// Formats the endpoint enumerates and accepts, in preference order
    pub accepted_formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub reserve_buffers: usize,
    pub buffer_bytes_hint: usize,
    pub shutdown: ShutdownPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub extension: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            name: "mjpeg-grabber".into(),
            camera_id: 0,
            accepted_formats: vec![FormatDescriptor::mjpeg()],
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reserve_buffers: 4,
            buffer_bytes_hint: 1 << 20, // a large MJPEG frame
            shutdown: ShutdownPolicy::Drain,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("captures"),
            extension: "jpg".into(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` (if given and present),
    /// overlaid by `GRABBER__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        let config = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
