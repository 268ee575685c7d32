//! Dedicated writer thread and the persistence strategies it drives

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace};

use crate::error::{SinkError, SinkResult};
use crate::pipeline::pool::{FrameBuffer, Shared};
use crate::StorageConfig;

/// Persists one frame buffer.
///
/// Called only from the writer thread, one buffer at a time, in save order.
/// The buffer is recycled whatever the outcome.
pub trait FramePersister: Send {
    fn persist(&mut self, buffer: &FrameBuffer) -> SinkResult<()>;
}

impl<F> FramePersister for F
where
    F: FnMut(&FrameBuffer) -> SinkResult<()> + Send,
{
    fn persist(&mut self, buffer: &FrameBuffer) -> SinkResult<()> {
        (self)(buffer)
    }
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    persister: Box<dyn FramePersister>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("frame-writer".into())
        .spawn(move || run(&shared, persister))
}

fn run(shared: &Shared, mut persister: Box<dyn FramePersister>) {
    debug!("frame writer started");

    while let Some(buffer) = shared.next_pending() {
        // a panicking persister loses this frame, not the writer
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| persister.persist(&buffer)));
        let ok = match outcome {
            Ok(Ok(())) => {
                metrics::counter!("grabber_frames_written_total").increment(1);
                trace!(sequence = buffer.sequence, bytes = buffer.len(), "frame written");
                true
            }
            Ok(Err(e)) => {
                metrics::counter!("grabber_write_failures_total").increment(1);
                error!(sequence = buffer.sequence, camera = buffer.camera, "{e}");
                false
            }
            Err(payload) => {
                metrics::counter!("grabber_write_failures_total").increment(1);
                error!(
                    sequence = buffer.sequence,
                    camera = buffer.camera,
                    "frame persister panicked: {}",
                    panic_message(payload.as_ref())
                );
                false
            }
        };
        shared.finish_write(buffer, ok);
    }

    debug!("frame writer exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Decides where each buffer lands on disk
#[derive(Debug, Clone)]
pub struct NamingPolicy {
    pub extension: String,
}

impl NamingPolicy {
    /// Path of `buffer` relative to the store root.
    ///
    /// Streaming frames go to `cam<N>/<sequence>_<timestamp>.<ext>` so names
    /// sort in submission order; one-shot frames go to
    /// `oneshot/cam<N>_tag<T>_<sequence>_<timestamp>.<ext>`.
    pub fn relative_path(&self, buffer: &FrameBuffer) -> PathBuf {
        let stamp = buffer.timestamp.format("%Y%m%dT%H%M%S%.3fZ");
        match buffer.one_shot {
            Some(tag) => PathBuf::from("oneshot").join(format!(
                "cam{:02}_tag{}_{:08}_{}.{}",
                buffer.camera, tag, buffer.sequence, stamp, self.extension
            )),
            None => PathBuf::from(format!("cam{:02}", buffer.camera)).join(format!(
                "{:08}_{}.{}",
                buffer.sequence, stamp, self.extension
            )),
        }
    }
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self {
            extension: "jpg".into(),
        }
    }
}

/// Writes every buffer to its own file under a base directory
pub struct FileStore {
    base_path: PathBuf,
    naming: NamingPolicy,
    created_dirs: HashSet<PathBuf>,
}

impl FileStore {
    pub fn new(base_path: impl Into<PathBuf>, naming: NamingPolicy) -> SinkResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|source| SinkError::WriteFailure {
            path: base_path.clone(),
            source,
        })?;
        info!(path = %base_path.display(), "frame store ready");

        Ok(Self {
            base_path,
            naming,
            created_dirs: HashSet::new(),
        })
    }

    pub fn from_config(config: &StorageConfig) -> SinkResult<Self> {
        Self::new(
            &config.base_path,
            NamingPolicy {
                extension: config.extension.clone(),
            },
        )
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn path_for(&self, buffer: &FrameBuffer) -> PathBuf {
        self.base_path.join(self.naming.relative_path(buffer))
    }

    fn ensure_parent(&mut self, path: &Path) -> std::io::Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if !self.created_dirs.contains(parent) {
            fs::create_dir_all(parent)?;
            self.created_dirs.insert(parent.to_path_buf());
        }
        Ok(())
    }

    fn write_file(&mut self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        self.ensure_parent(path)?;
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.flush()
    }
}

impl FramePersister for FileStore {
    fn persist(&mut self, buffer: &FrameBuffer) -> SinkResult<()> {
        let path = self.path_for(buffer);
        self.write_file(&path, buffer.data())
            .map_err(|source| SinkError::WriteFailure { path, source })
    }
}
