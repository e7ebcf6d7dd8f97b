//! Free-space preflight for the data volume
//!
//! Writes that add bytes (new sessions, attachments) check the volume first
//! and fail with [`Error::InsufficientSpace`] instead of filling the disk.

use sessionvault_common::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait SpaceSource: Send + Sync {
    /// Bytes available to the engine's writers
    fn available_bytes(&self) -> Result<u64>;
}

/// `statvfs(3)` on a path inside the data volume
#[cfg(unix)]
#[derive(Clone, Debug)]
pub struct StatvfsSpace {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl StatvfsSpace {
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
impl SpaceSource for StatvfsSpace {
    fn available_bytes(&self) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(self.path.as_path()).map_err(|e| {
            Error::internal(format!("statvfs {} failed: {e}", self.path.display()))
        })?;
        Ok(u64::from(stat.blocks_available()).saturating_mul(u64::from(stat.fragment_size())))
    }
}

/// Reports whatever it was last told; for tests
#[derive(Clone, Debug, Default)]
pub struct FixedSpace {
    available: Arc<AtomicU64>,
}

impl FixedSpace {
    #[must_use]
    pub fn new(available: u64) -> Self {
        Self {
            available: Arc::new(AtomicU64::new(available)),
        }
    }

    pub fn set(&self, available: u64) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl SpaceSource for FixedSpace {
    fn available_bytes(&self) -> Result<u64> {
        Ok(self.available.load(Ordering::Relaxed))
    }
}

/// Fail unless `source` reports room for `required` bytes on top of `min_free`
///
/// A `min_free` of zero disables the check.
pub fn ensure_free(source: &dyn SpaceSource, required: u64, min_free: u64) -> Result<()> {
    if min_free == 0 {
        return Ok(());
    }
    let available = source.available_bytes()?;
    let needed = required.saturating_add(min_free);
    if available < needed {
        return Err(Error::InsufficientSpace {
            available,
            required: needed,
        });
    }
    Ok(())
}
