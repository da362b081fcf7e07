//! Cross-process serialization of all mutations to one logical network.
//!
//! One lock file per network name; an exclusive `flock` on it blocks every
//! other invocation against the same network until the holder exits its
//! critical section. Distinct names never contend. The kernel drops the
//! lock when the holding process exits, so a crashed holder cannot block
//! future invocations.

use anyhow::{Context, Result};
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default directory for lock files
pub const DEFAULT_LOCK_DIR: &str = "/tmp";

/// Extension of the lock file
pub const LOCK_EXT: &str = ".lock";

/// A held, named, filesystem-backed mutex on a whole network. Released on
/// drop, so the critical section cannot leak the lock on any exit path.
pub struct NamedLock {
    name: String,
    file: File,
}

impl NamedLock {
    /// Block until the lock for `name` is held
    pub fn acquire(name: &str) -> Result<Self> {
        Self::acquire_in(Path::new(DEFAULT_LOCK_DIR), name)
    }

    /// Block until the lock for `name` under `dir` is held
    pub fn acquire_in(dir: &Path, name: &str) -> Result<Self> {
        let path: PathBuf = dir.join(format!("vxlan-{name}{LOCK_EXT}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .with_context(|| format!("failed to lock {}", path.display()))?;
        debug!(name, path = %path.display(), "acquired network lock");
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Release explicitly; dropping the lock has the same effect
    pub fn release(self) {}
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        debug!(name = %self.name, "released network lock");
    }
}
