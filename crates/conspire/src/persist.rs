//! Atomic file replacement and the vault lock
//!
//! Nothing in the vault is ever overwritten in place. Replacements are
//! staged in a uniquely named file next to the target, synced, and renamed
//! over it, so readers see either the old file or the new one. A replaced
//! file keeps its permission bits; new files are private to the owner.

use crate::error::{Result, VaultError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Name of the advisory lock file inside the vault directory
pub const LOCK_FILE: &str = ".conspire.lock";

/// Replace `path` with `contents` via stage-then-rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".new.{}.", name))
        .tempfile_in(dir)
        .map_err(|e| VaultError::persist(path, e))?;

    let written: std::io::Result<()> = (|| {
        staged.write_all(contents)?;
        staged.flush()?;
        staged.as_file().sync_all()
    })();
    written.map_err(|e| VaultError::persist(path, e))?;

    // The staged file is created 0600; carry over the mode of what it replaces
    if let Ok(meta) = fs::metadata(path) {
        if meta.is_file() {
            staged
                .as_file()
                .set_permissions(meta.permissions())
                .map_err(|e| VaultError::persist(path, e))?;
        }
    }

    // On error the staged file is dropped, which removes it
    staged
        .persist(path)
        .map_err(|e| VaultError::persist(path, e.error))?;

    // Best-effort directory sync so the rename itself is durable
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Exclusive advisory lock on the vault, released on drop
pub struct VaultLock {
    file: File,
}

impl VaultLock {
    /// Block until no other invocation holds the vault lock
    pub fn acquire(vault: &Path) -> Result<Self> {
        let path = vault.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| VaultError::persist(&path, e))?;

        file.lock_exclusive()
            .map_err(|e| VaultError::persist(&path, e))?;
        tracing::debug!(path = %path.display(), "acquired vault lock");

        Ok(Self { file })
    }
}

impl Drop for VaultLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
