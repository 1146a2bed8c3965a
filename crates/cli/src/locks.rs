//! Run lock: one pipeline process per archive root

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lock file name inside the archive root
pub const LOCK_FILE: &str = ".pacs-retire.lock";

/// Exclusive lock held for the duration of a run
pub struct RunLock {
    path: PathBuf,
    file: File,
}

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    started_at: i64,
}

impl RunLock {
    /// Acquire the run lock for `archive_root`
    ///
    /// Fails if another process holds the `flock`. The lock file itself is
    /// never removed, so every process locks the same inode; content left
    /// by a dead process is overwritten.
    pub fn acquire(archive_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(archive_root)
            .with_context(|| format!("Failed to create archive root {}", archive_root.display()))?;
        let lock_path = archive_root.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .context("Failed to open run lock file")?;

        if !try_flock_exclusive(&file)? {
            // flock is released when its holder exits, so the holder is live
            match Self::holder(&mut file) {
                Some(content) => anyhow::bail!(
                    "Another run (pid {}) holds {}",
                    content.pid,
                    lock_path.display()
                ),
                None => anyhow::bail!("Another run holds {}", lock_path.display()),
            }
        }

        if let Some(previous) = Self::holder(&mut file) {
            if !is_process_alive(previous.pid) {
                tracing::warn!(
                    path = %lock_path.display(),
                    pid = previous.pid,
                    "Reclaiming run lock left by a dead process"
                );
            }
        }
        Self::write_lock_content(&mut file)?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock
    ///
    /// The file stays in place; closing it drops the `flock`.
    pub fn release(self) -> Result<()> {
        self.file.set_len(0).context("Failed to clear run lock file")?;
        Ok(())
    }

    fn holder(file: &mut File) -> Option<LockContent> {
        Self::read_lock_content(file).ok()
    }

    fn write_lock_content(file: &mut File) -> Result<()> {
        let content = LockContent {
            pid: std::process::id(),
            started_at: chrono::Utc::now().timestamp_millis(),
        };

        let serialized = serde_json::to_string(&content).context("Failed to serialize lock content")?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_lock_content(file: &mut File) -> Result<LockContent> {
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let content: LockContent =
            serde_json::from_str(&contents).context("Failed to deserialize lock content")?;
        Ok(content)
    }
}

/// Try to acquire exclusive file lock (non-blocking)
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(target_os = "macos")]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal: existence check only
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
