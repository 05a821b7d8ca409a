//! Writes and removes the daemon's pid file, the way `main.c`'s
//! `create_pid_file`/`cleanup` pair does: truncate any stale file first,
//! then create fresh with `O_EXCL` so two daemons can't both believe they
//! hold it.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::warn;

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates `path`, overwriting any leftover file from a prior run that
    /// didn't exit cleanly. Logs and continues rather than failing startup
    /// if the file can't be written — a missing pid file doesn't stop the
    /// daemon from serving sessions.
    pub fn create(path: impl Into<PathBuf>) -> PidFile {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(%err, dir = %parent.display(), "failed to create pid file directory");
            }
        }
        let _ = std::fs::remove_file(&path);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
        {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{}", std::process::id()) {
                    warn!(%err, path = %path.display(), "failed to write pid file");
                }
            }
            Err(err) => warn!(%err, path = %path.display(), "failed to create pid file"),
        }
        PidFile { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
