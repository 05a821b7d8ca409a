//! Per-user runtime directory provisioning: `<rundir>/user/<uid>`, created
//! on a user's first session and torn down on their last (spec §4.4),
//! grounded on `get_rundir`/`create_rundir_base` in `ck-sysdeps-unix.c`.
//! Mirrors the real host layout for XDG_RUNTIME_DIR without reimplementing
//! systemd-logind's own directory, since this daemon predates that
//! convention; callers that want it exported just read `path()`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chown, Gid, Uid};
use std::os::unix::fs::PermissionsExt;
use tracing::{debug, warn};

pub struct RuntimeDirs {
    base: PathBuf,
    refcounts: HashMap<u32, u32>,
}

impl RuntimeDirs {
    pub fn new(rundir: impl AsRef<Path>) -> RuntimeDirs {
        RuntimeDirs {
            base: rundir.as_ref().join("user"),
            refcounts: HashMap::new(),
        }
    }

    fn dir_for(&self, uid: u32) -> PathBuf {
        self.base.join(uid.to_string())
    }

    /// Best-effort tmpfs mount over the freshly created directory, sized to
    /// the mode a per-uid runtime dir is meant to have (spec §3 "optionally
    /// a tmpfs mount"). A container or restricted host may deny `mount(2)`
    /// outright; that's not fatal, the plain directory still works as
    /// `XDG_RUNTIME_DIR`, just without tmpfs's tmpfile-on-reboot cleanup.
    fn try_mount_tmpfs(&self, dir: &Path, uid: u32) {
        let opts = format!("mode=0700,uid={uid},gid={uid}");
        match mount(
            Some("tmpfs"),
            dir,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(opts.as_str()),
        ) {
            Ok(()) => debug!(uid, dir = %dir.display(), "mounted tmpfs runtime directory"),
            Err(err) => debug!(%err, uid, "tmpfs mount unavailable, using plain directory"),
        }
    }

    /// Bumps the refcount for `uid`'s directory, creating and chowning it on
    /// the 0->1 transition.
    pub fn acquire(&mut self, uid: u32) -> io::Result<PathBuf> {
        let count = self.refcounts.entry(uid).or_insert(0);
        let dir = self.dir_for(uid);
        if *count == 0 {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(Mode::S_IRWXU.bits()))?;
            if let Err(err) = chown(&dir, Some(Uid::from_raw(uid)), Some(Gid::from_raw(uid))) {
                warn!(%err, uid, "failed to chown runtime directory");
            }
            self.try_mount_tmpfs(&dir, uid);
        }
        *count += 1;
        Ok(dir)
    }

    /// Drops the refcount, removing the directory on the last release.
    pub fn release(&mut self, uid: u32) {
        let Some(count) = self.refcounts.get_mut(&uid) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.refcounts.remove(&uid);
            let dir = self.dir_for(uid);
            // Ignore the common case (never mounted, or already gone); only
            // a tmpfs mount needs unmounting before the directory can be
            // removed out from under it.
            let _ = nix::mount::umount(&dir);
            let _ = fs::remove_dir_all(dir);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_then_release_cleans_up_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dirs = RuntimeDirs::new(tmp.path());
        let uid = 1000;
        let dir = dirs.acquire(uid).unwrap();
        assert!(dir.exists());
        dirs.acquire(uid).unwrap();
        dirs.release(uid);
        assert!(dir.exists(), "still referenced once");
        dirs.release(uid);
        assert!(!dir.exists());
    }
}
