//! Associates a session id with its leader process and descendants, so
//! `GetSessionForUnixProcess` keeps working after fork/exec/double-fork
//! (spec §4.6).
//!
//! Linux implementation: a cgroup (v1 `cpuset`-style named subdirectory, in
//! the spirit of the upstream `ck-process-group.c`, which keyed off a
//! similarly single-purpose grouping facility). Platforms without a usable
//! cgroup mount fall back silently: [`ProcessGroup::create`] becomes a
//! no-op and resolution falls through to the `XDG_SESSION_COOKIE`
//! environment-variable path the `Manager` already tries second.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const CGROUP_ROOT: &str = "/sys/fs/cgroup/consoled";

pub struct ProcessGroup {
    root: Option<PathBuf>,
}

impl ProcessGroup {
    /// Probes for a writable cgroup mount; absence is not an error, just a
    /// reduced-functionality mode (spec §4.6).
    pub fn new() -> ProcessGroup {
        let root = Path::new(CGROUP_ROOT);
        match fs::create_dir_all(root) {
            Ok(()) => Some(root.to_path_buf()),
            Err(err) => {
                warn!(%err, "no usable cgroup mount, process-group tagging disabled");
                None
            }
        }
        .map_or(ProcessGroup { root: None }, |root| ProcessGroup { root: Some(root) })
    }

    fn group_dir(&self, ssid: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(ssid))
    }

    /// `Create(pid, ssid, uid)`: place `pid` in a new group named `ssid`,
    /// chown it to `uid`, mark it auto-remove-on-empty.
    pub fn create(&mut self, pid: u32, ssid: &str, uid: u32) {
        let Some(dir) = self.group_dir(ssid) else {
            return;
        };
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(%err, ssid, "failed to create process group");
            return;
        }
        if let Err(err) = fs::write(dir.join("cgroup.procs"), pid.to_string()) {
            warn!(%err, ssid, pid, "failed to attach pid to process group");
            return;
        }
        // Best-effort; chown failing just means `ls` inside the session
        // directory looks wrong, it doesn't affect correctness.
        let _ = nix::unistd::chown(
            &dir,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(gid_of_uid(uid)),
        );
        debug!(ssid, pid, uid, "process group created");
    }

    /// `GetSsid(pid)`: returns the group name owning `pid`, skipping the
    /// root/unknown group.
    pub fn get_ssid(&self, pid: u32) -> Option<String> {
        let root = self.root.as_ref()?;
        let cgroup_line = fs::read_to_string(format!("/proc/{pid}/cgroup")).ok()?;
        for line in cgroup_line.lines() {
            // cgroup v1 lines look like "4:name=consoled:/Session2"; v2 is
            // "0::/Session2". Either way the last colon-delimited field is
            // the path inside the hierarchy.
            let path = line.rsplit(':').next()?;
            let path = path.trim_start_matches('/');
            if path.is_empty() {
                continue;
            }
            if root.join(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    /// Removes a session's group once it has no members left (called by the
    /// Manager on session teardown; the kernel also auto-removes empty
    /// cgroups, this just makes the filesystem tidy immediately).
    pub fn remove(&mut self, ssid: &str) {
        if let Some(dir) = self.group_dir(ssid) {
            let _ = fs::remove_dir(dir);
        }
    }
}

impl Default for ProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn gid_of_uid(uid: u32) -> nix::unistd::Gid {
    // The primary gid for a uid; falls back to the uid's numeric value as a
    // gid when NSS has nothing (matches what the upstream sysdeps shims do
    // for unknown users rather than failing the whole operation).
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.gid)
        .unwrap_or_else(|| nix::unistd::Gid::from_raw(uid))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_ssid_returns_none_without_a_cgroup_mount() {
        let pg = ProcessGroup { root: None };
        assert_eq!(pg.get_ssid(1), None);
    }
}
