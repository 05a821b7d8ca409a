//! Periodic snapshot of the daemon's state to an INI file under the runtime
//! directory, so tools that expect `ck-list-sessions`-style introspection
//! without a bus round-trip still have somewhere to look (spec §6, grounded
//! on `ck_manager_dump` in `ck-manager.c`: write to a `~`-suffixed temp file
//! then rename over the real one, so readers never see a partial write).

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::seat::Seat;
use crate::session::Session;

pub struct Database {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl Database {
    pub fn new(runtime_dir: impl AsRef<Path>) -> Database {
        let dir = runtime_dir.as_ref().join("ConsoleKit");
        Database {
            path: dir.join("database"),
            tmp_path: dir.join("database~"),
        }
    }

    /// Renders and atomically publishes the current snapshot. Called after
    /// every state-changing operation settles, same cadence as the upstream
    /// dump (on each signal emission batch, not on a fixed timer).
    pub fn dump<'a>(&self, seats: impl Iterator<Item = &'a Seat>, sessions: impl Iterator<Item = &'a Session>) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let seats: Vec<&Seat> = seats.collect();
        let sessions: Vec<&Session> = sessions.collect();
        let mut out = String::new();
        writeln!(out, "# Autogenerated, do not edit").ok();
        writeln!(out, "[Seats]").ok();
        writeln!(out, "seats={}", seats.len()).ok();
        for seat in &seats {
            writeln!(out, "\n[Seat {}]", seat.id()).ok();
            writeln!(out, "kind={:?}", seat.kind()).ok();
            if let Some(active) = seat.active_session() {
                writeln!(out, "active_session={active}").ok();
            }
            let ids: Vec<String> = seat.session_ids().map(|id| id.to_string()).collect();
            writeln!(out, "sessions={}", ids.join(";")).ok();
        }
        for session in &sessions {
            writeln!(out, "\n[Session {}]", session.id()).ok();
            writeln!(out, "uid={}", session.uid()).ok();
            writeln!(out, "seat={}", session.seat_id()).ok();
            writeln!(out, "active={}", session.is_active()).ok();
            writeln!(out, "idle_hint={}", session.idle_hint()).ok();
        }

        let mut uids: Vec<u32> = sessions.iter().map(|s| s.uid()).collect();
        uids.sort_unstable();
        uids.dedup();
        for uid in uids {
            let ssids: Vec<&str> = sessions.iter().filter(|s| s.uid() == uid).map(|s| s.id()).collect();
            writeln!(out, "\n[User {uid}]").ok();
            writeln!(out, "sessions={}", ssids.join(";")).ok();
        }

        fs::write(&self.tmp_path, out)?;
        fs::rename(&self.tmp_path, &self.path)?;
        debug!(path = %self.path.display(), "database dumped");
        Ok(())
    }
}
