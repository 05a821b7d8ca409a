//! Per-client inhibit locks and their aggregate counts (spec §4.4).
//!
//! The read end of each lock's FIFO is watched through calloop exactly the
//! way `backend/session/dbus/mod.rs` watches a dbus channel fd. Ownership of
//! the callback follows the handler-trait idiom `wayland::idle_notify` uses
//! for `IdleNotifierHandler`: the event-loop state type implements
//! [`InhibitHandler`] so the calloop callback can reach back into its own
//! `InhibitManager` field without holding two overlapping mutable borrows of
//! `state` at once.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode as IoMode, PostAction, RegistrationToken};
use indexmap::IndexMap;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode as StatMode;
use nix::unistd::{close, unlink};
use tracing::{debug, warn};

use crate::error::{Error, Kind, Result};

bitflags::bitflags! {
    /// The fixed vocabulary `what` is parsed from, one bit per event kind
    /// from spec §3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct What: u32 {
        const SHUTDOWN            = 0b0000001;
        const SLEEP               = 0b0000010;
        const IDLE                = 0b0000100;
        const HANDLE_POWER_KEY     = 0b0001000;
        const HANDLE_SUSPEND_KEY   = 0b0010000;
        const HANDLE_HIBERNATE_KEY = 0b0100000;
        const HANDLE_LID_SWITCH    = 0b1000000;
    }
}

/// Number of independent bits in [`What`]; also the width of each `Mode` row
/// of [`InhibitManager`]'s count matrix.
pub const EVENT_COUNT: usize = 7;

impl What {
    const TOKENS: [(&'static str, What); EVENT_COUNT] = [
        ("shutdown", What::SHUTDOWN),
        ("sleep", What::SLEEP),
        ("idle", What::IDLE),
        ("handle-power-key", What::HANDLE_POWER_KEY),
        ("handle-suspend-key", What::HANDLE_SUSPEND_KEY),
        ("handle-hibernate-key", What::HANDLE_HIBERNATE_KEY),
        ("handle-lid-switch", What::HANDLE_LID_SWITCH),
    ];

    /// Parses a colon-separated token list. Unknown tokens are dropped with
    /// a warning, not an error; a wholly-empty result after parsing is
    /// `InvalidInput` (spec §4.4 step 1).
    pub fn parse(raw: &str) -> Result<What> {
        let mut what = What::empty();
        for token in raw.split(':').filter(|t| !t.is_empty()) {
            match Self::TOKENS.iter().find(|(name, _)| *name == token) {
                Some((_, bit)) => what |= *bit,
                None => warn!(token, "unknown inhibit event token, ignoring"),
            }
        }
        if what.is_empty() {
            return Err(Error::new(Kind::InvalidInput, "no valid inhibit event tokens"));
        }
        Ok(what)
    }

    /// Inverse of [`What::parse`], colon-joined in table order so the
    /// round-trip is stable regardless of input order (spec §8).
    pub fn format(self) -> String {
        Self::TOKENS
            .iter()
            .filter(|(_, bit)| self.contains(*bit))
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(":")
    }

    fn set_bits(self) -> impl Iterator<Item = (usize, What)> {
        Self::TOKENS
            .into_iter()
            .enumerate()
            .filter(move |(_, (_, bit))| self.contains(*bit))
            .map(|(i, (_, bit))| (i, bit))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Block,
    Delay,
}

impl LockMode {
    pub fn parse(raw: &str) -> Result<LockMode> {
        match raw {
            "block" => Ok(LockMode::Block),
            "delay" => Ok(LockMode::Delay),
            _ => Err(Error::new(Kind::InvalidInput, format!("invalid inhibit mode {raw:?}"))),
        }
    }

    fn idx(self) -> usize {
        match self {
            LockMode::Block => 0,
            LockMode::Delay => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InhibitId(u64);

/// A single client's lock (spec §3 Inhibit).
pub struct Inhibit {
    who: String,
    why: String,
    what: What,
    mode: LockMode,
    uid: u32,
    pid: u32,
    fifo_path: PathBuf,
    read_fd: Option<OwnedFd>,
    token: Option<RegistrationToken>,
}

impl Inhibit {
    pub fn who(&self) -> &str {
        &self.who
    }
    pub fn why(&self) -> &str {
        &self.why
    }
    pub fn what(&self) -> What {
        self.what
    }
    pub fn mode(&self) -> LockMode {
        self.mode
    }
    pub fn uid(&self) -> u32 {
        self.uid
    }
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Implemented by the top-level event-loop state so [`InhibitManager`] can
/// register a HUP watch without capturing `&mut Self` in the watch closure
/// (which would alias the manager's own borrow). Mirrors
/// `wayland::idle_notify::IdleNotifierHandler`.
pub trait InhibitHandler: Sized + 'static {
    fn inhibit_manager(&mut self) -> &mut InhibitManager<Self>;

    /// Called once per (mode, event) bucket edge, immediately after the
    /// transition (spec §4.4's `ChangedEvent`).
    fn inhibit_changed(&mut self, mode: LockMode, event_index: usize, enabled: bool);
}

/// Owns every live [`Inhibit`] and the `counts[mode][event]` matrix (spec
/// §4.4).
pub struct InhibitManager<D: InhibitHandler> {
    dir: PathBuf,
    // `IndexMap` so `ListInhibitors` enumerates in creation order rather than
    // an arbitrary hash order (spec §4.1 enumeration).
    locks: IndexMap<InhibitId, Inhibit>,
    next_id: u64,
    counts: [[u32; EVENT_COUNT]; 2],
    loop_handle: LoopHandle<'static, D>,
    pending_edges: Vec<(LockMode, usize, bool)>,
}

impl<D: InhibitHandler> InhibitManager<D> {
    pub fn new(dir: PathBuf, loop_handle: LoopHandle<'static, D>) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        // Startup: unlink any leftover FIFOs from a previous, uncleanly
        // stopped instance (spec §6 filesystem surface).
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("inhibit.") && name.ends_with(".pipe") {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(InhibitManager {
            dir,
            locks: IndexMap::new(),
            next_id: 0,
            counts: [[0; EVENT_COUNT]; 2],
            loop_handle,
            pending_edges: Vec::new(),
        })
    }

    pub fn count(&self, mode: LockMode, bit_index: usize) -> u32 {
        self.counts[mode.idx()][bit_index]
    }

    /// `counts[mode]` is non-zero for any event in `what`.
    pub fn is_inhibited(&self, mode: LockMode, what: What) -> bool {
        what.set_bits().any(|(i, _)| self.counts[mode.idx()][i] > 0)
    }

    pub fn list(&self) -> impl Iterator<Item = &Inhibit> {
        self.locks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// `CreateLock` (spec §4.4). Returns the write-end fd to pass back to
    /// the caller as a passed fd; the lock itself is tracked internally by
    /// id and torn down on HUP or explicit [`InhibitManager::remove`].
    pub fn create_lock(
        &mut self,
        who: String,
        what_raw: &str,
        why: String,
        mode_raw: &str,
        uid: u32,
        pid: u32,
    ) -> Result<OwnedFd> {
        let what = What::parse(what_raw)?;
        let mode = LockMode::parse(mode_raw)?;

        let id = InhibitId(self.next_id);
        self.next_id += 1;

        let fifo_path = self.dir.join(format!("inhibit.{:06x}.pipe", id.0));
        nix::unistd::mkfifo(&fifo_path, StatMode::S_IRUSR | StatMode::S_IWUSR)
            .map_err(|e| Error::new(Kind::Oom, format!("mkfifo {fifo_path:?}: {e}")))?;

        let open_end = |flag: OFlag| -> Result<OwnedFd> {
            fcntl::open(&fifo_path, flag | OFlag::O_NONBLOCK, StatMode::empty())
                .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
                .map_err(|e| Error::failed(format!("open {fifo_path:?}: {e}")))
        };
        let read_fd = open_end(OFlag::O_RDONLY)?;
        let write_fd = open_end(OFlag::O_WRONLY)?;

        let source = Generic::new(read_fd.as_raw_fd(), Interest::READ, IoMode::Level);
        let token = self
            .loop_handle
            .insert_source(source, move |_, _, state: &mut D| {
                // Any readiness on the read end of a FIFO whose only writer
                // just closed means HUP: clients never write to an inhibit
                // pipe, the daemon only ever watches for its far end closing.
                state.inhibit_manager().remove(id);
                let edges = state.inhibit_manager().drain_edges();
                for (mode, index, enabled) in edges {
                    state.inhibit_changed(mode, index, enabled);
                }
                Ok(PostAction::Remove)
            })
            .ok();

        self.locks.insert(
            id,
            Inhibit {
                who,
                why,
                what,
                mode,
                uid,
                pid,
                fifo_path,
                read_fd: Some(read_fd),
                token,
            },
        );

        let lock = &self.locks[&id];
        debug!(id = id.0, who = %lock.who, ?mode, what = %lock.what.format(), "inhibit lock created");

        for (i, _) in what.set_bits() {
            self.counts[mode.idx()][i] += 1;
            if self.counts[mode.idx()][i] == 1 {
                self.pending_edges.push((mode, i, true));
            }
        }

        Ok(write_fd)
    }

    /// Idempotent teardown: HUP, explicit removal, and daemon shutdown all
    /// call this. Edges produced by the removal are queued in
    /// `pending_edges`; drain them with [`InhibitManager::drain_edges`] right
    /// after, from a context that holds an unconflicted `&mut D`.
    pub fn remove(&mut self, id: InhibitId) {
        let Some(lock) = self.locks.shift_remove(&id) else {
            return;
        };
        if let Some(token) = lock.token {
            self.loop_handle.remove(token);
        }
        if let Some(fd) = lock.read_fd {
            let _ = close(fd.as_raw_fd());
        }
        let _ = unlink(&lock.fifo_path);

        for (i, _) in lock.what.set_bits() {
            let row = &mut self.counts[lock.mode.idx()][i];
            if *row == 0 {
                warn!(event = i, "inhibit count underflow, resetting to zero");
                continue;
            }
            *row -= 1;
            if *row == 0 {
                self.pending_edges.push((lock.mode, i, false));
            }
        }
        debug!(id = id.0, "inhibit lock removed");
    }

    pub fn remove_all(&mut self) {
        let ids: Vec<_> = self.locks.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Drains (mode, event_index, enabled) edges queued by the last
    /// [`create_lock`]/[`remove`] call.
    pub fn drain_edges(&mut self) -> Vec<(LockMode, usize, bool)> {
        std::mem::take(&mut self.pending_edges)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn what_round_trips_through_parse_and_format() {
        let what = What::parse("shutdown:idle:shutdown").unwrap();
        assert_eq!(what, What::SHUTDOWN | What::IDLE);
        assert_eq!(What::parse(&what.format()).unwrap(), what);
    }

    #[test]
    fn unknown_tokens_are_dropped_not_fatal() {
        let what = What::parse("shutdown:bogus-token").unwrap();
        assert_eq!(what, What::SHUTDOWN);
    }

    #[test]
    fn empty_what_is_invalid_input() {
        assert!(What::parse("").is_err());
        assert!(What::parse("bogus-only").is_err());
    }

    #[test]
    fn mode_parses_block_and_delay_only() {
        assert_eq!(LockMode::parse("block").unwrap(), LockMode::Block);
        assert_eq!(LockMode::parse("delay").unwrap(), LockMode::Delay);
        assert!(LockMode::parse("bogus").is_err());
    }
}
