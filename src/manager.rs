//! Owns the three primary tables — Seats, Sessions, Leaders — and serves
//! every client request (spec §4.1). Generic over the top-level event-loop
//! state `D` the same way [`crate::inhibit::InhibitManager`] is, so timers
//! it arms (the pause-devices grace timer, the pipeline delay timer) can
//! re-enter through [`ManagerHandler`] without aliasing `&mut D`.

use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::SeatConfig;
use crate::database::Database;
use crate::error::{Error, Kind, Result};
use crate::eventlog::{Event as LogEvent, EventLog};
use crate::idle::IdleMonitor;
use crate::inhibit::{InhibitHandler, InhibitManager, LockMode, What};
use crate::pipeline::{Action, AuthVerdict, Pipeline};
use crate::process_group::ProcessGroup;
use crate::runtime_dir::RuntimeDirs;
use crate::seat::{Election, Seat, SeatKind, SeatSessionFacts};
use crate::session::leader::{Cookie, Leaders, SessionLeader, SessionParams};
use crate::session::{PauseReason, Session, SessionEvent};
use crate::sysdeps::process;

/// Signals the bus layer must emit after a Manager call returns, drained
/// the same way [`crate::inhibit::InhibitManager`] reports its edges.
pub enum ManagerEvent {
    SeatAdded(String),
    SeatRemoved(String),
    SessionNew(String),
    SessionRemoved(String),
    PrepareForShutdown(bool),
    PrepareForSleep(bool),
    SystemIdleHintChanged(bool),
    SeatActiveSessionChanged(String, Option<String>),
    SeatSessionAdded(String, String),
    SeatSessionRemoved(String, String),
    SessionActiveChanged(String, bool),
    SessionIdleHintChanged(String, bool),
    SessionLockedHintChanged(String, bool),
    SessionLock(String),
    SessionUnlock(String),
    SessionPauseDevice(String, u32, u32, PauseReason),
    SessionResumeDevice(String, u32, u32, OwnedFd),
}

pub trait ManagerHandler: Sized + 'static + InhibitHandler {
    fn manager_mut(&mut self) -> &mut Manager<Self>;

    /// Send whatever `Manager::drain_events()` now holds out over the bus.
    /// Timer callbacks armed by the Manager itself (the pause-devices grace
    /// timer, the pipeline delay timer) run outside of `Bus::dispatch` and
    /// so must flush explicitly once they're done mutating state.
    fn flush_manager_events(&mut self);
}

pub struct Manager<D: ManagerHandler> {
    // `IndexMap` rather than `HashMap`: `GetSeats`/`GetSessions` enumerate in
    // insertion order, matching the creation-order listing logind-family
    // daemons give callers rather than an arbitrary hash order.
    seats: IndexMap<String, Seat>,
    sessions: IndexMap<String, Session>,
    leaders: Leaders,
    inhibit: InhibitManager<D>,
    process_group: ProcessGroup,
    runtime_dirs: RuntimeDirs,
    database: Database,
    eventlog: EventLog,
    idle: IdleMonitor,
    pipeline: Pipeline,
    scripts_dir: PathBuf,
    loop_handle: LoopHandle<'static, D>,
    next_session_num: u64,
    next_dynamic_seat_num: u64,
    pending_events: Vec<ManagerEvent>,
    pause_timers: HashMap<String, RegistrationToken>,
    last_system_idle_hint: Option<bool>,
    vt_handshake_owner: Option<String>,
}

impl<D: ManagerHandler> Manager<D> {
    pub fn new(
        loop_handle: LoopHandle<'static, D>,
        inhibit: InhibitManager<D>,
        rundir: impl AsRef<Path>,
        scripts_dir: PathBuf,
        static_seats: Vec<SeatConfig>,
    ) -> Manager<D> {
        let rundir = rundir.as_ref();
        let mut seats = IndexMap::new();
        for config in static_seats {
            let kind = config.kind.into();
            seats.insert(config.id.clone(), Seat::new(config.id, kind));
        }
        seats.entry("seat0".to_string()).or_insert_with(|| Seat::new("seat0".to_string(), SeatKind::StaticText));

        Manager {
            seats,
            sessions: IndexMap::new(),
            leaders: Leaders::default(),
            inhibit,
            process_group: ProcessGroup::new(),
            runtime_dirs: RuntimeDirs::new(rundir),
            database: Database::new(rundir),
            eventlog: EventLog::new(Path::new("/var/log/ConsoleKit/history")),
            idle: IdleMonitor::default(),
            pipeline: Pipeline::default(),
            scripts_dir,
            loop_handle,
            next_session_num: 1,
            next_dynamic_seat_num: 0,
            pending_events: Vec::new(),
            pause_timers: HashMap::new(),
            last_system_idle_hint: None,
            vt_handshake_owner: None,
        }
    }

    pub fn drain_events(&mut self) -> Vec<ManagerEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn inhibit_manager(&mut self) -> &mut InhibitManager<D> {
        &mut self.inhibit
    }

    pub fn session(&self, ssid: &str) -> Option<&Session> {
        self.sessions.get(ssid)
    }
    pub fn seat(&self, id: &str) -> Option<&Seat> {
        self.seats.get(id)
    }
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
    pub fn seats(&self) -> impl Iterator<Item = &Seat> {
        self.seats.values()
    }

    // ---- OpenSession / CloseSession -------------------------------------

    /// `OpenSession`/`OpenSessionWithParameters` (spec §4.1). `trusted`
    /// parameters skip asynchronous collection and may assert `is-local`,
    /// subject to the locality-proof rule in §4.1.1.
    pub fn open_session(&mut self, caller_bus_name: &str, caller_pid: u32, caller_uid: u32, mut params: SessionParams, trusted: bool) -> Result<Cookie> {
        if !trusted {
            params.is_local = None;
            self.collect_process_params(caller_pid, &mut params);
        }
        if let Some(true) = params.is_local {
            let login_id = params.login_session_id.as_deref();
            let has_local_sibling = login_id.is_some()
                && self
                    .sessions
                    .values()
                    .any(|s| s.is_local() && s.login_session_id() == login_id);
            if !has_local_sibling {
                params.is_local = Some(false);
            }
        }

        let ssid = format!("Session{}", self.next_session_num);
        self.next_session_num += 1;
        let cookie = Cookie::generate();

        let seat_id = self.choose_seat_for(&params);
        let mut session = Session::new(ssid.clone(), caller_uid, cookie.clone(), seat_id.clone(), params);

        self.process_group.create(caller_pid, &ssid, caller_uid);
        let rundir = self.runtime_dirs.acquire(caller_uid).map_err(|e| Error::failed(e.to_string()))?;
        session.set_runtime_dir(rundir);
        if let Some(device) = session.display_device().map(str::to_string) {
            self.idle.watch(&ssid, PathBuf::from(device));
        }

        self.seats.entry(seat_id.clone()).or_insert_with(|| Seat::new(seat_id.clone(), SeatKind::Dynamic));
        let seat = self.seats.get_mut(&seat_id).unwrap();
        seat.add_session(&ssid);

        self.eventlog.record(LogEvent::SessionOpen { ssid: &ssid, uid: caller_uid, seat: &seat_id });
        self.sessions.insert(ssid.clone(), session);
        self.pending_events.push(ManagerEvent::SessionNew(ssid.clone()));
        self.pending_events.push(ManagerEvent::SeatSessionAdded(seat_id, ssid.clone()));

        self.leaders.insert(SessionLeader {
            cookie: cookie.clone(),
            pid: caller_pid,
            uid: caller_uid,
            bus_name: caller_bus_name.to_string(),
            proposed_ssid: ssid,
            params: SessionParams::default(),
        });
        self.maybe_emit_system_idle_hint();
        self.dump_database();
        Ok(cookie)
    }

    /// Plain `OpenSession`'s asynchronous parameter-collection step (spec
    /// §4.1): the daemon, not the caller, is the authority on a session's
    /// tty and login-session-id, recovered by reading the leader process's
    /// own `/proc` entries rather than trusting whatever the caller claims.
    /// Fields the caller already supplied (there are none on the plain
    /// `OpenSession` path, but `OpenSessionWithParameters` reuses this for
    /// its untrusted variant too) are left untouched.
    fn collect_process_params(&self, pid: u32, params: &mut SessionParams) {
        if params.display_device.is_none() {
            if let Some(tty) = process::controlling_tty(pid) {
                if let Some(vtnr) = vtnr_from_tty(&tty) {
                    params.vtnr = params.vtnr.or(Some(vtnr));
                }
                params.display_device = Some(tty);
            }
        }
        if params.login_session_id.is_none() {
            params.login_session_id = process::read_process_env(pid, "XDG_SESSION_ID");
        }
    }

    /// Session-to-seat matching rule, spec §4.3: a local static-x11 or
    /// static-text session with a VT attaches to `seat0`; everything else
    /// gets its own fresh dynamic seat.
    fn choose_seat_for(&mut self, params: &SessionParams) -> String {
        let static_x11 = params.x11_display.is_some()
            && params.x11_display_device.is_some()
            && params.remote_host_name.is_none()
            && params.is_local.unwrap_or(false);
        let static_text = params.display_device.is_some()
            && params.x11_display.is_none()
            && params.x11_display_device.is_none()
            && params.remote_host_name.is_none()
            && params.is_local.unwrap_or(false);
        let vtnr = params.vtnr.unwrap_or(0);
        if (static_x11 || static_text) && vtnr > 0 {
            "seat0".to_string()
        } else {
            let id = format!("seat-dyn{}", self.next_dynamic_seat_num);
            self.next_dynamic_seat_num += 1;
            id
        }
    }

    /// `CloseSession(cookie)` (spec §4.1).
    pub fn close_session(&mut self, cookie: &Cookie, caller_uid: u32, caller_pid: u32) -> Result<()> {
        let leader = self.leaders.get(cookie).ok_or_else(|| Error::new(Kind::General, "unknown cookie"))?;
        if leader.uid != caller_uid || leader.pid != caller_pid {
            return Err(Error::new(Kind::InsufficientPermission, "caller does not own this session"));
        }
        let ssid = leader.proposed_ssid.clone();
        self.leaders.remove(cookie);
        self.close_session_by_id(&ssid)
    }

    /// A bus peer vanished (name-owner-changed to no owner). Per spec §3 a
    /// `SessionLeader` lives "until `CloseSession` or peer disconnect", and
    /// per §4.2 controller loss is "peer disconnect or `ReleaseControl`" —
    /// both are driven from the same bus event, so the Manager handles
    /// both here rather than asking the bus layer to know which table a
    /// vanished name belonged to.
    pub fn handle_peer_gone(&mut self, bus_name: &str) {
        for leader in self.leaders.remove_by_bus_name(bus_name) {
            let _ = self.close_session_by_id(&leader.proposed_ssid);
        }
        let controlled: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.controller() == Some(bus_name))
            .map(|(ssid, _)| ssid.clone())
            .collect();
        for ssid in controlled {
            self.release_control(&ssid);
        }
    }

    fn close_session_by_id(&mut self, ssid: &str) -> Result<()> {
        let Some(mut session) = self.sessions.shift_remove(ssid) else {
            return Ok(());
        };
        session.begin_close();
        let uid = session.uid();
        let seat_id = session.seat_id().to_string();

        if let Some(seat) = self.seats.get_mut(&seat_id) {
            seat.remove_session(ssid);
            self.pending_events.push(ManagerEvent::SeatSessionRemoved(seat_id.clone(), ssid.to_string()));
            if seat.kind() == SeatKind::Dynamic && seat.is_empty() {
                self.seats.shift_remove(&seat_id);
                self.pending_events.push(ManagerEvent::SeatRemoved(seat_id.clone()));
            }
        }
        self.idle.unwatch(ssid);
        self.process_group.remove(ssid);

        let still_has_sessions = self.sessions.values().any(|s| s.uid() == uid);
        if !still_has_sessions {
            self.runtime_dirs.release(uid);
        }

        self.eventlog.record(LogEvent::SessionClose { ssid, uid, seat: &seat_id });
        self.pending_events.push(ManagerEvent::SessionRemoved(ssid.to_string()));
        self.maybe_emit_system_idle_hint();
        self.dump_database();
        Ok(())
    }

    // ---- Resolution -------------------------------------------------------

    pub fn session_for_cookie(&self, cookie: &Cookie) -> Result<&str> {
        let leader = self.leaders.get(cookie).ok_or_else(|| Error::new(Kind::General, "unknown cookie"))?;
        Ok(&leader.proposed_ssid)
    }

    /// `GetSessionForUnixProcess`: process-group tagger first, then the
    /// `XDG_SESSION_COOKIE` environment fallback (spec §4.1).
    pub fn session_for_unix_process(&self, pid: u32) -> Result<&str> {
        if let Some(ssid) = self.process_group.get_ssid(pid) {
            if self.sessions.contains_key(&ssid) {
                return Ok(self.sessions.get_key_value(&ssid).unwrap().0);
            }
        }
        if let Some(cookie) = process::read_process_env(pid, "XDG_SESSION_COOKIE") {
            if let Ok(ssid) = self.session_for_cookie(&Cookie::from_str_value(&cookie)) {
                return Ok(ssid);
            }
        }
        Err(Error::new(Kind::NoSessions, "no session found for process"))
    }

    // ---- Activation ---------------------------------------------------

    /// `ActivateSession(ssid)`/`ActivateSessionOnSeat` forward to the Seat,
    /// translating the session's display device into a VT number.
    pub fn activate_session(&mut self, ssid: &str) -> Result<i32> {
        let session = self.sessions.get(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        let seat_id = session.seat_id().to_string();
        let seat = self.seats.get(&seat_id).ok_or_else(|| Error::new(Kind::General, "unknown seat"))?;
        if !seat.kind().is_static() {
            return Err(Error::new(Kind::NotSupported, "only static seats support activation"));
        }
        if seat.active_session() == Some(ssid) {
            return Err(Error::new(Kind::AlreadyActive, "session is already active"));
        }
        let vt = session.vtnr();
        if vt == 0 {
            return Err(Error::new(Kind::NotSupported, "session has no VT"));
        }
        Ok(vt as i32)
    }

    /// Drives the election after the VT monitor reports a switch to `vt`
    /// (spec §4.3 Election), running the activation dance on the winner and
    /// demotion on the loser.
    pub fn elect_active_session_on_vt(&mut self, vt: i32) {
        let seat_ids: Vec<String> = self.seats.keys().cloned().collect();
        for seat_id in seat_ids {
            let Some(seat) = self.seats.get(&seat_id) else { continue };
            if !seat.kind().is_static() {
                continue;
            }
            let facts: Vec<SeatSessionFacts> = self
                .sessions
                .values()
                .filter(|s| s.seat_id() == seat_id)
                .map(|s| SeatSessionFacts {
                    id: s.id().to_string(),
                    display_device: s.display_device().map(str::to_string),
                    x11_display_device: s.x11_display_device().map(str::to_string),
                    creation_time: s.creation_time(),
                })
                .collect();
            let election = seat.elect(vt, facts.iter());
            let Election::Switch { old, new } = election else { continue };

            if let Some(old_ssid) = &old {
                if let Some(session) = self.sessions.get_mut(old_ssid) {
                    let events = session.begin_deactivate();
                    self.dispatch_session_events(old_ssid, events);
                }
            }
            if let Some(session) = self.sessions.get_mut(&new) {
                let events = session.activate_devices();
                self.dispatch_session_events(&new, events);
            }
            if let Some(seat) = self.seats.get_mut(&seat_id) {
                seat.set_active(Some(new.clone()));
            }
            self.pending_events.push(ManagerEvent::SeatActiveSessionChanged(seat_id.clone(), Some(new.clone())));
            self.eventlog.record(LogEvent::SeatActiveSessionChanged { seat: &seat_id, ssid: Some(&new) });
            self.dump_database();
        }
    }

    fn dispatch_session_events(&mut self, ssid: &str, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::ActiveChanged(active) => self.pending_events.push(ManagerEvent::SessionActiveChanged(ssid.to_string(), active)),
                SessionEvent::IdleHintChanged(idle) => self.pending_events.push(ManagerEvent::SessionIdleHintChanged(ssid.to_string(), idle)),
                SessionEvent::LockedHintChanged(locked) => self.pending_events.push(ManagerEvent::SessionLockedHintChanged(ssid.to_string(), locked)),
                SessionEvent::Lock => self.pending_events.push(ManagerEvent::SessionLock(ssid.to_string())),
                SessionEvent::Unlock => self.pending_events.push(ManagerEvent::SessionUnlock(ssid.to_string())),
                SessionEvent::PauseDevice(major, minor, reason) => {
                    self.pending_events.push(ManagerEvent::SessionPauseDevice(ssid.to_string(), major, minor, reason))
                }
                SessionEvent::ResumeDevice(major, minor, fd) => self.pending_events.push(ManagerEvent::SessionResumeDevice(ssid.to_string(), major, minor, fd)),
                SessionEvent::ArmPauseTimer => self.arm_pause_timer(ssid),
                SessionEvent::CancelPauseTimer => self.cancel_pause_timer(ssid),
            }
        }
    }

    fn arm_pause_timer(&mut self, ssid: &str) {
        self.cancel_pause_timer(ssid);
        let ssid_owned = ssid.to_string();
        let token = self.loop_handle.insert_source(Timer::from_duration(Duration::from_secs(3)), move |_, _, state: &mut D| {
            let manager = state.manager_mut();
            manager.pause_timers.remove(&ssid_owned);
            if let Some(session) = manager.sessions.get_mut(&ssid_owned) {
                let events = session.force_deactivate();
                manager.dispatch_session_events(&ssid_owned, events);
            }
            state.flush_manager_events();
            TimeoutAction::Drop
        });
        if let Ok(token) = token {
            self.pause_timers.insert(ssid.to_string(), token);
        }
    }

    fn cancel_pause_timer(&mut self, ssid: &str) {
        if let Some(token) = self.pause_timers.remove(ssid) {
            self.loop_handle.remove(token);
        }
    }

    // ---- Device hand-off --------------------------------------------------

    pub fn take_device(&mut self, ssid: &str, caller_bus_name: &str, major: u32, minor: u32) -> Result<(OwnedFd, bool)> {
        let session = self.sessions.get_mut(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        if session.controller() != Some(caller_bus_name) {
            return Err(Error::new(Kind::InsufficientPermission, "caller is not the session controller"));
        }
        let path = device_node_path(major, minor);
        session.take_device(&path, major, minor)
    }

    pub fn release_device(&mut self, ssid: &str, caller_bus_name: &str, major: u32, minor: u32) -> Result<()> {
        let session = self.sessions.get_mut(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        if session.controller() != Some(caller_bus_name) {
            return Err(Error::new(Kind::InsufficientPermission, "caller is not the session controller"));
        }
        session.release_device(major, minor)
    }

    pub fn pause_device_complete(&mut self, ssid: &str, caller_bus_name: &str, major: u32, minor: u32) -> Result<()> {
        let session = self.sessions.get_mut(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        if session.controller() != Some(caller_bus_name) {
            return Err(Error::new(Kind::InsufficientPermission, "caller is not the session controller"));
        }
        let events = session.pause_device_complete(major, minor);
        self.dispatch_session_events(ssid, events);
        Ok(())
    }

    pub fn take_control(&mut self, ssid: &str, caller_bus_name: &str, caller_uid: u32, force: bool) -> Result<()> {
        let session = self.sessions.get_mut(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        let displaced_events = session.take_control(caller_bus_name, caller_uid, force)?;
        let deposed_active = displaced_events.iter().any(|e| matches!(e, SessionEvent::ActiveChanged(false)));
        if session.vtnr() > 0 {
            // Two real-time signal numbers, reserved for this handshake alone
            // (spec §4.2); delivered through the shared signalfd the event
            // loop already watches, so no POSIX handler needs installing.
            let relsig = libc::SIGRTMIN();
            let acqsig = relsig + 1;
            session.setup_vt_handshake(relsig, acqsig);
            self.vt_handshake_owner = Some(ssid.to_string());
        }
        let seat_id = session.seat_id().to_string();
        self.dispatch_session_events(ssid, displaced_events);
        // A force-replace that evicted an active controller demotes the
        // session (spec §8 "at most one active=true per seat, consistently
        // reported"); keep the seat's own pointer from still naming it.
        if deposed_active {
            if let Some(seat) = self.seats.get_mut(&seat_id) {
                if seat.active_session() == Some(ssid) {
                    seat.set_active(None);
                }
            }
        }
        Ok(())
    }

    /// The session currently holding process-mode VT-switch ownership, if
    /// any — the signal router uses this to know which session's tty to
    /// ack (spec §4.2 "VT process-mode handshake").
    pub fn vt_handshake_owner(&self) -> Option<&str> {
        self.vt_handshake_owner.as_deref()
    }

    /// The kernel's release-request signal fired: forcibly pause the
    /// owning session's devices, then the caller acks `VT_RELDISP, 1`.
    pub fn handle_vt_release_request(&mut self) -> Option<std::os::unix::io::RawFd> {
        let ssid = self.vt_handshake_owner.clone()?;
        let session = self.sessions.get_mut(&ssid)?;
        let tty_fd = session.tty_fd();
        let events = session.handle_vt_release_request();
        self.dispatch_session_events(&ssid, events);
        tty_fd
    }

    /// The kernel's acquire signal fired: the caller acks `VT_RELDISP,
    /// VT_ACKACQ`; the Seat's election (driven by the VT monitor, not this
    /// signal) is what actually promotes the session back to active.
    pub fn vt_handshake_tty(&self) -> Option<std::os::unix::io::RawFd> {
        let ssid = self.vt_handshake_owner.as_ref()?;
        self.sessions.get(ssid)?.tty_fd()
    }

    pub fn release_control(&mut self, ssid: &str) {
        if self.vt_handshake_owner.as_deref() == Some(ssid) {
            self.vt_handshake_owner = None;
        }
        if let Some(session) = self.sessions.get_mut(ssid) {
            let events = session.release_control();
            self.dispatch_session_events(ssid, events);
        }
    }

    // ---- Idle-hint aggregation ---------------------------------------

    pub fn set_idle_hint(&mut self, ssid: &str, caller_uid: u32, idle: bool) -> Result<()> {
        let session = self.sessions.get_mut(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        if session.uid() != caller_uid {
            return Err(Error::new(Kind::InsufficientPermission, "caller does not own this session"));
        }
        if let Some(event) = session.set_idle_hint(idle) {
            self.dispatch_session_events(ssid, vec![event]);
        }
        self.maybe_emit_system_idle_hint();
        Ok(())
    }

    pub fn poll_idle(&mut self) {
        let changes = self.idle.poll();
        for (ssid, idle) in changes {
            if let Some(session) = self.sessions.get_mut(&ssid) {
                if let Some(event) = session.set_idle_hint(idle) {
                    self.dispatch_session_events(&ssid, vec![event]);
                }
            }
        }
        self.maybe_emit_system_idle_hint();
    }

    fn maybe_emit_system_idle_hint(&mut self) {
        let hint = self.system_idle_hint();
        if self.last_system_idle_hint != Some(hint) {
            self.last_system_idle_hint = Some(hint);
            self.pending_events.push(ManagerEvent::SystemIdleHintChanged(hint));
        }
    }

    /// System-idle iff every session is idle (spec §4.1
    /// `GetSystemIdleHint`); an empty session table is not idle.
    pub fn system_idle_hint(&self) -> bool {
        !self.sessions.is_empty() && self.sessions.values().all(|s| s.idle_hint())
    }

    /// `GetSystemIdleSinceHint`: the most recent time any still-idle
    /// session became idle, i.e. the moment the whole system most recently
    /// crossed into the all-idle state.
    pub fn system_idle_since_hint(&self) -> Option<std::time::SystemTime> {
        if !self.system_idle_hint() {
            return None;
        }
        self.sessions.values().filter_map(|s| s.idle_since()).max()
    }

    /// `LockSession`/`UnlockSession` (spec §4.1): only the owning uid may
    /// flip its own session's locked-hint.
    pub fn set_locked_hint(&mut self, ssid: &str, caller_uid: u32, locked: bool) -> Result<()> {
        let session = self.sessions.get_mut(ssid).ok_or_else(|| Error::new(Kind::General, "unknown session"))?;
        if session.uid() != caller_uid {
            return Err(Error::new(Kind::InsufficientPermission, "caller does not own this session"));
        }
        let events = session.set_locked_hint(locked);
        self.dispatch_session_events(ssid, events);
        Ok(())
    }

    // ---- Inhibit -----------------------------------------------------

    pub fn inhibit(&mut self, who: String, what: &str, why: String, mode: &str, uid: u32, pid: u32) -> Result<OwnedFd> {
        let fd = self.inhibit.create_lock(who, what, why, mode, uid, pid)?;
        // `ChangedEvent` edges are dispatched by the caller through
        // `InhibitHandler::inhibit_changed` (the FIFO-HUP path reaches the
        // same callback); draining here would double-fire that signal, so
        // `create_lock`'s edges are left for the bus layer to read off
        // `InhibitManager::drain_edges` itself once this call returns.
        Ok(fd)
    }

    pub fn list_inhibitors(&self) -> Result<Vec<(&str, &str, String, &str, u32, u32)>> {
        if self.inhibit.is_empty() {
            return Err(Error::new(Kind::NothingInhibited, "no inhibitors held"));
        }
        Ok(self
            .inhibit
            .list()
            .map(|lock| {
                (
                    lock.who(),
                    lock.why(),
                    lock.what().format(),
                    match lock.mode() {
                        LockMode::Block => "block",
                        LockMode::Delay => "delay",
                    },
                    lock.uid(),
                    lock.pid(),
                )
            })
            .collect())
    }

    // ---- System-action pipeline ---------------------------------------

    /// Steps 1-4 of spec §4.1.2; the caller supplies the authorisation
    /// verdict since the predicate itself is an external collaborator.
    pub fn start_action(&mut self, action: Action, verdict: AuthVerdict) -> Result<()> {
        let event = action.inhibit_event();
        let block_count = self.inhibit_count(LockMode::Block, event);
        let delay_count = self.inhibit_count(LockMode::Delay, event);
        let delay = self.pipeline.start(action, verdict, block_count, delay_count, self.scripts_dir.clone())?;

        match action.prepare_kind() {
            crate::pipeline::PrepareKind::Shutdown => self.pending_events.push(ManagerEvent::PrepareForShutdown(true)),
            crate::pipeline::PrepareKind::Sleep => self.pending_events.push(ManagerEvent::PrepareForSleep(true)),
        }
        self.arm_action_timer(delay);
        Ok(())
    }

    fn inhibit_count(&self, mode: LockMode, what: What) -> u32 {
        what_bit_indices(what).map(|i| self.inhibit.count(mode, i)).max().unwrap_or(0)
    }

    fn arm_action_timer(&mut self, delay: Duration) {
        let token = self.loop_handle.insert_source(Timer::from_duration(delay), |_, _, state: &mut D| {
            state.manager_mut().fire_action();
            state.flush_manager_events();
            TimeoutAction::Drop
        });
        if let Ok(token) = token {
            self.pipeline.set_timer_token(token);
        }
    }

    /// The last DELAY inhibitor for the in-flight action released before
    /// the timer expired: cancel the wait and run the fire path now
    /// (spec §4.1.2 step 5).
    pub fn maybe_fast_forward_action(&mut self) {
        let Some(action) = self.pipeline.current() else { return };
        let event = action.inhibit_event();
        if self.inhibit_count(LockMode::Delay, event) == 0 {
            if let Some(token) = self.pipeline.take_timer_token() {
                self.loop_handle.remove(token);
            }
            self.fire_action();
        }
    }

    fn fire_action(&mut self) {
        let Some(action) = self.pipeline.current() else { return };
        let script = self.scripts_dir.join(action.script_name());
        match std::process::Command::new(&script).status() {
            Ok(status) if status.success() => debug!(script = %script.display(), "system action script exited cleanly"),
            Ok(status) => warn!(script = %script.display(), code = ?status.code(), "system action script exited non-zero"),
            Err(err) => warn!(%err, script = %script.display(), "failed to spawn system action script"),
        }
        // Always emitted, even on failure (spec §9 open question (b)).
        match action.prepare_kind() {
            crate::pipeline::PrepareKind::Shutdown => self.pending_events.push(ManagerEvent::PrepareForShutdown(false)),
            crate::pipeline::PrepareKind::Sleep => self.pending_events.push(ManagerEvent::PrepareForSleep(false)),
        }
        self.pipeline.finish();
    }

    pub fn can_start_action(&self) -> bool {
        self.pipeline.can_start()
    }

    fn dump_database(&self) {
        if let Err(err) = self.database.dump(self.seats.values(), self.sessions.values()) {
            warn!(%err, "failed to write database snapshot");
        }
    }
}

/// Parses `/dev/ttyN` into the VT number `N`, if the path is in that form.
fn vtnr_from_tty(path: &str) -> Option<u32> {
    path.strip_prefix("/dev/tty")?.parse().ok()
}

fn what_bit_indices(what: What) -> impl Iterator<Item = usize> {
    (0..crate::inhibit::EVENT_COUNT).filter(move |&i| what.bits() & (1 << i) != 0)
}

/// Conventional Linux minor-number layout: DRM primary node minors and
/// evdev event minors both count from a fixed offset. Without a udev
/// dependency this is the best approximation available; a real deployment
/// may need a lookup table here instead (see DESIGN.md).
fn device_node_path(major: u32, minor: u32) -> PathBuf {
    const DRM_MAJOR: u32 = 226;
    const INPUT_MAJOR: u32 = 13;
    const EVDEV_MINOR_BASE: u32 = 64;
    if major == DRM_MAJOR {
        PathBuf::from(format!("/dev/dri/card{minor}"))
    } else if major == INPUT_MAJOR {
        PathBuf::from(format!("/dev/input/event{}", minor.saturating_sub(EVDEV_MINOR_BASE)))
    } else {
        PathBuf::from(format!("/dev/char/{major}:{minor}"))
    }
}

#[cfg(test)]
mod test {
    use calloop::EventLoop;

    use super::*;
    use crate::pipeline::{Action, AuthVerdict};

    /// Stands in for `Daemon` (`src/main.rs`): the minimal event-loop state
    /// a `Manager`/`InhibitManager` pair needs to exist at all, built the
    /// same way `wayland::idle_notify`'s own doctests drive an
    /// `IdleNotifierHandler` in isolation — a real `calloop::EventLoop` plus
    /// a handler that just forwards to the fields under test.
    struct Harness {
        manager: Manager<Harness>,
    }

    impl ManagerHandler for Harness {
        fn manager_mut(&mut self) -> &mut Manager<Harness> {
            &mut self.manager
        }
        fn flush_manager_events(&mut self) {
            self.manager.drain_events();
        }
    }

    impl InhibitHandler for Harness {
        fn inhibit_manager(&mut self) -> &mut InhibitManager<Harness> {
            self.manager.inhibit_manager()
        }
        fn inhibit_changed(&mut self, _mode: LockMode, _event_index: usize, _enabled: bool) {}
    }

    fn harness(tmp: &Path) -> (EventLoop<'static, Harness>, Harness) {
        let event_loop: EventLoop<'static, Harness> = EventLoop::try_new().unwrap();
        let handle = event_loop.handle();
        let inhibit = InhibitManager::new(tmp.join("inhibit"), handle.clone()).unwrap();
        let manager = Manager::new(handle, inhibit, tmp, tmp.join("scripts"), Vec::new());
        (event_loop, Harness { manager })
    }

    // ---- Open/close (spec §8 scenario 1) ------------------------------

    #[test]
    fn open_then_close_round_trips_the_cookie() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let cookie = h.manager.open_session(":1.1", 100, 1000, SessionParams::default(), false).unwrap();
        let ssid = h.manager.session_for_cookie(&cookie).unwrap().to_string();
        assert_eq!(ssid, "Session1");
        assert!(h.manager.session(&ssid).is_some());

        h.manager.close_session(&cookie, 1000, 100).unwrap();
        assert!(h.manager.session_for_cookie(&cookie).is_err());
        assert!(h.manager.session(&ssid).is_none());
    }

    // ---- Cookie spoofing rejected (spec §8 scenario 6) -----------------

    #[test]
    fn close_session_rejects_a_caller_who_does_not_own_it() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let cookie = h.manager.open_session(":1.1", 100, 1000, SessionParams::default(), false).unwrap();
        let err = h.manager.close_session(&cookie, 1001, 100).unwrap_err();
        assert_eq!(err.kind, Kind::InsufficientPermission);
        assert!(h.manager.session_for_cookie(&cookie).is_ok(), "a rejected close must leave the session in place");
    }

    #[test]
    fn close_session_rejects_an_unknown_cookie() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let bogus = Cookie::from_raw("does-not-exist");
        let err = h.manager.close_session(&bogus, 1000, 100).unwrap_err();
        assert_eq!(err.kind, Kind::General);
    }

    // ---- Locality proof (spec §4.1.1, §8 "Locality monotonicity") -----

    #[test]
    fn a_trusted_assertion_with_no_local_sibling_is_forced_false() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let params = SessionParams {
            login_session_id: Some("login-1".to_string()),
            is_local: Some(true),
            ..Default::default()
        };
        let cookie = h.manager.open_session(":1.1", 100, 1000, params, true).unwrap();
        let ssid = h.manager.session_for_cookie(&cookie).unwrap().to_string();
        assert!(!h.manager.session(&ssid).unwrap().is_local());
    }

    #[test]
    fn an_untrusted_caller_can_never_self_assert_locality() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let params = SessionParams { is_local: Some(true), ..Default::default() };
        let cookie = h.manager.open_session(":1.1", 100, 1000, params, false).unwrap();
        let ssid = h.manager.session_for_cookie(&cookie).unwrap().to_string();
        assert!(!h.manager.session(&ssid).unwrap().is_local());
    }

    // ---- Block/delay inhibit gating (spec §8 scenarios 4, 5) -----------

    #[test]
    fn a_block_inhibitor_rejects_the_action_with_no_prepare_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let _fd = h.manager.inhibit("client-i".to_string(), "sleep", "testing".to_string(), "block", 1000, 200).unwrap();
        let err = h.manager.start_action(Action::Suspend, AuthVerdict::Allow).unwrap_err();
        assert_eq!(err.kind, Kind::Inhibited);
        assert!(h.manager.drain_events().is_empty());
    }

    #[test]
    fn a_delay_inhibitor_still_lets_the_action_start_and_emits_prepare() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let _fd = h.manager.inhibit("client-i".to_string(), "shutdown", "testing".to_string(), "delay", 1000, 200).unwrap();
        h.manager.start_action(Action::PowerOff, AuthVerdict::Allow).unwrap();
        let events = h.manager.drain_events();
        assert!(matches!(events.as_slice(), [ManagerEvent::PrepareForShutdown(true)]));
        assert!(!h.manager.can_start_action(), "a second action must see the pipeline busy");
    }

    #[test]
    fn a_denied_verdict_is_reported_without_touching_the_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let (_loop, mut h) = harness(tmp.path());

        let err = h.manager.start_action(Action::Reboot, AuthVerdict::Deny).unwrap_err();
        assert_eq!(err.kind, Kind::InsufficientPermission);
        assert!(h.manager.can_start_action());
    }
}
