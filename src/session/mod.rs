//! A single user session, its device set, and the VT handshake around it
//! (spec §4.2). Plain data plus logic — no back-pointer to the loop or the
//! Manager; every state transition returns the [`SessionEvent`]s its caller
//! must dispatch (signal emission, timer arming), the way `Seat` and
//! `InhibitManager` report their own edges rather than reaching out
//! themselves.

pub mod leader;

use std::collections::BTreeMap;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{Error, Kind, Result};
use crate::sysdeps::vt::SavedTtyState;

pub use leader::{Cookie, Leaders, SessionLeader, SessionParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Online,
    Active,
    Closing,
}

/// Reasons a `PauseDevice` signal carries (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Pause,
    Force,
    Gone,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::Pause => "pause",
            PauseReason::Force => "force",
            PauseReason::Gone => "gone",
        }
    }
}

/// One fact the caller (the Manager) must dispatch after a Session method
/// returns: either a bus signal to emit or a timer to arm/cancel.
pub enum SessionEvent {
    ActiveChanged(bool),
    IdleHintChanged(bool),
    LockedHintChanged(bool),
    Lock,
    Unlock,
    PauseDevice(u32, u32, PauseReason),
    ResumeDevice(u32, u32, OwnedFd),
    /// Arm the 3-second pause-devices grace timer (spec §4.2 step 2).
    ArmPauseTimer,
    /// Every device acked pause before the grace timer fired; cancel it.
    CancelPauseTimer,
}

/// Immutable identity plus the small amount of state a controller can flip
/// on itself (spec §3 Session).
pub struct Session {
    id: String,
    uid: u32,
    cookie: Cookie,
    session_type: Option<String>,
    session_class: Option<String>,
    session_service: Option<String>,
    login_session_id: Option<String>,
    display_device: Option<String>,
    x11_display: Option<String>,
    x11_display_device: Option<String>,
    remote_host_name: Option<String>,
    is_local: bool,
    vtnr: u32,
    creation_time: SystemTime,
    seat_id: String,

    state: SessionState,
    active: bool,
    locked_hint: bool,
    idle_hint: bool,
    idle_since: Option<SystemTime>,
    runtime_dir: Option<PathBuf>,
    controller: Option<String>,
    devices: BTreeMap<(u32, u32), Device>,

    tty_fd: Option<std::os::unix::io::OwnedFd>,
    saved_tty: Option<SavedTtyState>,
    devices_pending_pause: usize,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(id: String, uid: u32, cookie: Cookie, seat_id: String, params: SessionParams) -> Session {
        Session {
            id,
            uid,
            cookie,
            session_type: params.session_type,
            session_class: params.session_class,
            session_service: params.session_service,
            login_session_id: params.login_session_id,
            display_device: params.display_device,
            x11_display: params.x11_display,
            x11_display_device: params.x11_display_device,
            remote_host_name: params.remote_host_name,
            is_local: params.is_local.unwrap_or(false),
            vtnr: params.vtnr.unwrap_or(0),
            creation_time: SystemTime::now(),
            seat_id,
            state: SessionState::Online,
            active: false,
            locked_hint: false,
            idle_hint: false,
            idle_since: None,
            runtime_dir: None,
            controller: None,
            devices: BTreeMap::new(),
            tty_fd: None,
            saved_tty: None,
            devices_pending_pause: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn uid(&self) -> u32 {
        self.uid
    }
    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }
    pub fn seat_id(&self) -> &str {
        &self.seat_id
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn is_active(&self) -> bool {
        self.active
    }
    pub fn idle_hint(&self) -> bool {
        self.idle_hint
    }
    pub fn idle_since(&self) -> Option<SystemTime> {
        self.idle_since
    }
    pub fn locked_hint(&self) -> bool {
        self.locked_hint
    }
    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }
    pub fn vtnr(&self) -> u32 {
        self.vtnr
    }
    pub fn is_local(&self) -> bool {
        self.is_local
    }
    pub fn login_session_id(&self) -> Option<&str> {
        self.login_session_id.as_deref()
    }
    pub fn display_device(&self) -> Option<&str> {
        self.display_device.as_deref()
    }
    pub fn x11_display_device(&self) -> Option<&str> {
        self.x11_display_device.as_deref()
    }
    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }
    pub fn set_runtime_dir(&mut self, dir: PathBuf) {
        self.runtime_dir = Some(dir);
    }
    pub fn runtime_dir(&self) -> Option<&PathBuf> {
        self.runtime_dir.as_ref()
    }

    /// Session-to-seat matching kind, spec §4.3.
    pub fn matches_static_x11(&self) -> bool {
        self.x11_display.is_some()
            && self.x11_display_device.is_some()
            && self.remote_host_name.is_none()
            && self.is_local
    }
    pub fn matches_static_text(&self) -> bool {
        self.display_device.is_some()
            && self.x11_display.is_none()
            && self.x11_display_device.is_none()
            && self.remote_host_name.is_none()
            && self.is_local
    }

    /// Once a local session exists with this `login_session_id`, a later
    /// session may inherit `is-local` (spec §4.1.1). Never the reverse.
    pub fn inherit_locality(&mut self, local_sibling_exists: bool) {
        if local_sibling_exists {
            self.is_local = true;
        }
    }

    pub fn set_idle_hint(&mut self, idle: bool) -> Option<SessionEvent> {
        if idle == self.idle_hint {
            return None;
        }
        self.idle_hint = idle;
        self.idle_since = idle.then(SystemTime::now);
        Some(SessionEvent::IdleHintChanged(idle))
    }

    pub fn set_locked_hint(&mut self, locked: bool) -> Vec<SessionEvent> {
        if locked == self.locked_hint {
            return Vec::new();
        }
        self.locked_hint = locked;
        let mut events = vec![SessionEvent::LockedHintChanged(locked)];
        events.push(if locked { SessionEvent::Lock } else { SessionEvent::Unlock });
        events
    }

    /// `TakeControl(force)` (spec §4.2). Returns whatever events the old
    /// controller's eviction produced (only non-empty on the force-replace
    /// arm) so the caller can dispatch them — otherwise a deposed active
    /// session's `ActiveChanged(false)` never reaches the bus, and the
    /// owning seat keeps pointing at a session that is no longer active.
    pub fn take_control(&mut self, caller_bus_name: &str, caller_uid: u32, force: bool) -> Result<Vec<SessionEvent>> {
        match &self.controller {
            None => {
                self.controller = Some(caller_bus_name.to_string());
                Ok(Vec::new())
            }
            Some(current) if current == caller_bus_name => Ok(Vec::new()),
            Some(_) if force && caller_uid == 0 => {
                // Spec §9 open question (a): revoke is synchronous with the
                // reply, so the old controller's fds are already gone by
                // the time this returns.
                let events = self.release_control();
                self.controller = Some(caller_bus_name.to_string());
                Ok(events)
            }
            Some(_) => Err(Error::new(Kind::InsufficientPermission, "session already has a controller")),
        }
    }

    /// Controller loss: peer disconnect or explicit `ReleaseControl`. All
    /// devices release, any VT signal handler tears down, session demotes
    /// to `online`.
    pub fn release_control(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let ids: Vec<(u32, u32)> = self.devices.keys().copied().collect();
        for (major, minor) in ids {
            self.devices.remove(&(major, minor));
            events.push(SessionEvent::PauseDevice(major, minor, PauseReason::Gone));
        }
        if let (Some(fd), Some(saved)) = (self.tty_fd.take(), self.saved_tty.take()) {
            use std::os::unix::io::AsRawFd;
            crate::sysdeps::vt::restore_text_auto_mode(fd.as_raw_fd(), saved);
        }
        self.controller = None;
        if self.state != SessionState::Closing {
            self.state = SessionState::Online;
            if self.active {
                self.active = false;
                events.push(SessionEvent::ActiveChanged(false));
            }
        }
        events
    }

    /// Opens the session's tty and switches VT-switch ownership to process
    /// mode (spec §4.2 "VT process-mode handshake"). Only meaningful once,
    /// when a controller first attaches to a `vtnr>0` session.
    pub fn setup_vt_handshake(&mut self, release_signal: i32, acquire_signal: i32) {
        if self.vtnr == 0 || self.tty_fd.is_some() {
            return;
        }
        let path = format!("/dev/tty{}", self.vtnr);
        let fd = match nix::fcntl::open(
            path.as_str(),
            nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(%err, path, "failed to open session tty for VT handshake");
                return;
            }
        };
        let fd = unsafe { <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        use std::os::unix::io::AsRawFd;
        match crate::sysdeps::vt::enter_graphics_process_mode(fd.as_raw_fd(), release_signal, acquire_signal) {
            Ok(saved) => {
                self.saved_tty = Some(saved);
                self.tty_fd = Some(fd);
            }
            Err(err) => warn!(%err, "failed to take VT process-mode control, leaving VT in auto mode"),
        }
    }

    /// `TakeDevice(major,minor)` (spec §4.2).
    pub fn take_device(&mut self, path: &std::path::Path, major: u32, minor: u32) -> Result<(OwnedFd, bool)> {
        if self.devices.contains_key(&(major, minor)) {
            return Err(Error::failed("device already taken by this session"));
        }
        let device = Device::open(path, self.active).map_err(|err| Error::new(Kind::NotSupported, err.to_string()))?;
        let fd = device.dup_fd().map_err(|err| Error::failed(err.to_string()))?;
        let active = device.is_active();
        self.devices.insert((major, minor), device);
        Ok((fd, active))
    }

    /// `ReleaseDevice(major,minor)`.
    pub fn release_device(&mut self, major: u32, minor: u32) -> Result<()> {
        self.devices
            .remove(&(major, minor))
            .map(|_| ())
            .ok_or_else(|| Error::new(Kind::InvalidInput, "device not held by this session"))
    }

    /// `PauseDeviceComplete(major,minor)`: if this drains the pending-pause
    /// counter to zero, finish the demotion immediately.
    pub fn pause_device_complete(&mut self, major: u32, minor: u32) -> Vec<SessionEvent> {
        if !self.devices.contains_key(&(major, minor)) {
            return Vec::new();
        }
        if self.devices_pending_pause > 0 {
            self.devices_pending_pause -= 1;
        }
        if self.devices_pending_pause == 0 && self.state == SessionState::Active {
            return self.finish_deactivate();
        }
        Vec::new()
    }

    /// Step 1-2 of the activation-dance (active -> inactive): mark every
    /// device paused in-memory and ask the caller to arm the grace timer.
    pub fn begin_deactivate(&mut self) -> Vec<SessionEvent> {
        if self.state != SessionState::Active {
            return Vec::new();
        }
        if self.devices.is_empty() {
            return self.finish_deactivate();
        }
        let mut events = Vec::new();
        self.devices_pending_pause = self.devices.len();
        for (&(major, minor), _) in self.devices.iter() {
            events.push(SessionEvent::PauseDevice(major, minor, PauseReason::Pause));
        }
        events.push(SessionEvent::ArmPauseTimer);
        events
    }

    /// Step 3: every `PauseDeviceComplete` arrived before the grace timer.
    fn finish_deactivate(&mut self) -> Vec<SessionEvent> {
        let mut events = vec![SessionEvent::CancelPauseTimer];
        events.extend(self.deactivate_devices_and_demote(PauseReason::Pause));
        events
    }

    /// Step 4: the grace timer fired first — force every device inactive.
    pub fn force_deactivate(&mut self) -> Vec<SessionEvent> {
        if self.state != SessionState::Active {
            return Vec::new();
        }
        self.deactivate_devices_and_demote(PauseReason::Force)
    }

    fn deactivate_devices_and_demote(&mut self, reason: PauseReason) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for device in self.devices.values_mut() {
            if let Err(err) = device.set_active(false) {
                warn!(%err, "failed to drop device authority, continuing demotion");
            }
            if reason == PauseReason::Force {
                let (major, minor) = device.devnum();
                events.push(SessionEvent::PauseDevice(major, minor, PauseReason::Force));
            }
        }
        self.active = false;
        self.state = SessionState::Online;
        events.push(SessionEvent::ActiveChanged(false));
        debug!(id = %self.id, "session demoted to online");
        events
    }

    /// Activation-dance (inactive -> active): resumes every device,
    /// reopening evdev nodes that were revoked, then promotes the session.
    pub fn activate_devices(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let keys: Vec<(u32, u32)> = self.devices.keys().copied().collect();
        for (major, minor) in keys {
            let device = self.devices.get_mut(&(major, minor)).unwrap();
            if let Err(err) = device.set_active(true) {
                warn!(%err, major, minor, "failed to reacquire device authority");
                continue;
            }
            // `Device::set_active` already transparently reopens a revoked
            // evdev node; either way the controller needs the current fd.
            if let Ok(fd) = device.dup_fd() {
                events.push(SessionEvent::ResumeDevice(major, minor, fd));
            }
        }
        if let Some(display) = &self.display_device {
            let _ = nix::unistd::chown(
                display.as_str(),
                Some(nix::unistd::Uid::from_raw(self.uid)),
                None,
            );
        }
        self.active = true;
        self.state = SessionState::Active;
        events.push(SessionEvent::ActiveChanged(true));
        events
    }

    /// Begins teardown: caller still needs to remove this session from its
    /// seat and the Manager's table once this returns.
    pub fn begin_close(&mut self) -> Vec<SessionEvent> {
        self.state = SessionState::Closing;
        self.devices.clear();
        if let (Some(fd), Some(saved)) = (self.tty_fd.take(), self.saved_tty.take()) {
            use std::os::unix::io::AsRawFd;
            crate::sysdeps::vt::restore_text_auto_mode(fd.as_raw_fd(), saved);
        }
        Vec::new()
    }

    /// VT release-request: forcibly pause, then the caller acks the kernel.
    pub fn handle_vt_release_request(&mut self) -> Vec<SessionEvent> {
        self.force_deactivate()
    }

    pub fn tty_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.tty_fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> SessionParams {
        SessionParams {
            display_device: Some("/dev/tty2".into()),
            is_local: Some(true),
            vtnr: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn matches_static_text_when_attributes_line_up() {
        let session = Session::new("Session1".into(), 1000, Cookie::generate(), "seat0".into(), params());
        assert!(session.matches_static_text());
        assert!(!session.matches_static_x11());
    }

    #[test]
    fn idle_hint_only_emits_on_change() {
        let mut session = Session::new("Session1".into(), 1000, Cookie::generate(), "seat0".into(), params());
        assert!(session.set_idle_hint(false).is_none());
        assert!(session.set_idle_hint(true).is_some());
        assert!(session.set_idle_hint(true).is_none());
    }

    #[test]
    fn locality_can_only_be_granted_not_revoked() {
        let mut session = Session::new("Session1".into(), 1000, Cookie::generate(), "seat0".into(), SessionParams::default());
        assert!(!session.is_local());
        session.inherit_locality(true);
        assert!(session.is_local());
        session.inherit_locality(false);
        assert!(session.is_local(), "locality must never be revoked");
    }
}
