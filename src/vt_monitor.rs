//! Single-threaded watcher for the currently active VT (spec §4.7).
//!
//! The kernel has no "notify me on switch" primitive usable from a
//! cooperative loop without a dedicated thread, so this polls
//! `VT_GETSTATE` on a timer — the same tradeoff Smithay's
//! [`wayland::idle_notify`] timer-driven state machine makes for activity
//! tracking, reused here for VT activity instead of input activity.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long an `ActivateSession`-driven VT switch is given to land before
/// the caller is told it was pre-empted (spec §4.7 "escape hatch").
const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(5);

pub trait VtMonitorHandler: Sized + 'static {
    fn vt_monitor_mut(&mut self) -> &mut VtMonitor<Self>;

    /// Fired exactly once per observed switch, spec §4.7.
    fn vt_active_changed(&mut self, vt: i32);

    /// Fired if a requested switch didn't land within the escape-hatch
    /// window; the caller should reply "pre-empted" to whoever asked.
    fn vt_activate_timed_out(&mut self, requested_vt: i32);
}

struct PendingActivate {
    target: i32,
    deadline: Instant,
}

pub struct VtMonitor<D: VtMonitorHandler> {
    console_fd: OwnedFd,
    current: i32,
    pending: Option<PendingActivate>,
    loop_handle: LoopHandle<'static, D>,
    poll_token: Option<RegistrationToken>,
}

impl<D: VtMonitorHandler> VtMonitor<D> {
    /// Opens the console device once at startup and reports the current VT
    /// (spec §4.7 "at startup, report the current VT").
    pub fn new(console_path: &str, loop_handle: LoopHandle<'static, D>) -> nix::Result<(VtMonitor<D>, i32)> {
        let raw = nix::fcntl::open(
            console_path,
            nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        )?;
        let console_fd = unsafe { <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(raw) };
        let current = crate::sysdeps::vt::active_vt(console_fd.as_raw_fd())?;
        Ok((
            VtMonitor {
                console_fd,
                current,
                pending: None,
                loop_handle,
                poll_token: None,
            },
            current,
        ))
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    /// Arms the poll timer; call once after construction, from a context
    /// where `D` is fully set up (the closure re-borrows `D` through
    /// [`VtMonitorHandler::vt_monitor_mut`]).
    pub fn start_polling(&mut self) {
        let token = self.loop_handle.insert_source(Timer::from_duration(POLL_INTERVAL), |_, _, state: &mut D| {
            let switched = state.vt_monitor_mut().poll_once();
            let timed_out = state.vt_monitor_mut().timed_out_request();
            if let Some(vt) = switched {
                state.vt_active_changed(vt);
            }
            if let Some(target) = timed_out {
                state.vt_activate_timed_out(target);
            }
            TimeoutAction::ToDuration(POLL_INTERVAL)
        });
        self.poll_token = token.ok();
    }

    /// Requests a switch to `vt`; the actual `ActiveChanged` edge (success)
    /// or timeout (pre-empted) surfaces asynchronously through the poll
    /// loop.
    pub fn request_activate(&mut self, vt: i32) -> nix::Result<()> {
        crate::sysdeps::vt::activate_and_wait(self.console_fd.as_raw_fd(), vt).or_else(|err| {
            // VT_WAITACTIVE on a non-blocking console fd may return EAGAIN;
            // that's fine, the poll loop will observe the switch whenever
            // it lands.
            if err == nix::Error::EAGAIN {
                Ok(())
            } else {
                Err(err)
            }
        })?;
        self.pending = Some(PendingActivate {
            target: vt,
            deadline: Instant::now() + ACTIVATE_TIMEOUT,
        });
        Ok(())
    }

    fn poll_once(&mut self) -> Option<i32> {
        match crate::sysdeps::vt::active_vt(self.console_fd.as_raw_fd()) {
            Ok(vt) if vt != self.current => {
                self.current = vt;
                if let Some(pending) = &self.pending {
                    if pending.target == vt {
                        self.pending = None;
                    }
                }
                Some(vt)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(%err, "failed to poll VT state");
                None
            }
        }
    }

    fn timed_out_request(&mut self) -> Option<i32> {
        let pending = self.pending.as_ref()?;
        if Instant::now() >= pending.deadline {
            let target = pending.target;
            self.pending = None;
            Some(target)
        } else {
            None
        }
    }
}

impl<D: VtMonitorHandler> Drop for VtMonitor<D> {
    fn drop(&mut self) {
        if let Some(token) = self.poll_token.take() {
            self.loop_handle.remove(token);
        }
    }
}
