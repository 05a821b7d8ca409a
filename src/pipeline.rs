//! The system-action pipeline: emit-prepare, delay-or-fast timeout, invoke
//! the external script, emit-finished (spec §4.1.2).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Kind, Result};
use crate::inhibit::What;

/// One of the seven actions the Manager can pipeline. Each names the
/// inhibit event bit it's gated by, the signal kind it prepares, and the
/// external script path (spec §6 "Scripts").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PowerOff,
    Reboot,
    Suspend,
    Hibernate,
    HybridSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareKind {
    Shutdown,
    Sleep,
}

impl Action {
    pub fn prepare_kind(self) -> PrepareKind {
        match self {
            Action::PowerOff | Action::Reboot => PrepareKind::Shutdown,
            Action::Suspend | Action::Hibernate | Action::HybridSleep => PrepareKind::Sleep,
        }
    }

    pub fn inhibit_event(self) -> What {
        match self.prepare_kind() {
            PrepareKind::Shutdown => What::SHUTDOWN,
            PrepareKind::Sleep => What::SLEEP,
        }
    }

    /// Script name relative to the scripts directory, spec §6.
    pub fn script_name(self) -> &'static str {
        match self {
            Action::PowerOff => "ck-system-stop",
            Action::Reboot => "ck-system-restart",
            Action::Suspend => "ck-system-suspend",
            Action::Hibernate => "ck-system-hibernate",
            Action::HybridSleep => "ck-system-hybridsleep",
        }
    }
}

/// External authorisation predicate outcome (spec §4.1.2 step 2). The
/// predicate itself is injected by the caller (e.g. a polkit-style check);
/// this daemon's core only reacts to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Allow,
    Deny,
    Challenge,
}

/// The single in-flight action, pinned to one data structure whose
/// lifetime ends only when the fire path completes (spec §4.1.2 tie-break
/// note).
pub struct PendingAction {
    pub action: Action,
    pub scripts_dir: PathBuf,
    timer_token: Option<calloop::RegistrationToken>,
}

pub const INHIBITED_DELAY: Duration = Duration::from_secs(8);
pub const FAST_DELAY: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct Pipeline {
    pending: Option<PendingAction>,
}

impl Pipeline {
    /// Steps 1-2: block-inhibit and auth checks. Returns the delay to use
    /// for the timer if both pass.
    pub fn start(&mut self, action: Action, verdict: AuthVerdict, block_count: u32, delay_count: u32, scripts_dir: PathBuf) -> Result<Duration> {
        if self.pending.is_some() {
            return Err(Error::new(Kind::Busy, "a system action is already in flight"));
        }
        if block_count > 0 {
            return Err(Error::new(Kind::Inhibited, "action blocked by an active inhibitor"));
        }
        match verdict {
            AuthVerdict::Allow => {}
            AuthVerdict::Deny => return Err(Error::new(Kind::InsufficientPermission, "authorization denied")),
            AuthVerdict::Challenge => return Err(Error::new(Kind::AuthorizationRequired, "interactive authorization required")),
        }
        self.pending = Some(PendingAction {
            action,
            scripts_dir,
            timer_token: None,
        });
        Ok(if delay_count > 0 { INHIBITED_DELAY } else { FAST_DELAY })
    }

    pub fn is_in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn current(&self) -> Option<Action> {
        self.pending.as_ref().map(|p| p.action)
    }

    pub fn set_timer_token(&mut self, token: calloop::RegistrationToken) {
        if let Some(pending) = &mut self.pending {
            pending.timer_token = Some(token);
        }
    }

    pub fn take_timer_token(&mut self) -> Option<calloop::RegistrationToken> {
        self.pending.as_mut().and_then(|p| p.timer_token.take())
    }

    /// The last DELAY inhibitor released before the timer fired: run the
    /// fire path immediately instead of waiting out the rest of the delay.
    pub fn scripts_dir(&self) -> Option<PathBuf> {
        self.pending.as_ref().map(|p| p.scripts_dir.clone())
    }

    /// Step 6: the script ran (or failed to spawn). Clears the in-flight
    /// marker unconditionally — `PrepareFor…(false)` is always emitted,
    /// even on a non-zero script exit (spec §9 open question (b)).
    pub fn finish(&mut self) -> Option<Action> {
        self.pending.take().map(|p| p.action)
    }

    /// `Can…` probes: true unless an action is already in flight (no BLOCK
    /// check, which is intentionally a runtime-only property clients only
    /// discover when they try).
    pub fn can_start(&self) -> bool {
        self.pending.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn a_second_action_while_one_is_in_flight_is_busy() {
        let mut pipeline = Pipeline::default();
        pipeline.start(Action::PowerOff, AuthVerdict::Allow, 0, 0, PathBuf::from("/tmp")).unwrap();
        let err = pipeline.start(Action::Reboot, AuthVerdict::Allow, 0, 0, PathBuf::from("/tmp")).unwrap_err();
        assert_eq!(err.kind, Kind::Busy);
    }

    #[test]
    fn a_block_inhibitor_rejects_before_touching_auth() {
        let mut pipeline = Pipeline::default();
        let err = pipeline.start(Action::Suspend, AuthVerdict::Allow, 1, 0, PathBuf::from("/tmp")).unwrap_err();
        assert_eq!(err.kind, Kind::Inhibited);
    }

    #[test]
    fn delay_inhibitors_select_the_longer_timeout() {
        let mut pipeline = Pipeline::default();
        let delay = pipeline.start(Action::PowerOff, AuthVerdict::Allow, 0, 1, PathBuf::from("/tmp")).unwrap();
        assert_eq!(delay, INHIBITED_DELAY);
    }

    #[test]
    fn finish_always_clears_the_marker() {
        let mut pipeline = Pipeline::default();
        pipeline.start(Action::PowerOff, AuthVerdict::Allow, 0, 0, PathBuf::from("/tmp")).unwrap();
        assert!(pipeline.finish().is_some());
        assert!(!pipeline.is_in_flight());
    }
}
