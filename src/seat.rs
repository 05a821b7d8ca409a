//! Holds a session set and elects the active one off VT changes (spec
//! §4.3). Like `Session`, this is plain data plus logic: election returns
//! which session should be promoted/demoted, the Manager carries out the
//! device dance and dispatches the resulting signals.

use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatKind {
    StaticX11,
    StaticText,
    Dynamic,
}

impl SeatKind {
    pub fn is_static(self) -> bool {
        !matches!(self, SeatKind::Dynamic)
    }
}

pub struct SeatSessionFacts {
    pub id: String,
    pub display_device: Option<String>,
    pub x11_display_device: Option<String>,
    pub creation_time: SystemTime,
}

pub struct Seat {
    id: String,
    kind: SeatKind,
    sessions: Vec<String>,
    active_session: Option<String>,
}

/// Outcome of running the election over a set of session facts against the
/// seat's current active session.
pub enum Election {
    /// No candidate session is on the newly-active VT; nothing changes.
    NoChange,
    /// `old` (if any) should be demoted and `new` promoted.
    Switch { old: Option<String>, new: String },
}

impl Seat {
    pub fn new(id: String, kind: SeatKind) -> Seat {
        Seat {
            id,
            kind,
            sessions: Vec::new(),
            active_session: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn kind(&self) -> SeatKind {
        self.kind
    }
    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }
    pub fn session_ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(String::as_str)
    }
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn add_session(&mut self, ssid: &str) {
        if !self.sessions.iter().any(|s| s == ssid) {
            self.sessions.push(ssid.to_string());
        }
    }

    pub fn remove_session(&mut self, ssid: &str) {
        self.sessions.retain(|s| s != ssid);
        if self.active_session.as_deref() == Some(ssid) {
            self.active_session = None;
        }
    }

    pub fn set_active(&mut self, ssid: Option<String>) {
        self.active_session = ssid;
    }

    /// Election over the current VT number `n`: candidates are sessions
    /// whose `display-device` is `/dev/tty<n>`, falling back to
    /// `x11-display-device` if that set is empty; ties broken by oldest
    /// creation-time (spec §4.3 Election).
    pub fn elect<'a>(&self, vt: i32, candidates: impl Iterator<Item = &'a SeatSessionFacts>) -> Election {
        let target = format!("/dev/tty{vt}");
        let facts: Vec<&SeatSessionFacts> = candidates.filter(|f| self.sessions.contains(&f.id)).collect();

        let mut pool: Vec<&&SeatSessionFacts> = facts.iter().filter(|f| f.display_device.as_deref() == Some(target.as_str())).collect();
        if pool.is_empty() {
            pool = facts.iter().filter(|f| f.x11_display_device.as_deref() == Some(target.as_str())).collect();
        }

        let Some(winner) = pool.into_iter().min_by_key(|f| f.creation_time) else {
            return Election::NoChange;
        };

        if self.active_session.as_deref() == Some(winner.id.as_str()) {
            return Election::NoChange;
        }
        Election::Switch {
            old: self.active_session.clone(),
            new: winner.id.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn facts(id: &str, tty: &str, t: u64) -> SeatSessionFacts {
        SeatSessionFacts {
            id: id.into(),
            display_device: Some(tty.into()),
            x11_display_device: None,
            creation_time: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(t),
        }
    }

    #[test]
    fn elects_the_session_on_the_active_vt() {
        let mut seat = Seat::new("seat0".into(), SeatKind::StaticText);
        seat.add_session("Session1");
        seat.add_session("Session2");
        let s1 = facts("Session1", "/dev/tty2", 0);
        let s2 = facts("Session2", "/dev/tty3", 1);
        match seat.elect(3, [&s1, &s2].into_iter()) {
            Election::Switch { new, .. } => assert_eq!(new, "Session2"),
            Election::NoChange => panic!("expected a switch"),
        }
    }

    #[test]
    fn ties_break_by_oldest_creation_time() {
        let mut seat = Seat::new("seat0".into(), SeatKind::StaticText);
        seat.add_session("Session1");
        seat.add_session("Session2");
        let s1 = facts("Session1", "/dev/tty2", 5);
        let s2 = facts("Session2", "/dev/tty2", 1);
        match seat.elect(2, [&s1, &s2].into_iter()) {
            Election::Switch { new, .. } => assert_eq!(new, "Session2"),
            Election::NoChange => panic!("expected a switch"),
        }
    }

    #[test]
    fn reelecting_the_current_active_session_is_a_no_op() {
        let mut seat = Seat::new("seat0".into(), SeatKind::StaticText);
        seat.add_session("Session1");
        seat.set_active(Some("Session1".into()));
        let s1 = facts("Session1", "/dev/tty2", 0);
        match seat.elect(2, [&s1].into_iter()) {
            Election::NoChange => {}
            Election::Switch { .. } => panic!("should not reswitch to itself"),
        }
    }
}
