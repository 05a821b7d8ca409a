//! Append-only history log of session open/close and seat-active-session
//! changes, in the tab-separated format `ck-manager.c`'s `ck_manager_log_*`
//! helpers wrote to `LOG_FILE` (spec §A.5): one line per event, oldest
//! first, never rotated by this daemon (logrotate's job upstream too).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

pub struct EventLog {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    SessionOpen { ssid: &'a str, uid: u32, seat: &'a str },
    SessionClose { ssid: &'a str, uid: u32, seat: &'a str },
    SeatActiveSessionChanged { seat: &'a str, ssid: Option<&'a str> },
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> EventLog {
        EventLog { path: path.into() }
    }

    pub fn record(&self, event: Event<'_>) {
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let line = format_event(event);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            warn!(%err, path = %self.path.display(), "failed to append to history log");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_event(event: Event<'_>) -> String {
    // Matches the upstream field order: timestamp, event kind, then
    // kind-specific fields tab-separated.
    let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_REALTIME)
        .map(|ts| ts.tv_sec())
        .unwrap_or(0);
    match event {
        Event::SessionOpen { ssid, uid, seat } => {
            format!("{now}\tsession-open\tssid={ssid}\tuid={uid}\tseat={seat}")
        }
        Event::SessionClose { ssid, uid, seat } => {
            format!("{now}\tsession-close\tssid={ssid}\tuid={uid}\tseat={seat}")
        }
        Event::SeatActiveSessionChanged { seat, ssid } => {
            format!(
                "{now}\tseat-active-session-changed\tseat={seat}\tssid={}",
                ssid.unwrap_or("-")
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_open_formats_tab_separated_fields() {
        let line = format_event(Event::SessionOpen {
            ssid: "Session1",
            uid: 1000,
            seat: "Seat0",
        });
        assert!(line.contains("session-open"));
        assert!(line.contains("ssid=Session1"));
        assert!(line.contains("uid=1000"));
    }
}
