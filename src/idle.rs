//! Per-session activity-idle watcher: stat()s a session's tty device and
//! declares it idle once `st_atime` is older than a threshold (spec §A.5,
//! grounded on `check_tty_idle` in `ck-tty-idle-monitor.c`). Re-architected
//! from that file's own-timer-per-session design into one poll driven by
//! the Manager's loop, since every session's tty is a cheap `stat(2)` and a
//! single shared timer is simpler to reason about under this daemon's
//! cooperative scheduling model than N independent ones.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::stat::stat;

pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5 * 60);

struct Watched {
    device: PathBuf,
    threshold: Duration,
    is_idle: bool,
}

#[derive(Default)]
pub struct IdleMonitor {
    watched: HashMap<String, Watched>,
}

impl IdleMonitor {
    pub fn watch(&mut self, ssid: &str, device: PathBuf) {
        self.watched.insert(
            ssid.to_string(),
            Watched {
                device,
                threshold: DEFAULT_THRESHOLD,
                is_idle: false,
            },
        );
    }

    pub fn unwatch(&mut self, ssid: &str) {
        self.watched.remove(ssid);
    }

    /// Returns the `(ssid, is_idle)` pairs whose idle-hint flipped since the
    /// last poll.
    pub fn poll(&mut self) -> Vec<(String, bool)> {
        let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_REALTIME)
            .map(|ts| ts.tv_sec())
            .unwrap_or(0);

        let mut changed = Vec::new();
        for (ssid, watched) in self.watched.iter_mut() {
            let Ok(sb) = stat(&watched.device) else {
                continue;
            };
            let last_access = sb.st_atime.min(now);
            let idle_for = (now - last_access).max(0) as u64;
            let is_idle = idle_for >= watched.threshold.as_secs();
            if is_idle != watched.is_idle {
                watched.is_idle = is_idle;
                changed.push((ssid.clone(), is_idle));
            }
        }
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unwatched_sessions_never_report_idle_changes() {
        let mut monitor = IdleMonitor::default();
        monitor.watch("Session1", PathBuf::from("/dev/null"));
        monitor.unwatch("Session1");
        assert!(monitor.poll().is_empty());
    }
}
