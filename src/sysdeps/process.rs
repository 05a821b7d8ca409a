//! Process/credential lookups the bus layer and Manager need: resolving a
//! peer unique-name to a (uid, pid), and reading a target process's
//! environment for the parameter-collection step of `OpenSession`.

use std::fs;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("io error reading /proc/{0}: {1}")]
    Io(u32, std::io::Error),
}

/// Reads `/proc/<pid>/environ` and returns the value of `key`, if present.
/// Used to recover `XDG_SESSION_COOKIE` when process-group resolution
/// doesn't have an answer (spec §4.1 `GetSessionForUnixProcess`).
pub fn read_process_env(pid: u32, key: &str) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/environ")).ok()?;
    for entry in raw.split(|b| *b == 0) {
        let entry = String::from_utf8_lossy(entry);
        if let Some(value) = entry.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')) {
            return Some(value.to_string());
        }
    }
    None
}

/// Reads the controlling tty of `pid` from `/proc/<pid>/stat`, field 7
/// (`tty_nr`), decoded into a `/dev/ttyN` path when it refers to the legacy
/// console driver (major 4).
pub fn controlling_tty(pid: u32) -> Option<String> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 2 (comm) may contain spaces/parens; skip past the last ')'.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // tty_nr is field index 4 counting from field 3 (state) as index 0.
    let tty_nr: i32 = fields.get(4)?.parse().ok()?;
    if tty_nr <= 0 {
        return None;
    }
    let major = (tty_nr >> 8) & 0xfff;
    let minor = (tty_nr & 0xff) | ((tty_nr >> 12) & 0xfff00);
    if major != 4 {
        return None;
    }
    Some(format!("/dev/tty{minor}"))
}
