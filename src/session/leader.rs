//! The cookie holder that exists from `OpenSession` until the Session it
//! proposes is built (or abandoned), spec §3 SessionLeader.

use std::collections::HashMap;

use rand::RngCore;

/// Opaque, unguessable, globally unique for the daemon's lifetime. Modeled
/// as a random 128-bit value hex-encoded, the same shape the upstream
/// `ck-marshal.c` cookie generator produces (random bytes, not a counter,
/// so a peer can't predict another client's cookie).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cookie(String);

impl Cookie {
    pub fn generate() -> Cookie {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Cookie(hex)
    }

    /// Wraps an already-issued cookie value, e.g. one read back out of a
    /// target process's `XDG_SESSION_COOKIE` environment variable.
    pub fn from_raw(value: impl Into<String>) -> Cookie {
        Cookie(value.into())
    }

    /// Alias of [`Cookie::from_raw`] for call sites recovering a cookie
    /// string rather than minting a fresh one.
    pub fn from_str_value(value: &str) -> Cookie {
        Cookie(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters collected asynchronously after `OpenSession` before a Session
/// can be constructed (spec §3 Session attributes, the subset a leader can
/// supply).
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub session_type: Option<String>,
    pub session_class: Option<String>,
    pub session_service: Option<String>,
    pub login_session_id: Option<String>,
    pub display_device: Option<String>,
    pub x11_display: Option<String>,
    pub x11_display_device: Option<String>,
    pub remote_host_name: Option<String>,
    pub is_local: Option<bool>,
    pub vtnr: Option<u32>,
}

impl SessionParams {
    /// Applies a bus-supplied `{key: variant}` dictionary, dropping unknown
    /// keys with a warning rather than preserving them (spec §9 "duck-typed
    /// parameter bags").
    pub fn merge_known(&mut self, key: &str, value: &str) {
        match key {
            "session-type" => self.session_type = Some(value.to_string()),
            "session-class" => self.session_class = Some(value.to_string()),
            "session-service" => self.session_service = Some(value.to_string()),
            "login-session-id" => self.login_session_id = Some(value.to_string()),
            "display-device" => self.display_device = Some(value.to_string()),
            "x11-display" => self.x11_display = Some(value.to_string()),
            "x11-display-device" => self.x11_display_device = Some(value.to_string()),
            "remote-host-name" => self.remote_host_name = Some(value.to_string()),
            "is-local" => self.is_local = Some(value == "true"),
            "vtnr" => self.vtnr = value.parse().ok(),
            other => tracing::warn!(key = other, "unknown session parameter key, dropping"),
        }
    }
}

pub struct SessionLeader {
    pub cookie: Cookie,
    pub pid: u32,
    pub uid: u32,
    pub bus_name: String,
    pub proposed_ssid: String,
    pub params: SessionParams,
}

/// Cookie-keyed table of in-flight leaders, owned by the Manager.
#[derive(Default)]
pub struct Leaders {
    by_cookie: HashMap<Cookie, SessionLeader>,
}

impl Leaders {
    pub fn insert(&mut self, leader: SessionLeader) -> Cookie {
        let cookie = leader.cookie.clone();
        self.by_cookie.insert(cookie.clone(), leader);
        cookie
    }

    pub fn get(&self, cookie: &Cookie) -> Option<&SessionLeader> {
        self.by_cookie.get(cookie)
    }

    pub fn get_mut(&mut self, cookie: &Cookie) -> Option<&mut SessionLeader> {
        self.by_cookie.get_mut(cookie)
    }

    pub fn remove(&mut self, cookie: &Cookie) -> Option<SessionLeader> {
        self.by_cookie.remove(cookie)
    }

    pub fn remove_by_bus_name(&mut self, bus_name: &str) -> Vec<SessionLeader> {
        let cookies: Vec<Cookie> = self
            .by_cookie
            .iter()
            .filter(|(_, leader)| leader.bus_name == bus_name)
            .map(|(cookie, _)| cookie.clone())
            .collect();
        cookies.into_iter().filter_map(|c| self.remove(&c)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cookies_generate_distinct_values() {
        let a = Cookie::generate();
        let b = Cookie::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn merge_known_drops_unrecognized_keys() {
        let mut params = SessionParams::default();
        params.merge_known("vtnr", "3");
        params.merge_known("something-else", "x");
        assert_eq!(params.vtnr, Some(3));
    }
}
