//! Static seat configuration loaded from `/etc/ConsoleKit/seats.d/*.seat`
//! (spec §A.3), grounded on `load_seats_from_dir`/`add_seat_for_file` in
//! `ck-manager.c`, which reads one `.seat` keyfile per static seat at
//! startup. We replace the keyfile format with TOML, which is the format
//! every other config surface in this stack already uses.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::seat::SeatKind;

#[derive(Debug, Clone, Deserialize)]
pub struct SeatConfig {
    pub id: String,
    pub kind: SeatKindConfig,
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeatKindConfig {
    StaticX11,
    StaticText,
}

impl From<SeatKindConfig> for SeatKind {
    fn from(kind: SeatKindConfig) -> SeatKind {
        match kind {
            SeatKindConfig::StaticX11 => SeatKind::StaticX11,
            SeatKindConfig::StaticText => SeatKind::StaticText,
        }
    }
}

/// Reads every `*.seat` file in `dir`, skipping and logging any that don't
/// parse rather than failing startup over one bad file.
pub fn load_seats_from_dir(dir: &Path) -> Vec<SeatConfig> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, dir = %dir.display(), "couldn't open seat config directory");
            return Vec::new();
        }
    };

    let mut seats = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("seat") {
            continue;
        }
        match fs::read_to_string(&path).map(|s| toml::from_str::<SeatConfig>(&s)) {
            Ok(Ok(config)) => seats.push(config),
            Ok(Err(err)) => warn!(%err, path = %path.display(), "invalid seat config"),
            Err(err) => warn!(%err, path = %path.display(), "couldn't read seat config"),
        }
    }
    seats
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_static_text_seat() {
        let toml = r#"
            id = "Seat0"
            kind = "static-text"
            devices = ["/dev/tty1"]
        "#;
        let config: SeatConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.id, "Seat0");
        assert_eq!(config.devices, vec!["/dev/tty1"]);
    }
}
