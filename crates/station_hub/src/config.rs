use std::path::Path;

use serde::{Deserialize, Serialize};
use sync_core::settings::{env_value, read_toml_table, table_value};
use tracing::warn;

pub const SETTINGS_FILE: &str = "station_hub.toml";
pub const ENV_PREFIX: &str = "STATION_HUB__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub bind_addr: String,
    /// Terminal chunks kept for replay to newly attached consoles.
    pub terminal_retention: usize,
    /// Live events buffered per console before it is considered lagging.
    pub event_capacity: usize,
    pub link_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7341".into(),
            terminal_retention: 4_000,
            event_capacity: 1_024,
            link_capacity: 256,
        }
    }
}

impl HubSettings {
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("bind_addr") {
            self.bind_addr = v;
        }
        for (key, slot) in [
            ("terminal_retention", &mut self.terminal_retention),
            ("event_capacity", &mut self.event_capacity),
            ("link_capacity", &mut self.link_capacity),
        ] {
            let Some(raw) = lookup(key) else {
                continue;
            };
            match raw.trim().parse::<usize>() {
                Ok(parsed) if parsed > 0 => *slot = parsed,
                _ => warn!(key, value = %raw, "ignoring invalid hub setting"),
            }
        }
    }
}

pub fn load_settings() -> HubSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> HubSettings {
    let mut settings = HubSettings::default();

    if let Some(table) = read_toml_table(path) {
        settings.apply_overrides(|key| table_value(&table, key));
    }
    settings.apply_overrides(|key| env_value(ENV_PREFIX, key));

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
