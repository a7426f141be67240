use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SETTINGS_FILE: &str = "station.toml";
pub const ENV_PREFIX: &str = "STATION__";

/// Console-side tuning of the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub endpoint_url: String,
    pub max_connect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub outbound_queue_capacity: usize,
    pub terminal_retention: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "ws://127.0.0.1:7341/ws".into(),
            max_connect_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            outbound_queue_capacity: 256,
            terminal_retention: 2_000,
        }
    }
}

impl SyncSettings {
    /// Delay before connect attempt `attempt` (1-based). Doubles from the
    /// initial backoff and saturates at the ceiling.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Applies `key = value` overrides by field name. Unknown keys and
    /// unparsable numbers are skipped with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("endpoint_url") {
            self.endpoint_url = v;
        }
        override_number(&mut self.max_connect_attempts, "max_connect_attempts", &lookup);
        override_number(&mut self.initial_backoff_ms, "initial_backoff_ms", &lookup);
        override_number(&mut self.max_backoff_ms, "max_backoff_ms", &lookup);
        override_number(
            &mut self.outbound_queue_capacity,
            "outbound_queue_capacity",
            &lookup,
        );
        override_number(&mut self.terminal_retention, "terminal_retention", &lookup);

        self.max_connect_attempts = self.max_connect_attempts.max(1);
        self.outbound_queue_capacity = self.outbound_queue_capacity.max(1);
        self.terminal_retention = self.terminal_retention.max(1);
        self.max_backoff_ms = self.max_backoff_ms.max(self.initial_backoff_ms);
    }
}

fn override_number<T: std::str::FromStr>(
    slot: &mut T,
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

/// Reads a flat TOML table into string values keyed by field name.
pub fn read_toml_table(path: &Path) -> Option<toml::Table> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<toml::Table>(&raw) {
        Ok(table) => Some(table),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring malformed settings file");
            None
        }
    }
}

pub fn table_value(table: &toml::Table, key: &str) -> Option<String> {
    match table.get(key)? {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        toml::Value::Boolean(v) => Some(v.to_string()),
        other => Some(other.to_string()),
    }
}

pub fn env_value(prefix: &str, key: &str) -> Option<String> {
    std::env::var(format!("{prefix}{}", key.to_ascii_uppercase())).ok()
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

/// Defaults, then the TOML file at `path` (if any), then `STATION__*`
/// environment variables.
pub fn load_settings_from(path: &Path) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Some(table) = read_toml_table(path) {
        settings.apply_overrides(|key| table_value(&table, key));
    }
    settings.apply_overrides(|key| env_value(ENV_PREFIX, key));

    settings
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
