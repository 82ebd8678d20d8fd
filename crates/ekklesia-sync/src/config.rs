//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so the engine runs with zero configuration.

use std::time::Duration;

use ekklesia_shared::constants::{
    DEFAULT_COMMAND_CAPACITY, DEFAULT_DEDUP_WINDOW, DEFAULT_NOTIFICATION_CAPACITY,
    DEFAULT_PREVIEW_CHARS, DEFAULT_SUBSCRIBE_BACKOFF_MS, DEFAULT_SUBSCRIBE_RETRIES,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Env: `EKKLESIA_COMMAND_CAPACITY`
    pub command_capacity: usize,

    /// Env: `EKKLESIA_NOTIFICATION_CAPACITY`
    pub notification_capacity: usize,

    /// How many recent inbox message ids the roster remembers to absorb
    /// redeliveries.
    /// Env: `EKKLESIA_DEDUP_WINDOW`
    pub dedup_window: usize,

    /// Env: `EKKLESIA_PREVIEW_CHARS`
    pub preview_chars: usize,

    /// Attempts made to reopen a failed subscription before giving up.
    /// Env: `EKKLESIA_SUBSCRIBE_RETRIES`
    pub subscribe_retries: u32,

    /// Base delay of the exponential subscription backoff.
    /// Env: `EKKLESIA_SUBSCRIBE_BACKOFF_MS`
    pub subscribe_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            subscribe_retries: DEFAULT_SUBSCRIBE_RETRIES,
            subscribe_backoff: Duration::from_millis(DEFAULT_SUBSCRIBE_BACKOFF_MS),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_positive(&lookup, "EKKLESIA_COMMAND_CAPACITY") {
            config.command_capacity = n;
        }
        if let Some(n) = parse_positive(&lookup, "EKKLESIA_NOTIFICATION_CAPACITY") {
            config.notification_capacity = n;
        }
        if let Some(n) = parse_positive(&lookup, "EKKLESIA_DEDUP_WINDOW") {
            config.dedup_window = n;
        }
        if let Some(n) = parse_positive(&lookup, "EKKLESIA_PREVIEW_CHARS") {
            config.preview_chars = n;
        }
        if let Some(val) = lookup("EKKLESIA_SUBSCRIBE_RETRIES") {
            match val.parse::<u32>() {
                Ok(n) => config.subscribe_retries = n,
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid EKKLESIA_SUBSCRIBE_RETRIES, using default"
                ),
            }
        }
        if let Some(ms) = parse_positive(&lookup, "EKKLESIA_SUBSCRIBE_BACKOFF_MS") {
            config.subscribe_backoff = Duration::from_millis(ms as u64);
        }

        config
    }
}

fn parse_positive<F>(lookup: &F, name: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let val = lookup(name)?;
    match val.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(variable = name, value = %val, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dedup_window, DEFAULT_DEDUP_WINDOW);
        assert_eq!(config.subscribe_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let vars: HashMap<&str, &str> = [
            ("EKKLESIA_DEDUP_WINDOW", "16"),
            ("EKKLESIA_PREVIEW_CHARS", "0"),
            ("EKKLESIA_SUBSCRIBE_RETRIES", "many"),
            ("EKKLESIA_SUBSCRIBE_BACKOFF_MS", "10"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.dedup_window, 16);
        assert_eq!(config.preview_chars, DEFAULT_PREVIEW_CHARS);
        assert_eq!(config.subscribe_retries, DEFAULT_SUBSCRIBE_RETRIES);
        assert_eq!(config.subscribe_backoff, Duration::from_millis(10));
    }
}
