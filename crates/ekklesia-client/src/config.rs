//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the console starts with zero
//! configuration for local development.

use std::path::PathBuf;

use ekklesia_shared::UserId;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SQLite database file.
    /// Env: `EKKLESIA_DB_PATH`
    /// Default: `None` (platform data directory).
    pub db_path: Option<PathBuf>,

    /// Identity of the local user.
    /// Env: `EKKLESIA_USER_ID`
    /// Default: `"ana"`
    pub user_id: UserId,

    /// Seed demo contacts, a group and a few messages on startup.
    /// Env: `EKKLESIA_SEED_DEMO` (true/false)
    /// Default: `true`
    pub seed_demo: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            user_id: UserId::new("ana"),
            seed_demo: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("EKKLESIA_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(user) = lookup("EKKLESIA_USER_ID") {
            let user = user.trim();
            if user.is_empty() || user.contains(':') {
                tracing::warn!(value = %user, "Invalid EKKLESIA_USER_ID, using default");
            } else {
                config.user_id = UserId::new(user);
            }
        }

        if let Some(val) = lookup("EKKLESIA_SEED_DEMO") {
            config.seed_demo = val != "false" && val != "0";
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert!(config.db_path.is_none());
        assert_eq!(config.user_id, UserId::new("ana"));
        assert!(config.seed_demo);
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("EKKLESIA_DB_PATH", "/tmp/chat.db"),
            ("EKKLESIA_USER_ID", "bruno"),
            ("EKKLESIA_SEED_DEMO", "0"),
        ]));
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/chat.db")));
        assert_eq!(config.user_id, UserId::new("bruno"));
        assert!(!config.seed_demo);
    }

    #[test]
    fn test_invalid_user_keeps_default() {
        let config = ClientConfig::from_lookup(lookup(&[("EKKLESIA_USER_ID", "a:b")]));
        assert_eq!(config.user_id, UserId::new("ana"));
    }
}
