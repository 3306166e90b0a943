use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const SETTINGS_FILE: &str = "dream.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub database_url: String,
    pub status_poll_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9090".into(),
            database_url: "sqlite://./data/dream.db".into(),
            status_poll_seconds: 5,
        }
    }
}

impl Settings {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_seconds.max(1))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    database_url: Option<String>,
    status_poll_seconds: Option<u64>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the toml file if it exists, then environment overrides.
pub fn load_settings_from<F>(path: &Path, env: F) -> anyhow::Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
            if let Some(v) = file_cfg.server_url {
                settings.server_url = v;
            }
            if let Some(v) = file_cfg.database_url {
                settings.database_url = v;
            }
            if let Some(v) = file_cfg.status_poll_seconds {
                settings.status_poll_seconds = v;
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    }

    if let Some(v) = env("DREAM_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__STATUS_POLL_SECONDS") {
        if let Ok(parsed) = v.trim().parse::<u64>() {
            settings.status_poll_seconds = parsed;
        }
    }

    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
