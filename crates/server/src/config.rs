use std::{collections::HashMap, fs};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub auth_secret: String,
    pub token_ttl_seconds: i64,
    pub typing_ttl_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8090".into(),
            database_url: "sqlite://./data/messaging.db".into(),
            auth_secret: "dev-secret-change-me".into(),
            token_ttl_seconds: 8 * 60 * 60,
            typing_ttl_ms: 2000,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("auth_secret") {
                settings.auth_secret = v.clone();
            }
            if let Some(v) = file_cfg.get("token_ttl_seconds") {
                if let Ok(parsed) = v.parse::<i64>() {
                    settings.token_ttl_seconds = parsed;
                }
            }
            if let Some(v) = file_cfg.get("typing_ttl_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.typing_ttl_ms = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("AUTH_SECRET") {
        settings.auth_secret = v;
    }
    if let Ok(v) = std::env::var("APP__AUTH_SECRET") {
        settings.auth_secret = v;
    }

    if let Ok(v) = std::env::var("APP__TOKEN_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.token_ttl_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__TYPING_TTL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.typing_ttl_ms = parsed;
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
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

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(path).parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create parent directory '{}' for database url '{database_url}'",
                parent.display()
            )
        })?;
    }

    Ok(())
}
