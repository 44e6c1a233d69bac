use std::{collections::HashMap, fs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Firebase,
    Memory,
}

#[derive(Debug)]
pub struct Settings {
    pub backend: BackendKind,
    pub api_key: String,
    pub database_url: String,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Firebase,
            api_key: String::new(),
            database_url: String::new(),
            email: None,
            password: None,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("todo.toml") {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("backend") {
                    if let Some(parsed) = parse_backend(v) {
                        settings.backend = parsed;
                    }
                }
                if let Some(v) = file_cfg.get("api_key") {
                    settings.api_key = v.clone();
                }
                if let Some(v) = file_cfg.get("database_url") {
                    settings.database_url = v.clone();
                }
                if let Some(v) = file_cfg.get("email") {
                    settings.email = Some(v.clone());
                }
                if let Some(v) = file_cfg.get("password") {
                    settings.password = Some(v.clone());
                }
            }
            Err(err) => tracing::warn!("ignoring malformed todo.toml: {err}"),
        }
    }

    if let Ok(v) = std::env::var("TODO_BACKEND") {
        if let Some(parsed) = parse_backend(&v) {
            settings.backend = parsed;
        }
    }
    if let Ok(v) = std::env::var("TODO_API_KEY") {
        settings.api_key = v;
    }
    if let Ok(v) = std::env::var("TODO_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("TODO_EMAIL") {
        settings.email = Some(v);
    }
    if let Ok(v) = std::env::var("TODO_PASSWORD") {
        settings.password = Some(v);
    }

    settings
}

fn parse_backend(raw: &str) -> Option<BackendKind> {
    if raw.eq_ignore_ascii_case("firebase") {
        Some(BackendKind::Firebase)
    } else if raw.eq_ignore_ascii_case("memory") {
        Some(BackendKind::Memory)
    } else {
        None
    }
}
