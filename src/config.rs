use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::locales;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_DATABASE_FILE: &str = "reviews.db";
const DEFAULT_CACHE_TTL_MINUTES: u64 = 1440;
const DEFAULT_MONITOR_POLL_SECONDS: u64 = 60;
const DEFAULT_MAX_EXTRACTOR_SESSIONS: usize = 2;
const DEFAULT_RETRY_DELAY_SECONDS: u64 = 300;
const DEFAULT_BROWSERLESS_URL: &str = "http://localhost:3000";
const DEFAULT_NAVIGATION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SELECTOR_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub cache_ttl_minutes: u64,
    pub monitor_poll_seconds: u64,
    pub max_extractor_sessions: usize,
    pub default_locales: Vec<String>,
    pub retry_delay_seconds: u64,
    pub browserless_url: String,
    pub browserless_token: Option<SecretString>,
    pub navigation_timeout_ms: u64,
    pub selector_timeout_ms: u64,
    pub screenshot_dir: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub cache_ttl_minutes: u64,
    pub monitor_poll_seconds: u64,
    pub max_extractor_sessions: usize,
    pub default_locales: Vec<String>,
    pub retry_delay_seconds: u64,
    pub browserless_url: String,
    pub has_browserless_token: bool,
    pub navigation_timeout_ms: u64,
    pub selector_timeout_ms: u64,
}

/// Values read from the optional TOML config file. Keys may sit at the top level
/// or under an `[app]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOverrides {
    data_dir: Option<PathBuf>,
    database_file_name: Option<String>,
    cache_ttl_minutes: Option<u64>,
    monitor_poll_seconds: Option<u64>,
    max_extractor_sessions: Option<usize>,
    default_locales: Option<Vec<String>>,
    retry_delay_seconds: Option<u64>,
    browserless_url: Option<String>,
    browserless_token: Option<String>,
    navigation_timeout_ms: Option<u64>,
    selector_timeout_ms: Option<u64>,
    screenshot_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Built-in defaults rooted at `data_dir`, ignoring the environment.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            screenshot_dir: data_dir.join("screenshots"),
            data_dir,
            database_file_name: DEFAULT_DATABASE_FILE.to_string(),
            cache_ttl_minutes: DEFAULT_CACHE_TTL_MINUTES,
            monitor_poll_seconds: DEFAULT_MONITOR_POLL_SECONDS,
            max_extractor_sessions: DEFAULT_MAX_EXTRACTOR_SESSIONS,
            default_locales: vec!["en-US".to_string()],
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            browserless_url: DEFAULT_BROWSERLESS_URL.to_string(),
            browserless_token: None,
            navigation_timeout_ms: DEFAULT_NAVIGATION_TIMEOUT_MS,
            selector_timeout_ms: DEFAULT_SELECTOR_TIMEOUT_MS,
        }
    }

    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let data_dir = env::var("DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let screenshot_dir = env::var("SCREENSHOT_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("screenshots"));
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| DEFAULT_DATABASE_FILE.to_string()),
            cache_ttl_minutes: parse_u64("CACHE_TTL_MINUTES", DEFAULT_CACHE_TTL_MINUTES),
            monitor_poll_seconds: parse_u64("MONITOR_POLL_SECONDS", DEFAULT_MONITOR_POLL_SECONDS)
                .max(1),
            max_extractor_sessions: parse_usize(
                "MAX_EXTRACTOR_SESSIONS",
                DEFAULT_MAX_EXTRACTOR_SESSIONS,
            )
            .max(1),
            default_locales: parse_locales("DEFAULT_LOCALES"),
            retry_delay_seconds: parse_u64("RETRY_DELAY_SECONDS", DEFAULT_RETRY_DELAY_SECONDS)
                .max(1),
            browserless_url: env::var("BROWSERLESS_URL")
                .unwrap_or_else(|_| DEFAULT_BROWSERLESS_URL.to_string()),
            browserless_token: env::var("BROWSERLESS_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            navigation_timeout_ms: parse_u64(
                "NAVIGATION_TIMEOUT_MS",
                DEFAULT_NAVIGATION_TIMEOUT_MS,
            ),
            selector_timeout_ms: parse_u64("SELECTOR_TIMEOUT_MS", DEFAULT_SELECTOR_TIMEOUT_MS),
            screenshot_dir,
            data_dir,
        }
    }

    /// Environment first, then the TOML file named by `CONFIG_FILE` (or `config.toml`
    /// in the working directory) on top.
    pub fn load() -> AppResult<Self> {
        let mut config = Self::from_env();
        let explicit = env::var("CONFIG_FILE").ok().filter(|v| !v.trim().is_empty());
        let path = explicit
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        match fs::read_to_string(&path) {
            Ok(raw) => config.apply_file(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound && explicit.is_none() => {
                debug!(path = %path.display(), "no config file found; using environment only");
            }
            Err(err) => {
                return Err(AppError::Config(format!(
                    "failed to read config file {}: {err}",
                    path.display()
                )))
            }
        }
        Ok(config)
    }

    fn apply_file(&mut self, raw: &str) -> AppResult<()> {
        let mut table: toml::Table = toml::from_str(raw)?;
        let section = match table.remove("app") {
            Some(toml::Value::Table(app)) => app,
            Some(_) => {
                return Err(AppError::Config(
                    "config file key `app` must be a table".into(),
                ))
            }
            None => table,
        };
        let overrides: FileOverrides = toml::Value::Table(section).try_into()?;
        self.apply_overrides(overrides);
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: FileOverrides) {
        if let Some(data_dir) = overrides.data_dir {
            if overrides.screenshot_dir.is_none() && self.screenshot_dir.starts_with(&self.data_dir)
            {
                self.screenshot_dir = data_dir.join("screenshots");
            }
            self.data_dir = data_dir;
        }
        if let Some(value) = overrides.database_file_name {
            self.database_file_name = value;
        }
        if let Some(value) = overrides.cache_ttl_minutes {
            self.cache_ttl_minutes = value;
        }
        if let Some(value) = overrides.monitor_poll_seconds {
            self.monitor_poll_seconds = value.max(1);
        }
        if let Some(value) = overrides.max_extractor_sessions {
            self.max_extractor_sessions = value.max(1);
        }
        if let Some(value) = overrides.default_locales {
            let kept = locales::retain_supported(&value);
            if !kept.is_empty() {
                self.default_locales = kept;
            }
        }
        if let Some(value) = overrides.retry_delay_seconds {
            self.retry_delay_seconds = value.max(1);
        }
        if let Some(value) = overrides.browserless_url {
            self.browserless_url = value;
        }
        if let Some(value) = overrides.browserless_token.filter(|v| !v.trim().is_empty()) {
            self.browserless_token = Some(SecretString::from(value));
        }
        if let Some(value) = overrides.navigation_timeout_ms {
            self.navigation_timeout_ms = value;
        }
        if let Some(value) = overrides.selector_timeout_ms {
            self.selector_timeout_ms = value;
        }
        if let Some(value) = overrides.screenshot_dir {
            self.screenshot_dir = value;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        i64::try_from(self.cache_ttl_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn screenshot_dir(&self) -> &Path {
        &self.screenshot_dir
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            cache_ttl_minutes: self.cache_ttl_minutes,
            monitor_poll_seconds: self.monitor_poll_seconds,
            max_extractor_sessions: self.max_extractor_sessions,
            default_locales: self.default_locales.clone(),
            retry_delay_seconds: self.retry_delay_seconds,
            browserless_url: self.browserless_url.clone(),
            has_browserless_token: self.browserless_token.is_some(),
            navigation_timeout_ms: self.navigation_timeout_ms,
            selector_timeout_ms: self.selector_timeout_ms,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_locales(key: &str) -> Vec<String> {
    let requested: Vec<String> = env::var(key)
        .map(|v| v.split(',').map(|part| part.trim().to_string()).collect())
        .unwrap_or_default();
    let kept = locales::retain_supported(&requested);
    if kept.is_empty() {
        vec!["en-US".to_string()]
    } else {
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("BROWSERLESS_TOKEN", "secret");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("MAX_EXTRACTOR_SESSIONS", "0");
        env::set_var("DEFAULT_LOCALES", "cs-CZ, xx-XX ,en-US");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert!(public.has_browserless_token);
        assert!(config.browserless_token.is_some());
        assert_eq!(public.max_extractor_sessions, 1);
        assert_eq!(
            public.default_locales,
            vec!["cs-CZ".to_string(), "en-US".to_string()]
        );
        assert_eq!(public.cache_ttl_minutes, DEFAULT_CACHE_TTL_MINUTES);
    }

    #[test]
    fn applies_nested_file_overrides() {
        let mut config = AppConfig::with_data_dir("/srv/reviews");
        config
            .apply_file(
                r#"
                [app]
                cache_ttl_minutes = 30
                max_extractor_sessions = 4
                default_locales = ["de-DE", "nope"]
                data_dir = "/var/lib/reviews"
                "#,
            )
            .unwrap();
        assert_eq!(config.cache_ttl_minutes, 30);
        assert_eq!(config.max_extractor_sessions, 4);
        assert_eq!(config.default_locales, vec!["de-DE".to_string()]);
        assert_eq!(
            config.screenshot_dir,
            PathBuf::from("/var/lib/reviews/screenshots")
        );
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/reviews/reviews.db")
        );
    }

    #[test]
    fn oversized_ttl_saturates() {
        let mut config = AppConfig::with_data_dir("/srv/reviews");
        config.cache_ttl_minutes = 1_000_000_000_000_000;
        assert_eq!(config.cache_ttl(), chrono::Duration::MAX);
        config.cache_ttl_minutes = u64::MAX;
        assert_eq!(config.cache_ttl(), chrono::Duration::MAX);
        config.cache_ttl_minutes = 90;
        assert_eq!(config.cache_ttl(), chrono::Duration::minutes(90));
    }

    #[test]
    fn applies_flat_file_overrides_and_rejects_unknown_keys() {
        let mut config = AppConfig::with_data_dir("/srv/reviews");
        config.apply_file("monitor_poll_seconds = 0\n").unwrap();
        assert_eq!(config.monitor_poll_seconds, 1);

        config.apply_file("retry_delay_seconds = 0\n").unwrap();
        assert_eq!(config.retry_delay(), Duration::from_secs(1));

        let err = config.apply_file("surprise = true\n").unwrap_err();
        assert!(matches!(err, AppError::ConfigFile(_)));
    }
}
