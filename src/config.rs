//! Process configuration: defaults, then a TOML file, then `ROOMKEEPER_*`
//! environment overrides, then validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveTime, TimeDelta};
use chrono_tz::Tz;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::engine::BookingPolicy;
use crate::limits::DEFAULT_MAX_DURATION_MINUTES;
use crate::model::{Room, RoomId};
use crate::store::{NotionSettings, PropertyMap, RetryPolicy};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub booking: BookingConfig,
    pub rooms: Vec<RoomConfig>,
    pub teams: Vec<String>,
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub briefing: BriefingConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
    pub drain_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BookingConfig {
    /// IANA zone name used for recurrence and calendar days.
    pub timezone: String,
    pub max_duration_minutes: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RoomConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Notion,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub notion: NotionConfig,
}

#[derive(Clone, Debug)]
pub struct NotionConfig {
    pub base_url: String,
    pub token: Option<SecretString>,
    pub database_id: Option<String>,
    pub api_version: String,
    pub timeout_secs: u64,
    pub properties: PropertyMap,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct BriefingConfig {
    pub enabled: bool,
    /// Local delivery time, `HH:MM`.
    pub at: String,
    pub webhook_url: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsConfig {
    pub port: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0".to_string(),
                port: 7878,
                max_connections: 256,
                drain_secs: 10,
            },
            booking: BookingConfig {
                timezone: "UTC".to_string(),
                max_duration_minutes: DEFAULT_MAX_DURATION_MINUTES,
            },
            rooms: Vec::new(),
            teams: Vec::new(),
            store: StoreConfig {
                backend: StoreBackend::Memory,
                notion: NotionConfig {
                    base_url: "https://api.notion.com/v1".to_string(),
                    token: None,
                    database_id: None,
                    api_version: "2022-06-28".to_string(),
                    timeout_secs: 10,
                    properties: PropertyMap::default(),
                },
            },
            retry: RetryConfig {
                max_attempts: 4,
                base_delay_ms: 200,
                max_delay_ms: 5_000,
            },
            briefing: BriefingConfig {
                enabled: false,
                at: "08:30".to_string(),
                webhook_url: None,
                timeout_secs: 10,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Compact,
            },
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "notion" => Ok(Self::Notion),
            other => Err(ConfigError::Validation(format!(
                "unsupported store backend `{other}` (expected memory|notion)"
            ))),
        }
    }
}

impl AppConfig {
    /// Load from `path` (or `roomkeeper.toml` / `config/roomkeeper.toml` when
    /// present) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = match path {
            Some(p) if p.exists() => Some(p.to_path_buf()),
            Some(p) => return Err(ConfigError::MissingConfigFile(p.to_path_buf())),
            None => [PathBuf::from("roomkeeper.toml"), PathBuf::from("config/roomkeeper.toml")]
                .into_iter()
                .find(|p| p.exists()),
        };
        let raw = resolved
            .map(|p| fs::read_to_string(&p).map_err(|source| ConfigError::ReadFile { path: p, source }))
            .transpose()?;
        Self::from_sources(raw.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from optional TOML text and an environment lookup.
    pub fn from_sources(toml_text: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = toml_text {
            let interpolated = interpolate_env_vars(raw, &env)?;
            let patch: ConfigPatch = toml::from_str(&interpolated)?;
            config.apply_patch(patch);
        }
        config.apply_env_overrides(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind) = server.bind {
                self.server.bind = bind;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(max_connections) = server.max_connections {
                self.server.max_connections = max_connections;
            }
            if let Some(drain_secs) = server.drain_secs {
                self.server.drain_secs = drain_secs;
            }
        }

        if let Some(booking) = patch.booking {
            if let Some(timezone) = booking.timezone {
                self.booking.timezone = timezone;
            }
            if let Some(max) = booking.max_duration_minutes {
                self.booking.max_duration_minutes = max;
            }
        }

        if let Some(rooms) = patch.rooms {
            self.rooms = rooms;
        }
        if let Some(teams) = patch.teams {
            self.teams = teams;
        }

        if let Some(store) = patch.store {
            if let Some(backend) = store.backend {
                self.store.backend = backend;
            }
            if let Some(notion) = store.notion {
                let n = &mut self.store.notion;
                if let Some(base_url) = notion.base_url {
                    n.base_url = base_url;
                }
                if let Some(token) = notion.token {
                    n.token = Some(SecretString::from(token));
                }
                if let Some(database_id) = notion.database_id {
                    n.database_id = Some(database_id);
                }
                if let Some(api_version) = notion.api_version {
                    n.api_version = api_version;
                }
                if let Some(timeout_secs) = notion.timeout_secs {
                    n.timeout_secs = timeout_secs;
                }
                if let Some(properties) = notion.properties {
                    n.properties = properties;
                }
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(max_attempts) = retry.max_attempts {
                self.retry.max_attempts = max_attempts;
            }
            if let Some(base_delay_ms) = retry.base_delay_ms {
                self.retry.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = retry.max_delay_ms {
                self.retry.max_delay_ms = max_delay_ms;
            }
        }

        if let Some(briefing) = patch.briefing {
            if let Some(enabled) = briefing.enabled {
                self.briefing.enabled = enabled;
            }
            if let Some(at) = briefing.at {
                self.briefing.at = at;
            }
            if let Some(url) = briefing.webhook_url {
                self.briefing.webhook_url = Some(SecretString::from(url));
            }
            if let Some(timeout_secs) = briefing.timeout_secs {
                self.briefing.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(metrics) = patch.metrics
            && let Some(port) = metrics.port
        {
            self.metrics.port = Some(port);
        }
    }

    fn apply_env_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let read = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = read("ROOMKEEPER_BIND") {
            self.server.bind = value;
        }
        if let Some(value) = read("ROOMKEEPER_PORT") {
            self.server.port = parse_env("ROOMKEEPER_PORT", &value)?;
        }
        if let Some(value) = read("ROOMKEEPER_MAX_CONNECTIONS") {
            self.server.max_connections = parse_env("ROOMKEEPER_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read("ROOMKEEPER_TIMEZONE") {
            self.booking.timezone = value;
        }
        if let Some(value) = read("ROOMKEEPER_STORE") {
            self.store.backend = value.parse()?;
        }
        if let Some(value) = read("ROOMKEEPER_NOTION_BASE_URL") {
            self.store.notion.base_url = value;
        }
        if let Some(value) = read("ROOMKEEPER_NOTION_TOKEN") {
            self.store.notion.token = Some(SecretString::from(value));
        }
        if let Some(value) = read("ROOMKEEPER_NOTION_DATABASE_ID") {
            self.store.notion.database_id = Some(value);
        }
        if let Some(value) = read("ROOMKEEPER_BRIEFING_ENABLED") {
            self.briefing.enabled = parse_env("ROOMKEEPER_BRIEFING_ENABLED", &value)?;
        }
        if let Some(value) = read("ROOMKEEPER_BRIEFING_AT") {
            self.briefing.at = value;
        }
        if let Some(value) = read("ROOMKEEPER_BRIEFING_WEBHOOK_URL") {
            self.briefing.webhook_url = Some(SecretString::from(value));
        }
        if let Some(value) = read("ROOMKEEPER_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read("ROOMKEEPER_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }
        if let Some(value) = read("ROOMKEEPER_METRICS_PORT") {
            self.metrics.port = Some(parse_env("ROOMKEEPER_METRICS_PORT", &value)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timezone()?;
        if self.booking.max_duration_minutes <= 0 {
            return Err(invalid("booking.max_duration_minutes must be greater than zero"));
        }
        if self.server.max_connections == 0 {
            return Err(invalid("server.max_connections must be greater than zero"));
        }
        validate_rooms(&self.rooms)?;
        if self.teams.iter().any(|t| t.trim().is_empty()) {
            return Err(invalid("teams must not contain empty names"));
        }
        if self.store.backend == StoreBackend::Notion {
            self.notion_settings()?;
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        self.briefing_time()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.booking
            .timezone
            .parse::<Tz>()
            .map_err(|_| invalid(format!("booking.timezone `{}` is not an IANA zone", self.booking.timezone)))
    }

    pub fn briefing_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.briefing.at.trim(), "%H:%M")
            .map_err(|_| invalid(format!("briefing.at `{}` must be HH:MM", self.briefing.at)))
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.rooms
            .iter()
            .map(|r| Room {
                id: RoomId::new(r.id.trim()),
                name: r.name.clone(),
                capacity: r.capacity,
            })
            .collect()
    }

    pub fn booking_policy(&self) -> Result<BookingPolicy, ConfigError> {
        Ok(BookingPolicy {
            timezone: self.timezone()?,
            max_duration: TimeDelta::minutes(self.booking.max_duration_minutes),
            teams: self.teams.iter().map(|t| t.trim().to_string()).collect(),
            default_room: self
                .rooms
                .iter()
                .find(|r| r.default)
                .map(|r| RoomId::new(r.id.trim())),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn notion_settings(&self) -> Result<NotionSettings, ConfigError> {
        let n = &self.store.notion;
        let token = n
            .token
            .clone()
            .filter(|t| !t.expose_secret().is_empty())
            .ok_or_else(|| invalid("store.notion.token is required for the notion backend"))?;
        let database_id = n
            .database_id
            .clone()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| invalid("store.notion.database_id is required for the notion backend"))?;
        Ok(NotionSettings {
            base_url: n.base_url.clone(),
            token,
            database_id,
            api_version: n.api_version.clone(),
            timeout: Duration::from_secs(n.timeout_secs),
            properties: n.properties.clone(),
        })
    }
}

fn validate_rooms(rooms: &[RoomConfig]) -> Result<(), ConfigError> {
    if rooms.is_empty() {
        return Err(invalid("at least one [[rooms]] entry is required"));
    }
    let mut seen = HashSet::new();
    for room in rooms {
        let id = room.id.trim();
        if id.is_empty() {
            return Err(invalid("rooms.id must not be empty"));
        }
        if !seen.insert(id) {
            return Err(invalid(format!("duplicate room id `{id}`")));
        }
    }
    if rooms.iter().filter(|r| r.default).count() > 1 {
        return Err(invalid("at most one room may be marked default"));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Replace `${VAR}` with the variable's value.
fn interpolate_env_vars(input: &str, env: &impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }
            let value = env(&key).ok_or(ConfigError::MissingEnvInterpolation { var: key })?;
            output.push_str(&value);
            continue;
        }
        output.push(ch);
    }
    Ok(output)
}

// ── File shape (every field optional) ─────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    booking: Option<BookingPatch>,
    rooms: Option<Vec<RoomConfig>>,
    teams: Option<Vec<String>>,
    store: Option<StorePatch>,
    retry: Option<RetryPatch>,
    briefing: Option<BriefingPatch>,
    logging: Option<LoggingPatch>,
    metrics: Option<MetricsPatch>,
}

#[derive(Debug, Deserialize)]
struct ServerPatch {
    bind: Option<String>,
    port: Option<u16>,
    max_connections: Option<usize>,
    drain_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BookingPatch {
    timezone: Option<String>,
    max_duration_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StorePatch {
    backend: Option<StoreBackend>,
    notion: Option<NotionPatch>,
}

#[derive(Debug, Deserialize)]
struct NotionPatch {
    base_url: Option<String>,
    token: Option<String>,
    database_id: Option<String>,
    api_version: Option<String>,
    timeout_secs: Option<u64>,
    properties: Option<PropertyMap>,
}

#[derive(Debug, Deserialize)]
struct RetryPatch {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BriefingPatch {
    enabled: Option<bool>,
    at: Option<String>,
    webhook_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Deserialize)]
struct MetricsPatch {
    port: Option<u16>,
}
