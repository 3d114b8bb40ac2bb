//! # Mirror Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources (in priority order)
//! 1. Environment variables (highest priority)
//! 2. Config file (`mirror.toml` in the platform config dir)
//! 3. Default values (lowest priority)
//!
//! ## Example Config File
//! ```toml
//! [database]
//! path = "/var/lib/mirror/mirror.db"
//! max_connections = 5
//!
//! [api]
//! base_url = "https://shop.example.com/api/v1"
//! token = "T0k3n"
//! timeout_secs = 30
//!
//! [retry]
//! max_attempts = 5
//! backoff_ms = 60000
//! page_interval_ms = 334   # 180 requests per minute
//!
//! [entities.tickets]
//! lookback_days = 30
//!
//! [entities.products]
//! enabled = false
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use mirror_core::{catalog, EntityType};
use mirror_db::DbConfig;

use crate::error::{SyncError, SyncResult};
use crate::source::RetryPolicy;

// =============================================================================
// Database Settings
// =============================================================================

/// Where the mirror lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Pool size. One writer per entity task, so this bounds concurrency.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("com", "record-mirror", "mirror")
        .map(|dirs| dirs.data_dir().join("mirror.db"))
        .unwrap_or_else(|| PathBuf::from("mirror.db"))
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// API Settings
// =============================================================================

/// Remote API connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    /// e.g. `https://shop.example.com/api/v1`. Empty until configured.
    #[serde(default)]
    pub base_url: String,

    /// Bearer token used when an entity has no token of its own.
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl ApiSettings {
    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Retry and pacing of page requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per page, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed sleep between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Minimum gap between two page requests. 0 disables pacing.
    #[serde(default = "default_page_interval_ms")]
    pub page_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    60_000 // the API budget resets every minute
}
fn default_page_interval_ms() -> u64 {
    334
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            page_interval_ms: default_page_interval_ms(),
        }
    }
}

impl RetrySettings {
    /// Policy for [`RetryingSource`](crate::source::RetryingSource).
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }

    /// Gap for [`PacedSource`](crate::source::PacedSource).
    pub fn page_interval(&self) -> Duration {
        Duration::from_millis(self.page_interval_ms)
    }
}

// =============================================================================
// Entity Settings
// =============================================================================

/// Per-entity overrides of the built-in catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replaces the descriptor's endpoint path.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Replaces `[api].token` for this entity.
    #[serde(default)]
    pub token: Option<String>,

    /// Replaces the descriptor's default incremental window.
    #[serde(default)]
    pub lookback_days: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for EntitySettings {
    fn default() -> Self {
        EntitySettings {
            enabled: true,
            endpoint: None,
            token: None,
            lookback_days: None,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Keyed by catalog entity name.
    #[serde(default)]
    pub entities: BTreeMap<String, EntitySettings>,
}

impl MirrorConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (mirror.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::read_file(config_path)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads defaults and the config file only, ignoring the environment.
    pub fn load_file(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let config = Self::read_file(config_path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let Some(path) = config_path.or_else(Self::default_config_path) else {
            return Ok(Self::default());
        };
        if !path.exists() {
            debug!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(?path, "Loading mirror config from file");
        let contents = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Copy of this configuration carrying only the tokens of `file`.
    ///
    /// Tokens supplied through the environment stay out of anything
    /// written to disk.
    pub fn with_tokens_from(&self, file: &MirrorConfig) -> MirrorConfig {
        let mut config = self.clone();
        config.api.token = file.api.token.clone();
        for (name, settings) in config.entities.iter_mut() {
            settings.token = file.entities.get(name).and_then(|s| s.token.clone());
        }
        config.entities.retain(|name, settings| {
            file.entities.contains_key(name) || *settings != EntitySettings::default()
        });
        config
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, self.to_toml()?)?;

        info!(?path, "Mirror config saved");
        Ok(())
    }

    /// Renders the configuration as `mirror.toml` text.
    pub fn to_toml(&self) -> SyncResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates the configuration.
    ///
    /// An empty `base_url` is allowed here so `mirror status` works before
    /// the API is configured; the HTTP source refuses it.
    pub fn validate(&self) -> SyncResult<()> {
        let url = &self.api.base_url;
        if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                url
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "max_connections must be greater than 0".into(),
            ));
        }

        let known = catalog::names();
        for name in self.entities.keys() {
            if !known.contains(name) {
                return Err(SyncError::UnknownEntity(name.clone()));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("MIRROR_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(url) = var("MIRROR_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Some(token) = var("MIRROR_API_TOKEN") {
            self.api.token = Some(token);
        }

        if let Some(attempts) = var("MIRROR_MAX_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.retry.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid MIRROR_MAX_ATTEMPTS"),
            }
        }

        if let Some(backoff) = var("MIRROR_BACKOFF_MS") {
            match backoff.parse::<u64>() {
                Ok(ms) => self.retry.backoff_ms = ms,
                Err(_) => warn!(value = %backoff, "Ignoring invalid MIRROR_BACKOFF_MS"),
            }
        }

        if let Some(interval) = var("MIRROR_PAGE_INTERVAL_MS") {
            match interval.parse::<u64>() {
                Ok(ms) => self.retry.page_interval_ms = ms,
                Err(_) => warn!(value = %interval, "Ignoring invalid MIRROR_PAGE_INTERVAL_MS"),
            }
        }

        for name in catalog::names() {
            let key = format!("MIRROR_{}_TOKEN", name.to_uppercase());
            if let Some(token) = var(&key) {
                debug!(entity = %name, "Overriding entity token from environment");
                self.entities.entry(name).or_default().token = Some(token);
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "record-mirror", "mirror")
            .map(|dirs| dirs.config_dir().join("mirror.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Overrides for `entity`, or defaults when none are configured.
    pub fn entity_settings(&self, entity: &str) -> EntitySettings {
        self.entities.get(entity).cloned().unwrap_or_default()
    }

    /// Token for `entity`: its own, else the API-wide one.
    pub fn token_for(&self, entity: &str) -> Option<&str> {
        self.entities
            .get(entity)
            .and_then(|s| s.token.as_deref())
            .or(self.api.token.as_deref())
    }

    /// Applies endpoint and lookback overrides to a catalog descriptor.
    pub fn resolve(&self, entity: EntityType) -> EntityType {
        let settings = self.entity_settings(&entity.name);
        let mut entity = match settings.endpoint {
            Some(endpoint) => entity.endpoint(&endpoint),
            None => entity,
        };
        if let Some(days) = settings.lookback_days {
            entity.default_lookback_days = Some(days);
        }
        entity
    }

    /// Every enabled catalog entity, with overrides applied.
    pub fn enabled_entities(&self) -> Vec<EntityType> {
        catalog::all()
            .into_iter()
            .filter(|e| self.entity_settings(&e.name).enabled)
            .map(|e| self.resolve(e))
            .collect()
    }

    /// Looks up one entity by name, enabled or not, with overrides applied.
    pub fn entity(&self, name: &str) -> SyncResult<EntityType> {
        Ok(self.resolve(catalog::by_name(name)?))
    }

    /// Pool configuration for [`mirror_db::Database::new`].
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.database.path).max_connections(self.database.max_connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = MirrorConfig::default();
        assert!(config.api.base_url.is_empty());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.page_interval_ms, 334);
        assert_eq!(config.database.max_connections, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = MirrorConfig::default();

        config.api.base_url = "ftp://example.com".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.api.base_url = "https://example.com/api/v1".to_string();
        assert!(config.validate().is_ok());

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.retry.max_attempts = 3;

        config.entities.insert("widgets".into(), EntitySettings::default());
        assert!(matches!(config.validate(), Err(SyncError::UnknownEntity(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MIRROR_DB_PATH", "/tmp/override.db"),
            ("MIRROR_API_URL", "https://override.example.com"),
            ("MIRROR_API_TOKEN", "global"),
            ("MIRROR_MAX_ATTEMPTS", "9"),
            ("MIRROR_BACKOFF_MS", "not-a-number"),
            ("MIRROR_TICKETS_TOKEN", "tickets-only"),
        ]
        .into_iter()
        .collect();

        let mut config = MirrorConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.api.base_url, "https://override.example.com");
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.retry.backoff_ms, 60_000);
        assert_eq!(config.token_for("tickets"), Some("tickets-only"));
        assert_eq!(config.token_for("invoices"), Some("global"));
    }

    #[test]
    fn test_entity_overrides() {
        let toml_str = r#"
            [api]
            base_url = "https://shop.example.com/api/v1"

            [entities.tickets]
            lookback_days = 30
            endpoint = "tickets_v2"

            [entities.products]
            enabled = false
        "#;
        let config: MirrorConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());

        let tickets = config.entity("tickets").unwrap();
        assert_eq!(tickets.endpoint, "tickets_v2");
        assert_eq!(tickets.default_lookback_days, Some(30));

        let enabled: Vec<String> = config.enabled_entities().into_iter().map(|e| e.name).collect();
        assert!(!enabled.contains(&"products".to_string()));
        assert!(enabled.contains(&"tickets".to_string()));

        assert!(matches!(config.entity("widgets"), Err(SyncError::UnknownEntity(_))));
    }

    #[test]
    fn test_written_config_keeps_env_tokens_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.toml");
        std::fs::write(
            &path,
            r#"
            [api]
            base_url = "https://shop.example.com/api/v1"
            token = "from-file"

            [entities.tickets]
            lookback_days = 30
            "#,
        )
        .unwrap();

        let vars: HashMap<&str, &str> = [
            ("MIRROR_API_TOKEN", "env-secret"),
            ("MIRROR_TICKETS_TOKEN", "env-tickets"),
            ("MIRROR_INVOICES_TOKEN", "env-invoices"),
            ("MIRROR_MAX_ATTEMPTS", "7"),
        ]
        .into_iter()
        .collect();

        let file = MirrorConfig::load_file(Some(path.clone())).unwrap();
        let mut effective = file.clone();
        effective.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(effective.token_for("invoices"), Some("env-invoices"));

        effective.with_tokens_from(&file).save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("env-"));
        let written = MirrorConfig::load_file(Some(path)).unwrap();
        assert_eq!(written.api.token.as_deref(), Some("from-file"));
        assert_eq!(written.token_for("tickets"), Some("from-file"));
        assert_eq!(written.entity_settings("tickets").lookback_days, Some(30));
        assert!(!written.entities.contains_key("invoices"));
        assert_eq!(written.retry.max_attempts, 7);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mirror.toml");

        let mut config = MirrorConfig::default();
        config.api.base_url = "https://shop.example.com/api/v1".into();
        config.retry.page_interval_ms = 0;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[api]"));
        assert!(contents.contains("[retry]"));

        let loaded: MirrorConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.api.base_url, config.api.base_url);
        assert_eq!(loaded.retry.page_interval_ms, 0);
    }
}
