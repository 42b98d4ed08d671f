use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::http::ArchiveClientConfig;
use crate::archive::media::MediaPreference;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Pools {
    pub max_download_concurrency: usize,
    pub max_scan_concurrency: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Archive {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry_attempts: usize,
    pub base_retry_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

/// Adaptive request spacing, see [crate::archive::rate_limiter].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Rate {
    pub base_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub slow_request_threshold_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    /// `json` or `plain`
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Download {
    pub media: MediaPreference,
    pub check_license: bool,
    pub get_captions: bool,
    pub record_done: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Search {
    pub rows_per_page: usize,
    /// 0 means no limit
    pub max_results: usize,
    pub content_terms: Vec<String>,
    pub keyword_terms: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub pools: Pools,
    pub archive: Archive,
    pub rate: Rate,
    pub logging: Logging,
    pub download: Download,
    pub search: Search,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            log_directory: "./logs".to_string(),
        }
    }
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            max_download_concurrency: 5,
            max_scan_concurrency: 15,
        }
    }
}

impl Default for Archive {
    fn default() -> Self {
        Self {
            base_url: "https://archive.org".to_string(),
            user_agent: format!("archive_fetch/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 120,
            connect_timeout_secs: 30,
            retry_attempts: 3,
            base_retry_delay_ms: 1000,
            access_key: None,
            secret_key: None,
        }
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            min_delay_ms: 50,
            max_delay_ms: 10_000,
            slow_request_threshold_ms: 3000,
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
            log_to_terminal: true,
            log_to_file: true,
        }
    }
}

impl Default for Download {
    fn default() -> Self {
        Self {
            media: MediaPreference::Both,
            check_license: true,
            get_captions: true,
            record_done: false,
        }
    }
}

impl Default for Search {
    fn default() -> Self {
        let content_terms = [
            "podcast", "conversation", "discussion", "debate", "interview", "talk", "talks",
            "talk show", "guest talk", "dialog", "dialogue", "tedtalk",
        ];
        let keyword_terms = [
            "latin american", "latinx american", "latino american", "latina american",
            "mexican american", "cuban american", "costa rican american", "puerto rican american",
            "brazilian american", "colombian american", "asian american", "indian american",
            "korean american", "chinese american", "japanese american", "south asian american",
            "middle eastern american", "vietnamese american", "indonesian american",
            "malaysian american", "african american", "black american", "nigerian american",
            "sudanese american", "egyptian american", "libyan american", "algerian american",
        ];
        Self {
            rows_per_page: 500,
            max_results: 0,
            content_terms: content_terms.iter().map(|s| s.to_string()).collect(),
            keyword_terms: keyword_terms.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AppConfig {
    /// Rejects settings no run could work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pools.max_download_concurrency == 0 || self.pools.max_scan_concurrency == 0 {
            return Err(ConfigError::Invalid("pool sizes must be at least 1".to_string()));
        }
        if self.archive.retry_attempts == 0 {
            return Err(ConfigError::Invalid("archive.retry_attempts must be at least 1".to_string()));
        }
        if self.search.rows_per_page == 0 {
            return Err(ConfigError::Invalid("search.rows_per_page must be at least 1".to_string()));
        }
        if self.archive.access_key.is_some() != self.archive.secret_key.is_some() {
            return Err(ConfigError::Invalid(
                "archive.access_key and archive.secret_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// The explicit configuration handed to the HTTP archive client.
    pub fn archive_client_config(&self) -> ArchiveClientConfig {
        let credentials = match (&self.archive.access_key, &self.archive.secret_key) {
            (Some(access), Some(secret)) => Some((access.clone(), secret.clone())),
            _ => None,
        };
        ArchiveClientConfig {
            base_url: self.archive.base_url.trim_end_matches('/').to_string(),
            user_agent: self.archive.user_agent.clone(),
            timeout: Duration::from_secs(self.archive.timeout_secs),
            connect_timeout: Duration::from_secs(self.archive.connect_timeout_secs),
            retry_attempts: self.archive.retry_attempts,
            base_retry_delay_ms: self.archive.base_retry_delay_ms,
            credentials,
            rate: (&self.rate).into(),
        }
    }
}

/// Owns the loaded [AppConfig] and the file it came from.
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
    created_default: bool,
}

impl ConfigManager {
    /// Loads the config file, writing a default one when it does not exist yet.
    pub fn new(config_path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let exists = config_path.exists();
        let app_config = Self::load_app_config(&config_path)?;
        app_config.validate()?;

        let manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_path,
            created_default: !exists,
        };
        if !exists {
            manager.create_default_config()?;
        }
        Ok(manager)
    }

    fn load_app_config(config_path: &Path) -> ConfigResult<AppConfig> {
        if !config_path.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(config_path)?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// True when the file was missing and has just been written with defaults.
    ///
    /// Loading happens before the logger exists, so the caller reports this once
    /// logging is up.
    pub fn created_default(&self) -> bool {
        self.created_default
    }

    pub fn get_app_config(&self) -> ConfigResult<AppConfig> {
        self.app_config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.clone())
    }

    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let toml_string =
            toml::to_string_pretty(config).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config_path, toml_string)?;

        let mut app_config = self
            .app_config
            .write()
            .map_err(|e| ConfigError::LockError(e.to_string()))?;
        *app_config = config.clone();
        Ok(())
    }

    fn create_default_config(&self) -> ConfigResult<()> {
        let config = self.get_app_config()?;
        self.save_app_config(&config)
    }
}
