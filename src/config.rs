use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the Kinin client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub poller: PollerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the interview API, without a trailing slash
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Beta-lite builds hide the admin console
    #[serde(default)]
    pub beta_lite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// Upper bound on status ticks per run; `None` polls until convergence
    #[serde(default)]
    pub max_ticks: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON file backing the durable store; in-memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Config {
    /// Load configuration from file with environment variable overrides
    /// ALWAYS returns a valid config - never fails
    pub fn load() -> Self {
        let env_paths = ["../.env", ".env"];

        let mut env_loaded = false;
        for path in &env_paths {
            if dotenvy::from_path(path).is_ok() {
                tracing::info!("Loaded .env from: {}", path);
                env_loaded = true;
                break;
            }
        }

        if !env_loaded {
            tracing::debug!("No .env file found - continuing with env vars only");
        }

        let config_path =
            env::var("KININ_CONFIG_PATH").unwrap_or_else(|_| "kinin.yaml".to_string());

        let mut config = Self::from_file(Path::new(&config_path));

        config.apply_env_overrides();

        // Validate configuration - log warnings but don't fail
        if let Err(e) = config.validate() {
            tracing::warn!("Config validation warnings: {} - continuing anyway", e);
        }

        config
    }

    fn from_file(path: &Path) -> Self {
        if !path.exists() {
            tracing::warn!(
                "Config file not found at {} - using defaults",
                path.display()
            );
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str::<Config>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to parse config file {}: {} - using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::error!(
                    "Failed to read config file {}: {} - using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // API overrides
        if let Some(base) = lookup("KININ_API_BASE") {
            self.api.base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(timeout) = lookup("KININ_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.api.request_timeout_secs = secs;
            }
        }
        if let Some(flag) = lookup("KININ_BETA_LITE") {
            self.api.beta_lite = matches!(flag.trim(), "1" | "true" | "yes");
        }

        // Poller overrides
        if let Some(interval) = lookup("KININ_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.poller.interval_ms = ms;
            }
        }
        if let Some(max) = lookup("KININ_POLL_MAX_TICKS") {
            match max.trim() {
                "" | "0" | "none" => self.poller.max_ticks = None,
                other => {
                    if let Ok(n) = other.parse() {
                        self.poller.max_ticks = Some(n);
                    }
                }
            }
        }

        // Store overrides
        if let Some(path) = lookup("KININ_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }

        // Token overrides
        if let Some(token) = lookup("KININ_ID_TOKEN") {
            self.auth.id_token = Some(token);
        }
        if let Some(token) = lookup("KININ_ACCESS_TOKEN") {
            self.auth.access_token = Some(token);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.api.base_url.is_empty() {
            return Err("api.base_url cannot be empty".into());
        }
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(format!("api.base_url must be an http(s) URL: {}", self.api.base_url).into());
        }
        if self.api.request_timeout_secs == 0 {
            return Err("api.request_timeout_secs cannot be 0".into());
        }
        if self.poller.interval_ms == 0 {
            return Err("poller.interval_ms cannot be 0".into());
        }
        if self.poller.max_ticks == Some(0) {
            return Err("poller.max_ticks must be at least 1 when set".into());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://127.0.0.1:8080".to_string(),
                request_timeout_secs: 30,
                beta_lite: false,
            },
            poller: PollerConfig {
                interval_ms: 1000,
                max_ticks: None,
            },
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}
