//! Explicit configuration for every autodialer component.
//!
//! Values come from an optional YAML file and are then overlaid with the
//! process environment. Components receive their section at construction and
//! never read the environment themselves.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the optional YAML config file.
pub const CONFIG_PATH_VAR: &str = "AUTODIALER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("missing voice provider setting: {0}")]
    MissingProvider(&'static str),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    pub twilio: TwilioConfig,
    pub llm: LlmConfig,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
    pub blog: BlogConfig,
    pub scrape: ScrapeConfig,
    pub http: HttpConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub base_url: String,
    pub voice: String,
    pub language: String,
    pub timeout_secs: u64,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            base_url: "https://api.twilio.com".into(),
            voice: "Polly.Aditi".into(),
            language: "en-IN".into(),
            timeout_secs: 30,
        }
    }
}

impl TwilioConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fails unless credentials and the caller id are all present.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.account_sid.trim().is_empty() {
            return Err(ConfigError::MissingProvider("TWILIO_ACCOUNT_SID"));
        }
        if self.auth_token.trim().is_empty() {
            return Err(ConfigError::MissingProvider("TWILIO_AUTH_TOKEN"));
        }
        if self.from_number.trim().is_empty() {
            return Err(ConfigError::MissingProvider("TWILIO_PHONE_NUMBER"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Blank means rule-based parsing only.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Model for the strict intent parser.
    pub model: String,
    /// Model for blog generation.
    pub blog_model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.perplexity.ai".into(),
            model: "sonar-small-online".into(),
            blog_model: "sonar-pro".into(),
            timeout_secs: 20,
        }
    }
}

impl LlmConfig {
    /// The API key, if one is set and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on records per bulk batch and entries per bulk upload.
    pub batch_limit: usize,
    /// Pause between successive bulk calls.
    pub inter_call_delay_ms: u64,
    /// Use the no-network gateway instead of the provider.
    pub dry_run: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            inter_call_delay_ms: 2000,
            dry_run: false,
        }
    }
}

impl DispatchConfig {
    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("autodialer.db"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BlogConfig {
    pub dir: PathBuf,
}

impl Default for BlogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("blog"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub program: String,
    pub script: PathBuf,
    /// Directory the scraper runs in and drops `scraped_profiles.json` into.
    pub project_root: PathBuf,
    pub out_dir: PathBuf,
    pub email: String,
    pub password: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            program: "python".into(),
            script: PathBuf::from("script/linkedin_scraper.py"),
            project_root: PathBuf::from("."),
            out_dir: PathBuf::from("tmp/scrapes"),
            email: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7000".into(),
        }
    }
}

impl DialerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the file named by `AUTODIALER_CONFIG` (if any), then apply the
    /// process environment on top.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |k: &str| std::env::var(k).ok();
        let mut cfg = match lookup(CONFIG_PATH_VAR) {
            Some(path) if !path.is_empty() => Self::from_path(path)?,
            _ => Self::default(),
        };
        cfg.apply_env(lookup)?;
        Ok(cfg)
    }

    /// Overlay values from `lookup`. Unset or empty variables leave the
    /// current value alone.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.is_empty());

        if let Some(v) = get("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = v;
        }
        if let Some(v) = get("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = v;
        }
        if let Some(v) = get("TWILIO_PHONE_NUMBER") {
            self.twilio.from_number = v;
        }
        if let Some(v) = get("TWILIO_BASE_URL") {
            self.twilio.base_url = v;
        }
        if let Some(v) = get("PPLX_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("PPLX_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("PPLX_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("PPLX_BLOG_MODEL") {
            self.llm.blog_model = v;
        }
        if let Some(v) = get("AUTODIALER_DB") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("AUTODIALER_BIND") {
            self.http.bind = v;
        }
        if let Some(v) = get("AUTODIALER_BLOG_DIR") {
            self.blog.dir = PathBuf::from(v);
        }
        if let Some(v) = get("AUTODIALER_CALL_DELAY_MS") {
            self.dispatch.inter_call_delay_ms =
                v.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "AUTODIALER_CALL_DELAY_MS",
                    value: v.clone(),
                })?;
        }
        if let Some(v) = get("AUTODIALER_DRY_RUN") {
            self.dispatch.dry_run = v == "1" || v.to_lowercase() == "true";
        }
        if let Some(v) = get("EMAIL") {
            self.scrape.email = v;
        }
        if let Some(v) = get("PASSWORD") {
            self.scrape.password = v;
        }
        Ok(())
    }
}
