use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Which AI backend answers `/api/ai` requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    /// Hosted c00d.com endpoint (free tier without a license key)
    #[default]
    C00d,
    Anthropic,
    OpenAi,
    Ollama,
}

impl AiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::C00d => "c00d",
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    /// Providers that run on the local machine and cost nothing per call
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }
}

/// IP logging switch. Unset behaves as enabled, but is kept distinct from
/// an explicit `true` so the two can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "Option<bool>")]
pub enum LogIps {
    #[default]
    Unset,
    Enabled,
    Disabled,
}

impl From<Option<bool>> for LogIps {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Self::Unset,
            Some(true) => Self::Enabled,
            Some(false) => Self::Disabled,
        }
    }
}

impl LogIps {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// AI section
#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub provider: AiProvider,
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    /// Requests per day allowed on the free tier
    #[serde(default = "default_free_daily_limit")]
    pub free_daily_limit: u64,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_free_daily_limit() -> u64 {
    20
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::default(),
            license_key: String::new(),
            api_key: String::new(),
            model: default_model(),
            ollama_url: default_ollama_url(),
            free_daily_limit: default_free_daily_limit(),
        }
    }
}

impl AiConfig {
    /// Whether AI calls count against the free daily quota.
    ///
    /// Every code path that could skip the quota check must ask this
    /// function rather than re-deriving the condition.
    pub fn is_metered(&self) -> bool {
        self.license_key.is_empty() && self.api_key.is_empty() && !self.provider.is_local()
    }

    pub fn has_key(&self) -> bool {
        !self.api_key.is_empty() || !self.license_key.is_empty()
    }
}

/// Editor settings handed to the frontend as-is
#[derive(Debug, Clone, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_tab_size")]
    pub tab_size: u32,
}

fn default_theme() -> String {
    "vs-dark".to_string()
}
fn default_font_size() -> u32 {
    14
}
fn default_tab_size() -> u32 {
    4
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            font_size: default_font_size(),
            tab_size: default_tab_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Client IPs allowed to reach the server; empty allows everyone
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub log_ips: LogIps,
}

/// Configuration for the terminal endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_terminal_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_terminal_timeout() -> u64 {
    120_000
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_terminal_timeout(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub base_path: PathBuf,
    /// Empty disables authentication entirely
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub data_dir: PathBuf,
    /// Session lifetime in seconds
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime: u64,
    #[serde(default)]
    pub frontend_dir: Option<PathBuf>,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

fn default_port() -> u16 {
    3000
}

fn default_session_lifetime() -> u64 {
    86_400
}

/// Longest session lifetime accepted: the 400-day cap browsers put on a
/// cookie's `Max-Age`
pub const MAX_SESSION_LIFETIME: u64 = 400 * 86_400;

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            base_path: PathBuf::new(),
            password: String::new(),
            data_dir: PathBuf::new(),
            session_lifetime: default_session_lifetime(),
            frontend_dir: None,
            ai: AiConfig::default(),
            editor: EditorConfig::default(),
            security: SecurityConfig::default(),
            terminal: TerminalConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`. A missing file yields the defaults;
    /// an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        // An empty YAML document deserializes to unit, not a map
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Fill in settings that depend on the environment: the workspace root
    /// falls back to the current directory, the data directory to
    /// `<base_path>/.c00d`.
    pub fn apply_defaults(&mut self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            self.base_path = std::env::current_dir()?;
        }
        if self.data_dir.as_os_str().is_empty() {
            self.data_dir = self.base_path.join(".c00d");
        }
        Ok(())
    }

    pub fn password_required(&self) -> bool {
        !self.password.is_empty()
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_lifetime)
    }

    pub fn should_log_ips(&self) -> bool {
        self.security.log_ips.is_enabled()
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push(ValidationError {
                field: "port".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.session_lifetime == 0 {
            errors.push(ValidationError {
                field: "session_lifetime".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        } else if self.session_lifetime > MAX_SESSION_LIFETIME {
            errors.push(ValidationError {
                field: "session_lifetime".to_string(),
                message: format!("Must be at most {} seconds (400 days)", MAX_SESSION_LIFETIME),
            });
        }

        if self.ai.free_daily_limit == 0 {
            errors.push(ValidationError {
                field: "ai.free_daily_limit".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (i, ip) in self.security.allowed_ips.iter().enumerate() {
            if ip.trim().parse::<std::net::IpAddr>().is_err() {
                errors.push(ValidationError {
                    field: format!("security.allowed_ips[{}]", i),
                    message: format!("Invalid IP address '{}'", ip),
                });
            }
        }

        if let Some(dir) = &self.frontend_dir {
            if !dir.is_dir() {
                errors.push(ValidationError {
                    field: "frontend_dir".to_string(),
                    message: format!("Not a directory: {}", dir.display()),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
