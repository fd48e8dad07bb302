use chrono::NaiveTime;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base URL
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,
    /// Bot token; required when enabled
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Send for real; otherwise announcements are only logged
    #[serde(default)]
    pub enabled: bool,
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_url: default_telegram_api_url(),
            bot_token: None,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Expiry sweep interval (default: 60s)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Local time of the daily renewal run, "HH:MM" (default: 05:00)
    #[serde(default = "default_renewal_time")]
    pub renewal_time: String,
    /// How often the scheduler checks for due tasks (default: 1000ms)
    #[serde(default = "default_tick_resolution_ms")]
    pub tick_resolution_ms: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_renewal_time() -> String {
    "05:00".to_string()
}

fn default_tick_resolution_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            renewal_time: default_renewal_time(),
            tick_resolution_ms: default_tick_resolution_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn renewal_time(&self) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(self.renewal_time.trim(), "%H:%M")
            .map_err(|e| format!("renewal_time {:?} is not HH:MM: {}", self.renewal_time, e))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// IANA zone for all local-day arithmetic (default: Africa/Cairo)
    #[serde(default = "default_reference_timezone")]
    pub reference_timezone: String,
    /// Announcement dedup window in seconds (default: 10)
    #[serde(default = "default_announce_dedup_ttl_secs")]
    pub announce_dedup_ttl_secs: u64,
    /// Drop previous winners from later draws (default: true)
    #[serde(default = "default_exclude_previous_winners")]
    pub exclude_previous_winners: bool,
    /// Compare-and-swap attempts on an agent ledger (default: 5)
    #[serde(default = "default_max_ledger_retries")]
    pub max_ledger_retries: u32,
}

fn default_reference_timezone() -> String {
    "Africa/Cairo".to_string()
}

fn default_announce_dedup_ttl_secs() -> u64 {
    10
}

fn default_exclude_previous_winners() -> bool {
    true
}

fn default_max_ledger_retries() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reference_timezone: default_reference_timezone(),
            announce_dedup_ttl_secs: default_announce_dedup_ttl_secs(),
            exclude_previous_winners: default_exclude_previous_winners(),
            max_ledger_retries: default_max_ledger_retries(),
        }
    }
}

impl EngineConfig {
    pub fn timezone(&self) -> Result<Tz, String> {
        self.reference_timezone
            .parse::<Tz>()
            .map_err(|e| format!("reference_timezone {:?}: {}", self.reference_timezone, e))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONTEST_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONTEST_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("CONTEST")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for local runs without config files
    pub fn default_config(database_url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: default_max_connections(),
            },
            telegram: TelegramConfig::default(),
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url must be set".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }

        if self.telegram.enabled
            && self
                .telegram
                .bot_token
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
        {
            errors.push("telegram.bot_token is required when telegram.enabled".to_string());
        }

        if self.scheduler.sweep_interval_secs == 0 {
            errors.push("scheduler.sweep_interval_secs must be positive".to_string());
        }
        if self.scheduler.tick_resolution_ms == 0 {
            errors.push("scheduler.tick_resolution_ms must be positive".to_string());
        }
        if let Err(e) = self.scheduler.renewal_time() {
            errors.push(format!("scheduler.{}", e));
        }

        if let Err(e) = self.engine.timezone() {
            errors.push(format!("engine.{}", e));
        }
        if !(5..=10).contains(&self.engine.announce_dedup_ttl_secs) {
            errors.push("engine.announce_dedup_ttl_secs must be between 5 and 10".to_string());
        }
        if self.engine.max_ledger_retries == 0 {
            errors.push("engine.max_ledger_retries must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
