use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub pool: PoolConfig,
    pub analyze: AnalyzeConfig,
    pub monitoring: MonitoringConfig,
    pub execution: ExecutionConfig,
    pub memory: MemoryConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Metadata store URL (config + event families).
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Connection pool caps and health probing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Process-wide connection ceiling.
    pub max_total: usize,
    pub max_per_datasource: usize,
    pub acquire_timeout_ms: u64,
    pub health_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzeConfig {
    pub max_correction_attempts: u32,
    pub end_to_end_timeout_ms: u64,
    /// Row ceiling applied to generated SQL before execution.
    pub max_rows: u64,
    /// Per-statement execution timeout.
    pub sql_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// Window during which a firing rule with an open alert stays silent.
    pub suppression_ms: u64,
    pub notify_max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_attempts_per_task: u32,
    /// Upper bound on steps per `run` call.
    pub step_cap: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// TTL for memoized schema summaries, seconds.
    pub schema_cache_ttl_secs: u64,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "chatbi")]
#[command(version, about = "ChatBI - conversational analytics engine")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Metadata database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,chatbi=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Monitoring tick interval (overrides config file, e.g., "60s", "5m")
    #[arg(long, value_name = "DURATION")]
    pub monitoring_interval: Option<String>,

    /// Enable/disable the monitoring loop (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub monitoring_enabled: Option<bool>,

    /// Process-wide connection ceiling (overrides config file)
    #[arg(long, value_name = "N")]
    pub pool_max_total: Option<usize>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file
    /// support.
    ///
    /// Priority from highest to lowest: CLI args, `APP_*` environment
    /// variables, config.toml, defaults.
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(&cli_args)
    }

    pub fn load_with_args(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Supported environment variables:
    /// - APP_DATABASE_URL: metadata store URL
    /// - APP_LOG_LEVEL: logging filter
    /// - APP_MONITORING_INTERVAL: tick interval ("60s", "5m")
    /// - APP_MONITORING_ENABLED: true/false
    /// - APP_POOL_MAX_TOTAL / APP_POOL_MAX_PER_DATASOURCE
    fn apply_env_overrides(&mut self) {
        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.url = db_url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(interval) = std::env::var("APP_MONITORING_INTERVAL") {
            match parse_duration_to_ms(&interval) {
                Ok(val) => {
                    self.monitoring.tick_interval_ms = val;
                    tracing::info!(
                        "Override monitoring.tick_interval_ms from env: {}",
                        self.monitoring.tick_interval_ms
                    );
                },
                Err(e) => tracing::warn!(
                    "Invalid APP_MONITORING_INTERVAL '{}': {} (keep {})",
                    interval,
                    e,
                    self.monitoring.tick_interval_ms
                ),
            }
        }

        if let Ok(enabled) = std::env::var("APP_MONITORING_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.monitoring.enabled = val;
            tracing::info!("Override monitoring.enabled from env: {}", self.monitoring.enabled);
        }

        if let Ok(max_total) = std::env::var("APP_POOL_MAX_TOTAL")
            && let Ok(val) = max_total.parse()
        {
            self.pool.max_total = val;
            tracing::info!("Override pool.max_total from env: {}", self.pool.max_total);
        }

        if let Ok(max_per) = std::env::var("APP_POOL_MAX_PER_DATASOURCE")
            && let Ok(val) = max_per.parse()
        {
            self.pool.max_per_datasource = val;
            tracing::info!(
                "Override pool.max_per_datasource from env: {}",
                self.pool.max_per_datasource
            );
        }
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(interval) = &args.monitoring_interval {
            match parse_duration_to_ms(interval) {
                Ok(val) => {
                    self.monitoring.tick_interval_ms = val;
                    tracing::info!(
                        "Override monitoring.tick_interval_ms from CLI: {}",
                        self.monitoring.tick_interval_ms
                    );
                },
                Err(e) => tracing::warn!(
                    "Invalid --monitoring-interval '{}': {} (keep {})",
                    interval,
                    e,
                    self.monitoring.tick_interval_ms
                ),
            }
        }

        if let Some(enabled) = args.monitoring_enabled {
            self.monitoring.enabled = enabled;
            tracing::info!("Override monitoring.enabled from CLI: {}", self.monitoring.enabled);
        }

        if let Some(max_total) = args.pool_max_total {
            self.pool.max_total = max_total;
            tracing::info!("Override pool.max_total from CLI: {}", self.pool.max_total);
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.pool.max_per_datasource == 0 || self.pool.max_total == 0 {
            anyhow::bail!("pool caps must be > 0");
        }
        if self.pool.max_per_datasource > self.pool.max_total {
            anyhow::bail!(
                "pool.max_per_datasource ({}) cannot exceed pool.max_total ({})",
                self.pool.max_per_datasource,
                self.pool.max_total
            );
        }
        if self.analyze.max_correction_attempts == 0 {
            anyhow::bail!("analyze.max_correction_attempts must be > 0");
        }
        if self.monitoring.tick_interval_ms == 0 {
            anyhow::bail!("monitoring.tick_interval_ms must be > 0");
        }
        if self.execution.step_cap == 0 {
            anyhow::bail!("execution.step_cap must be > 0");
        }
        if self.memory.max_events == 0 {
            anyhow::bail!("memory.max_events must be > 0");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/chatbi.db".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,chatbi=debug".to_string(), file: Some("logs/chatbi.log".to_string()) }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 50,
            max_per_datasource: 10,
            acquire_timeout_ms: 5_000,
            health_interval_ms: 30_000,
        }
    }
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            max_correction_attempts: 3,
            end_to_end_timeout_ms: 120_000,
            max_rows: 1_000,
            sql_timeout_ms: 30_000,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 60_000,
            suppression_ms: 900_000,
            notify_max_attempts: 3,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { max_attempts_per_task: 3, step_cap: 30 }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_events: 50_000 }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { enabled: true, schema_cache_ttl_secs: 300 }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_ms(input: &str) -> Result<u64, String> {
    // Plain numbers are treated as milliseconds.
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "ms" => Ok(n),
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n * 1_000),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60 * 1_000),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60 * 1_000),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}
