use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// DuckDB file holding cache, log, template and feedback tables.
    /// `:memory:` keeps everything in process.
    pub connection_string: String,
    pub pool_size: usize,
    /// Upper bound for a single storage call before it surfaces as unavailable.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WarehouseConfig {
    /// DuckDB file the generated SQL runs against.
    pub connection_string: String,
    pub pool_size: usize,
    pub max_rows: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// 0 disables the in-process maintenance timer.
    pub sweep_interval_secs: u64,
    /// Pending log entries older than this are sealed as timed out.
    pub pending_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum keyword score for a template to replace fresh generation.
    pub threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub warehouse: WarehouseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub matching: MatchingConfig,
    pub logging: LoggingConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// DuckDB file for the query memory tables
    #[arg(long)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Purge expired and invalid cache entries, seal stale pending logs
    Sweep,
    /// Print cache, feedback and usage statistics as JSON
    Stats,
    /// Load query templates from a JSON array file
    ImportTemplates {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-cube-memo/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NL_CUBE_MEMO__CACHE__TTL_SECS=600 and friends
        config_builder = config_builder.add_source(
            Environment::with_prefix("NL_CUBE_MEMO")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }

        Ok(config)
    }
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "nl-cube-memo.db".to_string(),
            pool_size: 5,
            timeout_ms: 5_000,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            connection_string: "nl-cube.db".to_string(),
            pool_size: 5,
            max_rows: 10_000,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
            timeout_secs: 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            sweep_interval_secs: 300,
            pending_timeout_secs: 600,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { threshold: 0.6 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { json: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_with(config: Option<PathBuf>) -> CliArgs {
        CliArgs {
            config,
            host: None,
            port: None,
            database: None,
            command: None,
        }
    }

    #[test]
    fn file_values_override_defaults_per_field() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[cache]\nttl_secs = 120\n\n[matching]\nthreshold = 0.75\n\n[web]\nport = 8088"
        )
        .unwrap();

        let config = AppConfig::new(&args_with(Some(file.path().to_path_buf()))).unwrap();

        assert_eq!(config.cache.ttl_secs, 120);
        assert_eq!(config.cache.pending_timeout_secs, 600);
        assert_eq!(config.matching.threshold, 0.75);
        assert_eq!(config.web.port, 8088);
        assert_eq!(config.web.host, "127.0.0.1");
        assert_eq!(config.database.pool_size, 5);
    }

    #[test]
    fn cli_arguments_win_over_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[web]\nhost = \"0.0.0.0\"\nport = 9000").unwrap();

        let mut args = args_with(Some(file.path().to_path_buf()));
        args.port = Some(4000);
        args.database = Some(":memory:".to_string());

        let config = AppConfig::new(&args).unwrap();
        assert_eq!(config.web.host, "0.0.0.0");
        assert_eq!(config.web.port, 4000);
        assert_eq!(config.database.connection_string, ":memory:");
    }
}
