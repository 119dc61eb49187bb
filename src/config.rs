//! Configuration management

use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub etl: EtlConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding the charting frontend, served under /dashboard
    pub dashboard_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            dashboard_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// DuckDB worker threads used while building summaries
    pub threads: u32,
    /// DuckDB memory limit, e.g. "4GB"
    pub memory_limit: String,
}

fn default_threads() -> u32 {
    4
}

fn default_memory_limit() -> String {
    "4GB".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("attack_data.db"),
            threads: default_threads(),
            memory_limit: default_memory_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub csv_directory: PathBuf,
    pub output_directory: PathBuf,
    /// JSON dictionary of IP -> geolocation/ASN data
    pub ip_lookup: Option<PathBuf>,
    /// MaxMind GeoLite2-City database, used when the dictionary has no entry
    pub geoip_city: Option<PathBuf>,
    pub geoip_asn: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            csv_directory: PathBuf::from("csv"),
            output_directory: PathBuf::from("parquet_output"),
            ip_lookup: None,
            geoip_city: None,
            geoip_asn: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub chunk_size: usize,
    pub compression: String,
    /// Number of CSV files converted concurrently
    pub workers: usize,
}

fn default_chunk_size() -> usize {
    100_000
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_workers() -> usize {
    1
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            compression: default_compression(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Date range used when a request omits start/end
    pub default_start: String,
    pub default_end: String,
    /// Number of series returned by the top-N charts
    pub top_n: u32,
}

fn default_start() -> String {
    "2022-11-01".to_string()
}

fn default_end() -> String {
    "2023-01-08".to_string()
}

fn default_top_n() -> u32 {
    10
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_start: default_start(),
            default_end: default_end(),
            top_n: default_top_n(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub const COMPRESSIONS: &[&str] = &["snappy", "zstd", "gzip", "lz4", "none"];

impl Config {
    /// Load from a TOML file layered with ATTACKDASH__* environment variables.
    /// The default path may be absent; an explicitly given one must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let builder = config::Config::builder()
            .add_source(config::File::from(config_path).required(required))
            .add_source(
                config::Environment::with_prefix("ATTACKDASH")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }

        if self.etl.chunk_size == 0 {
            anyhow::bail!("etl.chunk_size must be greater than 0");
        }
        if self.etl.workers == 0 {
            anyhow::bail!("etl.workers must be greater than 0");
        }
        if !COMPRESSIONS.contains(&self.etl.compression.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid compression '{}'. Must be one of: {:?}",
                self.etl.compression,
                COMPRESSIONS
            );
        }

        if self.api.top_n == 0 || self.api.top_n > 100 {
            anyhow::bail!("api.top_n must be between 1 and 100");
        }
        let start = NaiveDate::parse_from_str(&self.api.default_start, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("Invalid api.default_start: {}", e))?;
        let end = NaiveDate::parse_from_str(&self.api.default_end, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("Invalid api.default_end: {}", e))?;
        if start > end {
            anyhow::bail!("api.default_start must not be after api.default_end");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.etl.chunk_size, 100_000);
        assert_eq!(config.api.top_n, 10);
    }

    #[test]
    fn rejects_inverted_default_range() {
        let mut config = Config::default();
        config.api.default_start = "2023-02-01".to_string();
        config.api.default_end = "2023-01-01".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_compression() {
        let mut config = Config::default();
        config.etl.compression = "brotli9000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
host = "127.0.0.1"
port = 8080

[database]
path = "/tmp/attacks.db"

[api]
top_n = 5
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.path, PathBuf::from("/tmp/attacks.db"));
        assert_eq!(config.database.threads, 4);
        assert_eq!(config.api.top_n, 5);
        assert_eq!(config.api.default_start, "2022-11-01");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nport = 8080\n\n[etl]\nworkers = 4").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.etl.workers, 4);
        assert_eq!(config.etl.chunk_size, 100_000);
    }

    #[test]
    fn env_var_overrides_single_field() {
        std::env::set_var("ATTACKDASH__SERVER__DASHBOARD_DIR", "/srv/dashboard");
        let loaded = Config::load(None);
        std::env::remove_var("ATTACKDASH__SERVER__DASHBOARD_DIR");

        let config = loaded.unwrap();
        assert_eq!(config.server.dashboard_dir, Some(PathBuf::from("/srv/dashboard")));
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/attackdash.toml"))).is_err());
    }
}
