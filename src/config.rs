use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "/etc/nftrackd/nftrackd.toml";
const ENV_CONFIG_PATH: &str = "NFTRACKD_CONFIG";

/// Startup configuration, read once from a TOML file (path overridable
/// via `NFTRACKD_CONFIG`). Distinct from the live, HTTP-editable JSON
/// settings tree in [`crate::settings`].
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_classd_address")]
    pub classd_address: String,
    #[serde(default)]
    pub disable_dict: bool,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub playback_file: Option<PathBuf>,
    #[serde(default)]
    pub capture_file: Option<PathBuf>,
    #[serde(default = "default_playback_speed")]
    pub playback_speed: u32,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tables: TableConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub interfaces: InterfacesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            classd_address: default_classd_address(),
            disable_dict: false,
            local: false,
            debug: false,
            playback_file: None,
            capture_file: None,
            playback_speed: default_playback_speed(),
            queue: QueueConfig::default(),
            tables: TableConfig::default(),
            geoip: GeoIpConfig::default(),
            http: HttpConfig::default(),
            paths: PathsConfig::default(),
            classify: ClassifyConfig::default(),
            interfaces: InterfacesConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from file. The path can be overridden with
    /// `NFTRACKD_CONFIG`. Missing file falls back to defaults (console/dev
    /// usage); a malformed present file is a startup error.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_num")]
    pub queue_num: u16,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_num: default_queue_num(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_queue_num() -> u16 {
    1818
}
fn default_cleanup_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableConfig {
    #[serde(default = "default_cert_ttl_secs")]
    pub cert_ttl_secs: u64,
    #[serde(default = "default_revdns_ttl_secs")]
    pub revdns_ttl_secs: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            cert_ttl_secs: default_cert_ttl_secs(),
            revdns_ttl_secs: default_revdns_ttl_secs(),
        }
    }
}

fn default_cert_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_revdns_ttl_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeoIpConfig {
    #[serde(default = "default_geoip_city_db")]
    pub city_db_path: String,
    #[serde(default = "default_geoip_country_db")]
    pub country_db_path: String,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            city_db_path: default_geoip_city_db(),
            country_db_path: default_geoip_country_db(),
        }
    }
}

fn default_geoip_city_db() -> String {
    "/var/lib/nftrackd/GeoLite2-City.mmdb".to_string()
}
fn default_geoip_country_db() -> String {
    "/var/lib/nftrackd/GeoLite2-Country.mmdb".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

fn default_http_bind() -> String {
    "127.0.0.1:8119".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
    #[serde(default = "default_logger_config_file")]
    pub logger_config_file: String,
    #[serde(default = "default_events_db")]
    pub events_db: String,
    #[serde(default = "default_dict_write_file")]
    pub dict_write_file: String,
    #[serde(default = "default_dict_delete_file")]
    pub dict_delete_file: String,
    #[serde(default = "default_dict_read_file")]
    pub dict_read_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
            logger_config_file: default_logger_config_file(),
            events_db: default_events_db(),
            dict_write_file: default_dict_write_file(),
            dict_delete_file: default_dict_delete_file(),
            dict_read_file: default_dict_read_file(),
        }
    }
}

fn default_settings_file() -> String {
    "/etc/nftrackd/settings.json".to_string()
}
fn default_logger_config_file() -> String {
    "/etc/nftrackd/logging.json".to_string()
}
fn default_events_db() -> String {
    "/var/lib/nftrackd/events.db".to_string()
}
fn default_dict_write_file() -> String {
    "/proc/net/nftrackd/dict_write".to_string()
}
fn default_dict_delete_file() -> String {
    "/proc/net/nftrackd/dict_delete".to_string()
}
fn default_dict_read_file() -> String {
    "/proc/net/nftrackd/dict_read".to_string()
}

fn default_classd_address() -> String {
    "127.0.0.1:8123".to_string()
}
fn default_playback_speed() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClassifyConfig {
    /// Where periodic cloud summaries are POSTed. Summary publishing is
    /// skipped entirely when unset.
    #[serde(default)]
    pub cloud_endpoint: Option<String>,
}

/// One WAN-facing interface the active pinger probes. `iface_id` is the
/// small numeric id the dispatcher's verdict mark and `IfStatsRegistry`
/// key samples by; `ping_targets` is the configured host list spec.md
/// §4.10 describes probing every 5s.
#[derive(Debug, Deserialize, Clone)]
pub struct WanInterfaceConfig {
    pub name: String,
    pub iface_id: u8,
    #[serde(default)]
    pub ping_targets: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InterfacesConfig {
    #[serde(default)]
    pub wan: Vec<WanInterfaceConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
classd_address = "127.0.0.1:8123"
disable_dict = false
[queue]
queue_num = 1818
[tables]
cert_ttl_secs = 86400
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.classd_address, "127.0.0.1:8123");
        assert!(!cfg.disable_dict);
        assert_eq!(cfg.queue.queue_num, 1818);
        assert_eq!(cfg.tables.cert_ttl_secs, 86400);
        assert_eq!(cfg.tables.revdns_ttl_secs, 120);
        assert_eq!(cfg.playback_speed, 1);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/nftrackd.toml");
        }
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.classd_address, default_classd_address());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn present_but_malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not = [valid toml").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        assert!(Config::load().is_err());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
