use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{db::MAX_WINDOW_DAYS, error::ConfigError};

pub const DEFAULT_CONFIG_PATH: &str = "conf/config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub shodan: ShodanConfig,
    pub workflow: WorkflowConfig,
    pub connection: ConnectionConfig,
    pub security: SecurityConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub collection: CollectionConfig,
    /// Country code to display name, used when no `--country` is given.
    pub countries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShodanConfig {
    pub api_key: String,
    pub max_results: usize,
    pub timeout_secs: u64,
    pub base_query: String,
    pub product_filter: String,
    pub additional_exclusions: Vec<String>,
    pub use_organization_exclusions: bool,
}

impl Default for ShodanConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 1000,
            timeout_secs: 30,
            base_query: "smb authentication: disabled".to_string(),
            product_filter: "product:\"Samba\"".to_string(),
            additional_exclusions: vec!["-\"DSL\"".to_string()],
            use_organization_exclusions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub rescan_after_days: i64,
    pub skip_failed_hosts: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            rescan_after_days: 30,
            skip_failed_hosts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub timeout_secs: u64,
    pub port_check_timeout_secs: u64,
    pub rate_limit_delay_secs: u64,
    pub share_access_delay_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            port_check_timeout_secs: 10,
            rate_limit_delay_secs: 3,
            share_access_delay_secs: 7,
        }
    }
}

impl ConnectionConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_delay_secs)
    }

    pub fn share_access_delay(&self) -> Duration {
        Duration::from_secs(self.share_access_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub ransomware_indicators: Vec<String>,
    pub exclusion_file: PathBuf,
    /// CIDR ranges that are never contacted, whatever the feed returns.
    pub excluded_networks: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            ransomware_indicators: [
                "!want_to_cry.txt",
                "0XXX_DECRYPTION_README.TXT",
                "HOW_TO_DECRYPT_FILES.txt",
                "DECRYPT_INSTRUCTIONS.txt",
                "_DECRYPT_INFO_.txt",
                "README_FOR_DECRYPT.txt",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclusion_file: PathBuf::from("conf/exclusion_list.txt"),
            excluded_networks: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("smbseek.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Limits applied when planning file collection from accessible shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Upper bound on entries kept from one recursive share listing.
    pub max_files_per_share: usize,
    pub max_files_per_target: usize,
    pub max_total_size_mb: u64,
    /// Files nested this deep or deeper are left out.
    pub max_directory_depth: usize,
    /// Lower-case extensions with the leading dot. Empty means any extension not excluded.
    pub included_extensions: Vec<String>,
    pub excluded_extensions: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_files_per_share: 1000,
            max_files_per_target: 3,
            max_total_size_mb: 500,
            max_directory_depth: 3,
            included_extensions: strings(&[
                ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".txt", ".rtf", ".csv", ".eml",
                ".msg", ".mbox", ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".tiff", ".mp4", ".mov", ".avi",
                ".mkv", ".wmv", ".mp3", ".wav", ".zip", ".rar",
            ]),
            excluded_extensions: strings(&[
                ".exe", ".dll", ".sys", ".bat", ".cmd", ".scr", ".com", ".pif", ".msi", ".bin", ".log",
                ".tmp", ".temp", ".bak", ".old", ".swp", ".lock",
            ]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl CollectionConfig {
    pub fn max_total_size_bytes(&self) -> u64 {
        self.max_total_size_mb.saturating_mul(1024 * 1024)
    }
}

impl AppConfig {
    /// Loads the JSON config, falling back to defaults when the file is absent,
    /// then applies `SMBSEEK_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| {
            env::var("SMBSEEK_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
        });

        let mut cfg = match fs::read_to_string(&path) {
            Ok(raw) => Self::from_json(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        cfg.apply_env_overrides();
        debug!(path = %path.display(), "configuration loaded");
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SMBSEEK_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SMBSEEK_SHODAN_API_KEY") {
            self.shodan.api_key = v;
        }
        if let Ok(v) = env::var("SMBSEEK_RESCAN_AFTER_DAYS") {
            self.workflow.rescan_after_days = v.parse().unwrap_or(self.workflow.rescan_after_days);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = vec![];

        if self.workflow.rescan_after_days < 1 {
            issues.push("workflow.rescan_after_days must be at least 1".to_string());
        }
        if self.workflow.rescan_after_days > MAX_WINDOW_DAYS {
            issues.push(format!("workflow.rescan_after_days must be at most {MAX_WINDOW_DAYS}"));
        }
        if self.connection.timeout_secs < 5 {
            issues.push("connection.timeout_secs should be at least 5 seconds".to_string());
        }
        if self.shodan.max_results == 0 {
            issues.push("shodan.max_results must be greater than 0".to_string());
        }
        if self.collection.max_files_per_share == 0 {
            issues.push("collection.max_files_per_share must be greater than 0".to_string());
        }
        for entry in &self.security.excluded_networks {
            if IpNet::from_str(entry).is_err() {
                issues.push(format!("security.excluded_networks: '{entry}' is not a CIDR"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues.join("; ")))
        }
    }

    /// Explicit `--country` list first, then the configured countries, else a global search.
    pub fn resolve_target_countries(&self, arg: Option<&str>) -> Vec<String> {
        if let Some(arg) = arg {
            return arg
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        self.countries.keys().cloned().collect()
    }

    pub fn excluded_networks(&self) -> Vec<IpNet> {
        self.security
            .excluded_networks
            .iter()
            .filter_map(|entry| IpNet::from_str(entry).ok())
            .collect()
    }
}
