//! Collection planning: which listed files are worth fetching from each host,
//! within per-host count and size budgets, and the JSON manifest describing them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{config::CollectionConfig, db, models::FileFinding, report};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionLimits {
    pub max_files_per_target: usize,
    pub max_total_size_bytes: u64,
}

impl CollectionLimits {
    pub fn from_config(cfg: &CollectionConfig) -> Self {
        Self {
            max_files_per_target: cfg.max_files_per_target,
            max_total_size_bytes: cfg.max_total_size_bytes(),
        }
    }
}

/// Picks files newest first, undated files last. Ransom notes are never picked.
/// Selection stops at the count limit or at the first file that would overflow
/// the size budget.
pub fn select_files(mut files: Vec<FileFinding>, limits: &CollectionLimits) -> Vec<FileFinding> {
    files.retain(|f| !f.is_ransomware_indicator);
    files.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    let mut total: u64 = 0;
    let mut picked = Vec::new();
    for file in files {
        if picked.len() >= limits.max_files_per_target {
            break;
        }
        let size = u64::try_from(file.file_size).unwrap_or(0);
        if total.saturating_add(size) > limits.max_total_size_bytes {
            break;
        }
        total += size;
        picked.push(file);
    }
    picked
}

#[derive(Debug, Clone, Serialize)]
pub struct HostManifest {
    pub ip_address: String,
    pub country: Option<String>,
    pub auth_method: String,
    pub shares: Vec<String>,
    pub compromised: bool,
    /// Files dropped by the depth or extension filters while listing.
    pub skipped_files: usize,
    pub files: Vec<FileFinding>,
    pub total_size_bytes: u64,
}

impl HostManifest {
    pub fn new(ip_address: &str, country: Option<String>, auth_method: &str) -> Self {
        Self {
            ip_address: ip_address.to_string(),
            country,
            auth_method: auth_method.to_string(),
            shares: vec![],
            compromised: false,
            skipped_files: 0,
            files: vec![],
            total_size_bytes: 0,
        }
    }

    pub fn set_files(&mut self, files: Vec<FileFinding>) {
        self.total_size_bytes = files
            .iter()
            .map(|f| u64::try_from(f.file_size).unwrap_or(0))
            .sum();
        self.files = files;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionManifest {
    pub manifest_date: DateTime<Utc>,
    pub session_id: i64,
    pub settings: CollectionConfig,
    pub hosts: Vec<HostManifest>,
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub cancelled: bool,
}

impl CollectionManifest {
    pub fn new(session_id: i64, settings: CollectionConfig) -> Self {
        Self {
            manifest_date: db::now(),
            session_id,
            settings,
            hosts: vec![],
            total_files: 0,
            total_size_bytes: 0,
            cancelled: false,
        }
    }

    pub fn push_host(&mut self, host: HostManifest) {
        self.total_files += host.files.len();
        self.total_size_bytes += host.total_size_bytes;
        self.hosts.push(host);
    }
}

/// Writes the manifest as pretty JSON, to `file_manifest_<timestamp>.json` when no path is given.
pub fn save_manifest(manifest: &CollectionManifest, path: Option<&Path>) -> anyhow::Result<PathBuf> {
    let default_name = format!("file_manifest_{}.json", manifest.manifest_date.format("%Y%m%d_%H%M%S"));
    report::save_json(manifest, path, &default_name)
}
