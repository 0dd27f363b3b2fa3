use std::{fmt, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Failed,
    Timeout,
}

impl ServerStatus {
    /// Latest contact did not succeed.
    pub fn is_failure(self) -> bool {
        matches!(self, ServerStatus::Failed | ServerStatus::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PortClosed,
    AuthFailed,
    Timeout,
    Error,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::PortClosed => "port_closed",
            FailureKind::AuthFailed => "auth_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::Error => "error",
        }
    }

    pub fn server_status(self) -> ServerStatus {
        match self {
            FailureKind::Timeout => ServerStatus::Timeout,
            _ => ServerStatus::Failed,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Server {
    pub id: i64,
    pub ip_address: String,
    pub country: Option<String>,
    pub auth_method: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub scan_count: i64,
    pub status: ServerStatus,
    pub last_session_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanSession {
    pub id: i64,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub config_snapshot: Option<String>,
    pub status: SessionStatus,
    pub total_targets: i64,
    pub successful_targets: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ShareAccessRecord {
    pub id: i64,
    pub server_id: i64,
    pub session_id: i64,
    pub share_name: String,
    pub accessible: bool,
    pub error_message: Option<String>,
    pub permissions: Option<String>,
    pub share_type: Option<String>,
    pub comment: Option<String>,
    pub test_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileManifestEntry {
    pub id: i64,
    pub server_id: i64,
    pub session_id: i64,
    pub share_name: String,
    pub file_path: String,
    pub file_name: String,
    pub file_extension: String,
    pub file_size: i64,
    pub is_ransomware_indicator: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: Option<String>,
    pub discovery_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vulnerability {
    pub id: i64,
    pub server_id: i64,
    pub session_id: i64,
    pub vuln_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub evidence: Option<String>,
    pub cvss_score: Option<f64>,
    pub discovery_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailureLog {
    pub id: i64,
    pub ip_address: String,
    pub failure_type: String,
    pub failure_reason: Option<String>,
    pub failure_timestamp: DateTime<Utc>,
    pub session_id: Option<i64>,
}

/// One contact with a host, as written by the upsert.
#[derive(Debug, Clone, Default)]
pub struct ServerContact {
    pub ip_address: String,
    pub country: Option<String>,
    pub auth_method: Option<String>,
    /// `None` leaves the stored status untouched (new rows start `active`).
    pub status: Option<ServerStatus>,
    pub session_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewShareAccess {
    pub server_id: i64,
    pub session_id: i64,
    pub share_name: String,
    pub accessible: bool,
    pub error_message: Option<String>,
    pub permissions: Option<String>,
    pub share_type: Option<String>,
    pub comment: Option<String>,
}

impl NewShareAccess {
    pub fn new(server_id: i64, session_id: i64, share_name: impl Into<String>, accessible: bool) -> Self {
        Self {
            server_id,
            session_id,
            share_name: share_name.into(),
            accessible,
            error_message: None,
            permissions: None,
            share_type: None,
            comment: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewFileManifest {
    pub server_id: i64,
    pub session_id: i64,
    pub share_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub is_ransomware_indicator: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl NewFileManifest {
    /// File name after the last `\` or `/` separator.
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&self.file_path)
    }

    pub fn file_extension(&self) -> String {
        extension_of(self.file_name())
    }
}

/// Lower-cased extension including the dot, empty when there is none.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct NewVulnerability {
    pub server_id: i64,
    pub session_id: i64,
    pub vuln_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub evidence: Option<String>,
    pub cvss_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewFailureLog {
    pub ip_address: String,
    pub failure_type: String,
    pub failure_reason: Option<String>,
    pub session_id: Option<i64>,
}

/// Fields of a running session that may be set before it is frozen.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub total_targets: Option<i64>,
    pub successful_targets: Option<i64>,
}

impl SessionUpdate {
    pub fn completed(total_targets: i64, successful_targets: i64) -> Self {
        Self {
            status: Some(SessionStatus::Completed),
            total_targets: Some(total_targets),
            successful_targets: Some(successful_targets),
        }
    }
}

/// Outcome of testing one share, before it is tied to ledger ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareFinding {
    pub share_name: String,
    pub accessible: bool,
    pub error_message: Option<String>,
    pub share_type: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileFinding {
    pub share_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub is_ransomware_indicator: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnFinding {
    pub vuln_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub evidence: Option<String>,
    pub cvss_score: Option<f64>,
}

/// Rescan-relevant metadata for a host already in the ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KnownHost {
    pub ip_address: String,
    pub last_seen: DateTime<Utc>,
    pub scan_count: i64,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthenticatedHost {
    pub ip_address: String,
    pub country: Option<String>,
    pub auth_method: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessibleShareHost {
    pub ip_address: String,
    pub country: Option<String>,
    pub auth_method: Option<String>,
    pub accessible_shares: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedConnection {
    pub ip_address: String,
    pub country: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CountryCount {
    pub country: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthMethodCount {
    pub auth_method: String,
    pub server_count: i64,
    pub avg_scans: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ShareNameCount {
    pub share_name: String,
    pub occurrence_count: i64,
    pub server_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailureTypeCount {
    pub failure_type: String,
    pub occurrences: i64,
    pub hosts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailureReasonCount {
    pub failure_type: String,
    pub failure_reason: String,
    pub occurrences: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub days: i64,
    pub scan_sessions: i64,
    pub targets_found: i64,
    pub successful_connections: i64,
    pub updated_servers: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub sessions_deleted: u64,
    pub share_access_deleted: u64,
    pub file_manifests_deleted: u64,
    pub vulnerabilities_deleted: u64,
    pub failure_logs_deleted: u64,
    pub servers_deactivated: u64,
}
