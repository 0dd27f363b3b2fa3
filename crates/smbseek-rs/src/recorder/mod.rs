//! Brackets a scan run in a session and writes each host's outcome to the ledger.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    db::{share_record, Ledger},
    error::LedgerResult,
    models::{
        FailureKind, FileFinding, NewFailureLog, NewFileManifest, NewVulnerability, ServerContact,
        ServerStatus, SessionUpdate, ShareFinding, VulnFinding,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub enum ContactResult {
    Authenticated { auth_method: String },
    Failed { kind: FailureKind, reason: Option<String> },
}

/// Everything learned about one host during a run.
#[derive(Debug, Clone)]
pub struct HostOutcome {
    pub ip: String,
    pub country: Option<String>,
    pub result: ContactResult,
    pub shares: Vec<ShareFinding>,
    pub files: Vec<FileFinding>,
    pub vulnerabilities: Vec<VulnFinding>,
}

impl HostOutcome {
    pub fn authenticated(ip: impl Into<String>, country: Option<String>, auth_method: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            country,
            result: ContactResult::Authenticated {
                auth_method: auth_method.into(),
            },
            shares: vec![],
            files: vec![],
            vulnerabilities: vec![],
        }
    }

    pub fn failed(ip: impl Into<String>, country: Option<String>, kind: FailureKind, reason: Option<String>) -> Self {
        Self {
            ip: ip.into(),
            country,
            result: ContactResult::Failed { kind, reason },
            shares: vec![],
            files: vec![],
            vulnerabilities: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, ContactResult::Authenticated { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub recorded: usize,
    /// IP and error for every host whose outcome was dropped.
    pub failed: Vec<(String, String)>,
}

pub struct ScanRecorder {
    ledger: Ledger,
    session_id: i64,
}

impl ScanRecorder {
    pub async fn begin(ledger: Ledger, tool_name: &str, config: &serde_json::Value) -> LedgerResult<Self> {
        let session_id = ledger.create_scan_session(tool_name, config).await?;
        info!(session_id, tool = tool_name, "scan session started");
        Ok(Self { ledger, session_id })
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Writes one host's contact and findings in a single transaction.
    pub async fn record_host(&self, outcome: &HostOutcome) -> LedgerResult<i64> {
        let (auth_method, status) = match &outcome.result {
            ContactResult::Authenticated { auth_method } => (Some(auth_method.clone()), ServerStatus::Active),
            ContactResult::Failed { kind, .. } => (None, kind.server_status()),
        };

        let mut tx = self.ledger.begin().await?;
        let server_id = tx
            .record_contact(&ServerContact {
                ip_address: outcome.ip.clone(),
                country: outcome.country.clone(),
                auth_method,
                status: Some(status),
                session_id: Some(self.session_id),
            })
            .await?;

        if let ContactResult::Failed { kind, reason } = &outcome.result {
            tx.add_failure_log(&NewFailureLog {
                ip_address: outcome.ip.clone(),
                failure_type: kind.as_str().to_string(),
                failure_reason: reason.clone(),
                session_id: Some(self.session_id),
            })
            .await?;
        }

        for share in &outcome.shares {
            tx.add_share_access(&share_record(server_id, self.session_id, share)).await?;
        }

        for file in &outcome.files {
            tx.add_file_manifest(&NewFileManifest {
                server_id,
                session_id: self.session_id,
                share_name: file.share_name.clone(),
                file_path: file.file_path.clone(),
                file_size: file.file_size,
                is_ransomware_indicator: file.is_ransomware_indicator,
                last_modified: file.last_modified,
                metadata: file.metadata.clone(),
            })
            .await?;
        }

        for vuln in &outcome.vulnerabilities {
            tx.add_vulnerability(&NewVulnerability {
                server_id,
                session_id: self.session_id,
                vuln_type: vuln.vuln_type.clone(),
                severity: vuln.severity,
                title: vuln.title.clone(),
                description: vuln.description.clone(),
                evidence: vuln.evidence.clone(),
                cvss_score: vuln.cvss_score,
            })
            .await?;
        }

        tx.commit().await?;
        debug!(ip = %outcome.ip, server_id, shares = outcome.shares.len(), "host recorded");
        Ok(server_id)
    }

    /// Records every outcome; a host that cannot be written is logged and skipped.
    pub async fn record_batch(&self, outcomes: &[HostOutcome]) -> BatchReport {
        let mut report = BatchReport::default();
        for outcome in outcomes {
            match self.record_host(outcome).await {
                Ok(_) => report.recorded += 1,
                Err(e) => {
                    warn!(ip = %outcome.ip, error = %e, "failed to record host, skipping");
                    report.failed.push((outcome.ip.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Completes the session. Returns `false` if it was already completed.
    pub async fn finish(self, total_targets: i64, successful_targets: i64) -> LedgerResult<bool> {
        let done = self
            .ledger
            .update_scan_session(self.session_id, &SessionUpdate::completed(total_targets, successful_targets))
            .await?;
        info!(
            session_id = self.session_id,
            total_targets, successful_targets, "scan session completed"
        );
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{SessionStatus, Severity};

    #[tokio::test]
    async fn one_bad_host_does_not_abort_the_batch() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let recorder = ScanRecorder::begin(ledger.clone(), "smbseek-discover", &json!({}))
            .await
            .unwrap();

        let batch = vec![
            HostOutcome::authenticated("192.0.2.1", Some("US".into()), "Anonymous"),
            // empty address violates the schema and rolls back this host only
            HostOutcome::authenticated("", None, "Anonymous"),
            HostOutcome::failed("192.0.2.3", None, FailureKind::PortClosed, None),
        ];
        let report = recorder.record_batch(&batch).await;
        assert_eq!(report.recorded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "");

        let session_id = recorder.session_id();
        assert!(recorder.finish(3, 1).await.unwrap());

        assert!(ledger.get_server("192.0.2.1").await.unwrap().is_some());
        let failed = ledger.get_server("192.0.2.3").await.unwrap().unwrap();
        assert_eq!(failed.status, ServerStatus::Failed);
        assert_eq!(failed.last_session_id, Some(session_id));
        assert_eq!(ledger.server_count().await.unwrap(), 2);

        let session = ledger.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.successful_targets, 1);
    }

    #[tokio::test]
    async fn findings_are_written_with_the_contact() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let recorder = ScanRecorder::begin(ledger.clone(), "smbseek-access", &json!({}))
            .await
            .unwrap();

        let mut outcome = HostOutcome::authenticated("198.51.100.4", None, "Guest/Blank");
        outcome.shares = vec![
            ShareFinding {
                share_name: "public".into(),
                accessible: true,
                ..Default::default()
            },
            ShareFinding {
                share_name: "finance".into(),
                accessible: false,
                error_message: Some("Access denied".into()),
                ..Default::default()
            },
        ];
        outcome.files = vec![FileFinding {
            share_name: "public".into(),
            file_path: "README_FOR_DECRYPT.txt".into(),
            file_size: 1024,
            is_ransomware_indicator: true,
            ..Default::default()
        }];
        outcome.vulnerabilities = vec![VulnFinding {
            vuln_type: "ransomware_indicator".into(),
            severity: Severity::Critical,
            title: "Ransomware note found".into(),
            description: None,
            evidence: Some("README_FOR_DECRYPT.txt".into()),
            cvss_score: None,
        }];
        recorder.record_host(&outcome).await.unwrap();

        let shares = ledger.share_stats(Some(recorder.session_id())).await.unwrap();
        assert_eq!((shares.total_shares, shares.accessible_shares), (2, 1));
        let files = ledger.file_stats(None).await.unwrap();
        assert_eq!(files.ransomware_indicators, 1);

        let hosts = ledger.get_authenticated_hosts().await.unwrap();
        assert_eq!(hosts[0].auth_method, "Guest/Blank");
    }

    #[tokio::test]
    async fn failed_contact_writes_a_failure_log() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let recorder = ScanRecorder::begin(ledger.clone(), "smbseek-discover", &json!({}))
            .await
            .unwrap();
        recorder
            .record_host(&HostOutcome::failed(
                "203.0.113.50",
                None,
                FailureKind::Timeout,
                Some("no response within 10s".into()),
            ))
            .await
            .unwrap();

        let (kind, session): (String, Option<i64>) =
            sqlx::query_as("SELECT failure_type, session_id FROM failure_logs WHERE ip_address = '203.0.113.50'")
                .fetch_one(ledger.pool())
                .await
                .unwrap();
        assert_eq!(kind, "timeout");
        assert_eq!(session, Some(recorder.session_id()));

        let server = ledger.get_server("203.0.113.50").await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Timeout);
    }
}
