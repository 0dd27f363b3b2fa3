//! Executive summary over the ledger: counts, exposure rates and a risk level.

mod failures;

use std::{
    fmt::{self, Write as _},
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub use failures::{analyze_failures, render_failure_analysis, save_failure_analysis, FailureAnalysis};

use crate::{
    db::{self, Ledger},
    error::LedgerResult,
    models::{ActivitySummary, AuthMethodCount, CountryCount, ShareNameCount},
};

const TOP_COUNTRIES: i64 = 5;
const TOP_SHARES: i64 = 10;
const ACTIVITY_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_accessibility_rate(rate: f64) -> Self {
        if rate > 20.0 {
            RiskLevel::High
        } else if rate > 10.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutiveSummary {
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<i64>,
    pub summary: SummaryCounts,
    pub risk_assessment: RiskAssessment,
    pub geographic_distribution: Vec<CountryCount>,
    pub technical_details: TechnicalDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Breakdown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryCounts {
    pub total_servers_discovered: i64,
    pub accessible_servers: i64,
    pub accessibility_rate_percent: f64,
    pub total_shares_found: i64,
    pub accessible_shares: i64,
    pub share_exposure_rate_percent: f64,
    pub total_files_enumerated: i64,
    pub total_data_bytes: i64,
    pub total_data_size_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub overall_risk_level: RiskLevel,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TechnicalDetails {
    pub servers_successfully_scanned: i64,
    pub servers_with_accessible_shares: i64,
    pub scan_coverage_percent: f64,
    pub ransomware_indicators: i64,
}

/// Extra distributions for `report --detailed`.
#[derive(Debug, Clone, Serialize)]
pub struct Breakdown {
    pub auth_methods: Vec<AuthMethodCount>,
    pub top_shares: Vec<ShareNameCount>,
    pub recent_activity: ActivitySummary,
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64 * 100.0
    } else {
        0.0
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Builds the summary, restricted to one session when `session_id` is given.
/// An empty ledger yields an all-zero summary.
pub async fn generate_summary(ledger: &Ledger, session_id: Option<i64>) -> LedgerResult<ExecutiveSummary> {
    let servers = ledger.server_stats(session_id).await?;
    let shares = ledger.share_stats(session_id).await?;
    let files = ledger.file_stats(session_id).await?;
    let countries = ledger.top_countries(session_id, TOP_COUNTRIES).await?;

    let accessibility_rate = percent(servers.accessible_servers, servers.total_servers);
    let share_exposure_rate = percent(shares.accessible_shares, shares.total_shares);

    let mut key_findings = vec![];
    if servers.accessible_servers > 0 {
        key_findings.push(format!("{} servers allow unauthorized access", servers.accessible_servers));
    }
    if shares.accessible_shares > 0 {
        key_findings.push(format!("{} network shares are publicly accessible", shares.accessible_shares));
    }
    if files.total_files > 0 {
        key_findings.push(format!("{} files discovered on accessible shares", files.total_files));
    }
    if files.ransomware_indicators > 0 {
        key_findings.push(format!(
            "{} files match known ransomware note names",
            files.ransomware_indicators
        ));
    }
    if key_findings.is_empty() {
        key_findings.push("No significant security exposures detected".to_string());
    }

    Ok(ExecutiveSummary {
        timestamp: db::now(),
        session_id,
        summary: SummaryCounts {
            total_servers_discovered: servers.total_servers,
            accessible_servers: servers.accessible_servers,
            accessibility_rate_percent: round_to(accessibility_rate, 1),
            total_shares_found: shares.total_shares,
            accessible_shares: shares.accessible_shares,
            share_exposure_rate_percent: round_to(share_exposure_rate, 1),
            total_files_enumerated: files.total_files,
            total_data_bytes: files.total_size_bytes,
            total_data_size_mb: round_to(files.total_size_bytes as f64 / 1024.0 / 1024.0, 2),
        },
        risk_assessment: RiskAssessment {
            overall_risk_level: RiskLevel::from_accessibility_rate(accessibility_rate),
            key_findings,
            recommendations: recommendations(accessibility_rate, share_exposure_rate),
        },
        geographic_distribution: countries,
        technical_details: TechnicalDetails {
            servers_successfully_scanned: servers.successfully_scanned,
            servers_with_accessible_shares: shares.servers_with_shares,
            scan_coverage_percent: round_to(percent(servers.successfully_scanned, servers.total_servers), 1),
            ransomware_indicators: files.ransomware_indicators,
        },
        breakdown: None,
    })
}

/// Adds ledger-wide distributions to an existing summary.
pub async fn with_breakdown(ledger: &Ledger, mut summary: ExecutiveSummary) -> LedgerResult<ExecutiveSummary> {
    summary.breakdown = Some(Breakdown {
        auth_methods: ledger.auth_method_distribution().await?,
        top_shares: ledger.top_shares(TOP_SHARES).await?,
        recent_activity: ledger.recent_activity(ACTIVITY_DAYS).await?,
    });
    Ok(summary)
}

fn recommendations(accessibility_rate: f64, share_exposure_rate: f64) -> Vec<String> {
    let mut out = vec![];
    if accessibility_rate > 10.0 {
        out.push("Implement proper SMB authentication on exposed servers");
        out.push("Review and restrict anonymous/guest access policies");
    }
    if share_exposure_rate > 15.0 {
        out.push("Audit and restrict share permissions");
        out.push("Remove unnecessary network shares");
    }
    if accessibility_rate > 5.0 || share_exposure_rate > 5.0 {
        out.push("Implement network segmentation and access controls");
        out.push("Regular security auditing of SMB infrastructure");
    }
    if out.is_empty() {
        out.push("Continue monitoring for new exposures");
        out.push("Maintain current security posture");
    }
    out.into_iter().map(str::to_string).collect()
}

pub fn render_text(summary: &ExecutiveSummary) -> String {
    let s = &summary.summary;
    let risk = &summary.risk_assessment;
    let mut out = String::new();

    let _ = writeln!(out, "SMBSeek Executive Summary");
    let _ = writeln!(out, "=========================");
    if let Some(id) = summary.session_id {
        let _ = writeln!(out, "Session: {id}");
    }
    let _ = writeln!(out, "Overall Risk Level: {}", risk.overall_risk_level);
    let _ = writeln!(out, "Servers Discovered: {}", s.total_servers_discovered);
    let _ = writeln!(
        out,
        "Accessible Servers: {} ({}%)",
        s.accessible_servers, s.accessibility_rate_percent
    );
    let _ = writeln!(
        out,
        "Accessible Shares: {} ({}%)",
        s.accessible_shares, s.share_exposure_rate_percent
    );
    let _ = writeln!(out, "Files Enumerated: {} ({} MB)", s.total_files_enumerated, s.total_data_size_mb);

    let _ = writeln!(out, "\nKey Findings");
    for finding in &risk.key_findings {
        let _ = writeln!(out, "  - {finding}");
    }
    let _ = writeln!(out, "\nRecommendations");
    for rec in &risk.recommendations {
        let _ = writeln!(out, "  - {rec}");
    }

    if !summary.geographic_distribution.is_empty() {
        let _ = writeln!(out, "\nGeographic Distribution");
        for c in &summary.geographic_distribution {
            let _ = writeln!(out, "  - {}: {} servers", c.country, c.count);
        }
    }

    let t = &summary.technical_details;
    let _ = writeln!(out, "\nTechnical Summary");
    let _ = writeln!(out, "Scan Coverage: {}%", t.scan_coverage_percent);
    let _ = writeln!(out, "Servers with Shares: {}", t.servers_with_accessible_shares);

    if let Some(b) = &summary.breakdown {
        let _ = writeln!(out, "\nAuthentication Methods");
        for m in &b.auth_methods {
            let _ = writeln!(out, "  - {}: {} servers (avg {:.1} scans)", m.auth_method, m.server_count, m.avg_scans);
        }
        let _ = writeln!(out, "\nMost Common Accessible Shares");
        for share in &b.top_shares {
            let _ = writeln!(
                out,
                "  - {}: {} servers",
                share.share_name, share.server_count
            );
        }
        let a = &b.recent_activity;
        let _ = writeln!(
            out,
            "\nLast {} days: {} sessions, {} targets, {} successful",
            a.days, a.scan_sessions, a.targets_found, a.successful_connections
        );
    }
    out
}

/// Writes the summary as pretty JSON, to `smbseek_report_<timestamp>.json` when no path is given.
pub fn save_report(summary: &ExecutiveSummary, path: Option<&Path>) -> anyhow::Result<PathBuf> {
    let default_name = format!("smbseek_report_{}.json", summary.timestamp.format("%Y%m%d_%H%M%S"));
    save_json(summary, path, &default_name)
}

/// Pretty JSON to `path`, or to `default_name` in the working directory.
pub fn save_json<T: Serialize>(value: &T, path: Option<&Path>, default_name: &str) -> anyhow::Result<PathBuf> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(default_name));
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "output saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        models::{FailureKind, ShareFinding},
        recorder::{HostOutcome, ScanRecorder},
    };

    #[test]
    fn risk_thresholds_are_exclusive_lower_bounds() {
        assert_eq!(RiskLevel::from_accessibility_rate(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_accessibility_rate(10.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_accessibility_rate(10.01), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_accessibility_rate(20.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_accessibility_rate(20.01), RiskLevel::High);
    }

    #[tokio::test]
    async fn empty_ledger_gives_zero_rates() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let summary = generate_summary(&ledger, None).await.unwrap();

        assert_eq!(summary.summary.total_servers_discovered, 0);
        assert_eq!(summary.summary.accessibility_rate_percent, 0.0);
        assert_eq!(summary.summary.share_exposure_rate_percent, 0.0);
        assert_eq!(summary.risk_assessment.overall_risk_level, RiskLevel::Low);
        assert_eq!(
            summary.risk_assessment.key_findings,
            vec!["No significant security exposures detected".to_string()]
        );
        assert!(summary.geographic_distribution.is_empty());

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["risk_assessment"]["overall_risk_level"], "LOW");
        assert!(value.get("breakdown").is_none());
    }

    #[tokio::test]
    async fn session_summary_counts_only_that_session() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let recorder = ScanRecorder::begin(ledger.clone(), "smbseek-discover", &json!({}))
            .await
            .unwrap();

        let mut open = HostOutcome::authenticated("192.0.2.10", Some("US".into()), "Anonymous");
        open.shares = vec![ShareFinding {
            share_name: "public".into(),
            accessible: true,
            ..Default::default()
        }];
        recorder.record_host(&open).await.unwrap();
        for i in 0..3 {
            recorder
                .record_host(&HostOutcome::failed(format!("192.0.2.{}", 20 + i), Some("DE".into()), FailureKind::AuthFailed, None))
                .await
                .unwrap();
        }
        let session = recorder.session_id();
        recorder.finish(4, 1).await.unwrap();

        // a later session touching other hosts must not leak into the first one
        let other = ScanRecorder::begin(ledger.clone(), "smbseek-discover", &json!({}))
            .await
            .unwrap();
        other
            .record_host(&HostOutcome::authenticated("198.51.100.1", None, "Guest/Guest"))
            .await
            .unwrap();

        let summary = generate_summary(&ledger, Some(session)).await.unwrap();
        assert_eq!(summary.summary.total_servers_discovered, 4);
        assert_eq!(summary.summary.accessible_servers, 1);
        assert_eq!(summary.summary.accessibility_rate_percent, 25.0);
        assert_eq!(summary.risk_assessment.overall_risk_level, RiskLevel::High);
        assert_eq!(summary.summary.share_exposure_rate_percent, 100.0);
        assert_eq!(summary.geographic_distribution[0].country, "DE");
        assert!(summary
            .risk_assessment
            .recommendations
            .iter()
            .any(|r| r.contains("anonymous/guest")));

        let all = generate_summary(&ledger, None).await.unwrap();
        assert_eq!(all.summary.total_servers_discovered, 5);
    }

    #[tokio::test]
    async fn report_file_round_trips_as_json() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let summary = with_breakdown(&ledger, generate_summary(&ledger, None).await.unwrap())
            .await
            .unwrap();
        let text = render_text(&summary);
        assert!(text.contains("Overall Risk Level: LOW"));
        assert!(text.contains("Authentication Methods"));

        let path = std::env::temp_dir().join(format!("smbseek-report-test-{}.json", std::process::id()));
        let written = save_report(&summary, Some(&path)).unwrap();
        let raw = fs::read_to_string(&written).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["summary"]["total_servers_discovered"], 0);
        assert_eq!(value["breakdown"]["recent_activity"]["days"], 7);
        let _ = fs::remove_file(&written);
    }
}
