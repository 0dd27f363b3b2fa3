use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{percent, round_to, save_json};
use crate::{
    db::{self, Ledger},
    error::LedgerResult,
    models::{CountryCount, FailureKind, FailureReasonCount, FailureTypeCount},
};

const TOP_REASONS: i64 = 10;
const TOP_COUNTRIES: i64 = 5;

/// Failure log grouped by type, reason and country.
#[derive(Debug, Clone, Serialize)]
pub struct FailureAnalysis {
    pub timestamp: DateTime<Utc>,
    pub total_failures: i64,
    pub failing_hosts: i64,
    pub by_type: Vec<FailureTypeCount>,
    pub top_reasons: Vec<FailureReasonCount>,
    pub countries: Vec<CountryCount>,
    pub recommendations: Vec<String>,
}

impl FailureAnalysis {
    fn occurrences_of(&self, kind: FailureKind) -> i64 {
        self.by_type
            .iter()
            .find(|t| t.failure_type == kind.as_str())
            .map_or(0, |t| t.occurrences)
    }
}

pub async fn analyze_failures(ledger: &Ledger) -> LedgerResult<FailureAnalysis> {
    let (total_failures, failing_hosts) = ledger.failure_totals().await?;
    let mut analysis = FailureAnalysis {
        timestamp: db::now(),
        total_failures,
        failing_hosts,
        by_type: ledger.failure_type_counts().await?,
        top_reasons: ledger.top_failure_reasons(TOP_REASONS).await?,
        countries: ledger.failure_countries(TOP_COUNTRIES).await?,
        recommendations: vec![],
    };
    analysis.recommendations = recommendations(&analysis);
    Ok(analysis)
}

fn recommendations(analysis: &FailureAnalysis) -> Vec<String> {
    let mut out = vec![];
    if analysis.occurrences_of(FailureKind::PortClosed) > 0 {
        out.push("Hosts with port 445 closed or filtered are unlikely to change; keep them out of rescans");
    }
    if analysis.occurrences_of(FailureKind::AuthFailed) > 0 {
        out.push("Hosts rejecting anonymous and guest logins require credentials and need no further testing");
    }
    if analysis.occurrences_of(FailureKind::Timeout) > 0 {
        out.push("Timeouts may be transient; retry them with --rescan-failed or a longer connection timeout");
    }
    if analysis.occurrences_of(FailureKind::Error) > 0 {
        out.push("Review tool errors in the log; they usually point at local smbclient problems");
    }
    if out.is_empty() {
        out.push("No failures recorded");
    }
    out.into_iter().map(str::to_string).collect()
}

pub fn render_failure_analysis(analysis: &FailureAnalysis) -> String {
    let total = analysis.total_failures;
    let mut out = String::new();

    let _ = writeln!(out, "SMBSeek Failure Analysis");
    let _ = writeln!(out, "========================");
    let _ = writeln!(out, "Failures logged: {total} across {} hosts", analysis.failing_hosts);

    let _ = writeln!(out, "\nFailure Types");
    for t in &analysis.by_type {
        let _ = writeln!(
            out,
            "  - {}: {} ({}%), {} hosts",
            t.failure_type,
            t.occurrences,
            round_to(percent(t.occurrences, total), 1),
            t.hosts
        );
    }

    let _ = writeln!(out, "\nMost Common Reasons");
    for r in &analysis.top_reasons {
        let _ = writeln!(out, "  - [{}] {}: {}", r.failure_type, r.failure_reason, r.occurrences);
    }

    if !analysis.countries.is_empty() {
        let _ = writeln!(out, "\nGeographic Distribution");
        for c in &analysis.countries {
            let _ = writeln!(out, "  - {}: {} hosts", c.country, c.count);
        }
    }

    let _ = writeln!(out, "\nRecommendations");
    for rec in &analysis.recommendations {
        let _ = writeln!(out, "  - {rec}");
    }
    out
}

/// Writes the analysis to `failure_analysis_<timestamp>.json` when no path is given.
pub fn save_failure_analysis(analysis: &FailureAnalysis, path: Option<&Path>) -> anyhow::Result<PathBuf> {
    let default_name = format!("failure_analysis_{}.json", analysis.timestamp.format("%Y%m%d_%H%M%S"));
    save_json(analysis, path, &default_name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::recorder::{HostOutcome, ScanRecorder};

    #[tokio::test]
    async fn empty_failure_log_gives_empty_analysis() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let analysis = analyze_failures(&ledger).await.unwrap();
        assert_eq!(analysis.total_failures, 0);
        assert!(analysis.by_type.is_empty());
        assert_eq!(analysis.recommendations, vec!["No failures recorded".to_string()]);
        assert!(render_failure_analysis(&analysis).contains("Failures logged: 0 across 0 hosts"));
    }

    #[tokio::test]
    async fn failures_are_grouped_by_type_and_reason() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let recorder = ScanRecorder::begin(ledger.clone(), "smbseek-discover", &json!({}))
            .await
            .unwrap();
        for (ip, country, kind, reason) in [
            ("192.0.2.1", "US", FailureKind::AuthFailed, "all authentication methods failed"),
            ("192.0.2.2", "US", FailureKind::AuthFailed, "all authentication methods failed"),
            ("192.0.2.3", "FR", FailureKind::PortClosed, "port 445 closed or filtered"),
            ("192.0.2.4", "FR", FailureKind::Timeout, "command timed out after 30s"),
        ] {
            recorder
                .record_host(&HostOutcome::failed(ip, Some(country.into()), kind, Some(reason.into())))
                .await
                .unwrap();
        }
        recorder.finish(4, 0).await.unwrap();

        let analysis = analyze_failures(&ledger).await.unwrap();
        assert_eq!((analysis.total_failures, analysis.failing_hosts), (4, 4));
        assert_eq!(analysis.by_type[0].failure_type, "auth_failed");
        assert_eq!(analysis.by_type[0].occurrences, 2);
        assert_eq!(analysis.top_reasons[0].failure_reason, "all authentication methods failed");
        assert_eq!(analysis.countries.len(), 2);
        assert_eq!(analysis.recommendations.len(), 3);

        let text = render_failure_analysis(&analysis);
        assert!(text.contains("auth_failed: 2 (50%), 2 hosts"));
        assert!(text.contains("[timeout] command timed out after 30s: 1"));

        let path = std::env::temp_dir().join(format!("smbseek-failures-test-{}.json", std::process::id()));
        let written = save_failure_analysis(&analysis, Some(&path)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&written).unwrap()).unwrap();
        assert_eq!(value["by_type"][1]["hosts"], 1);
        let _ = std::fs::remove_file(&written);
    }
}
