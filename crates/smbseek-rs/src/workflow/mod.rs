//! Sequential discover and access pipelines with fixed-delay rate limiting.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    collect::{select_files, CollectionLimits, CollectionManifest, HostManifest},
    config::AppConfig,
    db::Ledger,
    discovery::{build_query, load_exclusions, DiscoveryFeed, ExclusionFilter},
    error::ProbeError,
    filter::{FilterStats, HostFilter, RescanPolicy, ScanFlags},
    models::{AccessibleShareHost, AuthenticatedHost, FailureKind, FileFinding, Severity, VulnFinding},
    probe::{parse_auth_method, ProbeResult, Prober, ShareListing},
    recorder::{HostOutcome, ScanRecorder},
};

pub const DISCOVER_TOOL: &str = "smbseek-discover";
pub const ACCESS_TOOL: &str = "smbseek-access";
pub const COLLECT_TOOL: &str = "smbseek-collect";

/// Cooperative stop signal checked between hosts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoverOptions {
    pub countries: Vec<String>,
    pub flags: ScanFlags,
}

/// Host selection for share testing. `session_id` wins over `recent_hours`;
/// with neither, every authenticated host is tested.
#[derive(Debug, Clone, Default)]
pub struct AccessOptions {
    pub session_id: Option<i64>,
    pub recent_hours: Option<i64>,
    pub list_files: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverSummary {
    pub session_id: i64,
    pub feed_results: usize,
    pub excluded: usize,
    pub filter: FilterStats,
    pub probed: usize,
    pub authenticated: usize,
    pub not_recorded: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessSummary {
    pub session_id: i64,
    pub hosts: usize,
    pub hosts_with_access: usize,
    pub shares_tested: usize,
    pub accessible_shares: usize,
    pub compromised_hosts: usize,
    pub not_recorded: usize,
    pub cancelled: bool,
}

pub struct Workflow {
    ledger: Ledger,
    config: Arc<AppConfig>,
    prober: Arc<dyn Prober>,
    cancel: CancelFlag,
}

impl Workflow {
    pub fn new(ledger: Ledger, config: Arc<AppConfig>, prober: Arc<dyn Prober>, cancel: CancelFlag) -> Self {
        Self {
            ledger,
            config,
            prober,
            cancel,
        }
    }

    fn host_delay(&self) -> Duration {
        self.config.connection.rate_limit_delay()
    }

    /// Feed, exclusions, rescan filter, then one probe per remaining host.
    pub async fn discover(&self, feed: &dyn DiscoveryFeed, opts: &DiscoverOptions) -> anyhow::Result<DiscoverSummary> {
        let filter = HostFilter::new(&self.ledger, RescanPolicy::from_config(&self.config))
            .context("invalid rescan policy")?;

        let security = &self.config.security;
        let patterns = load_exclusions(&security.exclusion_file);
        let query = build_query(&self.config.shodan, &opts.countries, &patterns);
        info!(feed = feed.name(), %query, "querying discovery feed");

        let records = feed
            .search(&query, self.config.shodan.max_results)
            .await
            .with_context(|| format!("{} search failed", feed.name()))?;
        let feed_results = records.len();

        let exclusions = ExclusionFilter::new(&patterns, self.config.excluded_networks());
        let (records, excluded) = exclusions.apply(feed, records).await;

        let countries: HashMap<String, Option<String>> =
            records.into_iter().map(|r| (r.ip, r.country)).collect();
        let candidates: HashSet<String> = countries.keys().cloned().collect();

        let (to_scan, stats) = filter
            .filter_hosts(&candidates, opts.flags)
            .await
            .context("host filtering failed")?;

        let recorder = ScanRecorder::begin(
            self.ledger.clone(),
            DISCOVER_TOOL,
            &json!({
                "countries": opts.countries,
                "query": query,
                "rescan_all": opts.flags.rescan_all,
                "rescan_failed": opts.flags.rescan_failed,
                "rescan_after_days": self.config.workflow.rescan_after_days,
            }),
        )
        .await?;

        let mut targets: Vec<String> = to_scan.into_iter().collect();
        targets.sort();

        let mut summary = DiscoverSummary {
            session_id: recorder.session_id(),
            feed_results,
            excluded,
            filter: stats,
            ..Default::default()
        };

        for (i, ip) in targets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = targets.len() - i, "discovery cancelled");
                summary.cancelled = true;
                break;
            }
            if i > 0 {
                sleep(self.host_delay()).await;
            }

            let country = countries.get(ip).cloned().flatten();
            let outcome = contact_outcome(ip, country, self.prober.probe_host(ip).await);
            summary.probed += 1;
            if outcome.is_success() {
                summary.authenticated += 1;
            }
            if let Err(e) = recorder.record_host(&outcome).await {
                warn!(ip = %ip, error = %e, "failed to record host, skipping");
                summary.not_recorded += 1;
            }
        }

        recorder
            .finish(summary.probed as i64, summary.authenticated as i64)
            .await?;
        info!(
            session_id = summary.session_id,
            probed = summary.probed,
            authenticated = summary.authenticated,
            "discovery finished"
        );
        Ok(summary)
    }

    /// Share enumeration and read tests for hosts that authenticated earlier.
    pub async fn access(&self, opts: &AccessOptions) -> anyhow::Result<AccessSummary> {
        let hosts = match (opts.session_id, opts.recent_hours) {
            (Some(session_id), _) => self.ledger.get_session_authenticated_hosts(session_id).await?,
            (None, Some(hours)) => self.ledger.get_recently_discovered_hosts(hours).await?,
            (None, None) => self.ledger.get_authenticated_hosts().await?,
        };

        let recorder = ScanRecorder::begin(
            self.ledger.clone(),
            ACCESS_TOOL,
            &json!({
                "discover_session": opts.session_id,
                "recent_hours": opts.recent_hours,
                "list_files": opts.list_files,
            }),
        )
        .await?;

        let mut summary = AccessSummary {
            session_id: recorder.session_id(),
            ..Default::default()
        };
        info!(session_id = summary.session_id, hosts = hosts.len(), "testing share access");

        for (i, host) in hosts.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = hosts.len() - i, "share access testing cancelled");
                summary.cancelled = true;
                break;
            }
            if i > 0 {
                sleep(self.host_delay()).await;
            }

            let outcome = match self.access_host(host, opts.list_files).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    recorder
                        .finish(summary.hosts as i64, summary.hosts_with_access as i64)
                        .await?;
                    return Err(e);
                }
            };
            summary.hosts += 1;
            let accessible = outcome.shares.iter().filter(|s| s.accessible).count();
            summary.shares_tested += outcome.shares.len();
            summary.accessible_shares += accessible;
            if accessible > 0 {
                summary.hosts_with_access += 1;
            }
            if !outcome.vulnerabilities.is_empty() {
                summary.compromised_hosts += 1;
            }

            if let Err(e) = recorder.record_host(&outcome).await {
                warn!(ip = %host.ip_address, error = %e, "failed to record host, skipping");
                summary.not_recorded += 1;
            }
        }

        recorder
            .finish(summary.hosts as i64, summary.hosts_with_access as i64)
            .await?;
        info!(
            session_id = summary.session_id,
            hosts = summary.hosts,
            accessible_shares = summary.accessible_shares,
            "share access testing finished"
        );
        Ok(summary)
    }

    /// Errors only when the probe tooling itself is unusable; host-level
    /// problems become a failed outcome.
    async fn access_host(&self, host: &AuthenticatedHost, list_files: bool) -> anyhow::Result<HostOutcome> {
        let ip = host.ip_address.as_str();
        let creds = parse_auth_method(&host.auth_method);

        let shares = match self.prober.list_shares(ip, &creds).await {
            Ok(shares) => shares,
            Err(e @ (ProbeError::Spawn { .. } | ProbeError::NotAllowed(_))) => {
                return Err(e).context("share enumeration tooling unavailable");
            }
            Err(e) => {
                warn!(ip, error = %e, "share enumeration failed");
                return Ok(HostOutcome::failed(
                    ip,
                    None,
                    failure_kind(&e),
                    Some(e.to_string()),
                ));
            }
        };

        let mut outcome = HostOutcome::authenticated(ip, None, host.auth_method.clone());
        let mut compromised = false;

        for (i, share) in shares.iter().enumerate() {
            if i > 0 {
                sleep(self.config.connection.share_access_delay()).await;
            }
            let finding = self.prober.test_share(ip, share, &creds).await;

            if finding.accessible && list_files && !compromised {
                match self.prober.list_files(ip, &share.name, &creds).await {
                    Ok(listing) => {
                        if let Some(vuln) = ransomware_finding(&share.name, &listing) {
                            compromised = true;
                            warn!(ip, share = %share.name, "ransomware indicator found, enumeration stopped");
                            outcome.vulnerabilities.push(vuln);
                        }
                        outcome.files.extend(listing.files);
                    }
                    Err(e) => warn!(ip, share = %share.name, error = %e, "file listing failed"),
                }
            }
            outcome.shares.push(finding);
        }

        Ok(outcome)
    }

    /// Lists accessible shares again and plans which files to collect from each
    /// host. Selected files and ransomware findings are recorded in a new session.
    pub async fn collect(&self) -> anyhow::Result<CollectionManifest> {
        let hosts = self.ledger.get_hosts_with_accessible_shares().await?;
        let settings = self.config.collection.clone();
        let limits = CollectionLimits::from_config(&settings);

        let recorder = ScanRecorder::begin(self.ledger.clone(), COLLECT_TOOL, &json!({ "collection": settings })).await?;
        let mut manifest = CollectionManifest::new(recorder.session_id(), settings);
        info!(session_id = manifest.session_id, hosts = hosts.len(), "planning file collection");

        let mut processed = 0i64;
        let mut with_files = 0i64;
        for (i, host) in hosts.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = hosts.len() - i, "collection cancelled");
                manifest.cancelled = true;
                break;
            }
            let Some(auth_method) = host.auth_method.as_deref() else {
                warn!(ip = %host.ip_address, "no recorded auth method, skipping");
                continue;
            };
            if processed > 0 {
                sleep(self.host_delay()).await;
            }

            let (entry, vulns) = match self.collect_host(host, auth_method, &limits).await {
                Ok(planned) => planned,
                Err(e) => {
                    recorder.finish(processed, with_files).await?;
                    return Err(e);
                }
            };
            processed += 1;
            if !entry.files.is_empty() {
                with_files += 1;
            }

            let mut outcome = HostOutcome::authenticated(&host.ip_address, host.country.clone(), auth_method);
            outcome.files = entry.files.clone();
            outcome.vulnerabilities = vulns;
            if let Err(e) = recorder.record_host(&outcome).await {
                warn!(ip = %host.ip_address, error = %e, "failed to record host, skipping");
            }
            manifest.push_host(entry);
        }

        recorder.finish(processed, with_files).await?;
        info!(
            session_id = manifest.session_id,
            hosts = manifest.hosts.len(),
            files = manifest.total_files,
            bytes = manifest.total_size_bytes,
            "collection plan finished"
        );
        Ok(manifest)
    }

    async fn collect_host(
        &self,
        host: &AccessibleShareHost,
        auth_method: &str,
        limits: &CollectionLimits,
    ) -> anyhow::Result<(HostManifest, Vec<VulnFinding>)> {
        let ip = host.ip_address.as_str();
        let creds = parse_auth_method(auth_method);
        let mut entry = HostManifest::new(ip, host.country.clone(), auth_method);
        let mut vulns = vec![];
        let mut candidates: Vec<FileFinding> = vec![];

        for (i, share) in host.accessible_shares.iter().enumerate() {
            if i > 0 {
                sleep(self.config.connection.share_access_delay()).await;
            }
            let listing = match self.prober.list_files(ip, share, &creds).await {
                Ok(listing) => listing,
                Err(e @ (ProbeError::Spawn { .. } | ProbeError::NotAllowed(_))) => {
                    return Err(e).context("file listing tooling unavailable");
                }
                Err(e) => {
                    warn!(ip, share = %share, error = %e, "file listing failed");
                    continue;
                }
            };
            entry.shares.push(share.clone());
            entry.skipped_files += listing.skipped;
            if let Some(vuln) = ransomware_finding(share, &listing) {
                warn!(ip, share = %share, "ransomware indicator found, collection stopped");
                entry.compromised = true;
                vulns.push(vuln);
                break;
            }
            candidates.extend(listing.files);
        }

        // compromised hosts are reported, never harvested
        if !entry.compromised {
            entry.set_files(select_files(candidates, limits));
        }
        Ok((entry, vulns))
    }
}

/// Critical finding for a listing that stopped on a ransom note.
fn ransomware_finding(share: &str, listing: &ShareListing) -> Option<VulnFinding> {
    if !listing.compromised {
        return None;
    }
    let note = listing
        .files
        .iter()
        .rev()
        .find(|f| f.is_ransomware_indicator)
        .map(|f| f.file_path.clone());
    Some(VulnFinding {
        vuln_type: "ransomware_indicator".into(),
        severity: Severity::Critical,
        title: "Potentially compromised host".into(),
        description: Some(format!("Share '{share}' contains a file matching a known ransomware note")),
        evidence: note,
        cvss_score: None,
    })
}

fn failure_kind(err: &ProbeError) -> FailureKind {
    match err {
        ProbeError::Timeout(_) => FailureKind::Timeout,
        _ => FailureKind::Error,
    }
}

/// Turns a probe result into the outcome recorded for the host.
pub fn contact_outcome(ip: &str, country: Option<String>, result: Result<ProbeResult, ProbeError>) -> HostOutcome {
    match result {
        Ok(ProbeResult {
            auth_method: Some(method),
            ..
        }) => HostOutcome::authenticated(ip, country, method),
        Ok(ProbeResult { reachable: false, .. }) => HostOutcome::failed(
            ip,
            country,
            FailureKind::PortClosed,
            Some("port 445 closed or filtered".into()),
        ),
        Ok(_) => HostOutcome::failed(
            ip,
            country,
            FailureKind::AuthFailed,
            Some("all authentication methods failed".into()),
        ),
        Err(e) => HostOutcome::failed(ip, country, failure_kind(&e), Some(e.to_string())),
    }
}
