//! Rescan policy: decides which candidate hosts need to be contacted now.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::AppConfig,
    db::{self, Ledger, DEFAULT_BATCH_SIZE},
    error::{ConfigError, LedgerError},
    models::KnownHost,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescanPolicy {
    pub rescan_after_days: i64,
    pub skip_failed_hosts: bool,
    pub batch_size: usize,
}

impl Default for RescanPolicy {
    fn default() -> Self {
        Self {
            rescan_after_days: 30,
            skip_failed_hosts: true,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RescanPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            rescan_after_days: cfg.workflow.rescan_after_days,
            skip_failed_hosts: cfg.workflow.skip_failed_hosts,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rescan_after_days < 1 {
            return Err(ConfigError::Invalid(format!(
                "rescan_after_days must be at least 1, got {}",
                self.rescan_after_days
            )));
        }
        if self.rescan_after_days > db::MAX_WINDOW_DAYS {
            return Err(ConfigError::Invalid(format!(
                "rescan_after_days must be at most {}, got {}",
                db::MAX_WINDOW_DAYS,
                self.rescan_after_days
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Per-run overrides given on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanFlags {
    pub rescan_all: bool,
    pub rescan_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub total: usize,
    pub known: usize,
    pub new: usize,
    pub recently_scanned: usize,
    pub failed: usize,
    pub to_scan_count: usize,
}

pub struct HostFilter<'a> {
    ledger: &'a Ledger,
    policy: RescanPolicy,
}

impl<'a> HostFilter<'a> {
    /// Fails with a configuration error for an invalid policy, before the ledger is touched.
    pub fn new(ledger: &'a Ledger, policy: RescanPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self { ledger, policy })
    }

    /// Read-only: never writes to the ledger.
    pub async fn filter_hosts(
        &self,
        candidates: &HashSet<String>,
        flags: ScanFlags,
    ) -> Result<(HashSet<String>, FilterStats), LedgerError> {
        if candidates.is_empty() {
            return Ok((HashSet::new(), FilterStats::default()));
        }

        if self.ledger.is_empty().await? {
            info!(candidates = candidates.len(), "empty ledger, scanning every candidate");
            let stats = FilterStats {
                total: candidates.len(),
                new: candidates.len(),
                to_scan_count: candidates.len(),
                ..Default::default()
            };
            return Ok((candidates.clone(), stats));
        }

        let known = self
            .ledger
            .known_hosts_info(candidates, self.policy.batch_size)
            .await?;
        debug!(candidates = candidates.len(), known = known.len(), "known host metadata loaded");

        let (to_scan, stats) = partition(candidates, &known, &self.policy, flags, db::now());
        info!(
            new = stats.new,
            known = stats.known,
            to_scan = stats.to_scan_count,
            "host filtering complete"
        );
        Ok((to_scan, stats))
    }
}

/// Splits candidates into the hosts to contact and the hosts to skip.
///
/// A host whose latest contact failed follows the failed-host branch only and
/// is never rescanned because of its age; `rescan_all` overrides everything.
pub fn partition(
    candidates: &HashSet<String>,
    known: &HashMap<String, KnownHost>,
    policy: &RescanPolicy,
    flags: ScanFlags,
    now: DateTime<Utc>,
) -> (HashSet<String>, FilterStats) {
    // An unrepresentable window means nothing is old enough to age out.
    let cutoff = TimeDelta::try_days(policy.rescan_after_days)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let retry_failed = flags.rescan_failed || !policy.skip_failed_hosts;

    let mut to_scan = HashSet::new();
    let mut stats = FilterStats {
        total: candidates.len(),
        ..Default::default()
    };

    for ip in candidates {
        let Some(host) = known.get(ip) else {
            stats.new += 1;
            to_scan.insert(ip.clone());
            continue;
        };
        stats.known += 1;

        let failed = host.status.is_failure();
        if flags.rescan_all {
            to_scan.insert(ip.clone());
        } else if failed && retry_failed {
            stats.failed += 1;
            to_scan.insert(ip.clone());
        } else if !failed && host.last_seen < cutoff {
            to_scan.insert(ip.clone());
        } else {
            stats.recently_scanned += 1;
        }
    }

    stats.to_scan_count = to_scan.len();
    (to_scan, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ServerContact, ServerStatus};

    fn set(ips: &[&str]) -> HashSet<String> {
        ips.iter().map(|s| s.to_string()).collect()
    }

    fn known_host(ip: &str, days_ago: i64, status: ServerStatus, now: DateTime<Utc>) -> (String, KnownHost) {
        (
            ip.to_string(),
            KnownHost {
                ip_address: ip.to_string(),
                last_seen: now - TimeDelta::days(days_ago),
                scan_count: 1,
                status,
            },
        )
    }

    #[tokio::test]
    async fn first_run_scans_everything() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let filter = HostFilter::new(&ledger, RescanPolicy::default()).unwrap();

        let (to_scan, stats) = filter
            .filter_hosts(&set(&["192.0.2.1", "192.0.2.2", "192.0.2.3"]), ScanFlags::default())
            .await
            .unwrap();
        assert_eq!(to_scan.len(), 3);
        assert_eq!(stats.new, 3);
        assert_eq!(stats.to_scan_count, 3);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_not_an_error() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let filter = HostFilter::new(&ledger, RescanPolicy::default()).unwrap();
        let (to_scan, stats) = filter.filter_hosts(&HashSet::new(), ScanFlags::default()).await.unwrap();
        assert!(to_scan.is_empty());
        assert_eq!(stats, FilterStats::default());
    }

    #[test]
    fn invalid_policy_is_a_config_error() {
        let policy = RescanPolicy {
            rescan_after_days: -1,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn oversized_rescan_window_is_a_config_error() {
        let policy = RescanPolicy {
            rescan_after_days: 1_000_000_000_000,
            ..Default::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("at most"));

        let ledger = Ledger::open_in_memory().await.unwrap();
        let mut cfg = AppConfig::default();
        cfg.workflow.rescan_after_days = i64::MAX;
        assert!(HostFilter::new(&ledger, RescanPolicy::from_config(&cfg)).is_err());
    }

    #[test]
    fn unrepresentable_window_never_ages_hosts_out() {
        let now = db::now();
        let known: HashMap<_, _> = [known_host("10.0.3.1", 5000, ServerStatus::Active, now)].into();
        let policy = RescanPolicy {
            rescan_after_days: i64::MAX,
            ..Default::default()
        };

        let (to_scan, stats) = partition(&set(&["10.0.3.1"]), &known, &policy, ScanFlags::default(), now);
        assert!(to_scan.is_empty());
        assert_eq!(stats.recently_scanned, 1);
    }

    #[test]
    fn age_boundary_around_rescan_window() {
        let now = db::now();
        let known: HashMap<_, _> = [
            known_host("10.0.0.29", 29, ServerStatus::Active, now),
            known_host("10.0.0.31", 31, ServerStatus::Active, now),
        ]
        .into();

        let (to_scan, stats) = partition(
            &set(&["10.0.0.29", "10.0.0.31"]),
            &known,
            &RescanPolicy::default(),
            ScanFlags::default(),
            now,
        );
        assert_eq!(to_scan, set(&["10.0.0.31"]));
        assert_eq!(stats.recently_scanned, 1);
        assert_eq!(stats.known, 2);
    }

    #[test]
    fn failed_hosts_skip_the_age_branch() {
        let now = db::now();
        let known: HashMap<_, _> = [
            known_host("10.0.1.1", 400, ServerStatus::Failed, now),
            known_host("10.0.1.2", 1, ServerStatus::Timeout, now),
        ]
        .into();
        let candidates = set(&["10.0.1.1", "10.0.1.2"]);

        let (to_scan, stats) = partition(&candidates, &known, &RescanPolicy::default(), ScanFlags::default(), now);
        assert!(to_scan.is_empty(), "old failed hosts must not be rescanned by age");
        assert_eq!(stats.failed, 0);

        let flags = ScanFlags {
            rescan_failed: true,
            ..Default::default()
        };
        let (to_scan, stats) = partition(&candidates, &known, &RescanPolicy::default(), flags, now);
        assert_eq!(to_scan, candidates);
        assert_eq!(stats.failed, 2);

        let lenient = RescanPolicy {
            skip_failed_hosts: false,
            ..Default::default()
        };
        let (to_scan, _) = partition(&candidates, &known, &lenient, ScanFlags::default(), now);
        assert_eq!(to_scan.len(), 2);
    }

    #[test]
    fn rescan_all_overrides_age_and_failure() {
        let now = db::now();
        let known: HashMap<_, _> = [
            known_host("10.0.2.1", 1, ServerStatus::Active, now),
            known_host("10.0.2.2", 2, ServerStatus::Failed, now),
        ]
        .into();
        let candidates = set(&["10.0.2.1", "10.0.2.2", "10.0.2.3"]);
        let flags = ScanFlags {
            rescan_all: true,
            ..Default::default()
        };

        let (to_scan, stats) = partition(&candidates, &known, &RescanPolicy::default(), flags, now);
        assert_eq!(to_scan, candidates);
        assert_eq!((stats.new, stats.known, stats.failed), (1, 2, 0));
    }

    #[tokio::test]
    async fn chunked_filtering_matches_single_batch() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let mut candidates = HashSet::new();
        for i in 0..1200u32 {
            let ip = format!("172.16.{}.{}", i / 256, i % 256);
            if i % 2 == 0 {
                let status = if i % 4 == 0 { ServerStatus::Failed } else { ServerStatus::Active };
                ledger
                    .record_contact(&ServerContact {
                        ip_address: ip.clone(),
                        status: Some(status),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
            }
            candidates.insert(ip);
        }

        let chunked = HostFilter::new(&ledger, RescanPolicy::default()).unwrap();
        let single = HostFilter::new(
            &ledger,
            RescanPolicy {
                batch_size: 5000,
                ..Default::default()
            },
        )
        .unwrap();

        let (a, stats_a) = chunked.filter_hosts(&candidates, ScanFlags::default()).await.unwrap();
        let (b, stats_b) = single.filter_hosts(&candidates, ScanFlags::default()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(stats_a, stats_b);
        assert_eq!(stats_a.known, 600);
        assert_eq!(stats_a.new, 600);
    }
}
