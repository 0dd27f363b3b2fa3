//! Candidate host discovery: the feed capability, query building and exclusions.

use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{config::ShodanConfig, error::DiscoveryError};

const SHODAN_API: &str = "https://api.shodan.io";
const SHODAN_PAGE_SIZE: usize = 100;

/// One host returned by a discovery feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub ip: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<HostRecord>, DiscoveryError>;

    /// Organization and ISP details for a single address.
    async fn host_details(&self, ip: &str) -> Result<HostRecord, DiscoveryError>;
}

pub struct ShodanFeed {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ShodanFeed {
    pub fn new(cfg: &ShodanConfig) -> Result<Self, DiscoveryError> {
        if cfg.api_key.trim().is_empty() {
            return Err(DiscoveryError::NotConfigured(
                "shodan.api_key is empty (set it in the config or SMBSEEK_SHODAN_API_KEY)".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!("smbseek/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_key: cfg.api_key.clone(),
            base_url: SHODAN_API.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T, DiscoveryError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(&[("key", self.api_key.as_str())])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ShodanErrorBody>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(DiscoveryError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[derive(Deserialize)]
struct ShodanErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct ShodanSearch {
    #[serde(default)]
    matches: Vec<ShodanMatch>,
    #[serde(default)]
    total: usize,
}

#[derive(Deserialize)]
struct ShodanMatch {
    ip_str: String,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    location: Option<ShodanLocation>,
}

#[derive(Deserialize)]
struct ShodanLocation {
    country_code: Option<String>,
}

#[derive(Deserialize)]
struct ShodanHost {
    ip_str: String,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

#[async_trait]
impl DiscoveryFeed for ShodanFeed {
    fn name(&self) -> &str {
        "Shodan"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<HostRecord>, DiscoveryError> {
        let mut records = vec![];
        let mut page = 1usize;

        while records.len() < limit {
            let result: ShodanSearch = self
                .get(
                    "/shodan/host/search",
                    &[("query", query.to_string()), ("page", page.to_string())],
                )
                .await?;
            let fetched = result.matches.len();
            records.extend(result.matches.into_iter().map(|m| HostRecord {
                ip: m.ip_str,
                org: m.org.unwrap_or_default(),
                isp: m.isp.unwrap_or_default(),
                country: m.location.and_then(|l| l.country_code),
            }));
            debug!(page, fetched, total = result.total, "shodan page fetched");

            if fetched < SHODAN_PAGE_SIZE || page * SHODAN_PAGE_SIZE >= result.total {
                break;
            }
            page += 1;
        }

        records.truncate(limit);
        Ok(records)
    }

    async fn host_details(&self, ip: &str) -> Result<HostRecord, DiscoveryError> {
        let host: ShodanHost = self.get(&format!("/shodan/host/{ip}"), &[]).await?;
        Ok(HostRecord {
            ip: host.ip_str,
            org: host.org.unwrap_or_default(),
            isp: host.isp.unwrap_or_default(),
            country: host.country_code,
        })
    }
}

/// Offline feed backed by a JSON array of host records.
pub struct StaticFeed {
    path: PathBuf,
    records: Vec<HostRecord>,
}

impl StaticFeed {
    pub fn load(path: &Path) -> Result<Self, DiscoveryError> {
        let raw = fs::read_to_string(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            records: serde_json::from_str(&raw)?,
        })
    }

    pub fn from_records(records: Vec<HostRecord>) -> Self {
        Self {
            path: PathBuf::new(),
            records,
        }
    }
}

#[async_trait]
impl DiscoveryFeed for StaticFeed {
    fn name(&self) -> &str {
        "static file"
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<HostRecord>, DiscoveryError> {
        debug!(path = %self.path.display(), records = self.records.len(), "serving static feed");
        Ok(self.records.iter().take(limit).cloned().collect())
    }

    async fn host_details(&self, ip: &str) -> Result<HostRecord, DiscoveryError> {
        self.records
            .iter()
            .find(|r| r.ip == ip)
            .cloned()
            .ok_or_else(|| DiscoveryError::Api {
                status: 404,
                message: format!("no record for {ip}"),
            })
    }
}

/// `base product [country:CC[,CC]] [-org:"..."]* extra...`
pub fn build_query(cfg: &ShodanConfig, countries: &[String], org_exclusions: &[String]) -> String {
    let mut parts = vec![cfg.base_query.clone(), cfg.product_filter.clone()];
    if !countries.is_empty() {
        parts.push(format!("country:{}", countries.join(",")));
    }
    if cfg.use_organization_exclusions {
        parts.extend(
            org_exclusions
                .iter()
                .map(|org| format!("-org:\"{}\"", org.replace('"', "\\\""))),
        );
    }
    parts.extend(cfg.additional_exclusions.iter().cloned());
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

/// One pattern per line; blank lines and `#` comments are ignored. A missing file yields no patterns.
pub fn load_exclusions(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let patterns: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            debug!(path = %path.display(), count = patterns.len(), "exclusion patterns loaded");
            patterns
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "exclusion file unavailable, no patterns applied");
            vec![]
        }
    }
}

/// Drops hosts run by excluded organizations or inside excluded networks.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<String>,
    networks: Vec<IpNet>,
}

impl ExclusionFilter {
    pub fn new(patterns: &[String], networks: Vec<IpNet>) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            networks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.networks.is_empty()
    }

    pub fn in_excluded_network(&self, ip: &str) -> bool {
        IpAddr::from_str(ip)
            .map(|addr| self.networks.iter().any(|net| net.contains(&addr)))
            .unwrap_or(false)
    }

    pub fn matches_org(&self, record: &HostRecord) -> bool {
        let org = record.org.to_lowercase();
        let isp = record.isp.to_lowercase();
        self.patterns
            .iter()
            .any(|p| org.contains(p.as_str()) || isp.contains(p.as_str()))
    }

    /// Best effort: when the record carries no organization data it is looked
    /// up through the feed, and a failed lookup means "not excluded".
    pub async fn should_exclude(&self, feed: &dyn DiscoveryFeed, record: &HostRecord) -> bool {
        if self.in_excluded_network(&record.ip) {
            return true;
        }
        if self.patterns.is_empty() {
            return false;
        }
        if !record.org.is_empty() || !record.isp.is_empty() {
            return self.matches_org(record);
        }
        match feed.host_details(&record.ip).await {
            Ok(details) => self.matches_org(&details),
            Err(e) => {
                debug!(ip = %record.ip, error = %e, "organization lookup failed, not excluding");
                false
            }
        }
    }

    /// Returns the kept records and the number excluded.
    pub async fn apply(&self, feed: &dyn DiscoveryFeed, records: Vec<HostRecord>) -> (Vec<HostRecord>, usize) {
        if self.is_empty() {
            return (records, 0);
        }
        let mut kept = Vec::with_capacity(records.len());
        let mut excluded = 0;
        for record in records {
            if self.should_exclude(feed, &record).await {
                excluded += 1;
            } else {
                kept.push(record);
            }
        }
        if excluded > 0 {
            info!(excluded, kept = kept.len(), "exclusion filters applied");
        }
        (kept, excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ip: &str, org: &str, isp: &str) -> HostRecord {
        HostRecord {
            ip: ip.into(),
            org: org.into(),
            isp: isp.into(),
            country: Some("US".into()),
        }
    }

    #[test]
    fn query_includes_countries_and_escaped_orgs() {
        let cfg = ShodanConfig::default();
        let query = build_query(
            &cfg,
            &["US".into(), "GB".into()],
            &["Amazon".into(), "Big \"Cloud\"".into()],
        );
        assert_eq!(
            query,
            r#"smb authentication: disabled product:"Samba" country:US,GB -org:"Amazon" -org:"Big \"Cloud\"" -"DSL""#
        );

        let global = build_query(
            &ShodanConfig {
                use_organization_exclusions: false,
                ..ShodanConfig::default()
            },
            &[],
            &["Amazon".into()],
        );
        assert!(!global.contains("country:"));
        assert!(!global.contains("-org:"));
    }

    #[test]
    fn exclusion_file_skips_comments_and_blanks() {
        let path = std::env::temp_dir().join(format!("smbseek-exclusions-{}.txt", std::process::id()));
        fs::write(&path, "# cloud providers\nAmazon\n\n  Google Cloud  \n#DigitalOcean\n").unwrap();
        assert_eq!(load_exclusions(&path), vec!["Amazon", "Google Cloud"]);
        let _ = fs::remove_file(&path);

        assert!(load_exclusions(Path::new("/nonexistent/exclusions.txt")).is_empty());
    }

    #[tokio::test]
    async fn exclusions_match_org_isp_and_networks() {
        let feed = StaticFeed::from_records(vec![record("192.0.2.9", "Amazon.com, Inc.", "")]);
        let filter = ExclusionFilter::new(
            &["amazon".into(), "Comcast".into()],
            vec!["10.0.0.0/8".parse().unwrap()],
        );

        let records = vec![
            record("198.51.100.1", "AMAZON-02", "Amazon"),
            record("198.51.100.2", "Small Office", "comcast cable"),
            record("10.1.2.3", "Home", "Local"),
            record("198.51.100.4", "Acme Corp", "Acme"),
            // no org data: looked up through the feed, which has none for this ip
            record("203.0.113.7", "", ""),
            record("192.0.2.9", "", ""),
        ];
        let (kept, excluded) = filter.apply(&feed, records).await;
        let ips: Vec<_> = kept.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["198.51.100.4", "203.0.113.7"]);
        assert_eq!(excluded, 4);
    }

    #[tokio::test]
    async fn static_feed_honours_limit() {
        let feed = StaticFeed::from_records(vec![
            record("192.0.2.1", "", ""),
            record("192.0.2.2", "", ""),
            record("192.0.2.3", "", ""),
        ]);
        assert_eq!(feed.search("ignored", 2).await.unwrap().len(), 2);
        assert!(feed.host_details("192.0.2.99").await.is_err());
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let err = ShodanFeed::new(&ShodanConfig::default()).err().unwrap();
        assert!(matches!(err, DiscoveryError::NotConfigured(_)));
    }

    #[test]
    fn static_records_deserialize_with_optional_fields() {
        let records: Vec<HostRecord> =
            serde_json::from_str(r#"[{"ip": "192.0.2.1"}, {"ip": "192.0.2.2", "org": "Acme", "country": "CA"}]"#).unwrap();
        assert_eq!(records[0].org, "");
        assert_eq!(records[1].country.as_deref(), Some("CA"));
    }
}
