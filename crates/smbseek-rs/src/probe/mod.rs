//! SMB probing capability and its `smbclient`-backed implementation.

mod command;
mod parse;

use std::{net::IpAddr, str::FromStr, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use crate::{config::ConnectionConfig, error::ProbeError, models::ShareFinding};

pub use command::{run_allowlisted, CommandOutput, ALLOWED_COMMANDS};
pub use parse::{classify_share_access, parse_listing, parse_share_list, ListingLimits, ShareEntry, ShareListing};

pub const SMB_PORT: u16 = 445;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    fn smbclient_args(&self) -> Vec<String> {
        if self.is_anonymous() {
            vec!["-N".into()]
        } else {
            vec!["--user".into(), format!("{}%{}", self.username, self.password)]
        }
    }
}

/// Methods tried in order during discovery; the first that authenticates wins.
pub fn auth_ladder() -> [(&'static str, Credentials); 3] {
    [
        ("Anonymous", Credentials::new("", "")),
        ("Guest/Blank", Credentials::new("guest", "")),
        ("Guest/Guest", Credentials::new("guest", "guest")),
    ]
}

/// Turns a stored auth method label back into credentials. Unknown labels fall back to guest/guest.
pub fn parse_auth_method(label: &str) -> Credentials {
    let lower = label.to_lowercase();
    if lower.contains("anonymous") {
        Credentials::new("", "")
    } else if lower.contains("guest/guest") {
        Credentials::new("guest", "guest")
    } else if lower.contains("guest/") {
        Credentials::new("guest", "")
    } else {
        debug!(label, "unknown auth method, defaulting to guest/guest");
        Credentials::new("guest", "guest")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub auth_method: Option<String>,
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Port check followed by the authentication ladder.
    async fn probe_host(&self, ip: &str) -> Result<ProbeResult, ProbeError>;

    async fn list_shares(&self, ip: &str, creds: &Credentials) -> Result<Vec<ShareEntry>, ProbeError>;

    /// Never fails: problems are reported in the finding's `error_message`.
    async fn test_share(&self, ip: &str, share: &ShareEntry, creds: &Credentials) -> ShareFinding;

    async fn list_files(&self, ip: &str, share: &str, creds: &Credentials) -> Result<ShareListing, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct SmbclientProber {
    command_timeout_secs: u64,
    port_timeout: Duration,
    limits: ListingLimits,
    ransomware_indicators: Vec<String>,
}

impl SmbclientProber {
    pub fn new(connection: &ConnectionConfig, limits: ListingLimits, ransomware_indicators: Vec<String>) -> Self {
        Self {
            command_timeout_secs: connection.timeout_secs,
            port_timeout: Duration::from_secs(connection.port_check_timeout_secs),
            limits,
            ransomware_indicators,
        }
    }

    async fn smbclient(&self, args: Vec<String>) -> Result<CommandOutput, ProbeError> {
        run_allowlisted("smbclient", &args, ALLOWED_COMMANDS, self.command_timeout_secs).await
    }
}

fn parse_target(ip: &str) -> Result<IpAddr, ProbeError> {
    IpAddr::from_str(ip).map_err(|_| ProbeError::InvalidTarget(ip.to_string()))
}

/// TCP connect check. Refused connections and timeouts both count as closed.
pub async fn port_open(ip: IpAddr, port: u16, wait: Duration) -> bool {
    matches!(timeout(wait, TcpStream::connect((ip, port))).await, Ok(Ok(_)))
}

#[async_trait]
impl Prober for SmbclientProber {
    async fn probe_host(&self, ip: &str) -> Result<ProbeResult, ProbeError> {
        let addr = parse_target(ip)?;
        if !port_open(addr, SMB_PORT, self.port_timeout).await {
            debug!(ip, "port 445 closed");
            return Ok(ProbeResult::default());
        }

        for (label, creds) in auth_ladder() {
            let mut args = vec!["-L".to_string(), format!("//{ip}")];
            args.extend(creds.smbclient_args());
            let out = match self.smbclient(args).await {
                Ok(out) => out,
                Err(ProbeError::Timeout(secs)) => {
                    debug!(ip, method = label, secs, "auth attempt timed out");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if out.success || out.stdout.contains("Sharename") {
                return Ok(ProbeResult {
                    reachable: true,
                    auth_method: Some(label.to_string()),
                });
            }
        }

        Ok(ProbeResult {
            reachable: true,
            auth_method: None,
        })
    }

    async fn list_shares(&self, ip: &str, creds: &Credentials) -> Result<Vec<ShareEntry>, ProbeError> {
        parse_target(ip)?;
        let mut args = vec!["-L".to_string(), format!("//{ip}")];
        args.extend(creds.smbclient_args());
        let out = self.smbclient(args).await?;
        if !out.success && !out.stdout.contains("Sharename") {
            debug!(ip, stderr = %out.stderr.trim(), "share enumeration refused");
            return Ok(vec![]);
        }
        Ok(parse_share_list(&out.stdout))
    }

    async fn test_share(&self, ip: &str, share: &ShareEntry, creds: &Credentials) -> ShareFinding {
        let mut args = vec![format!("//{ip}/{}", share.name)];
        args.extend(creds.smbclient_args());
        args.extend(["-c".to_string(), "ls".to_string()]);

        let (accessible, error_message) = match self.smbclient(args).await {
            Ok(out) => classify_share_access(out.success, &out.stdout, &out.stderr),
            Err(ProbeError::Timeout(_)) => (false, Some("Connection timeout".to_string())),
            Err(e) => (false, Some(format!("Test error: {e}"))),
        };

        ShareFinding {
            share_name: share.name.clone(),
            accessible,
            error_message,
            share_type: Some(share.share_type.clone()),
            comment: share.comment.clone(),
        }
    }

    async fn list_files(&self, ip: &str, share: &str, creds: &Credentials) -> Result<ShareListing, ProbeError> {
        parse_target(ip)?;
        let mut args = vec![format!("//{ip}/{share}")];
        args.extend(creds.smbclient_args());
        args.extend(["-c".to_string(), "recurse ON; ls".to_string()]);

        let out = self.smbclient(args).await?;
        if !out.success {
            debug!(ip, share, stderr = %out.stderr.trim(), "file listing failed");
            return Ok(ShareListing::default());
        }
        let listing = parse_listing(&out.stdout, share, &self.ransomware_indicators, &self.limits);
        debug!(ip, share, kept = listing.files.len(), skipped = listing.skipped, "share listed");
        Ok(listing)
    }
}
