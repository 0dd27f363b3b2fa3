//! Parsers for `smbclient` output.

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::{
    config::CollectionConfig,
    models::{extension_of, FileFinding},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub name: String,
    pub share_type: String,
    pub comment: Option<String>,
}

/// Listing of one share. `compromised` is set when enumeration stopped on a ransom note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShareListing {
    pub files: Vec<FileFinding>,
    pub compromised: bool,
    /// Files left out by the depth or extension filters.
    pub skipped: usize,
}

/// Bounds and filters applied while walking a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLimits {
    pub max_files: usize,
    /// Files in directories this deep or deeper are skipped. The share root is depth 0.
    pub max_depth: usize,
    pub included_extensions: Vec<String>,
    pub excluded_extensions: Vec<String>,
}

impl ListingLimits {
    pub fn from_config(cfg: &CollectionConfig) -> Self {
        Self {
            max_files: cfg.max_files_per_share,
            max_depth: cfg.max_directory_depth,
            included_extensions: normalized(&cfg.included_extensions),
            excluded_extensions: normalized(&cfg.excluded_extensions),
        }
    }

    /// Only a file count cap, no depth or extension filtering.
    pub fn unfiltered(max_files: usize) -> Self {
        Self {
            max_files,
            max_depth: usize::MAX,
            included_extensions: vec![],
            excluded_extensions: vec![],
        }
    }

    /// Exclusions win; a non-empty include list must then match.
    pub fn allows_extension(&self, file_name: &str) -> bool {
        let ext = extension_of(file_name);
        if self.excluded_extensions.contains(&ext) {
            return false;
        }
        self.included_extensions.is_empty() || self.included_extensions.contains(&ext)
    }
}

fn normalized(exts: &[String]) -> Vec<String> {
    exts.iter().map(|e| e.trim().to_lowercase()).collect()
}

fn directory_depth(dir: &str) -> usize {
    if dir.is_empty() {
        0
    } else {
        dir.split(['\\', '/']).filter(|part| !part.is_empty()).count()
    }
}

/// Extracts non-administrative `Disk` shares from `smbclient -L` output.
pub fn parse_share_list(output: &str) -> Vec<ShareEntry> {
    let mut shares = vec![];
    let mut in_section = false;

    for line in output.lines().map(str::trim) {
        if line.contains("Sharename") && line.contains("Type") {
            in_section = true;
            continue;
        }
        if !in_section || line.is_empty() || line.starts_with('-') {
            continue;
        }
        if line.starts_with("Server") || line.starts_with("Workgroup") || line.starts_with("SMB1 disabled") {
            break;
        }

        let mut parts = line.split_whitespace();
        let (Some(name), Some(share_type)) = (parts.next(), parts.next()) else {
            continue;
        };
        if name.ends_with('$') || share_type != "Disk" {
            continue;
        }
        let comment = parts.collect::<Vec<_>>().join(" ");
        shares.push(ShareEntry {
            name: name.to_string(),
            share_type: share_type.to_string(),
            comment: (!comment.is_empty()).then_some(comment),
        });
    }

    shares
}

/// Maps the result of `smbclient //host/share -c ls` to accessibility and an error label.
pub fn classify_share_access(success: bool, stdout: &str, stderr: &str) -> (bool, Option<String>) {
    if success {
        if !stderr.contains("NT_STATUS") && !stdout.trim().is_empty() {
            return (true, None);
        }
        return (false, Some("Access denied or empty share".to_string()));
    }

    let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
    let label = if detail.contains("NT_STATUS_ACCESS_DENIED") {
        "Access denied".to_string()
    } else if detail.contains("NT_STATUS_BAD_NETWORK_NAME") {
        "Share not found".to_string()
    } else if detail.contains("NT_STATUS_IO_TIMEOUT") {
        "Connection timeout".to_string()
    } else if detail.is_empty() {
        "smbclient error: unknown error".to_string()
    } else {
        format!("smbclient error: {}", detail.chars().take(50).collect::<String>())
    };
    (false, Some(label))
}

fn is_attribute_field(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| "ADHSRNVI".contains(c))
}

/// Parses `smbclient -c "recurse ON; ls"` output. Stops at the first file whose
/// name contains a ransomware indicator; that file is kept and flagged whatever
/// the filters say.
pub fn parse_listing(output: &str, share_name: &str, indicators: &[String], limits: &ListingLimits) -> ShareListing {
    let indicators: Vec<String> = indicators.iter().map(|i| i.to_lowercase()).collect();
    let mut listing = ShareListing::default();
    let mut current_dir = String::new();

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() || line.contains("blocks available") || line.starts_with("Domain=") {
            continue;
        }
        if line.starts_with('\\') || line.starts_with("./") {
            current_dir = line
                .trim_start_matches("./")
                .trim_start_matches('\\')
                .trim_end_matches(':')
                .to_string();
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 7 {
            continue;
        }
        let date = tokens[tokens.len() - 5..].join(" ");
        let Ok(size) = tokens[tokens.len() - 6].parse::<i64>() else {
            continue;
        };
        let mut name_end = tokens.len() - 6;
        let attrs = tokens[name_end - 1];
        if is_attribute_field(attrs) && name_end > 1 {
            name_end -= 1;
            if attrs.contains('D') {
                continue;
            }
        }

        let name = tokens[..name_end].join(" ");
        if name == "." || name == ".." {
            continue;
        }

        let file_path = if current_dir.is_empty() {
            name.clone()
        } else {
            format!("{current_dir}\\{name}")
        };
        let last_modified = NaiveDateTime::parse_from_str(&date, "%a %b %d %H:%M:%S %Y")
            .ok()
            .map(|dt| Utc.from_utc_datetime(&dt));
        let lower = name.to_lowercase();
        let flagged = indicators.iter().any(|i| lower.contains(i.as_str()));
        if !flagged && (directory_depth(&current_dir) >= limits.max_depth || !limits.allows_extension(&name)) {
            listing.skipped += 1;
            continue;
        }

        listing.files.push(FileFinding {
            share_name: share_name.to_string(),
            file_path,
            file_size: size,
            is_ransomware_indicator: flagged,
            last_modified,
            metadata: None,
        });

        if flagged {
            listing.compromised = true;
            break;
        }
        if listing.files.len() >= limits.max_files {
            break;
        }
    }

    listing
}
