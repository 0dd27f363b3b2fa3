use std::collections::{HashMap, HashSet};

use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::{days_ago, hours_ago, Ledger};
use crate::{
    error::{LedgerError, LedgerResult},
    models::{
        AccessibleShareHost, ActivitySummary, AuthMethodCount, AuthenticatedHost, CountryCount,
        FailedConnection, FailureReasonCount, FailureTypeCount, KnownHost, ScanSession, Server,
        ShareNameCount,
    },
};

/// Stays well under SQLite's bound-parameter limit.
pub const DEFAULT_BATCH_SIZE: usize = 500;

const AUTHENTICATED: &str = "s.status = 'active' AND s.auth_method IS NOT NULL AND lower(s.auth_method) <> 'failed'";

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct ServerStats {
    pub total_servers: i64,
    pub accessible_servers: i64,
    pub successfully_scanned: i64,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct ShareStats {
    pub total_shares: i64,
    pub accessible_shares: i64,
    pub servers_with_shares: i64,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct FileStats {
    pub total_files: i64,
    pub non_empty_files: i64,
    pub total_size_bytes: i64,
    pub ransomware_indicators: i64,
}

#[derive(FromRow)]
struct ShareHostRow {
    ip_address: String,
    country: Option<String>,
    auth_method: Option<String>,
    accessible_shares: Option<String>,
}

impl Ledger {
    pub async fn server_count(&self) -> LedgerResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM smb_servers")
            .fetch_one(&self.pool)
            .await
            .map_err(LedgerError::Query)
    }

    /// No server has ever been recorded.
    pub async fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.server_count().await? == 0)
    }

    pub async fn get_server(&self, ip_address: &str) -> LedgerResult<Option<Server>> {
        sqlx::query_as::<_, Server>(
            "SELECT id, ip_address, country, auth_method, first_seen, last_seen, scan_count, status, last_session_id FROM smb_servers WHERE ip_address = ?",
        )
        .bind(ip_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    pub async fn get_session(&self, session_id: i64) -> LedgerResult<Option<ScanSession>> {
        sqlx::query_as::<_, ScanSession>(
            "SELECT id, tool_name, timestamp, config_snapshot, status, total_targets, successful_targets, updated_at FROM scan_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Sessions never finished, usually because the process was killed.
    pub async fn running_sessions(&self) -> LedgerResult<Vec<ScanSession>> {
        sqlx::query_as::<_, ScanSession>(
            "SELECT id, tool_name, timestamp, config_snapshot, status, total_targets, successful_targets, updated_at FROM scan_sessions WHERE status = 'running' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Rescan metadata for every candidate already in the ledger, looked up
    /// `batch_size` addresses per query.
    pub async fn known_hosts_info(
        &self,
        ips: &HashSet<String>,
        batch_size: usize,
    ) -> LedgerResult<HashMap<String, KnownHost>> {
        let ips: Vec<&str> = ips.iter().map(String::as_str).collect();
        let mut known = HashMap::new();

        for chunk in ips.chunks(batch_size.max(1)) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT ip_address, last_seen, scan_count, status FROM smb_servers WHERE ip_address IN (",
            );
            let mut sep = qb.separated(", ");
            for ip in chunk {
                sep.push_bind(*ip);
            }
            sep.push_unseparated(")");

            let rows = qb
                .build_query_as::<KnownHost>()
                .fetch_all(&self.pool)
                .await
                .map_err(LedgerError::Query)?;
            known.extend(rows.into_iter().map(|row| (row.ip_address.clone(), row)));
        }

        Ok(known)
    }

    pub async fn get_authenticated_hosts(&self) -> LedgerResult<Vec<AuthenticatedHost>> {
        sqlx::query_as::<_, AuthenticatedHost>(&format!(
            "SELECT s.ip_address, s.country, s.auth_method, s.last_seen FROM smb_servers s WHERE {AUTHENTICATED} ORDER BY s.last_seen DESC, s.ip_address"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Authenticated hosts whose latest contact was made by `session_id`.
    pub async fn get_session_authenticated_hosts(&self, session_id: i64) -> LedgerResult<Vec<AuthenticatedHost>> {
        sqlx::query_as::<_, AuthenticatedHost>(&format!(
            "SELECT s.ip_address, s.country, s.auth_method, s.last_seen FROM smb_servers s WHERE s.last_session_id = ? AND {AUTHENTICATED} ORDER BY s.last_seen DESC, s.ip_address"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Authenticated hosts seen within the last `hours`.
    pub async fn get_recently_discovered_hosts(&self, hours: i64) -> LedgerResult<Vec<AuthenticatedHost>> {
        let cutoff = hours_ago(hours)?;
        sqlx::query_as::<_, AuthenticatedHost>(&format!(
            "SELECT s.ip_address, s.country, s.auth_method, s.last_seen FROM smb_servers s WHERE s.last_seen >= ? AND {AUTHENTICATED} ORDER BY s.last_seen DESC, s.ip_address"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    pub async fn get_failed_connections(&self) -> LedgerResult<Vec<FailedConnection>> {
        sqlx::query_as::<_, FailedConnection>(
            "SELECT ip_address, country, last_seen, status FROM smb_servers WHERE status IN ('failed', 'timeout') ORDER BY last_seen DESC, ip_address",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    pub async fn get_hosts_with_accessible_shares(&self) -> LedgerResult<Vec<AccessibleShareHost>> {
        let rows = sqlx::query_as::<_, ShareHostRow>(
            r#"
            SELECT s.ip_address, s.country, s.auth_method,
                   GROUP_CONCAT(DISTINCT sa.share_name) AS accessible_shares
            FROM smb_servers s
            INNER JOIN share_access sa ON sa.server_id = s.id
            WHERE sa.accessible = 1
            GROUP BY s.id
            ORDER BY s.ip_address
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut accessible_shares: Vec<String> = row
                    .accessible_shares
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                accessible_shares.sort();
                AccessibleShareHost {
                    ip_address: row.ip_address,
                    country: row.country,
                    auth_method: row.auth_method,
                    accessible_shares,
                }
            })
            .collect())
    }

    pub async fn recent_activity(&self, days: i64) -> LedgerResult<ActivitySummary> {
        let cutoff = days_ago(days)?;

        let (scan_sessions, targets_found, successful_connections): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(total_targets), 0), COALESCE(SUM(successful_targets), 0) FROM scan_sessions WHERE timestamp >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        let updated_servers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM smb_servers WHERE last_seen >= ?")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await
            .map_err(LedgerError::Query)?;

        Ok(ActivitySummary {
            days,
            scan_sessions,
            targets_found,
            successful_connections,
            updated_servers,
        })
    }

    /// Server counters, restricted to servers last touched by `session_id` when given.
    pub async fn server_stats(&self, session_id: Option<i64>) -> LedgerResult<ServerStats> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) AS total_servers, \
             COUNT(CASE WHEN {AUTHENTICATED} THEN 1 END) AS accessible_servers, \
             COUNT(CASE WHEN s.status NOT IN ('failed', 'timeout') THEN 1 END) AS successfully_scanned \
             FROM smb_servers s"
        ));
        if let Some(id) = session_id {
            qb.push(" WHERE s.last_session_id = ").push_bind(id);
        }
        qb.build_query_as::<ServerStats>()
            .fetch_one(&self.pool)
            .await
            .map_err(LedgerError::Query)
    }

    pub async fn share_stats(&self, session_id: Option<i64>) -> LedgerResult<ShareStats> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS total_shares, \
             COUNT(CASE WHEN accessible = 1 THEN 1 END) AS accessible_shares, \
             COUNT(DISTINCT CASE WHEN accessible = 1 THEN server_id END) AS servers_with_shares \
             FROM share_access",
        );
        if let Some(id) = session_id {
            qb.push(" WHERE session_id = ").push_bind(id);
        }
        qb.build_query_as::<ShareStats>()
            .fetch_one(&self.pool)
            .await
            .map_err(LedgerError::Query)
    }

    pub async fn file_stats(&self, session_id: Option<i64>) -> LedgerResult<FileStats> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS total_files, \
             COUNT(CASE WHEN file_size > 0 THEN 1 END) AS non_empty_files, \
             COALESCE(SUM(file_size), 0) AS total_size_bytes, \
             COUNT(CASE WHEN is_ransomware_indicator = 1 THEN 1 END) AS ransomware_indicators \
             FROM file_manifests",
        );
        if let Some(id) = session_id {
            qb.push(" WHERE session_id = ").push_bind(id);
        }
        qb.build_query_as::<FileStats>()
            .fetch_one(&self.pool)
            .await
            .map_err(LedgerError::Query)
    }

    pub async fn top_countries(&self, session_id: Option<i64>, limit: i64) -> LedgerResult<Vec<CountryCount>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COALESCE(country, 'Unknown') AS country, COUNT(*) AS count FROM smb_servers",
        );
        if let Some(id) = session_id {
            qb.push(" WHERE last_session_id = ").push_bind(id);
        }
        qb.push(" GROUP BY COALESCE(country, 'Unknown') ORDER BY count DESC, country LIMIT ")
            .push_bind(limit);
        qb.build_query_as::<CountryCount>()
            .fetch_all(&self.pool)
            .await
            .map_err(LedgerError::Query)
    }

    /// Server count per country over the whole ledger.
    pub async fn country_distribution(&self) -> LedgerResult<Vec<CountryCount>> {
        self.top_countries(None, -1).await
    }

    pub async fn auth_method_distribution(&self) -> LedgerResult<Vec<AuthMethodCount>> {
        sqlx::query_as::<_, AuthMethodCount>(
            r#"
            SELECT COALESCE(auth_method, 'Unknown') AS auth_method,
                   COUNT(*) AS server_count,
                   CAST(AVG(scan_count) AS REAL) AS avg_scans
            FROM smb_servers
            WHERE status = 'active'
            GROUP BY COALESCE(auth_method, 'Unknown')
            ORDER BY server_count DESC, auth_method
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    pub async fn top_shares(&self, limit: i64) -> LedgerResult<Vec<ShareNameCount>> {
        sqlx::query_as::<_, ShareNameCount>(
            r#"
            SELECT share_name,
                   COUNT(*) AS occurrence_count,
                   COUNT(DISTINCT server_id) AS server_count
            FROM share_access
            WHERE accessible = 1
            GROUP BY share_name
            ORDER BY occurrence_count DESC, share_name
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Total failure log rows and the number of distinct addresses behind them.
    pub async fn failure_totals(&self) -> LedgerResult<(i64, i64)> {
        sqlx::query_as("SELECT COUNT(*), COUNT(DISTINCT ip_address) FROM failure_logs")
            .fetch_one(&self.pool)
            .await
            .map_err(LedgerError::Query)
    }

    pub async fn failure_type_counts(&self) -> LedgerResult<Vec<FailureTypeCount>> {
        sqlx::query_as::<_, FailureTypeCount>(
            r#"
            SELECT failure_type,
                   COUNT(*) AS occurrences,
                   COUNT(DISTINCT ip_address) AS hosts
            FROM failure_logs
            GROUP BY failure_type
            ORDER BY occurrences DESC, failure_type
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Most frequent failure reasons, grouped with their failure type.
    pub async fn top_failure_reasons(&self, limit: i64) -> LedgerResult<Vec<FailureReasonCount>> {
        sqlx::query_as::<_, FailureReasonCount>(
            r#"
            SELECT failure_type,
                   COALESCE(failure_reason, 'unknown') AS failure_reason,
                   COUNT(*) AS occurrences
            FROM failure_logs
            GROUP BY failure_type, COALESCE(failure_reason, 'unknown')
            ORDER BY occurrences DESC, failure_type, failure_reason
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }

    /// Distinct failing addresses per country of the matching server row.
    pub async fn failure_countries(&self, limit: i64) -> LedgerResult<Vec<CountryCount>> {
        sqlx::query_as::<_, CountryCount>(
            r#"
            SELECT COALESCE(s.country, 'Unknown') AS country,
                   COUNT(DISTINCT f.ip_address) AS count
            FROM failure_logs f
            LEFT JOIN smb_servers s ON s.ip_address = f.ip_address
            GROUP BY COALESCE(s.country, 'Unknown')
            ORDER BY count DESC, country
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)
    }
}
