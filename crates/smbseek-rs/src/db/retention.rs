use tracing::info;

use super::{days_ago, now, Ledger};
use crate::{error::LedgerResult, models::CleanupStats};

const OLD_SESSIONS: &str = "SELECT id FROM scan_sessions WHERE status = 'completed' AND timestamp < ?";

impl Ledger {
    /// Ages out completed sessions older than `days` together with their
    /// history rows, drops old failure logs and marks servers not seen since
    /// the cutoff as inactive. Runs in a single transaction.
    pub async fn cleanup_old_data(&self, days: i64) -> LedgerResult<CleanupStats> {
        let cutoff = days_ago(days)?;
        let mut tx = self.begin().await?;
        let mut stats = CleanupStats::default();

        for (table, counter) in [
            ("share_access", &mut stats.share_access_deleted),
            ("file_manifests", &mut stats.file_manifests_deleted),
            ("vulnerabilities", &mut stats.vulnerabilities_deleted),
        ] {
            let res = sqlx::query(&format!("DELETE FROM {table} WHERE session_id IN ({OLD_SESSIONS})"))
                .bind(cutoff)
                .execute(tx.conn())
                .await
                .map_err(super::write_failed)?;
            *counter = res.rows_affected();
        }

        stats.failure_logs_deleted = sqlx::query("DELETE FROM failure_logs WHERE failure_timestamp < ?")
            .bind(cutoff)
            .execute(tx.conn())
            .await
            .map_err(super::write_failed)?
            .rows_affected();

        stats.sessions_deleted = sqlx::query("DELETE FROM scan_sessions WHERE status = 'completed' AND timestamp < ?")
            .bind(cutoff)
            .execute(tx.conn())
            .await
            .map_err(super::write_failed)?
            .rows_affected();

        stats.servers_deactivated = sqlx::query(
            "UPDATE smb_servers SET status = 'inactive', updated_at = ? WHERE status = 'active' AND last_seen < ?",
        )
        .bind(now())
        .bind(cutoff)
        .execute(tx.conn())
        .await
        .map_err(super::write_failed)?
        .rows_affected();

        tx.commit().await?;
        info!(days, ?stats, "ledger cleanup finished");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::models::{NewShareAccess, ServerStatus, SessionUpdate};

    async fn backdate(ledger: &Ledger, sql: &str, days: i64, id: i64) {
        sqlx::query(sql)
            .bind(now() - Duration::days(days))
            .bind(id)
            .execute(ledger.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn old_completed_sessions_and_history_are_removed() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let old = ledger.create_scan_session("smbseek-access", &json!({})).await.unwrap();
        let fresh = ledger.create_scan_session("smbseek-access", &json!({})).await.unwrap();
        let stuck = ledger.create_scan_session("smbseek-access", &json!({})).await.unwrap();
        ledger.update_scan_session(old, &SessionUpdate::completed(1, 1)).await.unwrap();
        ledger.update_scan_session(fresh, &SessionUpdate::completed(1, 1)).await.unwrap();

        let server = ledger.get_or_create_server("192.0.2.10", Some("US"), Some("Anonymous")).await.unwrap();
        let stale = ledger.get_or_create_server("192.0.2.11", None, None).await.unwrap();
        ledger.add_share_access(&NewShareAccess::new(server, old, "public", true)).await.unwrap();
        ledger.add_share_access(&NewShareAccess::new(server, fresh, "public", true)).await.unwrap();

        backdate(&ledger, "UPDATE scan_sessions SET timestamp = ? WHERE id = ?", 120, old).await;
        backdate(&ledger, "UPDATE scan_sessions SET timestamp = ? WHERE id = ?", 120, stuck).await;
        sqlx::query("UPDATE smb_servers SET first_seen = ?1, last_seen = ?1 WHERE id = ?2")
            .bind(now() - Duration::days(120))
            .bind(stale)
            .execute(ledger.pool())
            .await
            .unwrap();

        let stats = ledger.cleanup_old_data(90).await.unwrap();
        assert_eq!(stats.sessions_deleted, 1);
        assert_eq!(stats.share_access_deleted, 1);
        assert_eq!(stats.servers_deactivated, 1);

        assert!(ledger.get_session(old).await.unwrap().is_none());
        assert!(ledger.get_session(fresh).await.unwrap().is_some());
        // running sessions are never aged out
        assert!(ledger.get_session(stuck).await.unwrap().is_some());

        let stale = ledger.get_server("192.0.2.11").await.unwrap().unwrap();
        assert_eq!(stale.status, ServerStatus::Inactive);
        let kept = ledger.get_server("192.0.2.10").await.unwrap().unwrap();
        assert_eq!(kept.status, ServerStatus::Active);
    }

    #[tokio::test]
    async fn cleanup_on_empty_ledger_is_a_no_op() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        assert_eq!(ledger.cleanup_old_data(30).await.unwrap(), CleanupStats::default());
    }

    #[tokio::test]
    async fn oversized_retention_window_is_an_error() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let err = ledger.cleanup_old_data(i64::MAX).await.unwrap_err();
        assert!(matches!(err, crate::error::LedgerError::InvalidWindow(_)));
    }
}
