//! SQLite-backed ledger of servers, scan sessions and findings.
//!
//! Every write goes through a [`LedgerTx`], so a multi-statement write either
//! lands completely or is rolled back. History tables are append-only.

mod queries;
mod retention;

use std::{path::Path, str::FromStr, time::Duration};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use tracing::{debug, error, info};

use crate::{
    error::{LedgerError, LedgerResult},
    models::{
        NewFailureLog, NewFileManifest, NewShareAccess, NewVulnerability, ServerContact,
        SessionStatus, SessionUpdate, ShareFinding,
    },
};

pub use queries::DEFAULT_BATCH_SIZE;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: u32 = 4;

/// Longest look-back accepted for day windows (about a century).
pub const MAX_WINDOW_DAYS: i64 = 36_500;
pub const MAX_WINDOW_HOURS: i64 = MAX_WINDOW_DAYS * 24;

/// Ledger timestamps are whole seconds in UTC so stored text sorts chronologically.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Start of a window reaching `days` back from now. Accepts `1..=MAX_WINDOW_DAYS`.
pub fn days_ago(days: i64) -> LedgerResult<DateTime<Utc>> {
    window_start(days, MAX_WINDOW_DAYS, "days", TimeDelta::try_days)
}

/// Start of a window reaching `hours` back from now. Accepts `1..=MAX_WINDOW_HOURS`.
pub fn hours_ago(hours: i64) -> LedgerResult<DateTime<Utc>> {
    window_start(hours, MAX_WINDOW_HOURS, "hours", TimeDelta::try_hours)
}

fn window_start(
    amount: i64,
    max: i64,
    unit: &str,
    to_delta: fn(i64) -> Option<TimeDelta>,
) -> LedgerResult<DateTime<Utc>> {
    if !(1..=max).contains(&amount) {
        return Err(LedgerError::InvalidWindow(format!(
            "{amount} {unit} is outside 1..={max}"
        )));
    }
    to_delta(amount)
        .and_then(|delta| now().checked_sub_signed(delta))
        .ok_or_else(|| LedgerError::InvalidWindow(format!("{amount} {unit} is out of range")))
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Opens (creating if needed) the database file in WAL mode and applies migrations.
    pub async fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| LedgerError::Unavailable(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(LedgerError::Unavailable)?;

        let ledger = Self::migrate(pool).await?;
        info!(path = %path.display(), "ledger opened");
        Ok(ledger)
    }

    /// Private in-memory ledger. One connection, kept alive for the pool's lifetime.
    pub async fn open_in_memory() -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(LedgerError::Unavailable)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(LedgerError::Unavailable)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> LedgerResult<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn begin(&self) -> LedgerResult<LedgerTx<'static>> {
        let tx = self.pool.begin().await.map_err(LedgerError::Unavailable)?;
        Ok(LedgerTx { tx })
    }

    /// Idempotent upsert: a new IP starts with `scan_count = 1`, a known IP
    /// gets `scan_count + 1` and a fresh `last_seen`.
    pub async fn get_or_create_server(
        &self,
        ip_address: &str,
        country: Option<&str>,
        auth_method: Option<&str>,
    ) -> LedgerResult<i64> {
        self.record_contact(&ServerContact {
            ip_address: ip_address.to_string(),
            country: country.map(str::to_string),
            auth_method: auth_method.map(str::to_string),
            status: None,
            session_id: None,
        })
        .await
    }

    /// Same upsert as [`Ledger::get_or_create_server`], also storing the contact outcome.
    pub async fn record_contact(&self, contact: &ServerContact) -> LedgerResult<i64> {
        let mut tx = self.begin().await?;
        let id = tx.record_contact(contact).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn create_scan_session(
        &self,
        tool_name: &str,
        config_snapshot: &serde_json::Value,
    ) -> LedgerResult<i64> {
        let mut tx = self.begin().await?;
        let id = tx.create_scan_session(tool_name, config_snapshot).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Returns `false` when the session is unknown or already completed.
    pub async fn update_scan_session(&self, session_id: i64, update: &SessionUpdate) -> LedgerResult<bool> {
        let mut tx = self.begin().await?;
        let updated = tx.update_scan_session(session_id, update).await?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn add_share_access(&self, record: &NewShareAccess) -> LedgerResult<i64> {
        let mut tx = self.begin().await?;
        let id = tx.add_share_access(record).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn add_file_manifest(&self, record: &NewFileManifest) -> LedgerResult<i64> {
        let mut tx = self.begin().await?;
        let id = tx.add_file_manifest(record).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn add_vulnerability(&self, record: &NewVulnerability) -> LedgerResult<i64> {
        let mut tx = self.begin().await?;
        let id = tx.add_vulnerability(record).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn add_failure_log(&self, record: &NewFailureLog) -> LedgerResult<i64> {
        let mut tx = self.begin().await?;
        let id = tx.add_failure_log(record).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Appends one share result per share for an already known server.
    /// Returns `false` without writing when the IP is not in the ledger.
    pub async fn store_share_results(
        &self,
        session_id: i64,
        ip_address: &str,
        shares: &[ShareFinding],
    ) -> LedgerResult<bool> {
        let Some(server) = self.get_server(ip_address).await? else {
            debug!(ip = %ip_address, "share results for unknown server dropped");
            return Ok(false);
        };

        let mut tx = self.begin().await?;
        for share in shares {
            tx.add_share_access(&share_record(server.id, session_id, share)).await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

pub(crate) fn share_record(server_id: i64, session_id: i64, share: &ShareFinding) -> NewShareAccess {
    NewShareAccess {
        server_id,
        session_id,
        share_name: share.share_name.clone(),
        accessible: share.accessible,
        error_message: share.error_message.clone(),
        permissions: None,
        share_type: share.share_type.clone(),
        comment: share.comment.clone(),
    }
}

/// An open write transaction. Dropping it without [`LedgerTx::commit`] rolls back.
pub struct LedgerTx<'c> {
    tx: Transaction<'c, Sqlite>,
}

impl LedgerTx<'_> {
    pub async fn commit(self) -> LedgerResult<()> {
        self.tx.commit().await.map_err(write_failed)
    }

    pub async fn record_contact(&mut self, contact: &ServerContact) -> LedgerResult<i64> {
        upsert_server(&mut self.tx, contact).await.map_err(write_failed)
    }

    pub async fn create_scan_session(
        &mut self,
        tool_name: &str,
        config_snapshot: &serde_json::Value,
    ) -> LedgerResult<i64> {
        let res = sqlx::query(
            "INSERT INTO scan_sessions(tool_name, timestamp, config_snapshot, status) VALUES(?, ?, ?, ?)",
        )
        .bind(tool_name)
        .bind(now())
        .bind(config_snapshot.to_string())
        .bind(SessionStatus::Running)
        .execute(&mut *self.tx)
        .await
        .map_err(write_failed)?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_scan_session(&mut self, session_id: i64, update: &SessionUpdate) -> LedgerResult<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE scan_sessions SET updated_at = ");
        qb.push_bind(now());
        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status);
        }
        if let Some(total) = update.total_targets {
            qb.push(", total_targets = ").push_bind(total);
        }
        if let Some(successful) = update.successful_targets {
            qb.push(", successful_targets = ").push_bind(successful);
        }
        qb.push(" WHERE id = ")
            .push_bind(session_id)
            .push(" AND status = ")
            .push_bind(SessionStatus::Running);

        let res = qb.build().execute(&mut *self.tx).await.map_err(write_failed)?;
        if res.rows_affected() == 0 {
            debug!(session_id, "session update skipped: unknown or already completed");
        }
        Ok(res.rows_affected() > 0)
    }

    pub async fn add_share_access(&mut self, record: &NewShareAccess) -> LedgerResult<i64> {
        let res = sqlx::query(
            "INSERT INTO share_access(server_id, session_id, share_name, accessible, error_message, permissions, share_type, comment, test_timestamp) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.server_id)
        .bind(record.session_id)
        .bind(&record.share_name)
        .bind(record.accessible)
        .bind(&record.error_message)
        .bind(&record.permissions)
        .bind(&record.share_type)
        .bind(&record.comment)
        .bind(now())
        .execute(&mut *self.tx)
        .await
        .map_err(write_failed)?;
        Ok(res.last_insert_rowid())
    }

    pub async fn add_file_manifest(&mut self, record: &NewFileManifest) -> LedgerResult<i64> {
        let res = sqlx::query(
            "INSERT INTO file_manifests(server_id, session_id, share_name, file_path, file_name, file_extension, file_size, is_ransomware_indicator, last_modified, metadata, discovery_timestamp) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.server_id)
        .bind(record.session_id)
        .bind(&record.share_name)
        .bind(&record.file_path)
        .bind(record.file_name())
        .bind(record.file_extension())
        .bind(record.file_size)
        .bind(record.is_ransomware_indicator)
        .bind(record.last_modified)
        .bind(record.metadata.as_ref().map(|m| m.to_string()))
        .bind(now())
        .execute(&mut *self.tx)
        .await
        .map_err(write_failed)?;
        Ok(res.last_insert_rowid())
    }

    pub async fn add_vulnerability(&mut self, record: &NewVulnerability) -> LedgerResult<i64> {
        let res = sqlx::query(
            "INSERT INTO vulnerabilities(server_id, session_id, vuln_type, severity, title, description, evidence, cvss_score, discovery_timestamp) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.server_id)
        .bind(record.session_id)
        .bind(&record.vuln_type)
        .bind(record.severity)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.evidence)
        .bind(record.cvss_score)
        .bind(now())
        .execute(&mut *self.tx)
        .await
        .map_err(write_failed)?;
        Ok(res.last_insert_rowid())
    }

    pub async fn add_failure_log(&mut self, record: &NewFailureLog) -> LedgerResult<i64> {
        let res = sqlx::query(
            "INSERT INTO failure_logs(ip_address, failure_type, failure_reason, failure_timestamp, session_id) VALUES(?, ?, ?, ?, ?)",
        )
        .bind(&record.ip_address)
        .bind(&record.failure_type)
        .bind(&record.failure_reason)
        .bind(now())
        .bind(record.session_id)
        .execute(&mut *self.tx)
        .await
        .map_err(write_failed)?;
        Ok(res.last_insert_rowid())
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

async fn upsert_server(conn: &mut SqliteConnection, contact: &ServerContact) -> sqlx::Result<i64> {
    let ts = now();
    sqlx::query_scalar(
        r#"
        INSERT INTO smb_servers(ip_address, country, auth_method, first_seen, last_seen, scan_count, status, last_session_id, updated_at)
        VALUES(?1, ?2, ?3, ?4, ?4, 1, COALESCE(?5, 'active'), ?6, ?4)
        ON CONFLICT(ip_address) DO UPDATE SET
            last_seen = MAX(excluded.last_seen, smb_servers.first_seen),
            scan_count = smb_servers.scan_count + 1,
            country = COALESCE(excluded.country, smb_servers.country),
            auth_method = COALESCE(excluded.auth_method, smb_servers.auth_method),
            status = COALESCE(?5, smb_servers.status),
            last_session_id = COALESCE(excluded.last_session_id, smb_servers.last_session_id),
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(&contact.ip_address)
    .bind(&contact.country)
    .bind(&contact.auth_method)
    .bind(ts)
    .bind(contact.status)
    .bind(contact.session_id)
    .fetch_one(conn)
    .await
}

fn write_failed(e: sqlx::Error) -> LedgerError {
    error!(error = %e, "ledger transaction failed, rolling back");
    LedgerError::WriteFailed(e)
}
