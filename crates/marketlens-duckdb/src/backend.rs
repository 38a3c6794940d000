use std::sync::Arc;

use anyhow::Result;
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::fragment::SqlFragment;
use crate::schema::init_sql;

/// A DuckDB backend for marketlens.
///
/// DuckDB is single-writer: concurrent reads are fine, but concurrent
/// writes cause contention. The connection lives behind `Arc<Mutex<_>>`
/// so concurrent sub-queries serialize on the handle while the struct
/// stays cheaply cloneable across workers.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

/// Prefix a statement with the application-identifier comment used for
/// operational tracing (`/* marketlens-<request id> */ SELECT ...`).
pub fn tag_statement(app_tag: &str, request_id: &str, sql: &str) -> String {
    format!("/* {app_tag}-{request_id} */ {sql}")
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"`.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!("DuckDB opened at {} with memory_limit={}", path, memory_limit);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an **in-memory** DuckDB database. Intended for tests; data is
    /// discarded when the struct is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a compiled SELECT inside its own transaction, tagged with the
    /// app identifier and request id so it can be spotted and killed from
    /// the outside. One transaction per statement keeps cancellation
    /// scoped to a single query.
    pub async fn run_select<T, F>(
        &self,
        fragment: &SqlFragment,
        app_tag: &str,
        request_id: &str,
        mut map_row: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&duckdb::Row<'_>) -> duckdb::Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let tagged = tag_statement(app_tag, request_id, &fragment.sql);
        let mut out = Vec::new();
        {
            let mut stmt = tx.prepare(&tagged)?;
            let mut rows = stmt.query(fragment.param_refs().as_slice())?;
            while let Some(row) = rows.next()? {
                match map_row(row) {
                    Ok(value) => out.push(value),
                    // A single bad row is skipped; a cursor failure above
                    // aborts the whole step via `?`.
                    Err(e) => {
                        tracing::warn!("skipping unreadable result row: {e}");
                    }
                }
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the connection lock for direct queries. Intended for
    /// integration tests and seed fixtures.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    pub async fn seed_event_name(&self, id: i64, project_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO event_names (id, project_id, name) VALUES (?1, ?2, ?3)",
            duckdb::params![id, project_id, name],
        )?;
        Ok(())
    }

    pub async fn seed_user(
        &self,
        id: &str,
        project_id: &str,
        customer_user_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, project_id, customer_user_id, join_timestamp) \
             VALUES (?1, ?2, ?3, 0)",
            duckdb::params![id, project_id, customer_user_id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn seed_event(
        &self,
        id: &str,
        project_id: &str,
        user_id: &str,
        event_name_id: i64,
        timestamp: i64,
        properties: &str,
        user_properties: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (id, project_id, user_id, event_name_id, timestamp, \
             properties, user_properties) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            duckdb::params![
                id,
                project_id,
                user_id,
                event_name_id,
                timestamp,
                properties,
                user_properties
            ],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn seed_marketing_report(
        &self,
        project_id: &str,
        attribution_key: &str,
        attribution_id: &str,
        key_parts_json: &str,
        impressions: i64,
        clicks: i64,
        spend: f64,
        currency: &str,
        timestamp: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO marketing_reports (project_id, attribution_key, attribution_id, \
             key_parts, impressions, clicks, spend, currency, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            duckdb::params![
                project_id,
                attribution_key,
                attribution_id,
                key_parts_json,
                impressions,
                clicks,
                spend,
                currency,
                timestamp
            ],
        )?;
        Ok(())
    }

    pub async fn seed_project_settings(
        &self,
        project_id: &str,
        timezone: &str,
        ad_account_ids: &[&str],
        session_event_name: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO project_settings \
             (project_id, timezone, ad_account_ids, session_event_name) \
             VALUES (?1, ?2, ?3, ?4)",
            duckdb::params![
                project_id,
                timezone,
                serde_json::to_string(ad_account_ids)?,
                session_event_name
            ],
        )?;
        Ok(())
    }
}
