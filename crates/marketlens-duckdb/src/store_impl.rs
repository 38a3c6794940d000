use anyhow::Result;
use async_trait::async_trait;

use marketlens_core::attribution::AttributionKey;
use marketlens_core::collaborators::{MarketingReportProvider, ProjectSettings, SettingsStore};
use marketlens_core::reports::{MarketingReportRow, MarketingReports};

use crate::DuckDbBackend;

#[async_trait]
impl SettingsStore for DuckDbBackend {
    async fn get_project_settings(&self, project_id: &str) -> Result<ProjectSettings> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT timezone, ad_account_ids, session_event_name \
             FROM project_settings WHERE project_id = ?1",
        )?;
        let mut rows = stmt.query_map(duckdb::params![project_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        // Projects without a settings row run on the defaults.
        let Some(row) = rows.next() else {
            return Ok(ProjectSettings::default());
        };
        let (timezone, ad_account_ids_json, session_event_name) = row?;
        let ad_account_ids: Vec<String> = serde_json::from_str(&ad_account_ids_json)?;
        Ok(ProjectSettings {
            timezone,
            ad_account_ids,
            session_event_name,
        })
    }
}

#[async_trait]
impl MarketingReportProvider for DuckDbBackend {
    async fn fetch_reports(
        &self,
        project_id: &str,
        key: AttributionKey,
        from: i64,
        to: i64,
    ) -> Result<MarketingReports> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT attribution_id, key_parts, impressions, clicks, spend, currency, timestamp \
             FROM marketing_reports \
             WHERE project_id = ?1 AND attribution_key = ?2 AND timestamp BETWEEN ?3 AND ?4",
        )?;
        let mapped = stmt.query_map(
            duckdb::params![project_id, key.as_str(), from, to],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut rows = Vec::new();
        for row in mapped {
            let (attribution_id, key_parts_json, impressions, clicks, spend, currency, timestamp) =
                row?;
            let key_parts: Vec<String> = serde_json::from_str(&key_parts_json)?;
            rows.push(MarketingReportRow {
                attribution_id,
                key_parts,
                impressions,
                clicks,
                spend,
                currency,
                timestamp,
            });
        }
        Ok(MarketingReports { rows })
    }
}
