use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attribution::{AttributionKey, AttributionQuery, KpiInfo};
use crate::reports::MarketingReports;

/// Per-project configuration read by the pipeline. Not owned by this
/// subsystem; the default is the safe fallback used when the settings
/// fetch times out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub timezone: String,
    pub ad_account_ids: Vec<String>,
    /// Event name marking a session/page-view touchpoint.
    pub session_event_name: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            ad_account_ids: Vec::new(),
            session_event_name: "$session".to_string(),
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_project_settings(&self, project_id: &str) -> Result<ProjectSettings>;
}

#[async_trait]
pub trait MarketingReportProvider: Send + Sync {
    async fn fetch_reports(
        &self,
        project_id: &str,
        key: AttributionKey,
        from: i64,
        to: i64,
    ) -> Result<MarketingReports>;
}

/// Executes KPI queries that stand in place of raw conversion events.
/// Each returned group carries the user ids that contributed to it and a
/// numeric value vector (possibly multi-valued, e.g. several deal
/// amounts).
#[async_trait]
pub trait KpiExecutor: Send + Sync {
    async fn execute_user_kpi(
        &self,
        project_id: &str,
        query: &AttributionQuery,
    ) -> Result<Vec<KpiInfo>>;

    async fn execute_crm_kpi(
        &self,
        project_id: &str,
        query: &AttributionQuery,
    ) -> Result<Vec<KpiInfo>>;
}
