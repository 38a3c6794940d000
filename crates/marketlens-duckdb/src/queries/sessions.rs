use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use marketlens_core::attribution::{
    merge_session_maps, AttributionKey, AttributionQuery, AttributionQueryType,
    MarketingTouchInfo, UserSessionData, UserSessionMap,
};
use marketlens_core::config::EngineConfig;
use marketlens_core::query::PROPERTY_VALUE_NONE;

use crate::backend::DuckDbBackend;
use crate::fragment::SqlFragment;
use crate::pool::run_batch;

/// One decoded session/page-view row with its marketing dimensions, each
/// already None-substituted by the extraction CASE.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub user_id: String,
    pub timestamp: i64,
    pub campaign_id: String,
    pub campaign_name: String,
    pub adgroup_id: String,
    pub adgroup_name: String,
    pub keyword: String,
    pub keyword_match_type: String,
    pub source: String,
    pub channel: String,
    pub gclid: String,
    pub page_url: String,
}

/// Folds decoded rows into the shared session map. Supplied by the
/// caller so the puller stays ignorant of journey semantics.
pub type SessionRowProcessor = dyn Fn(&SessionRow, &mut UserSessionMap) + Send + Sync;

/// Lookback-adjusted window for session pulling. Engagement-based
/// queries also extend `to` forward so touches after the nominal
/// conversion window still count toward engagement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub from: i64,
    pub to: i64,
}

pub fn effective_window(query: &AttributionQuery, config: &EngineConfig) -> SessionWindow {
    let lookback = config.capped_lookback_secs(query.lookback_days);
    let to = match query.query_type {
        AttributionQueryType::EngagementBased => query.to + lookback,
        AttributionQueryType::ConversionBased => query.to,
    };
    SessionWindow {
        from: query.from - lookback,
        to,
    }
}

fn push_dimension_case(frag: &mut SqlFragment, property: &str, alias: &str) {
    let pieces = [
        "CASE WHEN ",
        " IS NULL THEN '$none' WHEN ",
        " = '' THEN '$none' ELSE ",
    ];
    for piece in pieces {
        frag.push(piece);
        frag.push("json_extract_string(events.properties, ");
        frag.push_bind(format!("$.{property}"));
        frag.push(")");
    }
    frag.push(&format!(" END AS {alias}"));
}

/// The fixed dimension set extracted per session row, in select order
/// after `user_id` and `timestamp`.
const SESSION_DIMENSIONS: &[(&str, &str)] = &[
    ("campaign_id", "campaign_id"),
    ("campaign", "campaign_name"),
    ("adgroup_id", "adgroup_id"),
    ("adgroup", "adgroup_name"),
    ("keyword", "keyword"),
    ("keyword_match_type", "keyword_match_type"),
    ("source", "source"),
    ("channel", "channel"),
    ("gclid", "gclid"),
    ("page_url", "page_url"),
];

fn build_session_chunk_query(
    project_id: &str,
    session_event_id: i64,
    window: SessionWindow,
    user_chunk: &[String],
) -> SqlFragment {
    let mut frag = SqlFragment::new();
    frag.push("SELECT events.user_id, events.timestamp");
    for (property, alias) in SESSION_DIMENSIONS {
        frag.push(", ");
        push_dimension_case(&mut frag, property, alias);
    }
    frag.push(" FROM events WHERE events.project_id = ");
    frag.push_bind(project_id);
    frag.push(" AND events.event_name_id = ");
    frag.push_bind(session_event_id);
    frag.push(" AND events.timestamp BETWEEN ");
    frag.push_bind(window.from);
    frag.push(" AND ");
    frag.push_bind(window.to);
    frag.push(" AND events.user_id IN ");
    frag.push_bind_list(user_chunk.iter().cloned());
    frag.push(" ORDER BY events.user_id, events.timestamp");
    frag
}

fn map_session_row(row: &duckdb::Row<'_>) -> duckdb::Result<SessionRow> {
    Ok(SessionRow {
        user_id: row.get(0)?,
        timestamp: row.get(1)?,
        campaign_id: row.get(2)?,
        campaign_name: row.get(3)?,
        adgroup_id: row.get(4)?,
        adgroup_name: row.get(5)?,
        keyword: row.get(6)?,
        keyword_match_type: row.get(7)?,
        source: row.get(8)?,
        channel: row.get(9)?,
        gclid: row.get(10)?,
        page_url: row.get(11)?,
    })
}

/// Standard row processor: forms the attribution key for the query's key
/// type and accumulates the journey record, flagging touches inside the
/// nominal query window.
pub fn default_session_processor(
    key: AttributionKey,
    query_from: i64,
    query_to: i64,
) -> impl Fn(&SessionRow, &mut UserSessionMap) + Send + Sync {
    move |row, map| {
        let touch = touch_from_row(key, row);
        let within = row.timestamp >= query_from && row.timestamp <= query_to;
        let user_entry = map.entry(row.user_id.clone()).or_default();
        match user_entry.get_mut(&touch.key) {
            Some(existing) => {
                existing.merge(&UserSessionData::from_touch(
                    touch,
                    row.timestamp,
                    within,
                ));
            }
            None => {
                user_entry.insert(
                    touch.key.clone(),
                    UserSessionData::from_touch(touch, row.timestamp, within),
                );
            }
        }
    }
}

fn touch_from_row(key: AttributionKey, row: &SessionRow) -> MarketingTouchInfo {
    let (id, key_parts): (&str, Vec<String>) = match key {
        AttributionKey::Campaign => (
            &row.campaign_id,
            vec![row.campaign_id.clone(), row.campaign_name.clone()],
        ),
        AttributionKey::AdGroup => (
            &row.adgroup_id,
            vec![
                row.campaign_id.clone(),
                row.campaign_name.clone(),
                row.adgroup_id.clone(),
                row.adgroup_name.clone(),
            ],
        ),
        AttributionKey::Keyword => (
            &row.keyword,
            vec![
                row.campaign_id.clone(),
                row.campaign_name.clone(),
                row.adgroup_id.clone(),
                row.adgroup_name.clone(),
                row.keyword_match_type.clone(),
                row.keyword.clone(),
            ],
        ),
        AttributionKey::Source => (&row.source, vec![row.source.clone()]),
        AttributionKey::Channel => (&row.channel, vec![row.channel.clone()]),
        AttributionKey::LandingPage | AttributionKey::AllPageView => {
            (&row.page_url, vec![row.page_url.clone()])
        }
    };
    let key_value = if id.is_empty() {
        PROPERTY_VALUE_NONE.to_string()
    } else {
        id.to_string()
    };
    MarketingTouchInfo {
        campaign_id: row.campaign_id.clone(),
        campaign_name: row.campaign_name.clone(),
        adgroup_id: row.adgroup_id.clone(),
        adgroup_name: row.adgroup_name.clone(),
        keyword_name: row.keyword.clone(),
        keyword_match_type: row.keyword_match_type.clone(),
        source: row.source.clone(),
        channel: row.channel.clone(),
        gclid: row.gclid.clone(),
        landing_page: row.page_url.clone(),
        key: key_value,
        key_parts,
    }
}

/// Pull session touchpoints for the candidate users over the
/// lookback-adjusted window.
///
/// User ids are chunked to the configured IN-clause batch size and the
/// chunks dispatched through the bounded pool; each chunk's rows go
/// through `processor` into a private map, merged into the output after
/// the chunk completes. Returns the merged map plus the users that had
/// at least one matching session.
#[allow(clippy::too_many_arguments)]
pub async fn pull_sessions(
    db: &Arc<DuckDbBackend>,
    project_id: &str,
    users: &[String],
    session_event_id: i64,
    query: &AttributionQuery,
    config: &EngineConfig,
    request_id: &str,
    processor: &SessionRowProcessor,
) -> Result<(UserSessionMap, Vec<String>)> {
    let window = effective_window(query, config);
    let chunks: Vec<Vec<String>> = users
        .chunks(config.user_batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();
    info!(
        project_id,
        users = users.len(),
        chunks = chunks.len(),
        from = window.from,
        to = window.to,
        "pulling session touchpoints"
    );

    let mut tasks = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let db = Arc::clone(db);
        let fragment = build_session_chunk_query(project_id, session_event_id, window, chunk);
        let app_tag = config.app_tag.clone();
        let request_id = request_id.to_string();
        tasks.push(async move {
            db.run_select(&fragment, &app_tag, &request_id, map_session_row)
                .await
        });
    }

    let mut sessions = UserSessionMap::new();
    for chunk_result in run_batch(tasks, config.max_concurrent_queries).await {
        let rows = chunk_result?;
        let mut chunk_map = UserSessionMap::new();
        for row in &rows {
            processor(row, &mut chunk_map);
        }
        merge_session_maps(&mut sessions, chunk_map);
    }

    let users_with_sessions: Vec<String> = sessions.keys().cloned().collect();
    Ok((sessions, users_with_sessions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketlens_core::attribution::{AnalyzeType, AttributionMethodology};
    use marketlens_core::query::QueryEventWithProperties;

    fn query(query_type: AttributionQueryType, lookback_days: i64) -> AttributionQuery {
        AttributionQuery {
            analyze_type: AnalyzeType::Users,
            attribution_key: AttributionKey::Campaign,
            methodology: AttributionMethodology::FirstTouch,
            compare_methodology: None,
            conversion_event: QueryEventWithProperties {
                name: "sign_up".to_string(),
                properties: vec![],
            },
            compare_event: None,
            linked_events: vec![],
            query_type,
            lookback_days,
            from: 1_000_000,
            to: 2_000_000,
            attribution_key_filters: vec![],
            tactic_offer_type: None,
        }
    }

    fn row(user: &str, ts: i64, campaign_id: &str) -> SessionRow {
        SessionRow {
            user_id: user.to_string(),
            timestamp: ts,
            campaign_id: campaign_id.to_string(),
            campaign_name: format!("{campaign_id}_name"),
            adgroup_id: "$none".to_string(),
            adgroup_name: "$none".to_string(),
            keyword: "$none".to_string(),
            keyword_match_type: "$none".to_string(),
            source: "google".to_string(),
            channel: "Paid Search".to_string(),
            gclid: "$none".to_string(),
            page_url: "/pricing".to_string(),
        }
    }

    #[test]
    fn test_effective_window_conversion_vs_engagement() {
        let config = EngineConfig::default();
        let day = 86_400;

        let w = effective_window(&query(AttributionQueryType::ConversionBased, 7), &config);
        assert_eq!(w.from, 1_000_000 - 7 * day);
        assert_eq!(w.to, 2_000_000);

        let w = effective_window(&query(AttributionQueryType::EngagementBased, 7), &config);
        assert_eq!(w.from, 1_000_000 - 7 * day);
        assert_eq!(w.to, 2_000_000 + 7 * day);
    }

    #[test]
    fn test_effective_window_caps_lookback() {
        let config = EngineConfig::default();
        let w = effective_window(
            &query(AttributionQueryType::ConversionBased, 10_000),
            &config,
        );
        assert_eq!(w.from, 1_000_000 - 370 * 86_400);
    }

    #[test]
    fn test_processor_forms_key_and_period_flag() {
        let processor = default_session_processor(AttributionKey::Campaign, 1_000_000, 2_000_000);
        let mut map = UserSessionMap::new();
        processor(&row("u1", 900_000, "camp_1"), &mut map);
        processor(&row("u1", 1_500_000, "camp_1"), &mut map);
        processor(&row("u1", 1_600_000, ""), &mut map);

        let camp = &map["u1"]["camp_1"];
        assert_eq!(camp.min_timestamp, 900_000);
        assert_eq!(camp.max_timestamp, 1_500_000);
        assert!(camp.within_query_period);
        assert_eq!(camp.touch.key_parts, vec!["camp_1", "camp_1_name"]);
        // Empty key collapses to the none sentinel.
        assert!(map["u1"].contains_key("$none"));
    }

    #[test]
    fn test_processor_lookback_only_touch_not_within_period() {
        let processor = default_session_processor(AttributionKey::Campaign, 1_000_000, 2_000_000);
        let mut map = UserSessionMap::new();
        processor(&row("u1", 900_000, "camp_1"), &mut map);
        assert!(!map["u1"]["camp_1"].within_query_period);
    }

    #[test]
    fn test_chunk_query_shape() {
        let frag = build_session_chunk_query(
            "proj_1",
            42,
            SessionWindow {
                from: 100,
                to: 200,
            },
            &["u1".to_string(), "u2".to_string()],
        );
        assert!(frag.sql.contains("events.user_id IN (?, ?)"));
        assert!(frag.sql.contains("AS campaign_id"));
        assert!(frag.sql.contains("AS page_url"));
        assert!(frag.sql.contains("ORDER BY events.user_id, events.timestamp"));
        // project, event id, from, to, then 3 path binds per dimension,
        // then the two user ids.
        let expected = 4 + SESSION_DIMENSIONS.len() * 3 + 2;
        assert_eq!(frag.params.len(), expected);
    }
}
