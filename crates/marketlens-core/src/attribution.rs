use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::query::{LogicalOp, QueryEventWithProperties, PROPERTY_VALUE_NONE};

/// The touchpoint dimension conversion credit is allocated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionKey {
    Campaign,
    Source,
    AdGroup,
    Keyword,
    Channel,
    LandingPage,
    AllPageView,
}

impl AttributionKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionKey::Campaign => "campaign",
            AttributionKey::Source => "source",
            AttributionKey::AdGroup => "adgroup",
            AttributionKey::Keyword => "keyword",
            AttributionKey::Channel => "channel",
            AttributionKey::LandingPage => "landing_page",
            AttributionKey::AllPageView => "all_page_view",
        }
    }

    /// Header columns shown for this key in the tabular result.
    pub fn dimension_headers(&self) -> Vec<&'static str> {
        match self {
            AttributionKey::Campaign => vec!["campaign_id", "campaign"],
            AttributionKey::AdGroup => {
                vec!["campaign_id", "campaign", "adgroup_id", "adgroup"]
            }
            AttributionKey::Keyword => vec![
                "campaign_id",
                "campaign",
                "adgroup_id",
                "adgroup",
                "keyword_match_type",
                "keyword",
            ],
            AttributionKey::Source => vec!["source"],
            AttributionKey::Channel => vec!["channel"],
            AttributionKey::LandingPage => vec!["landing_page"],
            AttributionKey::AllPageView => vec!["page_url"],
        }
    }

    /// Page-based keys carry no paid-marketing identity, so performance
    /// reports and tactic-type marketing events cannot be joined to them.
    pub fn is_page_based(&self) -> bool {
        matches!(self, AttributionKey::LandingPage | AttributionKey::AllPageView)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethodology {
    FirstTouch,
    LastTouch,
    FirstTouchNonDirect,
    LastTouchNonDirect,
    Linear,
    UShaped,
    TimeDecay,
    Influence,
}

impl AttributionMethodology {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionMethodology::FirstTouch => "first_touch",
            AttributionMethodology::LastTouch => "last_touch",
            AttributionMethodology::FirstTouchNonDirect => "first_touch_non_direct",
            AttributionMethodology::LastTouchNonDirect => "last_touch_non_direct",
            AttributionMethodology::Linear => "linear",
            AttributionMethodology::UShaped => "u_shaped",
            AttributionMethodology::TimeDecay => "time_decay",
            AttributionMethodology::Influence => "influence",
        }
    }
}

/// What stands in place of a conversion for this query: raw goal events,
/// a user-level KPI, or a CRM-object KPI. Closed so downstream dispatch
/// is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzeType {
    Users,
    UserKpi,
    CrmKpi,
}

/// Whether the attribution window is anchored strictly to the conversion
/// event or extended to post-conversion engagement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionQueryType {
    ConversionBased,
    EngagementBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TacticOfferType {
    Tactic,
    Offer,
    TacticOffer,
}

/// Result-level filter on an attribution key dimension, applied after
/// allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionKeyFilter {
    pub dimension: String,
    pub operator: KeyFilterOperator,
    pub value: String,
    pub logical_op: LogicalOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyFilterOperator {
    Equals,
    NotEqual,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionQuery {
    pub analyze_type: AnalyzeType,
    pub attribution_key: AttributionKey,
    pub methodology: AttributionMethodology,
    #[serde(default)]
    pub compare_methodology: Option<AttributionMethodology>,
    pub conversion_event: QueryEventWithProperties,
    #[serde(default)]
    pub compare_event: Option<QueryEventWithProperties>,
    #[serde(default)]
    pub linked_events: Vec<QueryEventWithProperties>,
    pub query_type: AttributionQueryType,
    pub lookback_days: i64,
    pub from: i64,
    pub to: i64,
    #[serde(default)]
    pub attribution_key_filters: Vec<AttributionKeyFilter>,
    #[serde(default)]
    pub tactic_offer_type: Option<TacticOfferType>,
}

impl AttributionQuery {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.from <= 0 || self.to <= 0 || self.from > self.to {
            return Err(CoreError::Validation("invalid query time range".to_string()));
        }
        if self.lookback_days < 0 {
            return Err(CoreError::Validation("invalid lookback days".to_string()));
        }
        if self.attribution_key.is_page_based()
            && matches!(
                self.tactic_offer_type,
                Some(TacticOfferType::Tactic) | Some(TacticOfferType::TacticOffer)
            )
        {
            return Err(CoreError::Validation(format!(
                "attribution key {} cannot be combined with tactic marketing events",
                self.attribution_key.as_str()
            )));
        }
        Ok(())
    }
}

/// Marketing dimensions extracted from one touchpoint row. `key` is the
/// formed attribution key string; `key_parts` are its display columns in
/// header order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketingTouchInfo {
    pub campaign_id: String,
    pub campaign_name: String,
    pub adgroup_id: String,
    pub adgroup_name: String,
    pub keyword_name: String,
    pub keyword_match_type: String,
    pub source: String,
    pub channel: String,
    pub gclid: String,
    pub landing_page: String,
    pub key: String,
    pub key_parts: Vec<String>,
}

impl MarketingTouchInfo {
    pub fn none() -> Self {
        Self {
            key: PROPERTY_VALUE_NONE.to_string(),
            ..Default::default()
        }
    }
}

/// Journey record for one `(user, attribution key)` pair: every touchpoint
/// timestamp plus the widened min/max. `within_query_period` is false when
/// every touch fell in the lookback extension only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSessionData {
    pub touch: MarketingTouchInfo,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub timestamps: Vec<i64>,
    pub within_query_period: bool,
}

impl UserSessionData {
    pub fn from_touch(touch: MarketingTouchInfo, timestamp: i64, within_period: bool) -> Self {
        Self {
            touch,
            min_timestamp: timestamp,
            max_timestamp: timestamp,
            timestamps: vec![timestamp],
            within_query_period: within_period,
        }
    }

    /// Fold another record for the same key into this one. Min/max only
    /// ever widen; timestamps concatenate; the period flag ORs.
    pub fn merge(&mut self, other: &UserSessionData) {
        self.min_timestamp = self.min_timestamp.min(other.min_timestamp);
        self.max_timestamp = self.max_timestamp.max(other.max_timestamp);
        self.timestamps.extend_from_slice(&other.timestamps);
        self.within_query_period = self.within_query_period || other.within_query_period;
    }
}

/// attribution key -> journey record.
pub type KeySessionMap = HashMap<String, UserSessionData>;
/// user id -> attribution key -> journey record.
pub type UserSessionMap = HashMap<String, KeySessionMap>;

/// Merge a chunk's session map into the accumulator. Per-chunk maps stay
/// private to their worker; this is the only write path, so merge order
/// independence is testable in isolation.
pub fn merge_session_maps(dst: &mut UserSessionMap, src: UserSessionMap) {
    for (user_id, keys) in src {
        let user_entry = dst.entry(user_id).or_default();
        for (key, data) in keys {
            match user_entry.get_mut(&key) {
                Some(existing) => existing.merge(&data),
                None => {
                    user_entry.insert(key, data);
                }
            }
        }
    }
}

/// Re-key raw-user sessions onto coalesced (customer) ids. Users missing
/// from the mapping keep their raw id. Collisions merge.
pub fn coalesce_session_map(
    sessions: UserSessionMap,
    user_to_coal: &HashMap<String, String>,
) -> UserSessionMap {
    let mut out: UserSessionMap = HashMap::new();
    for (user_id, keys) in sessions {
        let coal_id = user_to_coal
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| user_id.clone());
        let mut chunk: UserSessionMap = HashMap::new();
        chunk.insert(coal_id, keys);
        merge_session_maps(&mut out, chunk);
    }
    out
}

/// Conversion record for one coalesced user: first-occurrence timestamp
/// and the weight vector applied to allocated credit ([1.0] for raw event
/// conversions, the KPI value vector in KPI modes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionInfo {
    pub timestamp: i64,
    pub weights: Vec<f64>,
}

impl ConversionInfo {
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp,
            weights: vec![1.0],
        }
    }
}

/// One externally computed KPI group (e.g. a CRM deal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiInfo {
    pub kpi_id: String,
    pub user_ids: Vec<String>,
    pub coal_user_ids: Vec<String>,
    pub values: Vec<f64>,
    pub timestamp: i64,
}

/// Merge per-user sessions into KPI-indexed sessions: for every user that
/// contributed to a KPI id, fold that user's key map into the KPI's map.
/// KPI ids with no user ids are skipped. Fails when no KPI group has a
/// single touchpoint, because there is nothing to allocate against.
pub fn group_sessions_by_kpi(
    kpis: &[KpiInfo],
    sessions: &UserSessionMap,
) -> Result<UserSessionMap> {
    let mut grouped: UserSessionMap = HashMap::new();
    for kpi in kpis {
        let users: &[String] = if kpi.coal_user_ids.is_empty() {
            &kpi.user_ids
        } else {
            &kpi.coal_user_ids
        };
        if users.is_empty() {
            continue;
        }
        for user_id in users {
            if let Some(keys) = sessions.get(user_id) {
                let mut chunk: UserSessionMap = HashMap::new();
                chunk.insert(kpi.kpi_id.clone(), keys.clone());
                merge_session_maps(&mut grouped, chunk);
            }
        }
    }
    let has_touch = grouped.values().any(|keys| {
        keys.values().any(|data| !data.timestamps.is_empty())
    });
    if !has_touch {
        return Err(anyhow!("no user journey found"));
    }
    Ok(grouped)
}

/// Per-attribution-key accumulator. Count vectors are position-indexed:
/// one slot per conversion-event position (or KPI value position), plus a
/// parallel compare series when a comparison methodology/event runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributionData {
    pub key_parts: Vec<String>,
    pub conversion_counts: Vec<f64>,
    pub compare_counts: Vec<f64>,
    pub linked_event_counts: Vec<f64>,
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
}

impl AttributionData {
    pub fn with_positions(key_parts: Vec<String>, positions: usize, linked: usize) -> Self {
        Self {
            key_parts,
            conversion_counts: vec![0.0; positions],
            compare_counts: Vec::new(),
            linked_event_counts: vec![0.0; linked],
            impressions: 0,
            clicks: 0,
            spend: 0.0,
        }
    }
}

/// Tabular attribution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionResult {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(ts: i64, within: bool) -> UserSessionData {
        UserSessionData::from_touch(MarketingTouchInfo::none(), ts, within)
    }

    fn map_of(user: &str, key: &str, data: UserSessionData) -> UserSessionMap {
        let mut keys = KeySessionMap::new();
        keys.insert(key.to_string(), data);
        let mut m = UserSessionMap::new();
        m.insert(user.to_string(), keys);
        m
    }

    #[test]
    fn test_merge_widens_and_concatenates() {
        let mut a = session(100, false);
        a.merge(&session(50, true));
        a.merge(&session(200, false));
        assert_eq!(a.min_timestamp, 50);
        assert_eq!(a.max_timestamp, 200);
        assert!(a.within_query_period);
        assert_eq!(a.timestamps.len(), 3);
    }

    #[test]
    fn test_merge_session_maps_order_independent() {
        let chunks = vec![
            map_of("u1", "google", session(100, true)),
            map_of("u1", "google", session(300, false)),
            map_of("u1", "facebook", session(200, true)),
        ];

        let mut forward = UserSessionMap::new();
        for c in chunks.clone() {
            merge_session_maps(&mut forward, c);
        }
        let mut reverse = UserSessionMap::new();
        for c in chunks.into_iter().rev() {
            merge_session_maps(&mut reverse, c);
        }

        for m in [&forward, &reverse] {
            let google = &m["u1"]["google"];
            assert_eq!(google.min_timestamp, 100);
            assert_eq!(google.max_timestamp, 300);
            assert!(google.within_query_period);
            let mut ts = google.timestamps.clone();
            ts.sort_unstable();
            assert_eq!(ts, vec![100, 300]);
            assert_eq!(m["u1"]["facebook"].timestamps, vec![200]);
        }
    }

    #[test]
    fn test_coalesce_merges_colliding_users() {
        let mut sessions = map_of("anon_1", "google", session(100, true));
        merge_session_maps(&mut sessions, map_of("anon_2", "google", session(200, true)));
        let mapping: HashMap<String, String> = [
            ("anon_1".to_string(), "cust_9".to_string()),
            ("anon_2".to_string(), "cust_9".to_string()),
        ]
        .into_iter()
        .collect();

        let coalesced = coalesce_session_map(sessions, &mapping);
        assert_eq!(coalesced.len(), 1);
        let google = &coalesced["cust_9"]["google"];
        assert_eq!(google.min_timestamp, 100);
        assert_eq!(google.max_timestamp, 200);
    }

    #[test]
    fn test_group_sessions_skips_kpis_without_users() {
        let sessions = map_of("cust_1", "google", session(100, true));
        let kpis = vec![
            KpiInfo {
                kpi_id: "deal_empty".to_string(),
                user_ids: vec![],
                coal_user_ids: vec![],
                values: vec![500.0],
                timestamp: 150,
            },
            KpiInfo {
                kpi_id: "deal_1".to_string(),
                user_ids: vec!["cust_1".to_string()],
                coal_user_ids: vec!["cust_1".to_string()],
                values: vec![900.0],
                timestamp: 150,
            },
        ];

        let grouped = group_sessions_by_kpi(&kpis, &sessions).unwrap();
        assert!(grouped.contains_key("deal_1"));
        assert!(!grouped.contains_key("deal_empty"));
    }

    #[test]
    fn test_group_sessions_errors_without_any_journey() {
        let sessions = UserSessionMap::new();
        let kpis = vec![KpiInfo {
            kpi_id: "deal_1".to_string(),
            user_ids: vec!["cust_1".to_string()],
            coal_user_ids: vec![],
            values: vec![900.0],
            timestamp: 150,
        }];
        let err = group_sessions_by_kpi(&kpis, &sessions).unwrap_err();
        assert!(err.to_string().contains("no user journey found"));
    }

    #[test]
    fn test_tactic_rejected_for_page_keys() {
        let q = AttributionQuery {
            analyze_type: AnalyzeType::Users,
            attribution_key: AttributionKey::LandingPage,
            methodology: AttributionMethodology::FirstTouch,
            compare_methodology: None,
            conversion_event: QueryEventWithProperties {
                name: "sign_up".to_string(),
                properties: vec![],
            },
            compare_event: None,
            linked_events: vec![],
            query_type: AttributionQueryType::ConversionBased,
            lookback_days: 7,
            from: 1_700_000_000,
            to: 1_700_600_000,
            attribution_key_filters: vec![],
            tactic_offer_type: Some(TacticOfferType::Tactic),
        };
        assert!(q.validate().is_err());

        let mut ok = q.clone();
        ok.tactic_offer_type = Some(TacticOfferType::Offer);
        assert!(ok.validate().is_ok());
    }
}
