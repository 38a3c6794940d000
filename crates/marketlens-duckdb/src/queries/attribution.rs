use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::info;

use marketlens_core::attribution::{
    coalesce_session_map, group_sessions_by_kpi, AttributionData, AttributionMethodology,
    AttributionQuery, AttributionQueryType, AttributionResult, ConversionInfo, KeySessionMap,
};
use marketlens_core::cache::{self, CacheOutcome, QueryCache};
use marketlens_core::collaborators::{
    KpiExecutor, MarketingReportProvider, SettingsStore,
};
use marketlens_core::config::EngineConfig;
use marketlens_core::methods::{
    accumulate_credit, allocate_credit, equalize_series, AllocationWindow, CreditSeries,
};
use marketlens_core::reports::{
    add_performance_data, apply_key_filters, compute_additional_metrics, resolve_currency,
};

use crate::backend::DuckDbBackend;
use crate::queries::converted::{
    get_event_name_id, resolve_converted_users, ResolvedConversions,
};
use crate::queries::sessions::{default_session_processor, pull_sessions};
use crate::settings::fetch_settings_with_timeout;

/// External collaborators the pipeline reads from. All read-only.
pub struct AttributionDeps<'a> {
    pub settings: &'a dyn SettingsStore,
    pub reports: &'a dyn MarketingReportProvider,
    pub kpi: &'a dyn KpiExecutor,
}

fn allocation_window(query: &AttributionQuery, config: &EngineConfig) -> AllocationWindow {
    AllocationWindow {
        lookback_days: query.lookback_days.min(config.max_lookback_days),
        query_from: query.from,
        query_to: query.to,
        engagement: query.query_type == AttributionQueryType::EngagementBased,
    }
}

fn allocate_for_users(
    data: &mut HashMap<String, AttributionData>,
    sessions: &HashMap<String, KeySessionMap>,
    conversions: &HashMap<String, ConversionInfo>,
    methodology: AttributionMethodology,
    window: &AllocationWindow,
    positions: usize,
    linked_count: usize,
    series: CreditSeries,
) {
    for (coal_user, conversion) in conversions {
        let Some(keys) = sessions.get(coal_user) else {
            continue;
        };
        let credit = allocate_credit(methodology, keys, conversion.timestamp, window);
        accumulate_credit(
            data,
            keys,
            &credit,
            &conversion.weights,
            positions,
            linked_count,
            series,
        );
    }
}

/// Run the full attribution pipeline: resolve conversions, reconstruct
/// journeys, allocate credit, and enrich with channel performance.
pub async fn execute_attribution_query(
    db: &Arc<DuckDbBackend>,
    deps: &AttributionDeps<'_>,
    project_id: &str,
    query: &AttributionQuery,
    config: &EngineConfig,
) -> Result<AttributionResult> {
    query.validate()?;
    let request_id = uuid::Uuid::new_v4().to_string();
    info!(project_id, request_id, key = query.attribution_key.as_str(), "attribution query start");

    let settings =
        fetch_settings_with_timeout(deps.settings, project_id, config.settings_timeout_ms).await?;
    let session_event_id = get_event_name_id(
        db,
        project_id,
        &settings.session_event_name,
        config,
        &request_id,
    )
    .await?
    .ok_or_else(|| anyhow!("session event {} not found", settings.session_event_name))?;

    let resolved =
        resolve_converted_users(db, deps.kpi, project_id, query, config, &request_id).await?;
    let raw_users: &[String] = match &resolved {
        ResolvedConversions::Users { raw_users, .. } => raw_users,
        ResolvedConversions::Kpi { raw_users, .. } => raw_users,
    };

    let processor = default_session_processor(query.attribution_key, query.from, query.to);
    let (sessions, _users_with_sessions) = pull_sessions(
        db,
        project_id,
        raw_users,
        session_event_id,
        query,
        config,
        &request_id,
        &processor,
    )
    .await?;

    let window = allocation_window(query, config);
    let linked_names: Vec<String> = query
        .linked_events
        .iter()
        .map(|e| e.name.clone())
        .collect();
    let compare_active = query.compare_methodology.is_some() || query.compare_event.is_some();

    let mut data: HashMap<String, AttributionData> = HashMap::new();
    let positions = match &resolved {
        ResolvedConversions::Users {
            conversions,
            compare_conversions,
            user_to_coal,
            linked,
            ..
        } => {
            let coalesced = coalesce_session_map(sessions, user_to_coal);
            let positions = 1usize;

            allocate_for_users(
                &mut data,
                &coalesced,
                conversions,
                query.methodology,
                &window,
                positions,
                linked_names.len(),
                CreditSeries::Conversion,
            );

            if let Some(compare_methodology) = query.compare_methodology {
                allocate_for_users(
                    &mut data,
                    &coalesced,
                    conversions,
                    compare_methodology,
                    &window,
                    positions,
                    linked_names.len(),
                    CreditSeries::Compare,
                );
            }
            if let Some(compare_conversions) = compare_conversions {
                allocate_for_users(
                    &mut data,
                    &coalesced,
                    compare_conversions,
                    query.methodology,
                    &window,
                    positions,
                    linked_names.len(),
                    CreditSeries::Compare,
                );
            }

            for (idx, linked_event) in linked.iter().enumerate() {
                let linked_conversions: HashMap<String, ConversionInfo> = linked_event
                    .conversions
                    .iter()
                    .map(|(coal, &ts)| (coal.clone(), ConversionInfo::at(ts)))
                    .collect();
                allocate_for_users(
                    &mut data,
                    &coalesced,
                    &linked_conversions,
                    query.methodology,
                    &window,
                    positions,
                    linked_names.len(),
                    CreditSeries::LinkedEvent(idx),
                );
            }
            positions
        }
        ResolvedConversions::Kpi {
            kpis, user_to_coal, ..
        } => {
            let coalesced = coalesce_session_map(sessions, user_to_coal);
            let grouped = group_sessions_by_kpi(kpis, &coalesced)?;
            // One count position per KPI value slot, at least one.
            let positions = kpis.iter().map(|k| k.values.len()).max().unwrap_or(1).max(1);

            for kpi in kpis {
                let Some(keys) = grouped.get(&kpi.kpi_id) else {
                    continue;
                };
                let credit = allocate_credit(query.methodology, keys, kpi.timestamp, &window);
                accumulate_credit(
                    &mut data,
                    keys,
                    &credit,
                    &kpi.values,
                    positions,
                    linked_names.len(),
                    CreditSeries::Conversion,
                );
                if let Some(compare_methodology) = query.compare_methodology {
                    let credit =
                        allocate_credit(compare_methodology, keys, kpi.timestamp, &window);
                    accumulate_credit(
                        &mut data,
                        keys,
                        &credit,
                        &kpi.values,
                        positions,
                        linked_names.len(),
                        CreditSeries::Compare,
                    );
                }
            }
            positions
        }
    };

    equalize_series(&mut data, positions, compare_active, linked_names.len());

    // Channel performance joins by paid-marketing identity, which
    // page-based keys do not carry.
    let mut currency = None;
    if !query.attribution_key.is_page_based() {
        let reports = deps
            .reports
            .fetch_reports(project_id, query.attribution_key, query.from, query.to)
            .await?;
        add_performance_data(&mut data, &reports, positions, linked_names.len());
        if !settings.ad_account_ids.is_empty() {
            currency = resolve_currency(&reports, query.from, query.to);
        }
    }

    let headers = query.attribution_key.dimension_headers();
    apply_key_filters(&mut data, &query.attribution_key_filters, &headers);

    let result = build_result(data, &headers, positions, compare_active, &linked_names, currency);
    info!(project_id, request_id, rows = result.rows.len(), "attribution query done");
    Ok(result)
}

/// Render the accumulated per-key data as a sorted table with a grand
/// total row appended.
fn build_result(
    data: HashMap<String, AttributionData>,
    dimension_headers: &[&str],
    positions: usize,
    compare_active: bool,
    linked_names: &[String],
    currency: Option<String>,
) -> AttributionResult {
    let mut headers: Vec<String> =
        dimension_headers.iter().map(|h| h.to_string()).collect();
    for pos in 0..positions {
        if positions == 1 {
            headers.push("conversion_count".to_string());
        } else {
            headers.push(format!("conversion_count_{pos}"));
        }
    }
    if compare_active {
        for pos in 0..positions {
            if positions == 1 {
                headers.push("compare_count".to_string());
            } else {
                headers.push(format!("compare_count_{pos}"));
            }
        }
    }
    for name in linked_names {
        headers.push(format!("linked_{name}_count"));
    }
    headers.extend(
        ["impressions", "clicks", "spend", "ctr", "cpc", "cpm", "cost_per_conversion"]
            .iter()
            .map(|h| h.to_string()),
    );

    let mut entries: Vec<(String, AttributionData)> = data.into_iter().collect();
    entries.sort_by(|(ka, a), (kb, b)| {
        let ca = a.conversion_counts.first().copied().unwrap_or(0.0);
        let cb = b.conversion_counts.first().copied().unwrap_or(0.0);
        cb.partial_cmp(&ca)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ka.cmp(kb))
    });

    let mut total = AttributionData::with_positions(
        vec!["Grand Total".to_string()],
        positions,
        linked_names.len(),
    );
    if compare_active {
        total.compare_counts = vec![0.0; positions];
    }

    let mut rows: Vec<Vec<serde_json::Value>> = Vec::with_capacity(entries.len() + 1);
    for (_, entry) in &entries {
        for (i, count) in entry.conversion_counts.iter().enumerate() {
            total.conversion_counts[i] += count;
        }
        for (i, count) in entry.compare_counts.iter().enumerate() {
            total.compare_counts[i] += count;
        }
        for (i, count) in entry.linked_event_counts.iter().enumerate() {
            total.linked_event_counts[i] += count;
        }
        total.impressions += entry.impressions;
        total.clicks += entry.clicks;
        total.spend += entry.spend;
        rows.push(entry_row(
            entry,
            dimension_headers.len(),
            positions,
            compare_active,
            linked_names.len(),
        ));
    }
    rows.push(entry_row(
        &total,
        dimension_headers.len(),
        positions,
        compare_active,
        linked_names.len(),
    ));

    AttributionResult {
        headers,
        rows,
        currency,
    }
}

// Row width is driven by the header layout, not by whatever series
// lengths the entry happens to carry.
fn entry_row(
    entry: &AttributionData,
    dimension_count: usize,
    positions: usize,
    compare_active: bool,
    linked_count: usize,
) -> Vec<serde_json::Value> {
    let mut row: Vec<serde_json::Value> = Vec::new();
    for i in 0..dimension_count {
        let part = entry.key_parts.get(i).cloned().unwrap_or_default();
        row.push(serde_json::Value::String(part));
    }
    for pos in 0..positions {
        let count = entry.conversion_counts.get(pos).copied().unwrap_or(0.0);
        row.push(serde_json::json!(count));
    }
    if compare_active {
        for pos in 0..positions {
            let count = entry.compare_counts.get(pos).copied().unwrap_or(0.0);
            row.push(serde_json::json!(count));
        }
    }
    for idx in 0..linked_count {
        let count = entry.linked_event_counts.get(idx).copied().unwrap_or(0.0);
        row.push(serde_json::json!(count));
    }
    let metrics = compute_additional_metrics(entry);
    row.push(serde_json::json!(entry.impressions));
    row.push(serde_json::json!(entry.clicks));
    row.push(serde_json::json!(entry.spend));
    row.push(serde_json::json!(metrics.ctr));
    row.push(serde_json::json!(metrics.cpc));
    row.push(serde_json::json!(metrics.cpm));
    row.push(serde_json::json!(metrics.cost_per_conversion));
    row
}

/// Outcome of a cache-gated execution.
#[derive(Debug)]
pub enum CachedAttributionOutcome {
    Ready(AttributionResult),
    /// Another request is computing the same fingerprint.
    InProgress,
}

/// Cache-gated pipeline entry: at most one concurrent computation per
/// `(fingerprint, window label)`; other callers observe the in-progress
/// placeholder and back off.
pub async fn execute_attribution_query_cached(
    db: &Arc<DuckDbBackend>,
    deps: &AttributionDeps<'_>,
    query_cache: &dyn QueryCache,
    project_id: &str,
    query: &AttributionQuery,
    config: &EngineConfig,
) -> Result<CachedAttributionOutcome> {
    let fingerprint = cache::query_fingerprint(project_id, query)?;
    let label = cache::window_label(query.from, query.to, chrono::Utc::now().timestamp());
    let key = cache::cache_key(&fingerprint, &label);

    match cache::begin(
        query_cache,
        &key,
        Duration::from_secs(config.cache_placeholder_ttl_secs),
    ) {
        CacheOutcome::Hit(payload) => {
            let result: AttributionResult = serde_json::from_str(&payload)?;
            Ok(CachedAttributionOutcome::Ready(result))
        }
        CacheOutcome::InProgress => Ok(CachedAttributionOutcome::InProgress),
        CacheOutcome::Miss => {
            match execute_attribution_query(db, deps, project_id, query, config).await {
                Ok(result) => {
                    cache::finish(
                        query_cache,
                        &key,
                        &serde_json::to_string(&result)?,
                        Duration::from_secs(config.cache_result_ttl_secs),
                    );
                    Ok(CachedAttributionOutcome::Ready(result))
                }
                Err(e) => {
                    cache::abort(query_cache, &key);
                    Err(e)
                }
            }
        }
    }
}
