use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attribution::{AttributionData, AttributionKeyFilter, KeyFilterOperator};
use crate::query::LogicalOp;

/// One channel-performance report row, keyed by the same attribution id
/// the allocator produces (campaign id, adgroup id, source, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketingReportRow {
    pub attribution_id: String,
    pub key_parts: Vec<String>,
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
    pub currency: String,
    pub timestamp: i64,
}

/// Externally supplied performance data, read-only during the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketingReports {
    pub rows: Vec<MarketingReportRow>,
}

/// Join spend/impressions/clicks onto the allocated rows by attribution
/// id. Report keys that saw spend but no conversions become zero-count
/// rows so spend is never silently dropped from the result.
pub fn add_performance_data(
    data: &mut HashMap<String, AttributionData>,
    reports: &MarketingReports,
    positions: usize,
    linked_count: usize,
) {
    for row in &reports.rows {
        let entry = data.entry(row.attribution_id.clone()).or_insert_with(|| {
            AttributionData::with_positions(row.key_parts.clone(), positions, linked_count)
        });
        entry.impressions += row.impressions;
        entry.clicks += row.clicks;
        entry.spend += row.spend;
    }
}

fn filter_matches(filter: &AttributionKeyFilter, key_parts: &[String], headers: &[&str]) -> bool {
    let Some(idx) = headers.iter().position(|h| *h == filter.dimension) else {
        return false;
    };
    let part = key_parts.get(idx).map(String::as_str).unwrap_or("");
    match filter.operator {
        KeyFilterOperator::Equals => part == filter.value,
        KeyFilterOperator::NotEqual => part != filter.value,
        KeyFilterOperator::Contains => part.contains(&filter.value),
    }
}

/// Apply result-level key filters: AND filters must all hold; OR filters
/// form a union, any one of which admits the row.
pub fn apply_key_filters(
    data: &mut HashMap<String, AttributionData>,
    filters: &[AttributionKeyFilter],
    headers: &[&str],
) {
    if filters.is_empty() {
        return;
    }
    let (or_filters, and_filters): (Vec<_>, Vec<_>) = filters
        .iter()
        .partition(|f| f.logical_op == LogicalOp::Or);

    data.retain(|_, entry| {
        let and_ok = and_filters
            .iter()
            .all(|f| filter_matches(f, &entry.key_parts, headers));
        let or_ok = or_filters.is_empty()
            || or_filters
                .iter()
                .any(|f| filter_matches(f, &entry.key_parts, headers));
        and_ok && or_ok
    });
}

/// Currency of the most recent report row inside the query window.
pub fn resolve_currency(reports: &MarketingReports, from: i64, to: i64) -> Option<String> {
    reports
        .rows
        .iter()
        .filter(|r| r.timestamp >= from && r.timestamp <= to && !r.currency.is_empty())
        .max_by_key(|r| r.timestamp)
        .map(|r| r.currency.clone())
}

/// Derived spend-efficiency metrics for one attribution row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub cost_per_conversion: f64,
}

/// Division-by-zero yields 0.0 rather than NaN in the output table.
pub fn compute_additional_metrics(entry: &AttributionData) -> DerivedMetrics {
    let conversions: f64 = entry.conversion_counts.iter().sum();
    let ctr = if entry.impressions > 0 {
        entry.clicks as f64 / entry.impressions as f64 * 100.0
    } else {
        0.0
    };
    let cpc = if entry.clicks > 0 {
        entry.spend / entry.clicks as f64
    } else {
        0.0
    };
    let cpm = if entry.impressions > 0 {
        entry.spend / entry.impressions as f64 * 1000.0
    } else {
        0.0
    };
    let cost_per_conversion = if conversions > 0.0 {
        entry.spend / conversions
    } else {
        0.0
    };
    DerivedMetrics {
        ctr,
        cpc,
        cpm,
        cost_per_conversion,
    }
}
