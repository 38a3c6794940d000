use std::collections::HashMap;

use crate::attribution::{AttributionData, AttributionMethodology, KeySessionMap};
use crate::query::PROPERTY_VALUE_NONE;

const SECONDS_PER_DAY: i64 = 86_400;
/// Half-life, in days, of the time-decay weighting curve.
const TIME_DECAY_HALF_LIFE_DAYS: f64 = 7.0;

/// A single touchpoint occurrence, flattened out of the per-key journey
/// records for ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub key: String,
    pub timestamp: i64,
}

/// Flatten a user's key map into individual interactions, sorted by
/// timestamp ascending. Ties keep a stable key order so allocation is
/// deterministic across runs.
pub fn flatten_interactions(sessions: &KeySessionMap) -> Vec<Interaction> {
    let mut interactions: Vec<Interaction> = Vec::new();
    for (key, data) in sessions {
        for &ts in &data.timestamps {
            interactions.push(Interaction {
                key: key.clone(),
                timestamp: ts,
            });
        }
    }
    interactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.key.cmp(&b.key)));
    interactions
}

/// A touch counts toward a conversion when it happened at or before the
/// conversion and no more than `lookback_days` earlier.
pub fn within_lookback(conversion_ts: i64, touch_ts: i64, lookback_days: i64) -> bool {
    conversion_ts >= touch_ts && conversion_ts - touch_ts <= lookback_days * SECONDS_PER_DAY
}

/// Eligibility window for one user's allocation run.
#[derive(Debug, Clone, Copy)]
pub struct AllocationWindow {
    pub lookback_days: i64,
    pub query_from: i64,
    pub query_to: i64,
    /// Engagement-based queries additionally require the touch inside
    /// the nominal query window.
    pub engagement: bool,
}

impl AllocationWindow {
    fn eligible(&self, conversion_ts: i64, touch_ts: i64) -> bool {
        if !within_lookback(conversion_ts, touch_ts, self.lookback_days) {
            return false;
        }
        if self.engagement {
            return touch_ts >= self.query_from && touch_ts <= self.query_to;
        }
        true
    }
}

/// Allocate one unit of conversion credit across the user's eligible
/// touchpoints under the given methodology. Returns key -> credit share;
/// shares sum to 1.0 (or 1.0 per key for Influence) whenever any touch
/// is eligible, and the map is empty otherwise.
pub fn allocate_credit(
    methodology: AttributionMethodology,
    sessions: &KeySessionMap,
    conversion_ts: i64,
    window: &AllocationWindow,
) -> HashMap<String, f64> {
    let interactions: Vec<Interaction> = flatten_interactions(sessions)
        .into_iter()
        .filter(|i| window.eligible(conversion_ts, i.timestamp))
        .collect();

    let mut credit: HashMap<String, f64> = HashMap::new();
    if interactions.is_empty() {
        return credit;
    }

    match methodology {
        AttributionMethodology::FirstTouch => {
            add_credit(&mut credit, &interactions[0].key, 1.0);
        }
        AttributionMethodology::LastTouch => {
            let last = &interactions[interactions.len() - 1];
            add_credit(&mut credit, &last.key, 1.0);
        }
        AttributionMethodology::FirstTouchNonDirect => {
            match interactions.iter().find(|i| i.key != PROPERTY_VALUE_NONE) {
                Some(touch) => add_credit(&mut credit, &touch.key, 1.0),
                // Every touch was direct; credit stays with $none.
                None => add_credit(&mut credit, PROPERTY_VALUE_NONE, 1.0),
            }
        }
        AttributionMethodology::LastTouchNonDirect => {
            match interactions
                .iter()
                .rev()
                .find(|i| i.key != PROPERTY_VALUE_NONE)
            {
                Some(touch) => add_credit(&mut credit, &touch.key, 1.0),
                None => add_credit(&mut credit, PROPERTY_VALUE_NONE, 1.0),
            }
        }
        AttributionMethodology::Linear => {
            let share = 1.0 / interactions.len() as f64;
            for i in &interactions {
                add_credit(&mut credit, &i.key, share);
            }
        }
        AttributionMethodology::UShaped => {
            if interactions.len() == 1 {
                add_credit(&mut credit, &interactions[0].key, 1.0);
            } else {
                add_credit(&mut credit, &interactions[0].key, 0.5);
                add_credit(&mut credit, &interactions[interactions.len() - 1].key, 0.5);
            }
        }
        AttributionMethodology::TimeDecay => {
            let weights: Vec<f64> = interactions
                .iter()
                .map(|i| {
                    let days =
                        (conversion_ts - i.timestamp) as f64 / SECONDS_PER_DAY as f64;
                    2f64.powf(-days / TIME_DECAY_HALF_LIFE_DAYS)
                })
                .collect();
            let total: f64 = weights.iter().sum();
            for (i, w) in interactions.iter().zip(weights) {
                add_credit(&mut credit, &i.key, w / total);
            }
        }
        AttributionMethodology::Influence => {
            for i in &interactions {
                credit.entry(i.key.clone()).or_insert(1.0);
            }
        }
    }
    credit
}

fn add_credit(credit: &mut HashMap<String, f64>, key: &str, share: f64) {
    *credit.entry(key.to_string()).or_insert(0.0) += share;
}

/// Which count series an accumulation run writes into.
#[derive(Debug, Clone, Copy)]
pub enum CreditSeries {
    Conversion,
    Compare,
    LinkedEvent(usize),
}

/// Fold one user's credit map into the per-key accumulators, scaled by the
/// user's weight vector (one slot per conversion position). Keys are
/// created on first sight with their display parts taken from the journey.
pub fn accumulate_credit(
    data: &mut HashMap<String, AttributionData>,
    sessions: &KeySessionMap,
    credit: &HashMap<String, f64>,
    weights: &[f64],
    positions: usize,
    linked_count: usize,
    series: CreditSeries,
) {
    for (key, share) in credit {
        let entry = data.entry(key.clone()).or_insert_with(|| {
            let key_parts = sessions
                .get(key)
                .map(|d| d.touch.key_parts.clone())
                .unwrap_or_else(|| vec![key.clone()]);
            AttributionData::with_positions(key_parts, positions, linked_count)
        });
        match series {
            CreditSeries::Conversion => {
                for pos in 0..positions {
                    let w = weights.get(pos).copied().unwrap_or(0.0);
                    entry.conversion_counts[pos] += share * w;
                }
            }
            CreditSeries::Compare => {
                if entry.compare_counts.len() < positions {
                    entry.compare_counts.resize(positions, 0.0);
                }
                for pos in 0..positions {
                    let w = weights.get(pos).copied().unwrap_or(0.0);
                    entry.compare_counts[pos] += share * w;
                }
            }
            CreditSeries::LinkedEvent(idx) => {
                if entry.linked_event_counts.len() <= idx {
                    entry.linked_event_counts.resize(idx + 1, 0.0);
                }
                entry.linked_event_counts[idx] += share;
            }
        }
    }
}

/// Zero-fill so every key carries equally long primary and compare series,
/// even when one run attributed nothing to that key.
pub fn equalize_series(
    data: &mut HashMap<String, AttributionData>,
    positions: usize,
    compare_active: bool,
    linked_count: usize,
) {
    for entry in data.values_mut() {
        if entry.conversion_counts.len() < positions {
            entry.conversion_counts.resize(positions, 0.0);
        }
        if compare_active && entry.compare_counts.len() < positions {
            entry.compare_counts.resize(positions, 0.0);
        }
        if entry.linked_event_counts.len() < linked_count {
            entry.linked_event_counts.resize(linked_count, 0.0);
        }
    }
}
