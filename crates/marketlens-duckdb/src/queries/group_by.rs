use anyhow::Result;

use marketlens_core::config::EngineConfig;
use marketlens_core::query::{
    DateTimeGranularity, GroupByType, PropertyDataType, PropertyEntity, QueryGroupByProperty,
    BUCKET_RANGE_SEPARATOR, PROPERTY_VALUE_NONE,
};

use crate::fragment::SqlFragment;
use crate::queries::assembler::StepBuilder;
use crate::queries::filters::PropertySource;

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Values that look numeric; everything else is excluded from percentile
/// bounds computation and from the bucketed rows.
pub const NUMERIC_VALUE_REGEX: &str = r"^[-+]?[0-9]*\.?[0-9]+$";

// Class marker for rows between the percentile bounds, replaced by a
// tile number in the bucket step. Out of band of every bucket number.
const INTERIOR_BUCKET_CLASS: i64 = -2;

/// Compiled group-by select list plus the comma-joined alias list for
/// GROUP BY / ORDER BY reuse. Alias order is input order; alias names use
/// each property's assigned index.
#[derive(Debug, Clone)]
pub struct GroupBySelect {
    pub fragment: SqlFragment,
    pub aliases: String,
}

fn resolved_timezone(timezone: &str) -> String {
    if timezone.parse::<chrono_tz::Tz>().is_ok() {
        timezone.to_string()
    } else {
        DEFAULT_TIMEZONE.to_string()
    }
}

fn source_column(source: &PropertySource, entity: PropertyEntity) -> &'static str {
    match entity {
        PropertyEntity::Event => source.event_properties,
        PropertyEntity::User | PropertyEntity::UserGlobal => source.user_properties,
    }
}

fn push_extract(frag: &mut SqlFragment, column: &str, property: &str) {
    frag.push("json_extract_string(");
    frag.push(column);
    frag.push(", ");
    frag.push_bind(format!("$.{property}"));
    frag.push(")");
}

/// Step-qualified alias for funnel queries where the group-by belongs to
/// one event step of a sequence.
pub fn step_qualified_alias(group_by: &QueryGroupByProperty) -> String {
    if group_by.is_event_scoped() {
        format!("step_{}.{}", group_by.event_name_index, group_by.alias())
    } else {
        group_by.alias()
    }
}

/// Compile ordered group-bys into aliased select expressions.
///
/// Categorical values go through the None-substitution CASE; datetime
/// values are truncated at the requested granularity in the requested
/// timezone (default timezone, day granularity); numeric values pass
/// through the None CASE here and are bucketed in separate steps.
pub fn compile_group_by_select(
    group_bys: &[QueryGroupByProperty],
    timezone: &str,
    source: &PropertySource,
) -> Result<GroupBySelect> {
    let tz = resolved_timezone(timezone);
    let mut fragment = SqlFragment::new();
    let mut aliases: Vec<String> = Vec::new();

    for (i, gb) in group_bys.iter().enumerate() {
        if i > 0 {
            fragment.push(", ");
        }
        let column = source_column(source, gb.entity);
        match gb.data_type {
            PropertyDataType::Datetime => {
                push_datetime_case(&mut fragment, column, gb, &tz);
            }
            _ => push_categorical_case(&mut fragment, column, &gb.property),
        }
        fragment.push(" AS ");
        fragment.push(&gb.alias());
        aliases.push(gb.alias());
    }

    Ok(GroupBySelect {
        fragment,
        aliases: aliases.join(", "),
    })
}

fn push_categorical_case(frag: &mut SqlFragment, column: &str, property: &str) {
    frag.push("CASE WHEN ");
    push_extract(frag, column, property);
    frag.push(&format!(" IS NULL THEN '{PROPERTY_VALUE_NONE}' WHEN "));
    push_extract(frag, column, property);
    frag.push(&format!(" = '' THEN '{PROPERTY_VALUE_NONE}' ELSE "));
    push_extract(frag, column, property);
    frag.push(" END");
}

fn push_datetime_case(
    frag: &mut SqlFragment,
    column: &str,
    gb: &QueryGroupByProperty,
    timezone: &str,
) {
    frag.push("CASE WHEN ");
    push_extract(frag, column, &gb.property);
    frag.push(&format!(" IS NULL THEN '{PROPERTY_VALUE_NONE}' WHEN "));
    push_extract(frag, column, &gb.property);
    frag.push(&format!(" = '' THEN '{PROPERTY_VALUE_NONE}' WHEN "));
    push_extract(frag, column, &gb.property);
    // Stored zero timestamps are placeholders, not epoch 1970.
    frag.push(&format!(" = '0' THEN '{PROPERTY_VALUE_NONE}' ELSE CAST("));
    push_truncation(frag, column, gb, timezone);
    frag.push(" AS VARCHAR) END");
}

fn push_truncation(
    frag: &mut SqlFragment,
    column: &str,
    gb: &QueryGroupByProperty,
    timezone: &str,
) {
    match gb.granularity {
        // The store truncates weeks to Monday; product weeks start on
        // Sunday, so shift forward a day, truncate, shift back.
        DateTimeGranularity::Week => {
            frag.push("date_trunc('week', timezone(");
            frag.push_bind(timezone);
            frag.push(", to_timestamp(CAST(");
            push_extract(frag, column, &gb.property);
            frag.push(" AS BIGINT) + 86400))) - INTERVAL 1 DAY");
        }
        granularity => {
            frag.push(&format!("date_trunc('{}', timezone(", granularity.date_part()));
            frag.push_bind(timezone);
            frag.push(", to_timestamp(CAST(");
            push_extract(frag, column, &gb.property);
            frag.push(" AS BIGINT)))");
        }
    }
}

/// Whether this group-by needs the bucketing steps appended.
pub fn needs_bucketing(gb: &QueryGroupByProperty) -> bool {
    gb.data_type == PropertyDataType::Numerical && gb.group_by_type == GroupByType::WithBuckets
}

/// Append the bucketing steps for one numeric group-by over a prior
/// step's output and return the name of the bucketed step.
///
/// The bounds step computes the configured lower/upper percentiles over
/// non-none, numeric-looking values, nudging the lower bound up by a
/// negligible epsilon so values exactly at the percentile land in bucket
/// 0 instead of below it. The classing step drops values that are
/// neither the none sentinel nor numeric-looking and assigns -1 to
/// none/empty, 0 below the lower bound, N-1 at/above the upper bound,
/// and an interior marker to the rest. The bucket step tiles the
/// interior rows into N-2 equal-frequency buckets; the NTILE window is
/// partitioned by class so the excluded rows never consume a tile.
pub fn append_numeric_bucketing_steps(
    builder: &mut StepBuilder,
    prior_step: &str,
    group_by: &QueryGroupByProperty,
    carried_columns: &[String],
    config: &EngineConfig,
) -> Result<String> {
    let alias = group_by.alias();
    let bucket_count = config.numeric_bucket_count.max(3);
    let bounds_step = format!("{prior_step}_bounds_{}", group_by.index);
    let classed_step = format!("{prior_step}_classed_{}", group_by.index);
    let bucket_step = format!("{prior_step}_bucketed_{}", group_by.index);

    // Quantile fractions must be constants, so they are formatted in
    // rather than bound. They come from config, never from user input.
    let mut bounds = SqlFragment::new();
    bounds.push(&format!(
        "SELECT quantile_disc(CAST({alias} AS DOUBLE), {lower}) + 0.00001 AS lbound, \
         quantile_disc(CAST({alias} AS DOUBLE), {upper}) AS ubound \
         FROM {prior_step} WHERE {alias} != '{PROPERTY_VALUE_NONE}' \
         AND {alias} != '' AND regexp_matches({alias}, ",
        lower = config.bucket_lower_percentile,
        upper = config.bucket_upper_percentile,
    ));
    bounds.push_bind(NUMERIC_VALUE_REGEX);
    bounds.push(")");
    builder.add_step(&bounds_step, bounds);

    let carried = carried_columns
        .iter()
        .map(|c| format!("{c}, "))
        .collect::<String>();

    // TRY_CAST: CASE arms over the none-sentinel rows must not abort
    // the scan.
    let mut classed = SqlFragment::new();
    classed.push(&format!(
        "SELECT {carried}{alias}, \
         CASE WHEN {alias} = '{PROPERTY_VALUE_NONE}' OR {alias} = '' THEN -1 \
         WHEN TRY_CAST({alias} AS DOUBLE) < b.lbound THEN 0 \
         WHEN TRY_CAST({alias} AS DOUBLE) >= b.ubound THEN {upper} \
         ELSE {INTERIOR_BUCKET_CLASS} END AS {alias}_class \
         FROM {prior_step}, {bounds_step} b \
         WHERE {alias} = '{PROPERTY_VALUE_NONE}' OR regexp_matches({alias}, ",
        upper = bucket_count - 1,
    ));
    classed.push_bind(NUMERIC_VALUE_REGEX);
    classed.push(")");
    builder.add_step(&classed_step, classed);

    let mut bucket = SqlFragment::new();
    bucket.push(&format!(
        "SELECT {carried}{alias}, \
         CASE WHEN {alias}_class = {INTERIOR_BUCKET_CLASS} \
         THEN NTILE({tiles}) OVER (PARTITION BY {alias}_class \
         ORDER BY TRY_CAST({alias} AS DOUBLE)) \
         ELSE {alias}_class END AS {alias}_bucket \
         FROM {classed_step}",
        tiles = bucket_count - 2,
    ));
    builder.add_step(&bucket_step, bucket);

    Ok(bucket_step)
}

/// Range-label expression for the final aggregate over a bucketed step,
/// grouped by `<alias>_bucket`. NaN-producing empty buckets collapse to
/// the none label.
pub fn bucket_label_expr(alias: &str) -> String {
    format!(
        "CASE WHEN {alias}_bucket = -1 THEN '{PROPERTY_VALUE_NONE}' \
         ELSE COALESCE(NULLIF(CONCAT(CAST(round(MIN(TRY_CAST({alias} AS DOUBLE)), 1) AS VARCHAR), \
         '{BUCKET_RANGE_SEPARATOR}', CAST(round(MAX(TRY_CAST({alias} AS DOUBLE)), 1) AS VARCHAR)), \
         'NaN{BUCKET_RANGE_SEPARATOR}NaN'), '{PROPERTY_VALUE_NONE}') END AS {alias}"
    )
}

fn strip_point_zero(endpoint: &str) -> &str {
    endpoint.strip_suffix(".0").unwrap_or(endpoint)
}

/// Sanitize one bucket range label: drop trailing ".0" from each
/// endpoint and collapse degenerate "X - X" ranges to "X". Idempotent.
pub fn sanitize_bucket_label(label: &str) -> String {
    match label.split_once(BUCKET_RANGE_SEPARATOR) {
        None => strip_point_zero(label).to_string(),
        Some((lo, hi)) => {
            let lo = strip_point_zero(lo);
            let hi = strip_point_zero(hi);
            if lo == hi {
                lo.to_string()
            } else {
                format!("{lo}{BUCKET_RANGE_SEPARATOR}{hi}")
            }
        }
    }
}

/// Sanitize the labels of the given group columns across result rows.
/// The first row of a funnel result is the no-group aggregate row and is
/// skipped.
pub fn sanitize_bucket_labels(
    rows: &mut [Vec<serde_json::Value>],
    group_columns: &[usize],
    is_funnel: bool,
) {
    for (row_idx, row) in rows.iter_mut().enumerate() {
        if is_funnel && row_idx == 0 {
            continue;
        }
        for &col in group_columns {
            if let Some(serde_json::Value::String(label)) = row.get_mut(col) {
                *label = sanitize_bucket_label(label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketlens_core::query::PropertyDataType;

    fn group_by(
        property: &str,
        data_type: PropertyDataType,
        index: usize,
    ) -> QueryGroupByProperty {
        QueryGroupByProperty {
            entity: PropertyEntity::Event,
            property: property.to_string(),
            data_type,
            index,
            granularity: DateTimeGranularity::default(),
            group_by_type: GroupByType::default(),
            event_name: String::new(),
            event_name_index: 0,
        }
    }

    #[test]
    fn test_categorical_none_substitution() {
        let gbs = vec![group_by("campaign", PropertyDataType::Categorical, 0)];
        let select =
            compile_group_by_select(&gbs, DEFAULT_TIMEZONE, &PropertySource::default()).unwrap();
        assert!(select.fragment.sql.contains("IS NULL THEN '$none'"));
        assert!(select.fragment.sql.contains("= '' THEN '$none'"));
        assert!(select.fragment.sql.ends_with("AS _group_key_0"));
        assert_eq!(select.aliases, "_group_key_0");
    }

    #[test]
    fn test_alias_order_is_input_order_with_assigned_indexes() {
        let gbs = vec![
            group_by("b", PropertyDataType::Categorical, 3),
            group_by("a", PropertyDataType::Categorical, 1),
        ];
        let select =
            compile_group_by_select(&gbs, DEFAULT_TIMEZONE, &PropertySource::default()).unwrap();
        assert_eq!(select.aliases, "_group_key_3, _group_key_1");
    }

    #[test]
    fn test_datetime_treats_zero_as_none() {
        let mut gb = group_by("signed_up_at", PropertyDataType::Datetime, 0);
        gb.granularity = DateTimeGranularity::Hour;
        let select = compile_group_by_select(
            &[gb],
            "America/New_York",
            &PropertySource::default(),
        )
        .unwrap();
        assert!(select.fragment.sql.contains("= '0' THEN '$none'"));
        assert!(select.fragment.sql.contains("date_trunc('hour'"));
        assert!(select
            .fragment
            .params
            .contains(&crate::fragment::SqlValue::Text(
                "America/New_York".to_string()
            )));
    }

    #[test]
    fn test_invalid_timezone_falls_back_to_default() {
        let gb = group_by("signed_up_at", PropertyDataType::Datetime, 0);
        let select =
            compile_group_by_select(&[gb], "Mars/Olympus", &PropertySource::default()).unwrap();
        assert!(select
            .fragment
            .params
            .contains(&crate::fragment::SqlValue::Text("UTC".to_string())));
    }

    #[test]
    fn test_week_is_sunday_start() {
        let mut gb = group_by("signed_up_at", PropertyDataType::Datetime, 0);
        gb.granularity = DateTimeGranularity::Week;
        let select =
            compile_group_by_select(&[gb], DEFAULT_TIMEZONE, &PropertySource::default()).unwrap();
        assert!(select.fragment.sql.contains("+ 86400"));
        assert!(select.fragment.sql.contains("- INTERVAL 1 DAY"));
    }

    #[test]
    fn test_step_qualified_alias() {
        let mut gb = group_by("revenue", PropertyDataType::Numerical, 2);
        gb.event_name_index = 3;
        assert_eq!(step_qualified_alias(&gb), "step_3._group_key_2");
        gb.event_name_index = 0;
        assert_eq!(step_qualified_alias(&gb), "_group_key_2");
    }

    #[test]
    fn test_bucketing_steps_shape() {
        let gb = group_by("revenue", PropertyDataType::Numerical, 0);
        assert!(needs_bucketing(&gb));
        let mut builder = StepBuilder::new();
        let config = EngineConfig::default();
        let bucketed = append_numeric_bucketing_steps(
            &mut builder,
            "step_0",
            &gb,
            &["user_id".to_string()],
            &config,
        )
        .unwrap();
        assert_eq!(bucketed, "step_0_bucketed_0");

        let sql = builder.build(SqlFragment::from_sql("SELECT 1")).sql;
        // Bounds: percentiles over non-none numeric-looking values, lower
        // bound nudged by epsilon.
        assert!(sql.contains("quantile_disc"));
        assert!(sql.contains("+ 0.00001 AS lbound"));
        assert!(sql.contains("regexp_matches(_group_key_0"));
        // Classes: rows restricted to none-or-numeric, -1 for none, 0
        // below, 9 at/above, with the default 10-bucket config.
        assert!(sql.contains("step_0_classed_0"));
        assert!(sql.contains("THEN -1"));
        assert!(sql.contains("< b.lbound THEN 0"));
        assert!(sql.contains(">= b.ubound THEN 9"));
        assert!(sql.contains("WHERE _group_key_0 = '$none' OR regexp_matches(_group_key_0"));
        // Tiles: NTILE(8) over the interior class only.
        assert!(sql.contains("NTILE(8) OVER (PARTITION BY _group_key_0_class"));
        assert!(sql.contains("user_id, _group_key_0"));
    }

    #[test]
    fn test_raw_values_numeric_skips_bucketing() {
        let mut gb = group_by("revenue", PropertyDataType::Numerical, 0);
        gb.group_by_type = GroupByType::RawValues;
        assert!(!needs_bucketing(&gb));
    }

    #[test]
    fn test_sanitize_label_cases() {
        assert_eq!(sanitize_bucket_label("4.0 - 4.0"), "4");
        assert_eq!(sanitize_bucket_label("2.0 - 6.0"), "2 - 6");
        assert_eq!(sanitize_bucket_label("$none"), "$none");
        assert_eq!(sanitize_bucket_label("4.05 - 4.5"), "4.05 - 4.5");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in ["4.0 - 4.0", "2.0 - 6.0", "7", "$none", "1.5 - 2.5"] {
            let once = sanitize_bucket_label(raw);
            let twice = sanitize_bucket_label(&once);
            assert_eq!(once, twice, "{raw}");
        }
    }

    #[test]
    fn test_sanitize_rows_skips_funnel_first_row() {
        let mut rows = vec![
            vec![serde_json::json!("4.0 - 4.0"), serde_json::json!(10)],
            vec![serde_json::json!("4.0 - 4.0"), serde_json::json!(5)],
        ];
        sanitize_bucket_labels(&mut rows, &[0], true);
        assert_eq!(rows[0][0], serde_json::json!("4.0 - 4.0"));
        assert_eq!(rows[1][0], serde_json::json!("4"));
    }
}
