use marketlens_core::config::EngineConfig;
use marketlens_core::query::{
    DateTimeGranularity, GroupByType, PropertyDataType, PropertyEntity, QueryGroupByProperty,
};
use marketlens_duckdb::fragment::SqlFragment;
use marketlens_duckdb::queries::assembler::StepBuilder;
use marketlens_duckdb::queries::group_by::{
    append_numeric_bucketing_steps, bucket_label_expr, compile_group_by_select,
    sanitize_bucket_labels, DEFAULT_TIMEZONE,
};
use marketlens_duckdb::queries::filters::PropertySource;
use marketlens_duckdb::DuckDbBackend;

const PAGE_VIEW_EVENT_ID: i64 = 3;

fn group_by(property: &str, data_type: PropertyDataType) -> QueryGroupByProperty {
    QueryGroupByProperty {
        entity: PropertyEntity::Event,
        property: property.to_string(),
        data_type,
        index: 0,
        granularity: DateTimeGranularity::default(),
        group_by_type: GroupByType::default(),
        event_name: String::new(),
        event_name_index: 0,
    }
}

async fn seed_page_view(db: &DuckDbBackend, id: &str, properties: &str) {
    db.seed_event(id, "proj_1", "u1", PAGE_VIEW_EVENT_ID, 1_000, properties, "{}")
        .await
        .expect("seed event");
}

#[tokio::test]
async fn categorical_group_by_substitutes_none_for_missing_and_empty() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    db.seed_event_name(PAGE_VIEW_EVENT_ID, "proj_1", "page_view")
        .await
        .expect("seed name");
    seed_page_view(&db, "e1", r#"{"source":"google"}"#).await;
    seed_page_view(&db, "e2", r#"{"source":"google"}"#).await;
    seed_page_view(&db, "e3", r#"{"source":""}"#).await;
    seed_page_view(&db, "e4", "{}").await;

    let select = compile_group_by_select(
        &[group_by("source", PropertyDataType::Categorical)],
        DEFAULT_TIMEZONE,
        &PropertySource::default(),
    )
    .expect("compile");

    let mut frag = SqlFragment::new();
    frag.push("SELECT ");
    frag.append(select.fragment);
    frag.push(", COUNT(*) FROM events WHERE events.project_id = ");
    frag.push_bind("proj_1");
    frag.push(" AND events.event_name_id = ");
    frag.push_bind(PAGE_VIEW_EVENT_ID);
    frag.push(&format!(
        " GROUP BY {aliases} ORDER BY {aliases}",
        aliases = select.aliases
    ));

    let rows = db
        .run_select(&frag, "marketlens", "test", |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .await
        .expect("run");

    assert_eq!(
        rows,
        vec![
            ("$none".to_string(), 2),
            ("google".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn numeric_bucketing_tiles_values_and_labels_ranges() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    db.seed_event_name(PAGE_VIEW_EVENT_ID, "proj_1", "page_view")
        .await
        .expect("seed name");
    for value in 1..=20 {
        seed_page_view(
            &db,
            &format!("e{value}"),
            &format!(r#"{{"revenue":"{value}"}}"#),
        )
        .await;
    }
    // One event without the property lands in the none bucket.
    seed_page_view(&db, "e_none", "{}").await;

    let gb = group_by("revenue", PropertyDataType::Numerical);
    let select = compile_group_by_select(
        std::slice::from_ref(&gb),
        DEFAULT_TIMEZONE,
        &PropertySource::default(),
    )
    .expect("compile");

    let mut builder = StepBuilder::new();
    let mut base = SqlFragment::new();
    base.push("SELECT ");
    base.append(select.fragment);
    base.push(" FROM events WHERE events.project_id = ");
    base.push_bind("proj_1");
    base.push(" AND events.event_name_id = ");
    base.push_bind(PAGE_VIEW_EVENT_ID);
    builder.add_step("step_0", base);

    let config = EngineConfig::default();
    let bucket_step =
        append_numeric_bucketing_steps(&mut builder, "step_0", &gb, &[], &config)
            .expect("bucketing");

    let alias = gb.alias();
    let mut final_select = SqlFragment::new();
    final_select.push(&format!(
        "SELECT {label}, COUNT(*) FROM {bucket_step} \
         GROUP BY {alias}_bucket ORDER BY {alias}_bucket",
        label = bucket_label_expr(&alias),
    ));
    let frag = builder.build(final_select);

    let mut rows: Vec<Vec<serde_json::Value>> = db
        .run_select(&frag, "marketlens", "test", |row| {
            Ok(vec![
                serde_json::json!(row.get::<_, String>(0)?),
                serde_json::json!(row.get::<_, i64>(1)?),
            ])
        })
        .await
        .expect("run");
    sanitize_bucket_labels(&mut rows, &[0], false);

    // Buckets: none, below-lower, 8 tiles, at-or-above-upper. Every
    // bucket holds at least one row; the excluded none and boundary
    // rows must not consume interior tiles.
    assert_eq!(rows.len(), 11);
    for row in &rows {
        assert!(row[1].as_i64().expect("count") >= 1, "empty bucket in {rows:?}");
    }
    assert_eq!(rows[0][0], serde_json::json!("$none"));
    assert_eq!(rows[0][1], serde_json::json!(1));
    // Value 1 sits below the nudged 2nd-percentile bound.
    assert_eq!(rows[1][0], serde_json::json!("1"));
    assert_eq!(rows[1][1], serde_json::json!(1));
    // The top bucket holds the values at or above the 98th percentile.
    let top = rows[10][0].as_str().expect("label");
    assert!(top.ends_with("20"), "top bucket label was {top}");

    let total: i64 = rows
        .iter()
        .map(|r| r[1].as_i64().expect("count"))
        .sum();
    assert_eq!(total, 21);

    // Interior labels are sanitized ranges, not raw "X.0 - Y.0" text.
    let first_tile = rows[2][0].as_str().expect("label");
    assert!(!first_tile.contains(".0"));
    assert!(first_tile.contains(" - "));
}

#[tokio::test]
async fn non_numeric_values_are_dropped_before_bucketing() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    db.seed_event_name(PAGE_VIEW_EVENT_ID, "proj_1", "page_view")
        .await
        .expect("seed name");
    for value in 1..=20 {
        seed_page_view(
            &db,
            &format!("e{value}"),
            &format!(r#"{{"revenue":"{value}"}}"#),
        )
        .await;
    }
    seed_page_view(&db, "e_none", "{}").await;
    seed_page_view(&db, "e_junk", r#"{"revenue":"abc"}"#).await;

    let gb = group_by("revenue", PropertyDataType::Numerical);
    let select = compile_group_by_select(
        std::slice::from_ref(&gb),
        DEFAULT_TIMEZONE,
        &PropertySource::default(),
    )
    .expect("compile");

    let mut builder = StepBuilder::new();
    let mut base = SqlFragment::new();
    base.push("SELECT ");
    base.append(select.fragment);
    base.push(" FROM events WHERE events.project_id = ");
    base.push_bind("proj_1");
    base.push(" AND events.event_name_id = ");
    base.push_bind(PAGE_VIEW_EVENT_ID);
    builder.add_step("step_0", base);

    let config = EngineConfig::default();
    let bucket_step =
        append_numeric_bucketing_steps(&mut builder, "step_0", &gb, &[], &config)
            .expect("bucketing");

    let alias = gb.alias();
    let mut final_select = SqlFragment::new();
    final_select.push(&format!(
        "SELECT {label}, COUNT(*) FROM {bucket_step} \
         GROUP BY {alias}_bucket ORDER BY {alias}_bucket",
        label = bucket_label_expr(&alias),
    ));
    let frag = builder.build(final_select);

    let mut rows: Vec<Vec<serde_json::Value>> = db
        .run_select(&frag, "marketlens", "test", |row| {
            Ok(vec![
                serde_json::json!(row.get::<_, String>(0)?),
                serde_json::json!(row.get::<_, i64>(1)?),
            ])
        })
        .await
        .expect("run");
    sanitize_bucket_labels(&mut rows, &[0], false);

    // The garbage value is dropped outright, not surfaced as a spurious
    // none-labelled interior bucket.
    assert_eq!(rows.len(), 11);
    let total: i64 = rows.iter().map(|r| r[1].as_i64().expect("count")).sum();
    assert_eq!(total, 21);
    let none_rows = rows
        .iter()
        .filter(|r| r[0] == serde_json::json!("$none"))
        .count();
    assert_eq!(none_rows, 1);
}
