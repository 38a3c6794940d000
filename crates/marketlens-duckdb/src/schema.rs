/// Schema init SQL. `memory_limit` is a DuckDB size string ("1GB").
/// Event `properties` and `user_properties` hold JSON text and are read
/// exclusively through `json_extract_string`/`json_type`, matching the
/// extraction contract the compiled queries assume.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"
SET memory_limit = '{memory_limit}';
SET threads = 2;

CREATE TABLE IF NOT EXISTS event_names (
    id          BIGINT NOT NULL,
    project_id  VARCHAR NOT NULL,
    name        VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id              VARCHAR NOT NULL,
    project_id      VARCHAR NOT NULL,
    user_id         VARCHAR NOT NULL,
    event_name_id   BIGINT NOT NULL,
    timestamp       BIGINT NOT NULL,
    properties      VARCHAR,
    user_properties VARCHAR
);

CREATE TABLE IF NOT EXISTS users (
    id               VARCHAR NOT NULL,
    project_id       VARCHAR NOT NULL,
    customer_user_id VARCHAR,
    join_timestamp   BIGINT
);

-- Denormalized per-event JSON projections for the optimized read path.
CREATE TABLE IF NOT EXISTS event_properties (
    event_id   VARCHAR NOT NULL,
    user_id    VARCHAR NOT NULL,
    project_id VARCHAR NOT NULL,
    properties VARCHAR
);

CREATE TABLE IF NOT EXISTS user_properties_snapshots (
    event_id   VARCHAR NOT NULL,
    properties VARCHAR
);

CREATE TABLE IF NOT EXISTS marketing_reports (
    project_id      VARCHAR NOT NULL,
    attribution_key VARCHAR NOT NULL,
    attribution_id  VARCHAR NOT NULL,
    key_parts       VARCHAR NOT NULL,
    impressions     BIGINT NOT NULL,
    clicks          BIGINT NOT NULL,
    spend           DOUBLE NOT NULL,
    currency        VARCHAR,
    timestamp       BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS project_settings (
    project_id         VARCHAR PRIMARY KEY,
    timezone           VARCHAR NOT NULL,
    ad_account_ids     VARCHAR NOT NULL,
    session_event_name VARCHAR NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_project_time ON events (project_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_event_names_project ON event_names (project_id, name);
CREATE INDEX IF NOT EXISTS idx_users_project ON users (project_id, id);
"#
    )
}
