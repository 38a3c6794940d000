/// Engine tuning knobs, read once at startup. Every field has a safe
/// default so the engine runs with no environment configured.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on the lookback window, days.
    pub max_lookback_days: i64,
    /// Maximum operand count per IN-clause chunk.
    pub user_batch_size: usize,
    /// Maximum concurrently executing sub-queries per batch wave.
    pub max_concurrent_queries: usize,
    /// Project-settings fetch timeout, milliseconds.
    pub settings_timeout_ms: u64,
    /// TTL for finished cached results, seconds.
    pub cache_result_ttl_secs: u64,
    /// TTL for the in-progress cache placeholder, seconds.
    pub cache_placeholder_ttl_secs: u64,
    /// Bucket count for numeric group-bys (includes the two open-ended
    /// boundary buckets).
    pub numeric_bucket_count: usize,
    pub bucket_lower_percentile: f64,
    pub bucket_upper_percentile: f64,
    /// Application identifier prefixed to every statement as a comment.
    pub app_tag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_lookback_days: 370,
            user_batch_size: 2000,
            max_concurrent_queries: 4,
            settings_timeout_ms: 300,
            cache_result_ttl_secs: 600,
            cache_placeholder_ttl_secs: 60,
            numeric_bucket_count: 10,
            bucket_lower_percentile: 0.02,
            bucket_upper_percentile: 0.98,
            app_tag: "marketlens".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_lookback_days: env_parse("MARKETLENS_MAX_LOOKBACK_DAYS", defaults.max_lookback_days),
            user_batch_size: env_parse("MARKETLENS_USER_BATCH_SIZE", defaults.user_batch_size),
            max_concurrent_queries: env_parse(
                "MARKETLENS_MAX_CONCURRENT_QUERIES",
                defaults.max_concurrent_queries,
            ),
            settings_timeout_ms: env_parse(
                "MARKETLENS_SETTINGS_TIMEOUT_MS",
                defaults.settings_timeout_ms,
            ),
            cache_result_ttl_secs: env_parse(
                "MARKETLENS_CACHE_RESULT_TTL_SECS",
                defaults.cache_result_ttl_secs,
            ),
            cache_placeholder_ttl_secs: env_parse(
                "MARKETLENS_CACHE_PLACEHOLDER_TTL_SECS",
                defaults.cache_placeholder_ttl_secs,
            ),
            numeric_bucket_count: env_parse(
                "MARKETLENS_NUMERIC_BUCKETS",
                defaults.numeric_bucket_count,
            ),
            bucket_lower_percentile: env_parse(
                "MARKETLENS_BUCKET_LOWER_PERCENTILE",
                defaults.bucket_lower_percentile,
            ),
            bucket_upper_percentile: env_parse(
                "MARKETLENS_BUCKET_UPPER_PERCENTILE",
                defaults.bucket_upper_percentile,
            ),
            app_tag: std::env::var("MARKETLENS_APP_TAG").unwrap_or(defaults.app_tag),
        }
    }

    /// Lookback clamped to the configured cap, in seconds.
    pub fn capped_lookback_secs(&self, lookback_days: i64) -> i64 {
        lookback_days.min(self.max_lookback_days) * 86_400
    }
}
