use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use marketlens_core::collaborators::{ProjectSettings, SettingsStore};

static SETTINGS_TIMEOUT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of settings fetches that timed out since process start.
/// Timeouts degrade to defaults and must stay countable separately from
/// hard failures.
pub fn settings_timeout_count() -> u64 {
    SETTINGS_TIMEOUT_COUNT.load(Ordering::Relaxed)
}

/// Fetch project settings with a fixed-millisecond timeout. A timeout is
/// not an error: the query proceeds on the default configuration and the
/// event is counted and logged. A hard store failure still propagates.
pub async fn fetch_settings_with_timeout(
    store: &dyn SettingsStore,
    project_id: &str,
    timeout_ms: u64,
) -> Result<ProjectSettings> {
    let fetch = store.get_project_settings(project_id);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fetch).await {
        Ok(result) => result,
        Err(_) => {
            SETTINGS_TIMEOUT_COUNT.fetch_add(1, Ordering::Relaxed);
            warn!(
                project_id,
                timeout_ms, "project settings fetch timed out, using defaults"
            );
            Ok(ProjectSettings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowStore;

    #[async_trait]
    impl SettingsStore for SlowStore {
        async fn get_project_settings(&self, _project_id: &str) -> Result<ProjectSettings> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProjectSettings::default())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl SettingsStore for FailingStore {
        async fn get_project_settings(&self, _project_id: &str) -> Result<ProjectSettings> {
            Err(anyhow::anyhow!("store unavailable"))
        }
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_defaults_and_counts() {
        let before = settings_timeout_count();
        let settings = fetch_settings_with_timeout(&SlowStore, "proj_1", 10)
            .await
            .unwrap();
        assert_eq!(settings.timezone, "UTC");
        assert_eq!(settings_timeout_count(), before + 1);
    }

    #[tokio::test]
    async fn test_hard_failure_propagates() {
        let err = fetch_settings_with_timeout(&FailingStore, "proj_1", 50)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("store unavailable"));
    }
}
