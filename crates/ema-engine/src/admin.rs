//! Maintenance operations outside the scan's normal lifecycle.

use ema_core::error::Result;
use ema_core::instance::PromptInstance;
use ema_core::traits::FormRepository;

/// Per-window instance counts for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSummary {
    pub window_name: String,
    pub total: usize,
    pub incomplete: usize,
}

/// Enumerate a record's windows with their active-instance counts.
pub async fn window_summary(repo: &dyn FormRepository, record: &str) -> Result<Vec<WindowSummary>> {
    let mut summaries: Vec<WindowSummary> = Vec::new();
    for fields in repo.all_instances(record).await?.values() {
        let Ok(instance) = PromptInstance::from_fields(fields) else {
            continue;
        };
        let idx = match summaries.iter().position(|s| s.window_name == instance.window_name) {
            Some(idx) => idx,
            None => {
                summaries.push(WindowSummary {
                    window_name: instance.window_name.clone(),
                    total: 0,
                    incomplete: 0,
                });
                summaries.len() - 1
            }
        };
        let entry = &mut summaries[idx];
        entry.total += 1;
        if !instance.status.is_terminal() {
            entry.incomplete += 1;
        }
    }
    Ok(summaries)
}

/// Delete every non-terminal instance for a (record, window), e.g. after a
/// schedule was generated against a wrong start date. Completed and closed
/// instances are left untouched. Returns the deleted instance ids.
pub async fn delete_incomplete_instances(
    repo: &dyn FormRepository,
    record: &str,
    window_name: &str,
) -> Result<Vec<i64>> {
    let mut deleted = Vec::new();
    for (id, fields) in repo.all_instances(record).await? {
        let Ok(instance) = PromptInstance::from_fields(&fields) else {
            continue;
        };
        if instance.window_name == window_name && !instance.status.is_terminal() {
            repo.delete_instance(record, id).await?;
            deleted.push(id);
        }
    }
    tracing::info!(
        "deleted {} incomplete instances for record {record}, window '{window_name}'",
        deleted.len()
    );
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use chrono::NaiveDate;
    use ema_core::instance::PromptStatus;

    async fn seed(store: &MemoryStore, id: i64, window: &str, status: PromptStatus) {
        let instance = PromptInstance {
            window_name: window.into(),
            day_offset: 1,
            sequence: 1,
            offset_minutes: 0,
            open_minute: 480,
            open_ts: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
            status,
            retry_target: None,
            log: String::new(),
            complete: status.is_terminal(),
        };
        store.save_instance("1001", id, &instance.to_fields()).await.unwrap();
    }

    #[tokio::test]
    async fn test_summary_counts_per_window() {
        let store = MemoryStore::new();
        seed(&store, 1, "w1", PromptStatus::Scheduled).await;
        seed(&store, 2, "w1", PromptStatus::Completed).await;
        seed(&store, 3, "w2", PromptStatus::NotificationSent).await;

        let summary = window_summary(&store, "1001").await.unwrap();
        assert_eq!(summary.len(), 2);
        let w1 = summary.iter().find(|s| s.window_name == "w1").unwrap();
        assert_eq!((w1.total, w1.incomplete), (2, 1));
    }

    #[tokio::test]
    async fn test_delete_leaves_completed_and_other_windows() {
        let store = MemoryStore::new();
        seed(&store, 1, "w1", PromptStatus::Scheduled).await;
        seed(&store, 2, "w1", PromptStatus::Completed).await;
        seed(&store, 3, "w1", PromptStatus::SendError).await;
        seed(&store, 4, "w2", PromptStatus::Scheduled).await;

        let deleted = delete_incomplete_instances(&store, "1001", "w1").await.unwrap();
        assert_eq!(deleted, vec![1, 3]);
        assert_eq!(store.instance_count("1001"), 2);
    }
}
