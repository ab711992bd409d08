//! Schedule calculation — turns a window trigger into concrete prompt
//! instances.
//!
//! For each configured day offset and each intra-day minute offset, one
//! instance is created with jitter sampled exactly once; open timestamps
//! are immutable after this point. Instances are appended in
//! (day, sequence) order so the repository's instance ids reflect
//! creation order.

use chrono::{Duration, NaiveDate};
use ema_core::config::{Schedule, SchedulePersistMode, Window};
use ema_core::error::Result;
use ema_core::instance::{PromptInstance, PromptStatus};
use ema_core::traits::FormRepository;
use rand::Rng;

/// Sample a jitter value: a uniform pick from `0..=floor(max/resolution)`
/// buckets, scaled back to minutes. `max <= 0` disables jitter.
fn sample_jitter(max: i64, resolution: i64) -> i64 {
    if max <= 0 {
        return 0;
    }
    let resolution = resolution.max(1);
    let buckets = max / resolution;
    rand::thread_rng().gen_range(0..=buckets) * resolution
}

/// Build the full set of instances for one record/window, without
/// touching storage. `sequence` restarts at 1 each day.
fn build_instances(
    window: &Window,
    schedule: &Schedule,
    start_date: NaiveDate,
    start_minutes: u32,
) -> Vec<PromptInstance> {
    let mut instances = Vec::with_capacity(window.days.len() * schedule.offsets.len());
    for &day in &window.days {
        let occurrence_date = start_date + Duration::days(day);
        for (i, &offset) in schedule.offsets.iter().enumerate() {
            let jitter = sample_jitter(schedule.randomize_window, schedule.jitter_resolution);
            let open_minute = i64::from(start_minutes) + jitter + offset;
            let open_ts =
                occurrence_date.and_time(chrono::NaiveTime::MIN) + Duration::minutes(open_minute);
            instances.push(PromptInstance {
                window_name: window.name.clone(),
                day_offset: day,
                sequence: (i + 1) as u32,
                offset_minutes: offset,
                open_minute,
                open_ts,
                status: PromptStatus::Scheduled,
                retry_target: None,
                log: String::new(),
                complete: false,
            });
        }
    }
    instances
}

/// Compute and persist a window schedule for one record.
///
/// Persist mode decides the failure policy: `ContinueOnError` logs a
/// failed occurrence and keeps going (partial schedules are tolerated);
/// `Batch` removes anything already written and fails the whole set.
/// Returns the number of instances persisted.
pub async fn compute(
    repo: &dyn FormRepository,
    record: &str,
    window: &Window,
    schedule: &Schedule,
    start_date: NaiveDate,
    start_minutes: u32,
    mode: SchedulePersistMode,
) -> Result<usize> {
    let instances = build_instances(window, schedule, start_date, start_minutes);
    let mut next_id = repo.next_instance_id(record).await?;
    let mut written = Vec::new();

    for instance in &instances {
        let instance_id = next_id;
        match repo.save_instance(record, instance_id, &instance.to_fields()).await {
            Ok(()) => {
                next_id += 1;
                written.push(instance_id);
            }
            Err(e) => match mode {
                SchedulePersistMode::ContinueOnError => {
                    tracing::error!(
                        "failed to save instance for window '{}', record {record}, day {} seq {}: {e}",
                        window.name,
                        instance.day_offset,
                        instance.sequence
                    );
                    next_id += 1;
                }
                SchedulePersistMode::Batch => {
                    for id in &written {
                        if let Err(del) = repo.delete_instance(record, *id).await {
                            tracing::error!("batch rollback failed for instance {id}: {del}");
                        }
                    }
                    return Err(e);
                }
            },
        }
    }

    tracing::info!(
        "scheduled {} of {} prompts for window '{}', record {record}",
        written.len(),
        instances.len(),
        window.name
    );
    Ok(written.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use std::collections::HashSet;

    fn window() -> Window {
        Window {
            name: "daily-mood".into(),
            trigger_rule: String::new(),
            start_field: "start_date".into(),
            start_event: Default::default(),
            opt_out_field: "opt_out".into(),
            opt_out_event: Default::default(),
            days: vec![1],
            form: "mood_survey".into(),
            form_event: Default::default(),
            schedule_name: "four-a-day".into(),
            start_time_field: String::new(),
            start_time_event: Default::default(),
            start_time_default: 480,
            message: "check in".into(),
            reminder1_message: "reminder 1".into(),
            reminder2_message: "reminder 2".into(),
            phone_field: "cell_phone".into(),
            phone_event: Default::default(),
        }
    }

    fn schedule() -> Schedule {
        Schedule {
            name: "four-a-day".into(),
            offsets: vec![0, 240, 480, 720],
            randomize_window: 0,
            jitter_resolution: 1,
            reminders: vec![5, 10],
            close_offset: 20,
        }
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn test_fixed_offsets_no_jitter() {
        let store = MemoryStore::new();
        let n = compute(
            &store,
            "1001",
            &window(),
            &schedule(),
            start(),
            480,
            SchedulePersistMode::ContinueOnError,
        )
        .await
        .unwrap();
        assert_eq!(n, 4);

        let instances = store.all_instances("1001").await.unwrap();
        let mut open_minutes = Vec::new();
        for (_, fields) in &instances {
            let instance = PromptInstance::from_fields(fields).unwrap();
            assert_eq!(instance.status, PromptStatus::Scheduled);
            assert_eq!(instance.open_ts.date().to_string(), "2024-01-02");
            open_minutes.push(instance.open_minute);
        }
        assert_eq!(open_minutes, vec![480, 720, 960, 1200]);
    }

    #[tokio::test]
    async fn test_instance_count_and_unique_day_sequence() {
        let store = MemoryStore::new();
        let mut w = window();
        w.days = vec![1, 2, 4, 7];
        compute(
            &store,
            "1001",
            &w,
            &schedule(),
            start(),
            480,
            SchedulePersistMode::ContinueOnError,
        )
        .await
        .unwrap();

        let instances = store.all_instances("1001").await.unwrap();
        assert_eq!(instances.len(), 4 * 4);
        let pairs: HashSet<(i64, u32)> = instances
            .values()
            .map(|f| {
                let i = PromptInstance::from_fields(f).unwrap();
                (i.day_offset, i.sequence)
            })
            .collect();
        assert_eq!(pairs.len(), 16);
    }

    #[tokio::test]
    async fn test_jitter_bounded_and_on_resolution() {
        let store = MemoryStore::new();
        let mut s = schedule();
        s.randomize_window = 60;
        s.jitter_resolution = 5;
        let mut w = window();
        w.days = (1..=20).collect();

        compute(&store, "1001", &w, &s, start(), 480, SchedulePersistMode::ContinueOnError)
            .await
            .unwrap();

        for fields in store.all_instances("1001").await.unwrap().values() {
            let instance = PromptInstance::from_fields(fields).unwrap();
            let jitter = instance.open_minute - 480 - instance.offset_minutes;
            assert!((0..=60).contains(&jitter), "jitter {jitter} out of bounds");
            assert_eq!(jitter % 5, 0, "jitter {jitter} off resolution");
        }
    }

    #[tokio::test]
    async fn test_batch_mode_rolls_back_on_failure() {
        let store = MemoryStore::new();
        store.fail_saves.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = compute(
            &store,
            "1001",
            &window(),
            &schedule(),
            start(),
            480,
            SchedulePersistMode::Batch,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(store.instance_count("1001"), 0);
    }

    #[tokio::test]
    async fn test_continue_mode_tolerates_failures() {
        let store = MemoryStore::new();
        store.fail_saves.store(true, std::sync::atomic::Ordering::SeqCst);
        let n = compute(
            &store,
            "1001",
            &window(),
            &schedule(),
            start(),
            480,
            SchedulePersistMode::ContinueOnError,
        )
        .await
        .unwrap();
        assert_eq!(n, 0); // nothing written, nothing raised
    }
}
