//! Survey-side transitions, outside the periodic scan.
//!
//! The render guard blocks access once a window has closed and records the
//! attempt; the submit hook short-circuits the state machine straight to
//! `Completed` from any live status.

use chrono::NaiveDateTime;
use ema_core::config::{AppConfig, StudyConfig};
use ema_core::error::{EmaError, Result};
use ema_core::instance::{PromptInstance, PromptStatus};
use ema_core::traits::FormRepository;

/// What the survey renderer should do for a prompt instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Open,
    /// Show this message instead of the survey.
    Closed(String),
}

pub struct SurveyHooks<'a> {
    pub app: &'a AppConfig,
    pub study: &'a StudyConfig,
    pub repo: &'a dyn FormRepository,
}

impl SurveyHooks<'_> {
    async fn load(&self, record: &str, instance_id: i64) -> Result<PromptInstance> {
        let fields = self
            .repo
            .get_instance(record, instance_id)
            .await?
            .ok_or_else(|| {
                EmaError::Persistence(format!("no instance {instance_id} for record {record}"))
            })?;
        PromptInstance::from_fields(&fields)
    }

    /// Close-window check on survey render. A participant opening an
    /// expired prompt gets `AccessAfterClose` recorded and the configured
    /// closed message back.
    pub async fn on_survey_render(
        &self,
        record: &str,
        instance_id: i64,
        now: NaiveDateTime,
    ) -> Result<RenderOutcome> {
        let mut instance = self.load(record, instance_id).await?;

        if instance.status == PromptStatus::Completed {
            return Ok(RenderOutcome::Closed(self.app.closed_message.clone()));
        }

        let window = self
            .study
            .windows
            .iter()
            .find(|w| w.name == instance.window_name)
            .ok_or_else(|| {
                EmaError::Config(format!("unknown window '{}'", instance.window_name))
            })?;
        let schedule = self.study.schedule_for(window)?;

        let age_minutes = (now - instance.open_ts).num_minutes();
        let past_close = age_minutes >= schedule.close_offset;
        let already_closed = matches!(
            instance.status,
            PromptStatus::Missed
                | PromptStatus::WindowClosed
                | PromptStatus::AccessAfterClose
                | PromptStatus::OptedOut
        );

        if !past_close && !already_closed {
            return Ok(RenderOutcome::Open);
        }

        if instance.status != PromptStatus::AccessAfterClose
            && instance.status != PromptStatus::OptedOut
        {
            instance.status = PromptStatus::AccessAfterClose;
            instance.complete = true;
            instance.append_log(now, "access attempted after window close");
            self.repo
                .save_instance(record, instance_id, &instance.to_fields())
                .await?;
        }
        Ok(RenderOutcome::Closed(self.app.closed_message.clone()))
    }

    /// Survey submitted: mark the prompt completed from any live status.
    pub async fn on_survey_submit(
        &self,
        record: &str,
        instance_id: i64,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mut instance = self.load(record, instance_id).await?;
        if instance.status.is_terminal() {
            tracing::debug!(
                "{record}-{instance_id} submit on terminal status {:?}, leaving as is",
                instance.status
            );
            return Ok(());
        }
        instance.status = PromptStatus::Completed;
        instance.retry_target = None;
        instance.complete = true;
        instance.append_log(now, "survey completed");
        self.repo
            .save_instance(record, instance_id, &instance.to_fields())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use chrono::{Duration, NaiveDate};
    use ema_core::config::{Schedule, Window};

    fn study() -> StudyConfig {
        StudyConfig {
            windows: vec![Window {
                name: "daily-mood".into(),
                trigger_rule: String::new(),
                start_field: "start_date".into(),
                start_event: Default::default(),
                opt_out_field: String::new(),
                opt_out_event: Default::default(),
                days: vec![1],
                form: "mood_survey".into(),
                form_event: Default::default(),
                schedule_name: "s".into(),
                start_time_field: String::new(),
                start_time_event: Default::default(),
                start_time_default: 480,
                message: "hi".into(),
                reminder1_message: String::new(),
                reminder2_message: String::new(),
                phone_field: "cell_phone".into(),
                phone_event: Default::default(),
            }],
            schedules: vec![Schedule {
                name: "s".into(),
                offsets: vec![0],
                randomize_window: 0,
                jitter_resolution: 1,
                reminders: vec![],
                close_offset: 20,
            }],
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    async fn seed(store: &MemoryStore, status: PromptStatus, age: i64) {
        let instance = PromptInstance {
            window_name: "daily-mood".into(),
            day_offset: 1,
            sequence: 1,
            offset_minutes: 0,
            open_minute: 480,
            open_ts: now() - Duration::minutes(age),
            status,
            retry_target: None,
            log: String::new(),
            complete: false,
        };
        store.save_instance("1001", 1, &instance.to_fields()).await.unwrap();
    }

    async fn status_of(store: &MemoryStore) -> PromptStatus {
        let fields = store.get_instance("1001", 1).await.unwrap().unwrap();
        PromptInstance::from_fields(&fields).unwrap().status
    }

    #[tokio::test]
    async fn test_render_within_window_is_open() {
        let store = MemoryStore::new();
        seed(&store, PromptStatus::NotificationSent, 10).await;
        let app = AppConfig::default();
        let study = study();
        let hooks = SurveyHooks { app: &app, study: &study, repo: &store };
        assert_eq!(
            hooks.on_survey_render("1001", 1, now()).await.unwrap(),
            RenderOutcome::Open
        );
        assert_eq!(status_of(&store).await, PromptStatus::NotificationSent);
    }

    #[tokio::test]
    async fn test_render_after_close_blocks_and_records() {
        let store = MemoryStore::new();
        seed(&store, PromptStatus::NotificationSent, 30).await;
        let app = AppConfig::default();
        let study = study();
        let hooks = SurveyHooks { app: &app, study: &study, repo: &store };
        let outcome = hooks.on_survey_render("1001", 1, now()).await.unwrap();
        assert!(matches!(outcome, RenderOutcome::Closed(_)));
        assert_eq!(status_of(&store).await, PromptStatus::AccessAfterClose);
    }

    #[tokio::test]
    async fn test_submit_completes_from_any_live_status() {
        for status in [
            PromptStatus::Scheduled,
            PromptStatus::Reminder2Sent,
            PromptStatus::SendError,
        ] {
            let store = MemoryStore::new();
            seed(&store, status, 5).await;
            let app = AppConfig::default();
            let study = study();
            let hooks = SurveyHooks { app: &app, study: &study, repo: &store };
            hooks.on_survey_submit("1001", 1, now()).await.unwrap();
            assert_eq!(status_of(&store).await, PromptStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_submit_leaves_terminal_alone() {
        let store = MemoryStore::new();
        seed(&store, PromptStatus::WindowClosed, 40).await;
        let app = AppConfig::default();
        let study = study();
        let hooks = SurveyHooks { app: &app, study: &study, repo: &store };
        hooks.on_survey_submit("1001", 1, now()).await.unwrap();
        assert_eq!(status_of(&store).await, PromptStatus::WindowClosed);
    }
}
