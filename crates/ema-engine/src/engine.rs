//! The engine facade — wires configuration and collaborators together and
//! exposes the external entrypoints: the periodic tick, the record-saved
//! trigger, the survey hooks, and the admin operations.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use ema_core::config::{AppConfig, StudyConfig};
use ema_core::error::Result;
use ema_core::project::ProjectContext;
use ema_core::traits::{FormRepository, RecordStore, RuleEvaluator, SmsTransport};

use crate::admin::{self, WindowSummary};
use crate::eligibility::EligibilityGate;
use crate::scan::{ScanEngine, ScanOutcome};
use crate::survey::{RenderOutcome, SurveyHooks};

pub struct EmaEngine {
    pub app: AppConfig,
    pub study: StudyConfig,
    pub project: ProjectContext,
    pub repo: Arc<dyn FormRepository>,
    pub records: Arc<dyn RecordStore>,
    pub rules: Arc<dyn RuleEvaluator>,
    pub transport: Arc<dyn SmsTransport>,
}

impl EmaEngine {
    /// One sweep of the scan. Invoked by the external scheduler.
    pub async fn tick(&self) -> Result<ScanOutcome> {
        self.tick_at(Utc::now().naive_utc()).await
    }

    pub async fn tick_at(&self, now: NaiveDateTime) -> Result<ScanOutcome> {
        ScanEngine {
            app: &self.app,
            project: &self.project,
            study: &self.study,
            repo: self.repo.as_ref(),
            records: self.records.as_ref(),
            transport: self.transport.as_ref(),
        }
        .run_at(now)
        .await
    }

    /// Record-saved trigger: evaluate eligibility for every window.
    pub async fn record_saved(&self, record: &str) -> Result<()> {
        EligibilityGate {
            project: &self.project,
            study: &self.study,
            repo: self.repo.as_ref(),
            records: self.records.as_ref(),
            rules: self.rules.as_ref(),
            persist_mode: self.app.schedule_persist_mode,
        }
        .on_record_saved(record)
        .await
    }

    pub async fn survey_render(&self, record: &str, instance_id: i64) -> Result<RenderOutcome> {
        self.survey_hooks()
            .on_survey_render(record, instance_id, Utc::now().naive_utc())
            .await
    }

    pub async fn survey_submit(&self, record: &str, instance_id: i64) -> Result<()> {
        self.survey_hooks()
            .on_survey_submit(record, instance_id, Utc::now().naive_utc())
            .await
    }

    pub async fn window_summary(&self, record: &str) -> Result<Vec<WindowSummary>> {
        admin::window_summary(self.repo.as_ref(), record).await
    }

    pub async fn clear_window(&self, record: &str, window: &str) -> Result<Vec<i64>> {
        admin::delete_incomplete_instances(self.repo.as_ref(), record, window).await
    }

    fn survey_hooks(&self) -> SurveyHooks<'_> {
        SurveyHooks {
            app: &self.app,
            study: &self.study,
            repo: self.repo.as_ref(),
        }
    }
}

/// Run the tick loop forever: one scan per interval, errors logged and the
/// loop carried on. Intended to be spawned as the process's main task when
/// no external cron drives the scan.
pub async fn run_tick_loop(engine: Arc<EmaEngine>, interval_minutes: u64) {
    tracing::info!("scan loop started (every {interval_minutes} min)");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(interval_minutes * 60));
    loop {
        interval.tick().await;
        match engine.tick().await {
            Ok(outcome) => {
                if outcome.examined > 0 {
                    tracing::info!(
                        "tick: {} examined, {} sent, {} errors",
                        outcome.examined,
                        outcome.sent,
                        outcome.errors
                    );
                }
            }
            Err(e) => tracing::error!("scan failed: {e}"),
        }
    }
}
