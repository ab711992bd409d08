//! Eligibility gate — decides, on every record save, whether a window
//! schedule should be calculated now.
//!
//! A record qualifies for a window when it has a start date and a phone
//! number, its trigger rule passes, it has not opted out, and no schedule
//! for that window exists yet. The existence check is what makes repeated
//! saves idempotent; it is best-effort under concurrent saves (no lock,
//! no unique constraint — see DESIGN.md).

use chrono::NaiveDate;
use ema_core::config::{SchedulePersistMode, StudyConfig, Window, parse_time_of_day};
use ema_core::error::{EmaError, Result};
use ema_core::project::{ProjectContext, field_value};
use ema_core::traits::{FormRepository, RecordStore, RuleEvaluator};

use crate::calculator;

/// Value of the opt-out field that suppresses scheduling.
pub const OPT_OUT_SENTINEL: &str = "1";

pub struct EligibilityGate<'a> {
    pub project: &'a ProjectContext,
    pub study: &'a StudyConfig,
    pub repo: &'a dyn FormRepository,
    pub records: &'a dyn RecordStore,
    pub rules: &'a dyn RuleEvaluator,
    pub persist_mode: SchedulePersistMode,
}

impl EligibilityGate<'_> {
    /// Entry point for the record-saved trigger: evaluate every window.
    /// A failure in one window is logged and does not block the others.
    pub async fn on_record_saved(&self, record: &str) -> Result<()> {
        for window in &self.study.windows {
            match self.evaluate_window(record, window).await {
                Ok(true) => {
                    tracing::info!("schedule created for window '{}', record {record}", window.name)
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("window '{}' skipped for record {record}: {e}", window.name)
                }
            }
        }
        Ok(())
    }

    /// Returns true when a new schedule was calculated.
    async fn evaluate_window(&self, record: &str, window: &Window) -> Result<bool> {
        let start_event = self.project.resolve_event_id(&window.start_event)?;
        let phone_event = self.project.resolve_event_id(&window.phone_event)?;
        let opt_out_event = self.project.resolve_event_id(&window.opt_out_event)?;

        let events = vec![start_event, phone_event, opt_out_event];
        let snapshot = self
            .records
            .record_snapshot(self.project.project_id, record, &events)
            .await?;

        // Not yet ready: re-evaluated on the next save, not an error.
        let Some(start_raw) = field_value(&snapshot, start_event, &window.start_field) else {
            return Ok(false);
        };
        if field_value(&snapshot, phone_event, &window.phone_field).is_none() {
            return Ok(false);
        }

        if !window.trigger_rule.is_empty()
            && !self
                .rules
                .evaluate(&window.trigger_rule, self.project.project_id, record)
                .await?
        {
            return Ok(false);
        }

        // Opt-out is sticky: no schedule, no re-check scheduled.
        if field_value(&snapshot, opt_out_event, &window.opt_out_field) == Some(OPT_OUT_SENTINEL) {
            tracing::debug!("record {record} opted out of window '{}'", window.name);
            return Ok(false);
        }

        // At most one active schedule per (record, window).
        for fields in self.repo.all_instances(record).await?.values() {
            if fields.get("ema_window_name").map(String::as_str) == Some(window.name.as_str()) {
                return Ok(false);
            }
        }

        let start_minutes = self.resolve_start_minutes(record, window, &snapshot).await?;
        let start_date = parse_start_date(start_raw)?;
        let schedule = self.study.schedule_for(window)?;

        calculator::compute(
            self.repo,
            record,
            window,
            schedule,
            start_date,
            start_minutes,
            self.persist_mode,
        )
        .await?;
        Ok(true)
    }

    /// Override field value if present, else the window default. An
    /// unparseable override is logged and the default used.
    async fn resolve_start_minutes(
        &self,
        record: &str,
        window: &Window,
        snapshot: &ema_core::project::RecordSnapshot,
    ) -> Result<u32> {
        if window.start_time_field.is_empty() {
            return Ok(window.start_time_default);
        }
        let event = self.project.resolve_event_id(&window.start_time_event)?;
        match field_value(snapshot, event, &window.start_time_field) {
            None => Ok(window.start_time_default),
            Some(raw) => match parse_time_of_day(raw) {
                Ok(minutes) => Ok(minutes),
                Err(e) => {
                    tracing::warn!(
                        "record {record}, window '{}': bad start-time override '{raw}' ({e}); using default",
                        window.name
                    );
                    Ok(window.start_time_default)
                }
            },
        }
    }
}

/// Parse the trigger field's date, tolerating a trailing time component.
fn parse_start_date(raw: &str) -> Result<NaiveDate> {
    let date_part = raw.trim().get(..10).unwrap_or(raw.trim());
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| EmaError::Config(format!("unparseable start date '{raw}'")))
}
