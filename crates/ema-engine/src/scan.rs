//! The periodic scan — advances every due prompt instance through the
//! state machine.
//!
//! One invocation per external tick. Windows are processed independently:
//! a window whose schedule cannot be resolved is logged and skipped, never
//! blocking the others. Each instance is likewise isolated — an error
//! leaves it unchanged and the sweep continues. Record data is loaded once
//! per record and cached for the rest of the invocation, so a record
//! mutated mid-scan is seen with the data from first touch until the next
//! tick.

use std::collections::HashMap;

use chrono::{NaiveDateTime, Utc};
use ema_core::config::{AppConfig, Schedule, StudyConfig, Window};
use ema_core::error::{EmaError, Result};
use ema_core::instance::{PromptInstance, PromptStatus};
use ema_core::project::{ProjectContext, RecordSnapshot, field_value};
use ema_core::traits::{FormRepository, RecordStore, SmsTransport};

use crate::eligibility::OPT_OUT_SENTINEL;
use crate::machine::{MessageKind, ScanDecision, next_decision};

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub examined: usize,
    pub updated: usize,
    pub sent: usize,
    pub errors: usize,
}

pub struct ScanEngine<'a> {
    pub app: &'a AppConfig,
    pub project: &'a ProjectContext,
    pub study: &'a StudyConfig,
    pub repo: &'a dyn FormRepository,
    pub records: &'a dyn RecordStore,
    pub transport: &'a dyn SmsTransport,
}

impl ScanEngine<'_> {
    /// Run one sweep against the current clock.
    pub async fn run(&self) -> Result<ScanOutcome> {
        self.run_at(Utc::now().naive_utc()).await
    }

    /// Run one sweep with an explicit clock reading. Every age computation
    /// in the pass uses this single value.
    pub async fn run_at(&self, now: NaiveDateTime) -> Result<ScanOutcome> {
        let windows = self.resolve_windows();
        let due = self.repo.due_instances(now).await?;
        tracing::debug!("scan found {} due instances", due.len());

        let mut outcome = ScanOutcome::default();
        // Snapshot cache: (record id, data at first touch).
        let mut cached: Option<(String, RecordSnapshot)> = None;

        for (record, instance_id) in due {
            outcome.examined += 1;
            match self
                .process_instance(&record, instance_id, now, &windows, &mut cached, &mut outcome)
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    outcome.errors += 1;
                    tracing::error!("instance {record}-{instance_id} left unchanged: {e}");
                }
            }
        }

        tracing::info!(
            "scan complete: {} examined, {} updated, {} sent, {} errors",
            outcome.examined,
            outcome.updated,
            outcome.sent,
            outcome.errors
        );
        Ok(outcome)
    }

    /// Pair every window with its schedule; a window with a bad schedule
    /// reference is dropped from this pass with an error log.
    fn resolve_windows(&self) -> HashMap<&str, (&Window, &Schedule)> {
        let mut map = HashMap::new();
        for window in &self.study.windows {
            match self.study.schedule_for(window) {
                Ok(schedule) => {
                    map.insert(window.name.as_str(), (window, schedule));
                }
                Err(e) => tracing::error!("window '{}' skipped this scan: {e}", window.name),
            }
        }
        map
    }

    async fn snapshot_for<'c>(
        &self,
        record: &str,
        cached: &'c mut Option<(String, RecordSnapshot)>,
    ) -> Result<&'c RecordSnapshot> {
        let stale = !matches!(cached, Some((r, _)) if r == record);
        if stale {
            let snapshot = self
                .records
                .record_snapshot(self.project.project_id, record, &[])
                .await?;
            *cached = Some((record.to_string(), snapshot));
        }
        match cached {
            Some((_, snapshot)) => Ok(snapshot),
            None => Err(EmaError::Persistence("snapshot cache empty".into())),
        }
    }

    async fn process_instance(
        &self,
        record: &str,
        instance_id: i64,
        now: NaiveDateTime,
        windows: &HashMap<&str, (&Window, &Schedule)>,
        cached: &mut Option<(String, RecordSnapshot)>,
        outcome: &mut ScanOutcome,
    ) -> Result<()> {
        let Some(fields) = self.repo.get_instance(record, instance_id).await? else {
            // Deleted by a concurrent admin action; nothing to do.
            return Ok(());
        };
        let mut instance = PromptInstance::from_fields(&fields)?;
        let Some(&(window, schedule)) = windows.get(instance.window_name.as_str()) else {
            return Err(EmaError::Config(format!(
                "instance references unknown window '{}'",
                instance.window_name
            )));
        };

        let snapshot = self.snapshot_for(record, cached).await?;
        let opt_out_event = self.project.resolve_event_id(&window.opt_out_event)?;
        let opted_out =
            field_value(snapshot, opt_out_event, &window.opt_out_field) == Some(OPT_OUT_SENTINEL);
        let phone_event = self.project.resolve_event_id(&window.phone_event)?;
        let phone = field_value(snapshot, phone_event, &window.phone_field).map(str::to_string);

        let age_minutes = (now - instance.open_ts).num_minutes();
        let decision =
            next_decision(instance.status, instance.retry_target, age_minutes, opted_out, schedule);

        let previous = instance.status;
        match decision {
            ScanDecision::Leave => return Ok(()),
            ScanDecision::Expire(status) => {
                instance.status = status;
                instance.append_log(now, &format!("window closed at {age_minutes} min"));
            }
            ScanDecision::OptOut => {
                instance.status = PromptStatus::OptedOut;
                instance.append_log(now, "participant opted out");
            }
            ScanDecision::Send { kind, on_success } => {
                self.deliver(record, instance_id, &mut instance, window, kind, on_success, phone, now)
                    .await;
                if instance.status == on_success {
                    outcome.sent += 1;
                }
            }
        }

        if instance.status.is_terminal() && !instance.complete {
            instance.complete = true;
        }

        // Monotonic-status rule: the write is conditional on the stored
        // status still being the one loaded above. A survey submit or a
        // concurrent scan landing in between wins; our update is dropped.
        let written = self
            .repo
            .update_instance_if_status(record, instance_id, &instance.to_fields(), previous.code())
            .await?;
        if !written {
            tracing::debug!("{record}-{instance_id} advanced since load, update dropped");
            return Ok(());
        }
        outcome.updated += 1;
        tracing::debug!(
            "{record}-{instance_id} {:?} → {:?}",
            previous,
            instance.status
        );
        Ok(())
    }

    /// Send one message and settle the instance status: the intended sent
    /// state on success, `SendError` with a retry target otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        record: &str,
        instance_id: i64,
        instance: &mut PromptInstance,
        window: &Window,
        kind: MessageKind,
        on_success: PromptStatus,
        phone: Option<String>,
        now: NaiveDateTime,
    ) {
        let template = match kind {
            MessageKind::Initial => &window.message,
            MessageKind::Reminder1 => &window.reminder1_message,
            MessageKind::Reminder2 => &window.reminder2_message,
        };

        let Some(phone) = phone else {
            instance.status = PromptStatus::SendError;
            instance.retry_target = Some(on_success);
            instance.append_log(
                now,
                &format!("missing cell phone number in {}", window.phone_field),
            );
            return;
        };

        if template.is_empty() {
            // Nothing to say for this class; advance the state anyway so
            // the next class's clock starts.
            instance.status = on_success;
            instance.retry_target = None;
            instance.append_log(now, "no message template configured, marked sent");
            return;
        }

        let body = format!("{template} {}", self.app.survey_link(record, instance_id));
        match self.transport.send(&phone, &body).await {
            Ok(sid) => {
                instance.status = on_success;
                instance.retry_target = None;
                instance.append_log(now, &format!("{kind:?} sent ({sid})"));
            }
            Err(e) => {
                instance.status = PromptStatus::SendError;
                instance.retry_target = Some(on_success);
                instance.append_log(now, &format!("{kind:?} send failed: {e}"));
                tracing::warn!("{record}-{instance_id} send failed: {e}");
            }
        }
    }
}
