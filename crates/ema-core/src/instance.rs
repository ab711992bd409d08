//! Prompt instances — one concrete scheduled occurrence of a window's
//! assessment, tracked through the delivery state machine.
//!
//! Instances persist as repeating-form rows keyed by (record, instance id).
//! Field values travel as flat string maps so any Form Repository backend
//! can store them without knowing the schema.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{EmaError, Result};

/// Statuses below this are live; at or above it the instance is finished.
pub const TERMINAL_THRESHOLD: u16 = 90;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Delivery status of a prompt instance. Numeric codes are persisted and
/// ordered: transitions never move backward to an earlier live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum PromptStatus {
    /// Created by the schedule calculator, waiting for its open time.
    Scheduled = 1,
    /// Initial text delivered.
    NotificationSent = 2,
    Reminder1Sent = 3,
    Reminder2Sent = 4,
    /// Participant submitted the survey.
    Completed = 96,
    /// Window closed before any notification went out.
    Missed = 97,
    /// Window closed after at least one notification went out.
    WindowClosed = 98,
    /// Participant tried to open the survey after close.
    AccessAfterClose = 99,
    /// Transport failure. Retried on the next tick, closed like a sent
    /// state once the window expires.
    SendError = 100,
    /// Record-level opt-out pre-empted further sends.
    OptedOut = 101,
}

impl PromptStatus {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use PromptStatus::*;
        match code {
            1 => Some(Scheduled),
            2 => Some(NotificationSent),
            3 => Some(Reminder1Sent),
            4 => Some(Reminder2Sent),
            96 => Some(Completed),
            97 => Some(Missed),
            98 => Some(WindowClosed),
            99 => Some(AccessAfterClose),
            100 => Some(SendError),
            101 => Some(OptedOut),
            _ => None,
        }
    }

    /// Finished for good: no scan will ever touch this instance again.
    /// `SendError` sits above the threshold numerically but stays
    /// actionable so the next tick can retry the failed send.
    pub fn is_terminal(self) -> bool {
        self.code() >= TERMINAL_THRESHOLD && self != PromptStatus::SendError
    }

    /// Whether the scan should still pick this instance up.
    pub fn is_actionable(self) -> bool {
        !self.is_terminal()
    }
}

/// One scheduled occurrence of a window's assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInstance {
    pub window_name: String,
    /// Days since the participant's start date.
    pub day_offset: i64,
    /// 1-based position within the day.
    pub sequence: u32,
    /// The nominal minute offset from the schedule.
    pub offset_minutes: i64,
    /// start time + jitter + offset; immutable once computed.
    pub open_minute: i64,
    /// Absolute open datetime, derived at creation and never re-rolled.
    pub open_ts: NaiveDateTime,
    pub status: PromptStatus,
    /// When a send fails, the status the send was trying to reach, so the
    /// next tick retries the same message class.
    pub retry_target: Option<PromptStatus>,
    /// Append-only free-text trail of state-change reasons.
    pub log: String,
    /// Form completion flag, set when a terminal status is reached.
    pub complete: bool,
}

impl PromptInstance {
    /// Append a timestamped line to the instance log.
    pub fn append_log(&mut self, now: NaiveDateTime, message: &str) {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log
            .push_str(&format!("[{}] {message}", now.format(TS_FORMAT)));
    }

    /// Flatten to the field map a Form Repository stores.
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("ema_window_name".into(), self.window_name.clone());
        fields.insert("ema_window_day".into(), self.day_offset.to_string());
        fields.insert("ema_sequence".into(), self.sequence.to_string());
        fields.insert("ema_offset".into(), self.offset_minutes.to_string());
        fields.insert("ema_open".into(), self.open_minute.to_string());
        fields.insert("ema_open_ts".into(), self.open_ts.format(TS_FORMAT).to_string());
        fields.insert("ema_status".into(), self.status.code().to_string());
        fields.insert(
            "ema_retry_target".into(),
            self.retry_target.map(|s| s.code().to_string()).unwrap_or_default(),
        );
        fields.insert("ema_log".into(), self.log.clone());
        fields.insert(
            "ema_complete".into(),
            if self.complete { "2" } else { "0" }.to_string(),
        );
        fields
    }

    /// Rebuild from a stored field map.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| fields.get(key).map(String::as_str).unwrap_or("");
        let status_code: u16 = get("ema_status")
            .parse()
            .map_err(|_| EmaError::Persistence(format!("bad ema_status '{}'", get("ema_status"))))?;
        let status = PromptStatus::from_code(status_code)
            .ok_or_else(|| EmaError::Persistence(format!("unknown status code {status_code}")))?;
        let open_ts = NaiveDateTime::parse_from_str(get("ema_open_ts"), TS_FORMAT)
            .map_err(|e| EmaError::Persistence(format!("bad ema_open_ts: {e}")))?;
        let retry_target = get("ema_retry_target")
            .parse::<u16>()
            .ok()
            .and_then(PromptStatus::from_code);
        Ok(Self {
            window_name: get("ema_window_name").to_string(),
            day_offset: get("ema_window_day").parse().unwrap_or(0),
            sequence: get("ema_sequence").parse().unwrap_or(0),
            offset_minutes: get("ema_offset").parse().unwrap_or(0),
            open_minute: get("ema_open").parse().unwrap_or(0),
            open_ts,
            status,
            retry_target,
            log: get("ema_log").to_string(),
            complete: get("ema_complete") == "2",
        })
    }
}
