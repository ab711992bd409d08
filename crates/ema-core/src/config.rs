//! Study and application configuration.
//!
//! Two layers live here:
//! - [`StudyConfig`] — the window/schedule definitions that drive prompt
//!   scheduling. Stored as a single JSON blob (the admin tool edits it as
//!   one string setting) or assembled from a flat settings store of
//!   per-field parallel arrays.
//! - [`AppConfig`] — deployment settings (database path, transport
//!   credentials, scan interval), loaded from `~/.ema/config.toml`.
//!
//! Config rows are strongly typed and validated eagerly at load time so a
//! malformed window fails at the edge, not deep inside a scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EmaError, Result};
use crate::project::{EventRef, ProjectContext};

/// A named recurring assessment period: when it starts, who is eligible,
/// where its prompt instances are stored, and what texts get sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Window {
    pub name: String,
    /// Boolean expression over record data, evaluated by the external
    /// rule evaluator when deciding whether to build a schedule.
    pub trigger_rule: String,
    pub start_field: String,
    #[serde(default)]
    pub start_event: EventRef,
    pub opt_out_field: String,
    #[serde(default)]
    pub opt_out_event: EventRef,
    /// Day offsets from the start date, e.g. `[1,2,3,4,6,7]`. Arbitrary
    /// set: not required to be sorted or contiguous.
    pub days: Vec<i64>,
    /// Repeating form that holds one instance per prompt occurrence.
    pub form: String,
    #[serde(default)]
    pub form_event: EventRef,
    pub schedule_name: String,
    /// Optional per-record start-time override, `HH:MM` or bare minutes.
    #[serde(default)]
    pub start_time_field: String,
    #[serde(default)]
    pub start_time_event: EventRef,
    /// Minutes after midnight when the day's first offset is anchored.
    pub start_time_default: u32,
    pub message: String,
    #[serde(default)]
    pub reminder1_message: String,
    #[serde(default)]
    pub reminder2_message: String,
    pub phone_field: String,
    #[serde(default)]
    pub phone_event: EventRef,
}

/// A named recurrence pattern shared by one or more windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Schedule {
    pub name: String,
    /// Minute offsets within a day, in listed order, e.g. `[0,240,480,720]`.
    pub offsets: Vec<i64>,
    /// Jitter ceiling in minutes. 0 = no randomization.
    #[serde(default)]
    pub randomize_window: i64,
    /// Minimum granularity for jitter buckets, in minutes.
    #[serde(default = "default_jitter_resolution")]
    pub jitter_resolution: i64,
    /// Reminder offsets in minutes after open: index 0 = first reminder,
    /// index 1 = second. May be empty or length 1.
    #[serde(default)]
    pub reminders: Vec<i64>,
    /// Minutes after open at which the prompt expires.
    pub close_offset: i64,
}

fn default_jitter_resolution() -> i64 {
    1
}

/// The full study configuration: all windows plus the schedules they
/// reference. Read-only once loaded; the core never mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default)]
    pub windows: Vec<Window>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

impl StudyConfig {
    /// Decode the single JSON blob the admin tool stores.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| EmaError::Config(format!("invalid study config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Round-trip back to the stored JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EmaError::Config(format!("serialize study config: {e}")))
    }

    /// Assemble from a flat settings store of per-field parallel arrays:
    /// each key maps to one value per row, and list-valued fields (days,
    /// offsets, reminders) are comma-joined integers.
    pub fn from_settings(settings: &HashMap<String, Vec<String>>) -> Result<Self> {
        let windows = zip_rows(settings, "window-name")?
            .into_iter()
            .map(|row| window_from_row(&row))
            .collect::<Result<Vec<_>>>()?;
        let schedules = zip_rows(settings, "schedule-name")?
            .into_iter()
            .map(|row| schedule_from_row(&row))
            .collect::<Result<Vec<_>>>()?;
        let config = Self { windows, schedules };
        config.validate()?;
        Ok(config)
    }

    /// Every window must reference a schedule that exists.
    pub fn validate(&self) -> Result<()> {
        for window in &self.windows {
            self.schedule_for(window)?;
        }
        Ok(())
    }

    /// Resolve the schedule a window references. The caller aborts that
    /// window's processing on failure, never the whole scan.
    pub fn schedule_for(&self, window: &Window) -> Result<&Schedule> {
        self.schedules
            .iter()
            .find(|s| s.name == window.schedule_name)
            .ok_or_else(|| {
                EmaError::Config(format!(
                    "window '{}' references unknown schedule '{}'",
                    window.name, window.schedule_name
                ))
            })
    }
}

/// Collect rows from parallel arrays: for each index of the anchor key,
/// build a field-name → value map from every key that has that index.
fn zip_rows(
    settings: &HashMap<String, Vec<String>>,
    anchor: &str,
) -> Result<Vec<HashMap<String, String>>> {
    let Some(anchors) = settings.get(anchor) else {
        return Ok(Vec::new());
    };
    let mut rows = Vec::with_capacity(anchors.len());
    for i in 0..anchors.len() {
        let mut row = HashMap::new();
        for (key, values) in settings {
            if let Some(value) = values.get(i) {
                row.insert(key.clone(), value.clone());
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

fn row_str(row: &HashMap<String, String>, key: &str) -> String {
    row.get(key).cloned().unwrap_or_default()
}

fn row_required(row: &HashMap<String, String>, key: &str) -> Result<String> {
    let value = row_str(row, key);
    if value.is_empty() {
        Err(EmaError::Config(format!("missing required setting '{key}'")))
    } else {
        Ok(value)
    }
}

/// Split a comma-joined list of integers, e.g. `"1,2,3"`. Empty input
/// yields an empty list.
fn parse_int_list(raw: &str, key: &str) -> Result<Vec<i64>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| EmaError::Config(format!("'{key}' has non-integer entry '{part}'")))
        })
        .collect()
}

fn window_from_row(row: &HashMap<String, String>) -> Result<Window> {
    Ok(Window {
        name: row_required(row, "window-name")?,
        trigger_rule: row_str(row, "window-trigger-rule"),
        start_field: row_required(row, "window-start-field")?,
        start_event: EventRef::parse(&row_str(row, "window-start-event")),
        opt_out_field: row_str(row, "window-opt-out-field"),
        opt_out_event: EventRef::parse(&row_str(row, "window-opt-out-event")),
        days: parse_int_list(&row_str(row, "window-days"), "window-days")?,
        form: row_required(row, "window-form")?,
        form_event: EventRef::parse(&row_str(row, "window-form-event")),
        schedule_name: row_required(row, "window-schedule-name")?,
        start_time_field: row_str(row, "window-start-time-field"),
        start_time_event: EventRef::parse(&row_str(row, "window-start-time-event")),
        start_time_default: row_str(row, "window-start-time-default")
            .trim()
            .parse()
            .unwrap_or(0),
        message: row_str(row, "text-message"),
        reminder1_message: row_str(row, "text-reminder1-message"),
        reminder2_message: row_str(row, "text-reminder2-message"),
        phone_field: row_str(row, "cell-phone-field"),
        phone_event: EventRef::parse(&row_str(row, "cell-phone-event")),
    })
}

fn schedule_from_row(row: &HashMap<String, String>) -> Result<Schedule> {
    Ok(Schedule {
        name: row_required(row, "schedule-name")?,
        offsets: parse_int_list(&row_str(row, "schedule-offsets"), "schedule-offsets")?,
        randomize_window: row_str(row, "schedule-randomize-window")
            .trim()
            .parse()
            .unwrap_or(0),
        jitter_resolution: row_str(row, "schedule-jitter-resolution")
            .trim()
            .parse()
            .unwrap_or_else(|_| default_jitter_resolution()),
        reminders: parse_int_list(&row_str(row, "schedule-reminders"), "schedule-reminders")?,
        close_offset: row_str(row, "schedule-close-offset")
            .trim()
            .parse()
            .map_err(|_| EmaError::Config("missing or invalid 'schedule-close-offset'".into()))?,
    })
}

/// Parse a time-of-day override: `"HH:MM"` or a bare integer minute count.
pub fn parse_time_of_day(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    if let Some((h, m)) = raw.split_once(':') {
        let hours: u32 = h
            .parse()
            .map_err(|_| EmaError::Config(format!("invalid time '{raw}'")))?;
        let minutes: u32 = m
            .parse()
            .map_err(|_| EmaError::Config(format!("invalid time '{raw}'")))?;
        if hours >= 24 || minutes >= 60 {
            return Err(EmaError::Config(format!("time '{raw}' out of range")));
        }
        Ok(hours * 60 + minutes)
    } else {
        raw.parse()
            .map_err(|_| EmaError::Config(format!("invalid minutes value '{raw}'")))
    }
}

/// What happens when one occurrence fails to persist while a schedule is
/// being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePersistMode {
    /// Log and keep going: partial schedules are tolerated.
    #[default]
    ContinueOnError,
    /// Collect every instance for the record/window and write them as one
    /// batch; any failure fails the whole batch.
    Batch,
}

/// SMS transport credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    /// Prefixed to 10-digit local numbers when normalizing to E.164.
    #[serde(default = "default_country_code")]
    pub country_code: String,
}

fn default_country_code() -> String {
    "1".to_string()
}

/// Deployment settings for the engine and CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_study_config_path")]
    pub study_config_path: PathBuf,
    /// Nominal tick interval for the periodic scan.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_minutes: u64,
    /// Survey link appended to every outbound text. `{record}` and
    /// `{instance}` are substituted.
    #[serde(default = "default_survey_url")]
    pub survey_url_template: String,
    /// Shown to participants who open a survey after its window closed.
    #[serde(default = "default_closed_message")]
    pub closed_message: String,
    #[serde(default)]
    pub schedule_persist_mode: SchedulePersistMode,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub project: ProjectContext,
}

fn default_db_path() -> PathBuf {
    base_dir().join("ema.db")
}

fn default_study_config_path() -> PathBuf {
    base_dir().join("study.json")
}

fn default_scan_interval() -> u64 {
    5
}

fn default_survey_url() -> String {
    "https://surveys.example.org/s/{record}/{instance}".to_string()
}

fn default_closed_message() -> String {
    "This assessment is no longer open.".to_string()
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ema")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            study_config_path: default_study_config_path(),
            scan_interval_minutes: default_scan_interval(),
            survey_url_template: default_survey_url(),
            closed_message: default_closed_message(),
            schedule_persist_mode: SchedulePersistMode::default(),
            transport: TransportConfig::default(),
            project: ProjectContext::default(),
        }
    }
}

impl AppConfig {
    /// Load from the default path, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmaError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| EmaError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn default_path() -> PathBuf {
        base_dir().join("config.toml")
    }

    /// Fill in `{record}` / `{instance}` in the survey URL template.
    pub fn survey_link(&self, record: &str, instance_id: i64) -> String {
        self.survey_url_template
            .replace("{record}", record)
            .replace("{instance}", &instance_id.to_string())
    }
}
