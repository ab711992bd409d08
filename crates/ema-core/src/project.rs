//! Project context and field resolution.
//!
//! The original system read an ambient "current project" — here that state
//! is an explicit [`ProjectContext`] value passed into every component.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EmaError, Result};

/// Numeric event identifier within a project.
pub type EventId = u64;

/// One record's data: event id → field name → raw value.
pub type RecordSnapshot = HashMap<EventId, HashMap<String, String>>;

/// An event reference as it appears in config: either a numeric id or a
/// symbolic event name (e.g. `baseline_arm_1`). Resolved once at config
/// load into a canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventRef {
    ById(EventId),
    ByName(String),
}

impl Default for EventRef {
    fn default() -> Self {
        EventRef::ByName(String::new())
    }
}

impl EventRef {
    /// Parse a raw settings value. Bare integers become ids, anything else
    /// is treated as an event name. Empty strings stay `ByName("")` and
    /// resolve to the default event on non-longitudinal projects.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<EventId>() {
            Ok(id) => EventRef::ById(id),
            Err(_) => EventRef::ByName(raw.trim().to_string()),
        }
    }
}

/// Explicit project state: the event name↔id map, whether the project is
/// longitudinal, and the record-id field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: u64,
    /// event id → unique event name.
    pub events: HashMap<EventId, String>,
    /// Non-longitudinal projects have a single default event and every
    /// reference resolves to it.
    pub longitudinal: bool,
    pub record_id_field: String,
}

impl ProjectContext {
    pub fn new(project_id: u64, events: HashMap<EventId, String>, longitudinal: bool) -> Self {
        Self {
            project_id,
            events,
            longitudinal,
            record_id_field: "record_id".to_string(),
        }
    }

    /// The single default event id (lowest id). Used for non-longitudinal
    /// projects where config event references are ignored.
    pub fn default_event(&self) -> Result<EventId> {
        self.events
            .keys()
            .min()
            .copied()
            .ok_or_else(|| EmaError::Resolution("project has no events".into()))
    }

    /// Normalize an ambiguous event reference (name or id) to an event id.
    pub fn resolve_event_id(&self, event: &EventRef) -> Result<EventId> {
        if !self.longitudinal {
            return self.default_event();
        }
        match event {
            EventRef::ById(id) => {
                if self.events.contains_key(id) {
                    Ok(*id)
                } else {
                    Err(EmaError::Resolution(format!("unknown event id {id}")))
                }
            }
            EventRef::ByName(name) => self
                .events
                .iter()
                .find(|(_, n)| n.as_str() == name)
                .map(|(id, _)| *id)
                .ok_or_else(|| EmaError::Resolution(format!("unknown event name '{name}'"))),
        }
    }
}

impl Default for ProjectContext {
    fn default() -> Self {
        let mut events = HashMap::new();
        events.insert(1, "event_1".to_string());
        ProjectContext::new(0, events, false)
    }
}

/// Look up a field value in a record snapshot. Returns `None` for an empty
/// field name, an absent event, or an absent/empty value.
pub fn field_value<'a>(
    snapshot: &'a RecordSnapshot,
    event_id: EventId,
    field: &str,
) -> Option<&'a str> {
    if field.is_empty() {
        return None;
    }
    let value = snapshot.get(&event_id)?.get(field)?.as_str();
    if value.is_empty() { None } else { Some(value) }
}
