//! In-memory collaborator implementations.
//!
//! Back the engine with plain maps for unit tests and local dry runs:
//! a combined form/record store, a canned rule evaluator, and a transport
//! that records what it would have sent and can be told to fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use ema_core::error::{EmaError, Result};
use ema_core::instance::PromptStatus;
use ema_core::project::{EventId, RecordSnapshot};
use ema_core::traits::{FormRepository, InstanceFields, RecordStore, RuleEvaluator, SmsTransport};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Map-backed form repository and record store.
#[derive(Default)]
pub struct MemoryStore {
    instances: Mutex<HashMap<String, BTreeMap<i64, InstanceFields>>>,
    records: Mutex<HashMap<String, RecordSnapshot>>,
    /// When set, every `save_instance` fails with a persistence error.
    pub fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one field of one record's snapshot.
    pub fn set_field(&self, record: &str, event: EventId, field: &str, value: &str) {
        let mut records = self.records.lock().unwrap();
        records
            .entry(record.to_string())
            .or_default()
            .entry(event)
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub fn instance_count(&self, record: &str) -> usize {
        self.instances
            .lock()
            .unwrap()
            .get(record)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl FormRepository for MemoryStore {
    async fn get_instance(&self, record: &str, instance_id: i64) -> Result<Option<InstanceFields>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(record)
            .and_then(|m| m.get(&instance_id))
            .cloned())
    }

    async fn save_instance(
        &self,
        record: &str,
        instance_id: i64,
        fields: &InstanceFields,
    ) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(EmaError::Persistence("simulated save failure".into()));
        }
        self.instances
            .lock()
            .unwrap()
            .entry(record.to_string())
            .or_default()
            .insert(instance_id, fields.clone());
        Ok(())
    }

    async fn update_instance_if_status(
        &self,
        record: &str,
        instance_id: i64,
        fields: &InstanceFields,
        expected_status: u16,
    ) -> Result<bool> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(EmaError::Persistence("simulated save failure".into()));
        }
        let mut instances = self.instances.lock().unwrap();
        let Some(stored) = instances.get_mut(record).and_then(|m| m.get_mut(&instance_id)) else {
            return Ok(false);
        };
        let current = stored.get("ema_status").and_then(|v| v.parse::<u16>().ok());
        if current != Some(expected_status) {
            return Ok(false);
        }
        *stored = fields.clone();
        Ok(true)
    }

    async fn next_instance_id(&self, record: &str) -> Result<i64> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(record)
            .and_then(|m| m.keys().max().copied())
            .unwrap_or(0)
            + 1)
    }

    async fn all_instances(&self, record: &str) -> Result<BTreeMap<i64, InstanceFields>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(record)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_instance(&self, record: &str, instance_id: i64) -> Result<i64> {
        self.instances
            .lock()
            .unwrap()
            .get_mut(record)
            .and_then(|m| m.remove(&instance_id));
        Ok(instance_id)
    }

    async fn due_instances(&self, now: NaiveDateTime) -> Result<Vec<(String, i64)>> {
        let instances = self.instances.lock().unwrap();
        let mut records: Vec<&String> = instances.keys().collect();
        records.sort();
        let mut due = Vec::new();
        for record in records {
            for (id, fields) in &instances[record] {
                let Some(open_ts) = fields
                    .get("ema_open_ts")
                    .and_then(|v| NaiveDateTime::parse_from_str(v, TS_FORMAT).ok())
                else {
                    continue;
                };
                let actionable = fields
                    .get("ema_status")
                    .and_then(|v| v.parse::<u16>().ok())
                    .and_then(PromptStatus::from_code)
                    .is_some_and(PromptStatus::is_actionable);
                if actionable && open_ts <= now {
                    due.push((record.clone(), *id));
                }
            }
        }
        Ok(due)
    }

    async fn all_records(&self) -> Result<Vec<String>> {
        let mut records: Vec<String> = self.instances.lock().unwrap().keys().cloned().collect();
        records.sort();
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn record_snapshot(
        &self,
        _project_id: u64,
        record: &str,
        _events: &[EventId],
    ) -> Result<RecordSnapshot> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(record)
            .cloned()
            .unwrap_or_default())
    }
}

/// Rule evaluator returning a fixed verdict.
pub struct FixedRuleEvaluator(pub bool);

#[async_trait]
impl RuleEvaluator for FixedRuleEvaluator {
    async fn evaluate(&self, _rule: &str, _project_id: u64, _record: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Transport that records outbound messages instead of sending them.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<(String, String)>>,
    /// When set, every send fails with a transport error.
    pub fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SmsTransport for MockTransport {
    async fn send(&self, to: &str, body: &str) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmaError::Transport("simulated transport outage".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(format!("mock-{}", sent.len()))
    }
}
