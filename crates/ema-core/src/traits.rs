//! Collaborator seams: the engine talks to storage, rule evaluation, and
//! the SMS transport only through these traits.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::Result;
use crate::project::{EventId, RecordSnapshot};

/// Flat field map for one repeating-form instance.
pub type InstanceFields = HashMap<String, String>;

/// Repeating-form storage for prompt instances. Implementations hide
/// whether the project repeats whole events or named forms.
#[async_trait]
pub trait FormRepository: Send + Sync {
    async fn get_instance(&self, record: &str, instance_id: i64) -> Result<Option<InstanceFields>>;

    async fn save_instance(
        &self,
        record: &str,
        instance_id: i64,
        fields: &InstanceFields,
    ) -> Result<()>;

    /// Persist updated fields only if the stored status still equals
    /// `expected_status`. Returns whether the write happened; a `false`
    /// means another writer touched the instance since it was loaded and
    /// the caller's update must be dropped.
    async fn update_instance_if_status(
        &self,
        record: &str,
        instance_id: i64,
        fields: &InstanceFields,
        expected_status: u16,
    ) -> Result<bool>;

    /// Next unused instance id for a record. Instance ids reflect creation
    /// order, so callers append in schedule order.
    async fn next_instance_id(&self, record: &str) -> Result<i64>;

    /// All instances for a record, ordered by instance id.
    async fn all_instances(&self, record: &str) -> Result<BTreeMap<i64, InstanceFields>>;

    async fn delete_instance(&self, record: &str, instance_id: i64) -> Result<i64>;

    /// Every (record, instance id) pair whose open timestamp has passed
    /// and whose status is still actionable, ordered by record then
    /// instance. `now` is the scan's single clock reading.
    async fn due_instances(&self, now: chrono::NaiveDateTime) -> Result<Vec<(String, i64)>>;

    /// All record ids known to the store.
    async fn all_records(&self) -> Result<Vec<String>>;
}

/// Read access to record data. One snapshot per record per invocation;
/// the engine caches it and never refreshes mid-scan.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn record_snapshot(
        &self,
        project_id: u64,
        record: &str,
        events: &[EventId],
    ) -> Result<RecordSnapshot>;
}

/// External boolean-logic evaluator for window trigger rules.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, rule: &str, project_id: u64, record: &str) -> Result<bool>;
}

/// Send-one-message SMS capability.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Send `body` to `to`. Returns the transport's message id.
    async fn send(&self, to: &str, body: &str) -> Result<String>;
}
