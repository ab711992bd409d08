//! SQLite-backed Form Repository and Record Store.
//!
//! Instance field maps are stored as JSON with the open timestamp and
//! status mirrored into indexed columns so the due-instance query stays a
//! single SELECT. Record data is a flat (record, event, field) → value
//! table.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use ema_core::error::{EmaError, Result};
use ema_core::instance::{PromptStatus, TERMINAL_THRESHOLD};
use ema_core::project::{EventId, RecordSnapshot};
use ema_core::traits::{FormRepository, InstanceFields, RecordStore};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite store for prompt instances and record data.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| EmaError::Persistence(format!("create {}: {e}", dir.display())))?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| EmaError::Persistence(format!("db open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| EmaError::Persistence(format!("db open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            -- One row per prompt occurrence; fields is the full JSON map
            CREATE TABLE IF NOT EXISTS prompt_instances (
                record TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                fields TEXT NOT NULL,
                open_ts TEXT,
                status INTEGER,
                PRIMARY KEY (record, instance_id)
            );

            -- Flat record data: one value per (record, event, field)
            CREATE TABLE IF NOT EXISTS record_data (
                record TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (record, event_id, field)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_due
                ON prompt_instances (status, open_ts);
            ",
            )
            .map_err(|e| EmaError::Persistence(format!("migration: {e}")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| EmaError::Persistence("database lock poisoned".into()))
    }

    /// Write one field of one record's data, the collaborator-facing side
    /// of a record save.
    pub fn set_record_field(
        &self,
        record: &str,
        event_id: EventId,
        field: &str,
        value: &str,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO record_data (record, event_id, field, value)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![record, event_id as i64, field, value],
            )
            .map_err(|e| EmaError::Persistence(format!("set field: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl FormRepository for SqliteStore {
    async fn get_instance(&self, record: &str, instance_id: i64) -> Result<Option<InstanceFields>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT fields FROM prompt_instances WHERE record = ?1 AND instance_id = ?2")
            .map_err(|e| EmaError::Persistence(format!("get instance: {e}")))?;
        let json: Option<String> =
            match stmt.query_row(rusqlite::params![record, instance_id], |row| row.get(0)) {
                Ok(json) => Some(json),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(EmaError::Persistence(format!("get instance: {e}"))),
            };
        match json {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| EmaError::Persistence(format!("decode instance fields: {e}"))),
        }
    }

    async fn save_instance(
        &self,
        record: &str,
        instance_id: i64,
        fields: &InstanceFields,
    ) -> Result<()> {
        let json = serde_json::to_string(fields)
            .map_err(|e| EmaError::Persistence(format!("encode instance fields: {e}")))?;
        let open_ts = fields.get("ema_open_ts").cloned();
        let status: Option<i64> = fields
            .get("ema_status")
            .and_then(|v| v.parse().ok());
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO prompt_instances
                 (record, instance_id, fields, open_ts, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![record, instance_id, json, open_ts, status],
            )
            .map_err(|e| EmaError::Persistence(format!("save instance: {e}")))?;
        Ok(())
    }

    async fn update_instance_if_status(
        &self,
        record: &str,
        instance_id: i64,
        fields: &InstanceFields,
        expected_status: u16,
    ) -> Result<bool> {
        let json = serde_json::to_string(fields)
            .map_err(|e| EmaError::Persistence(format!("encode instance fields: {e}")))?;
        let open_ts = fields.get("ema_open_ts").cloned();
        let status: Option<i64> = fields
            .get("ema_status")
            .and_then(|v| v.parse().ok());
        let updated = self
            .lock()?
            .execute(
                "UPDATE prompt_instances
                 SET fields = ?3, open_ts = ?4, status = ?5
                 WHERE record = ?1 AND instance_id = ?2 AND status = ?6",
                rusqlite::params![
                    record,
                    instance_id,
                    json,
                    open_ts,
                    status,
                    i64::from(expected_status),
                ],
            )
            .map_err(|e| EmaError::Persistence(format!("update instance: {e}")))?;
        Ok(updated > 0)
    }

    async fn next_instance_id(&self, record: &str) -> Result<i64> {
        let conn = self.lock()?;
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(instance_id) FROM prompt_instances WHERE record = ?1",
                rusqlite::params![record],
                |row| row.get(0),
            )
            .map_err(|e| EmaError::Persistence(format!("next instance id: {e}")))?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn all_instances(&self, record: &str) -> Result<BTreeMap<i64, InstanceFields>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT instance_id, fields FROM prompt_instances
                 WHERE record = ?1 ORDER BY instance_id",
            )
            .map_err(|e| EmaError::Persistence(format!("all instances: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![record], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| EmaError::Persistence(format!("all instances: {e}")))?;

        let mut instances = BTreeMap::new();
        for row in rows {
            let (id, json) = row.map_err(|e| EmaError::Persistence(format!("row: {e}")))?;
            let fields: InstanceFields = serde_json::from_str(&json)
                .map_err(|e| EmaError::Persistence(format!("decode instance {id}: {e}")))?;
            instances.insert(id, fields);
        }
        Ok(instances)
    }

    async fn delete_instance(&self, record: &str, instance_id: i64) -> Result<i64> {
        self.lock()?
            .execute(
                "DELETE FROM prompt_instances WHERE record = ?1 AND instance_id = ?2",
                rusqlite::params![record, instance_id],
            )
            .map_err(|e| EmaError::Persistence(format!("delete instance: {e}")))?;
        Ok(instance_id)
    }

    async fn due_instances(&self, now: NaiveDateTime) -> Result<Vec<(String, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                // SendError sits above the terminal threshold but stays
                // actionable so failed sends are retried.
                "SELECT record, instance_id FROM prompt_instances
                 WHERE open_ts IS NOT NULL AND open_ts <= ?1
                   AND (status < ?2 OR status = ?3)
                 ORDER BY record, instance_id",
            )
            .map_err(|e| EmaError::Persistence(format!("due instances: {e}")))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    now.format(TS_FORMAT).to_string(),
                    i64::from(TERMINAL_THRESHOLD),
                    i64::from(PromptStatus::SendError.code()),
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(|e| EmaError::Persistence(format!("due instances: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EmaError::Persistence(format!("due instances: {e}")))
    }

    async fn all_records(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT record FROM prompt_instances ORDER BY record")
            .map_err(|e| EmaError::Persistence(format!("all records: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| EmaError::Persistence(format!("all records: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EmaError::Persistence(format!("all records: {e}")))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn record_snapshot(
        &self,
        _project_id: u64,
        record: &str,
        events: &[EventId],
    ) -> Result<RecordSnapshot> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT event_id, field, value FROM record_data WHERE record = ?1")
            .map_err(|e| EmaError::Persistence(format!("snapshot: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![record], |row| {
                Ok((
                    row.get::<_, i64>(0)? as EventId,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| EmaError::Persistence(format!("snapshot: {e}")))?;

        let mut snapshot: RecordSnapshot = HashMap::new();
        for row in rows {
            let (event_id, field, value) =
                row.map_err(|e| EmaError::Persistence(format!("snapshot row: {e}")))?;
            if !events.is_empty() && !events.contains(&event_id) {
                continue;
            }
            snapshot.entry(event_id).or_default().insert(field, value);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ema_core::instance::PromptInstance;

    fn instance(status: PromptStatus, open: &str) -> InstanceFields {
        PromptInstance {
            window_name: "w".into(),
            day_offset: 1,
            sequence: 1,
            offset_minutes: 0,
            open_minute: 480,
            open_ts: NaiveDateTime::parse_from_str(open, TS_FORMAT).unwrap(),
            status,
            retry_target: None,
            log: String::new(),
            complete: false,
        }
        .to_fields()
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fields = instance(PromptStatus::Scheduled, "2024-01-02 08:00:00");
        store.save_instance("1001", 1, &fields).await.unwrap();

        let loaded = store.get_instance("1001", 1).await.unwrap().unwrap();
        assert_eq!(loaded, fields);
        assert!(store.get_instance("1001", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_instance_id_counts_up() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.next_instance_id("1001").await.unwrap(), 1);
        store
            .save_instance("1001", 1, &instance(PromptStatus::Scheduled, "2024-01-02 08:00:00"))
            .await
            .unwrap();
        assert_eq!(store.next_instance_id("1001").await.unwrap(), 2);
        // Independent per record
        assert_eq!(store.next_instance_id("1002").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_query_filters_status_and_time() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_instance("1001", 1, &instance(PromptStatus::Scheduled, "2024-01-02 08:00:00"))
            .await
            .unwrap();
        store
            .save_instance("1001", 2, &instance(PromptStatus::Completed, "2024-01-02 08:00:00"))
            .await
            .unwrap();
        store
            .save_instance("1001", 3, &instance(PromptStatus::SendError, "2024-01-02 08:00:00"))
            .await
            .unwrap();
        store
            .save_instance("1001", 4, &instance(PromptStatus::Scheduled, "2024-01-02 20:00:00"))
            .await
            .unwrap();
        store
            .save_instance("0999", 1, &instance(PromptStatus::Scheduled, "2024-01-02 08:00:00"))
            .await
            .unwrap();

        let now = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let due = store.due_instances(now).await.unwrap();
        // Terminal and future instances excluded; SendError retried;
        // ordered record then instance
        assert_eq!(
            due,
            vec![("0999".to_string(), 1), ("1001".to_string(), 1), ("1001".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_conditional_update_requires_expected_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_instance("1001", 1, &instance(PromptStatus::NotificationSent, "2024-01-02 08:00:00"))
            .await
            .unwrap();

        // Stale expectation: store moved on to Completed in the meantime
        store
            .save_instance("1001", 1, &instance(PromptStatus::Completed, "2024-01-02 08:00:00"))
            .await
            .unwrap();
        let stale = instance(PromptStatus::Reminder1Sent, "2024-01-02 08:00:00");
        let written = store
            .update_instance_if_status("1001", 1, &stale, PromptStatus::NotificationSent.code())
            .await
            .unwrap();
        assert!(!written);
        let fields = store.get_instance("1001", 1).await.unwrap().unwrap();
        assert_eq!(fields["ema_status"], PromptStatus::Completed.code().to_string());

        // Matching expectation goes through
        let next = instance(PromptStatus::AccessAfterClose, "2024-01-02 08:00:00");
        let written = store
            .update_instance_if_status("1001", 1, &next, PromptStatus::Completed.code())
            .await
            .unwrap();
        assert!(written);
    }

    #[tokio::test]
    async fn test_record_snapshot_event_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_record_field("1001", 1, "cell_phone", "6505551212").unwrap();
        store.set_record_field("1001", 2, "opt_out", "1").unwrap();

        let all = store.record_snapshot(0, "1001", &[]).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store.record_snapshot(0, "1001", &[1]).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[&1]["cell_phone"], "6505551212");
    }

    #[tokio::test]
    async fn test_delete_instance() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_instance("1001", 1, &instance(PromptStatus::Scheduled, "2024-01-02 08:00:00"))
            .await
            .unwrap();
        store.delete_instance("1001", 1).await.unwrap();
        assert!(store.all_instances("1001").await.unwrap().is_empty());
    }
}
