//! In-process result store for tests and `memory://` deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{
    CreateOutcome, EventLogEntry, ResultStore, ScheduleState, ScheduleStateStore, StatusCounts,
    StoreError, SyncLogEntry, SyncLogStore,
};
use crate::task::{ResultRecord, Task, TaskId, TaskState, Transition, TransitionUpdate};

#[derive(Debug)]
struct Row {
    task: Task,
    record: ResultRecord,
    enqueued: bool,
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<TaskId, Row>,
    transitions: Vec<Transition>,
    keys: HashMap<String, TaskId>,
    schedule: HashMap<String, ScheduleState>,
    sync_log: Vec<SyncLogEntry>,
    event_log: Vec<EventLogEntry>,
}

impl Inner {
    fn append(&mut self, mut transition: Transition) {
        transition.seq = self.transitions.len() as i64 + 1;
        self.transitions.push(transition);
    }
}

/// Result store backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn create_pending(
        &self,
        task: &Task,
        key_hash: Option<&str>,
    ) -> Result<CreateOutcome, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;

        if let Some(hash) = key_hash {
            if let Some(existing) = inner.keys.get(hash).copied() {
                return Ok(match inner.rows.get(&existing) {
                    Some(row) if !row.enqueued && row.record.status == TaskState::Pending => {
                        CreateOutcome::Stranded(row.task.clone())
                    }
                    _ => CreateOutcome::Duplicate(existing),
                });
            }
            inner.keys.insert(hash.to_string(), task.id);
        }

        let record = ResultRecord::pending(task, Utc::now());
        inner.append(Transition::created(&record));
        inner.rows.insert(
            task.id,
            Row {
                task: task.clone(),
                record: record.clone(),
                enqueued: false,
            },
        );

        Ok(CreateOutcome::Created(record))
    }

    async fn mark_enqueued(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        row.enqueued = true;
        Ok(())
    }

    async fn unenqueued(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;

        let mut rows: Vec<&Row> = inner
            .rows
            .values()
            .filter(|row| {
                !row.enqueued
                    && row.record.status == TaskState::Pending
                    && row.record.created_at <= older_than
            })
            .collect();
        rows.sort_by_key(|row| row.record.created_at);

        Ok(rows.into_iter().take(limit).map(|row| row.task.clone()).collect())
    }

    async fn transition(
        &self,
        task_id: TaskId,
        update: TransitionUpdate,
    ) -> Result<ResultRecord, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;

        let row = inner
            .rows
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        let transition = row.record.apply(&update, Utc::now())?;
        let record = row.record.clone();
        inner.append(transition);

        Ok(record)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<ResultRecord>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .get(&task_id)
            .map(|row| row.record.clone()))
    }

    async fn history(&self, task_id: TaskId) -> Result<Vec<Transition>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .transitions
            .iter()
            .filter(|t| t.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn transitions_since(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<Transition>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        let start = cursor.clamp(0, inner.transitions.len() as i64) as usize;

        Ok(inner.transitions[start..].iter().take(limit).cloned().collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;

        let mut counts = StatusCounts::default();
        for row in inner.rows.values() {
            counts.add(row.record.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ScheduleStateStore for MemoryStore {
    async fn load_schedule_state(&self) -> Result<Vec<ScheduleState>, StoreError> {
        self.check()?;
        let mut states: Vec<_> = self.inner.lock().await.schedule.values().cloned().collect();
        states.sort_by(|a, b| a.entry.cmp(&b.entry));
        Ok(states)
    }

    async fn save_schedule_state(&self, state: &ScheduleState) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .schedule
            .insert(state.entry.clone(), state.clone());
        Ok(())
    }
}

#[async_trait]
impl SyncLogStore for MemoryStore {
    async fn last_successful_sync(
        &self,
        period_type: &str,
    ) -> Result<Option<SyncLogEntry>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .sync_log
            .iter()
            .filter(|e| e.success && e.period_type == period_type)
            .max_by_key(|e| (e.last_sync_at, e.created_at))
            .cloned())
    }

    async fn record_sync(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().await.sync_log.push(entry.clone());
        Ok(())
    }

    async fn last_synced_event_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .event_log
            .iter()
            .filter(|e| e.success)
            .map(|e| e.event_date)
            .max())
    }

    async fn record_event_sync(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().await.event_log.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_transition() {
        let store = MemoryStore::new();
        let task = Task::new("t", json!([]));

        let outcome = store.create_pending(&task, None).await.expect("create");
        assert!(matches!(outcome, CreateOutcome::Created(_)));

        store
            .transition(task.id, TransitionUpdate::started("w"))
            .await
            .expect("start");
        let rec = store
            .transition(task.id, TransitionUpdate::success("w", json!(1)))
            .await
            .expect("success");
        assert_eq!(rec.status, TaskState::Success);

        let history = store.history(task.id).await.expect("history");
        let states: Vec<_> = history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![TaskState::Pending, TaskState::Started, TaskState::Success]
        );
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_terminal_record_rejects_second_final_write() {
        let store = MemoryStore::new();
        let task = Task::new("t", json!([]));
        store.create_pending(&task, None).await.expect("create");
        store
            .transition(task.id, TransitionUpdate::started("w1"))
            .await
            .expect("start");
        store
            .transition(task.id, TransitionUpdate::success("w1", json!("first")))
            .await
            .expect("first final write");

        let err = store
            .transition(task.id, TransitionUpdate::success("w2", json!("second")))
            .await
            .expect_err("second final write");
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        let rec = store.get(task.id).await.expect("get").expect("exists");
        assert_eq!(rec.value, Some(json!("first")));
        assert_eq!(store.history(task.id).await.expect("history").len(), 3);
    }

    #[tokio::test]
    async fn test_idempotency_key() {
        let store = MemoryStore::new();
        let first = Task::new("t", json!([]));
        let second = Task::new("t", json!([]));

        store
            .create_pending(&first, Some("abc"))
            .await
            .expect("create");

        // Never reached the broker yet.
        let outcome = store
            .create_pending(&second, Some("abc"))
            .await
            .expect("stranded");
        assert_eq!(outcome, CreateOutcome::Stranded(first.clone()));

        store.mark_enqueued(first.id).await.expect("mark");
        let outcome = store
            .create_pending(&second, Some("abc"))
            .await
            .expect("duplicate");

        assert_eq!(outcome, CreateOutcome::Duplicate(first.id));
        assert!(store.get(second.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_unenqueued() {
        let store = MemoryStore::new();
        let a = Task::new("a", json!([]));
        let b = Task::new("b", json!([]));
        store.create_pending(&a, None).await.expect("create");
        store.create_pending(&b, None).await.expect("create");
        store.mark_enqueued(a.id).await.expect("mark");

        let stranded = store
            .unenqueued(Utc::now(), 10)
            .await
            .expect("unenqueued");
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].id, b.id);
    }

    #[tokio::test]
    async fn test_transitions_since_cursor() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .create_pending(&Task::new("t", json!([])), None)
                .await
                .expect("create");
        }

        let all = store.transitions_since(0, 100).await.expect("feed");
        assert_eq!(all.len(), 3);

        let rest = store
            .transitions_since(all[0].seq, 100)
            .await
            .expect("feed");
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].seq, all[1].seq);

        let page = store.transitions_since(0, 1).await.expect("feed");
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_state_and_sync_log() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .save_schedule_state(&ScheduleState {
                entry: "nightly".to_string(),
                trigger: "cron '0 0 1 * * *'".to_string(),
                last_run_at: None,
                next_run_at: now,
            })
            .await
            .expect("save");
        let states = store.load_schedule_state().await.expect("load");
        assert_eq!(states.len(), 1);

        let entry = |success: bool, days: i64| SyncLogEntry {
            period_type: "day".to_string(),
            last_sync_at: now + chrono::Duration::days(days),
            period_start: now,
            period_end: now,
            success,
            created_at: now,
        };
        store.record_sync(&entry(true, 0)).await.expect("record");
        store.record_sync(&entry(false, 5)).await.expect("record");
        store.record_sync(&entry(true, 1)).await.expect("record");

        let last = store
            .last_successful_sync("day")
            .await
            .expect("query")
            .expect("found");
        assert_eq!(last.last_sync_at, now + chrono::Duration::days(1));
        assert!(store
            .last_successful_sync("month")
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn test_event_log_ignores_failures() {
        let store = MemoryStore::new();
        assert!(store.last_synced_event_date().await.expect("query").is_none());

        let day = |d: u32| NaiveDate::from_ymd_opt(2024, 6, d).expect("date");
        for (date, success) in [(day(11), true), (day(13), false), (day(12), true)] {
            store
                .record_event_sync(&EventLogEntry {
                    event_date: date,
                    success,
                    created_at: Utc::now(),
                })
                .await
                .expect("record");
        }

        assert_eq!(store.last_synced_event_date().await.expect("query"), Some(day(12)));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.ping().await.expect_err("down");
        assert!(matches!(err, StoreError::Unavailable));
    }
}
