//! Snapshot event synchronisation.
//!
//! `sync.events` replays a CSV snapshot of booking events into the data
//! source, one event day per run. The event log records which days went
//! through, so each run pushes the day after the last synchronised one.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::api::{ApiClient, DatasourceApi, EventPayload, EventSink};
use super::period::format_api_timestamp;
use super::SyncError;
use crate::config::EngineConfig;
use crate::registry::{TaskContext, TaskError, TaskRegistry};
use crate::store::{EventLogEntry, SyncLogStore};

/// Registered name of the snapshot event sync task.
pub const SYNC_EVENTS: &str = "sync.events";

/// One row of the snapshot CSV.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotEvent {
    pub id: i64,
    pub hotel_id: i64,
    pub room_reservation_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub night_of_stay: NaiveDate,
    pub status: i64,
}

impl SnapshotEvent {
    pub fn event_date(&self) -> NaiveDate {
        self.event_timestamp.date_naive()
    }

    pub fn to_payload(&self) -> EventPayload {
        EventPayload {
            id: self.id,
            hotel_id: self.hotel_id,
            room_id: self.room_reservation_id.clone(),
            timestamp: format_api_timestamp(self.event_timestamp),
            rpg_status: self.status,
            night_of_stay: self.night_of_stay.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Parses a snapshot with a header row, oldest event first.
pub fn parse_snapshot<R: Read>(input: R) -> Result<Vec<SnapshotEvent>, SyncError> {
    let mut reader = csv::Reader::from_reader(input);
    let mut events = reader
        .deserialize()
        .collect::<Result<Vec<SnapshotEvent>, csv::Error>>()
        .map_err(|e| SyncError::Snapshot(e.to_string()))?;
    events.sort_by_key(|e| e.event_timestamp);
    Ok(events)
}

pub async fn load_snapshot(path: &Path) -> Result<Vec<SnapshotEvent>, SyncError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| SyncError::Snapshot(format!("{}: {}", path.display(), e)))?;
    parse_snapshot(bytes.as_slice())
}

/// Event day to push next, given events sorted by timestamp.
///
/// Returns `None` once the last synchronised day is the last day of the
/// snapshot. A last day the snapshot does not contain is an error.
pub fn next_event_date(
    events: &[SnapshotEvent],
    last_synced: Option<NaiveDate>,
) -> Result<Option<NaiveDate>, SyncError> {
    let mut dates: Vec<NaiveDate> = events.iter().map(SnapshotEvent::event_date).collect();
    dates.dedup();

    let Some(last) = last_synced else {
        return Ok(dates.first().copied());
    };
    let idx = dates
        .iter()
        .position(|d| *d == last)
        .ok_or(SyncError::UnknownEventDate(last))?;
    Ok(dates.get(idx + 1).copied())
}

/// Result returned by an event sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSyncSummary {
    /// `None` when every day of the snapshot was already pushed.
    pub event_date: Option<NaiveDate>,
    pub events: usize,
}

/// Dependencies of the event sync task.
pub struct EventSyncContext {
    pub snapshot: PathBuf,
    pub sink: Arc<dyn EventSink>,
    pub log: Arc<dyn SyncLogStore>,
}

impl EventSyncContext {
    /// Builds the data-source client from `TASKBEAT_DATASOURCE_URL`.
    pub fn from_config(
        config: &EngineConfig,
        log: Arc<dyn SyncLogStore>,
    ) -> Result<Self, SyncError> {
        let source_url = config
            .datasource_url
            .as_deref()
            .ok_or(SyncError::NotConfigured("TASKBEAT_DATASOURCE_URL"))?;

        Ok(Self {
            snapshot: config.events_snapshot.clone(),
            sink: Arc::new(DatasourceApi::new(ApiClient::new(
                source_url,
                config.http_timeout,
            )?)),
            log,
        })
    }

    /// Pushes the events of the next unsynchronised day.
    pub async fn synchronize(&self) -> Result<EventSyncSummary, SyncError> {
        info!(snapshot = %self.snapshot.display(), "Loading snapshot events");
        let events = load_snapshot(&self.snapshot).await?;

        let last = self.log.last_synced_event_date().await?;
        let Some(date) = next_event_date(&events, last)? else {
            info!("Every snapshot day is synchronised");
            return Ok(EventSyncSummary {
                event_date: None,
                events: 0,
            });
        };

        let payloads: Vec<EventPayload> = events
            .iter()
            .filter(|e| e.event_date() == date)
            .map(SnapshotEvent::to_payload)
            .collect();

        info!(event_date = %date, events = payloads.len(), "Pushing snapshot events");
        for payload in &payloads {
            if let Err(e) = self.sink.upsert_event(payload).await {
                self.record(date, false).await;
                return Err(e.into());
            }
        }

        self.log
            .record_event_sync(&EventLogEntry {
                event_date: date,
                success: true,
                created_at: Utc::now(),
            })
            .await?;

        Ok(EventSyncSummary {
            event_date: Some(date),
            events: payloads.len(),
        })
    }

    async fn record(&self, event_date: NaiveDate, success: bool) {
        let entry = EventLogEntry {
            event_date,
            success,
            created_at: Utc::now(),
        };
        if let Err(e) = self.log.record_event_sync(&entry).await {
            warn!(error = %e, "Failed to record event sync attempt");
        }
    }
}

/// Registers the snapshot event sync task.
pub fn register_events(registry: &mut TaskRegistry, ctx: Arc<EventSyncContext>) {
    registry.register_fn(SYNC_EVENTS, move |task: TaskContext| {
        let ctx = Arc::clone(&ctx);
        async move {
            task.check_cancelled()?;
            let summary = ctx.synchronize().await.map_err(TaskError::from)?;
            serde_json::to_value(summary).map_err(TaskError::fatal)
        }
    });
}
