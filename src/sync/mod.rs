//! Reservation synchronisation tasks.
//!
//! `sync.reservations` counts booking events per hotel over a day, month or
//! year window taken from the data-source API and upserts one counter per
//! hotel into the destination API. Each successful run is appended to the
//! sync log so that runs without an explicit timestamp resume from the day
//! after the last synchronised one.
//!
//! ```text
//! args {"period": "day"}  ──▶ sync log ──▶ window ──▶ GET events/
//!                                                        │ count per hotel
//!                                                        ▼
//!                          sync log ◀── success ◀── POST reservations/
//! ```
//!
//! `sync.events` replays a CSV snapshot into the data source one event day
//! per run; see [`events`].

pub mod api;
pub mod events;
pub mod period;
mod tasks;

pub use api::{
    ApiClient, ApiError, CounterSink, DatasourceApi, DestinationApi, Event, EventPayload,
    EventSink, EventSource, ReservationCounter,
};
pub use events::{
    register_events, EventSyncContext, EventSyncSummary, SnapshotEvent, SYNC_EVENTS,
};
pub use period::{Period, PeriodType};
pub use tasks::{count_by_hotel, register, SyncArgs, SyncContext, SyncSummary, SYNC_RESERVATIONS};

use std::sync::Arc;

use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::Transient;
use crate::registry::TaskError;
use crate::store::{StoreError, SyncLogStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Sync log error: {0}")]
    Store(#[from] StoreError),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Last synchronized date {0} is not found in the snapshot")]
    UnknownEventDate(chrono::NaiveDate),
}

impl From<SyncError> for TaskError {
    fn from(err: SyncError) -> Self {
        let retryable = match &err {
            SyncError::NotConfigured(_)
            | SyncError::Snapshot(_)
            | SyncError::UnknownEventDate(_) => false,
            SyncError::Api(e) => e.is_retryable(),
            SyncError::Store(e) => e.is_transient(),
        };
        if retryable {
            TaskError::retryable(err)
        } else {
            TaskError::fatal(err)
        }
    }
}

impl SyncContext {
    /// Builds HTTP clients from `TASKBEAT_DATASOURCE_URL` and
    /// `TASKBEAT_DESTINATION_URL`.
    pub fn from_config(
        config: &EngineConfig,
        log: Arc<dyn SyncLogStore>,
    ) -> Result<Self, SyncError> {
        let source_url = config
            .datasource_url
            .as_deref()
            .ok_or(SyncError::NotConfigured("TASKBEAT_DATASOURCE_URL"))?;
        let destination_url = config
            .destination_url
            .as_deref()
            .ok_or(SyncError::NotConfigured("TASKBEAT_DESTINATION_URL"))?;

        Ok(Self {
            source: Arc::new(DatasourceApi::new(ApiClient::new(
                source_url,
                config.http_timeout,
            )?)),
            sink: Arc::new(DestinationApi::new(ApiClient::new(
                destination_url,
                config.http_timeout,
            )?)),
            log,
            start_date: config.sync_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_from_config_requires_urls() {
        let log = Arc::new(MemoryStore::new());
        let err = SyncContext::from_config(&EngineConfig::default(), log.clone())
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::NotConfigured("TASKBEAT_DATASOURCE_URL")));

        let mut config = EngineConfig::default();
        config.datasource_url = Some("http://source.local/api/".to_string());
        config.destination_url = Some("http://dest.local/api/".to_string());
        let ctx = SyncContext::from_config(&config, log).unwrap();
        assert_eq!(ctx.start_date, config.sync_start);
    }

    #[test]
    fn test_task_error_conversion() {
        let err: TaskError = SyncError::Store(StoreError::Unavailable).into();
        assert!(err.is_retryable());

        let err: TaskError = SyncError::NotConfigured("TASKBEAT_DATASOURCE_URL").into();
        assert!(!err.is_retryable());

        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let err: TaskError = SyncError::UnknownEventDate(day).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_event_sync_needs_only_datasource() {
        let log = Arc::new(MemoryStore::new());
        let mut config = EngineConfig::default();
        assert!(EventSyncContext::from_config(&config, log.clone()).is_err());

        config.datasource_url = Some("http://source.local/api/".to_string());
        let ctx = EventSyncContext::from_config(&config, log).unwrap();
        assert_eq!(ctx.snapshot, config.events_snapshot);
    }
}
