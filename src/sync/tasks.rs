use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::api::{CounterSink, Event, EventSource, ReservationCounter};
use super::period::{format_api_timestamp, start_of_day, Period, PeriodType};
use super::SyncError;
use crate::registry::{TaskContext, TaskError, TaskRegistry};
use crate::store::{SyncLogEntry, SyncLogStore};

/// Registered name of the reservation sync task.
pub const SYNC_RESERVATIONS: &str = "sync.reservations";

#[derive(Debug, Clone, Deserialize)]
pub struct SyncArgs {
    pub period: PeriodType,
    /// Day to synchronise. Resumes from the sync log when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Result returned by a reservation sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub period_type: PeriodType,
    pub timestamp: String,
    pub period_start: String,
    pub period_end: String,
    pub events: usize,
    pub hotels: usize,
    /// The window has not started yet; nothing was synchronised.
    #[serde(default)]
    pub skipped: bool,
}

/// Dependencies of the sync tasks.
pub struct SyncContext {
    pub source: Arc<dyn EventSource>,
    pub sink: Arc<dyn CounterSink>,
    pub log: Arc<dyn SyncLogStore>,
    /// First day synchronised when the log is empty.
    pub start_date: NaiveDate,
}

impl SyncContext {
    /// Day to synchronise next: the day after the last successful sync of
    /// `period`, or the configured start date.
    pub async fn next_timestamp(&self, period: PeriodType) -> Result<DateTime<Utc>, SyncError> {
        let last = self.log.last_successful_sync(period.as_str()).await?;
        Ok(match last {
            Some(entry) => {
                let day = entry.last_sync_at.date_naive();
                start_of_day(day.succ_opt().unwrap_or(day))
            }
            None => start_of_day(self.start_date),
        })
    }

    /// Counts the bookings of the window containing `timestamp` per hotel
    /// and pushes one counter per hotel.
    pub async fn synchronize(&self, args: SyncArgs) -> Result<SyncSummary, SyncError> {
        let timestamp = match args.timestamp {
            Some(ts) => ts,
            None => self.next_timestamp(args.period).await?,
        };
        let period = Period::containing(args.period, timestamp);
        let mut summary = SyncSummary {
            period_type: args.period,
            timestamp: format_api_timestamp(timestamp),
            period_start: period.start_param(),
            period_end: period.end_param(),
            events: 0,
            hotels: 0,
            skipped: false,
        };

        if timestamp > Utc::now() {
            info!(period = %args.period, timestamp = %summary.timestamp, "Sync window not reached yet");
            summary.skipped = true;
            return Ok(summary);
        }

        info!(
            period = %args.period,
            from = %summary.period_start,
            until = %summary.period_end,
            "Fetching booking events"
        );
        let events = self.source.list_bookings(&period).await?;
        let counters = count_by_hotel(&events, &period);
        summary.events = events.len();
        summary.hotels = counters.len();

        info!(hotels = counters.len(), events = events.len(), "Pushing reservation counters");
        for counter in &counters {
            if let Err(e) = self.sink.upsert(counter).await {
                self.record(timestamp, &period, false).await;
                return Err(e.into());
            }
        }

        self.log
            .record_sync(&SyncLogEntry {
                period_type: args.period.as_str().to_string(),
                last_sync_at: timestamp,
                period_start: period.start,
                period_end: period.end,
                success: true,
                created_at: Utc::now(),
            })
            .await?;

        Ok(summary)
    }

    async fn record(&self, timestamp: DateTime<Utc>, period: &Period, success: bool) {
        let entry = SyncLogEntry {
            period_type: period.kind.as_str().to_string(),
            last_sync_at: timestamp,
            period_start: period.start,
            period_end: period.end,
            success,
            created_at: Utc::now(),
        };
        if let Err(e) = self.log.record_sync(&entry).await {
            warn!(error = %e, "Failed to record sync attempt");
        }
    }
}

/// Groups events by hotel, in hotel order.
pub fn count_by_hotel(events: &[Event], period: &Period) -> Vec<ReservationCounter> {
    let mut counts: BTreeMap<String, (Value, usize)> = BTreeMap::new();
    for event in events {
        counts
            .entry(event.hotel_id.to_string())
            .or_insert_with(|| (event.hotel_id.clone(), 0))
            .1 += 1;
    }

    counts
        .into_values()
        .map(|(hotel_id, total)| ReservationCounter {
            hotel_id,
            total,
            period_type: period.kind,
            period_start: period.start_param(),
            period_end: period.end_param(),
        })
        .collect()
}

/// Registers the sync tasks.
pub fn register(registry: &mut TaskRegistry, ctx: Arc<SyncContext>) {
    registry.register_fn(SYNC_RESERVATIONS, move |task: TaskContext| {
        let ctx = Arc::clone(&ctx);
        async move {
            let args: SyncArgs = task.parse_args()?;
            task.check_cancelled()?;
            let summary = ctx.synchronize(args).await.map_err(TaskError::from)?;
            serde_json::to_value(summary).map_err(TaskError::fatal)
        }
    });
}
