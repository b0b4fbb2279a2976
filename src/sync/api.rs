//! HTTP clients for the booking data source and the reporting destination.
//!
//! The data source serves booking events (`GET events/`) and accepts
//! snapshot events (`POST events/`); the destination accepts per-hotel
//! counters (`POST reservations/`).
//!
//! Both sides sit behind small traits so the sync task can be exercised
//! without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::period::{Period, PeriodType};

/// `rpg_status` of booking events.
pub const BOOKING_STATUS: u32 = 1;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid base URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Returns whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::InvalidUrl { .. } | ApiError::Decode(_) => false,
        }
    }
}

/// A reservation event as listed by the data source. Only the hotel is
/// needed for counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub hotel_id: Value,
}

/// Number of bookings of one hotel in one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationCounter {
    pub hotel_id: Value,
    pub total: usize,
    pub period_type: PeriodType,
    pub period_start: String,
    pub period_end: String,
}

/// A snapshot event as upserted into the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: i64,
    pub hotel_id: i64,
    pub room_id: String,
    /// `%Y-%m-%dT%H:%M:%S%.6fZ`
    pub timestamp: String,
    pub rpg_status: i64,
    /// `%Y-%m-%d`
    pub night_of_stay: String,
}

/// Source of booking events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Lists booking events updated inside `period`.
    async fn list_bookings(&self, period: &Period) -> Result<Vec<Event>, ApiError>;
}

/// Destination of per-hotel counters.
#[async_trait]
pub trait CounterSink: Send + Sync {
    /// Creates or replaces the counter of a hotel and period.
    async fn upsert(&self, counter: &ReservationCounter) -> Result<Value, ApiError>;
}

/// Destination of snapshot events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Creates or replaces one event.
    async fn upsert_event(&self, event: &EventPayload) -> Result<Value, ApiError>;
}

/// JSON API client rooted at a base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    http_client: Client,
}

impl ApiClient {
    /// Creates a client. Paths are resolved against `base_url`, so it
    /// should end with `/`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base = Url::parse(&normalized).map_err(|e| ApiError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Request(e.to_string()))?;

        Ok(Self { base, http_client })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|e| ApiError::InvalidUrl {
            url: format!("{}{}", self.base, path),
            message: e.to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let mut url = self.url(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        self.send(self.http_client.get(url)).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value, ApiError> {
        let url = self.url(path)?;
        self.send(self.http_client.post(url).json(body)).await
    }
}

/// Client of the booking data source (`events/`).
#[derive(Debug, Clone)]
pub struct DatasourceApi {
    client: ApiClient,
}

impl DatasourceApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Query parameters listing bookings updated inside `period`.
    pub fn booking_params(period: &Period) -> Vec<(&'static str, String)> {
        vec![
            ("updated__gte", period.start_param()),
            ("updated__lte", period.end_param()),
            ("rpg_status", BOOKING_STATUS.to_string()),
        ]
    }
}

#[async_trait]
impl EventSource for DatasourceApi {
    async fn list_bookings(&self, period: &Period) -> Result<Vec<Event>, ApiError> {
        let body = self.client.get("events/", &Self::booking_params(period)).await?;
        serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EventSink for DatasourceApi {
    async fn upsert_event(&self, event: &EventPayload) -> Result<Value, ApiError> {
        self.client.post("events/", event).await
    }
}

/// Client of the reporting destination (`reservations/`).
#[derive(Debug, Clone)]
pub struct DestinationApi {
    client: ApiClient,
}

impl DestinationApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterSink for DestinationApi {
    async fn upsert(&self, counter: &ReservationCounter) -> Result<Value, ApiError> {
        self.client.post("reservations/", counter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_booking_params() {
        let period = Period::containing(
            PeriodType::Day,
            Utc.with_ymd_and_hms(2022, 1, 29, 10, 0, 0).unwrap(),
        );
        let params = DatasourceApi::booking_params(&period);
        assert_eq!(
            params,
            vec![
                ("updated__gte", "2022-01-29T00:00:00.000000Z".to_string()),
                ("updated__lte", "2022-01-29T23:59:59.999999Z".to_string()),
                ("rpg_status", "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_client_url_resolution() {
        let client = ApiClient::new("http://source.local/api", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://source.local/api/");
        assert_eq!(
            client.url("events/").unwrap().as_str(),
            "http://source.local/api/events/"
        );

        let err = ApiClient::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ApiError::InvalidUrl { .. }));
    }

    #[test]
    fn test_error_classification() {
        assert!(ApiError::Request("connection refused".into()).is_retryable());
        assert!(ApiError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(ApiError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!ApiError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!ApiError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_counter_serialization() {
        let counter = ReservationCounter {
            hotel_id: json!(42),
            total: 3,
            period_type: PeriodType::Month,
            period_start: "2022-01-01T00:00:00.000000Z".to_string(),
            period_end: "2022-01-31T23:59:59.999999Z".to_string(),
        };
        let value = serde_json::to_value(&counter).unwrap();
        assert_eq!(value["hotel_id"], json!(42));
        assert_eq!(value["period_type"], json!("month"));
    }

    #[tokio::test]
    async fn test_unreachable_source_rejects_event_upsert() {
        let client = ApiClient::new("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        let api = DatasourceApi::new(client);
        let event = EventPayload {
            id: 1,
            hotel_id: 1,
            room_id: "3fa85f64-5717-4562-b3fc-2c963f66afa1".to_string(),
            timestamp: "2024-06-11T14:00:00.000000Z".to_string(),
            rpg_status: 1,
            night_of_stay: "2024-06-12".to_string(),
        };
        let err = api.upsert_event(&event).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_source_is_retryable() {
        // Port 9 (discard) is closed on test hosts.
        let client = ApiClient::new("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        let api = DatasourceApi::new(client);
        let period = Period::containing(PeriodType::Day, Utc::now());
        let err = api.list_bookings(&period).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
