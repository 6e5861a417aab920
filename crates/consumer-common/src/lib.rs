use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

/// Business hours as a half-open interval `[start_hour, end_hour)` in a fixed
/// IANA timezone. Hours are wall-clock, 0-23/0-24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 0,
            end_hour: 24,
        }
    }
}

impl BusinessHours {
    pub fn contains(&self, hour: u32) -> bool {
        let hour = hour as u8;
        hour >= self.start_hour && hour < self.end_hour
    }
}

/// One consumer configuration, keyed by queue name in the owning maps.
///
/// `consumer_tag`, `message_count` and `last_payload` are mutated by the
/// engine/pipeline; `webhook_url`, `min_interval_ms`, `max_interval_ms` and
/// `business_hours` are set at `StartConsuming` time and otherwise immutable
/// for the life of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub queue: String,
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub consumer_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub last_payload: Option<serde_json::Value>,
}

impl ConsumerConfig {
    /// The subset persisted to the configuration store.
    pub fn to_persisted(&self, saved_at: DateTime<Utc>) -> PersistedConsumerConfig {
        PersistedConsumerConfig {
            webhook_url: self.webhook_url.clone(),
            min_interval_ms: self.min_interval_ms,
            max_interval_ms: self.max_interval_ms,
            business_hours: self.business_hours,
            saved_at,
        }
    }
}

/// The durable subset of a [`ConsumerConfig`], as stored in the persistence
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConsumerConfig {
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    pub saved_at: DateTime<Utc>,
}

/// Outcome of `ProcessMessage`. Exactly one of `{ack, nack, skip}` is
/// produced per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack { reason: DispositionReason },
    Nack { requeue: bool, reason: DispositionReason },
    Skip { reason: DispositionReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionReason {
    Success,
    Duplicate,
    Cancelled,
    Paused,
    OutsideBusinessHours,
    ParseError,
    WebhookPermanentError,
    WebhookRetry,
    UnexpectedError,
}

impl DispositionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispositionReason::Success => "success",
            DispositionReason::Duplicate => "duplicate",
            DispositionReason::Cancelled => "cancelled",
            DispositionReason::Paused => "paused",
            DispositionReason::OutsideBusinessHours => "outside_business_hours",
            DispositionReason::ParseError => "parse_error",
            DispositionReason::WebhookPermanentError => "webhook_permanent_error",
            DispositionReason::WebhookRetry => "webhook_retry",
            DispositionReason::UnexpectedError => "unexpected_error",
        }
    }
}

/// Validates and sanitises a prospective consumer configuration. Mirrors
/// `ValidateConfig` from the pipeline design: floors `min` at 1000ms, raises
/// `max` to at least `min + 1000`ms, and rejects structurally invalid input.
pub fn validate_and_sanitise(
    webhook_url: &str,
    min_interval_ms: u64,
    max_interval_ms: u64,
    business_hours: BusinessHours,
) -> Result<(u64, u64), ValidationError> {
    if webhook_url.is_empty() {
        return Err(ValidationError::MissingWebhookUrl);
    }
    if !webhook_url.starts_with("http://") && !webhook_url.starts_with("https://") {
        return Err(ValidationError::InvalidWebhookUrl);
    }

    let min = min_interval_ms.max(1000);
    let max = max_interval_ms.max(min + 1000);

    if business_hours.end_hour > 24
        || business_hours.start_hour as u16 >= business_hours.end_hour as u16
    {
        return Err(ValidationError::InvalidBusinessHours);
    }

    Ok((min, max))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("webhook_url is required")]
    MissingWebhookUrl,
    #[error("webhook_url must be an absolute http(s) URL")]
    InvalidWebhookUrl,
    #[error("business_hours must satisfy 0 <= start < end <= 24")]
    InvalidBusinessHours,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_hours_half_open_interval() {
        let hours = BusinessHours {
            start_hour: 8,
            end_hour: 21,
        };
        assert!(!hours.contains(7));
        assert!(hours.contains(8));
        assert!(hours.contains(20));
        assert!(!hours.contains(21));
    }

    #[test]
    fn sanitisation_floors_min_and_raises_max() {
        let (min, max) = validate_and_sanitise(
            "https://example.com/hook",
            100,
            500,
            BusinessHours::default(),
        )
        .unwrap();
        assert_eq!(min, 1000);
        assert_eq!(max, 2000);
    }

    #[test]
    fn rejects_non_http_url() {
        let err = validate_and_sanitise("ftp://example.com", 1000, 2000, BusinessHours::default())
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidWebhookUrl);
    }

    #[test]
    fn rejects_inverted_business_hours() {
        let hours = BusinessHours {
            start_hour: 21,
            end_hour: 8,
        };
        let err =
            validate_and_sanitise("https://example.com", 1000, 2000, hours).unwrap_err();
        assert_eq!(err, ValidationError::InvalidBusinessHours);
    }
}
