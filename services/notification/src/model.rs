use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Delivery/lifecycle status of a notification.
///
/// The set of values is owned by the producers, so the token is carried
/// through unchanged rather than parsed into a closed enum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct NotificationStatus(String);

impl NotificationStatus {
    pub const PENDING: &'static str = "PENDING";

    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotificationStatus {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Notification record as published on the stream and stored in `notifications`.
///
/// Missing keys and explicit `null`s decode to their zero value (nil UUID,
/// Unix epoch, empty string).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(default)]
pub struct Notification {
    /// Producer-assigned identifier, primary key in the store
    #[serde(deserialize_with = "null_as_default")]
    pub id: Uuid,
    #[serde(deserialize_with = "null_as_default")]
    pub created_at: DateTime<Utc>,
    /// Zero-valued until the record is first updated
    #[serde(deserialize_with = "null_as_default")]
    pub modified_at: DateTime<Utc>,
    #[serde(deserialize_with = "null_as_default")]
    pub expiration_date: DateTime<Utc>,
    #[serde(deserialize_with = "null_as_default")]
    pub message: String,
    /// Last delivery/processing error text, informational only
    #[serde(deserialize_with = "null_as_default")]
    pub error: String,
    #[serde(deserialize_with = "null_as_default")]
    pub user_uid: String,
    #[serde(deserialize_with = "null_as_default")]
    pub message_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub link: String,
    #[serde(deserialize_with = "null_as_default")]
    pub status: NotificationStatus,
    #[serde(deserialize_with = "null_as_default")]
    pub subject: String,
    #[serde(deserialize_with = "null_as_default")]
    pub created_by: String,
}

impl Notification {
    /// Decode a stream payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Whether `expiration_date` is not before `created_at`.
    ///
    /// Nothing in the ingestion path enforces this.
    pub fn expires_after_creation(&self) -> bool {
        self.expiration_date >= self.created_at
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Offset/limit window for paginated reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 10,
        }
    }
}
