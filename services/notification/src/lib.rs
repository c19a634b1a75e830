//! Notification Service
//!
//! Ingests notification records from a Kafka topic and persists them in
//! PostgreSQL, with a paginated read path over the stored records.
//!
//! ## Delivery semantics
//!
//! Each message is handled at most once. Messages that fail to decode or
//! fail to persist are logged and skipped, and their offsets are committed
//! like any other. There is no retry and no dead-letter topic.
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic                                           PostgreSQL
//! ┌──────────────┐    ┌──────────────┐    ┌─────────┐    ┌───────────────┐
//! │ notifications│───▶│ Notification │───▶│ Service │───▶│ notifications │
//! └──────────────┘    │ Consumer     │    └─────────┘    └───────────────┘
//!                     └──────────────┘                          │
//!                            ▲                                  ▼
//!                     CancellationToken                  find_all_by_page
//! ```

pub mod config;
pub mod consumer;
pub mod model;
pub mod service;
pub mod store;

pub use config::{Config, ConfigError, DatabaseConfig, KafkaConfig, SharedConfig};
pub use consumer::{
    ConsumerError, IncomingMessage, KafkaReader, MessageMetadata, MessageReader,
    NotificationConsumer,
};
pub use model::{Notification, NotificationStatus, Page};
pub use service::NotificationService;
pub use store::{NotificationStore, PgNotificationStore, StoreError};
