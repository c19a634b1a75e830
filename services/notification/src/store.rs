use crate::config::DatabaseConfig;
use crate::model::{Notification, Page};
use async_trait::async_trait;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store rejected the row, e.g. a duplicate `id`
    #[error("Constraint violation: {0}")]
    ConstraintViolation(#[source] sqlx::Error),

    #[error("Database connectivity error: {0}")]
    Connectivity(#[source] sqlx::Error),

    #[error("Query error: {0}")]
    Query(#[source] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let constraint = matches!(
            &err,
            sqlx::Error::Database(db) if matches!(
                db.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            )
        );
        let connectivity = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );

        if constraint {
            StoreError::ConstraintViolation(err)
        } else if connectivity {
            StoreError::Connectivity(err)
        } else {
            StoreError::Query(err)
        }
    }
}

impl StoreError {
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StoreError::ConstraintViolation(_))
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

/// Storage port for notification records.
///
/// Implementations must be safe to share between tasks without external
/// locking.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert one record. Duplicate ids are rejected, never merged.
    async fn save(&self, notification: &Notification) -> Result<(), StoreError>;

    /// Records ordered by `created_at` descending, skipping `page.offset`
    /// rows and returning at most `page.limit`.
    async fn find_all_by_page(&self, page: Page) -> Result<Vec<Notification>, StoreError>;
}

/// PostgreSQL-backed notification store
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    /// Create the connection pool and verify the database is reachable
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_lazy_with(options);

        let store = Self::from_pool(pool);
        store.ping().await?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Connected to PostgreSQL database"
        );

        Ok(store)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Round trip to the database
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close every connection in the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    #[instrument(skip(self, notification), fields(id = %notification.id))]
    async fn save(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, created_at, modified_at, expiration_date,
                message, error, user_uid, message_type,
                link, status, subject, created_by
            ) VALUES (
                $1, $2, $3, $4,
                $5, $6, $7, $8,
                $9, $10, $11, $12
            )
            "#,
        )
        .bind(notification.id)
        .bind(notification.created_at)
        .bind(notification.modified_at)
        .bind(notification.expiration_date)
        .bind(&notification.message)
        .bind(&notification.error)
        .bind(&notification.user_uid)
        .bind(&notification.message_type)
        .bind(&notification.link)
        .bind(&notification.status)
        .bind(&notification.subject)
        .bind(&notification.created_by)
        .execute(&self.pool)
        .await?;

        debug!("Notification inserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_all_by_page(&self, page: Page) -> Result<Vec<Notification>, StoreError> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, created_at, modified_at, expiration_date,
                   message, error, user_uid, message_type,
                   link, status, subject, created_by
            FROM notifications
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }
}
