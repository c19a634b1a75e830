use anyhow::{bail, Context, Result};
use notification_service::config::{Config, LogFormat, ServiceConfig, SharedConfig};
use notification_service::{
    ConsumerError, MessageReader, NotificationConsumer, NotificationService, Page,
    PgNotificationStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

type ConsumerTask<R> = JoinHandle<(NotificationConsumer<R>, Result<(), ConsumerError>)>;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    let filter = init_tracing(&config.service);

    let shared = Arc::new(SharedConfig::new(config));

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("consume");

    match mode {
        "consume" => {
            shared
                .snapshot()
                .validate()
                .context("Invalid configuration")?;
            run_consumer(shared, filter).await
        }
        "list" => {
            let offset = parse_arg(&args, 2, 0)?;
            let limit = parse_arg(&args, 3, 10)?;
            let config = shared.snapshot();
            config
                .database
                .validate()
                .context("Invalid database configuration")?;
            run_list(&config, Page::new(offset, limit)).await
        }
        _ => {
            println!("Usage: notification-service [consume|list [offset] [limit]]");
            println!();
            println!("Modes:");
            println!("  consume - Persist notifications from Kafka until SIGINT/SIGTERM (default)");
            println!("  list    - Print stored notifications, newest first");
            println!();
            println!("Send SIGHUP to reload configuration.");
            Ok(())
        }
    }
}

/// Consume from Kafka until a shutdown signal or a transport failure
async fn run_consumer(shared: Arc<SharedConfig>, filter: FilterHandle) -> Result<()> {
    let config = shared.snapshot();

    info!(
        service = %config.service.name,
        topic = %config.kafka.topic,
        group = %config.kafka.group_id,
        "Starting notification service"
    );

    let store = PgNotificationStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;

    // Schema must be in place before anything reads or writes
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let service = Arc::new(NotificationService::new(Arc::new(store.clone())));

    let consumer = NotificationConsumer::from_config(&config.kafka, service)
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        let result = consumer.run(consumer_shutdown.clone()).await;
        // Wake the main task if the consumer stopped on its own
        consumer_shutdown.cancel();
        (consumer, result)
    });

    info!("Notification service started");

    let mut signals = Signals::new()?;
    loop {
        tokio::select! {
            event = signals.next() => match event {
                SignalEvent::Shutdown(name) => {
                    info!(signal = name, "Received shutdown signal");
                    break;
                }
                SignalEvent::Reload => reload_config(&shared, &filter),
            },
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Shutting down notification service");
    shutdown.cancel();

    finish_consumer(consumer_handle, &store).await
}

/// Wait for the consumer task, then release the reader and the pool.
///
/// The pool is closed even when the task panicked.
async fn finish_consumer<R: MessageReader>(
    handle: ConsumerTask<R>,
    store: &PgNotificationStore,
) -> Result<()> {
    let (consumer, result) = match handle.await {
        Ok(joined) => joined,
        Err(e) => {
            store.close().await;
            return Err(e).context("Consumer task failed");
        }
    };
    consumer.close();
    store.close().await;

    match result {
        Err(e) if !e.is_cancelled() => {
            error!(error = %e, "Kafka consumer stopped");
            Err(e).context("Kafka consumer failed")
        }
        _ => {
            info!("Notification service stopped");
            Ok(())
        }
    }
}

/// Print one page of stored notifications as JSON lines
async fn run_list(config: &Config, page: Page) -> Result<()> {
    let store = PgNotificationStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let service = NotificationService::new(Arc::new(store.clone()));

    let notifications = service
        .list_notifications(page)
        .await
        .context("Failed to list notifications")?;

    for notification in &notifications {
        println!("{}", serde_json::to_string(notification)?);
    }

    info!(
        count = notifications.len(),
        offset = page.offset,
        limit = page.limit,
        "Listed notifications"
    );

    store.close().await;
    Ok(())
}

fn parse_arg(args: &[String], index: usize, default: i64) -> Result<i64> {
    match args.get(index) {
        Some(value) => {
            let parsed: i64 = value
                .parse()
                .with_context(|| format!("Invalid number: {value}"))?;
            if parsed < 0 {
                bail!("Expected a non-negative number, got {parsed}");
            }
            Ok(parsed)
        }
        None => Ok(default),
    }
}

/// Apply a freshly loaded configuration.
///
/// Only the log filter changes at runtime; Kafka and database settings are
/// bound at startup.
fn reload_config(shared: &SharedConfig, filter: &FilterHandle) {
    let previous = match shared.reload() {
        Ok(previous) => previous,
        Err(e) => {
            warn!(error = %e, "Failed to reload configuration, keeping current");
            return;
        }
    };
    let current = shared.snapshot();

    if let Err(e) = filter.reload(log_filter(&current.service)) {
        warn!(error = %e, "Failed to apply log level");
    }

    if previous.kafka != current.kafka || previous.database != current.database {
        warn!("Kafka or database settings changed; restart to apply them");
    }

    info!(log_level = %current.service.log_level, "Configuration reloaded");
}

/// Filter directive: `RUST_LOG` when set, the configured level otherwise
fn filter_directive(rust_log: Option<String>, service: &ServiceConfig) -> String {
    rust_log
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| service.log_level.clone())
}

fn log_filter(service: &ServiceConfig) -> EnvFilter {
    let directive = filter_directive(std::env::var(EnvFilter::DEFAULT_ENV).ok(), service);
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(&service.log_level))
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) -> FilterHandle {
    let (filter, handle) = reload::Layer::new(log_filter(service));

    let json = (service.log_format == LogFormat::Json).then(|| fmt::layer().json());
    let pretty = (service.log_format == LogFormat::Pretty).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();

    handle
}

enum SignalEvent {
    Shutdown(&'static str),
    Reload,
}

/// Process signals: SIGINT/SIGTERM request shutdown, SIGHUP requests reload
struct Signals {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
    #[cfg(unix)]
    hangup: signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn next(&mut self) -> SignalEvent {
        tokio::select! {
            _ = signal::ctrl_c() => SignalEvent::Shutdown("SIGINT"),
            _ = self.terminate.recv() => SignalEvent::Shutdown("SIGTERM"),
            _ = self.hangup.recv() => SignalEvent::Reload,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> SignalEvent {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        SignalEvent::Shutdown("ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notification_service::{IncomingMessage, MessageMetadata};
    use sqlx::postgres::PgPoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Reader that never delivers and records whether it was closed
    struct IdleReader {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageReader for IdleReader {
        async fn read_message(&self) -> Result<IncomingMessage, ConsumerError> {
            futures::future::pending().await
        }

        fn mark_processed(&self, _metadata: &MessageMetadata) -> Result<(), ConsumerError> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Store over a pool that has not opened any connection yet
    fn lazy_store() -> PgNotificationStore {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@127.0.0.1:1/postgres")
            .unwrap();
        PgNotificationStore::from_pool(pool)
    }

    #[tokio::test]
    async fn test_finish_consumer_closes_everything_after_cancel() {
        let store = lazy_store();
        let closed = Arc::new(AtomicBool::new(false));
        let service = Arc::new(NotificationService::new(Arc::new(store.clone())));
        let consumer = NotificationConsumer::new(
            IdleReader {
                closed: closed.clone(),
            },
            service,
        );

        let handle: ConsumerTask<IdleReader> =
            tokio::spawn(async move { (consumer, Err(ConsumerError::Cancelled)) });

        finish_consumer(handle, &store).await.unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert!(store.ping().await.unwrap_err().is_connectivity());
    }

    #[tokio::test]
    async fn test_finish_consumer_closes_pool_when_task_panics() {
        let store = lazy_store();

        let handle: ConsumerTask<IdleReader> =
            tokio::spawn(async { panic!("consumer task panicked") });

        let err = finish_consumer(handle, &store).await.unwrap_err();
        assert!(err.to_string().contains("Consumer task failed"));

        // Pool is closed, so no connection is attempted
        assert!(store.ping().await.unwrap_err().is_connectivity());
    }

    #[test]
    fn test_filter_directive_prefers_rust_log() {
        let service = ServiceConfig {
            log_level: "info".to_string(),
            ..ServiceConfig::default()
        };

        assert_eq!(
            filter_directive(Some("debug,sqlx=warn".to_string()), &service),
            "debug,sqlx=warn"
        );
        assert_eq!(filter_directive(None, &service), "info");
        assert_eq!(filter_directive(Some(" ".to_string()), &service), "info");
    }

    #[test]
    fn test_parse_arg() {
        let args: Vec<String> = ["notification-service", "list", "20"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(parse_arg(&args, 2, 0).unwrap(), 20);
        assert_eq!(parse_arg(&args, 3, 10).unwrap(), 10);
    }

    #[test]
    fn test_parse_arg_rejects_invalid() {
        let args: Vec<String> = ["notification-service", "list", "-1", "ten"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert!(parse_arg(&args, 2, 0).is_err());
        assert!(parse_arg(&args, 3, 10).is_err());
    }
}
