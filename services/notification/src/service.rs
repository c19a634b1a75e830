use crate::model::{Notification, Page};
use crate::store::{NotificationStore, StoreError};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Orchestrates persistence of decoded notifications.
///
/// No validation happens here; every record is handed to the store as-is.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Persist one notification.
    ///
    /// Store errors are logged and returned unchanged.
    #[instrument(skip(self, notification), fields(id = %notification.id))]
    pub async fn save_notification(
        &self,
        notification: Notification,
    ) -> Result<Notification, StoreError> {
        if let Err(e) = self.store.save(&notification).await {
            error!(error = %e, "Failed to save notification");
            return Err(e);
        }

        info!(id = %notification.id, "Saved notification");
        Ok(notification)
    }

    /// One page of stored notifications, newest first
    #[instrument(skip(self))]
    pub async fn list_notifications(&self, page: Page) -> Result<Vec<Notification>, StoreError> {
        self.store.find_all_by_page(page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockNotificationStore;
    use uuid::Uuid;

    fn notification(message: &str) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_returns_record() {
        let mut store = MockNotificationStore::new();
        store.expect_save().times(1).returning(|_| Ok(()));

        let service = NotificationService::new(Arc::new(store));
        let input = notification("hello");

        let saved = service.save_notification(input.clone()).await.unwrap();
        assert_eq!(saved, input);
    }

    #[tokio::test]
    async fn test_save_passes_error_through() {
        let mut store = MockNotificationStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(StoreError::Connectivity(sqlx::Error::PoolTimedOut)));

        let service = NotificationService::new(Arc::new(store));
        let err = service
            .save_notification(notification("hello"))
            .await
            .unwrap_err();

        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_save_performs_no_validation() {
        let mut store = MockNotificationStore::new();
        store.expect_save().times(1).returning(|_| Ok(()));

        let service = NotificationService::new(Arc::new(store));

        // Nil id, no message, expiration before creation
        let input = Notification {
            expiration_date: chrono::DateTime::<chrono::Utc>::default(),
            created_at: chrono::Utc::now(),
            ..Default::default()
        };
        assert!(!input.expires_after_creation());
        tokio_test::assert_ok!(service.save_notification(input).await);
    }

    #[tokio::test]
    async fn test_list_delegates_page() {
        let mut store = MockNotificationStore::new();
        store
            .expect_find_all_by_page()
            .withf(|page| *page == Page::new(10, 5))
            .times(1)
            .returning(|_| Ok(vec![notification("a"), notification("b")]));

        let service = NotificationService::new(Arc::new(store));
        let page = service.list_notifications(Page::new(10, 5)).await.unwrap();

        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message, "a");
    }
}
