//! Notification sink that writes each notification to the log.

use async_trait::async_trait;
use tracing::info;

use estate_core::notify::{Notification, NotificationSink};

/// Logs notifications at `info` under the `notifications` target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            target: "notifications",
            user_id = %notification.user_id,
            kind = %notification.kind,
            payload = %notification.payload,
            "Notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::notify::NotificationKind;

    #[tokio::test]
    async fn test_log_notifier_accepts_everything() {
        let notification = Notification {
            user_id: uuid::Uuid::new_v4(),
            kind: NotificationKind::RentalIncome,
            payload: serde_json::json!({ "amount": "50.00" }),
        };
        assert!(LogNotifier.notify(&notification).await.is_ok());
    }
}
