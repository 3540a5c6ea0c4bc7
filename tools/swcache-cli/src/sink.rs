//! Notification sink that prints to stdout.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use swcache_engine::{DisplayedNotification, EngineError, NotificationRequest, NotificationSink};
use tracing::debug;

/// Prints each notification as one JSON line.
#[derive(Debug, Default)]
pub struct StdoutSink {
    next_id: AtomicU64,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationSink for StdoutSink {
    async fn show(
        &self,
        request: NotificationRequest,
    ) -> Result<DisplayedNotification, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let displayed = DisplayedNotification {
            id: format!("stdout-{id}"),
            title: request.title,
            options: request.options,
        };
        let line = serde_json::to_string(&displayed)
            .map_err(|e| EngineError::Display(e.to_string()))?;
        println!("{line}");
        Ok(displayed)
    }

    async fn close(&self, id: &str) -> Result<(), EngineError> {
        debug!(id, "Close requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swcache_engine::{NotificationData, NotificationOptions};

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let sink = StdoutSink::new();
        let request = NotificationRequest {
            title: "KJFC Dashboard".into(),
            options: NotificationOptions {
                body: "Game moved to 5pm".into(),
                icon: "/icons/icon-192.png".into(),
                badge: "/icons/icon-192.png".into(),
                tag: "kjfc-notification".into(),
                data: NotificationData::default(),
                actions: Vec::new(),
                require_interaction: false,
            },
        };

        assert_eq!(sink.show(request.clone()).await.unwrap().id, "stdout-1");
        assert_eq!(sink.show(request).await.unwrap().id, "stdout-2");
        sink.close("stdout-1").await.unwrap();
    }
}
