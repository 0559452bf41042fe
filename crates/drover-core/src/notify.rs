//! Out-of-band notifications.
//!
//! The orchestrator raises notifications for deadlocks and suspended-task
//! questions. Delivery is behind a trait so the CLI can log them while the
//! pipeline routes them to a message channel.

use async_trait::async_trait;

/// Sink for out-of-band notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Default notifier: structured log output.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        tracing::warn!(subject, body, "notification");
        Ok(())
    }
}
