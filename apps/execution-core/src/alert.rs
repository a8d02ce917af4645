//! Operator notification port.
//!
//! Alerts are best-effort and fire-and-forget: a failed delivery is logged
//! and swallowed, never escalated into trading logic.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an operator alert. Must not fail the caller.
    async fn send_alert(&self, message: &str);
}

/// Notifier that emits alerts as structured log events.
///
/// Used when no external channel is configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    /// Create a new tracing-backed notifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_alert(&self, message: &str) {
        tracing::warn!(alert = %message, "operator alert");
    }
}

/// Notifier that captures alerts on an in-process channel.
///
/// Test double: the receiver half lets assertions inspect exactly which
/// alerts fired and how many.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver that collects its alerts.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send_alert(&self, message: &str) {
        // Receiver may be gone in tests that only care about side effects.
        if self.tx.send(message.to_string()).is_err() {
            tracing::debug!(alert = %message, "alert receiver dropped");
        }
    }
}
