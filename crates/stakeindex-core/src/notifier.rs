//! Best-effort push notifications for applied stake events.
//!
//! The apply loop calls the notifier after an event is applied and marked
//! processed. Delivery is at-least-once at best; failures are logged and
//! never roll back state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::amount::TokenAmount;
use crate::error::IndexerError;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StakeCreated,
    StakeUnstaked,
}

/// Payload pushed to UI subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub user_address: String,
    pub pool_id: u64,
    pub amount: TokenAmount,
    /// Only set for unstakes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<TokenAmount>,
    pub tx_hash: String,
    pub block_number: u64,
}

/// Downstream consumer of stake notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: StakeNotification) -> Result<(), IndexerError>;
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: StakeNotification) -> Result<(), IndexerError> {
        Ok(())
    }
}

/// Fans notifications out over a tokio broadcast channel (e.g. to WebSocket
/// sessions). Having no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<StakeNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StakeNotification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: StakeNotification) -> Result<(), IndexerError> {
        // `send` only fails when nobody is listening.
        let _ = self.tx.send(notification);
        Ok(())
    }
}
