//! Pushes committed claim state to live observers.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::claim::{Claim, Notification};
use crate::error::Result;

/// Emitted once per committed turn.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimEvent {
    pub claim: Claim,
    /// Notifications created by this turn only.
    pub notifications: Vec<Notification>,
}

impl ClaimEvent {
    pub fn claim_id(&self) -> Uuid {
        self.claim.id
    }
}

#[async_trait]
pub trait ClaimPublisher: Send + Sync {
    /// Called after the store write has completed.
    async fn publish(&self, event: ClaimEvent) -> Result<()>;
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl ClaimPublisher for NoopPublisher {
    async fn publish(&self, _event: ClaimEvent) -> Result<()> {
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ClaimEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClaimEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ClaimPublisher for BroadcastPublisher {
    async fn publish(&self, event: ClaimEvent) -> Result<()> {
        // No subscribers is fine; the store stays the source of truth.
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_committed_snapshots() {
        let publisher = BroadcastPublisher::new(4);
        let mut rx = publisher.subscribe();
        let claim = Claim::new(Uuid::new_v4());

        publisher
            .publish(ClaimEvent {
                claim: claim.clone(),
                notifications: vec![],
            })
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.claim_id(), claim.id);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let publisher = BroadcastPublisher::default();
        let event = ClaimEvent {
            claim: Claim::new(Uuid::new_v4()),
            notifications: vec![],
        };
        assert!(publisher.publish(event).await.is_ok());
    }
}
