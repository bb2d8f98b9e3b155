//! Engine events
//!
//! Provides the shared event enum and an EventBus (tokio broadcast) so that
//! the HTTP layer, the batch runner and the publisher can observe engine
//! activity without coupling to each other.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Prominence, RankingScores, TagId};

/// Engine event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Classifier ran for a work and committed its changes
    WorkClassified {
        work_id: Uuid,
        changed: usize,
        rule_version: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Author set a tag's prominence manually
    ProminenceOverridden {
        work_id: Uuid,
        tag_id: TagId,
        prominence: Prominence,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Migration batch progress after each chunk
    BatchProgress {
        batch_number: i64,
        works_processed: i64,
        works_total: i64,
        errors: i64,
    },

    /// Migration batch reached a terminal or paused state
    BatchFinished {
        batch_number: i64,
        status: String,
        works_processed: i64,
        errors: i64,
    },

    /// Score document reached the search index
    ScorePublished {
        work_id: Uuid,
        scores: RankingScores,
    },

    /// Score document gave up after exhausting retries
    ScorePublishFailed {
        work_id: Uuid,
        attempts: i64,
        error: String,
    },
}

/// Broadcast bus for engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Old events are dropped for slow subscribers once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::BatchProgress {
            batch_number: 1,
            works_processed: 5,
            works_total: 10,
            errors: 0,
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::BatchProgress { works_processed, .. } => assert_eq!(works_processed, 5),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus
            .emit(EngineEvent::ScorePublishFailed {
                work_id: Uuid::nil(),
                attempts: 3,
                error: "timeout".to_string(),
            })
            .is_err());

        // Lossy emit never fails
        bus.emit_lossy(EngineEvent::ScorePublishFailed {
            work_id: Uuid::nil(),
            attempts: 3,
            error: "timeout".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }
}
