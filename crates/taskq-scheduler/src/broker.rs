use std::collections::HashMap;

use taskq_core::TaskId;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

use crate::lane::Lane;
use crate::types::DeadLetter;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The lane's buffer is full; try again next tick.
    #[error("lane {lane} is full")]
    LaneFull { lane: String },

    /// Nobody is consuming the lane any more.
    #[error("lane {lane} is closed")]
    LaneClosed { lane: String },
}

/// Hand-off point between the scheduler and whatever executes tasks.
///
/// Both methods must not block: they are called from inside a store
/// transaction on the scheduler tick.
pub trait Broker: Send + Sync {
    /// Fire-and-forget hand-off of `task_id` to `lane`. An `Err` means the
    /// task was not handed off and must stay eligible for the next tick.
    fn enqueue(&self, lane: Lane, task_id: &TaskId) -> Result<(), BrokerError>;

    /// Publish an audit event for a task that just died.
    fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), BrokerError>;
}

/// In-process broker: one bounded mpsc channel per lane plus one for dead letters.
pub struct ChannelBroker {
    lanes: HashMap<Lane, mpsc::Sender<TaskId>>,
    dead_letters: mpsc::Sender<DeadLetter>,
}

/// Consumer side of a [`ChannelBroker`].
pub struct BrokerReceivers {
    pub lanes: HashMap<Lane, mpsc::Receiver<TaskId>>,
    pub dead_letters: mpsc::Receiver<DeadLetter>,
}

impl ChannelBroker {
    /// Create a broker whose lanes each buffer up to `capacity` task ids.
    pub fn new(capacity: usize) -> (Self, BrokerReceivers) {
        let capacity = capacity.max(1);
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for lane in Lane::ALL {
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(lane, tx);
            receivers.insert(lane, rx);
        }
        let (dl_tx, dl_rx) = mpsc::channel(capacity);
        (
            Self {
                lanes: senders,
                dead_letters: dl_tx,
            },
            BrokerReceivers {
                lanes: receivers,
                dead_letters: dl_rx,
            },
        )
    }
}

fn map_send_error<T>(lane: &str, e: TrySendError<T>) -> BrokerError {
    match e {
        TrySendError::Full(_) => BrokerError::LaneFull {
            lane: lane.to_string(),
        },
        TrySendError::Closed(_) => BrokerError::LaneClosed {
            lane: lane.to_string(),
        },
    }
}

impl Broker for ChannelBroker {
    fn enqueue(&self, lane: Lane, task_id: &TaskId) -> Result<(), BrokerError> {
        let tx = self.lanes.get(&lane).ok_or_else(|| BrokerError::LaneClosed {
            lane: lane.to_string(),
        })?;
        tx.try_send(task_id.clone())
            .map_err(|e| map_send_error(lane.as_str(), e))
    }

    fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), BrokerError> {
        self.dead_letters
            .try_send(letter.clone())
            .map_err(|e| map_send_error("dlq", e))
    }
}

/// Drain the dead-letter channel, logging each record for operators.
///
/// Returns when every sender is dropped.
pub async fn log_dead_letters(mut rx: mpsc::Receiver<DeadLetter>) {
    while let Some(letter) = rx.recv().await {
        warn!(
            task_id = %letter.task_id,
            reason = %letter.reason,
            error = letter.error.as_deref().unwrap_or(""),
            "task moved to dead-letter queue"
        );
    }
    info!("dead-letter stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::types::DeadLetterReason;

    #[tokio::test]
    async fn routes_to_the_requested_lane() {
        let (broker, mut rx) = ChannelBroker::new(4);
        broker.enqueue(Lane::High, &TaskId::from("a")).unwrap();
        broker.enqueue(Lane::Low, &TaskId::from("b")).unwrap();

        let high = rx.lanes.get_mut(&Lane::High).unwrap();
        assert_eq!(high.recv().await.unwrap(), TaskId::from("a"));
        let low = rx.lanes.get_mut(&Lane::Low).unwrap();
        assert_eq!(low.recv().await.unwrap(), TaskId::from("b"));
        assert!(rx.lanes.get_mut(&Lane::Default).unwrap().try_recv().is_err());
    }

    #[test]
    fn full_lane_is_reported() {
        let (broker, _rx) = ChannelBroker::new(1);
        broker.enqueue(Lane::Default, &TaskId::from("a")).unwrap();
        let err = broker
            .enqueue(Lane::Default, &TaskId::from("b"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::LaneFull { .. }));
    }

    #[test]
    fn dropped_consumer_closes_lane() {
        let (broker, rx) = ChannelBroker::new(4);
        drop(rx);
        let err = broker.enqueue(Lane::High, &TaskId::from("a")).unwrap_err();
        assert!(matches!(err, BrokerError::LaneClosed { .. }));
    }

    #[tokio::test]
    async fn dead_letters_flow_to_their_own_channel() {
        let (broker, mut rx) = ChannelBroker::new(4);
        let letter = DeadLetter {
            id: 1,
            task_id: TaskId::from("a"),
            reason: DeadLetterReason::MaxRetriesExceeded,
            error: Some("boom".into()),
            payload: json!({}),
            created_at: Utc::now(),
        };
        broker.publish_dead_letter(&letter).unwrap();
        assert_eq!(rx.dead_letters.recv().await.unwrap(), letter);
    }
}
