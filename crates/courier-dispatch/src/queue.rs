//! Queue subscription seam.
//!
//! Readers never acknowledge on receive: a received message stays locked
//! until its token is completed, and the queue redelivers it once the lock
//! expires. The in-memory implementation in [`mock`] models exactly that.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{AckToken, SubscriberConfig};

use crate::error::QueueError;

/// A locked message handed out by [`QueueClient::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Raw message body.
    pub body: Bytes,
    /// Receipt that completes the message.
    pub ack_token: AckToken,
    /// How many times the message has been handed out, including this one.
    pub delivery_count: u32,
}

/// Client for one subscriber's queue.
#[async_trait]
pub trait QueueClient: Send + Sync + std::fmt::Debug {
    /// Receives and locks up to `max` messages. Returns immediately with
    /// whatever is available.
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Completes a locked message so it is never redelivered.
    async fn complete(&self, token: &AckToken) -> Result<(), QueueError>;

    /// Whether the subscription has been closed.
    fn is_closed(&self) -> bool;
}

/// Opens queue clients for subscribers.
#[async_trait]
pub trait QueueConnector: Send + Sync + std::fmt::Debug {
    /// Connects to the queue addressed by the subscriber's key.
    async fn connect(
        &self,
        subscriber: &SubscriberConfig,
    ) -> Result<Arc<dyn QueueClient>, QueueError>;
}

pub mod mock {
    //! In-memory queue with lock semantics for tests and single-process runs.

    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
            Arc,
        },
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_core::{AckToken, SubscriberConfig, SubscriberKey};
    use tokio::sync::{Mutex, RwLock};

    use super::{QueueClient, QueueConnector, ReceivedMessage};
    use crate::error::QueueError;

    #[derive(Debug, Clone)]
    struct Stored {
        body: Bytes,
        delivery_count: u32,
    }

    #[derive(Debug, Default)]
    struct QueueState {
        pending: VecDeque<Stored>,
        locked: HashMap<AckToken, Stored>,
        completed: Vec<Bytes>,
    }

    /// In-memory queue.
    ///
    /// Clones share the same state.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryQueue {
        state: Arc<Mutex<QueueState>>,
        next_token: Arc<AtomicU64>,
        transient_faults: Arc<AtomicU32>,
        closed: Arc<AtomicBool>,
    }

    impl InMemoryQueue {
        /// Creates an empty queue.
        pub fn new() -> Self {
            Self::default()
        }

        /// Enqueues a message.
        pub async fn push(&self, body: impl Into<Bytes>) {
            self.state
                .lock()
                .await
                .pending
                .push_back(Stored { body: body.into(), delivery_count: 0 });
        }

        /// Makes every locked message available again, as if its lock had
        /// timed out.
        pub async fn expire_locks(&self) -> usize {
            let mut state = self.state.lock().await;
            let expired: Vec<Stored> = state.locked.drain().map(|(_, message)| message).collect();
            let count = expired.len();
            for message in expired {
                state.pending.push_back(message);
            }
            count
        }

        /// Fails the next `times` receive or complete calls with a transient
        /// fault.
        pub fn inject_transient(&self, times: u32) {
            self.transient_faults.store(times, Ordering::SeqCst);
        }

        /// Closes the subscription.
        pub fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        /// Bodies of completed messages, in completion order.
        pub async fn completed(&self) -> Vec<Bytes> {
            self.state.lock().await.completed.clone()
        }

        /// Messages waiting to be received.
        pub async fn pending_count(&self) -> usize {
            self.state.lock().await.pending.len()
        }

        /// Messages received but not yet completed.
        pub async fn locked_count(&self) -> usize {
            self.state.lock().await.locked.len()
        }

        fn take_fault(&self) -> Option<QueueError> {
            self.transient_faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .ok()
                .map(|_| QueueError::transient("injected transient fault"))
        }
    }

    #[async_trait]
    impl QueueClient for InMemoryQueue {
        async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
            if let Some(fault) = self.take_fault() {
                return Err(fault);
            }

            let mut state = self.state.lock().await;
            let mut received = Vec::new();
            while received.len() < max {
                let Some(mut message) = state.pending.pop_front() else { break };
                message.delivery_count += 1;
                let sequence = self.next_token.fetch_add(1, Ordering::SeqCst);
                let token = AckToken::new(format!("lock-{sequence}"));
                received.push(ReceivedMessage {
                    body: message.body.clone(),
                    ack_token: token.clone(),
                    delivery_count: message.delivery_count,
                });
                state.locked.insert(token, message);
            }
            Ok(received)
        }

        async fn complete(&self, token: &AckToken) -> Result<(), QueueError> {
            if let Some(fault) = self.take_fault() {
                return Err(fault);
            }

            let mut state = self.state.lock().await;
            match state.locked.remove(token) {
                Some(message) => {
                    state.completed.push(message.body);
                    Ok(())
                },
                None => Err(QueueError::fatal(format!("lock {token} lost or already completed"))),
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Connector handing out one shared [`InMemoryQueue`] per subscriber key.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryBroker {
        queues: Arc<RwLock<HashMap<SubscriberKey, InMemoryQueue>>>,
        refuse: Arc<AtomicBool>,
    }

    impl InMemoryBroker {
        /// Creates a broker with no queues.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue for `key`, created on first use.
        pub async fn queue(&self, key: &SubscriberKey) -> InMemoryQueue {
            self.queues.write().await.entry(key.clone()).or_default().clone()
        }

        /// Makes every subsequent connect fail.
        pub fn refuse_connections(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl QueueConnector for InMemoryBroker {
        async fn connect(
            &self,
            subscriber: &SubscriberConfig,
        ) -> Result<Arc<dyn QueueClient>, QueueError> {
            if self.refuse.load(Ordering::SeqCst) {
                let message = format!("queue for {} unavailable", subscriber.key());
                return Err(QueueError::fatal(message));
            }
            Ok(Arc::new(self.queue(&subscriber.key()).await))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{mock::InMemoryQueue, *};

    #[tokio::test]
    async fn received_messages_stay_locked_until_completed() {
        let queue = InMemoryQueue::new();
        queue.push("one").await;
        queue.push("two").await;

        let batch = queue.receive(5).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.locked_count().await, 2);
        assert!(queue.receive(5).await.unwrap().is_empty());

        queue.complete(&batch[0].ack_token).await.unwrap();
        assert_eq!(queue.completed().await, vec![Bytes::from("one")]);
        assert!(matches!(
            queue.complete(&batch[0].ack_token).await,
            Err(QueueError::Fatal { .. })
        ));
    }

    #[tokio::test]
    async fn expired_locks_are_redelivered_with_a_higher_count() {
        let queue = InMemoryQueue::new();
        queue.push("only").await;

        let first = queue.receive(1).await.unwrap();
        assert_eq!(queue.expire_locks().await, 1);

        let second = queue.receive(1).await.unwrap();
        assert_eq!(second[0].body, first[0].body);
        assert_eq!(second[0].delivery_count, 2);
        assert_ne!(second[0].ack_token, first[0].ack_token);
        assert!(queue.complete(&first[0].ack_token).await.is_err(), "stale token");
    }

    #[tokio::test]
    async fn transient_faults_are_consumed_one_call_at_a_time() {
        let queue = InMemoryQueue::new();
        queue.push("m").await;
        queue.inject_transient(1);

        assert!(queue.receive(1).await.unwrap_err().is_retryable());
        assert_eq!(queue.receive(1).await.unwrap().len(), 1);
    }
}
