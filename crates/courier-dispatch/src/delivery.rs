//! Delivery seam used by handler slots.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DeliveryError;

/// Performs one delivery attempt for a message.
///
/// `source` is the name of the reader the message came from; implementations
/// use it to look up where the payload goes.
#[async_trait]
pub trait Delivery: Send + Sync + std::fmt::Debug {
    /// Attempts delivery. `Ok` means the receiver confirmed it.
    async fn attempt(&self, payload: &Bytes, source: &str) -> Result<(), DeliveryError>;
}

pub mod mock {
    //! Scriptable delivery for scheduler and pump tests.

    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::{Mutex, Semaphore};

    use super::Delivery;
    use crate::error::DeliveryError;

    /// Delivery that records attempts and can fail or hold them.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedDelivery {
        attempts: Arc<Mutex<Vec<(String, Bytes)>>>,
        failure: Arc<Mutex<Option<DeliveryError>>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedDelivery {
        /// Delivery that succeeds immediately.
        pub fn succeeding() -> Self {
            Self::default()
        }

        /// Delivery that fails every attempt with `error`.
        pub fn failing(error: DeliveryError) -> Self {
            Self { failure: Arc::new(Mutex::new(Some(error))), ..Self::default() }
        }

        /// Delivery whose attempts block until [`release`](Self::release).
        pub fn held() -> Self {
            Self { gate: Some(Arc::new(Semaphore::new(0))), ..Self::default() }
        }

        /// Lets `count` held attempts finish.
        pub fn release(&self, count: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(count);
            }
        }

        /// Switches between failing and succeeding.
        pub async fn set_failure(&self, error: Option<DeliveryError>) {
            *self.failure.lock().await = error;
        }

        /// Every attempt started so far as `(source, payload)`.
        pub async fn attempts(&self) -> Vec<(String, Bytes)> {
            self.attempts.lock().await.clone()
        }
    }

    #[async_trait]
    impl Delivery for ScriptedDelivery {
        async fn attempt(&self, payload: &Bytes, source: &str) -> Result<(), DeliveryError> {
            self.attempts.lock().await.push((source.to_string(), payload.clone()));
            if let Some(gate) = &self.gate {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(DeliveryError::configuration("delivery gate closed")),
                }
            }
            match self.failure.lock().await.clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }
}
