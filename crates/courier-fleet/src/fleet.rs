//! Fleet manager seam.
//!
//! The fleet manager hosts reader processes. The reconciliation engine only
//! needs to list what runs, create a named process from an opaque init
//! payload and delete a named process. Mutators distinguish a transient
//! "busy" backend from a hard failure.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::FleetError;

/// Type tag of primary-queue reader processes.
pub const READER_TYPE: &str = "subscriber-reader";

/// Type tag of dead-letter reader processes.
pub const DLQ_READER_TYPE: &str = "subscriber-dlq-reader";

/// Operations the reconciliation engine needs from the process host.
#[async_trait::async_trait]
pub trait FleetManager: Send + Sync + std::fmt::Debug {
    /// Names of every running reader process.
    async fn list_names(&self) -> Result<Vec<String>, FleetError>;

    /// Creates a named process of type `type_tag` initialized from `init`.
    async fn create(
        &self,
        name: &str,
        type_tag: &str,
        init: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), FleetError>;

    /// Deletes a named process.
    async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<(), FleetError>;
}

pub mod mock {
    //! In-memory fleet manager for testing reconciliation without a backend.
    //!
    //! Tracks running processes and their init payloads, journals every call
    //! and supports injecting busy or hard failures per process name.

    use std::collections::{BTreeMap, HashMap};

    use bytes::Bytes;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    use super::FleetManager;
    use crate::error::FleetError;

    /// A call recorded by [`InMemoryFleet`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FleetCall {
        /// `create(name, type_tag, ..)`.
        Create {
            /// Process name.
            name: String,
            /// Type tag.
            type_tag: String,
        },
        /// `delete(name)`.
        Delete {
            /// Process name.
            name: String,
        },
    }

    #[derive(Debug, Clone)]
    enum Injected {
        Busy { remaining: u32 },
        Failed { message: String },
    }

    /// In-memory fleet manager.
    #[derive(Debug, Default)]
    pub struct InMemoryFleet {
        running: RwLock<BTreeMap<String, (String, Bytes)>>,
        journal: RwLock<Vec<FleetCall>>,
        injected: RwLock<HashMap<String, Injected>>,
        list_error: RwLock<Option<String>>,
    }

    impl InMemoryFleet {
        /// Creates an empty fleet.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a fleet with processes already running.
        pub async fn with_running<I, S>(names: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let fleet = Self::new();
            {
                let mut running = fleet.running.write().await;
                for name in names {
                    running.insert(name.into(), (super::READER_TYPE.to_string(), Bytes::new()));
                }
            }
            fleet
        }

        /// Makes the next `times` calls on `name` answer busy.
        pub async fn inject_busy(&self, name: impl Into<String>, times: u32) {
            self.injected.write().await.insert(name.into(), Injected::Busy { remaining: times });
        }

        /// Makes every call on `name` fail permanently.
        pub async fn inject_failure(&self, name: impl Into<String>, message: impl Into<String>) {
            self.injected
                .write()
                .await
                .insert(name.into(), Injected::Failed { message: message.into() });
        }

        /// Makes every call on names starting with `prefix` fail permanently.
        ///
        /// Useful when the versioned name is not known in advance.
        pub async fn inject_failure_for_prefix(
            &self,
            prefix: impl Into<String>,
            message: impl Into<String>,
        ) {
            self.inject_failure(format!("{}*", prefix.into()), message).await;
        }

        /// Makes the next `list_names` call fail.
        pub async fn inject_list_error(&self, message: impl Into<String>) {
            *self.list_error.write().await = Some(message.into());
        }

        /// Sorted names of running processes.
        pub async fn running_names(&self) -> Vec<String> {
            self.running.read().await.keys().cloned().collect()
        }

        /// Init payload a process was created with.
        pub async fn init_payload(&self, name: &str) -> Option<Bytes> {
            self.running.read().await.get(name).map(|(_, init)| init.clone())
        }

        /// Every call made so far, in order.
        pub async fn journal(&self) -> Vec<FleetCall> {
            self.journal.read().await.clone()
        }

        async fn check_injected(&self, name: &str) -> Result<(), FleetError> {
            let mut injected = self.injected.write().await;
            let key = if injected.contains_key(name) {
                name.to_string()
            } else {
                match injected
                    .keys()
                    .find(|k| k.strip_suffix('*').is_some_and(|prefix| name.starts_with(prefix)))
                {
                    Some(k) => k.clone(),
                    None => return Ok(()),
                }
            };
            let outcome = match injected.get_mut(&key) {
                Some(Injected::Busy { remaining }) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(FleetError::busy(name))
                },
                Some(Injected::Failed { message }) => {
                    Err(FleetError::failed(name, message.clone()))
                },
                Some(Injected::Busy { .. }) | None => Ok(()),
            };
            if outcome.is_ok() {
                injected.remove(&key);
            }
            outcome
        }
    }

    #[async_trait::async_trait]
    impl FleetManager for InMemoryFleet {
        async fn list_names(&self) -> Result<Vec<String>, FleetError> {
            if let Some(message) = self.list_error.write().await.take() {
                return Err(FleetError::failed("<list>", message));
            }
            Ok(self.running_names().await)
        }

        async fn create(
            &self,
            name: &str,
            type_tag: &str,
            init: Bytes,
            _cancel: &CancellationToken,
        ) -> Result<(), FleetError> {
            self.journal
                .write()
                .await
                .push(FleetCall::Create { name: name.to_string(), type_tag: type_tag.to_string() });
            self.check_injected(name).await?;

            let mut running = self.running.write().await;
            if running.contains_key(name) {
                return Err(FleetError::failed(name, "process already exists"));
            }
            running.insert(name.to_string(), (type_tag.to_string(), init));
            Ok(())
        }

        async fn delete(&self, name: &str, _cancel: &CancellationToken) -> Result<(), FleetError> {
            self.journal.write().await.push(FleetCall::Delete { name: name.to_string() });
            self.check_injected(name).await?;

            if self.running.write().await.remove(name).is_none() {
                return Err(FleetError::failed(name, "process not found"));
            }
            Ok(())
        }
    }
}
