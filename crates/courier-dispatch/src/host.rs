//! In-process fleet host.
//!
//! Runs every reader as a [`ReaderPump`] task inside the current process and
//! exposes them to reconciliation through [`FleetManager`]. The pump
//! registry doubles as the pool's [`CompletionSink`], routing completions to
//! the pump that owns the message.
//!
//! Every reader the host runs is recorded with its init payload in the state
//! store. A restarted host brings the same readers back under the same names
//! ([`HostedReaders::load`], [`LocalFleet::restore`]), so their in-flight maps
//! and the pool's rehydrated work still line up with a running pump.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{CorrelationHandle, EndpointConfig, ReaderInit, TelemetryHandler};
use courier_fleet::{FleetError, FleetManager, DLQ_READER_TYPE, READER_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::EndpointRoutes,
    pump::{state_key, PumpConfig, PumpHandle, ReaderPump},
    queue::QueueConnector,
    scheduler::{CompletionSink, SchedulerHandle},
    store::{load_json, save_json, StateStore},
};

/// State store key of the hosted reader index.
pub const HOSTED_READERS_KEY: &str = "fleet/readers";

/// Running pumps by reader name.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct PumpRegistry {
    pumps: Arc<RwLock<HashMap<String, PumpHandle>>>,
}

impl PumpRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pump of `name`.
    pub async fn get(&self, name: &str) -> Option<PumpHandle> {
        self.pumps.read().await.get(name).cloned()
    }

    /// Sorted names of registered pumps.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pumps.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers a running pump under its name.
    pub async fn register(&self, pump: PumpHandle) {
        self.pumps.write().await.insert(pump.name().to_string(), pump);
    }

    /// Removes and returns the pump of `name`.
    pub async fn unregister(&self, name: &str) -> Option<PumpHandle> {
        self.pumps.write().await.remove(name)
    }
}

#[async_trait]
impl CompletionSink for PumpRegistry {
    async fn complete_message(&self, source: &str, handle: CorrelationHandle) {
        match self.get(source).await {
            Some(pump) => {
                if let Err(e) = pump.complete_message(handle) {
                    warn!(
                        reader = %source,
                        handle = %handle,
                        error = %e,
                        "completion for stopped reader dropped"
                    );
                }
            },
            None => {
                warn!(reader = %source, handle = %handle, "completion for unknown reader dropped");
            },
        }
    }

    async fn abandon_message(&self, source: &str, handle: CorrelationHandle) {
        match self.get(source).await {
            Some(pump) => {
                if let Err(e) = pump.abandon_message(handle) {
                    debug!(
                        reader = %source,
                        handle = %handle,
                        error = %e,
                        "abandon for stopped reader dropped"
                    );
                }
            },
            None => {
                debug!(reader = %source, handle = %handle, "abandon for unknown reader dropped");
            },
        }
    }
}

/// A reader as the host was asked to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedReader {
    /// Process type the reader was created with.
    pub type_tag: String,
    /// Decoded init payload.
    pub init: ReaderInit,
}

impl HostedReader {
    /// Endpoints deliveries for this reader go to, in subscriber order.
    fn route(&self) -> Vec<EndpointConfig> {
        self.init
            .subscriber
            .endpoints
            .iter()
            .filter_map(|endpoint| self.init.endpoints.get(endpoint).cloned())
            .collect()
    }
}

/// Readers a host runs, by name, as persisted under [`HOSTED_READERS_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostedReaders(BTreeMap<String, HostedReader>);

impl HostedReaders {
    /// Loads the index a previous host left behind.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the index cannot be read or decoded.
    pub async fn load(store: &dyn StateStore) -> crate::Result<Self> {
        let readers: Option<Self> = load_json(store, HOSTED_READERS_KEY).await?;
        Ok(readers.unwrap_or_default())
    }

    /// Sorted reader names.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Number of readers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no reader is recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Registers the delivery routes of every recorded reader.
    ///
    /// Called before the handler pool starts so work it rehydrates finds its
    /// endpoints.
    pub async fn register_routes(&self, routes: &EndpointRoutes) {
        for (name, reader) in &self.0 {
            routes.register(name.as_str(), reader.route()).await;
        }
    }

    async fn save(&self, store: &dyn StateStore) -> crate::Result<()> {
        save_json(store, HOSTED_READERS_KEY, self).await?;
        Ok(())
    }
}

/// Fleet manager hosting reader pumps in this process.
#[derive(Debug)]
pub struct LocalFleet {
    scheduler: SchedulerHandle,
    registry: PumpRegistry,
    routes: EndpointRoutes,
    connector: Arc<dyn QueueConnector>,
    store: Arc<dyn StateStore>,
    telemetry: Arc<dyn TelemetryHandler>,
    pump_config: PumpConfig,
    hosted: Mutex<HostedReaders>,
    transitioning: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl LocalFleet {
    /// Creates a host. Pumps stop when `cancel` fires.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: SchedulerHandle,
        registry: PumpRegistry,
        routes: EndpointRoutes,
        connector: Arc<dyn QueueConnector>,
        store: Arc<dyn StateStore>,
        telemetry: Arc<dyn TelemetryHandler>,
        pump_config: PumpConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            registry,
            routes,
            connector,
            store,
            telemetry,
            pump_config,
            hosted: Mutex::new(HostedReaders::default()),
            transitioning: Mutex::new(HashSet::new()),
            cancel,
        }
    }

    /// Registry of running pumps.
    pub fn registry(&self) -> &PumpRegistry {
        &self.registry
    }

    /// Starts every reader of `readers` under its recorded name.
    ///
    /// A reader that cannot be started again is forgotten together with its
    /// pump state, so reconciliation recreates it under a new name. Returns
    /// the number of readers running afterwards.
    pub async fn restore(&self, readers: HostedReaders) -> usize {
        let mut hosted = self.hosted.lock().await;
        for (name, reader) in readers.0 {
            if hosted.0.contains_key(&name) {
                continue;
            }
            match self.launch(&name, &reader).await {
                Ok(()) => {
                    hosted.0.insert(name, reader);
                },
                Err(e) => {
                    warn!(reader = %name, error = %e, "reader not restored, forgetting it");
                    self.routes.unregister(&name).await;
                    if let Err(e) = self.store.delete(&state_key(&name)).await {
                        warn!(reader = %name, error = %e, "failed to delete reader state");
                    }
                },
            }
        }
        if let Err(e) = hosted.save(&*self.store).await {
            warn!(error = %e, "failed to persist hosted reader index");
        }
        info!(readers = hosted.len(), "hosted readers restored");
        hosted.len()
    }

    /// Stops every pump. Their state and the hosted reader index stay in the
    /// store for [`LocalFleet::restore`].
    pub async fn shutdown_all(&self) {
        let names = self.registry.names().await;
        info!(readers = names.len(), "stopping all reader pumps");
        for name in names {
            if let Some(pump) = self.registry.unregister(&name).await {
                pump.shutdown().await;
            }
        }
    }

    /// Marks `name` as changing. Fails with `Busy` if another create or
    /// delete of the same name is still running.
    async fn begin(&self, name: &str) -> Result<(), FleetError> {
        if self.transitioning.lock().await.insert(name.to_string()) {
            Ok(())
        } else {
            Err(FleetError::busy(name))
        }
    }

    async fn end(&self, name: &str) {
        self.transitioning.lock().await.remove(name);
    }

    /// Connects the queue, registers routes and starts the pump of `name`.
    async fn launch(&self, name: &str, reader: &HostedReader) -> Result<(), FleetError> {
        if self.registry.get(name).await.is_some() {
            return Err(FleetError::failed(name, "process already exists"));
        }
        let init = &reader.init;
        if init.reader_name != name {
            return Err(FleetError::failed(
                name,
                format!("init payload is for {}", init.reader_name),
            ));
        }
        let expected = if init.subscriber.dlq_mode { DLQ_READER_TYPE } else { READER_TYPE };
        if reader.type_tag != expected {
            return Err(FleetError::failed(
                name,
                format!("unsupported process type {}", reader.type_tag),
            ));
        }

        let queue = self.connector.connect(&init.subscriber).await.map_err(|e| {
            if e.is_retryable() {
                FleetError::busy(name)
            } else {
                FleetError::failed(name, e.to_string())
            }
        })?;

        self.routes.register(name, reader.route()).await;

        let pump = ReaderPump::new(
            name,
            init.subscriber.clone(),
            self.pump_config.clone(),
            queue,
            self.scheduler.clone(),
            self.store.clone(),
            self.telemetry.clone(),
        );
        match pump.start(self.cancel.child_token()).await {
            Ok(handle) => {
                self.registry.register(handle).await;
                info!(reader = %name, type_tag = %reader.type_tag, "reader started");
                Ok(())
            },
            Err(e) => {
                self.routes.unregister(name).await;
                Err(FleetError::failed(name, e.to_string()))
            },
        }
    }

    async fn start_reader(
        &self,
        name: &str,
        type_tag: &str,
        init: &[u8],
    ) -> Result<(), FleetError> {
        let init =
            ReaderInit::from_bytes(init).map_err(|e| FleetError::failed(name, e.to_string()))?;
        let reader = HostedReader { type_tag: type_tag.to_string(), init };
        self.launch(name, &reader).await?;

        let mut hosted = self.hosted.lock().await;
        hosted.0.insert(name.to_string(), reader);
        if let Err(e) = hosted.save(&*self.store).await {
            hosted.0.remove(name);
            drop(hosted);
            warn!(reader = %name, error = %e, "failed to record reader, stopping it again");
            self.halt(name).await;
            return Err(FleetError::failed(name, format!("reader not recorded: {e}")));
        }
        Ok(())
    }

    async fn stop_reader(&self, name: &str) -> Result<(), FleetError> {
        if !self.halt(name).await {
            return Err(FleetError::failed(name, "process not found"));
        }

        let mut hosted = self.hosted.lock().await;
        if hosted.0.remove(name).is_some() {
            if let Err(e) = hosted.save(&*self.store).await {
                warn!(reader = %name, error = %e, "failed to drop reader from hosted index");
            }
        }
        drop(hosted);

        if let Err(e) = self.store.delete(&state_key(name)).await {
            warn!(reader = %name, error = %e, "failed to delete reader state");
        }
        info!(reader = %name, "reader stopped");
        Ok(())
    }

    /// Stops the pump of `name` and drops its routes. Returns whether a pump
    /// was running.
    async fn halt(&self, name: &str) -> bool {
        let Some(pump) = self.registry.unregister(name).await else {
            return false;
        };
        pump.shutdown().await;
        self.routes.unregister(name).await;
        true
    }
}

#[async_trait]
impl FleetManager for LocalFleet {
    async fn list_names(&self) -> Result<Vec<String>, FleetError> {
        Ok(self.registry.names().await)
    }

    async fn create(
        &self,
        name: &str,
        type_tag: &str,
        init: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), FleetError> {
        if cancel.is_cancelled() || self.cancel.is_cancelled() {
            return Err(FleetError::failed(name, "host shutting down"));
        }
        self.begin(name).await?;
        let result = self.start_reader(name, type_tag, &init).await;
        self.end(name).await;
        result
    }

    async fn delete(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), FleetError> {
        self.begin(name).await?;
        let result = self.stop_reader(name).await;
        self.end(name).await;
        result
    }
}
