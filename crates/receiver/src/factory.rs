//! Chooses and builds the receiver for an upload.

use crate::contract::{DataReceiver, ReceiveContext};
use crate::direct::ObjectStoreReceiver;
use crate::error::{ReceiveError, ReceiveResult};
use crate::gate::{BandwidthGate, WriteGate};
use crate::health::StorageHealthMonitor;
use crate::metrics::TrafficMetrics;
use crate::tiered::TieredReceiver;
use depot_core::{AppConfig, ReceiveConfig};
use depot_storage::ObjectStore;
use std::sync::Arc;
use tracing::debug;

/// Builds receivers that share configuration, a write gate, metrics, an
/// optional health monitor and an optional object store.
#[derive(Clone)]
pub struct ReceiverFactory {
    config: ReceiveConfig,
    enable_transfer: bool,
    monitor: Option<Arc<StorageHealthMonitor>>,
    store: Option<Arc<dyn ObjectStore>>,
    context: ReceiveContext,
}

impl std::fmt::Debug for ReceiverFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverFactory")
            .field("config", &self.config)
            .field("monitor", &self.monitor.is_some())
            .field("store", &self.store.as_ref().map(|s| s.backend_name()))
            .finish_non_exhaustive()
    }
}

impl ReceiverFactory {
    pub fn new(config: ReceiveConfig) -> Self {
        Self {
            config,
            enable_transfer: true,
            monitor: None,
            store: None,
            context: ReceiveContext::default(),
        }
    }

    /// Wire everything an [`AppConfig`] enables. The monitor's probe task is
    /// not started; see [`StorageHealthMonitor::spawn`].
    pub fn from_app_config(config: &AppConfig, store: Option<Arc<dyn ObjectStore>>) -> Self {
        let mut factory = Self::new(config.receive.clone());
        if let Some(gate) = BandwidthGate::from_config(&config.bandwidth) {
            factory = factory.with_gate(Arc::new(gate));
        }
        if config.monitor.enabled {
            let monitor =
                StorageHealthMonitor::new(config.monitor.clone(), config.receive.temp_path.clone());
            factory = factory.with_monitor(Arc::new(monitor));
        }
        if let Some(store) = store {
            factory = factory.with_object_store(store);
        }
        factory
    }

    pub fn with_monitor(mut self, monitor: Arc<StorageHealthMonitor>) -> Self {
        self.enable_transfer = monitor.config().enable_transfer;
        self.monitor = Some(monitor);
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn WriteGate>) -> Self {
        self.context.gate = gate;
        self
    }

    pub fn with_traffic(mut self, traffic: Arc<dyn TrafficMetrics>) -> Self {
        self.context.traffic = traffic;
        self
    }

    pub fn config(&self) -> &ReceiveConfig {
        &self.config
    }

    pub fn monitor(&self) -> Option<&Arc<StorageHealthMonitor>> {
        self.monitor.as_ref()
    }

    /// Whether an upload should bypass the local tiers.
    ///
    /// Requires direct upload enabled, an object store, a declared length
    /// above the file-size threshold, and a repository on the allow list
    /// (an empty list allows every repository).
    pub fn should_upload_direct(&self, content_length: Option<u64>, repository: Option<&str>) -> bool {
        let direct = &self.config.direct_upload;
        if !direct.enabled || self.store.is_none() {
            return false;
        }
        let Some(length) = content_length else {
            return false;
        };
        if length <= self.config.file_size_threshold {
            return false;
        }
        direct.repositories.is_empty()
            || repository.is_some_and(|repo| direct.repositories.iter().any(|r| r == repo))
    }

    pub fn build(
        &self,
        content_length: Option<u64>,
        repository: Option<&str>,
    ) -> Box<dyn DataReceiver> {
        if self.should_upload_direct(content_length, repository)
            && let (Some(store), Some(length)) = (&self.store, content_length)
        {
            debug!(length, repository, "Receiving directly into object store");
            return Box::new(ObjectStoreReceiver::new(
                store.clone(),
                length,
                &self.config,
                &self.context,
            ));
        }
        Box::new(self.build_tiered(content_length))
    }

    /// Build a tiered receiver registered with the health monitor, if any.
    pub fn build_tiered(&self, content_length: Option<u64>) -> TieredReceiver {
        let receiver = TieredReceiver::new(&self.config, content_length, &self.context)
            .with_transfer(self.enable_transfer);
        if let Some(monitor) = &self.monitor {
            monitor.register(&receiver.signal());
        }
        receiver
    }

    pub fn build_direct(&self, declared_length: u64) -> ReceiveResult<ObjectStoreReceiver> {
        let store = self.store.as_ref().ok_or_else(|| {
            ReceiveError::precondition("no object store configured for direct upload")
        })?;
        Ok(ObjectStoreReceiver::new(
            store.clone(),
            declared_length,
            &self.config,
            &self.context,
        ))
    }
}
