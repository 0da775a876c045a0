//! Storage health monitoring and fallback negotiation.
//!
//! The monitor runs on its own task and only ever records intent on a
//! receiver's [`FallbackSignal`]. The receiver applies that intent itself,
//! before its next write.

use depot_core::{MonitorConfig, random_temp_name};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives storage health notifications.
///
/// Called from the monitor's task at any time; implementations must only
/// record state, never perform I/O on behalf of a receiver.
pub trait HealthObserver: Send + Sync {
    fn unhealthy(&self, fallback_path: Option<PathBuf>, reason: &str);
}

/// A pending fallback, consumed once by the owning receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackRequest {
    pub path: Option<PathBuf>,
    pub reason: String,
}

#[derive(Debug, Default)]
struct SignalState {
    request: Option<FallbackRequest>,
    closed: bool,
}

/// First-wins fallback flag shared between a receiver and the monitor.
#[derive(Debug, Default)]
pub struct FallbackSignal {
    requested: AtomicBool,
    state: Mutex<SignalState>,
}

impl FallbackSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a fallback has been requested and not yet consumed.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Take the pending request. Returns `Some` at most once per signal;
    /// afterwards the signal ignores further notifications.
    pub(crate) fn take(&self) -> Option<FallbackRequest> {
        if !self.is_requested() {
            return None;
        }
        let mut state = self.lock();
        state.closed = true;
        self.requested.store(false, Ordering::Release);
        state.request.take()
    }

    /// Stop accepting notifications.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.request = None;
        self.requested.store(false, Ordering::Release);
    }
}

impl HealthObserver for FallbackSignal {
    fn unhealthy(&self, fallback_path: Option<PathBuf>, reason: &str) {
        let mut state = self.lock();
        if state.closed || state.request.is_some() {
            debug!(reason, "Ignoring fallback notification, already decided");
            return;
        }
        warn!(
            fallback_path = ?fallback_path,
            reason,
            "Storage unhealthy, fallback requested"
        );
        state.request = Some(FallbackRequest {
            path: fallback_path,
            reason: reason.to_string(),
        });
        self.requested.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    unhealthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Probes the primary temp root and notifies observers when it degrades.
pub struct StorageHealthMonitor {
    config: MonitorConfig,
    primary: PathBuf,
    observers: Mutex<Vec<Weak<dyn HealthObserver>>>,
    state: Mutex<ProbeState>,
}

impl std::fmt::Debug for StorageHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHealthMonitor")
            .field("primary", &self.primary)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl StorageHealthMonitor {
    pub fn new(config: MonitorConfig, primary: impl Into<PathBuf>) -> Self {
        Self {
            config,
            primary: primary.into(),
            observers: Mutex::new(Vec::new()),
            state: Mutex::new(ProbeState::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn is_healthy(&self) -> bool {
        !self.probe_state().unhealthy
    }

    fn probe_state(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Weak<dyn HealthObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer. It is held weakly; dropping the last strong
    /// reference unregisters it.
    ///
    /// If the primary is currently unhealthy the observer is notified at once.
    pub fn register<O: HealthObserver + 'static>(&self, observer: &Arc<O>) {
        let strong: Arc<dyn HealthObserver> = observer.clone();
        self.observers().push(Arc::downgrade(&strong));
        if !self.is_healthy() {
            strong.unhealthy(self.config.fallback_path.clone(), "primary storage unhealthy");
        }
    }

    /// Number of live observers. Prunes dropped ones.
    pub fn observer_count(&self) -> usize {
        let mut observers = self.observers();
        observers.retain(|o| o.strong_count() > 0);
        observers.len()
    }

    /// Feed one probe result into the failure and recovery counters.
    pub fn report_probe(&self, result: Result<(), String>) {
        let became_unhealthy = {
            let mut state = self.probe_state();
            match &result {
                Ok(()) => {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                    if state.unhealthy
                        && state.consecutive_successes >= self.config.times_to_restore
                    {
                        state.unhealthy = false;
                        info!(primary = %self.primary.display(), "Primary storage healthy again");
                    }
                    None
                }
                Err(reason) => {
                    state.consecutive_successes = 0;
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    if !state.unhealthy
                        && state.consecutive_failures >= self.config.times_to_fallback
                    {
                        state.unhealthy = true;
                        Some(reason.clone())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(reason) = became_unhealthy {
            warn!(
                primary = %self.primary.display(),
                reason = %reason,
                "Primary storage declared unhealthy"
            );
            self.notify(&reason);
        }
    }

    fn notify(&self, reason: &str) {
        let live: Vec<Arc<dyn HealthObserver>> = {
            let mut observers = self.observers();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.unhealthy(self.config.fallback_path.clone(), reason);
        }
    }

    /// Write and remove a probe file of `data_size` bytes under the primary root.
    ///
    /// The timeout bounds writing and syncing; the probe file is removed either way.
    pub async fn probe(&self) -> io::Result<()> {
        let dir = self.primary.join(".health");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(random_temp_name());

        let mut file = tokio::fs::File::create(&path).await?;
        let write = async {
            let block = vec![0u8; 64 * 1024];
            let mut remaining = self.config.data_size;
            while remaining > 0 {
                let n = remaining.min(block.len() as u64) as usize;
                file.write_all(&block[..n]).await?;
                remaining -= n as u64;
            }
            file.sync_all().await
        };
        let result = match tokio::time::timeout(self.config.timeout(), write).await {
            Ok(written) => written,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("probe timed out after {:?}", self.config.timeout()),
            )),
        };

        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to remove health probe file");
        }
        result
    }

    /// Run one probe and report it.
    pub async fn check_once(&self) {
        let result = self.probe().await.map_err(|e| format!("probe failed: {e}"));
        if let Err(reason) = &result {
            debug!(primary = %self.primary.display(), reason = %reason, "Health probe failed");
        }
        self.report_probe(result);
    }

    /// Spawn the periodic probe task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                primary = %self.primary.display(),
                interval_secs = self.config.interval_secs,
                "Storage health monitor started"
            );
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        })
    }
}
