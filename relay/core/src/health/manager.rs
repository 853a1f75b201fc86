//! Health Manager
//!
//! Owns one [`CircuitBreaker`] per provider identity and accepts outcome
//! reports from request paths.
//!
//! # Reporting
//!
//! Request paths must never block on health bookkeeping. [`HealthManager::report`]
//! is a best-effort hand-off: when a recorder worker is running the outcome
//! is pushed onto a bounded channel with `try_send` and dropped if the queue
//! is full or closed; otherwise it is applied inline, which only takes the
//! breaker's mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
use crate::provider::ProviderIdentity;

/// Default capacity of the recorder queue
pub const DEFAULT_RECORDER_CAPACITY: usize = 256;

/// Result of a call, as seen by the health layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The call succeeded
    Success,
    /// The call failed
    Failure,
}

type Report = (ProviderIdentity, HealthOutcome);

/// Per-identity circuit breakers
pub struct HealthManager {
    breakers: DashMap<ProviderIdentity, Arc<CircuitBreaker>>,
    config: CircuitConfig,
    recorder: Mutex<Option<mpsc::Sender<Report>>>,
    dropped_reports: AtomicU64,
}

impl HealthManager {
    /// Create a manager whose breakers use `config`
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            recorder: Mutex::new(None),
            dropped_reports: AtomicU64::new(0),
        }
    }

    /// Breaker tuning
    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get or create the breaker for an identity
    pub fn breaker(&self, identity: ProviderIdentity) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(identity)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(identity, self.config.clone())))
            .clone()
    }

    /// Whether an identity may be selected
    ///
    /// Identities with no recorded outcomes are Closed.
    pub fn is_available(&self, identity: ProviderIdentity) -> bool {
        self.breakers
            .get(&identity)
            .is_none_or(|b| b.is_available())
    }

    /// Current state of an identity's circuit
    pub fn state(&self, identity: ProviderIdentity) -> CircuitState {
        self.breakers
            .get(&identity)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Record a success synchronously
    pub fn record_success(&self, identity: ProviderIdentity) {
        self.breaker(identity).record_success();
    }

    /// Record a failure synchronously
    pub fn record_failure(&self, identity: ProviderIdentity) {
        self.breaker(identity).record_failure();
    }

    /// Hand off an outcome without blocking
    pub fn report(&self, identity: ProviderIdentity, outcome: HealthOutcome) {
        let sender = self.recorder.lock().clone();
        match sender {
            Some(tx) => {
                if let Err(err) = tx.try_send((identity, outcome)) {
                    self.dropped_reports.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(provider = %identity, error = %err, "Dropped health report");
                }
            }
            None => self.apply(identity, outcome),
        }
    }

    /// Start a worker that drains reported outcomes
    ///
    /// Replaces any previous recorder; the old worker exits once its queue
    /// drains. Outside a tokio runtime nothing is spawned, `None` is
    /// returned and reports keep being applied inline.
    pub fn spawn_recorder(self: &Arc<Self>, capacity: usize) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime, health reports stay inline");
            return None;
        };

        let (tx, mut rx) = mpsc::channel::<Report>(capacity.max(1));
        *self.recorder.lock() = Some(tx);

        let weak: Weak<Self> = Arc::downgrade(self);
        Some(handle.spawn(async move {
            while let Some((identity, outcome)) = rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.apply(identity, outcome);
            }
            tracing::debug!("Health recorder stopped");
        }))
    }

    /// Stop routing reports through the recorder
    ///
    /// Reports made afterwards are applied inline.
    pub fn stop_recorder(&self) {
        self.recorder.lock().take();
    }

    /// Whether a recorder is attached
    pub fn has_recorder(&self) -> bool {
        self.recorder.lock().is_some()
    }

    /// Reports dropped because the recorder queue was full or closed
    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports.load(Ordering::Relaxed)
    }

    /// Snapshots of every tracked breaker, ordered by identity
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by_key(|s| s.identity);
        snapshots
    }

    /// Reset all breakers to Closed (test support)
    pub fn reset(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
        self.breakers.clear();
        self.dropped_reports.store(0, Ordering::Relaxed);
    }

    fn apply(&self, identity: ProviderIdentity, outcome: HealthOutcome) {
        match outcome {
            HealthOutcome::Success => self.record_success(identity),
            HealthOutcome::Failure => self.record_failure(identity),
        }
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl std::fmt::Debug for HealthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthManager")
            .field("config", &self.config)
            .field("tracked", &self.breakers.len())
            .field("recorder", &self.has_recorder())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(threshold: u32) -> HealthManager {
        HealthManager::new(CircuitConfig {
            failure_threshold: threshold,
            half_open_probe_delay: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_untracked_identity_is_available() {
        let health = manager(3);
        assert!(health.is_available(ProviderIdentity::OpenAi));
        assert_eq!(health.state(ProviderIdentity::OpenAi), CircuitState::Closed);
        assert!(health.snapshots().is_empty());
    }

    #[test]
    fn test_breakers_are_per_identity() {
        let health = manager(2);
        health.record_failure(ProviderIdentity::Google);
        health.record_failure(ProviderIdentity::Google);
        health.record_failure(ProviderIdentity::XAi);

        assert!(!health.is_available(ProviderIdentity::Google));
        assert!(health.is_available(ProviderIdentity::XAi));

        let snapshots = health.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].identity, ProviderIdentity::Google);
        assert_eq!(snapshots[0].state, CircuitState::Open);
    }

    #[test]
    fn test_report_without_recorder_applies_inline() {
        let health = manager(1);
        health.report(ProviderIdentity::Dial, HealthOutcome::Failure);
        assert_eq!(health.state(ProviderIdentity::Dial), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_recorder_applies_reports() {
        let health = Arc::new(manager(2));
        let _worker = health.spawn_recorder(16);

        health.report(ProviderIdentity::Google, HealthOutcome::Failure);
        health.report(ProviderIdentity::Google, HealthOutcome::Failure);

        for _ in 0..100 {
            if health.state(ProviderIdentity::Google) == CircuitState::Open {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(health.state(ProviderIdentity::Google), CircuitState::Open);
        assert_eq!(health.dropped_reports(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_reports() {
        let health = Arc::new(manager(100));
        let _worker = health.spawn_recorder(2);

        // The worker cannot run until we yield, so the queue fills up
        for _ in 0..5 {
            health.report(ProviderIdentity::OpenAi, HealthOutcome::Success);
        }
        assert_eq!(health.dropped_reports(), 3);
    }

    #[tokio::test]
    async fn test_stop_recorder_falls_back_to_inline() {
        let health = Arc::new(manager(1));
        let worker = health.spawn_recorder(DEFAULT_RECORDER_CAPACITY).unwrap();
        assert!(health.has_recorder());

        health.stop_recorder();
        assert!(!health.has_recorder());
        // The sender is gone, so the worker drains and exits
        worker.await.unwrap();

        health.report(ProviderIdentity::XAi, HealthOutcome::Failure);
        assert_eq!(health.state(ProviderIdentity::XAi), CircuitState::Open);
        assert_eq!(health.dropped_reports(), 0);
    }

    #[test]
    fn test_spawn_recorder_outside_runtime_stays_inline() {
        let health = Arc::new(manager(1));
        assert!(health.spawn_recorder(DEFAULT_RECORDER_CAPACITY).is_none());
        assert!(!health.has_recorder());

        health.report(ProviderIdentity::Google, HealthOutcome::Failure);
        assert_eq!(health.state(ProviderIdentity::Google), CircuitState::Open);
    }

    #[test]
    fn test_reset_clears_breakers() {
        let health = manager(1);
        health.record_failure(ProviderIdentity::Google);
        health.reset();

        assert!(health.is_available(ProviderIdentity::Google));
        assert!(health.snapshots().is_empty());
    }
}
