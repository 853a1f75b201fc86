//! Circuit Breaker
//!
//! Per-provider state machine that fails fast when a backend is unhealthy:
//!
//! ```text
//! +--------+   threshold failures   +------+   probe delay   +-----------+
//! | Closed | ---------------------> | Open | --------------> | Half-Open |
//! +--------+                        +------+                 +-----------+
//!     ^                                 ^                         |
//!     |            success              |        failure          |
//!     +---------------------------------+-------------------------+
//! ```
//!
//! - **Closed**: requests allowed; consecutive failures are counted
//! - **Open**: the registry skips this provider at selection time
//! - **Half-Open**: one probe window; the next outcome decides
//!
//! # Probe Scheduling
//!
//! Entering Open starts a new episode and schedules exactly one delayed
//! Half-Open transition. The `probe_pending` flag lives under the same lock
//! as the state, so concurrent failures crossing the threshold cannot
//! schedule a second probe. When a tokio runtime is present the transition
//! is driven by a spawned timer; reads also apply it lazily once the delay
//! has elapsed, so the breaker behaves the same without a runtime.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderIdentity;

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Tripped, provider skipped
    Open,

    /// Testing recovery
    HalfOpen,
}

impl CircuitState {
    /// Whether requests may be routed to the provider
    #[must_use]
    pub fn allows_requests(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

// ============================================================================
// Circuit Configuration
// ============================================================================

/// Circuit breaker tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,

    /// Time spent Open before the Half-Open probe
    pub half_open_probe_delay: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            half_open_probe_delay: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Circuit Snapshot
// ============================================================================

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Provider this breaker guards
    pub identity: ProviderIdentity,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Whether a Half-Open transition is scheduled
    pub probe_pending: bool,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    probe_pending: bool,
    episode: u64,
}

/// Circuit breaker for one provider identity
///
/// All reads and writes are serialized through one mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    identity: ProviderIdentity,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker in the Closed state
    #[must_use]
    pub fn new(identity: ProviderIdentity, config: CircuitConfig) -> Self {
        Self {
            identity,
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    /// Provider this breaker guards
    #[must_use]
    pub fn identity(&self) -> ProviderIdentity {
        self.identity
    }

    /// Tuning in effect
    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state, applying an overdue probe transition first
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.apply_due_probe(&mut inner);
        inner.state
    }

    /// Whether the registry may select this provider
    pub fn is_available(&self) -> bool {
        self.state().allows_requests()
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.apply_due_probe(&mut inner);
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                tracing::info!(
                    provider = %self.identity,
                    "Circuit breaker closed - provider recovered"
                );
            }
            // Only the scheduled probe leaves Open
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    ///
    /// Takes the shared handle so that the delayed probe can reach the
    /// breaker without keeping it alive.
    pub fn record_failure(self: &Arc<Self>) {
        let scheduled = {
            let mut inner = self.inner.lock();
            self.apply_due_probe(&mut inner);
            inner.total_failures += 1;

            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.trip(&mut inner)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_failures += 1;
                    self.trip(&mut inner)
                }
                CircuitState::Open => None,
            }
        };

        if let Some(episode) = scheduled {
            self.schedule_probe(episode);
        }
    }

    /// Snapshot of the breaker
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.apply_due_probe(&mut inner);
        CircuitSnapshot {
            identity: self.identity,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            probe_pending: inner.probe_pending,
        }
    }

    /// Return to the initial Closed state (test support)
    ///
    /// Bumps the episode so an in-flight probe timer becomes a no-op.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let episode = inner.episode + 1;
        *inner = BreakerState {
            episode,
            ..BreakerState::default()
        };
    }

    /// Enter Open and start a new episode
    ///
    /// Returns the episode to schedule a probe for, or `None` when one is
    /// already pending.
    fn trip(&self, inner: &mut BreakerState) -> Option<u64> {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());

        tracing::warn!(
            provider = %self.identity,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opened - provider marked unhealthy"
        );

        if inner.probe_pending {
            return None;
        }
        inner.episode += 1;
        inner.probe_pending = true;
        Some(inner.episode)
    }

    fn schedule_probe(self: &Arc<Self>, episode: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: the transition is applied lazily on the next read
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = self.config.half_open_probe_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(breaker) = weak.upgrade() {
                breaker.fire_probe(episode);
            }
        });
    }

    fn fire_probe(&self, episode: u64) {
        let mut inner = self.inner.lock();
        if inner.episode == episode {
            self.enter_half_open(&mut inner);
        }
    }

    fn apply_due_probe(&self, inner: &mut BreakerState) {
        let due = inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.config.half_open_probe_delay);
        if due {
            self.enter_half_open(inner);
        }
    }

    fn enter_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open || !inner.probe_pending {
            return;
        }
        inner.state = CircuitState::HalfOpen;
        inner.probe_pending = false;
        tracing::info!(provider = %self.identity, "Circuit breaker transitioning to half-open");
    }
}
