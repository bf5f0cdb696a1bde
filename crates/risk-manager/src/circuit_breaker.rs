use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trading_core::{CircuitOpenError, Clock, ConfigError, CoreEvent, EventSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Cool-down after the last failure before a probe is allowed
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.open_duration.is_zero() {
            return Err(ConfigError::invalid("open_duration", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open { since: DateTime<Utc> },
    HalfOpen { probe_in_flight: bool },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// How a guarded call ended, as far as the failure domain is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The domain answered (including business rejections)
    Success,
    /// Timeout, connection or server failure
    Failure,
    /// Throttled: says nothing about health
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Admit,
    Success { probe: bool },
    Failure { probe: bool },
    Neutral { probe: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerSnapshot {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admitted { probe: bool },
    Rejected { retry_in: Duration },
    Recorded,
}

/// The only place breaker state changes.
pub fn transition(
    current: BreakerSnapshot,
    event: BreakerEvent,
    now: DateTime<Utc>,
    config: &BreakerConfig,
) -> (BreakerSnapshot, Verdict) {
    let mut next = current;

    let verdict = match (current.state, event) {
        (CircuitState::Closed, BreakerEvent::Admit) => Verdict::Admitted { probe: false },
        (CircuitState::Open { since }, BreakerEvent::Admit) => {
            let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= config.open_duration {
                next.state = CircuitState::HalfOpen { probe_in_flight: true };
                Verdict::Admitted { probe: true }
            } else {
                Verdict::Rejected {
                    retry_in: config.open_duration - elapsed,
                }
            }
        }
        (CircuitState::HalfOpen { probe_in_flight: true }, BreakerEvent::Admit) => {
            Verdict::Rejected { retry_in: Duration::ZERO }
        }
        (CircuitState::HalfOpen { probe_in_flight: false }, BreakerEvent::Admit) => {
            next.state = CircuitState::HalfOpen { probe_in_flight: true };
            Verdict::Admitted { probe: true }
        }

        (CircuitState::Closed, BreakerEvent::Success { .. }) => {
            next.consecutive_failures = 0;
            Verdict::Recorded
        }
        (CircuitState::HalfOpen { .. }, BreakerEvent::Success { probe: true }) => {
            next.state = CircuitState::Closed;
            next.consecutive_failures = 0;
            Verdict::Recorded
        }

        (CircuitState::Closed, BreakerEvent::Failure { .. }) => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.last_failure_at = Some(now);
            if next.consecutive_failures >= config.failure_threshold {
                next.state = CircuitState::Open { since: now };
            }
            Verdict::Recorded
        }
        (CircuitState::HalfOpen { .. }, BreakerEvent::Failure { probe: true }) => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.last_failure_at = Some(now);
            next.state = CircuitState::Open { since: now };
            Verdict::Recorded
        }
        // Late failure from a call admitted before the breaker opened
        (CircuitState::Open { .. }, BreakerEvent::Failure { .. }) => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.last_failure_at = Some(now);
            next.state = CircuitState::Open { since: now };
            Verdict::Recorded
        }

        (CircuitState::HalfOpen { .. }, BreakerEvent::Neutral { probe: true }) => {
            next.state = CircuitState::HalfOpen { probe_in_flight: false };
            Verdict::Recorded
        }

        // Stale non-probe outcomes while open/half-open, and neutral outcomes elsewhere
        _ => Verdict::Recorded,
    };

    (next, verdict)
}

struct Shared {
    domain: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    state: Mutex<BreakerSnapshot>,
}

impl Shared {
    fn step(&self, event: BreakerEvent) -> Verdict {
        let now = self.clock.now();
        let (before, after, verdict) = {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let before = *guard;
            let (after, verdict) = transition(before, event, now, &self.config);
            *guard = after;
            (before, after, verdict)
        };

        if before.state.name() != after.state.name() {
            self.log_transition(&before, &after, now);
        }
        verdict
    }

    fn log_transition(&self, before: &BreakerSnapshot, after: &BreakerSnapshot, now: DateTime<Utc>) {
        match after.state {
            CircuitState::Open { .. } => tracing::warn!(
                "Circuit breaker {} OPEN after {} consecutive failures ({} -> open)",
                self.domain,
                after.consecutive_failures,
                before.state.name()
            ),
            CircuitState::HalfOpen { .. } => tracing::info!(
                "Circuit breaker {} half-open, probing",
                self.domain
            ),
            CircuitState::Closed => tracing::info!("Circuit breaker {} closed", self.domain),
        }

        self.events.emit(CoreEvent::BreakerTransition {
            domain: self.domain.clone(),
            from: before.state.name().to_string(),
            to: after.state.name().to_string(),
            consecutive_failures: after.consecutive_failures,
            at: now,
        });
    }
}

/// Admission ticket for one guarded call. Must be handed back through
/// [`CircuitBreaker::check_and_record`]; a dropped probe permit is released as neutral.
#[must_use = "record the call outcome with check_and_record"]
pub struct Permit {
    shared: Arc<Shared>,
    probe: bool,
    recorded: bool,
}

impl Permit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.recorded && self.probe {
            self.shared.step(BreakerEvent::Neutral { probe: true });
        }
    }
}

#[derive(Error, Debug)]
pub enum GuardError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Call(E),
}

/// Three-state breaker for one failure domain. Cloning shares the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(
        domain: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                domain: domain.into(),
                config,
                clock,
                events,
                state: Mutex::new(BreakerSnapshot::closed()),
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    /// Ask to make a guarded call. While open this fails fast without touching the domain.
    pub fn admit(&self) -> Result<Permit, CircuitOpenError> {
        match self.shared.step(BreakerEvent::Admit) {
            Verdict::Admitted { probe } => Ok(Permit {
                shared: Arc::clone(&self.shared),
                probe,
                recorded: false,
            }),
            Verdict::Rejected { retry_in } => Err(CircuitOpenError {
                domain: self.shared.domain.clone(),
                retry_in,
            }),
            Verdict::Recorded => Err(CircuitOpenError {
                domain: self.shared.domain.clone(),
                retry_in: Duration::ZERO,
            }),
        }
    }

    /// Record the outcome of an admitted call. Consumes the permit, so exactly once.
    pub fn check_and_record(&self, mut permit: Permit, outcome: CallOutcome) {
        permit.recorded = true;
        let probe = permit.probe;
        let event = match outcome {
            CallOutcome::Success => BreakerEvent::Success { probe },
            CallOutcome::Failure => BreakerEvent::Failure { probe },
            CallOutcome::Neutral => BreakerEvent::Neutral { probe },
        };
        permit.shared.step(event);
    }

    /// Admit, run `op`, classify and record its result.
    pub async fn guard<T, E, F, Fut, C>(&self, op: F, classify: C) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> CallOutcome,
    {
        let permit = self.admit()?;
        let result = op().await;
        self.check_and_record(permit, classify(&result));
        result.map_err(GuardError::Call)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while open and still cooling down. Read-only.
    pub fn is_open(&self) -> bool {
        match self.snapshot().state {
            CircuitState::Open { since } => {
                let elapsed = (self.shared.clock.now() - since)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed < self.shared.config.open_duration
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("domain", &self.shared.domain)
            .field("state", &self.snapshot())
            .finish()
    }
}
