//! Bounded retry with exponential backoff behind a circuit breaker.
//!
//! The breaker counts consecutive failures across every operation routed
//! through one manager. At the threshold it opens and rejects instantly for
//! the reset window, then admits a single half-open trial whose outcome
//! decides between closing and reopening.

use crate::classify::{Classification, ErrorKind};
use core_config::RetryConfig;
use core_events::{EngineEvent, EventBus};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kinds that never re-enter the operation, regardless of policy.
const NON_RETRYABLE: [ErrorKind; 6] = [
    ErrorKind::SyntaxError,
    ErrorKind::ParameterError,
    ErrorKind::HardLimit,
    ErrorKind::SoftLimit,
    ErrorKind::AbortCycle,
    ErrorKind::Cancelled,
];

/// Terminal result of [`RetryManager::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// The breaker was open; the operation never ran.
    BreakerOpen,
    /// A non-retryable kind short-circuited after one attempt.
    NonRetryable(Classification),
    /// Every allowed attempt failed.
    Exhausted {
        attempts: u32,
        last: Classification,
    },
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Breaker {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    succeeded_on_retry: AtomicU64,
    exhausted: AtomicU64,
    breaker_trips: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTelemetrySnapshot {
    pub total: u64,
    pub succeeded_on_retry: u64,
    pub exhausted: u64,
    pub breaker_trips: u64,
}

pub struct RetryManager {
    config: RetryConfig,
    bus: EventBus,
    breaker: Mutex<Breaker>,
    counters: Counters,
}

impl RetryManager {
    pub fn new(config: RetryConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            breaker: Mutex::new(Breaker::Closed {
                consecutive_failures: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Run `op` under the retry policy. The closure classifies its own
    /// failures; the returned classification decides retryability.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Classification>>,
    {
        if !self.admit() {
            return Err(RetryError::BreakerOpen);
        }
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let max_attempts = self.config.max_retries + 1;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.counters.succeeded_on_retry.fetch_add(1, Ordering::Relaxed);
                        debug!(target: "recover.retry", attempt, "succeeded_on_retry");
                    }
                    self.on_success();
                    return Ok(value);
                }
                Err(classification) => {
                    let non_retryable = !classification.retryable
                        || NON_RETRYABLE.contains(&classification.kind);
                    if non_retryable {
                        self.on_failure();
                        debug!(
                            target: "recover.retry",
                            kind = classification.kind.as_str(),
                            "non_retryable_short_circuit"
                        );
                        return Err(RetryError::NonRetryable(classification));
                    }
                    if attempt >= max_attempts {
                        self.on_failure();
                        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target: "recover.retry",
                            attempts = attempt,
                            kind = classification.kind.as_str(),
                            "retries_exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: classification,
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        target: "recover.retry",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = classification.kind.as_str(),
                        "retrying_after_backoff"
                    );
                    self.mini_recovery(classification.kind).await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Exponential delay for the attempt just failed, capped and jittered.
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(exponent as i32);
        let capped = base.min(self.config.max_delay_ms as f64) as u64;
        capped
            .checked_add(jitter_ms(self.config.jitter_ms))
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(self.config.max_delay_ms))
    }

    /// Kind-specific settling before the next attempt.
    async fn mini_recovery(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::ConnectionLost | ErrorKind::PortUnavailable => {
                // Give the link a window to come back before burning a retry.
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            ErrorKind::BufferError => {
                // Let the controller drain its planner and rx queues.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            kind if kind.is_alarm() => {
                // Alarms route to the supervisor via the alarm listener; the
                // retry path never unlocks the machine itself.
                debug!(target: "recover.retry", kind = kind.as_str(), "alarm_left_to_supervisor");
            }
            _ => {}
        }
    }

    /// Admission check; may transition Open to HalfOpen.
    fn admit(&self) -> bool {
        let mut breaker = self.breaker.lock().expect("breaker poisoned");
        match &*breaker {
            Breaker::Closed { .. } => true,
            Breaker::HalfOpen => true,
            Breaker::Open { since } => {
                if since.elapsed() >= self.config.breaker_reset() {
                    info!(target: "recover.retry", "breaker_half_open");
                    *breaker = Breaker::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut breaker = self.breaker.lock().expect("breaker poisoned");
        match &*breaker {
            Breaker::Closed {
                consecutive_failures: 0,
            } => {}
            Breaker::HalfOpen => {
                info!(target: "recover.retry", "breaker_closed");
                *breaker = Breaker::Closed {
                    consecutive_failures: 0,
                };
                self.bus.emit(EngineEvent::BreakerClosed);
            }
            _ => {
                *breaker = Breaker::Closed {
                    consecutive_failures: 0,
                };
            }
        }
    }

    fn on_failure(&self) {
        let mut breaker = self.breaker.lock().expect("breaker poisoned");
        match &mut *breaker {
            Breaker::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.breaker_threshold {
                    let failures = *consecutive_failures;
                    warn!(target: "recover.retry", failures, "breaker_opened");
                    self.counters.breaker_trips.fetch_add(1, Ordering::Relaxed);
                    *breaker = Breaker::Open {
                        since: Instant::now(),
                    };
                    self.bus.emit(EngineEvent::BreakerOpened {
                        consecutive_failures: failures,
                    });
                }
            }
            Breaker::HalfOpen => {
                warn!(target: "recover.retry", "breaker_reopened_after_trial");
                self.counters.breaker_trips.fetch_add(1, Ordering::Relaxed);
                *breaker = Breaker::Open {
                    since: Instant::now(),
                };
                self.bus.emit(EngineEvent::BreakerOpened {
                    consecutive_failures: self.config.breaker_threshold,
                });
            }
            Breaker::Open { .. } => {}
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        match &*self.breaker.lock().expect("breaker poisoned") {
            Breaker::Closed { .. } => BreakerState::Closed,
            Breaker::Open { .. } => BreakerState::Open,
            Breaker::HalfOpen => BreakerState::HalfOpen,
        }
    }

    pub fn telemetry(&self) -> RetryTelemetrySnapshot {
        RetryTelemetrySnapshot {
            total: self.counters.total.load(Ordering::Relaxed),
            succeeded_on_retry: self.counters.succeeded_on_retry.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            breaker_trips: self.counters.breaker_trips.load(Ordering::Relaxed),
        }
    }
}

/// Cheap jitter from the wall clock's sub-millisecond noise. Uniformity does
/// not matter here, only decorrelation of concurrent retry loops.
fn jitter_ms(jitter_max_ms: u64) -> u64 {
    if jitter_max_ms == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % jitter_max_ms
}
