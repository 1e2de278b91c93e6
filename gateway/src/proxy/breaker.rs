use crate::spec::BreakerConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-endpoint granularity — each circuit-breaker rule in a version gets
/// its own breaker keyed by the rule, so one flaky endpoint trips without
/// taking the rest of the API down.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<EndpointBreaker>>,
}

struct EndpointBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: std::sync::Mutex<Option<Instant>>,
    config: BreakerConfig,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the breaker before an upstream forward.
pub enum BreakerCheck {
    Allowed,
    /// Half-open probe request.
    Probe,
    /// Open — reject without touching the upstream.
    Rejected,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str, config: &BreakerConfig) -> BreakerCheck {
        self.get_or_create(key, config).check()
    }

    pub fn record_success(&self, key: &str, config: &BreakerConfig) {
        self.get_or_create(key, config).record_success();
    }

    pub fn record_failure(&self, key: &str, config: &BreakerConfig) {
        self.get_or_create(key, config).record_failure();
    }

    fn get_or_create(&self, key: &str, config: &BreakerConfig) -> Arc<EndpointBreaker> {
        if let Some(entry) = self.breakers.get(key) {
            return entry.value().clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointBreaker {
                    state: AtomicU8::new(STATE_CLOSED),
                    consecutive_failures: AtomicU32::new(0),
                    half_open_successes: AtomicU32::new(0),
                    opened_at: std::sync::Mutex::new(None),
                    config: config.clone(),
                })
            })
            .clone()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBreaker {
    fn open_duration(&self) -> Duration {
        Duration::from_secs(self.config.open_duration_secs)
    }

    fn check(&self) -> BreakerCheck {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(at) = *opened_at {
                    if at.elapsed() >= self.open_duration() {
                        drop(opened_at);
                        // CAS so only one caller wins the probe slot.
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Relaxed);
                            return BreakerCheck::Probe;
                        }
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    tracing::info!("breaker: closed (recovered after {} successes)", count);
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(Instant::now());
                    tracing::warn!("breaker: opened (after {} consecutive failures)", count);
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                tracing::warn!("breaker: re-opened (probe failed in half-open)");
            }
            _ => {}
        }
    }
}
