//! Concurrency gate for external model calls
//!
//! Every embedding and extraction call goes through one `CallGate`. The gate
//! admits at most `permits` calls at a time, queues the rest in arrival order
//! and bounds each call with a timeout. The permit is released when the call
//! returns, fails or times out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::provider::LlmError;
use crate::validation::{parse_validated, ValidateResponse};

/// Gate sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum concurrent calls
    pub permits: usize,
    /// Upper bound for a single call
    #[serde(with = "millis")]
    pub call_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            permits: 5,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl GateConfig {
    /// Read `LLM_MAX_CONCURRENT` and `LLM_CALL_TIMEOUT_MS`, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            permits: std::env::var("LLM_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|p| *p > 0)
                .unwrap_or(defaults.permits),
            call_timeout: std::env::var("LLM_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Default)]
struct GateCounters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of gate activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub waiting: usize,
    pub calls: u64,
    pub timeouts: u64,
    pub errors: u64,
}

/// Decrements the in-flight count on drop
struct InFlight<'a>(&'a GateCounters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a GateCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counts a caller queued for a permit, including one dropped while queued
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO semaphore plus per-call timeout, shared by all callers
#[derive(Debug, Clone)]
pub struct CallGate {
    semaphore: Arc<Semaphore>,
    config: GateConfig,
    counters: Arc<GateCounters>,
    waiting: Arc<AtomicUsize>,
}

impl Default for CallGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

impl CallGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.permits.max(1))),
            config,
            counters: Arc::new(GateCounters::default()),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Run `call` once a permit is free, bounded by the call timeout
    pub async fn call<T, F>(&self, call: F) -> Result<T, LlmError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        let queued = Waiting::enter(&self.waiting);
        let permit = self.semaphore.acquire().await;
        drop(queued);
        let _permit = permit.map_err(|_| LlmError::NotAvailable)?;

        let _slot = InFlight::enter(&self.counters);
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Gated call failed");
                Err(e)
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let ms = self.config.call_timeout.as_millis() as u64;
                warn!(timeout_ms = ms, "Gated call timed out");
                Err(LlmError::Timeout(ms))
            }
        }
    }

    /// Run a call returning raw text and parse it into a checked `T`
    pub async fn call_validated<T, F>(&self, call: F) -> Result<T, LlmError>
    where
        T: DeserializeOwned + ValidateResponse,
        F: Future<Output = Result<String, LlmError>>,
    {
        let raw = self.call(call).await?;
        parse_validated(&raw).inspect_err(|_| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Permits not currently held
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            calls: self.counters.calls.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ExtractedFields;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_permit() {
        let gate = CallGate::new(GateConfig {
            permits: 1,
            call_timeout: Duration::from_millis(100),
        });

        let result: Result<(), _> = gate
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(LlmError::Timeout(100)));
        assert_eq!(gate.available_permits(), 1);

        let ok = gate.call(async { Ok::<_, LlmError>(7) }).await;
        assert_eq!(ok, Ok(7));

        let stats = gate.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_not_counted() {
        let gate = CallGate::new(GateConfig {
            permits: 1,
            call_timeout: Duration::from_secs(5),
        });
        let (release, hold) = tokio::sync::oneshot::channel::<()>();

        let holder = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.call(async {
                    let _ = hold.await;
                    Ok::<_, LlmError>(())
                })
                .await
            }
        });
        while gate.stats().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let gave_up = tokio::time::timeout(
            Duration::from_millis(20),
            gate.call(async { Ok::<_, LlmError>(()) }),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(gate.stats().waiting, 0);

        release.send(()).unwrap();
        assert_eq!(holder.await.unwrap(), Ok(()));
        assert_eq!(gate.stats().in_flight, 0);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_counted_and_passed_through() {
        let gate = CallGate::default();
        let result: Result<(), _> = gate.call(async { Err(LlmError::RateLimited) }).await;
        assert_eq!(result, Err(LlmError::RateLimited));
        assert_eq!(gate.stats().errors, 1);
        assert_eq!(gate.available_permits(), 5);
    }

    #[tokio::test]
    async fn test_call_validated() {
        let gate = CallGate::default();
        let fields: ExtractedFields = gate
            .call_validated(async { Ok(r#"{"fields":[{"name":"city","value":"Oslo"}]}"#.to_string()) })
            .await
            .unwrap();
        assert_eq!(fields.fields[0].name, "city");

        let bad = gate
            .call_validated::<ExtractedFields, _>(async { Ok("{\"fields\": 3}".to_string()) })
            .await;
        assert!(matches!(bad, Err(LlmError::Validation(_))));
    }
}
