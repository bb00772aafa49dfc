//! Memory back-pressure between embedding batches

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tracing::warn;

use crate::error::PipelineError;

const MB: u64 = 1024 * 1024;

/// Source of the process's resident memory
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    /// Resident bytes, or `None` when unavailable
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads resident memory of the current process through `sysinfo`
#[derive(Debug)]
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryGuardConfig {
    pub threshold_mb: u64,
    /// Checks made before giving up
    pub max_waits: u32,
    /// First pause; doubles on each further check
    pub base_wait_ms: u64,
}

impl Default for MemoryGuardConfig {
    fn default() -> Self {
        Self {
            threshold_mb: 1024,
            max_waits: 5,
            base_wait_ms: 200,
        }
    }
}

#[derive(Debug)]
pub struct MemoryGuard {
    probe: Box<dyn MemoryProbe>,
    config: MemoryGuardConfig,
}

impl Default for MemoryGuard {
    fn default() -> Self {
        Self::new(Box::new(SysinfoProbe::default()), MemoryGuardConfig::default())
    }
}

impl MemoryGuard {
    pub fn new(probe: Box<dyn MemoryProbe>, config: MemoryGuardConfig) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &MemoryGuardConfig {
        &self.config
    }

    /// Wait until resident memory drops below the threshold.
    ///
    /// Gives up with a retryable error after `max_waits` pauses. An
    /// unreadable probe never blocks.
    pub async fn check(&self) -> Result<(), PipelineError> {
        let limit = self.config.threshold_mb * MB;
        let mut wait = Duration::from_millis(self.config.base_wait_ms);

        for attempt in 0..=self.config.max_waits {
            let Some(used) = self.probe.resident_bytes() else {
                return Ok(());
            };
            if used < limit {
                return Ok(());
            }
            if attempt == self.config.max_waits {
                return Err(PipelineError::MemoryPressure {
                    used_mb: used / MB,
                    limit_mb: self.config.threshold_mb,
                });
            }

            warn!(
                used_mb = used / MB,
                limit_mb = self.config.threshold_mb,
                wait_ms = wait.as_millis() as u64,
                "Memory above threshold, pausing"
            );
            tokio::time::sleep(wait).await;
            wait *= 2;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed sequence of readings, repeating the last one
    #[derive(Debug)]
    pub(crate) struct ScriptedProbe {
        readings: Vec<u64>,
        next: AtomicUsize,
    }

    impl ScriptedProbe {
        pub(crate) fn new(readings_mb: &[u64]) -> Self {
            Self {
                readings: readings_mb.iter().map(|mb| mb * MB).collect(),
                next: AtomicUsize::new(0),
            }
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            let i = self.next.fetch_add(1, Ordering::SeqCst);
            self.readings
                .get(i)
                .or(self.readings.last())
                .copied()
        }
    }

    fn guard(readings_mb: &[u64]) -> MemoryGuard {
        MemoryGuard::new(
            Box::new(ScriptedProbe::new(readings_mb)),
            MemoryGuardConfig {
                threshold_mb: 100,
                max_waits: 3,
                base_wait_ms: 10,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_pressure_to_clear() {
        assert!(guard(&[150, 120, 80]).check().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_pressure_is_retryable_error() {
        let err = guard(&[500]).check().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MemoryPressure {
                used_mb: 500,
                limit_mb: 100
            }
        ));
    }

    #[test]
    fn test_sysinfo_probe_reads_something() {
        assert!(SysinfoProbe::default().resident_bytes().unwrap_or(1) > 0);
    }
}
