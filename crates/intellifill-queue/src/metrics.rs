//! Queue metrics and health

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobCounts, JobEntry, JobState};

/// Ceilings a queue must stay under to be reported healthy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_active: u64,
    pub max_waiting: u64,
    /// Fraction of recent finished jobs that failed (0.0 - 1.0)
    pub max_failure_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_active: 100,
            max_waiting: 1_000,
            max_failure_rate: 0.1,
        }
    }
}

/// Health verdict with the reasons a queue is unhealthy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub healthy: bool,
    pub reasons: Vec<String>,
}

/// Point-in-time snapshot of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub counts: JobCounts,
    /// Mean processing time over the sampled finished jobs
    pub avg_processing_ms: f64,
    /// Failed share of the sampled finished jobs
    pub failure_rate: f64,
    /// Number of finished jobs the averages were computed over
    pub sampled: usize,
    pub collected_at: DateTime<Utc>,
}

impl QueueMetrics {
    /// Build metrics from store counts and the most recent finished jobs
    pub fn from_recent(queue: &str, counts: JobCounts, recent: &[JobEntry]) -> Self {
        let durations: Vec<f64> = recent
            .iter()
            .filter_map(|j| j.processing_time())
            .map(|d| d.as_secs_f64() * 1_000.0)
            .collect();
        let avg_processing_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        let failed = recent.iter().filter(|j| j.state == JobState::Failed).count();
        let failure_rate = if recent.is_empty() {
            0.0
        } else {
            failed as f64 / recent.len() as f64
        };

        Self {
            queue: queue.to_string(),
            counts,
            avg_processing_ms,
            failure_rate,
            sampled: recent.len(),
            collected_at: Utc::now(),
        }
    }

    pub fn health(&self, thresholds: &HealthThresholds) -> QueueHealth {
        let mut reasons = Vec::new();

        if self.counts.active >= thresholds.max_active {
            reasons.push(format!(
                "active jobs {} at or above ceiling {}",
                self.counts.active, thresholds.max_active
            ));
        }
        if self.counts.waiting >= thresholds.max_waiting {
            reasons.push(format!(
                "waiting jobs {} at or above ceiling {}",
                self.counts.waiting, thresholds.max_waiting
            ));
        }
        if self.failure_rate >= thresholds.max_failure_rate {
            reasons.push(format!(
                "failure rate {:.2} at or above {:.2}",
                self.failure_rate, thresholds.max_failure_rate
            ));
        }

        QueueHealth {
            healthy: reasons.is_empty(),
            reasons,
        }
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let q = &self.queue;

        output.push_str("# HELP intellifill_queue_jobs Jobs per state\n");
        output.push_str("# TYPE intellifill_queue_jobs gauge\n");
        for (state, value) in [
            ("waiting", self.counts.waiting),
            ("active", self.counts.active),
            ("completed", self.counts.completed),
            ("failed", self.counts.failed),
            ("delayed", self.counts.delayed),
        ] {
            output.push_str(&format!(
                "intellifill_queue_jobs{{queue=\"{}\",state=\"{}\"}} {}\n",
                q, state, value
            ));
        }

        output.push_str(
            "# HELP intellifill_queue_processing_ms_avg Mean processing time of recent jobs\n",
        );
        output.push_str("# TYPE intellifill_queue_processing_ms_avg gauge\n");
        output.push_str(&format!(
            "intellifill_queue_processing_ms_avg{{queue=\"{}\"}} {:.2}\n",
            q, self.avg_processing_ms
        ));

        output.push_str("# HELP intellifill_queue_failure_rate Failed share of recent jobs\n");
        output.push_str("# TYPE intellifill_queue_failure_rate gauge\n");
        output.push_str(&format!(
            "intellifill_queue_failure_rate{{queue=\"{}\"}} {:.4}\n",
            q, self.failure_rate
        ));

        output
    }
}
