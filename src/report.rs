//! Run summary and its console/JSON rendering.

use crate::config::Config;
use crate::worker::WorkerReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Aggregate result of one benchmark run.
///
/// `total_requests` is the nominal `connections * iterations`, whatever the
/// workers actually achieved; `completed_requests` is what they achieved.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub target: String,
    pub connections: usize,
    pub iterations: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_workers: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl Report {
    pub fn new(
        config: &Config,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        workers: &[WorkerReport],
        interrupted: bool,
    ) -> Self {
        Self {
            started_at,
            target: config.target.clone(),
            connections: config.connections,
            iterations: config.iterations,
            total_requests: config.total_requests(),
            completed_requests: workers.iter().map(|w| w.completed).sum(),
            failed_workers: workers.iter().filter(|w| w.is_failed()).count(),
            elapsed,
            interrupted,
        }
    }

    /// Requests per second over the nominal total.
    pub fn qps(&self) -> f64 {
        rate(self.total_requests, self.elapsed)
    }

    /// Requests per second over the round-trips that actually finished.
    pub fn completed_qps(&self) -> f64 {
        rate(self.completed_requests, self.elapsed)
    }

    /// Render as a single JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Json<'a> {
            #[serde(flatten)]
            report: &'a Report,
            qps: f64,
            completed_qps: f64,
        }

        serde_json::to_string_pretty(&Json {
            report: self,
            qps: self.qps(),
            completed_qps: self.completed_qps(),
        })
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn serialize_secs<S>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(elapsed.as_secs_f64())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total requests: {}", self.total_requests)?;
        writeln!(f, "Elapsed: {:.2} s", self.elapsed.as_secs_f64())?;
        writeln!(f, "QPS: {:.2}", self.qps())?;
        writeln!(f, "Completed: {}", self.completed_requests)?;
        write!(f, "Failed workers: {}", self.failed_workers)?;
        if self.interrupted {
            write!(f, "\nInterrupted")?;
        }
        Ok(())
    }
}
