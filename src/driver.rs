//! Load driver: spawns one worker per connection and waits for all of them.

use crate::config::Config;
use crate::report::Report;
use crate::worker::{self, WorkerError, WorkerOptions, WorkerReport};
use chrono::Utc;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run the benchmark to completion.
pub async fn run(config: &Config) -> Result<Report, DriverError> {
    run_until(config, std::future::pending()).await
}

/// Run the benchmark, stopping early if `shutdown` resolves first.
///
/// On shutdown the outstanding workers are aborted and the report is
/// marked as interrupted. Counts from workers that already finished are kept.
pub async fn run_until<F>(config: &Config, shutdown: F) -> Result<Report, DriverError>
where
    F: Future<Output = ()>,
{
    let addr = resolve(&config.target).await?;
    let options = Arc::new(WorkerOptions::from(config));

    info!(
        server = %config.target,
        addr = %addr,
        connections = config.connections,
        iterations = config.iterations,
        payload_len = config.payload.len(),
        verify = config.verify,
        "Starting benchmark"
    );

    let started_at = Utc::now();
    let start = Instant::now();

    let mut handles: Vec<JoinHandle<WorkerReport>> = Vec::with_capacity(config.connections);
    for id in 0..config.connections {
        let options = Arc::clone(&options);
        handles.push(tokio::spawn(async move { worker::run(id, addr, &options).await }));
    }

    let mut reports = Vec::with_capacity(handles.len());
    let mut interrupted = false;
    {
        let join_all = join_workers(&mut handles, &mut reports);
        tokio::pin!(join_all);
        tokio::pin!(shutdown);

        tokio::select! {
            _ = &mut join_all => {}
            _ = &mut shutdown => {
                warn!("Shutdown requested, aborting outstanding workers");
                interrupted = true;
            }
        }
    }

    if interrupted {
        // Workers already collected keep their reports; the rest are aborted
        // and still awaited so none outlives the run.
        let done = reports.len();
        for (offset, handle) in handles.drain(done..).enumerate() {
            handle.abort();
            reports.push(collect(done + offset, handle).await);
        }
    }

    let elapsed = start.elapsed();

    let report = Report::new(config, started_at, elapsed, &reports, interrupted);
    if let Some((id, e)) = reports.iter().find_map(|w| w.error.as_ref().map(|e| (w.id, e))) {
        warn!(worker = id, error = %e, "First worker failure");
    }
    if report.failed_workers > 0 {
        warn!(
            failed_workers = report.failed_workers,
            completed = report.completed_requests,
            total = report.total_requests,
            "Some workers failed; nominal QPS overstates achieved throughput"
        );
    }
    info!(
        elapsed_secs = elapsed.as_secs_f64(),
        completed = report.completed_requests,
        "Benchmark finished"
    );

    Ok(report)
}

/// Await every handle in order, pushing each worker's report.
async fn join_workers(handles: &mut [JoinHandle<WorkerReport>], reports: &mut Vec<WorkerReport>) {
    for (id, handle) in handles.iter_mut().enumerate() {
        reports.push(collect(id, handle).await);
    }
}

/// Turn a finished task into a report, counting a panic or abort as a failure.
async fn collect<H>(id: usize, handle: H) -> WorkerReport
where
    H: Future<Output = Result<WorkerReport, tokio::task::JoinError>>,
{
    match handle.await {
        Ok(report) => report,
        Err(e) => {
            debug!(worker = id, error = %e, "Worker task did not finish");
            WorkerReport {
                id,
                completed: 0,
                error: Some(WorkerError::Aborted),
            }
        }
    }
}

async fn resolve(target: &str) -> Result<SocketAddr, DriverError> {
    tokio::net::lookup_host(target)
        .await
        .map_err(|e| DriverError::Resolve(target.to_string(), e))?
        .next()
        .ok_or_else(|| {
            DriverError::Resolve(
                target.to_string(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
            )
        })
}

/// Errors that stop the run before any worker starts
#[derive(Debug)]
pub enum DriverError {
    Resolve(String, std::io::Error),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Resolve(target, e) => {
                write!(f, "Failed to resolve target '{target}': {e}")
            }
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Resolve(_, e) => Some(e),
        }
    }
}
