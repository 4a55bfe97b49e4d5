// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded worker pool for independent units of work.
//!
//! ```text
//!              ┌──────────── task queue ────────────┐
//!  dispatcher ─┤ Unit, Unit, ...        Stop × N    ├─► worker 0..N
//!              └────────────────────────────────────┘      │ own handle
//!        ▲                                                  │ per-unit retry
//!        └──────────────────── result queue ◄───────────────┘
//! ```
//!
//! Each worker opens its own handle (e.g. a repository connection) and
//! shares nothing else with its siblings. A unit is retried with bounded
//! exponential backoff while its error is retryable; on exhaustion the
//! failure is reported and siblings carry on. Units complete in any order.
//! Once every unit is accounted for the dispatcher sends one `Stop` per
//! worker and joins them. A run timeout aborts every worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::resilience::retry::{retry_if, RetryConfig, RetryError};
use crate::revision::SurrogateId;
use crate::sources::SourceMask;

/// One unit: build `child` (under `parent_natural_id`) to done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub index: usize,
    pub parent_natural_id: String,
    pub child_natural_id: String,
    pub child: SurrogateId,
    /// Sources skipped for the child and its subtree
    pub skip: SourceMask,
}

/// Processes units on behalf of one worker.
#[async_trait]
pub trait UnitHandler: Send + Sync + 'static {
    /// Per-worker state, opened once when the worker starts.
    type Worker: Send + Sync + 'static;

    async fn open_worker(&self, worker: usize) -> Result<Self::Worker, EngineError>;

    async fn process(&self, worker: &Self::Worker, unit: &WorkUnit) -> Result<(), EngineError>;

    /// Called with the worker's state once it stops taking units.
    async fn close_worker(&self, _worker: Self::Worker) {}
}

#[derive(Debug)]
pub struct UnitFailure {
    pub unit: WorkUnit,
    pub error: EngineError,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Completed units in completion order
    pub completed: Vec<WorkUnit>,
    pub failed: Vec<UnitFailure>,
}

impl DispatchReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Remove and return the first fatal failure, if any.
    pub fn take_fatal(&mut self) -> Option<EngineError> {
        let pos = self.failed.iter().position(|f| f.error.is_fatal())?;
        Some(self.failed.remove(pos).error)
    }
}

enum Task {
    Unit(WorkUnit),
    Stop,
}

struct UnitResult {
    unit: WorkUnit,
    worker: usize,
    outcome: Result<(), EngineError>,
}

pub struct ParallelDispatcher {
    workers: usize,
    retry: RetryConfig,
    timeout: Option<Duration>,
}

impl ParallelDispatcher {
    pub fn new(workers: usize, retry: RetryConfig, timeout: Option<Duration>) -> Self {
        Self {
            workers: workers.max(1),
            retry,
            timeout,
        }
    }

    /// Run every unit to success or failure.
    ///
    /// Only a timeout fails the whole dispatch; unit failures are reported.
    pub async fn run<H: UnitHandler>(&self, handler: Arc<H>, units: Vec<WorkUnit>) -> Result<DispatchReport, EngineError> {
        let mut report = DispatchReport::default();
        if units.is_empty() {
            return Ok(report);
        }

        let total = units.len();
        let worker_count = self.workers.min(total);
        let (task_tx, task_rx) = mpsc::unbounded_channel::<Task>();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<UnitResult>();
        let task_rx = Arc::new(Mutex::new(task_rx));

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&handler),
                    Arc::clone(&task_rx),
                    result_tx.clone(),
                    self.retry.clone(),
                ))
            })
            .collect();
        drop(result_tx);
        crate::metrics::set_active_workers(worker_count);
        info!(units = total, workers = worker_count, "Dispatching units");

        for unit in units {
            // Receivers live until Stop, so sends cannot fail here.
            let _ = task_tx.send(Task::Unit(unit));
        }

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut accounted = 0;
        while accounted < total {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, result_rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let timeout = self.timeout.unwrap_or_default();
                        error!(?timeout, accounted, total, "Dispatch timed out, terminating workers");
                        for handle in &handles {
                            handle.abort();
                        }
                        crate::metrics::set_active_workers(0);
                        return Err(EngineError::Timeout(timeout));
                    }
                },
                None => result_rx.recv().await,
            };

            let Some(result) = next else {
                // Every worker exited before reporting all units.
                error!(accounted, total, "Workers exited early");
                crate::metrics::set_active_workers(0);
                return Err(EngineError::Worker {
                    worker: usize::MAX,
                    message: format!("{} of {} units unaccounted for", total - accounted, total),
                });
            };
            accounted += 1;
            match result.outcome {
                Ok(()) => {
                    debug!(unit = %result.unit.child_natural_id, worker = result.worker, "Unit done");
                    crate::metrics::record_unit("done");
                    report.completed.push(result.unit);
                }
                Err(error) => {
                    crate::metrics::record_unit(error.kind());
                    report.failed.push(UnitFailure {
                        unit: result.unit,
                        error,
                    });
                }
            }
        }

        for _ in 0..worker_count {
            let _ = task_tx.send(Task::Stop);
        }
        for (id, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!(worker = id, error = %e, "Worker did not join cleanly");
            }
        }
        crate::metrics::set_active_workers(0);

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Dispatch finished"
        );
        Ok(report)
    }
}

async fn worker_loop<H: UnitHandler>(
    id: usize,
    handler: Arc<H>,
    tasks: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    results: mpsc::UnboundedSender<UnitResult>,
    retry: RetryConfig,
) {
    let worker = handler.open_worker(id).await;
    if let Err(e) = &worker {
        error!(worker = id, error = %e, "Worker failed to open, failing its units");
    }

    loop {
        let task = {
            let mut rx = tasks.lock().await;
            rx.recv().await
        };
        let unit = match task {
            Some(Task::Unit(unit)) => unit,
            Some(Task::Stop) | None => break,
        };

        let outcome = match &worker {
            Ok(state) => run_unit(handler.as_ref(), state, &unit, &retry).await,
            Err(e) => Err(EngineError::Worker {
                worker: id,
                message: e.to_string(),
            }),
        };
        if results.send(UnitResult { unit, worker: id, outcome }).is_err() {
            break;
        }
    }
    if let Ok(state) = worker {
        handler.close_worker(state).await;
    }
    debug!(worker = id, "Worker stopped");
}

async fn run_unit<H: UnitHandler>(
    handler: &H,
    worker: &H::Worker,
    unit: &WorkUnit,
    retry: &RetryConfig,
) -> Result<(), EngineError> {
    let name = format!("unit {}", unit.child_natural_id);
    let result = retry_if(&name, retry, EngineError::is_retryable, move || handler.process(worker, unit)).await;
    match result {
        Ok(()) => Ok(()),
        Err(RetryError::Exhausted { attempts, last }) => {
            error!(
                unit = %unit.child_natural_id,
                parent = %unit.parent_natural_id,
                attempts,
                error = %last,
                "Unit exhausted retries, leaving it not done"
            );
            Err(EngineError::RetriesExhausted {
                unit: unit.child_natural_id.clone(),
                attempts,
                last_error: last.to_string(),
            })
        }
        Err(RetryError::Aborted(e)) => {
            if e.is_fatal() {
                error!(unit = %unit.child_natural_id, error = %e, "Unit failed fatally");
            } else {
                warn!(unit = %unit.child_natural_id, error = %e, "Unit left not done");
            }
            Err(e)
        }
    }
}
