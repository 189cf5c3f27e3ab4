//! Background decode runs.
//!
//! Only the most recent background run is live. Starting another aborts the
//! one in flight and marks it superseded; a run that still finishes after
//! losing its generation drops its result. Finished runs are kept for
//! `decode_status` up to [`MAX_FINISHED_RUNS`], oldest evicted first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::pipeline::DecodeOutcome;

/// Finished runs kept for status queries
pub const MAX_FINISHED_RUNS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
    Superseded,
    Cancelled,
}

/// State for one background run
#[derive(Debug, Clone)]
pub struct RunState {
    pub status: RunStatus,
    pub generation: u64,
    pub started_at: Instant,
    pub elapsed: Option<Duration>,
    pub outcome: Option<DecodeOutcome>,
}

struct InFlight {
    run_id: String,
    handle: AbortHandle,
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, RunState>>>,
    generation: Arc<AtomicU64>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the most recently started run (0 before the first)
    pub fn latest_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Spawn `decode` as the new live run, superseding any run in flight.
    /// Returns the run id and its generation.
    pub async fn start<F>(&self, decode: F) -> (String, u64)
    where
        F: Future<Output = DecodeOutcome> + Send + 'static,
    {
        let run_id = uuid::Uuid::new_v4().to_string();

        // Held until the new run is registered so starts never interleave
        let mut in_flight = self.in_flight.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = in_flight.take() {
            previous.handle.abort();
            if self.finish(&previous.run_id, RunStatus::Superseded, None).await {
                info!("Run {} superseded by {}", previous.run_id, run_id);
            }
        }

        let started_at = Instant::now();
        {
            let mut runs = self.runs.write().await;
            runs.insert(
                run_id.clone(),
                RunState {
                    status: RunStatus::Running,
                    generation,
                    started_at,
                    elapsed: None,
                    outcome: None,
                },
            );
            evict_finished(&mut runs);
        }

        let registry = self.clone();
        let id = run_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = decode.await;

            if registry.latest_generation() != generation {
                debug!("Discarding result of stale run {} (generation {})", id, generation);
                return;
            }

            let status = if outcome.is_success() {
                RunStatus::Complete
            } else {
                RunStatus::Failed
            };
            if registry.finish(&id, status, Some(outcome)).await {
                info!("Background decode {} finished in {:?}", id, started_at.elapsed());
            }
        });

        *in_flight = Some(InFlight {
            run_id: run_id.clone(),
            handle: handle.abort_handle(),
        });

        info!("Started background decode {} (generation {})", run_id, generation);
        (run_id, generation)
    }

    pub async fn get(&self, run_id: &str) -> Option<RunState> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Abort a run. Returns its status afterwards, `None` for an unknown id.
    /// Runs that already finished keep their status.
    pub async fn cancel(&self, run_id: &str) -> Option<RunStatus> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.as_ref().is_some_and(|f| f.run_id == run_id) {
                if let Some(current) = in_flight.take() {
                    current.handle.abort();
                }
            }
        }

        if self.finish(run_id, RunStatus::Cancelled, None).await {
            info!("Cancelled background decode {}", run_id);
        }
        self.get(run_id).await.map(|state| state.status)
    }

    /// Move a running run to `status`. Returns false if it was not running.
    async fn finish(&self, run_id: &str, status: RunStatus, outcome: Option<DecodeOutcome>) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(state) if state.status == RunStatus::Running => {
                state.status = status;
                state.elapsed = Some(state.started_at.elapsed());
                state.outcome = outcome;
                true
            }
            _ => false,
        }
    }
}

/// Drop the oldest finished runs beyond [`MAX_FINISHED_RUNS`]
fn evict_finished(runs: &mut HashMap<String, RunState>) {
    let mut finished: Vec<(u64, String)> = runs
        .iter()
        .filter(|(_, state)| state.status != RunStatus::Running)
        .map(|(id, state)| (state.generation, id.clone()))
        .collect();
    if finished.len() <= MAX_FINISHED_RUNS {
        return;
    }

    finished.sort_unstable();
    let excess = finished.len() - MAX_FINISHED_RUNS;
    for (generation, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
        debug!("Evicted finished run {} (generation {})", id, generation);
    }
}
