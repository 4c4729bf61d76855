//! Polling runs until they finish.
//!
//! The lab has no completion callback, so [`RunPoller`] queries the status of
//! every unfinished run once per round and sleeps between rounds. A run that
//! has been seen in a terminal state is never queried again.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::try_join_all;
use serde::Serialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lab::{RemoteRun, RunState, TestLab};

/// Terminal runs, in the order their ids were requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletedRuns {
    runs: Vec<RemoteRun>,
}

impl CompletedRuns {
    pub(crate) fn new(runs: Vec<RemoteRun>) -> Self {
        Self { runs }
    }

    pub fn get(&self, run_id: &str) -> Option<&RemoteRun> {
        self.runs.iter().find(|run| run.id() == Some(run_id))
    }

    pub fn runs(&self) -> &[RemoteRun] {
        &self.runs
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteRun> {
        self.runs.iter()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Returns `true` if every run finished with `CompleteSuccess`.
    pub fn all_passed(&self) -> bool {
        self.runs.iter().all(RemoteRun::passed)
    }

    /// Runs that finished with `CompleteFailure`.
    pub fn failed(&self) -> impl Iterator<Item = &RemoteRun> {
        self.runs.iter().filter(|run| !run.passed())
    }
}

/// Repeatedly queries a [`TestLab`] until a set of runs is terminal.
pub struct RunPoller<'a, L: ?Sized> {
    lab: &'a L,
    interval: Duration,
    cancellation_token: Option<CancellationToken>,
}

impl<'a, L: TestLab + ?Sized> RunPoller<'a, L> {
    pub fn new(lab: &'a L, interval: Duration) -> Self {
        Self {
            lab,
            interval,
            cancellation_token: None,
        }
    }

    /// Sets a cancellation token for early termination.
    ///
    /// When the token is cancelled, [`poll`](Self::poll) stops at its next
    /// suspension point and returns `Error::Cancelled`. Runs already
    /// submitted keep running on the lab.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Polls until every run in `run_ids` is terminal.
    ///
    /// Duplicate ids are polled once. Each round queries only the runs that
    /// are still pending; states that would move a run backwards are logged
    /// and ignored.
    ///
    /// # Errors
    ///
    /// - `Error::Lab` - A status query failed; nothing is retried
    /// - `Error::InvariantViolation` - The lab answered with a different or missing run id
    /// - `Error::Cancelled` - The cancellation token fired
    pub async fn poll(&self, run_ids: &[String]) -> Result<CompletedRuns> {
        let ids = dedup(run_ids);
        let mut observed: HashMap<String, RunState> = HashMap::new();
        let mut done: HashMap<String, RemoteRun> = HashMap::new();
        let mut pending: Vec<String> = ids.clone();
        let mut round = 0usize;

        info!("Waiting for {} runs to finish", ids.len());

        while !pending.is_empty() {
            round += 1;

            let runs = self.cancellable(self.query(&pending)).await??;

            let mut still_pending = Vec::new();
            for (run_id, run) in pending.into_iter().zip(runs) {
                let state = advance_state(&mut observed, &run_id, run.state);
                if state.is_terminal() {
                    debug!("Run {} finished: {:?}", run_id, state);
                    done.insert(run_id, run);
                } else {
                    still_pending.push(run_id);
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }

            debug!(
                "Poll round {}: {} of {} runs still pending",
                round,
                pending.len(),
                ids.len()
            );
            self.cancellable(tokio::time::sleep(self.interval)).await?;
        }

        info!("All {} runs finished after {} rounds", ids.len(), round);

        let runs = ids
            .iter()
            .map(|id| {
                done.remove(id)
                    .ok_or_else(|| Error::invariant(format!("run {} was never completed", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompletedRuns::new(runs))
    }

    async fn query(&self, run_ids: &[String]) -> Result<Vec<RemoteRun>> {
        try_join_all(run_ids.iter().map(|run_id| async move {
            let run = self.lab.get_run(run_id).await?;
            if run.id() != Some(run_id.as_str()) {
                return Err(Error::invariant(format!(
                    "status query for run {} returned run {:?}",
                    run_id, run.run_id
                )));
            }
            Ok(run)
        }))
        .await
    }

    async fn cancellable<F: Future>(&self, future: F) -> Result<F::Output> {
        match &self.cancellation_token {
            Some(token) => {
                select! {
                    _ = token.cancelled() => {
                        debug!("Polling cancelled");
                        Err(Error::Cancelled)
                    }
                    output = future => Ok(output),
                }
            }
            None => Ok(future.await),
        }
    }
}

/// Records `reported` for `run_id` unless it would move the run backwards,
/// and returns the state the run is considered to be in.
fn advance_state(
    observed: &mut HashMap<String, RunState>,
    run_id: &str,
    reported: RunState,
) -> RunState {
    match observed.get(run_id).copied() {
        Some(previous) if !previous.can_advance_to(reported) => {
            warn!(
                "Run {} reported {:?} after {:?}; ignoring regression",
                run_id, reported, previous
            );
            previous
        }
        _ => {
            observed.insert(run_id.to_string(), reported);
            reported
        }
    }
}

fn dedup(run_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    run_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
