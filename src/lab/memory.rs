//! Scripted in-memory test lab.
//!
//! Runs never touch a device. Each submitted run starts `Pending` and moves
//! one step through a configurable script every time it is polled. When a
//! run reaches a terminal state the lab optionally writes a small set of
//! result files to a [`BlobStore`], the way a real lab writes to the results
//! location it was given.
//!
//! Useful for dry runs and for exercising the orchestrator in tests.
//!
//! # Example
//!
//! ```
//! use labrunner::lab::memory::InMemoryTestLab;
//! use labrunner::lab::{DeviceCatalog, DeviceModel, RunState};
//!
//! let catalog = DeviceCatalog {
//!     models: vec![DeviceModel {
//!         id: "pixel6".to_string(),
//!         name: "Pixel 6".to_string(),
//!         supported_os_versions: vec!["33".to_string()],
//!         tags: vec!["default".to_string()],
//!     }],
//! };
//! let lab = InMemoryTestLab::new(catalog)
//!     .with_script(vec![RunState::Running, RunState::Running, RunState::CompleteSuccess])
//!     .with_failing_model("pixel6");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    DeviceCatalog, LabError, LabResult, OutcomeSummary, RemoteRun, RunRequest, RunState, TestLab,
};
use crate::fingerprint::RunFingerprint;
use crate::storage::{BlobStore, join_path};

struct SimulatedRun {
    run: RemoteRun,
    request: RunRequest,
    step: usize,
}

#[derive(Default)]
struct LabState {
    runs: HashMap<String, SimulatedRun>,
    by_fingerprint: HashMap<RunFingerprint, String>,
    submissions: usize,
    catalog_fetches: usize,
    status_queries: HashMap<String, usize>,
}

/// A [`TestLab`] that simulates runs in memory.
pub struct InMemoryTestLab {
    catalog: DeviceCatalog,
    script: Vec<RunState>,
    failing_models: HashSet<String>,
    retain_history: bool,
    omit_run_ids: bool,
    project_id: Option<String>,
    results_store: Option<Arc<dyn BlobStore>>,
    state: Mutex<LabState>,
}

impl InMemoryTestLab {
    /// Creates a lab offering `catalog`. Runs go `Pending → Running →
    /// CompleteSuccess` over two polls.
    pub fn new(catalog: DeviceCatalog) -> Self {
        Self {
            catalog,
            script: vec![RunState::Running, RunState::CompleteSuccess],
            failing_models: HashSet::new(),
            retain_history: false,
            omit_run_ids: false,
            project_id: None,
            results_store: None,
            state: Mutex::new(LabState::default()),
        }
    }

    /// Sets the states a run goes through, one per poll, after submission.
    ///
    /// The last state is sticky. A script that doesn't end in a terminal
    /// state produces runs that never finish.
    pub fn with_script(mut self, script: Vec<RunState>) -> Self {
        if !script.is_empty() {
            self.script = script;
        }
        self
    }

    /// Runs on this model finish with `CompleteFailure` instead of success.
    pub fn with_failing_model(mut self, model_id: impl Into<String>) -> Self {
        self.failing_models.insert(model_id.into());
        self
    }

    /// Makes the lab return an already finished run when an identical
    /// request (same fingerprint) is submitted again.
    pub fn with_history(mut self) -> Self {
        self.retain_history = true;
        self
    }

    /// Simulates a broken lab that omits run ids from submit responses.
    pub fn with_missing_run_ids(mut self) -> Self {
        self.omit_run_ids = true;
        self
    }

    /// Rejects requests that aren't billed to `project_id`.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Writes result files for finished runs into `store`.
    pub fn with_results_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.results_store = Some(store);
        self
    }

    /// Number of runs created through [`submit_run`](TestLab::submit_run).
    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submissions
    }

    /// The request that created `run_id`.
    pub async fn submitted_request(&self, run_id: &str) -> Option<RunRequest> {
        self.state
            .lock()
            .await
            .runs
            .get(run_id)
            .map(|simulated| simulated.request.clone())
    }

    /// Number of times the device catalog was fetched.
    pub async fn catalog_fetches(&self) -> usize {
        self.state.lock().await.catalog_fetches
    }

    /// Number of status queries received for `run_id`.
    pub async fn status_queries(&self, run_id: &str) -> usize {
        self.state
            .lock()
            .await
            .status_queries
            .get(run_id)
            .copied()
            .unwrap_or(0)
    }

    fn state_at(&self, step: usize, model_id: &str) -> RunState {
        let index = step.min(self.script.len() - 1);
        match self.script[index] {
            RunState::CompleteSuccess if self.failing_models.contains(model_id) => {
                RunState::CompleteFailure
            }
            state => state,
        }
    }

    async fn write_results(&self, run_id: &str, location: &str, state: RunState) -> LabResult<()> {
        let Some(store) = &self.results_store else {
            return Ok(());
        };

        let (tests, failures) = match state {
            RunState::CompleteFailure => (1, 1),
            _ => (1, 0),
        };
        let junit = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" skipped=\"0\">\n\
             <testcase name=\"simulated\" classname=\"labrunner.Simulated\"/>\n\
             </testsuite>\n",
            run_id, tests, failures
        );
        let logcat = format!("I/TestRunner: finished run {}\n", run_id);

        for (name, contents) in [
            ("test_result_1.xml", junit.as_bytes()),
            ("logcat.txt", logcat.as_bytes()),
        ] {
            store
                .put(&join_path(location, name), contents)
                .await
                .map_err(|e| LabError::Transport(format!("failed to write results: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TestLab for InMemoryTestLab {
    async fn device_catalog(&self) -> LabResult<DeviceCatalog> {
        self.state.lock().await.catalog_fetches += 1;
        Ok(self.catalog.clone())
    }

    async fn submit_run(&self, request: &RunRequest) -> LabResult<RemoteRun> {
        if !self.catalog.supports(&request.device) {
            return Err(LabError::Rejected(format!(
                "device {} is not in the catalog",
                request.device
            )));
        }

        if let Some(expected) = &self.project_id
            && request.project_id.as_ref() != Some(expected)
        {
            return Err(LabError::Rejected(format!(
                "run is not billed to project {}",
                expected
            )));
        }

        let mut state = self.state.lock().await;

        if self.retain_history
            && let Some(existing) = state.by_fingerprint.get(&request.fingerprint)
            && let Some(previous) = state.runs.get(existing)
            && previous.run.state.is_terminal()
        {
            debug!("Lab returning finished run {} for repeated request", existing);
            return Ok(previous.run.clone());
        }

        state.submissions += 1;
        let run_id = format!("run-{:04}", state.submissions);
        let run = RemoteRun {
            run_id: Some(run_id.clone()),
            device: request.device.clone(),
            state: RunState::Pending,
            outcome: None,
            results_location: None,
        };

        state
            .by_fingerprint
            .insert(request.fingerprint.clone(), run_id.clone());
        state.runs.insert(
            run_id.clone(),
            SimulatedRun {
                run: run.clone(),
                request: request.clone(),
                step: 0,
            },
        );

        debug!("Lab accepted run {} on {}", run_id, request.device);

        if self.omit_run_ids {
            return Ok(RemoteRun {
                run_id: None,
                ..run
            });
        }
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> LabResult<RemoteRun> {
        let (run, finished_now, location) = {
            let mut state = self.state.lock().await;
            *state.status_queries.entry(run_id.to_string()).or_default() += 1;

            let Some(simulated) = state.runs.get_mut(run_id) else {
                return Err(LabError::NotFound(run_id.to_string()));
            };
            if simulated.run.state.is_terminal() {
                return Ok(simulated.run.clone());
            }

            let next = self.state_at(simulated.step, &simulated.request.device.model_id);
            simulated.step += 1;
            simulated.run.state = next;

            let finished_now = next.is_terminal();
            if finished_now {
                simulated.run.outcome = Some(match next {
                    RunState::CompleteSuccess => OutcomeSummary::Success,
                    _ => OutcomeSummary::Failure,
                });
                if self.results_store.is_some() {
                    simulated.run.results_location =
                        Some(simulated.request.results_location.clone());
                }
            }
            (
                simulated.run.clone(),
                finished_now,
                simulated.request.results_location.clone(),
            )
        };

        if finished_now {
            self.write_results(run_id, &location, run.state).await?;
        }
        Ok(run)
    }
}
