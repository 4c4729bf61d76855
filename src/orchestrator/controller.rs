//! Submission of runs with cache-based deduplication.
//!
//! For every requested device configuration the [`TestLabController`] walks
//! the same small state machine:
//!
//! ```text
//!   Uninitiated ──► Cache-Checked ──┬── hit ──► get_run ──► Reused
//!                                   └── miss ─► submit_run ─► record ─► Created / Reused
//! ```
//!
//! A run counts as reused when the run cache had it, or when the lab answers
//! a fresh submission with a run that already carries an outcome (the lab
//! remembered it even though the local cache didn't). Both signals are kept
//! because they can disagree, e.g. after the cache store was wiped.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::poller::{CompletedRuns, RunPoller};
use crate::cache::{CacheStore, RunCache};
use crate::error::{Error, Result};
use crate::fingerprint::RunFingerprint;
use crate::lab::{
    DevicePicker, DeviceSpec, RemoteRun, RunRequest, TestLab, TestOptions, default_devices,
};
use crate::storage::{ArtifactReference, join_path};

/// Outcome of scheduling one device configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduledRun {
    /// A new run was started on the lab.
    Created(RemoteRun),
    /// An existing run was reused instead of submitting a new one.
    Reused(RemoteRun),
}

impl ScheduledRun {
    pub fn run(&self) -> &RemoteRun {
        match self {
            ScheduledRun::Created(run) | ScheduledRun::Reused(run) => run,
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, ScheduledRun::Reused(_))
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run().id()
    }
}

/// Serializable summary of one scheduling call.
///
/// Holds everything needed to collect the results later, possibly from a
/// different process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledBatch {
    /// Run ids in the order the devices were picked.
    pub run_ids: Vec<String>,
    /// Number of runs that were newly created.
    pub new_tests: usize,
    /// Number of runs reused from a previous submission.
    pub cached_tests: usize,
}

impl ScheduledBatch {
    /// Builds a batch from scheduled runs.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvariantViolation` if any run lacks an id.
    pub fn from_runs(runs: &[ScheduledRun]) -> Result<Self> {
        let run_ids = runs
            .iter()
            .map(|scheduled| {
                scheduled.run_id().map(str::to_string).ok_or_else(|| {
                    Error::invariant(format!(
                        "scheduled run on {} has no id",
                        scheduled.run().device
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let cached_tests = runs.iter().filter(|r| r.is_reused()).count();

        Ok(Self {
            new_tests: run_ids.len() - cached_tests,
            cached_tests,
            run_ids,
        })
    }
}

/// Submits runs to a [`TestLab`], consulting a [`RunCache`] first.
pub struct TestLabController<L, C> {
    lab: Arc<L>,
    cache: RunCache<C>,
    results_prefix: String,
    project_id: Option<String>,
}

impl<L: TestLab, C: CacheStore> TestLabController<L, C> {
    /// Creates a controller writing results below `results_prefix`.
    ///
    /// The prefix should be unique per invocation; every run gets its own
    /// folder `{results_prefix}/{fingerprint}` beneath it.
    pub fn new(lab: Arc<L>, cache: RunCache<C>, results_prefix: impl Into<String>) -> Self {
        Self {
            lab,
            cache,
            results_prefix: results_prefix.into(),
            project_id: None,
        }
    }

    /// Bills every submitted run to `project_id`.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn lab(&self) -> &L {
        &self.lab
    }

    pub fn cache(&self) -> &RunCache<C> {
        &self.cache
    }

    pub fn results_prefix(&self) -> &str {
        &self.results_prefix
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Schedules one run per picked device.
    ///
    /// Devices are scheduled concurrently; the returned runs follow the
    /// picker's device order. Without a picker, [`default_devices`] is used.
    ///
    /// # Errors
    ///
    /// Any lab, cache or storage failure aborts the call. Runs already
    /// submitted by then stay submitted on the lab.
    pub async fn submit(
        &self,
        test_artifact: &ArtifactReference,
        app_artifact: &ArtifactReference,
        picker: Option<&dyn DevicePicker>,
        options: &TestOptions,
    ) -> Result<Vec<ScheduledRun>> {
        let catalog = self.lab.device_catalog().await?;
        let devices = match picker {
            Some(picker) => picker.pick(&catalog),
            None => default_devices(&catalog),
        };

        info!("Scheduling {} device configurations", devices.len());

        try_join_all(
            devices
                .into_iter()
                .map(|device| self.schedule_device(test_artifact, app_artifact, device, options)),
        )
        .await
    }

    async fn schedule_device(
        &self,
        test_artifact: &ArtifactReference,
        app_artifact: &ArtifactReference,
        device: DeviceSpec,
        options: &TestOptions,
    ) -> Result<ScheduledRun> {
        let fingerprint = RunFingerprint::compute(test_artifact, app_artifact, &device, options);

        if let Some(run_id) = self.cache.lookup(&fingerprint).await? {
            let run = self.lab.get_run(&run_id).await?;
            if run.id() != Some(run_id.as_str()) {
                return Err(Error::invariant(format!(
                    "test lab answered query for run {} with run {:?}",
                    run_id, run.run_id
                )));
            }
            info!("Reusing run {} on {}", run_id, device);
            return Ok(ScheduledRun::Reused(run));
        }

        let request = RunRequest {
            test_artifact: test_artifact.clone(),
            app_artifact: app_artifact.clone(),
            results_location: join_path(&self.results_prefix, fingerprint.as_str()),
            project_id: self.project_id.clone(),
            device,
            options: options.clone(),
            fingerprint,
        };

        let run = self.lab.submit_run(&request).await?;
        let Some(run_id) = run.id() else {
            return Err(Error::invariant(format!(
                "test lab returned a run without an id for {}",
                request.device
            )));
        };
        self.cache.record(&request.fingerprint, run_id).await?;

        if run.outcome.is_some() {
            info!(
                "Lab already ran {} on {}, reusing its result",
                run_id, request.device
            );
            Ok(ScheduledRun::Reused(run))
        } else {
            debug!("Submitted run {} on {}", run_id, request.device);
            Ok(ScheduledRun::Created(run))
        }
    }

    /// Returns a poller over this controller's lab.
    pub fn poller(&self, poll_interval: Duration) -> RunPoller<'_, L> {
        RunPoller::new(self.lab.as_ref(), poll_interval)
    }

    /// Waits until every run in `run_ids` has reached a terminal state.
    ///
    /// See [`RunPoller::poll`] for the polling rules. This may wait forever
    /// if a run never finishes; wrap it in `tokio::time::timeout` or use a
    /// cancellable [`poller`](Self::poller) to bound it.
    pub async fn await_completion(
        &self,
        run_ids: &[String],
        poll_interval: Duration,
    ) -> Result<CompletedRuns> {
        self.poller(poll_interval).poll(run_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::lab::memory::InMemoryTestLab;
    use crate::lab::{DeviceCatalog, DeviceModel, FixedDevices, OutcomeSummary, RunState};

    fn catalog() -> DeviceCatalog {
        DeviceCatalog {
            models: vec![
                DeviceModel {
                    id: "pixel6".to_string(),
                    name: "Pixel 6".to_string(),
                    supported_os_versions: vec!["31".to_string(), "33".to_string()],
                    tags: vec!["default".to_string()],
                },
                DeviceModel {
                    id: "emu".to_string(),
                    name: "Emulator".to_string(),
                    supported_os_versions: vec!["30".to_string()],
                    tags: vec![],
                },
            ],
        }
    }

    fn refs() -> (ArtifactReference, ArtifactReference) {
        (
            ArtifactReference::new("artifacts/t/test.apk"),
            ArtifactReference::new("artifacts/a/app.apk"),
        )
    }

    fn controller(lab: InMemoryTestLab) -> TestLabController<InMemoryTestLab, MemoryCacheStore> {
        TestLabController::new(
            Arc::new(lab),
            RunCache::new(MemoryCacheStore::new()),
            "results/inv-1",
        )
    }

    fn run_with(outcome: Option<OutcomeSummary>, id: Option<&str>) -> RemoteRun {
        RemoteRun {
            run_id: id.map(str::to_string),
            device: DeviceSpec::new("pixel6", "33"),
            state: RunState::Pending,
            outcome,
            results_location: None,
        }
    }

    #[test]
    fn test_batch_counts() {
        let runs = vec![
            ScheduledRun::Created(run_with(None, Some("a"))),
            ScheduledRun::Reused(run_with(Some(OutcomeSummary::Success), Some("b"))),
            ScheduledRun::Created(run_with(None, Some("c"))),
        ];
        let batch = ScheduledBatch::from_runs(&runs).unwrap();
        assert_eq!(batch.run_ids, vec!["a", "b", "c"]);
        assert_eq!(batch.new_tests, 2);
        assert_eq!(batch.cached_tests, 1);
    }

    #[test]
    fn test_batch_rejects_missing_id() {
        let runs = vec![
            ScheduledRun::Created(run_with(None, Some("a"))),
            ScheduledRun::Created(run_with(None, Some(""))),
        ];
        let err = ScheduledBatch::from_runs(&runs).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_batch_serializes() {
        let batch = ScheduledBatch {
            run_ids: vec!["run-0001".to_string()],
            new_tests: 1,
            cached_tests: 0,
        };
        let json = serde_json::to_string(&batch).unwrap();
        let back: ScheduledBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(batch, back);
    }

    #[tokio::test]
    async fn test_second_submission_is_cached() {
        let controller = controller(InMemoryTestLab::new(catalog()));
        let (test, app) = refs();
        let picker = FixedDevices(vec![DeviceSpec::new("pixel6", "33")]);

        let first = controller
            .submit(&test, &app, Some(&picker), &TestOptions::default())
            .await
            .unwrap();
        let second = controller
            .submit(&test, &app, Some(&picker), &TestOptions::default())
            .await
            .unwrap();

        let first = ScheduledBatch::from_runs(&first).unwrap();
        let second = ScheduledBatch::from_runs(&second).unwrap();
        assert_eq!((first.new_tests, first.cached_tests), (1, 0));
        assert_eq!((second.new_tests, second.cached_tests), (0, 1));
        assert_eq!(first.run_ids, second.run_ids);
        assert_eq!(controller.lab().submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_partial_hits_count() {
        let controller = controller(InMemoryTestLab::new(catalog()));
        let (test, app) = refs();
        let options = TestOptions::default();

        let warm = FixedDevices(vec![DeviceSpec::new("pixel6", "33")]);
        controller
            .submit(&test, &app, Some(&warm), &options)
            .await
            .unwrap();

        let all = FixedDevices(vec![
            DeviceSpec::new("emu", "30"),
            DeviceSpec::new("pixel6", "33"),
            DeviceSpec::new("pixel6", "31"),
        ]);
        let runs = controller
            .submit(&test, &app, Some(&all), &options)
            .await
            .unwrap();
        let batch = ScheduledBatch::from_runs(&runs).unwrap();

        assert_eq!(batch.new_tests + batch.cached_tests, 3);
        assert_eq!(batch.new_tests, 3 - 1);
        // Device order is preserved
        let devices: Vec<_> = runs.iter().map(|r| r.run().device.clone()).collect();
        assert_eq!(devices, all.0);
        assert!(runs[1].is_reused());
    }

    #[tokio::test]
    async fn test_default_picker() {
        let controller = controller(InMemoryTestLab::new(catalog()));
        let (test, app) = refs();

        let runs = controller
            .submit(&test, &app, None, &TestOptions::default())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run().device, DeviceSpec::new("pixel6", "33"));
    }

    #[tokio::test]
    async fn test_closure_picker_sees_catalog() {
        let controller = controller(InMemoryTestLab::new(catalog()));
        let (test, app) = refs();
        let picker = |catalog: &DeviceCatalog| {
            catalog
                .models
                .iter()
                .map(|m| DeviceSpec::new(&m.id, &m.supported_os_versions[0]))
                .collect::<Vec<_>>()
        };

        let runs = controller
            .submit(&test, &app, Some(&picker), &TestOptions::default())
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| !r.is_reused()));
    }

    #[tokio::test]
    async fn test_remote_history_counts_as_cached() {
        let lab = InMemoryTestLab::new(catalog())
            .with_script(vec![RunState::CompleteSuccess])
            .with_history();
        let lab = Arc::new(lab);
        let (test, app) = refs();
        let picker = FixedDevices(vec![DeviceSpec::new("pixel6", "33")]);
        let options = TestOptions::default();

        let first = TestLabController::new(
            lab.clone(),
            RunCache::new(MemoryCacheStore::new()),
            "results/inv-1",
        );
        let runs = first.submit(&test, &app, Some(&picker), &options).await.unwrap();
        let id = runs[0].run_id().unwrap().to_string();
        first.await_completion(&[id.clone()], Duration::from_millis(1)).await.unwrap();

        // A fresh, empty cache: the lab still remembers the finished run
        let second = TestLabController::new(
            lab.clone(),
            RunCache::new(MemoryCacheStore::new()),
            "results/inv-2",
        );
        let runs = second.submit(&test, &app, Some(&picker), &options).await.unwrap();
        assert!(runs[0].is_reused());
        assert_eq!(runs[0].run_id(), Some(id.as_str()));
        assert_eq!(
            second.cache().lookup(&RunFingerprint::compute(
                &test,
                &app,
                &DeviceSpec::new("pixel6", "33"),
                &options
            ))
            .await
            .unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn test_missing_run_id_is_fatal() {
        let controller = controller(InMemoryTestLab::new(catalog()).with_missing_run_ids());
        let (test, app) = refs();
        let picker = FixedDevices(vec![DeviceSpec::new("pixel6", "33")]);

        let err = controller
            .submit(&test, &app, Some(&picker), &TestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_rejected_device_propagates() {
        let controller = controller(InMemoryTestLab::new(catalog()));
        let (test, app) = refs();
        let picker = FixedDevices(vec![DeviceSpec::new("nexus5", "23")]);

        let err = controller
            .submit(&test, &app, Some(&picker), &TestOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
