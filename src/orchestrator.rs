//! Scheduling test runs and collecting their results.
//!
//! # Architecture
//!
//! ```text
//!   test.apk / app.apk
//!        │
//!        │ upload (content-addressed)
//!        ▼
//!   ArtifactStore ──► ArtifactReference
//!                          │
//!                          ▼
//!                 TestLabController ◄──── RunCache
//!                   │  fingerprint per device
//!                   │  hit:  get_run
//!                   │  miss: submit_run + record
//!                   ▼
//!             ScheduledBatch (run ids, new, cached)
//!                   │
//!                   ▼
//!               RunPoller ──── get_run (pending runs only) ───► TestLab
//!                   │
//!                   ▼
//!             CompletedRuns
//!                   │
//!                   ▼
//!            ResultDownloader ──── list / download ───► BlobStore
//!                   │
//!                   ▼
//!            TestRunResponse
//! ```
//!
//! # Execution Flow
//!
//! 1. **Upload**: Test and app packages are stored under a content hash
//! 2. **Scheduling**: Each picked device is either reused from the cache or submitted
//! 3. **Polling**: Unfinished runs are queried until all are terminal
//! 4. **Download**: Result files are copied into a fresh local folder
//!
//! Scheduling and collecting are separate steps: a [`ScheduledBatch`] is
//! plain data, so several batches can be scheduled first and collected
//! together later.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use labrunner::config::load_config;
//! use labrunner::lab::DeviceCatalog;
//! use labrunner::lab::memory::InMemoryTestLab;
//! use labrunner::orchestrator::TestRunService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("labrunner.toml"))?;
//!     let lab = Arc::new(InMemoryTestLab::new(DeviceCatalog::default()));
//!     let service = TestRunService::from_config(&config, lab)?;
//!
//!     let response = service
//!         .run(Path::new("app-test.apk"), None, Path::new("test-results"), None)
//!         .await?;
//!
//!     std::process::exit(if response.all_passed() { 0 } else { 1 });
//! }
//! ```

pub mod controller;
pub mod downloader;
pub mod poller;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::artifact::ArtifactStore;
use crate::cache::{CacheStore, JsonFileCacheStore, RunCache};
use crate::config::Config;
use crate::error::Result;
use crate::lab::{DevicePicker, DeviceSpec, FixedDevices, RemoteRun, TestLab, TestOptions};
use crate::storage::local::LocalBlobStore;
use crate::storage::{ArtifactReference, BlobStore};

pub use controller::{ScheduledBatch, ScheduledRun, TestLabController};
pub use downloader::{DownloadFailure, DownloadReport, DownloadedArtifact, ResultDownloader};
pub use poller::{CompletedRuns, RunPoller};

/// Poll interval used by [`TestRunService::run`] unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Finished runs together with their downloaded results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestRunResponse {
    /// Terminal runs, in the order they were scheduled.
    pub result: CompletedRuns,
    /// Local result files per run, and runs whose download failed.
    pub downloads: DownloadReport,
}

impl TestRunResponse {
    pub fn run_for(&self, run_id: &str) -> Option<&RemoteRun> {
        self.result.get(run_id)
    }

    /// Local files downloaded for `run_id`, if it produced any.
    pub fn downloads_for(&self, run_id: &str) -> Option<&[PathBuf]> {
        self.downloads.files_for(run_id)
    }

    /// Download failure recorded for `run_id`, if any.
    pub fn failures_for(&self, run_id: &str) -> Option<&DownloadFailure> {
        self.downloads.failure_for(run_id)
    }

    /// Returns `true` if every run passed and every download succeeded.
    pub fn all_passed(&self) -> bool {
        self.result.all_passed() && self.downloads.is_complete()
    }
}

/// Uploads artifacts, schedules runs and collects their results.
///
/// # Type Parameters
///
/// - `L`: The test lab type
/// - `B`: The blob store type
/// - `C`: The run cache's store type
pub struct TestRunService<L, B, C> {
    artifacts: ArtifactStore<B>,
    controller: TestLabController<L, C>,
    downloader: ResultDownloader<B>,
    options: TestOptions,
    poll_interval: Duration,
    cancellation_token: Option<CancellationToken>,
}

impl<L, B, C> TestRunService<L, B, C>
where
    L: TestLab,
    B: BlobStore,
    C: CacheStore,
{
    /// Creates a service.
    ///
    /// # Arguments
    ///
    /// * `lab` - Test lab runs are submitted to
    /// * `blob` - Storage for artifacts and results
    /// * `cache_store` - Backing store of the run cache
    /// * `results_prefix` - Storage prefix for this invocation's results
    pub fn new(
        lab: Arc<L>,
        blob: Arc<B>,
        cache_store: C,
        results_prefix: impl Into<String>,
    ) -> Self {
        Self {
            artifacts: ArtifactStore::new(blob.clone()),
            controller: TestLabController::new(lab, RunCache::new(cache_store), results_prefix),
            downloader: ResultDownloader::new(blob),
            options: TestOptions::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancellation_token: None,
        }
    }

    /// Sets the environment and test targets of every scheduled run.
    pub fn with_options(mut self, options: TestOptions) -> Self {
        self.options = options;
        self
    }

    /// Bills every scheduled run to `project_id`.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.controller = self.controller.with_project_id(project_id);
        self
    }

    /// Sets the poll interval used by [`run`](Self::run).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Makes [`collect`](Self::collect) stop with `Error::Cancelled` once
    /// `token` is cancelled.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn controller(&self) -> &TestLabController<L, C> {
        &self.controller
    }

    pub fn options(&self) -> &TestOptions {
        &self.options
    }

    /// Uploads the artifacts and schedules one run per picked device.
    ///
    /// Without `app_artifact` a shared placeholder is used, so library test
    /// packages can run on their own.
    ///
    /// # Errors
    ///
    /// Propagates upload, cache and lab failures, and
    /// `Error::InvariantViolation` for runs the lab returned without an id.
    pub async fn schedule(
        &self,
        test_artifact: &Path,
        app_artifact: Option<&Path>,
        picker: Option<&dyn DevicePicker>,
    ) -> Result<ScheduledBatch> {
        let (test, app) = self.upload(test_artifact, app_artifact).await?;
        let runs = self
            .controller
            .submit(&test, &app, picker, &self.options)
            .await?;
        let batch = ScheduledBatch::from_runs(&runs)?;

        info!(
            "Scheduled {} runs for {} ({} new, {} cached)",
            batch.run_ids.len(),
            test,
            batch.new_tests,
            batch.cached_tests
        );
        Ok(batch)
    }

    /// Like [`schedule`](Self::schedule), on an explicit device list.
    pub async fn schedule_on_devices(
        &self,
        test_artifact: &Path,
        app_artifact: Option<&Path>,
        devices: Vec<DeviceSpec>,
    ) -> Result<ScheduledBatch> {
        let picker = FixedDevices(devices);
        self.schedule(test_artifact, app_artifact, Some(&picker))
            .await
    }

    /// Waits for every run of `batches` and downloads their results.
    ///
    /// Run ids shared between batches are polled and downloaded once.
    /// `output_folder` is cleared first.
    pub async fn collect(
        &self,
        batches: &[ScheduledBatch],
        output_folder: &Path,
        poll_interval: Duration,
    ) -> Result<TestRunResponse> {
        let run_ids: Vec<String> = batches
            .iter()
            .flat_map(|batch| batch.run_ids.iter().cloned())
            .collect();

        let mut poller = self.controller.poller(poll_interval);
        if let Some(token) = &self.cancellation_token {
            poller = poller.with_cancellation_token(token.clone());
        }
        let result = poller.poll(&run_ids).await?;
        let downloads = self.downloader.download(output_folder, &result).await?;

        Ok(TestRunResponse { result, downloads })
    }

    /// Schedules and collects in one go.
    pub async fn run(
        &self,
        test_artifact: &Path,
        app_artifact: Option<&Path>,
        output_folder: &Path,
        picker: Option<&dyn DevicePicker>,
    ) -> Result<TestRunResponse> {
        let batch = self.schedule(test_artifact, app_artifact, picker).await?;
        self.collect(&[batch], output_folder, self.poll_interval)
            .await
    }

    async fn upload(
        &self,
        test_artifact: &Path,
        app_artifact: Option<&Path>,
    ) -> Result<(ArtifactReference, ArtifactReference)> {
        let test = self.artifacts.upload_file(test_artifact).await?;
        let app = match app_artifact {
            Some(path) => self.artifacts.upload_file(path).await?,
            None => self.artifacts.placeholder().await?,
        };
        Ok((test, app))
    }
}

impl<L: TestLab> TestRunService<L, LocalBlobStore, JsonFileCacheStore> {
    /// Builds a service from configuration.
    ///
    /// Artifacts and results live in a [`LocalBlobStore`] at
    /// `storage.root`, the run cache in `cache.dir`. Runs are billed to
    /// `lab.project_id`. Without a configured `storage.results_prefix`,
    /// results go to a fresh random prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured path can't be expanded.
    pub fn from_config(config: &Config, lab: Arc<L>) -> anyhow::Result<Self> {
        let blob = Arc::new(LocalBlobStore::new(config.storage.root_path()?));
        let cache = JsonFileCacheStore::load(&config.cache.dir_path()?);
        let results_prefix = config
            .storage
            .results_prefix
            .clone()
            .unwrap_or_else(|| format!("labrunner-results/{}", uuid::Uuid::new_v4()));

        info!("Writing results under {}", results_prefix);

        Ok(Self::new(lab, blob, cache, results_prefix)
            .with_project_id(&config.lab.project_id)
            .with_poll_interval(Duration::from_secs(config.lab.poll_interval_secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::PLACEHOLDER_PATH;
    use crate::cache::MemoryCacheStore;
    use crate::config::{CacheConfig, LabConfig, StorageConfig};
    use crate::error::Error;
    use crate::lab::memory::InMemoryTestLab;
    use crate::lab::{DeviceCatalog, DeviceModel, RunState};
    use tempfile::TempDir;

    type MemoryService = TestRunService<InMemoryTestLab, LocalBlobStore, MemoryCacheStore>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn catalog() -> DeviceCatalog {
        DeviceCatalog {
            models: vec![
                DeviceModel {
                    id: "pixel6".to_string(),
                    name: "Pixel 6".to_string(),
                    supported_os_versions: vec!["33".to_string()],
                    tags: vec!["default".to_string()],
                },
                DeviceModel {
                    id: "pixel4".to_string(),
                    name: "Pixel 4".to_string(),
                    supported_os_versions: vec!["30".to_string()],
                    tags: vec!["default".to_string()],
                },
            ],
        }
    }

    struct Fixture {
        dir: TempDir,
        blob: Arc<LocalBlobStore>,
        lab: Arc<InMemoryTestLab>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let blob = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
            let lab = Arc::new(InMemoryTestLab::new(catalog()).with_results_store(blob.clone()));
            std::fs::write(dir.path().join("app-test.apk"), b"test package").unwrap();
            std::fs::write(dir.path().join("app.apk"), b"app package").unwrap();
            Self { dir, blob, lab }
        }

        fn service(&self) -> MemoryService {
            TestRunService::new(
                self.lab.clone(),
                self.blob.clone(),
                MemoryCacheStore::new(),
                "results/inv-1",
            )
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    #[tokio::test]
    async fn test_schedule_twice_then_collect() {
        init_tracing();
        let fixture = Fixture::new();
        let service = fixture.service();
        let test = fixture.path("app-test.apk");
        let app = fixture.path("app.apk");

        let first = service.schedule(&test, Some(&app), None).await.unwrap();
        assert_eq!((first.new_tests, first.cached_tests), (2, 0));

        let second = service.schedule(&test, Some(&app), None).await.unwrap();
        assert_eq!((second.new_tests, second.cached_tests), (0, 2));
        assert_eq!(first.run_ids, second.run_ids);

        let output = fixture.path("out");
        let response = service
            .collect(&[first.clone(), second], &output, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(response.result.len(), 2);
        assert!(response.result.iter().all(|r| r.state.is_terminal()));
        assert!(response.all_passed());
        for id in &first.run_ids {
            assert_eq!(response.run_for(id).unwrap().state, RunState::CompleteSuccess);
            let files = response.downloads_for(id).unwrap();
            assert_eq!(files.len(), 2);
            assert!(files.iter().all(|f| f.starts_with(output.join(id))));
            assert!(response.failures_for(id).is_none());
        }
        assert_eq!(fixture.lab.submission_count().await, 2);
    }

    #[tokio::test]
    async fn test_missing_app_uses_placeholder() {
        let fixture = Fixture::new();
        let service = fixture.service();

        let batch = service
            .schedule_on_devices(
                &fixture.path("app-test.apk"),
                None,
                vec![DeviceSpec::new("pixel6", "33")],
            )
            .await
            .unwrap();

        assert_eq!(batch.run_ids.len(), 1);
        assert!(fixture.blob.exists(PLACEHOLDER_PATH).await.unwrap());
    }

    #[tokio::test]
    async fn test_options_are_part_of_identity() {
        let fixture = Fixture::new();
        let test = fixture.path("app-test.apk");
        let devices = vec![DeviceSpec::new("pixel6", "33")];

        let plain = fixture.service();
        plain
            .schedule_on_devices(&test, None, devices.clone())
            .await
            .unwrap();

        let mut options = TestOptions::default();
        options
            .environment
            .insert("clearPackageData".to_string(), "true".to_string());
        let filtered = TestRunService::new(
            fixture.lab.clone(),
            fixture.blob.clone(),
            MemoryCacheStore::new(),
            "results/inv-2",
        )
        .with_options(options);

        let batch = filtered
            .schedule_on_devices(&test, None, devices)
            .await
            .unwrap();
        assert_eq!(batch.new_tests, 1);
        assert_eq!(fixture.lab.submission_count().await, 2);
    }

    #[tokio::test]
    async fn test_run_reports_failures() {
        let dir = TempDir::new().unwrap();
        let blob = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
        let lab = Arc::new(
            InMemoryTestLab::new(catalog())
                .with_failing_model("pixel4")
                .with_results_store(blob.clone()),
        );
        std::fs::write(dir.path().join("lib-test.apk"), b"library tests").unwrap();

        let service = TestRunService::new(lab, blob, MemoryCacheStore::new(), "results/inv-3")
            .with_poll_interval(Duration::from_millis(1));
        let response = service
            .run(&dir.path().join("lib-test.apk"), None, &dir.path().join("out"), None)
            .await
            .unwrap();

        assert_eq!(response.result.len(), 2);
        assert!(!response.all_passed());
        assert_eq!(response.result.failed().count(), 1);
        assert!(response.downloads.is_complete());
    }

    #[tokio::test]
    async fn test_collect_can_be_cancelled() {
        let dir = TempDir::new().unwrap();
        let blob = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
        let lab = Arc::new(InMemoryTestLab::new(catalog()).with_script(vec![RunState::Running]));
        std::fs::write(dir.path().join("t.apk"), b"t").unwrap();

        let token = CancellationToken::new();
        let service = TestRunService::new(lab, blob, MemoryCacheStore::new(), "results/inv-4")
            .with_cancellation_token(token.clone());
        let batch = service
            .schedule(&dir.path().join("t.apk"), None, None)
            .await
            .unwrap();

        token.cancel();
        let err = service
            .collect(&[batch], &dir.path().join("out"), Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_from_config_persists_cache() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("blobs");
        let config = Config {
            lab: LabConfig {
                project_id: "p".to_string(),
                poll_interval_secs: 1,
            },
            storage: StorageConfig {
                root: root.display().to_string(),
                results_prefix: None,
            },
            cache: CacheConfig {
                dir: dir.path().display().to_string(),
            },
            tracker: None,
        };
        let lab = Arc::new(InMemoryTestLab::new(catalog()).with_project_id("p"));
        let test = dir.path().join("t.apk");
        std::fs::write(&test, b"t").unwrap();

        let first = TestRunService::from_config(&config, lab.clone()).unwrap();
        let batch = first.schedule(&test, None, None).await.unwrap();
        assert_eq!(batch.new_tests, 2);
        assert!(first.controller().results_prefix().starts_with("labrunner-results/"));
        assert_eq!(first.controller().project_id(), Some("p"));
        let request = lab.submitted_request(&batch.run_ids[0]).await.unwrap();
        assert_eq!(request.project_id.as_deref(), Some("p"));

        // A new service (new process) reads the cache file written by the first
        let second = TestRunService::from_config(&config, lab.clone()).unwrap();
        let again = second.schedule(&test, None, None).await.unwrap();
        assert_eq!(again.cached_tests, 2);
        assert_eq!(again.run_ids, batch.run_ids);
        assert_ne!(
            first.controller().results_prefix(),
            second.controller().results_prefix()
        );
        assert!(dir.path().join(".labrunner/run_cache.json").exists());
        assert!(root.join(PLACEHOLDER_PATH).exists());
    }
}
