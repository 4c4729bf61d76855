//! Remote test-lab abstraction.
//!
//! The test lab is the service that actually runs instrumentation tests on
//! devices. labrunner treats it as a black box with three operations:
//!
//! - [`TestLab::device_catalog`] - which devices can be targeted
//! - [`TestLab::submit_run`] - start one run on one device
//! - [`TestLab::get_run`] - observe the current state of a run
//!
//! There is no push/subscribe API, so completion is observed by polling
//! [`TestLab::get_run`] (see [`RunPoller`](crate::orchestrator::RunPoller)).
//!
//! # Run Lifecycle
//!
//! ```text
//!   Pending ──► Running ──► CompleteSuccess
//!                      └──► CompleteFailure
//! ```
//!
//! States only move forward. The lab owns run state; labrunner only
//! observes it.
//!
//! # Built-in Labs
//!
//! | Lab | Module | Description |
//! |-----|--------|-------------|
//! | In-memory | [`memory`] | Scripted lab for tests and dry runs |

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fingerprint::RunFingerprint;
use crate::storage::ArtifactReference;

/// Result type for test-lab operations.
pub type LabResult<T> = Result<T, LabError>;

/// Errors reported by a test lab.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    /// The run (or other resource) does not exist on the lab.
    #[error("Run not found: {0}")]
    NotFound(String),

    /// The lab refused the request (bad device, quota, invalid artifact).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The lab could not be reached or returned a malformed response.
    #[error("Test lab transport error: {0}")]
    Transport(String),
}

/// A concrete device configuration to run tests on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub model_id: String,
    pub os_version_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub orientation: Orientation,
}

fn default_locale() -> String {
    "en".to_string()
}

impl DeviceSpec {
    /// Creates a device configuration with the default locale and portrait orientation.
    pub fn new(model_id: impl Into<String>, os_version_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            os_version_id: os_version_id.into(),
            locale: default_locale(),
            orientation: Orientation::default(),
        }
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} ({}, {})",
            self.model_id,
            self.os_version_id,
            self.locale,
            self.orientation.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

/// A device model offered by the lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub id: String,
    pub name: String,
    /// OS versions this model can run, oldest first.
    pub supported_os_versions: Vec<String>,
    /// Free-form tags such as `"default"` or `"virtual"`.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DeviceModel {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// The set of devices a lab can run on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    pub models: Vec<DeviceModel>,
}

impl DeviceCatalog {
    pub fn model(&self, id: &str) -> Option<&DeviceModel> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Returns `true` if the catalog offers `device`'s model at its OS version.
    pub fn supports(&self, device: &DeviceSpec) -> bool {
        self.model(&device.model_id)
            .map(|m| m.supported_os_versions.contains(&device.os_version_id))
            .unwrap_or(false)
    }
}

/// Chooses the devices to run on from the lab's catalog.
///
/// Implemented for any `Fn(&DeviceCatalog) -> Vec<DeviceSpec>`, so closures
/// can be passed directly:
///
/// ```
/// use labrunner::lab::{DeviceCatalog, DevicePicker, DeviceSpec};
///
/// let picker = |catalog: &DeviceCatalog| {
///     catalog
///         .models
///         .iter()
///         .filter(|m| m.has_tag("virtual"))
///         .filter_map(|m| m.supported_os_versions.last().map(|v| DeviceSpec::new(&m.id, v)))
///         .collect::<Vec<_>>()
/// };
/// assert!(picker.pick(&DeviceCatalog::default()).is_empty());
/// ```
pub trait DevicePicker: Send + Sync {
    fn pick(&self, catalog: &DeviceCatalog) -> Vec<DeviceSpec>;
}

impl<F> DevicePicker for F
where
    F: Fn(&DeviceCatalog) -> Vec<DeviceSpec> + Send + Sync,
{
    fn pick(&self, catalog: &DeviceCatalog) -> Vec<DeviceSpec> {
        self(catalog)
    }
}

/// Picker that ignores the catalog and returns a fixed device list.
#[derive(Debug, Clone)]
pub struct FixedDevices(pub Vec<DeviceSpec>);

impl DevicePicker for FixedDevices {
    fn pick(&self, _catalog: &DeviceCatalog) -> Vec<DeviceSpec> {
        self.0.clone()
    }
}

/// Devices used when the caller doesn't supply a picker: every model tagged
/// `default`, on the newest OS version it supports.
pub fn default_devices(catalog: &DeviceCatalog) -> Vec<DeviceSpec> {
    catalog
        .models
        .iter()
        .filter(|m| m.has_tag("default"))
        .filter_map(|m| {
            m.supported_os_versions
                .last()
                .map(|version| DeviceSpec::new(&m.id, version))
        })
        .collect()
}

/// Execution settings that are part of a run's identity.
///
/// Both fields feed into the [`RunFingerprint`], so changing either one
/// produces a new run instead of reusing a cached one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOptions {
    /// Instrumentation arguments / environment passed to the runner.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Test filters (packages, classes). Empty means "run everything".
    #[serde(default)]
    pub test_targets: Vec<String>,
}

/// Observed state of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    CompleteSuccess,
    CompleteFailure,
}

impl RunState {
    /// Returns `true` once the run will not change any more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::CompleteSuccess | RunState::CompleteFailure)
    }

    /// Position in the forward-only lifecycle.
    pub fn rank(&self) -> u8 {
        match self {
            RunState::Pending => 0,
            RunState::Running => 1,
            RunState::CompleteSuccess | RunState::CompleteFailure => 2,
        }
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is allowed; going backwards or switching
    /// between the two terminal states is not.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next.rank() >= self.rank()
    }
}

/// Outcome summary the lab attaches to a finished run.
///
/// The presence of an outcome on a freshly scheduled run means the lab had
/// already executed it, which labrunner counts as a cached run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeSummary {
    Success,
    Failure,
    Inconclusive,
    Skipped,
}

/// The lab's view of a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRun {
    /// Lab-assigned run id. A lab that omits it has sent a corrupt response.
    pub run_id: Option<String>,
    pub device: DeviceSpec,
    pub state: RunState,
    pub outcome: Option<OutcomeSummary>,
    /// Storage prefix holding the run's result files, once written.
    pub results_location: Option<String>,
}

impl RemoteRun {
    /// Returns the run id if the response carried a non-empty one.
    pub fn id(&self) -> Option<&str> {
        self.run_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn passed(&self) -> bool {
        self.state == RunState::CompleteSuccess
    }
}

/// Everything the lab needs to start one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub test_artifact: ArtifactReference,
    pub app_artifact: ArtifactReference,
    pub device: DeviceSpec,
    pub options: TestOptions,
    /// Client token identifying identical requests.
    pub fingerprint: RunFingerprint,
    /// Storage prefix the lab should write results to.
    pub results_location: String,
    /// Project the run is billed to, for labs that need one.
    pub project_id: Option<String>,
}

/// A remote device test lab.
///
/// # Thread Safety
///
/// Labs must be `Send + Sync`; submissions for different devices of one
/// batch are issued concurrently.
#[async_trait]
pub trait TestLab: Send + Sync {
    /// Fetches the devices this lab can run on.
    async fn device_catalog(&self) -> LabResult<DeviceCatalog>;

    /// Starts a new run. Submissions are not undone by dropping the caller.
    async fn submit_run(&self, request: &RunRequest) -> LabResult<RemoteRun>;

    /// Returns the current state of a run.
    ///
    /// # Errors
    ///
    /// - `LabError::NotFound` - The lab has no run with this id
    /// - `LabError::Transport` - The lab could not be reached
    async fn get_run(&self, run_id: &str) -> LabResult<RemoteRun>;
}

#[cfg(test)]
mod tests {
    use super::*;

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
                    tags: vec!["virtual".to_string()],
                },
            ],
        }
    }

    #[test]
    fn test_state_transitions_forward_only() {
        assert!(RunState::Pending.can_advance_to(RunState::Running));
        assert!(RunState::Pending.can_advance_to(RunState::CompleteFailure));
        assert!(RunState::Running.can_advance_to(RunState::Running));
        assert!(!RunState::Running.can_advance_to(RunState::Pending));
        assert!(!RunState::CompleteSuccess.can_advance_to(RunState::Running));
        assert!(!RunState::CompleteSuccess.can_advance_to(RunState::CompleteFailure));
        assert!(RunState::CompleteFailure.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn test_default_devices_picks_newest_default() {
        let devices = default_devices(&catalog());
        assert_eq!(devices, vec![DeviceSpec::new("pixel6", "33")]);
    }

    #[test]
    fn test_closure_picker() {
        let picker = |c: &DeviceCatalog| {
            c.models
                .iter()
                .map(|m| DeviceSpec::new(&m.id, &m.supported_os_versions[0]))
                .collect::<Vec<_>>()
        };
        assert_eq!(picker.pick(&catalog()).len(), 2);
    }

    #[test]
    fn test_catalog_supports() {
        let catalog = catalog();
        assert!(catalog.supports(&DeviceSpec::new("pixel6", "31")));
        assert!(!catalog.supports(&DeviceSpec::new("pixel6", "30")));
        assert!(!catalog.supports(&DeviceSpec::new("unknown", "30")));
    }

    #[test]
    fn test_remote_run_empty_id_is_missing() {
        let run = RemoteRun {
            run_id: Some(String::new()),
            device: DeviceSpec::new("pixel6", "33"),
            state: RunState::Pending,
            outcome: None,
            results_location: None,
        };
        assert!(run.id().is_none());
    }
}
