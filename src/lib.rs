//! labrunner: remote device-test orchestration.
//!
//! This crate schedules instrumentation tests on a remote device lab,
//! reuses runs that were already submitted with identical inputs, waits for
//! them to finish and downloads their results.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Storage**: Blob store for artifacts and results ([`storage`], [`artifact`])
//! - **Lab**: The remote test lab and its device catalog ([`lab`])
//! - **Cache**: Fingerprint-to-run mapping that deduplicates submissions ([`cache`], [`fingerprint`])
//! - **Orchestrator**: Scheduling, polling and downloading ([`orchestrator`])
//! - **Archive**: Lazy reading of compressed result bundles ([`archive`])
//! - **Tracker**: Labels, comments and CI artifacts on the issue tracker ([`tracker`])
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
//!     let batch = service.schedule(Path::new("app-test.apk"), None, None).await?;
//!     println!("{} new, {} cached", batch.new_tests, batch.cached_tests);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod artifact;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lab;
pub mod orchestrator;
pub mod storage;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use error::{Error, Result};
pub use lab::{DevicePicker, DeviceSpec, RemoteRun, RunState, TestLab, TestOptions};
pub use orchestrator::{ScheduledBatch, TestRunResponse, TestRunService};
pub use storage::{ArtifactReference, BlobStore};
