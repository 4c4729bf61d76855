//! Deterministic run fingerprints.
//!
//! A fingerprint identifies "the same run": same test package, same app, same
//! device configuration and same execution options. It is the key of the
//! [`RunCache`](crate::cache::RunCache). Computing it is a pure function of
//! its inputs; no clock or randomness is involved.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::lab::{DeviceSpec, TestOptions};
use crate::storage::ArtifactReference;

/// Bumped whenever the encoding below changes so old cache entries stop
/// matching.
const FINGERPRINT_VERSION: &str = "labrunner-run-v1";

/// Cache key for a run, as a lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunFingerprint(String);

impl RunFingerprint {
    /// Computes the fingerprint of a run request.
    ///
    /// Every field is length-prefixed before hashing, so values can't bleed
    /// into their neighbours (`"ab" + "c"` and `"a" + "bc"` differ).
    pub fn compute(
        test_artifact: &ArtifactReference,
        app_artifact: &ArtifactReference,
        device: &DeviceSpec,
        options: &TestOptions,
    ) -> Self {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        };

        field(FINGERPRINT_VERSION);
        field(test_artifact.path());
        field(app_artifact.path());
        field(&device.model_id);
        field(&device.os_version_id);
        field(&device.locale);
        field(device.orientation.as_str());

        // BTreeMap iteration is sorted, which keeps the encoding canonical.
        field(&options.environment.len().to_string());
        for (key, value) in &options.environment {
            field(key);
            field(value);
        }
        field(&options.test_targets.len().to_string());
        for target in &options.test_targets {
            field(target);
        }

        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wraps an already computed digest, e.g. one read back from a cache file.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
