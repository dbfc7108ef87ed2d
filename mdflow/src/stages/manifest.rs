//! Per-stage completion manifest.
//!
//! Written into the stage directory after a verified success. On resume the
//! stored parameter hash is compared with the current one so that a skip
//! over changed parameters is at least visible in the logs.

use super::StageDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tracing::warn;

/// File name of the manifest inside a stage directory.
pub const MANIFEST_FILE: &str = ".mdflow-stage.json";

/// Hashes the inputs that determine a stage's outputs.
///
/// Covers the template bytes, the overrides and the engine call
/// definitions. Returns the first 16 bytes of the SHA-256 digest as hex.
///
/// # Errors
///
/// Returns an error if the overrides or calls cannot be serialized.
pub fn hash_parameters(
    template: &[u8],
    descriptor: &StageDescriptor,
) -> serde_json::Result<String> {
    let params = serde_json::json!({
        "template_sha256": hex::encode(Sha256::digest(template)),
        "overrides": serde_json::to_value(descriptor.overrides())?,
        "calls": serde_json::to_value(descriptor.engine_calls())?,
    });
    let json = serde_json::to_string(&params)?;
    let digest = Sha256::digest(json.as_bytes());
    Ok(hex::encode(&digest[..16]))
}

/// Record of a completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    /// Stage name.
    pub stage: String,
    /// Hash from [`hash_parameters`].
    pub params_hash: String,
    /// Outputs verified at completion.
    pub outputs: Vec<String>,
    /// When the stage completed.
    pub completed_at: DateTime<Utc>,
}

impl StageManifest {
    /// Creates a manifest for `descriptor` from the template bytes the
    /// stage ran with.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters cannot be hashed.
    pub fn for_stage(descriptor: &StageDescriptor, template: &[u8]) -> io::Result<Self> {
        let hash = hash_parameters(template, descriptor).map_err(io::Error::other)?;
        Ok(Self::new(descriptor, hash))
    }

    /// Creates a manifest stamped now.
    #[must_use]
    pub fn new(descriptor: &StageDescriptor, params_hash: impl Into<String>) -> Self {
        Self {
            stage: descriptor.name().to_string(),
            params_hash: params_hash.into(),
            outputs: descriptor.produced_outputs().to_vec(),
            completed_at: Utc::now(),
        }
    }

    /// Reads the manifest from a stage directory.
    ///
    /// A missing manifest is `None`; an unreadable one is logged and `None`.
    #[must_use]
    pub fn read(stage_dir: &Path) -> Option<Self> {
        let path = stage_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable stage manifest");
                None
            }
        }
    }

    /// Writes the manifest into a stage directory.
    pub fn write(&self, stage_dir: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(stage_dir.join(MANIFEST_FILE), json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterOverrides;
    use crate::stages::EngineInvocation;

    fn stage() -> StageDescriptor {
        StageDescriptor::new("nvt", "nvt.mdp")
            .produces(["nvt.gro"])
            .call(EngineInvocation::new("mdrun").args(["-deffnm", "nvt"]))
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = hash_parameters(b"nsteps = 100\n", &stage()).unwrap();
        assert_eq!(a, hash_parameters(b"nsteps = 100\n", &stage()).unwrap());
        assert_eq!(a.len(), 32);

        assert_ne!(a, hash_parameters(b"nsteps = 200\n", &stage()).unwrap());

        let overridden = stage().with_overrides(ParameterOverrides::new().with("nsteps", 5));
        assert_ne!(a, hash_parameters(b"nsteps = 100\n", &overridden).unwrap());
    }

    #[test]
    fn test_for_stage_records_hash() {
        let manifest = StageManifest::for_stage(&stage(), b"nsteps = 100\n").unwrap();
        assert_eq!(
            manifest.params_hash,
            hash_parameters(b"nsteps = 100\n", &stage()).unwrap()
        );
        assert!(manifest.params_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(manifest.outputs, vec!["nvt.gro".to_string()]);
    }

    #[test]
    fn test_manifest_roundtrip_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StageManifest::read(dir.path()).is_none());

        let manifest = StageManifest::new(&stage(), "abc");
        manifest.write(dir.path()).unwrap();

        let loaded = StageManifest::read(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.outputs, vec!["nvt.gro"]);
    }

    #[test]
    fn test_corrupt_manifest_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        assert!(StageManifest::read(dir.path()).is_none());
    }
}
