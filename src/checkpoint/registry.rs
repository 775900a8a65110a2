//! Versioned checkpoint registry.
//!
//! One `checkpoints.json` per model directory:
//!
//! ```json
//! {"versions": {"v1": 0, "v2": 1}, "latest": "v1", "step": 1}
//! ```
//!
//! Mutating methods consume and return the registry; nothing touches disk
//! until [`Checkpoints::save`].

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{CHECKPOINT_FILE, MODEL_BASENAME};
use crate::error::{Error, Result};

/// Registry key for a caller-facing version.
pub fn version_key(version: impl Display) -> String {
    format!("v{}", version)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoints {
    #[serde(skip)]
    model_dir: PathBuf,
    versions: BTreeMap<String, i64>,
    latest: Option<String>,
    /// Last allocated step; `-1` before the first save.
    step: i64,
}

impl Checkpoints {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            versions: BTreeMap::new(),
            latest: None,
            step: -1,
        }
    }

    /// Read the registry of `model_dir`; `None` if nothing was saved there yet.
    pub fn load(model_dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let model_dir = model_dir.as_ref();
        let path = model_dir.join(CHECKPOINT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let mut checkpoints: Checkpoints = serde_json::from_str(&text)?;
        checkpoints
            .validate()
            .map_err(|msg| Error::InvalidArgument(format!("{}: {}", path.display(), msg)))?;
        checkpoints.model_dir = model_dir.to_path_buf();
        Ok(Some(checkpoints))
    }

    /// `latest` names a registered version, is set whenever any version is,
    /// and no version owns a step that has not been allocated yet.
    fn validate(&self) -> std::result::Result<(), String> {
        if self.step < -1 {
            return Err(format!("step {} is below -1", self.step));
        }
        if let Some((key, step)) = self
            .versions
            .iter()
            .find(|(_, step)| **step < 0 || **step > self.step)
        {
            return Err(format!(
                "version {} owns step {} outside 0..={}",
                key, step, self.step
            ));
        }
        match &self.latest {
            Some(latest) if !self.versions.contains_key(latest) => {
                Err(format!("latest {} is not a registered version", latest))
            }
            None if !self.versions.is_empty() => {
                Err("latest is unset but versions are registered".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Existing registry or a fresh one.
    pub fn load_or_new(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        Ok(Self::load(model_dir)?.unwrap_or_else(|| Self::new(model_dir)))
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn versions(&self) -> &BTreeMap<String, i64> {
        &self.versions
    }

    pub fn latest(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn next_step(&self) -> i64 {
        self.step + 1
    }

    /// Register the next unused step under `version`.
    pub fn update_next(mut self, version: impl Display, set_latest: bool) -> Self {
        let key = version_key(version);
        let step = self.next_step();
        self.versions.insert(key.clone(), step);
        self.step = step;
        if self.latest.is_none() || set_latest {
            self.latest = Some(key);
        }
        self
    }

    /// Alias the step of `source` under `target`.
    pub fn copy(
        mut self,
        source: impl Display,
        target: impl Display,
        set_latest: bool,
    ) -> Result<Self> {
        let source_key = version_key(source);
        let step = *self
            .versions
            .get(&source_key)
            .ok_or_else(|| Error::NotFound(format!("version {}", source_key)))?;
        let key = version_key(target);
        self.versions.insert(key.clone(), step);
        if self.latest.is_none() || set_latest {
            self.latest = Some(key);
        }
        Ok(self)
    }

    /// Artifact path for `version`, or for `latest` when `None`.
    pub fn model_path(&self, version: Option<&str>) -> Result<PathBuf> {
        let key = match version {
            Some(v) => version_key(v),
            None => self
                .latest
                .clone()
                .ok_or_else(|| Error::NotFound("no latest version".into()))?,
        };
        let step = self
            .versions
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("version {}", key)))?;
        Ok(self.step_path(*step))
    }

    /// Artifact path for the step that the next `update_next` will allocate.
    pub fn next_model_path(&self) -> PathBuf {
        self.step_path(self.next_step())
    }

    fn step_path(&self, step: i64) -> PathBuf {
        self.model_dir.join(format!("{}-{}", MODEL_BASENAME, step))
    }

    /// Atomically overwrite `checkpoints.json`.
    pub fn save(&self) -> Result<()> {
        ensure_model_dir(&self.model_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&self.model_dir.join(CHECKPOINT_FILE), json.as_bytes())?;
        tracing::debug!(
            "saved checkpoint registry in {} (step {}, latest {:?})",
            self.model_dir.display(),
            self.step,
            self.latest
        );
        Ok(())
    }
}

/// Create `dir` if missing; a plain file in its place is an error.
pub(crate) fn ensure_model_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(Error::DirectoryIsFile(dir.to_path_buf()));
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Write to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
