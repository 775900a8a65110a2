//! On-disk parameter artifact: the model plus both vocabularies, bincode.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::labels::Labels;
use crate::core::model::LstmModel;
use crate::error::Result;

use super::registry::write_atomic;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterArtifact {
    pub model: LstmModel,
    pub word_labels: Labels,
    pub output_labels: Labels,
}

impl ParameterArtifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let artifact: ParameterArtifact = bincode::deserialize(bytes)?;
        Ok(Self {
            model: artifact.model,
            word_labels: artifact.word_labels.reindex(),
            output_labels: artifact.output_labels.reindex(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}
