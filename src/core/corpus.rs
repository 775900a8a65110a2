//! Labelled sequences and their JSON-lines file format.
//!
//! One sequence per line: `{"inputs": ["the", "cat"], "targets": ["DET", "NOUN"]}`.
//! Per-timestep annotations have one target per input; whole-sequence
//! annotations have a single target.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::labels::Labels;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledSequence {
    pub inputs: Vec<String>,
    pub targets: Vec<String>,
}

impl LabeledSequence {
    pub fn new<S: Into<String>>(
        inputs: impl IntoIterator<Item = S>,
        targets: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Read a JSON-lines corpus.  Blank lines are skipped.
pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<LabeledSequence>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut sequences = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sequence: LabeledSequence = serde_json::from_str(&line).map_err(|e| {
            Error::InvalidArgument(format!("{}:{}: {}", path.display(), number + 1, e))
        })?;
        sequences.push(sequence);
    }
    Ok(sequences)
}

/// Input and target vocabularies covering `sequences`; only the input side
/// reserves the unknown token.
pub fn vocabularies(sequences: &[LabeledSequence]) -> (Labels, Labels) {
    let words = Labels::from_symbols(sequences.iter().flat_map(|s| s.inputs.iter().cloned()));
    let targets = Labels::closed(sequences.iter().flat_map(|s| s.targets.iter().cloned()));
    (words, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_jsonl() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"inputs": ["the", "cat"], "targets": ["DET", "NOUN"]}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"inputs": ["sat"], "targets": ["VERB"]}}"#).unwrap();

        let corpus = read_jsonl(file.path()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus[0], LabeledSequence::new(["the", "cat"], ["DET", "NOUN"]));

        let (words, tags) = vocabularies(&corpus);
        assert_eq!(words.len(), 4);
        assert_eq!(tags.len(), 3);
        assert!(words.reserves_unknown());
        assert!(!tags.contains(crate::config::UNKNOWN_TOKEN));
    }

    #[test]
    fn test_bad_line_reports_position() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"inputs": ["a"], "targets": ["b"]}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        let err = read_jsonl(file.path()).unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }
}
