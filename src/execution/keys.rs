//! Instrumentation keys and corpus splits.

use std::fmt;

use crate::core::instruments::Instrument;
use crate::core::state::Part;

/// One exposed signal: an instrument at a layer.  The embedding only has
/// layer 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    pub instrument: Instrument,
    pub layer: usize,
}

impl InstrumentKey {
    pub fn new(instrument: Instrument, layer: usize) -> Self {
        Self { instrument, layer }
    }

    /// Every key of a `layers`-deep model: the embedding, then each part at
    /// each layer.
    pub fn all(layers: usize) -> Vec<InstrumentKey> {
        let mut keys = vec![InstrumentKey::new(Instrument::Embedding, 0)];
        for part in Part::ALL {
            for layer in 0..layers {
                keys.push(InstrumentKey::new(Instrument::Part(part), layer));
            }
        }
        keys
    }

    /// `<instrument>-<layer>`, used for stream and thread names.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.instrument.name(), self.layer)
    }
}

/// Which corpus pass a stream belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_all_keys() {
        let keys = InstrumentKey::all(2);
        assert_eq!(keys.len(), 1 + 10 * 2);
        assert_eq!(keys[0].encode(), "embedding-0");
        let names: HashSet<String> = keys.iter().map(|k| k.encode()).collect();
        assert_eq!(names.len(), keys.len());
        assert!(names.contains("forget_gate-1"));
        assert!(!names.contains("embedding-1"));
    }

    #[test]
    fn test_display_matches_encode() {
        let key = InstrumentKey::new(Instrument::Part(Part::CandidateCell), 3);
        assert_eq!(key.to_string(), key.encode());
        assert_eq!(key.encode(), "candidate_cell-3");
    }
}
