//! Symbol vocabularies.
//!
//! Input vocabularies reserve index 0 for the unknown token, so encoding
//! with `handle_unknown` never fails.  Target vocabularies are closed: every
//! index is a label seen in the data.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::UNKNOWN_TOKEN;
use crate::error::{Error, Result};

/// A bidirectional symbol ↔ index mapping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Labels {
    symbols: Vec<String>,
    /// Index 0 is the unknown token.
    reserves_unknown: bool,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Labels {
    /// Build from an iterator of symbols. Duplicates are ignored and the
    /// remaining symbols are sorted so the encoding is stable across runs.
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique = sorted_unique(symbols.into_iter().map(Into::into).filter(|s| s != UNKNOWN_TOKEN));
        let mut all = Vec::with_capacity(unique.len() + 1);
        all.push(UNKNOWN_TOKEN.to_string());
        all.extend(unique);
        Self::from_ordered(all, true)
    }

    /// Like [`Labels::from_symbols`] but without the reserved unknown token.
    pub fn closed<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_ordered(sorted_unique(symbols.into_iter().map(Into::into)), false)
    }

    fn from_ordered(symbols: Vec<String>, reserves_unknown: bool) -> Self {
        let index = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Self {
            symbols,
            reserves_unknown,
            index,
        }
    }

    /// Rebuild the lookup table after deserialisation.
    pub(crate) fn reindex(self) -> Self {
        Self::from_ordered(self.symbols, self.reserves_unknown)
    }

    pub fn reserves_unknown(&self) -> bool {
        self.reserves_unknown
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.index.contains_key(symbol)
    }

    /// Encode a symbol. Out-of-vocabulary symbols map to the unknown token
    /// when `handle_unknown` is set and one is reserved, otherwise they are
    /// an error.
    pub fn encode(&self, symbol: &str, handle_unknown: bool) -> Result<usize> {
        match self.index.get(symbol) {
            Some(&i) => Ok(i),
            None if handle_unknown && self.reserves_unknown => Ok(0),
            None => Err(Error::UnknownSymbol(symbol.to_string())),
        }
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.symbols.get(index).map(String::as_str)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

fn sorted_unique(symbols: impl Iterator<Item = String>) -> Vec<String> {
    let mut unique: Vec<String> = symbols.collect();
    unique.sort();
    unique.dedup();
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_is_index_zero() {
        let labels = Labels::from_symbols(["the", "cat", "the"]);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.decode(0), Some(UNKNOWN_TOKEN));
        assert_eq!(labels.encode("cat", false).unwrap(), 1);
        assert_eq!(labels.encode("the", false).unwrap(), 2);
    }

    #[test]
    fn test_handle_unknown() {
        let labels = Labels::from_symbols(["a"]);
        assert_eq!(labels.encode("zebra", true).unwrap(), 0);
        assert!(matches!(
            labels.encode("zebra", false),
            Err(Error::UnknownSymbol(s)) if s == "zebra"
        ));
    }

    #[test]
    fn test_reindex_after_serde() {
        let labels = Labels::from_symbols(["x", "y"]);
        let bytes = bincode::serialize(&labels).unwrap();
        let restored: Labels = bincode::deserialize::<Labels>(&bytes).unwrap().reindex();
        assert_eq!(restored.encode("y", false).unwrap(), 2);
        assert!(restored.reserves_unknown());
    }

    #[test]
    fn test_closed_labels_have_no_unknown() {
        let labels = Labels::closed(["VERB", "DET", "VERB"]);
        assert_eq!(labels.symbols(), ["DET", "VERB"]);
        assert!(!labels.contains(UNKNOWN_TOKEN));
        assert!(matches!(labels.encode("NOUN", true), Err(Error::UnknownSymbol(_))));

        let bytes = bincode::serialize(&labels).unwrap();
        let restored = bincode::deserialize::<Labels>(&bytes).unwrap().reindex();
        assert_eq!(restored.encode("VERB", false).unwrap(), 1);
        assert!(!restored.reserves_unknown());
    }
}
