//! Fixed registry of instrumentable signals.
//!
//! Names are resolved once into an [`InstrumentSet`]; unknown names fail at
//! that point rather than when a step is evaluated.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::model::StepTrace;
use super::state::Part;

/// One exposed internal signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instrument {
    /// The raw input embedding (a single synthetic layer 0).
    Embedding,
    /// One of the ten per-layer cell slots.
    Part(Part),
}

impl Instrument {
    pub fn name(self) -> &'static str {
        match self {
            Instrument::Embedding => "embedding",
            Instrument::Part(part) => part.name(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        if name == "embedding" {
            return Ok(Instrument::Embedding);
        }
        Part::from_name(name)
            .map(Instrument::Part)
            .ok_or_else(|| Error::UnknownInstrument(name.to_string()))
    }

    /// Every instrument: the embedding first, then the parts in slot order.
    pub fn all() -> Vec<Instrument> {
        std::iter::once(Instrument::Embedding)
            .chain(Part::ALL.into_iter().map(Instrument::Part))
            .collect()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved, de-duplicated selection of instruments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstrumentSet {
    instruments: Vec<Instrument>,
}

impl InstrumentSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            instruments: Instrument::all(),
        }
    }

    pub fn of(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        let mut instruments: Vec<_> = instruments.into_iter().collect();
        instruments.sort();
        instruments.dedup();
        Self { instruments }
    }

    /// Resolve names; any unknown name rejects the whole set.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let parsed = names
            .iter()
            .map(|n| Instrument::parse(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::of(parsed))
    }

    pub fn contains(&self, instrument: Instrument) -> bool {
        self.instruments.contains(&instrument)
    }

    pub fn iter(&self) -> impl Iterator<Item = Instrument> + '_ {
        self.instruments.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

/// Values captured for an [`InstrumentSet`] at one timestep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstrumentValues {
    values: BTreeMap<Instrument, Vec<Array1<f32>>>,
}

impl InstrumentValues {
    /// Copy the selected signals out of a step trace.
    pub fn capture(set: &InstrumentSet, trace: &StepTrace) -> Self {
        let values = set
            .iter()
            .map(|instrument| {
                let per_layer = match instrument {
                    Instrument::Embedding => vec![trace.embedded.clone()],
                    Instrument::Part(part) => trace
                        .state
                        .layers
                        .iter()
                        .map(|layer| layer.part(part).clone())
                        .collect(),
                };
                (instrument, per_layer)
            })
            .collect();
        Self { values }
    }

    /// The value of `instrument` at `layer` (always 0 for the embedding).
    pub fn get(&self, instrument: Instrument, layer: usize) -> Option<&Array1<f32>> {
        self.values.get(&instrument).and_then(|v| v.get(layer))
    }

    /// All layers of `instrument`.
    pub fn layers(&self, instrument: Instrument) -> Option<&[Array1<f32>]> {
        self.values.get(&instrument).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
