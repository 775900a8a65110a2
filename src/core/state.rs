//! Recurrent state management.
//!
//! Every layer carries ten width-dimensional vectors per timestep.  Only
//! `output` and `cell` feed the next step; the other eight are retained so
//! the transition can be inspected after the fact.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of instrumentation slots per layer.
pub const PART_COUNT: usize = 10;

/// One named instrumentation slot of a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Part {
    Output,
    Cell,
    RememberGate,
    ForgetGate,
    OutputGate,
    CandidateInput,
    Remember,
    PreviousCell,
    Forget,
    CandidateCell,
}

impl Part {
    /// All parts in slot order.
    pub const ALL: [Part; PART_COUNT] = [
        Part::Output,
        Part::Cell,
        Part::RememberGate,
        Part::ForgetGate,
        Part::OutputGate,
        Part::CandidateInput,
        Part::Remember,
        Part::PreviousCell,
        Part::Forget,
        Part::CandidateCell,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Part::Output => "output",
            Part::Cell => "cell",
            Part::RememberGate => "remember_gate",
            Part::ForgetGate => "forget_gate",
            Part::OutputGate => "output_gate",
            Part::CandidateInput => "candidate_input",
            Part::Remember => "remember",
            Part::PreviousCell => "previous_cell",
            Part::Forget => "forget",
            Part::CandidateCell => "candidate_cell",
        }
    }

    pub fn from_name(name: &str) -> Option<Part> {
        Part::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// The full set of slots for one layer at one timestep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub output: Array1<f32>,
    pub cell: Array1<f32>,
    pub remember_gate: Array1<f32>,
    pub forget_gate: Array1<f32>,
    pub output_gate: Array1<f32>,
    pub candidate_input: Array1<f32>,
    pub remember: Array1<f32>,
    pub previous_cell: Array1<f32>,
    pub forget: Array1<f32>,
    pub candidate_cell: Array1<f32>,
}

impl LayerState {
    pub fn zeros(width: usize) -> Self {
        Self {
            output: Array1::zeros(width),
            cell: Array1::zeros(width),
            remember_gate: Array1::zeros(width),
            forget_gate: Array1::zeros(width),
            output_gate: Array1::zeros(width),
            candidate_input: Array1::zeros(width),
            remember: Array1::zeros(width),
            previous_cell: Array1::zeros(width),
            forget: Array1::zeros(width),
            candidate_cell: Array1::zeros(width),
        }
    }

    pub fn part(&self, part: Part) -> &Array1<f32> {
        match part {
            Part::Output => &self.output,
            Part::Cell => &self.cell,
            Part::RememberGate => &self.remember_gate,
            Part::ForgetGate => &self.forget_gate,
            Part::OutputGate => &self.output_gate,
            Part::CandidateInput => &self.candidate_input,
            Part::Remember => &self.remember,
            Part::PreviousCell => &self.previous_cell,
            Part::Forget => &self.forget,
            Part::CandidateCell => &self.candidate_cell,
        }
    }

    pub fn width(&self) -> usize {
        self.output.len()
    }

    fn is_healthy(&self) -> bool {
        Part::ALL
            .iter()
            .all(|&p| self.part(p).iter().all(|v| v.is_finite()))
    }
}

/// Recurrent state of the whole stack after some number of steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurrentState {
    pub layers: Vec<LayerState>,

    /// Number of symbols processed to reach this state.
    pub steps: u64,
}

impl RecurrentState {
    /// The zero state for `layers` layers of `width` units.
    pub fn zeros(layers: usize, width: usize) -> Self {
        Self {
            layers: (0..layers).map(|_| LayerState::zeros(width)).collect(),
            steps: 0,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Output of the last layer, which feeds the output projection.
    pub fn top_output(&self) -> Option<&Array1<f32>> {
        self.layers.last().map(|l| &l.output)
    }

    /// Precondition check against a model configuration.
    pub fn check_shape(&self, layers: usize, width: usize) -> Result<()> {
        if self.layers.len() != layers {
            return Err(Error::shape("recurrent state layers", layers, self.layers.len()));
        }
        if let Some(bad) = self.layers.iter().find(|l| l.width() != width) {
            return Err(Error::shape("recurrent state width", width, bad.width()));
        }
        Ok(())
    }

    /// Check the state has not diverged (NaN or Inf).
    pub fn is_healthy(&self) -> bool {
        self.layers.iter().all(LayerState::is_healthy)
    }

    /// L2 norm of the top layer's cell (for monitoring divergence).
    pub fn cell_norm(&self) -> f32 {
        self.layers
            .last()
            .map(|l| l.cell.mapv(|v| v * v).sum().sqrt())
            .unwrap_or(0.0)
    }
}
