//! Model skeleton: wires the embedding, the optional embedding projection,
//! the stacked LSTM layers and the output projection together.

use ndarray::{Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_EMBEDDING_WIDTH, DEFAULT_LAYERS, DEFAULT_WIDTH};
use crate::error::{Error, Result};

use super::cell::{xavier_normal, Gate, LayerWeights};
use super::state::{LayerState, RecurrentState};

/// What the output layer is trained to predict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// One target per timestep (typically the next symbol).
    LanguageModel,
    /// One target per sequence, scored at the last timestep.
    Classification,
}

/// Architecture hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub layers: usize,
    pub width: usize,
    pub embedding_width: usize,
    pub task: Task,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            layers: DEFAULT_LAYERS,
            width: DEFAULT_WIDTH,
            embedding_width: DEFAULT_EMBEDDING_WIDTH,
            task: Task::LanguageModel,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layers == 0 || self.width == 0 || self.embedding_width == 0 {
            return Err(Error::InvalidArgument(format!(
                "layers, width and embedding_width must be positive (got {}, {}, {})",
                self.layers, self.width, self.embedding_width
            )));
        }
        Ok(())
    }

    /// Common vector width for recorded activations (embedding and hidden
    /// vectors are zero-padded to this).
    pub fn record_width(&self) -> usize {
        self.width.max(self.embedding_width)
    }
}

/// The four gates of a layer, named after their instrumentation slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateKind {
    Remember,
    Forget,
    Output,
    Candidate,
}

impl GateKind {
    pub const ALL: [GateKind; 4] = [
        GateKind::Remember,
        GateKind::Forget,
        GateKind::Output,
        GateKind::Candidate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GateKind::Remember => "remember_gate",
            GateKind::Forget => "forget_gate",
            GateKind::Output => "output_gate",
            GateKind::Candidate => "candidate_input",
        }
    }

    fn of(self, layer: &LayerWeights) -> &Gate {
        match self {
            GateKind::Remember => &layer.remember_gate,
            GateKind::Forget => &layer.forget_gate,
            GateKind::Output => &layer.output_gate,
            GateKind::Candidate => &layer.candidate_input,
        }
    }
}

/// A learned tensor addressable by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterName {
    Embedding,
    EmbeddingProjection,
    GateWeight(GateKind),
    GateBias(GateKind),
    SoftmaxWeight,
    SoftmaxBias,
}

impl ParameterName {
    /// Parse `embedding`, `embedding_projection`, `<gate>.weight`,
    /// `<gate>.bias`, `softmax.weight` or `softmax.bias`.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "embedding" => return Ok(ParameterName::Embedding),
            "embedding_projection" => return Ok(ParameterName::EmbeddingProjection),
            "softmax.weight" => return Ok(ParameterName::SoftmaxWeight),
            "softmax.bias" => return Ok(ParameterName::SoftmaxBias),
            _ => {}
        }
        let (gate, suffix) = name
            .split_once('.')
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        let kind = GateKind::ALL
            .into_iter()
            .find(|k| k.name() == gate)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        match suffix {
            "weight" => Ok(ParameterName::GateWeight(kind)),
            "bias" => Ok(ParameterName::GateBias(kind)),
            _ => Err(Error::UnknownParameter(name.to_string())),
        }
    }

    pub fn is_layered(self) -> bool {
        matches!(self, ParameterName::GateWeight(_) | ParameterName::GateBias(_))
    }
}

/// All learned parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LstmParams {
    /// Embedding matrix: [vocab, embedding_width]
    pub embedding: Array2<f32>,

    /// Projection to recurrent width: [width, embedding_width]; `None` when
    /// the widths already match.
    pub projection: Option<Array2<f32>>,

    pub layers: Vec<LayerWeights>,

    /// Output projection: [outputs, width]
    pub softmax_weight: Array2<f32>,

    pub softmax_bias: Array1<f32>,
}

impl LstmParams {
    pub fn xavier<R: Rng>(
        config: &ModelConfig,
        vocab_size: usize,
        output_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let embedding = xavier_normal(vocab_size, config.embedding_width, rng)?;
        let projection = if config.embedding_width != config.width {
            Some(xavier_normal(config.width, config.embedding_width, rng)?)
        } else {
            None
        };
        let layers = (0..config.layers)
            .map(|_| LayerWeights::xavier(config.width, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embedding,
            projection,
            layers,
            softmax_weight: xavier_normal(output_size, config.width, rng)?,
            softmax_bias: Array1::zeros(output_size),
        })
    }

    /// Same shapes, all zeros (gradient accumulator).
    pub fn zeros_like(&self) -> Self {
        Self {
            embedding: Array2::zeros(self.embedding.raw_dim()),
            projection: self.projection.as_ref().map(|p| Array2::zeros(p.raw_dim())),
            layers: self
                .layers
                .iter()
                .map(|l| LayerWeights::zeros(l.width()))
                .collect(),
            softmax_weight: Array2::zeros(self.softmax_weight.raw_dim()),
            softmax_bias: Array1::zeros(self.softmax_bias.raw_dim()),
        }
    }

    /// Every tensor, in a fixed order.
    pub fn tensors(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut out = vec![self.embedding.view().into_dyn()];
        if let Some(p) = &self.projection {
            out.push(p.view().into_dyn());
        }
        for layer in &self.layers {
            for gate in layer.gates() {
                out.push(gate.weight.view().into_dyn());
                out.push(gate.bias.view().into_dyn());
            }
        }
        out.push(self.softmax_weight.view().into_dyn());
        out.push(self.softmax_bias.view().into_dyn());
        out
    }

    /// Every tensor mutably, in the same order as [`LstmParams::tensors`].
    pub fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = vec![self.embedding.view_mut().into_dyn()];
        if let Some(p) = &mut self.projection {
            out.push(p.view_mut().into_dyn());
        }
        for layer in &mut self.layers {
            for gate in layer.gates_mut() {
                out.push(gate.weight.view_mut().into_dyn());
                out.push(gate.bias.view_mut().into_dyn());
            }
        }
        out.push(self.softmax_weight.view_mut().into_dyn());
        out.push(self.softmax_bias.view_mut().into_dyn());
        out
    }

    /// `self += other`, tensor by tensor.
    pub fn add_assign(&mut self, other: &LstmParams) {
        for (mut a, b) in self.tensors_mut().into_iter().zip(other.tensors()) {
            a += &b;
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for mut t in self.tensors_mut() {
            t.mapv_inplace(|v| v * factor);
        }
    }

    /// Rescale each tensor whose L2 norm exceeds `clip_norm`.
    pub fn clip_by_norm(&mut self, clip_norm: f32) {
        for mut t in self.tensors_mut() {
            let norm = t.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > clip_norm && norm > 0.0 {
                let factor = clip_norm / norm;
                t.mapv_inplace(|v| v * factor);
            }
        }
    }

    /// Gradient descent: `self -= learning_rate · gradients`.
    pub fn descend(&mut self, gradients: &LstmParams, learning_rate: f32) {
        for (mut p, g) in self.tensors_mut().into_iter().zip(gradients.tensors()) {
            p.scaled_add(-learning_rate, &g);
        }
    }

    pub fn param_count(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }
}

/// Dropout masks for one timestep.  Entries are `0` or `1 / keep`.
#[derive(Clone, Debug, Default)]
pub struct Masks {
    /// Per-layer input masks.
    pub inputs: Vec<Option<Array1<f32>>>,
    /// Mask on the top output before the output projection.
    pub output: Option<Array1<f32>>,
}

impl Masks {
    /// No dropout.
    pub fn none(layers: usize) -> Self {
        Self {
            inputs: vec![None; layers],
            output: None,
        }
    }

    /// Fresh inverted-dropout masks at keep probability `keep`.
    pub fn sample<R: Rng>(layers: usize, width: usize, keep: f32, rng: &mut R) -> Self {
        if keep >= 1.0 {
            return Self::none(layers);
        }
        let mut mask = || {
            Some(Array1::from_shape_fn(width, |_| {
                if rng.gen::<f32>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            }))
        };
        let inputs = (0..layers).map(|_| mask()).collect();
        let output = mask();
        Self { inputs, output }
    }
}

fn apply_mask(x: &Array1<f32>, mask: Option<&Array1<f32>>) -> Array1<f32> {
    match mask {
        Some(m) => x * m,
        None => x.clone(),
    }
}

/// Everything computed for one timestep.
#[derive(Clone, Debug)]
pub struct StepTrace {
    pub symbol: usize,
    /// Raw embedding row.
    pub embedded: Array1<f32>,
    /// Embedding in recurrent width (before dropout).
    pub projected: Array1<f32>,
    /// Per-layer inputs after dropout.
    pub inputs: Vec<Array1<f32>>,
    /// Top-layer output after output dropout.
    pub top: Array1<f32>,
    pub state: RecurrentState,
    pub logits: Array1<f32>,
}

/// The complete LSTM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LstmModel {
    pub config: ModelConfig,
    pub params: LstmParams,
}

impl LstmModel {
    /// Create a model with Xavier-initialised weights.
    pub fn new(
        config: ModelConfig,
        vocab_size: usize,
        output_size: usize,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        if vocab_size == 0 || output_size == 0 {
            return Err(Error::InvalidArgument(
                "vocabulary and output labels must be non-empty".into(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let params = LstmParams::xavier(&config, vocab_size, output_size, &mut rng)?;
        Ok(Self { config, params })
    }

    pub fn vocab_size(&self) -> usize {
        self.params.embedding.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.params.softmax_bias.len()
    }

    pub fn zero_state(&self) -> RecurrentState {
        RecurrentState::zeros(self.config.layers, self.config.width)
    }

    /// Look up the embedding for a single symbol index.
    pub fn embed(&self, symbol: usize) -> Result<Array1<f32>> {
        if symbol >= self.vocab_size() {
            return Err(Error::shape("symbol index", format!("< {}", self.vocab_size()), symbol));
        }
        Ok(self.params.embedding.row(symbol).to_owned())
    }

    /// Bring an embedding to recurrent width.
    pub fn project(&self, embedded: &Array1<f32>) -> Array1<f32> {
        match &self.params.projection {
            Some(p) => p.dot(embedded),
            None => embedded.clone(),
        }
    }

    /// Single-step forward pass.
    pub fn step(&self, symbol: usize, prior: &RecurrentState, masks: &Masks) -> Result<StepTrace> {
        prior.check_shape(self.config.layers, self.config.width)?;
        let embedded = self.embed(symbol)?;
        let projected = self.project(&embedded);

        let mut inputs = Vec::with_capacity(self.config.layers);
        let mut layers: Vec<LayerState> = Vec::with_capacity(self.config.layers);
        for (l, weights) in self.params.layers.iter().enumerate() {
            let below = match layers.last() {
                Some(state) => &state.output,
                None => &projected,
            };
            let x = apply_mask(below, masks.inputs.get(l).and_then(Option::as_ref));
            layers.push(weights.step(&prior.layers[l], &x)?);
            inputs.push(x);
        }

        let state = RecurrentState {
            layers,
            steps: prior.steps + 1,
        };
        let top_output = state
            .top_output()
            .ok_or_else(|| Error::shape("recurrent state layers", "> 0", 0))?;
        let top = apply_mask(top_output, masks.output.as_ref());
        let logits = self.params.softmax_weight.dot(&top) + &self.params.softmax_bias;

        Ok(StepTrace {
            symbol,
            embedded,
            projected,
            inputs,
            top,
            state,
            logits,
        })
    }

    /// Unrolled evaluation over a whole sequence without dropout.
    pub fn unroll(&self, symbols: &[usize], initial: Option<&RecurrentState>) -> Result<Vec<StepTrace>> {
        let masks = vec![Masks::none(self.config.layers); symbols.len()];
        self.unroll_masked(symbols, initial, &masks)
    }

    /// Unrolled evaluation with one set of dropout masks per timestep.
    pub fn unroll_masked(
        &self,
        symbols: &[usize],
        initial: Option<&RecurrentState>,
        masks: &[Masks],
    ) -> Result<Vec<StepTrace>> {
        if masks.len() != symbols.len() {
            return Err(Error::shape("dropout masks", symbols.len(), masks.len()));
        }
        let mut state = initial.cloned().unwrap_or_else(|| self.zero_state());
        let mut traces = Vec::with_capacity(symbols.len());
        for (&symbol, m) in symbols.iter().zip(masks) {
            let trace = self.step(symbol, &state, m)?;
            state = trace.state.clone();
            traces.push(trace);
        }
        Ok(traces)
    }

    /// Read a learned tensor by name, optionally indexed by layer.
    pub fn probe(&self, name: ParameterName, layer: Option<usize>) -> Result<ArrayD<f32>> {
        match (name.is_layered(), layer) {
            (true, None) => {
                return Err(Error::InvalidArgument(format!(
                    "parameter {:?} requires a layer index",
                    name
                )))
            }
            (true, Some(l)) if l >= self.config.layers => {
                return Err(Error::shape("probe layer", format!("< {}", self.config.layers), l))
            }
            (false, Some(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "parameter {:?} is not per-layer",
                    name
                )))
            }
            _ => {}
        }

        let p = &self.params;
        let value = match name {
            ParameterName::Embedding => p.embedding.clone().into_dyn(),
            ParameterName::EmbeddingProjection => match &p.projection {
                Some(m) => m.clone().into_dyn(),
                None => Array2::<f32>::eye(self.config.width).into_dyn(),
            },
            ParameterName::GateWeight(kind) => {
                let l = layer.unwrap_or_default();
                kind.of(&p.layers[l]).weight.clone().into_dyn()
            }
            ParameterName::GateBias(kind) => {
                let l = layer.unwrap_or_default();
                kind.of(&p.layers[l]).bias.clone().into_dyn()
            }
            ParameterName::SoftmaxWeight => p.softmax_weight.clone().into_dyn(),
            ParameterName::SoftmaxBias => p.softmax_bias.clone().into_dyn(),
        };
        Ok(value)
    }
}

// ---- Utility ----

/// Numerically stable softmax.
pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// `-ln p(target)` under `softmax(logits)`.
pub fn cross_entropy(logits: &Array1<f32>, target: usize) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
    log_sum - logits[target]
}
