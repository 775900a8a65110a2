//! The gated-memory transition for one layer.
//!
//! ```text
//! z               = concat(o, x)
//! remember_gate   = sigmoid(W_R · z + b_R)
//! forget_gate     = sigmoid(W_F · z + b_F)
//! output_gate     = sigmoid(W_O · z + b_O)
//! candidate_input = tanh(W_H · z + b_H)
//! remember        = candidate_input ⊙ remember_gate
//! forget          = c ⊙ forget_gate
//! cell            = forget + remember
//! candidate_cell  = tanh(cell)
//! output          = candidate_cell ⊙ output_gate
//! ```
//!
//! No clipping happens here; gradients are clipped during training.

use ndarray::{s, Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::FORGET_BIAS_INIT;
use crate::error::{Error, Result};

use super::state::LayerState;

/// One affine gate: `W · z + b` with `W ∈ R^{width × 2·width}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Gate {
    pub fn zeros(width: usize) -> Self {
        Self {
            weight: Array2::zeros((width, 2 * width)),
            bias: Array1::zeros(width),
        }
    }

    /// Xavier-normal weights with a constant bias.
    pub fn xavier<R: Rng>(width: usize, bias: f32, rng: &mut R) -> Result<Self> {
        Ok(Self {
            weight: xavier_normal(width, 2 * width, rng)?,
            bias: Array1::from_elem(width, bias),
        })
    }

    /// Pre-activation `W · z + b`.
    pub fn affine(&self, z: &Array1<f32>) -> Array1<f32> {
        self.weight.dot(z) + &self.bias
    }
}

/// Weights of one LSTM layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub remember_gate: Gate,
    pub forget_gate: Gate,
    pub output_gate: Gate,
    pub candidate_input: Gate,
}

impl LayerWeights {
    pub fn zeros(width: usize) -> Self {
        Self {
            remember_gate: Gate::zeros(width),
            forget_gate: Gate::zeros(width),
            output_gate: Gate::zeros(width),
            candidate_input: Gate::zeros(width),
        }
    }

    pub fn xavier<R: Rng>(width: usize, rng: &mut R) -> Result<Self> {
        Ok(Self {
            remember_gate: Gate::xavier(width, 0.0, rng)?,
            forget_gate: Gate::xavier(width, FORGET_BIAS_INIT, rng)?,
            output_gate: Gate::xavier(width, 0.0, rng)?,
            candidate_input: Gate::xavier(width, 0.0, rng)?,
        })
    }

    pub fn width(&self) -> usize {
        self.remember_gate.bias.len()
    }

    pub fn gates(&self) -> [&Gate; 4] {
        [
            &self.remember_gate,
            &self.forget_gate,
            &self.output_gate,
            &self.candidate_input,
        ]
    }

    pub fn gates_mut(&mut self) -> [&mut Gate; 4] {
        [
            &mut self.remember_gate,
            &mut self.forget_gate,
            &mut self.output_gate,
            &mut self.candidate_input,
        ]
    }

    /// Advance one timestep from `previous` given the (already dropped-out)
    /// layer input `x`.
    pub fn step(&self, previous: &LayerState, x: &Array1<f32>) -> Result<LayerState> {
        let width = self.width();
        if x.len() != width {
            return Err(Error::shape("cell input", width, x.len()));
        }
        if previous.width() != width {
            return Err(Error::shape("cell state", width, previous.width()));
        }

        let z = concat(&previous.output, x);
        let remember_gate = sigmoid(&self.remember_gate.affine(&z));
        let forget_gate = sigmoid(&self.forget_gate.affine(&z));
        let output_gate = sigmoid(&self.output_gate.affine(&z));
        let candidate_input = self.candidate_input.affine(&z).mapv(f32::tanh);

        let remember = &candidate_input * &remember_gate;
        let forget = &previous.cell * &forget_gate;
        let cell = &forget + &remember;
        let candidate_cell = cell.mapv(f32::tanh);
        let output = &candidate_cell * &output_gate;

        Ok(LayerState {
            output,
            cell,
            remember_gate,
            forget_gate,
            output_gate,
            candidate_input,
            remember,
            previous_cell: previous.cell.clone(),
            forget,
            candidate_cell,
        })
    }
}

/// `[a; b]` as a single vector.
pub fn concat(a: &Array1<f32>, b: &Array1<f32>) -> Array1<f32> {
    let mut z = Array1::zeros(a.len() + b.len());
    z.slice_mut(s![..a.len()]).assign(a);
    z.slice_mut(s![a.len()..]).assign(b);
    z
}

/// Element-wise sigmoid: 1 / (1 + exp(-x))
pub fn sigmoid(x: &Array1<f32>) -> Array1<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Xavier/Glorot normal initialisation for a `rows × cols` matrix.
pub fn xavier_normal<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Result<Array2<f32>> {
    let std = (2.0 / (rows + cols) as f32).sqrt();
    let normal = Normal::new(0.0, std).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    Ok(Array2::from_shape_fn((rows, cols), |_| normal.sample(rng)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn manual_sigmoid(v: f32) -> f32 {
        1.0 / (1.0 + (-v).exp())
    }

    #[test]
    fn test_sigmoid_bounds() {
        let x = Array1::from_vec(vec![-10.0, -1.0, 0.0, 1.0, 10.0]);
        let s = sigmoid(&x);
        for &v in s.iter() {
            assert!(v > 0.0 && v < 1.0, "sigmoid out of bounds: {}", v);
        }
        assert!((s[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_weights_step() {
        // All pre-activations are zero: gates = 0.5, candidate = 0.
        let layer = LayerWeights::zeros(3);
        let mut prev = LayerState::zeros(3);
        prev.cell = Array1::from_vec(vec![1.0, -2.0, 0.5]);
        let x = Array1::ones(3);
        let next = layer.step(&prev, &x).unwrap();

        for i in 0..3 {
            assert!((next.remember_gate[i] - 0.5).abs() < 1e-6);
            assert!(next.candidate_input[i].abs() < 1e-6);
            assert!((next.forget[i] - prev.cell[i] * 0.5).abs() < 1e-6);
            assert!((next.cell[i] - prev.cell[i] * 0.5).abs() < 1e-6);
            assert!((next.output[i] - (prev.cell[i] * 0.5).tanh() * 0.5).abs() < 1e-6);
        }
        assert_eq!(next.previous_cell, prev.cell);
    }

    #[test]
    fn test_step_matches_hand_computation() {
        // width 1: z = [o, x]
        let mut layer = LayerWeights::zeros(1);
        layer.remember_gate.weight = Array2::from_shape_vec((1, 2), vec![0.5, -0.25]).unwrap();
        layer.forget_gate.weight = Array2::from_shape_vec((1, 2), vec![0.1, 0.2]).unwrap();
        layer.forget_gate.bias[0] = 1.0;
        layer.output_gate.weight = Array2::from_shape_vec((1, 2), vec![-0.3, 0.7]).unwrap();
        layer.candidate_input.weight = Array2::from_shape_vec((1, 2), vec![0.9, 0.4]).unwrap();
        layer.candidate_input.bias[0] = -0.1;

        let mut prev = LayerState::zeros(1);
        prev.output[0] = 0.2;
        prev.cell[0] = -0.6;
        let x = Array1::from_vec(vec![1.5]);

        let (o, xv, c) = (0.2_f32, 1.5_f32, -0.6_f32);
        let r = manual_sigmoid(0.5 * o - 0.25 * xv);
        let f = manual_sigmoid(0.1 * o + 0.2 * xv + 1.0);
        let og = manual_sigmoid(-0.3 * o + 0.7 * xv);
        let g = (0.9 * o + 0.4 * xv - 0.1).tanh();
        let cell = c * f + g * r;
        let out = cell.tanh() * og;

        let next = layer.step(&prev, &x).unwrap();
        assert!((next.remember_gate[0] - r).abs() < 1e-6);
        assert!((next.forget_gate[0] - f).abs() < 1e-6);
        assert!((next.output_gate[0] - og).abs() < 1e-6);
        assert!((next.candidate_input[0] - g).abs() < 1e-6);
        assert!((next.remember[0] - g * r).abs() < 1e-6);
        assert!((next.forget[0] - c * f).abs() < 1e-6);
        assert!((next.cell[0] - cell).abs() < 1e-6);
        assert!((next.candidate_cell[0] - cell.tanh()).abs() < 1e-6);
        assert!((next.output[0] - out).abs() < 1e-6);
    }

    #[test]
    fn test_input_width_checked() {
        let layer = LayerWeights::zeros(4);
        let prev = LayerState::zeros(4);
        let err = layer.step(&prev, &Array1::zeros(3)).unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }

    #[test]
    fn test_forget_bias_init() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = LayerWeights::xavier(4, &mut rng).unwrap();
        assert!(layer.forget_gate.bias.iter().all(|&b| b == FORGET_BIAS_INIT));
        assert!(layer.remember_gate.bias.iter().all(|&b| b == 0.0));
        assert_eq!(layer.remember_gate.weight.dim(), (4, 8));
    }

    #[test]
    fn test_concat() {
        let z = concat(&Array1::from_vec(vec![1.0, 2.0]), &Array1::from_vec(vec![3.0]));
        assert_eq!(z.to_vec(), vec![1.0, 2.0, 3.0]);
    }
}
