//! Backpropagation through time for one sequence.
//!
//! The forward pass is the same unrolled evaluation used for inference, with
//! the dropout masks supplied by the caller so the backward pass can replay
//! them.  Loss per sequence:
//!
//! - language model: mean cross-entropy over the sequence's true length
//! - classification: cross-entropy of the last timestep against the label

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, Axis};

use crate::core::cell::concat;
use crate::core::model::{cross_entropy, softmax, LstmModel, LstmParams, Masks, StepTrace, Task};
use crate::error::{Error, Result};

/// A sequence already mapped to label indices.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedSequence {
    pub symbols: Vec<usize>,
    pub targets: Vec<usize>,
}

impl EncodedSequence {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Precondition check for `task`.
    pub fn validate(&self, task: Task) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(Error::shape("sequence length", "> 0", 0));
        }
        let expected = match task {
            Task::LanguageModel => self.symbols.len(),
            Task::Classification => 1,
        };
        if self.targets.len() != expected {
            return Err(Error::shape("sequence targets", expected, self.targets.len()));
        }
        Ok(())
    }

    /// `(timestep, target, loss weight)` for every scored position.
    fn scored(&self, task: Task) -> Vec<(usize, usize, f32)> {
        match task {
            Task::LanguageModel => {
                let w = 1.0 / self.symbols.len() as f32;
                self.targets.iter().enumerate().map(|(t, &y)| (t, y, w)).collect()
            }
            Task::Classification => vec![(self.symbols.len() - 1, self.targets[0], 1.0)],
        }
    }
}

fn check_targets(model: &LstmModel, sequence: &EncodedSequence) -> Result<()> {
    let outputs = model.output_size();
    if let Some(&bad) = sequence.targets.iter().find(|&&y| y >= outputs) {
        return Err(Error::shape("target index", format!("< {}", outputs), bad));
    }
    Ok(())
}

fn loss_of(traces: &[StepTrace], sequence: &EncodedSequence, task: Task) -> f32 {
    sequence
        .scored(task)
        .into_iter()
        .map(|(t, y, w)| w * cross_entropy(&traces[t].logits, y))
        .sum()
}

/// Loss of one sequence without dropout.
pub fn sequence_loss(model: &LstmModel, sequence: &EncodedSequence) -> Result<f32> {
    sequence.validate(model.config.task)?;
    check_targets(model, sequence)?;
    let traces = model.unroll(&sequence.symbols, None)?;
    Ok(loss_of(&traces, sequence, model.config.task))
}

/// `target += a ⊗ b`
fn add_outer(target: &mut Array2<f32>, a: &Array1<f32>, b: &Array1<f32>) {
    let col = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    general_mat_mul(1.0, &col, &row, 1.0, target);
}

/// Loss and parameter gradients for one sequence.
///
/// Gradients are multiplied by `weight` (the caller passes `1 / batch`), the
/// returned loss is not.
pub fn sequence_gradients(
    model: &LstmModel,
    sequence: &EncodedSequence,
    masks: &[Masks],
    weight: f32,
) -> Result<(f32, LstmParams)> {
    let task = model.config.task;
    sequence.validate(task)?;
    check_targets(model, sequence)?;

    let params = &model.params;
    let width = model.config.width;
    let layers = model.config.layers;
    let steps = sequence.len();

    let traces = model.unroll_masked(&sequence.symbols, None, masks)?;
    let loss = loss_of(&traces, sequence, task);
    let mut grads = params.zeros_like();

    // Output projection.
    let mut d_top: Vec<Option<Array1<f32>>> = vec![None; steps];
    for (t, y, w) in sequence.scored(task) {
        let trace = &traces[t];
        let mut d_logits = softmax(&trace.logits);
        d_logits[y] -= 1.0;
        d_logits *= w * weight;

        add_outer(&mut grads.softmax_weight, &d_logits, &trace.top);
        grads.softmax_bias += &d_logits;

        let mut d = params.softmax_weight.t().dot(&d_logits);
        if let Some(m) = &masks[t].output {
            d *= m;
        }
        d_top[t] = Some(d);
    }

    // Through time, top layer first.
    let zero = model.zero_state();
    let mut dh_next = vec![Array1::<f32>::zeros(width); layers];
    let mut dc_next = vec![Array1::<f32>::zeros(width); layers];

    for t in (0..steps).rev() {
        let trace = &traces[t];
        let previous = if t == 0 { &zero } else { &traces[t - 1].state };
        let mut dh_above = d_top[t].take().unwrap_or_else(|| Array1::zeros(width));

        for l in (0..layers).rev() {
            let st = &trace.state.layers[l];
            let dh = &dh_above + &dh_next[l];

            let dc = &dc_next[l]
                + &(&dh * &st.output_gate * &st.candidate_cell.mapv(|v| 1.0 - v * v));
            let d_output_gate =
                &dh * &st.candidate_cell * &st.output_gate.mapv(|v| v * (1.0 - v));
            let d_candidate =
                &dc * &st.remember_gate * &st.candidate_input.mapv(|v| 1.0 - v * v);
            let d_remember_gate =
                &dc * &st.candidate_input * &st.remember_gate.mapv(|v| v * (1.0 - v));
            let d_forget_gate =
                &dc * &st.previous_cell * &st.forget_gate.mapv(|v| v * (1.0 - v));
            dc_next[l] = &dc * &st.forget_gate;

            let z = concat(&previous.layers[l].output, &trace.inputs[l]);
            let mut dz = Array1::<f32>::zeros(2 * width);
            // Same order as LayerWeights::gates().
            let pre = [d_remember_gate, d_forget_gate, d_output_gate, d_candidate];
            let gates = params.layers[l].gates();
            let grad_gates = grads.layers[l].gates_mut();
            for ((gate, grad), d) in gates.into_iter().zip(grad_gates).zip(pre.iter()) {
                add_outer(&mut grad.weight, d, &z);
                grad.bias += d;
                dz += &gate.weight.t().dot(d);
            }

            dh_next[l] = dz.slice(s![..width]).to_owned();
            let mut dx = dz.slice(s![width..]).to_owned();
            if let Some(m) = masks[t].inputs.get(l).and_then(Option::as_ref) {
                dx *= m;
            }

            if l > 0 {
                dh_above = dx;
            } else {
                let d_embedded = match (&params.projection, grads.projection.as_mut()) {
                    (Some(p), Some(gp)) => {
                        add_outer(gp, &dx, &trace.embedded);
                        p.t().dot(&dx)
                    }
                    _ => dx,
                };
                let mut row = grads.embedding.row_mut(trace.symbol);
                row += &d_embedded;
                dh_above = Array1::zeros(width);
            }
        }
    }

    Ok((loss, grads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(task: Task, embedding_width: usize) -> LstmModel {
        let config = ModelConfig {
            layers: 2,
            width: 3,
            embedding_width,
            task,
        };
        LstmModel::new(config, 5, 4, 21).unwrap()
    }

    fn loss_with(model: &LstmModel, seq: &EncodedSequence, masks: &[Masks]) -> f32 {
        let traces = model.unroll_masked(&seq.symbols, None, masks).unwrap();
        loss_of(&traces, seq, model.config.task)
    }

    /// Compare analytic gradients with central differences on a sample of
    /// entries from every tensor.
    fn gradient_check(model: &LstmModel, seq: &EncodedSequence, masks: &[Masks]) {
        let (_, grads) = sequence_gradients(model, seq, masks, 1.0).unwrap();
        let eps = 5e-3_f32;
        let grad_tensors: Vec<Vec<f32>> =
            grads.tensors().iter().map(|t| t.iter().copied().collect()).collect();

        for (i, analytic) in grad_tensors.iter().enumerate() {
            let n = analytic.len();
            for &j in &[0, n / 2, n - 1] {
                let mut plus = model.clone();
                *plus.params.tensors_mut()[i].iter_mut().nth(j).unwrap() += eps;
                let mut minus = model.clone();
                *minus.params.tensors_mut()[i].iter_mut().nth(j).unwrap() -= eps;
                let numeric =
                    (loss_with(&plus, seq, masks) - loss_with(&minus, seq, masks)) / (2.0 * eps);
                let tol = 5e-3 + 5e-2 * numeric.abs();
                assert!(
                    (numeric - analytic[j]).abs() < tol,
                    "tensor {} entry {}: numeric {} vs analytic {}",
                    i,
                    j,
                    numeric,
                    analytic[j]
                );
            }
        }
    }

    #[test]
    fn test_gradients_language_model() {
        let m = model(Task::LanguageModel, 2);
        let seq = EncodedSequence {
            symbols: vec![1, 3, 2, 4],
            targets: vec![3, 2, 0, 1],
        };
        gradient_check(&m, &seq, &vec![Masks::none(2); 4]);
    }

    #[test]
    fn test_gradients_with_dropout_masks() {
        let m = model(Task::LanguageModel, 3);
        let seq = EncodedSequence {
            symbols: vec![2, 1, 1],
            targets: vec![1, 1, 3],
        };
        let mut rng = StdRng::seed_from_u64(5);
        let masks: Vec<Masks> = (0..3).map(|_| Masks::sample(2, 3, 0.7, &mut rng)).collect();
        gradient_check(&m, &seq, &masks);
    }

    #[test]
    fn test_gradients_classification() {
        let m = model(Task::Classification, 2);
        let seq = EncodedSequence {
            symbols: vec![4, 0, 2],
            targets: vec![2],
        };
        gradient_check(&m, &seq, &vec![Masks::none(2); 3]);
    }

    #[test]
    fn test_unused_embedding_rows_have_zero_gradient() {
        let m = model(Task::LanguageModel, 3);
        let seq = EncodedSequence {
            symbols: vec![1, 1],
            targets: vec![2, 3],
        };
        let (_, grads) = sequence_gradients(&m, &seq, &vec![Masks::none(2); 2], 1.0).unwrap();
        assert!(grads.embedding.row(4).iter().all(|&v| v == 0.0));
        assert!(grads.embedding.row(1).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_loss_matches_forward() {
        let m = model(Task::LanguageModel, 2);
        let seq = EncodedSequence {
            symbols: vec![1, 2],
            targets: vec![2, 3],
        };
        let (loss, _) = sequence_gradients(&m, &seq, &vec![Masks::none(2); 2], 0.5).unwrap();
        assert!((loss - sequence_loss(&m, &seq).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_validation() {
        let m = model(Task::LanguageModel, 2);
        let mismatched = EncodedSequence {
            symbols: vec![1, 2],
            targets: vec![2],
        };
        assert!(matches!(sequence_loss(&m, &mismatched), Err(Error::Shape { .. })));
        let out_of_range = EncodedSequence {
            symbols: vec![1],
            targets: vec![9],
        };
        assert!(matches!(sequence_loss(&m, &out_of_range), Err(Error::Shape { .. })));
        let empty = EncodedSequence {
            symbols: vec![],
            targets: vec![],
        };
        assert!(empty.validate(Task::Classification).is_err());
    }
}
