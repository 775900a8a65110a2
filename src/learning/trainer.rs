//! Mini-batch SGD over length-sorted sequences.
//!
//! Each epoch:
//! 1. Draw a random batch offset in `[0, min(batch, n))`
//! 2. Walk the length-sorted corpus in batches starting at that offset
//!    (the leading `[0, offset)` slice forms its own batch)
//! 3. Per batch: per-sequence gradients in parallel, summed, clipped per
//!    tensor, one descent step
//! 4. Ask the stopping predicate whether the loss history is finished

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_CLIP_NORM, DEFAULT_LEARNING_RATE};
use crate::core::model::{LstmModel, LstmParams, Masks};
use crate::error::{Error, Result};

use super::backward::{sequence_gradients, sequence_loss, EncodedSequence};

/// Training hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingParameters {
    pub learning_rate: f32,

    /// Per-tensor gradient L2 clip.
    pub clip_norm: f32,

    /// Probability of dropping a unit; keep probability is `1 - dropout_rate`.
    pub dropout_rate: f32,

    pub batch_size: usize,

    /// Seeds batch offsets and dropout masks.
    pub seed: u64,

    /// Log the epoch loss every this many epochs (0 disables).
    pub log_every: usize,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            clip_norm: DEFAULT_CLIP_NORM,
            dropout_rate: 0.0,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: 0,
            log_every: 10,
        }
    }
}

impl TrainingParameters {
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_clip_norm(mut self, clip_norm: f32) -> Self {
        self.clip_norm = clip_norm;
        self
    }

    pub fn with_dropout_rate(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    pub fn keep_probability(&self) -> f32 {
        1.0 - self.dropout_rate
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::InvalidArgument(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if !(self.learning_rate > 0.0) || !(self.clip_norm > 0.0) {
            return Err(Error::InvalidArgument(
                "learning_rate and clip_norm must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Decides when training is done, given the epochs run so far and the loss
/// history.  Returns the reason for stopping.
pub trait StopCondition {
    fn finished(&mut self, epochs: usize, losses: &[f32]) -> Option<String>;
}

impl<F> StopCondition for F
where
    F: FnMut(usize, &[f32]) -> Option<String>,
{
    fn finished(&mut self, epochs: usize, losses: &[f32]) -> Option<String> {
        self(epochs, losses)
    }
}

/// Stop after a fixed number of epochs.
#[derive(Clone, Copy, Debug)]
pub struct EpochBudget(pub usize);

impl StopCondition for EpochBudget {
    fn finished(&mut self, epochs: usize, _losses: &[f32]) -> Option<String> {
        (epochs >= self.0).then(|| format!("epoch budget of {} reached", self.0))
    }
}

/// Stop when the best loss has not improved by `min_delta` for `patience`
/// epochs, or when `max_epochs` is reached.
#[derive(Clone, Copy, Debug)]
pub struct Plateau {
    pub patience: usize,
    pub min_delta: f32,
    pub max_epochs: usize,
}

impl StopCondition for Plateau {
    fn finished(&mut self, epochs: usize, losses: &[f32]) -> Option<String> {
        if epochs >= self.max_epochs {
            return Some(format!("epoch budget of {} reached", self.max_epochs));
        }
        if losses.len() <= self.patience {
            return None;
        }
        let split = losses.len() - self.patience;
        let best_before = losses[..split].iter().copied().fold(f32::INFINITY, f32::min);
        let best_recent = losses[split..].iter().copied().fold(f32::INFINITY, f32::min);
        (best_recent > best_before - self.min_delta)
            .then(|| format!("no improvement over {} epochs", self.patience))
    }
}

/// Outcome of a training run.
#[derive(Clone, Debug)]
pub struct TrainingReport {
    pub epochs: usize,
    /// Mean sequence loss per epoch.
    pub losses: Vec<f32>,
    pub reason: String,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

/// `[0, offset)` then `batch`-sized chunks from `offset`.
fn batch_ranges(n: usize, batch: usize, offset: usize) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    if offset > 0 {
        ranges.push(0..offset);
    }
    let mut start = offset;
    while start < n {
        let end = (start + batch).min(n);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Summed loss and gradients of one batch.
fn batch_gradients(
    model: &LstmModel,
    batch: &[&EncodedSequence],
    seeds: &[u64],
    keep: f32,
) -> Result<(f32, LstmParams)> {
    let layers = model.config.layers;
    let width = model.config.width;
    let weight = 1.0 / batch.len() as f32;

    batch
        .par_iter()
        .zip(seeds.par_iter())
        .map(|(sequence, &seed)| {
            let mut rng = StdRng::seed_from_u64(seed);
            let masks: Vec<Masks> = (0..sequence.len())
                .map(|_| Masks::sample(layers, width, keep, &mut rng))
                .collect();
            sequence_gradients(model, sequence, &masks, weight)
        })
        .try_reduce(
            || (0.0, model.params.zeros_like()),
            |(loss_a, mut grads_a), (loss_b, grads_b)| {
                grads_a.add_assign(&grads_b);
                Ok((loss_a + loss_b, grads_a))
            },
        )
}

fn params_finite(params: &LstmParams) -> bool {
    params.tensors().iter().all(|t| t.iter().all(|v| v.is_finite()))
}

/// Train `model` in place until `stop` is satisfied.
pub fn train(
    model: &mut LstmModel,
    sequences: &[EncodedSequence],
    params: &TrainingParameters,
    stop: &mut dyn StopCondition,
) -> Result<TrainingReport> {
    params.validate()?;
    if sequences.is_empty() {
        return Err(Error::InvalidArgument("training corpus is empty".into()));
    }
    for sequence in sequences {
        sequence.validate(model.config.task)?;
    }

    let mut sorted: Vec<&EncodedSequence> = sequences.iter().collect();
    sorted.sort_by_key(|s| s.len());
    let n = sorted.len();
    let keep = params.keep_probability();
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut losses = Vec::new();

    loop {
        let epoch = losses.len();
        let offset = rng.gen_range(0..params.batch_size.min(n));
        let mut total = 0.0;

        for range in batch_ranges(n, params.batch_size, offset) {
            let batch = &sorted[range];
            let seeds: Vec<u64> = batch.iter().map(|_| rng.gen()).collect();
            let (loss, mut grads) = batch_gradients(model, batch, &seeds, keep)?;
            grads.clip_by_norm(params.clip_norm);
            model.params.descend(&grads, params.learning_rate);
            total += loss;
        }

        let epoch_loss = total / n as f32;
        let healthy = params_finite(&model.params)
            && model
                .unroll(&sorted[0].symbols, None)?
                .last()
                .map_or(true, |t| t.state.is_healthy());
        if !epoch_loss.is_finite() || !healthy {
            return Err(Error::Diverged {
                epoch: epoch + 1,
                loss: epoch_loss,
            });
        }
        losses.push(epoch_loss);

        if params.log_every > 0 && epoch % params.log_every == 0 {
            tracing::debug!("epoch {}: loss {:.6}", epoch + 1, epoch_loss);
        }
        if let Some(reason) = stop.finished(epoch + 1, &losses) {
            tracing::debug!("training finished after {} epochs: {}", epoch + 1, reason);
            return Ok(TrainingReport {
                epochs: epoch + 1,
                losses,
                reason,
            });
        }
    }
}

/// Mean sequence loss without dropout.
pub fn evaluate_loss(model: &LstmModel, sequences: &[EncodedSequence]) -> Result<f32> {
    if sequences.is_empty() {
        return Err(Error::InvalidArgument("evaluation corpus is empty".into()));
    }
    let total = sequences
        .par_iter()
        .map(|s| sequence_loss(model, s))
        .try_reduce(|| 0.0, |a, b| Ok(a + b))?;
    Ok(total / sequences.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ModelConfig, Task};

    fn toy_model(task: Task) -> LstmModel {
        let config = ModelConfig {
            layers: 1,
            width: 8,
            embedding_width: 6,
            task,
        };
        LstmModel::new(config, 4, 4, 3).unwrap()
    }

    /// Symbol `i` is always followed by `(i + 1) % 4`.
    fn cyclic_corpus() -> Vec<EncodedSequence> {
        (0..8)
            .map(|start| {
                let symbols: Vec<usize> = (0..3 + start % 3).map(|k| (start + k) % 4).collect();
                let targets = symbols.iter().map(|s| (s + 1) % 4).collect();
                EncodedSequence { symbols, targets }
            })
            .collect()
    }

    #[test]
    fn test_batch_ranges() {
        assert_eq!(batch_ranges(7, 3, 2), vec![0..2, 2..5, 5..7]);
        assert_eq!(batch_ranges(4, 2, 0), vec![0..2, 2..4]);
        assert_eq!(batch_ranges(1, 5, 0), vec![0..1]);
    }

    #[test]
    fn test_loss_decreases() {
        let mut model = toy_model(Task::LanguageModel);
        let corpus = cyclic_corpus();
        let before = evaluate_loss(&model, &corpus).unwrap();
        let params = TrainingParameters::default().with_batch_size(2).with_seed(9);
        let report = train(&mut model, &corpus, &params, &mut EpochBudget(100)).unwrap();
        let after = evaluate_loss(&model, &corpus).unwrap();

        assert_eq!(report.epochs, 100);
        assert_eq!(report.losses.len(), 100);
        assert!(after < before * 0.5, "loss {} -> {}", before, after);
    }

    #[test]
    fn test_training_is_reproducible() {
        let corpus = cyclic_corpus();
        let params = TrainingParameters::default()
            .with_dropout_rate(0.2)
            .with_batch_size(2)
            .with_seed(4);
        let mut a = toy_model(Task::LanguageModel);
        let mut b = toy_model(Task::LanguageModel);
        train(&mut a, &corpus, &params, &mut EpochBudget(3)).unwrap();
        train(&mut b, &corpus, &params, &mut EpochBudget(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_classification_trains() {
        let mut model = toy_model(Task::Classification);
        // Label is the last symbol.
        let corpus: Vec<EncodedSequence> = (0..6)
            .map(|i| EncodedSequence {
                symbols: vec![(i + 1) % 4, i % 4],
                targets: vec![i % 4],
            })
            .collect();
        let before = evaluate_loss(&model, &corpus).unwrap();
        let params = TrainingParameters::default().with_learning_rate(0.5).with_batch_size(2);
        train(&mut model, &corpus, &params, &mut EpochBudget(30)).unwrap();
        assert!(evaluate_loss(&model, &corpus).unwrap() < before);
    }

    #[test]
    fn test_closure_stop_condition() {
        let mut model = toy_model(Task::LanguageModel);
        let corpus = cyclic_corpus();
        let mut seen = Vec::new();
        let mut stop = |epochs: usize, losses: &[f32]| {
            seen.push(losses.len());
            (epochs == 2).then(|| "two".to_string())
        };
        let report = train(&mut model, &corpus, &TrainingParameters::default(), &mut stop).unwrap();
        assert_eq!(report.reason, "two");
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_plateau() {
        let mut plateau = Plateau {
            patience: 2,
            min_delta: 0.01,
            max_epochs: 100,
        };
        assert!(plateau.finished(3, &[3.0, 2.0, 1.0]).is_none());
        assert!(plateau.finished(4, &[3.0, 2.0, 1.0, 0.5]).is_none());
        assert!(plateau.finished(5, &[3.0, 2.0, 1.0, 1.0, 1.0]).is_some());
        assert!(plateau.finished(100, &[3.0]).is_some());
    }

    #[test]
    fn test_invalid_parameters() {
        let mut model = toy_model(Task::LanguageModel);
        let corpus = cyclic_corpus();
        let bad = TrainingParameters::default().with_batch_size(0);
        assert!(train(&mut model, &corpus, &bad, &mut EpochBudget(1)).is_err());
        let bad = TrainingParameters::default().with_dropout_rate(1.0);
        assert!(train(&mut model, &corpus, &bad, &mut EpochBudget(1)).is_err());
        assert!(train(&mut model, &[], &TrainingParameters::default(), &mut EpochBudget(1)).is_err());
    }

    #[test]
    fn test_divergence_detected() {
        let mut model = toy_model(Task::LanguageModel);
        model.params.softmax_bias[0] = f32::NAN;
        let err = train(
            &mut model,
            &cyclic_corpus(),
            &TrainingParameters::default(),
            &mut EpochBudget(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Diverged { epoch: 1, .. }));
    }
}
