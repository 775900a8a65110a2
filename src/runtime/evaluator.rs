//! Graph evaluators.
//!
//! [`GraphEvaluator`] is the read-only query surface that sessions and the
//! elicitation pipeline consume.  [`LstmEvaluator`] is the concrete model:
//! it also trains, tests, and saves/loads itself through the checkpoint
//! registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array1, ArrayD};
use rand::Rng;

use crate::checkpoint::registry::ensure_model_dir;
use crate::checkpoint::{Checkpoints, ParameterArtifact};
use crate::config::RANDOM_NAME_LEN;
use crate::core::corpus::LabeledSequence;
use crate::core::instruments::{InstrumentSet, InstrumentValues};
use crate::core::labels::Labels;
use crate::core::model::{softmax, LstmModel, Masks, ModelConfig, ParameterName, Task};
use crate::core::state::RecurrentState;
use crate::error::{Error, Result};
use crate::learning::backward::EncodedSequence;
use crate::learning::trainer::{self, StopCondition, TrainingParameters, TrainingReport};

use super::session::random_name;

/// Output distribution for one step.
#[derive(Clone, Debug)]
pub struct Prediction {
    /// Most probable output label.
    pub label: String,
    pub probability: f32,
    /// Probability of every output label, by label index.
    pub distribution: Array1<f32>,
    labels: Arc<Labels>,
}

impl Prediction {
    fn new(distribution: Array1<f32>, labels: Arc<Labels>) -> Self {
        let (best, probability) = distribution
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
        let label = labels.decode(best).unwrap_or_default().to_string();
        Self {
            label,
            probability,
            distribution,
            labels,
        }
    }

    /// Probability assigned to `label`; `None` if it is not an output label.
    pub fn probability_of(&self, label: &str) -> Option<f32> {
        let index = self.labels.encode(label, false).ok()?;
        self.distribution.get(index).copied()
    }
}

/// Result of evaluating one symbol.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub prediction: Prediction,
    pub state: RecurrentState,
    pub instruments: InstrumentValues,
}

/// Read-only query interface over a trained graph.
pub trait GraphEvaluator: Send + Sync {
    fn config(&self) -> &ModelConfig;

    fn layers(&self) -> usize {
        self.config().layers
    }

    fn width(&self) -> usize {
        self.config().width
    }

    fn embedding_width(&self) -> usize {
        self.config().embedding_width
    }

    /// State used when a session has not stepped yet.
    fn zero_state(&self) -> RecurrentState {
        RecurrentState::zeros(self.layers(), self.width())
    }

    /// Feed one symbol at `prior` (zero state when `None`).
    fn evaluate(
        &self,
        symbol: &str,
        handle_unknown: bool,
        prior: Option<&RecurrentState>,
        instruments: &InstrumentSet,
    ) -> Result<Evaluation>;

    /// Read a learned tensor by name, optionally indexed by layer.
    fn probe(&self, name: &str, layer: Option<usize>) -> Result<ArrayD<f32>>;
}

/// Held-out evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestReport {
    pub loss: f32,
    pub perplexity: f32,
}

/// A multi-layer LSTM with its vocabularies.
#[derive(Clone, Debug)]
pub struct LstmEvaluator {
    model: LstmModel,
    word_labels: Labels,
    output_labels: Arc<Labels>,
}

impl LstmEvaluator {
    /// Fresh, untrained evaluator.
    pub fn new(
        config: ModelConfig,
        word_labels: Labels,
        output_labels: Labels,
        seed: u64,
    ) -> Result<Self> {
        let model = LstmModel::new(config, word_labels.len(), output_labels.len(), seed)?;
        Ok(Self {
            model,
            word_labels,
            output_labels: Arc::new(output_labels),
        })
    }

    pub fn from_artifact(artifact: ParameterArtifact) -> Result<Self> {
        let ParameterArtifact {
            model,
            word_labels,
            output_labels,
        } = artifact;
        if model.vocab_size() != word_labels.len() {
            return Err(Error::shape("artifact vocabulary", model.vocab_size(), word_labels.len()));
        }
        if model.output_size() != output_labels.len() {
            return Err(Error::shape("artifact outputs", model.output_size(), output_labels.len()));
        }
        Ok(Self {
            model,
            word_labels,
            output_labels: Arc::new(output_labels),
        })
    }

    pub fn to_artifact(&self) -> ParameterArtifact {
        ParameterArtifact {
            model: self.model.clone(),
            word_labels: self.word_labels.clone(),
            output_labels: (*self.output_labels).clone(),
        }
    }

    pub fn task(&self) -> Task {
        self.model.config.task
    }

    pub fn model(&self) -> &LstmModel {
        &self.model
    }

    pub fn word_labels(&self) -> &Labels {
        &self.word_labels
    }

    pub fn output_labels(&self) -> &Labels {
        &self.output_labels
    }

    /// Map a labelled sequence to indices.  Unknown targets are an error;
    /// unknown inputs follow `handle_unknown`.
    pub fn encode(&self, sequence: &LabeledSequence, handle_unknown: bool) -> Result<EncodedSequence> {
        let symbols = sequence
            .inputs
            .iter()
            .map(|s| self.word_labels.encode(s, handle_unknown))
            .collect::<Result<Vec<_>>>()?;
        let targets = sequence
            .targets
            .iter()
            .map(|s| self.output_labels.encode(s, false))
            .collect::<Result<Vec<_>>>()?;
        let encoded = EncodedSequence { symbols, targets };
        encoded.validate(self.model.config.task)?;
        Ok(encoded)
    }

    fn encode_all(&self, corpus: &[LabeledSequence], handle_unknown: bool) -> Result<Vec<EncodedSequence>> {
        corpus.iter().map(|s| self.encode(s, handle_unknown)).collect()
    }

    /// Train until `stop` is satisfied.
    pub fn train(
        &mut self,
        corpus: &[LabeledSequence],
        params: &TrainingParameters,
        stop: &mut dyn StopCondition,
    ) -> Result<TrainingReport> {
        let encoded = self.encode_all(corpus, false)?;
        tracing::debug!(
            "training on {} sequences ({} parameters)",
            encoded.len(),
            self.model.params.param_count()
        );
        trainer::train(&mut self.model, &encoded, params, stop)
    }

    /// Mean loss and perplexity over a held-out corpus, no dropout.
    pub fn test(&self, corpus: &[LabeledSequence], handle_unknown: bool) -> Result<TestReport> {
        let encoded = self.encode_all(corpus, handle_unknown)?;
        let loss = trainer::evaluate_loss(&self.model, &encoded)?;
        Ok(TestReport {
            loss,
            perplexity: loss.exp(),
        })
    }

    /// Raw embedding row of `symbol`.
    pub fn embed(&self, symbol: &str, handle_unknown: bool) -> Result<Array1<f32>> {
        self.model.embed(self.word_labels.encode(symbol, handle_unknown)?)
    }

    /// Save the parameters under `version` and return the artifact path.
    pub fn save(&self, model_dir: impl AsRef<Path>, version: &str, set_latest: bool) -> Result<PathBuf> {
        let model_dir = model_dir.as_ref();
        ensure_model_dir(model_dir)?;
        let checkpoints = Checkpoints::load_or_new(model_dir)?;
        let path = checkpoints.next_model_path();
        self.to_artifact().write(&path)?;
        checkpoints.update_next(version, set_latest).save()?;
        tracing::debug!("saved version {} to {}", version, path.display());
        Ok(path)
    }

    /// Load `version`, or the latest version when `None`.
    pub fn load(model_dir: impl AsRef<Path>, version: Option<&str>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let checkpoints = Checkpoints::load(model_dir)?.ok_or_else(|| {
            Error::NotFound(format!("no checkpoint registry in {}", model_dir.display()))
        })?;
        let path = checkpoints.model_path(version)?;
        tracing::debug!("restoring {}", path.display());
        Self::from_artifact(ParameterArtifact::read(&path)?)
    }

    /// Alias `version` under `<version>-<random suffix>` and return the new
    /// version.
    pub fn copy<R: Rng>(
        model_dir: impl AsRef<Path>,
        version: &str,
        set_latest: bool,
        rng: &mut R,
    ) -> Result<String> {
        let model_dir = model_dir.as_ref();
        let checkpoints = Checkpoints::load(model_dir)?.ok_or_else(|| {
            Error::NotFound(format!("no checkpoint registry in {}", model_dir.display()))
        })?;
        let target = format!("{}-{}", version, random_name(rng, RANDOM_NAME_LEN));
        checkpoints.copy(version, &target, set_latest)?.save()?;
        Ok(target)
    }
}

impl GraphEvaluator for LstmEvaluator {
    fn config(&self) -> &ModelConfig {
        &self.model.config
    }

    fn evaluate(
        &self,
        symbol: &str,
        handle_unknown: bool,
        prior: Option<&RecurrentState>,
        instruments: &InstrumentSet,
    ) -> Result<Evaluation> {
        let id = self.word_labels.encode(symbol, handle_unknown)?;
        let zero;
        let prior = match prior {
            Some(state) => state,
            None => {
                zero = self.zero_state();
                &zero
            }
        };
        let trace = self.model.step(id, prior, &Masks::none(self.layers()))?;
        let values = InstrumentValues::capture(instruments, &trace);
        let prediction = Prediction::new(softmax(&trace.logits), Arc::clone(&self.output_labels));
        Ok(Evaluation {
            prediction,
            state: trace.state,
            instruments: values,
        })
    }

    fn probe(&self, name: &str, layer: Option<usize>) -> Result<ArrayD<f32>> {
        self.model.probe(ParameterName::parse(name)?, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instruments::Instrument;
    use crate::core::state::Part;
    use crate::learning::trainer::EpochBudget;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;
    use tempfile::tempdir;

    fn tagging_corpus() -> Vec<LabeledSequence> {
        vec![
            LabeledSequence::new(["the", "cat", "sat"], ["DET", "NOUN", "VERB"]),
            LabeledSequence::new(["a", "dog", "ran"], ["DET", "NOUN", "VERB"]),
            LabeledSequence::new(["the", "dog", "sat"], ["DET", "NOUN", "VERB"]),
        ]
    }

    fn evaluator() -> LstmEvaluator {
        let corpus = tagging_corpus();
        let (words, tags) = crate::core::corpus::vocabularies(&corpus);
        let config = ModelConfig {
            layers: 2,
            width: 4,
            embedding_width: 3,
            task: Task::LanguageModel,
        };
        LstmEvaluator::new(config, words, tags, 17).unwrap()
    }

    #[test]
    fn test_evaluate_fresh_state() {
        let ev = evaluator();
        let set = InstrumentSet::of([Instrument::Part(Part::Cell)]);
        let out = ev.evaluate("cat", false, None, &set).unwrap();
        assert_eq!(out.state.steps, 1);
        assert!((out.prediction.distribution.sum() - 1.0).abs() < 1e-5);
        let p = out.prediction.probability_of(&out.prediction.label).unwrap();
        assert_eq!(p, out.prediction.probability);
        assert!(out.prediction.probability_of("ADJ").is_none());
        assert_eq!(out.prediction.distribution.len(), 3);
        assert!(["DET", "NOUN", "VERB"].contains(&out.prediction.label.as_str()));
        assert_eq!(out.instruments.layers(Instrument::Part(Part::Cell)).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_symbols() {
        let ev = evaluator();
        let set = InstrumentSet::empty();
        assert!(matches!(
            ev.evaluate("zebra", false, None, &set),
            Err(Error::UnknownSymbol(_))
        ));
        let unk = ev.evaluate("zebra", true, None, &set).unwrap();
        let explicit = ev.evaluate(crate::config::UNKNOWN_TOKEN, false, None, &set).unwrap();
        assert_eq!(unk.state, explicit.state);
    }

    #[test]
    fn test_probe_by_name() {
        let ev = evaluator();
        assert_eq!(ev.probe("embedding", None).unwrap().shape(), &[7, 3]);
        assert_eq!(ev.probe("forget_gate.weight", Some(1)).unwrap().shape(), &[4, 8]);
        assert!(matches!(ev.probe("hidden", None), Err(Error::UnknownParameter(_))));
        assert_eq!(ev.embed("cat", false).unwrap().len(), 3);
    }

    #[test]
    fn test_train_and_test() {
        let mut ev = evaluator();
        let corpus = tagging_corpus();
        let before = ev.test(&corpus, false).unwrap();
        let params = TrainingParameters::default().with_learning_rate(0.5).with_batch_size(2);
        let report = ev.train(&corpus, &params, &mut EpochBudget(30)).unwrap();
        let after = ev.test(&corpus, false).unwrap();
        assert_eq!(report.epochs, 30);
        assert!(after.loss < before.loss);
        assert!((after.perplexity - after.loss.exp()).abs() < 1e-4);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let ev = evaluator();
        let path = ev.save(dir.path(), "1", false).unwrap();
        assert_eq!(path, dir.path().join("basename-0"));

        let loaded = LstmEvaluator::load(dir.path(), None).unwrap();
        assert_eq!(loaded.model(), ev.model());
        let set = InstrumentSet::empty();
        let a = ev.evaluate("dog", false, None, &set).unwrap();
        let b = loaded.evaluate("dog", false, None, &set).unwrap();
        assert_eq!(a.prediction.distribution, b.prediction.distribution);

        assert!(matches!(
            LstmEvaluator::load(dir.path(), Some("2")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_load_without_registry() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            LstmEvaluator::load(dir.path(), None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_save_into_file_fails_before_writing() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("model");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            evaluator().save(&file, "1", true),
            Err(Error::DirectoryIsFile(_))
        ));
        assert_eq!(fs::read(&file).unwrap(), b"x");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_with_suffix() {
        let dir = tempdir().unwrap();
        evaluator().save(dir.path(), "base", true).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let copied = LstmEvaluator::copy(dir.path(), "base", false, &mut rng).unwrap();

        let suffix = copied.strip_prefix("base-").unwrap();
        assert_eq!(suffix.len(), RANDOM_NAME_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));

        let cp = Checkpoints::load(dir.path()).unwrap().unwrap();
        assert_eq!(cp.model_path(Some(&copied)).unwrap(), cp.model_path(Some("base")).unwrap());
        assert_eq!(cp.latest(), Some("vbase"));
        assert!(LstmEvaluator::copy(dir.path(), "nope", false, &mut rng).is_err());
    }

    #[test]
    fn test_second_save_allocates_new_step() {
        let dir = tempdir().unwrap();
        let ev = evaluator();
        ev.save(dir.path(), "1", false).unwrap();
        let second = ev.save(dir.path(), "2", false).unwrap();
        assert_eq!(second, dir.path().join("basename-1"));
        let cp = Checkpoints::load(dir.path()).unwrap().unwrap();
        assert_eq!(cp.latest(), Some("v1"));
    }
}
