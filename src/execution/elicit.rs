//! Elicitation: run a sampled corpus through stepwise sessions and fan every
//! instrument value out to its key's stream.
//!
//! Per pass (train or test):
//! 1. Open one sink per key and start one named consumer thread per sink,
//!    each draining its own unbounded FIFO queue
//! 2. Sample sequences by independent Bernoulli trials at the pass's rate
//! 3. Step a fresh session through each sampled sequence, enqueueing one
//!    record per key per timestep
//! 4. Enqueue `End` on every queue, then join every consumer
//!
//! A consumer that fails stops draining its queue; the producer keeps
//! feeding the others and the failure is reported after the join.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DEFAULT_SAMPLE_RATE;
use crate::core::corpus::LabeledSequence;
use crate::core::instruments::InstrumentSet;
use crate::core::model::Task;
use crate::error::{ConsumerFailure, Error, Result};
use crate::runtime::evaluator::GraphEvaluator;
use crate::runtime::session::StepwiseSession;

use super::keys::{InstrumentKey, Split};
use super::sink::{ActivationRecord, ActivationSink, SinkFactory, SinkMessage};

/// Which target labels annotate a timestep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationPolicy {
    /// Target `i` annotates timestep `i`.
    PerTimestep,
    /// The sequence's single label annotates every timestep.
    WholeSequence,
}

impl AnnotationPolicy {
    /// Language models carry a target per timestep; classifiers carry one
    /// label per sequence.
    pub fn for_task(task: Task) -> Self {
        match task {
            Task::LanguageModel => AnnotationPolicy::PerTimestep,
            Task::Classification => AnnotationPolicy::WholeSequence,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ElicitConfig {
    pub sample_rate_train: f64,
    pub sample_rate_test: f64,
    pub seed: u64,
    /// `None` follows the evaluator's task.
    pub policy: Option<AnnotationPolicy>,
    /// Map out-of-vocabulary inputs to the unknown token instead of failing.
    pub handle_unknown: bool,
}

impl Default for ElicitConfig {
    fn default() -> Self {
        Self {
            sample_rate_train: DEFAULT_SAMPLE_RATE,
            sample_rate_test: DEFAULT_SAMPLE_RATE,
            seed: 0,
            policy: None,
            handle_unknown: true,
        }
    }
}

impl ElicitConfig {
    pub fn rate(&self, split: Split) -> f64 {
        match split {
            Split::Train => self.sample_rate_train,
            Split::Test => self.sample_rate_test,
        }
    }

    /// Independent sampling stream per split.
    fn split_seed(&self, split: Split) -> u64 {
        match split {
            Split::Train => self.seed,
            Split::Test => self.seed ^ 0x9e37_79b9_7f4a_7c15,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for split in [Split::Train, Split::Test] {
            let rate = self.rate(split);
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::InvalidArgument(format!(
                    "{} sample rate must be in [0, 1], got {}",
                    split, rate
                )));
            }
        }
        Ok(())
    }
}

/// Sampling counts of one pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassSummary {
    pub split: Split,
    /// Sequences in the corpus.
    pub total: usize,
    /// Sequences selected by sampling.
    pub sampled: usize,
    /// Timesteps emitted, i.e. records per key.
    pub instances: usize,
}

impl PassSummary {
    fn log(&self, rate: f64) {
        let title = match self.split {
            Split::Train => "Train",
            Split::Test => "Test",
        };
        tracing::info!(
            "{} {}: {} sentences sampled down to {}, eliciting {} hidden states (per part-layer)",
            title,
            rate,
            self.total,
            self.sampled,
            self.instances
        );
    }
}

/// A completed pass.
#[derive(Clone, Debug)]
pub struct PassReport {
    pub summary: PassSummary,
    /// Records written per encoded key.
    pub records: BTreeMap<String, u64>,
}

/// Running consumers of one pass.
pub struct PassHandle {
    split: Split,
    /// Queue per key, parallel to the pipeline's key list; `None` once the
    /// consumer is gone.
    queues: Vec<(InstrumentKey, Option<Sender<SinkMessage>>)>,
    consumers: Vec<(InstrumentKey, JoinHandle<Result<u64>>)>,
    failures: Vec<ConsumerFailure>,
}

impl PassHandle {
    /// Open every sink and start its consumer.  A key whose sink cannot be
    /// opened is recorded as failed; the others still run.
    pub fn start(split: Split, keys: &[InstrumentKey], factory: &dyn SinkFactory) -> Self {
        let mut handle = PassHandle {
            split,
            queues: Vec::with_capacity(keys.len()),
            consumers: Vec::with_capacity(keys.len()),
            failures: Vec::new(),
        };
        for key in keys {
            let started = factory
                .open(split, key)
                .and_then(|sink| spawn_consumer(split, *key, sink));
            match started {
                Ok((sender, consumer)) => {
                    handle.queues.push((*key, Some(sender)));
                    handle.consumers.push((*key, consumer));
                }
                Err(e) => {
                    handle.fail(key, e.to_string());
                    handle.queues.push((*key, None));
                }
            }
        }
        handle
    }

    fn fail(&mut self, key: &InstrumentKey, message: String) {
        self.failures.push(ConsumerFailure {
            key: format!("{}/{}", self.split, key.encode()),
            message,
        });
    }

    /// Enqueue on key `index`.  A closed queue means its consumer already
    /// failed; the message is dropped and the failure surfaces at join.
    fn send(&mut self, index: usize, message: SinkMessage) {
        let (key, slot) = &mut self.queues[index];
        if let Some(sender) = slot {
            if sender.send(message).is_err() {
                tracing::warn!("{} consumer for {} stopped early", self.split, key);
                *slot = None;
            }
        }
    }

    /// Send `End` everywhere and wait for every consumer.
    pub fn finish(mut self) -> std::result::Result<BTreeMap<String, u64>, Vec<ConsumerFailure>> {
        for index in 0..self.queues.len() {
            self.send(index, SinkMessage::End);
        }
        self.join()
    }

    /// Close every queue without `End` and wait; unfinished streams stay
    /// unfinalised.
    pub fn abort(self) {
        if let Err(failures) = self.join() {
            tracing::debug!("{} consumers closed without end-of-stream", failures.len());
        }
    }

    fn join(mut self) -> std::result::Result<BTreeMap<String, u64>, Vec<ConsumerFailure>> {
        self.queues.clear();
        let mut records = BTreeMap::new();
        for (key, consumer) in std::mem::take(&mut self.consumers) {
            match consumer.join() {
                Ok(Ok(count)) => {
                    records.insert(key.encode(), count);
                }
                Ok(Err(e)) => self.fail(&key, e.to_string()),
                Err(_) => self.fail(&key, "consumer panicked".into()),
            }
        }
        if self.failures.is_empty() {
            Ok(records)
        } else {
            Err(self.failures)
        }
    }
}

type Consumer = (Sender<SinkMessage>, JoinHandle<Result<u64>>);

fn spawn_consumer(
    split: Split,
    key: InstrumentKey,
    mut sink: Box<dyn ActivationSink>,
) -> Result<Consumer> {
    let (sender, receiver): (Sender<SinkMessage>, Receiver<SinkMessage>) = unbounded();
    let consumer = thread::Builder::new()
        .name(format!("{}-{}", split, key))
        .spawn(move || -> Result<u64> {
            let mut records = 0;
            for message in receiver.iter() {
                let end = message == SinkMessage::End;
                sink.put(message)?;
                if end {
                    return Ok(records);
                }
                records += 1;
            }
            Err(Error::InvalidArgument(
                "queue closed before end-of-stream".into(),
            ))
        })?;
    Ok((sender, consumer))
}

/// Drives corpus passes for one evaluator.
pub struct ElicitationPipeline<E: GraphEvaluator> {
    evaluator: Arc<E>,
    config: ElicitConfig,
    policy: AnnotationPolicy,
    keys: Vec<InstrumentKey>,
    instruments: InstrumentSet,
}

impl<E: GraphEvaluator> ElicitationPipeline<E> {
    pub fn new(evaluator: Arc<E>, config: ElicitConfig) -> Result<Self> {
        config.validate()?;
        let keys = InstrumentKey::all(evaluator.layers());
        let policy = config
            .policy
            .unwrap_or_else(|| AnnotationPolicy::for_task(evaluator.config().task));
        Ok(Self {
            evaluator,
            config,
            policy,
            keys,
            instruments: InstrumentSet::all(),
        })
    }

    pub fn keys(&self) -> &[InstrumentKey] {
        &self.keys
    }

    pub fn config(&self) -> &ElicitConfig {
        &self.config
    }

    pub fn policy(&self) -> AnnotationPolicy {
        self.policy
    }

    /// Indices of the sequences selected for `split`.
    pub fn sample(&self, split: Split, corpus: &[LabeledSequence]) -> Vec<usize> {
        let rate = self.config.rate(split);
        let mut rng = StdRng::seed_from_u64(self.config.split_seed(split));
        (0..corpus.len())
            .filter(|_| rng.gen::<f64>() < rate)
            .collect()
    }

    fn summarize(&self, split: Split, corpus: &[LabeledSequence]) -> PassSummary {
        let selected = self.sample(split, corpus);
        PassSummary {
            split,
            total: corpus.len(),
            sampled: selected.len(),
            instances: selected.iter().map(|&i| corpus[i].len()).sum(),
        }
    }

    /// Sampling counts for both passes without evaluating anything.
    pub fn dry_run(
        &self,
        train: &[LabeledSequence],
        test: &[LabeledSequence],
    ) -> (PassSummary, PassSummary) {
        let summaries = (
            self.summarize(Split::Train, train),
            self.summarize(Split::Test, test),
        );
        summaries.0.log(self.config.sample_rate_train);
        summaries.1.log(self.config.sample_rate_test);
        summaries
    }

    fn annotation<'a>(&self, sequence: &'a LabeledSequence, t: usize) -> Result<&'a str> {
        let target = match self.policy {
            AnnotationPolicy::PerTimestep => sequence.targets.get(t),
            AnnotationPolicy::WholeSequence => sequence.targets.first(),
        };
        target.map(String::as_str).ok_or_else(|| {
            Error::shape("sequence annotations", format!("> {}", t), sequence.targets.len())
        })
    }

    fn produce(
        &self,
        split: Split,
        corpus: &[LabeledSequence],
        handle: &mut PassHandle,
    ) -> Result<PassSummary> {
        let selected = self.sample(split, corpus);
        let width = self.evaluator.config().record_width();
        let mut instances = 0;

        for &index in &selected {
            let sequence = &corpus[index];
            let mut session = StepwiseSession::named(
                Arc::clone(&self.evaluator),
                format!("{}-{}", split, index),
                self.config.handle_unknown,
            );
            for (t, symbol) in sequence.inputs.iter().enumerate() {
                let annotation = self.annotation(sequence, t)?;
                let outcome = session.step(symbol, &self.instruments)?;
                for (k, key) in self.keys.iter().enumerate() {
                    let value = outcome
                        .instruments
                        .get(key.instrument, key.layer)
                        .ok_or_else(|| Error::shape("instrument values", key, "missing"))?;
                    let mut activation = vec![0.0; width];
                    for (slot, v) in activation.iter_mut().zip(value.iter()) {
                        *slot = *v;
                    }
                    handle.send(
                        k,
                        SinkMessage::Record(ActivationRecord {
                            symbol: symbol.clone(),
                            activation,
                            annotation: annotation.to_string(),
                        }),
                    );
                }
                instances += 1;
            }
        }

        Ok(PassSummary {
            split,
            total: corpus.len(),
            sampled: selected.len(),
            instances,
        })
    }

    /// One complete pass: produce, send `End`, join every consumer.
    ///
    /// If the producer fails, queues are closed without `End` so no stream
    /// is finalised, and the producer's error is returned.
    pub fn run_pass(
        &self,
        split: Split,
        corpus: &[LabeledSequence],
        factory: &dyn SinkFactory,
    ) -> Result<PassReport> {
        let mut handle = PassHandle::start(split, &self.keys, factory);
        let summary = match self.produce(split, corpus, &mut handle) {
            Ok(summary) => summary,
            Err(e) => {
                handle.abort();
                return Err(e);
            }
        };
        let records = handle.finish().map_err(Error::Consumers)?;
        summary.log(self.config.rate(split));
        Ok(PassReport { summary, records })
    }

    /// Train and test passes concurrently; returns once both have joined.
    pub fn run(
        &self,
        train: &[LabeledSequence],
        test: &[LabeledSequence],
        factory: &dyn SinkFactory,
    ) -> Result<(PassReport, PassReport)> {
        let (train_result, test_result) = thread::scope(|scope| {
            let train_pass = scope.spawn(|| self.run_pass(Split::Train, train, factory));
            let test_pass = scope.spawn(|| self.run_pass(Split::Test, test, factory));
            (
                train_pass.join().unwrap_or(Err(Error::Producer("train"))),
                test_pass.join().unwrap_or(Err(Error::Producer("test"))),
            )
        });
        match (train_result, test_result) {
            (Ok(train), Ok(test)) => Ok((train, test)),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(train_error), Err(test_error)) => {
                tracing::warn!("test pass failed as well: {}", test_error);
                Err(train_error)
            }
        }
    }
}
