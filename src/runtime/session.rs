//! Branchable stepwise cursor over a [`GraphEvaluator`].
//!
//! A session is the value `(evaluator, name, state, t)`.  The state is held
//! behind an `Arc`, so cloning or branching a session never copies tensors
//! and never touches the evaluator's parameters.

use std::sync::Arc;

use rand::Rng;

use crate::config::RANDOM_NAME_LEN;
use crate::core::instruments::{InstrumentSet, InstrumentValues};
use crate::core::state::RecurrentState;
use crate::error::Result;

use super::evaluator::{GraphEvaluator, Prediction};

/// `len` random lowercase ASCII letters.
pub fn random_name<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// What one step produced.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub prediction: Prediction,
    pub instruments: InstrumentValues,
}

pub struct StepwiseSession<E: GraphEvaluator> {
    evaluator: Arc<E>,
    name: String,
    handle_unknown: bool,
    /// `None` until the first step (evaluated against the zero state).
    state: Option<Arc<RecurrentState>>,
    t: usize,
}

impl<E: GraphEvaluator> Clone for StepwiseSession<E> {
    fn clone(&self) -> Self {
        Self {
            evaluator: Arc::clone(&self.evaluator),
            name: self.name.clone(),
            handle_unknown: self.handle_unknown,
            state: self.state.clone(),
            t: self.t,
        }
    }
}

impl<E: GraphEvaluator> StepwiseSession<E> {
    /// Fresh session with a random name.
    pub fn new<R: Rng>(evaluator: Arc<E>, handle_unknown: bool, rng: &mut R) -> Self {
        Self::named(evaluator, random_name(rng, RANDOM_NAME_LEN), handle_unknown)
    }

    pub fn named(evaluator: Arc<E>, name: impl Into<String>, handle_unknown: bool) -> Self {
        Self {
            evaluator,
            name: name.into(),
            handle_unknown,
            state: None,
            t: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of symbols consumed.
    pub fn t(&self) -> usize {
        self.t
    }

    pub fn handle_unknown(&self) -> bool {
        self.handle_unknown
    }

    pub fn evaluator(&self) -> &Arc<E> {
        &self.evaluator
    }

    /// Current state; `None` for a fresh session.
    pub fn state(&self) -> Option<&RecurrentState> {
        self.state.as_deref()
    }

    /// Current state, materialising the zero state for a fresh session.
    pub fn current_state(&self) -> RecurrentState {
        match &self.state {
            Some(state) => (**state).clone(),
            None => self.evaluator.zero_state(),
        }
    }

    /// Feed `symbol` and advance.
    pub fn step(&mut self, symbol: &str, instruments: &InstrumentSet) -> Result<StepOutcome> {
        let evaluation =
            self.evaluator
                .evaluate(symbol, self.handle_unknown, self.state(), instruments)?;
        self.state = Some(Arc::new(evaluation.state));
        self.t += 1;
        Ok(StepOutcome {
            prediction: evaluation.prediction,
            instruments: evaluation.instruments,
        })
    }

    /// Evaluate `symbol` at the current state without advancing.
    pub fn query(&self, symbol: &str, instruments: &InstrumentSet) -> Result<StepOutcome> {
        let evaluation =
            self.evaluator
                .evaluate(symbol, self.handle_unknown, self.state(), instruments)?;
        Ok(StepOutcome {
            prediction: evaluation.prediction,
            instruments: evaluation.instruments,
        })
    }

    /// A new session one symbol past this one; `self` is unchanged.
    pub fn branch(&self, symbol: &str) -> Result<Self> {
        let evaluation = self.evaluator.evaluate(
            symbol,
            self.handle_unknown,
            self.state(),
            &InstrumentSet::empty(),
        )?;
        Ok(Self {
            evaluator: Arc::clone(&self.evaluator),
            name: format!("{},{}", self.name, symbol),
            handle_unknown: self.handle_unknown,
            state: Some(Arc::new(evaluation.state)),
            t: self.t + 1,
        })
    }
}
