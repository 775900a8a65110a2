//! Runtime: the evaluator query surface and stepwise sessions over it.
//!
//! - [`GraphEvaluator`]: read-only single-symbol evaluation and parameter probes
//! - [`LstmEvaluator`]: the concrete model with train/test/save/load/copy
//! - [`StepwiseSession`]: a branchable `(state, t)` cursor

pub mod evaluator;
pub mod session;

pub use evaluator::{Evaluation, GraphEvaluator, LstmEvaluator, Prediction, TestReport};
pub use session::{random_name, StepOutcome, StepwiseSession};
