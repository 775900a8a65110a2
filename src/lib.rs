//! # gatetrace
//!
//! Instrumentation for trained multi-layer LSTM sequence models: advance the
//! network one symbol at a time while exposing every gate and state tensor,
//! keep versioned snapshots of its parameters, and harvest per-layer,
//! per-gate activations from a labelled corpus into ordered on-disk streams.
//!
//! ## Components
//!
//! 1. **Cell**: the gated-memory transition with ten instrumentation slots
//! 2. **Evaluator**: parameters, unrolled evaluation, training by BPTT
//! 3. **Checkpoints**: a JSON registry mapping versions to saved steps
//! 4. **Stepwise sessions**: branchable cursors over an evaluator
//! 5. **Elicitation**: sampled corpus passes fanned out to per-key streams

pub mod checkpoint;
pub mod core;
pub mod error;
pub mod execution;
pub mod learning;
pub mod runtime;

pub use error::{Error, Result};

/// Crate-wide constants.
pub mod config {
    /// Reserved symbol for anything outside the vocabulary.
    pub const UNKNOWN_TOKEN: &str = "<unk>";

    /// File name of the checkpoint registry inside a model directory.
    pub const CHECKPOINT_FILE: &str = "checkpoints.json";

    /// Basename of parameter artifacts; the saved step is appended as `-<step>`.
    pub const MODEL_BASENAME: &str = "basename";

    /// Length of generated session names and copy suffixes.
    pub const RANDOM_NAME_LEN: usize = 6;

    /// Initial forget-gate bias (keeps memory open early in training).
    pub const FORGET_BIAS_INIT: f32 = 1.0;

    /// Default number of stacked LSTM layers.
    pub const DEFAULT_LAYERS: usize = 2;

    /// Default recurrent width.
    pub const DEFAULT_WIDTH: usize = 64;

    /// Default embedding width.
    pub const DEFAULT_EMBEDDING_WIDTH: usize = 64;

    /// Default SGD learning rate.
    pub const DEFAULT_LEARNING_RATE: f32 = 1.0;

    /// Default per-tensor gradient clip norm.
    pub const DEFAULT_CLIP_NORM: f32 = 5.0;

    /// Default training batch size.
    pub const DEFAULT_BATCH_SIZE: usize = 32;

    /// Default corpus sampling rate for elicitation.
    pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;
}
