//! Learning: backpropagation through time and the mini-batch training loop.
//!
//! - **backward**: per-sequence loss and gradients, replaying dropout masks
//! - **trainer**: length-sorted batches, random epoch offsets, clipped SGD

pub mod backward;
pub mod trainer;
