//! Core module: vocabularies, corpora, the LSTM cell, recurrent state, the
//! model skeleton and the instrument registry.

pub mod cell;
pub mod corpus;
pub mod instruments;
pub mod labels;
pub mod model;
pub mod state;
