//! Execution: instrumentation keys, activation sinks and the elicitation
//! pipeline that fans a sampled corpus out to them.

pub mod elicit;
pub mod keys;
pub mod sink;

pub use elicit::{AnnotationPolicy, ElicitConfig, ElicitationPipeline, PassHandle, PassReport, PassSummary};
pub use keys::{InstrumentKey, Split};
pub use sink::{read_stream, ActivationRecord, ActivationSink, DiskSinkFactory, SinkFactory, SinkMessage};
