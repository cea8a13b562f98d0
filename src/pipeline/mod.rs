pub mod instrument;

pub use instrument::{InstrumentPipeline, PipelineContext};
