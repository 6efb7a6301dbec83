pub mod annotate;
pub mod audio;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod video;

pub use engine::{BBox, Detection, InferenceEngine, NativeEngine};
pub use error::PipelineError;
pub use pipeline::{OutputPaths, Pipeline, RunSummary, Stage};
pub use video::{BgrFrame, StreamDescriptor};
