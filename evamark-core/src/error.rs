//! error — stage-level failure kinds for a pipeline run
//!
//! Modules report failures as `anyhow::Error` with context; the pipeline
//! driver wraps them into one of these kinds so callers (and the CLI's exit
//! message) can tell *which stage* gave up. Every kind is fatal to the run:
//! there is no per-frame retry and no partial-output recovery.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The native engine could not be initialised (null handle, missing
    /// library, unresolvable symbols). Raised before any frame is read.
    #[error("inference engine initialization failed")]
    Initialization(#[source] anyhow::Error),

    /// The input stream could not be opened or decoded (corrupt container,
    /// unsupported codec, no video stream, zero frames).
    #[error("could not open input video stream")]
    Open(#[source] anyhow::Error),

    /// The output container could not be created or written.
    #[error("could not create or write output video")]
    Sink(#[source] anyhow::Error),

    /// A decoded frame does not match the `width × height × 3` BGR byte
    /// layout the engine contract requires.
    #[error("frame {index}: buffer is {got} bytes, expected {expected} for {width}x{height} BGR")]
    FrameFormat {
        index: u64,
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },

    /// The engine reported an error sentinel from an inference call.
    /// Distinct from "zero detections", which is a normal event.
    #[error("inference call failed")]
    Inference(#[source] anyhow::Error),

    /// Audio attachment failed. The silent annotated video remains valid on
    /// disk; only the final muxed output is missing.
    #[error("could not attach silent audio track")]
    Mux(#[source] anyhow::Error),
}
