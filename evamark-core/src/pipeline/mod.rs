//! pipeline — the frame-by-frame driver
//!
//! Pulls frames from the source, pushes each through the engine binding and
//! the annotator, writes the result to the sink, then attaches the silent
//! audio track. Single-threaded and synchronous: a frame is fully processed
//! (submit → fetch → annotate → write) before the next one is pulled, which
//! is what keeps the engine's non-reentrant submit/fetch pair safe without
//! any locking.
//!
//! Resources follow scoped acquisition: engine (held by the caller), source
//! and sink are released in reverse acquisition order on every exit path,
//! the error paths included, via ownership and `Drop`.

use std::path::{Path, PathBuf};

use anyhow::anyhow;

use crate::annotate::annotate;
use crate::audio;
use crate::engine::InferenceEngine;
use crate::error::PipelineError;
use crate::video::{VideoSink, VideoSource};

/// Driver state. Failure from any state lands in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    EngineReady,
    StreamOpen,
    Running,
    Draining,
    Finalizing,
    Done,
    Aborted,
}

/// Where the two deliverables go: the silent annotated video and the final
/// video with the silent audio track.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub silent: PathBuf,
    pub with_audio: PathBuf,
}

impl OutputPaths {
    /// The original layout: `video.mp4` and `video_with_audio.mp4` inside
    /// `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            silent: dir.join("video.mp4"),
            with_audio: dir.join("video_with_audio.mp4"),
        }
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub frames: u64,
    pub detections: u64,
    pub silent: PathBuf,
    pub with_audio: PathBuf,
}

/// One pipeline run over one engine instance. The engine travels through
/// the context object rather than ambient globals, so several runs can share
/// a process (and a test can script its own engine).
pub struct Pipeline<E: InferenceEngine> {
    engine: E,
    stage: Stage,
}

impl<E: InferenceEngine> Pipeline<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Release the pipeline and hand the engine back to the caller.
    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Process `input` end to end. On failure the specific stage error is
    /// propagated and the pipeline lands in [`Stage::Aborted`]; whatever
    /// resources were acquired are dropped in reverse order on unwind of
    /// the inner scopes.
    pub fn run(&mut self, input: &Path, outputs: &OutputPaths) -> Result<RunSummary, PipelineError> {
        match self.run_inner(input, outputs) {
            Ok(summary) => {
                self.advance(Stage::Done);
                tracing::info!(
                    frames = summary.frames,
                    detections = summary.detections,
                    "pipeline run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                self.stage = Stage::Aborted;
                tracing::error!(error = %err, "pipeline run aborted");
                Err(err)
            }
        }
    }

    fn run_inner(
        &mut self,
        input: &Path,
        outputs: &OutputPaths,
    ) -> Result<RunSummary, PipelineError> {
        // The engine was initialised before the pipeline was constructed.
        self.advance(Stage::EngineReady);

        let (descriptor, mut source) =
            VideoSource::open(input).map_err(PipelineError::Open)?;
        let mut sink =
            VideoSink::open(&descriptor, &outputs.silent).map_err(PipelineError::Sink)?;
        self.advance(Stage::StreamOpen);

        let mut frames: u64 = 0;
        let mut detections: u64 = 0;

        while let Some(mut frame) = source.next_frame().map_err(PipelineError::Open)? {
            if frames == 0 {
                self.advance(Stage::Running);
            }

            if !frame.layout_is_valid() {
                return Err(PipelineError::FrameFormat {
                    index: frames,
                    width: frame.width,
                    height: frame.height,
                    expected: frame.expected_len(),
                    got: frame.data.len(),
                });
            }

            let count = self
                .engine
                .submit(&frame)
                .map_err(PipelineError::Inference)?;

            // Zero detections is a normal frame; only a positive count has
            // results to fetch.
            if count > 0 {
                let batch = self
                    .engine
                    .fetch_results()
                    .map_err(PipelineError::Inference)?;
                detections += batch.len() as u64;
                annotate(&mut frame, &batch);
            }

            sink.write(&frame).map_err(PipelineError::Sink)?;
            frames += 1;
        }

        if frames == 0 {
            return Err(PipelineError::Open(anyhow!(
                "input contains no decodable video frames"
            )));
        }

        drop(source);
        sink.finish().map_err(PipelineError::Sink)?;
        self.advance(Stage::Draining);

        self.advance(Stage::Finalizing);
        audio::attach_silent_audio(&outputs.silent, &outputs.with_audio)
            .map_err(PipelineError::Mux)?;

        Ok(RunSummary {
            frames,
            detections,
            silent: outputs.silent.clone(),
            with_audio: outputs.with_audio.clone(),
        })
    }

    fn advance(&mut self, next: Stage) {
        tracing::debug!(from = ?self.stage, to = ?next, "pipeline stage");
        self.stage = next;
    }
}
