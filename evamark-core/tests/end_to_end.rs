//! Whole-pipeline tests against synthesized videos and a scripted engine.
//!
//! These exercise the real ffmpeg decode/encode path; the native inference
//! library is replaced by a scripted `InferenceEngine` so the submit/fetch
//! ordering contract can be asserted from the outside.

use anyhow::Result;
use std::path::Path;

use evamark_core::{
    BBox, BgrFrame, Detection, InferenceEngine, OutputPaths, Pipeline, PipelineError, Stage,
    StreamDescriptor,
};
use evamark_core::video::{VideoSink, VideoSource};

/// Per-frame script: a detection count, and the batch to hand out when the
/// driver fetches. Fails the test on any ordering violation.
struct ScriptedEngine {
    script: Vec<(u32, Vec<Detection>)>,
    submits: usize,
    fetchable: bool,
}

impl ScriptedEngine {
    fn new(script: Vec<(u32, Vec<Detection>)>) -> Self {
        Self {
            script,
            submits: 0,
            fetchable: false,
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn submit(&mut self, frame: &BgrFrame) -> Result<u32> {
        assert!(frame.layout_is_valid(), "driver submitted a misshapen frame");
        assert!(
            self.submits < self.script.len(),
            "more submits than scripted frames"
        );
        let (count, _) = &self.script[self.submits];
        self.submits += 1;
        self.fetchable = *count > 0;
        Ok(*count)
    }

    fn fetch_results(&mut self) -> Result<Vec<Detection>> {
        assert!(
            self.fetchable,
            "fetch_results must only follow a submit with count > 0"
        );
        self.fetchable = false;
        Ok(self.script[self.submits - 1].1.clone())
    }
}

fn descriptor_10x10_30fps() -> StreamDescriptor {
    StreamDescriptor {
        width: 10,
        height: 10,
        fps_num: 30,
        fps_den: 1,
        duration_secs: 0.0,
    }
}

fn solid_frame(descriptor: &StreamDescriptor, value: u8, pts: i64) -> BgrFrame {
    BgrFrame {
        data: vec![value; (descriptor.width * descriptor.height * 3) as usize],
        width: descriptor.width,
        height: descriptor.height,
        pts,
    }
}

/// Encode `frames` into a small H.264 file the pipeline can ingest.
fn write_test_video(path: &Path, descriptor: &StreamDescriptor, frames: &[BgrFrame]) -> Result<()> {
    let mut sink = VideoSink::open(descriptor, path)?;
    for frame in frames {
        sink.write(frame)?;
    }
    sink.finish()?;
    Ok(())
}

fn decode_all(path: &Path) -> Result<(StreamDescriptor, Vec<BgrFrame>)> {
    let (descriptor, mut source) = VideoSource::open(path)?;
    let mut frames = Vec::new();
    while let Some(frame) = source.next_frame()? {
        frames.push(frame);
    }
    Ok((descriptor, frames))
}

fn pixel_delta(a: &BgrFrame, b: &BgrFrame) -> u64 {
    a.data
        .iter()
        .zip(b.data.iter())
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum()
}

#[test]
fn two_frame_scenario_produces_annotated_output_with_audio() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.mp4");
    let descriptor = descriptor_10x10_30fps();

    // Two identical mid-gray frames; only the second gets a detection.
    write_test_video(
        &input,
        &descriptor,
        &[
            solid_frame(&descriptor, 128, 0),
            solid_frame(&descriptor, 128, 1),
        ],
    )?;

    let detection = Detection {
        bbox: BBox {
            x: 1.0,
            y: 1.0,
            width: 4.0,
            height: 4.0,
        },
        score: 0.87,
    };
    let engine = ScriptedEngine::new(vec![(0, vec![]), (1, vec![detection])]);

    let outputs = OutputPaths::in_dir(dir.path().join("out"));
    std::fs::create_dir_all(dir.path().join("out"))?;

    let mut pipeline = Pipeline::new(engine);
    let summary = pipeline.run(&input, &outputs)?;

    assert_eq!(pipeline.stage(), Stage::Done);
    assert_eq!(summary.frames, 2);
    assert_eq!(summary.detections, 1);
    assert!(outputs.silent.exists());
    assert!(outputs.with_audio.exists());

    // Releasing the engine after the run must not invalidate anything the
    // pipeline already copied out or wrote.
    drop(pipeline.into_engine());

    // The silent video preserves geometry, frame rate and frame count.
    let (out_desc, out_frames) = decode_all(&outputs.silent)?;
    assert_eq!(out_desc.width, 10);
    assert_eq!(out_desc.height, 10);
    assert_eq!((out_desc.fps_num, out_desc.fps_den), (30, 1));
    assert_eq!(out_frames.len(), 2);

    // Frame 2 carries the drawn box, frame 1 does not; even through lossy
    // H.264 the two decoded frames must differ clearly.
    let delta = pixel_delta(&out_frames[0], &out_frames[1]);
    assert!(delta > 500, "annotation not visible in output (delta {delta})");

    // The final deliverable carries an audio stream next to the video.
    ffmpeg_next::init()?;
    let final_ctx = ffmpeg_next::format::input(&outputs.with_audio)?;
    assert!(final_ctx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .is_some());
    assert!(final_ctx
        .streams()
        .best(ffmpeg_next::media::Type::Audio)
        .is_some());

    Ok(())
}

#[test]
fn frame_count_round_trips_through_the_pipeline() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.mp4");
    let descriptor = descriptor_10x10_30fps();

    let frames: Vec<BgrFrame> = (0..5)
        .map(|i| solid_frame(&descriptor, 40 * i as u8, i))
        .collect();
    write_test_video(&input, &descriptor, &frames)?;

    // No detections on any frame: the engine must never be fetched.
    let engine = ScriptedEngine::new(vec![(0, vec![]); 5]);
    let outputs = OutputPaths::in_dir(dir.path());

    let mut pipeline = Pipeline::new(engine);
    let summary = pipeline.run(&input, &outputs)?;

    assert_eq!(summary.frames, 5);
    assert_eq!(summary.detections, 0);

    let (_, out_frames) = decode_all(&outputs.silent)?;
    assert_eq!(out_frames.len(), 5, "sink must not drop or duplicate frames");
    Ok(())
}

#[test]
fn garbage_input_fails_with_open_error_and_no_outputs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("garbage.mp4");
    std::fs::write(&input, b"this is not a video container")?;

    let engine = ScriptedEngine::new(vec![(0, vec![])]);
    let outputs = OutputPaths::in_dir(dir.path());

    let mut pipeline = Pipeline::new(engine);
    let err = pipeline.run(&input, &outputs).unwrap_err();

    assert!(matches!(err, PipelineError::Open(_)), "got {err:?}");
    assert_eq!(pipeline.stage(), Stage::Aborted);
    assert!(!outputs.silent.exists());
    assert!(!outputs.with_audio.exists());

    let engine = pipeline.into_engine();
    assert_eq!(engine.submits, 0);
    Ok(())
}

#[test]
fn a_failed_mux_leaves_the_silent_video_intact() -> Result<()> {
    // Attaching audio to a file that is not a video must fail with Mux-stage
    // context and must not touch the input path.
    let dir = tempfile::tempdir()?;
    let bogus = dir.path().join("bogus.mp4");
    std::fs::write(&bogus, b"not a container")?;
    let before = std::fs::read(&bogus)?;

    let out = dir.path().join("with_audio.mp4");
    let err = evamark_core::audio::attach_silent_audio(&bogus, &out);
    assert!(err.is_err());
    assert_eq!(std::fs::read(&bogus)?, before);
    Ok(())
}
