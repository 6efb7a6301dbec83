//! audio — attach a silent AAC track to the annotated video
//!
//! Players and downstream tooling commonly expect an audio stream, so the
//! final deliverable carries a constant-zero 44.1 kHz track spanning the
//! video's duration. The silent video is read back and stream-copied into a
//! separate output file — it is never modified in place, so a failure here
//! leaves it valid on disk.

use std::path::Path;

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, util::rational::Rational, ChannelLayout,
};

/// Sample rate of the synthesized track.
pub const SAMPLE_RATE: i32 = 44_100;

/// Mux `video_path` (H.264, no audio) together with a synthesized silent
/// AAC track into `output_path`.
pub fn attach_silent_audio<P: AsRef<Path>, Q: AsRef<Path>>(
    video_path: P,
    output_path: Q,
) -> Result<()> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    let mut ictx = format::input(&video_path).context("could not reopen silent video")?;

    let in_stream = ictx
        .streams()
        .best(media::Type::Video)
        .context("silent video has no video stream")?;
    let in_index = in_stream.index();
    let in_time_base = in_stream.time_base();

    let duration_secs = if in_stream.duration() > 0 && in_time_base.denominator() > 0 {
        in_stream.duration() as f64 * in_time_base.numerator() as f64
            / in_time_base.denominator() as f64
    } else if ictx.duration() > 0 {
        ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
    } else {
        0.0
    };

    let mut octx = format::output(&output_path).context("could not create muxed output")?;
    let global_header = octx
        .format()
        .flags()
        .contains(format::flag::Flags::GLOBAL_HEADER);

    // Video: stream copy — the frames were just encoded by the sink, there
    // is no reason to re-encode them.
    let mut video_out = octx.add_stream(codec::Id::None)?;
    video_out.set_parameters(in_stream.parameters());
    let video_out_index = video_out.index();

    // Audio: silent AAC.
    let audio_codec = encoder::find(codec::Id::AAC).context("AAC encoder not found")?;
    let sample_format = audio_codec
        .audio()
        .context("AAC codec is not an audio encoder")?
        .formats()
        .context("AAC encoder reports no sample formats")?
        .next()
        .context("AAC encoder sample format list is empty")?;

    let mut audio_out = octx.add_stream(audio_codec)?;
    let audio_ctx = codec::context::Context::new_with_codec(audio_codec);
    let mut builder = audio_ctx.encoder().audio()?;
    builder.set_rate(SAMPLE_RATE);
    builder.set_channel_layout(ChannelLayout::MONO);
    builder.set_format(sample_format);
    builder.set_time_base(Rational(1, SAMPLE_RATE));
    if global_header {
        builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }
    let mut audio_encoder = builder
        .open_as(audio_codec)
        .context("failed to open AAC encoder")?;
    audio_out.set_parameters(&audio_encoder);
    audio_out.set_time_base(Rational(1, SAMPLE_RATE));
    let audio_out_index = audio_out.index();

    octx.write_header().context("failed to write muxed header")?;

    // The muxer may adjust stream time bases while writing the header.
    let video_out_tb = octx
        .stream(video_out_index)
        .context("muxed video stream vanished after header write")?
        .time_base();
    let audio_out_tb = octx
        .stream(audio_out_index)
        .context("muxed audio stream vanished after header write")?
        .time_base();

    // ── Video packet copy ────────────────────────────────────────────────
    for (stream, mut packet) in ictx.packets() {
        if stream.index() != in_index {
            continue;
        }
        packet.set_stream(video_out_index);
        packet.rescale_ts(stream.time_base(), video_out_tb);
        packet
            .write_interleaved(&mut octx)
            .context("failed to copy video packet")?;
    }

    // ── Silent audio ─────────────────────────────────────────────────────
    let frame_size = match audio_encoder.frame_size() {
        0 => 1024,
        n => n as usize,
    };
    let total_samples = (duration_secs * SAMPLE_RATE as f64).ceil() as i64;

    tracing::debug!(duration_secs, total_samples, frame_size, "synthesizing silence");

    let mut pts: i64 = 0;
    while pts < total_samples {
        let mut silence = frame::Audio::new(sample_format, frame_size, ChannelLayout::MONO);
        silence.set_rate(SAMPLE_RATE as u32);
        for plane in 0..silence.planes() {
            silence.data_mut(plane).fill(0);
        }
        silence.set_pts(Some(pts));

        audio_encoder
            .send_frame(&silence)
            .context("AAC encoder send_frame")?;
        drain_audio(&mut audio_encoder, &mut octx, audio_out_index, audio_out_tb)?;

        pts += frame_size as i64;
    }

    audio_encoder.send_eof().ok();
    drain_audio(&mut audio_encoder, &mut octx, audio_out_index, audio_out_tb)?;

    octx.write_trailer().context("failed to write muxed trailer")?;

    tracing::info!(
        duration_secs,
        output = %output_path.as_ref().display(),
        "silent audio track attached"
    );
    Ok(())
}

fn drain_audio(
    encoder: &mut encoder::Audio,
    octx: &mut format::context::Output,
    stream_index: usize,
    out_time_base: Rational,
) -> Result<()> {
    let mut encoded = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        encoded.rescale_ts(Rational(1, SAMPLE_RATE), out_time_base);
        encoded
            .write_interleaved(octx)
            .context("failed to write audio packet")?;
    }
    Ok(())
}
