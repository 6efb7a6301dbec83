//! video — FFmpeg bridge: decode to BGR frames, encode back to H.264
//!
//! The decoder side ([`VideoSource`]) yields a lazy, finite, non-restartable
//! sequence of packed BGR24 frames; the encoder side ([`VideoSink`]) writes
//! annotated frames back at the source geometry and frame rate. The stream
//! descriptor is captured once at open and reused by the sink and the audio
//! stage so output timing always matches the input.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational, Dictionary,
};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for format conversion.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame: packed BGR24 bytes, row-major, no padding,
/// plus its presentation timestamp in source time-base units.
///
/// Invariant: `data.len() == width * height * 3`. The pipeline driver checks
/// this before every engine call.
pub struct BgrFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl BgrFrame {
    /// Expected buffer length for the frame's geometry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Whether the buffer matches the interleaved BGR layout invariant.
    pub fn layout_is_valid(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

/// Geometry and timing of the input stream, captured once at open time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamDescriptor {
    pub width: u32,
    pub height: u32,
    pub fps_num: i32,
    pub fps_den: i32,
    /// Container-reported duration in seconds; 0.0 when unknown.
    pub duration_secs: f64,
}

impl StreamDescriptor {
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            return 0.0;
        }
        self.fps_num as f64 / self.fps_den as f64
    }

    fn frame_rate(&self) -> Rational {
        Rational(self.fps_num, self.fps_den)
    }
}

// ── Frame source ─────────────────────────────────────────────────────────────

/// Decodes an input video into a sequence of BGR frames. Exhausted once the
/// decoder reports no more frames; cannot be restarted.
pub struct VideoSource {
    ictx: format::context::Input,
    decoder: codec::decoder::Video,
    to_bgr: scaling::Context,
    stream_index: usize,
    eof_sent: bool,
    frames_read: u64,
}

impl VideoSource {
    /// Open `path` and capture the stream descriptor. Fails on an
    /// undecodable container, a missing video stream or an unusable
    /// frame rate.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(StreamDescriptor, Self)> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&path).context("could not open input file")?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();

        let frame_rate = stream.avg_frame_rate();
        if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
            bail!("input video stream has no usable frame rate");
        }

        let time_base = stream.time_base();
        let duration_secs = if stream.duration() > 0 && time_base.denominator() > 0 {
            stream.duration() as f64 * time_base.numerator() as f64
                / time_base.denominator() as f64
        } else if ictx.duration() > 0 {
            ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else {
            0.0
        };

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let (width, height) = (decoder.width(), decoder.height());
        if width == 0 || height == 0 {
            bail!("input video stream reports zero dimensions");
        }

        let to_bgr = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::BGR24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-BGR scaler")?;

        let descriptor = StreamDescriptor {
            width,
            height,
            fps_num: frame_rate.numerator(),
            fps_den: frame_rate.denominator(),
            duration_secs,
        };

        tracing::info!(
            width,
            height,
            fps = descriptor.fps(),
            duration_secs,
            "opened input video stream"
        );

        Ok((
            descriptor,
            Self {
                ictx,
                decoder,
                to_bgr,
                stream_index,
                eof_sent: false,
                frames_read: 0,
            },
        ))
    }

    /// Decode and return the next frame, or `None` once the stream is
    /// exhausted. Blocks until a frame is available.
    pub fn next_frame(&mut self) -> Result<Option<BgrFrame>> {
        let mut decoded = frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame = self.compact_to_bgr(&decoded)?;
                self.frames_read += 1;
                return Ok(Some(frame));
            }
            if self.eof_sent {
                return Ok(None);
            }

            match self.ictx.packets().next() {
                Some((stream, packet)) if stream.index() == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("decoder send_packet")?;
                }
                Some(_) => continue,
                None => {
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
            }
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Convert a decoded frame to packed BGR24 and strip stride padding.
    fn compact_to_bgr(&mut self, decoded: &frame::Video) -> Result<BgrFrame> {
        let mut bgr = frame::Video::empty();
        self.to_bgr
            .run(decoded, &mut bgr)
            .context("to-BGR scaling failed")?;

        let (width, height) = (bgr.width(), bgr.height());
        let stride = bgr.stride(0);
        let raw = bgr.data(0);
        let row_len = width as usize * 3;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        Ok(BgrFrame {
            data,
            width,
            height,
            pts: decoded.pts().unwrap_or(self.frames_read as i64),
        })
    }
}

// ── Frame sink ───────────────────────────────────────────────────────────────

/// Encodes BGR frames into an H.264 container at the descriptor's geometry
/// and frame rate. Frames are written in submission order; the Nth frame
/// written corresponds exactly to the Nth frame read.
pub struct VideoSink {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    bgr_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    ost_time_base: Rational,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl VideoSink {
    /// Create the output container at `path`, matching `descriptor` exactly.
    pub fn open<P: AsRef<Path>>(descriptor: &StreamDescriptor, path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let mut octx = format::output(&path).context("could not create output container")?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

        let mut stream = octx.add_stream(codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(codec);
        let mut builder = encoder_ctx.encoder().video()?;

        let frame_rate = descriptor.frame_rate();
        let time_base = frame_rate.invert();

        builder.set_width(descriptor.width);
        builder.set_height(descriptor.height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(
                codec,
                Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;

        stream.set_parameters(&video_encoder);
        let stream_index = stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::BGR24,
            descriptor.width,
            descriptor.height,
            ENCODE_FORMAT,
            descriptor.width,
            descriptor.height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header().context("failed to write output header")?;

        // The muxer may adjust the stream time base while writing the header.
        let ost_time_base = octx
            .stream(stream_index)
            .context("output stream vanished after header write")?
            .time_base();

        tracing::info!(
            width = descriptor.width,
            height = descriptor.height,
            fps = descriptor.fps(),
            "opened output video container"
        );

        Ok(Self {
            octx,
            encoder: video_encoder,
            to_yuv,
            bgr_frame: frame::Video::new(format::Pixel::BGR24, descriptor.width, descriptor.height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            ost_time_base,
            width: descriptor.width,
            height: descriptor.height,
            frames_written: 0,
        })
    }

    /// Append one frame. The frame must match the descriptor geometry the
    /// sink was opened with.
    pub fn write(&mut self, frame: &BgrFrame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            bail!(
                "frame geometry {}x{} does not match output {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }
        if !frame.layout_is_valid() {
            bail!("frame buffer does not match its declared geometry");
        }

        // Copy the packed rows into the (possibly stride-padded) AVFrame.
        let stride = self.bgr_frame.stride(0);
        let row_len = self.width as usize * 3;
        let plane = self.bgr_frame.data_mut(0);
        for row in 0..self.height as usize {
            let dst_start = row * stride;
            let src_start = row * row_len;
            plane[dst_start..dst_start + row_len]
                .copy_from_slice(&frame.data[src_start..src_start + row_len]);
        }

        self.to_yuv
            .run(&self.bgr_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;

        // Re-time on the output clock: one tick per frame at 1/fps.
        self.yuv_frame.set_pts(Some(self.frames_written as i64));

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain_encoder()?;

        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Flush the encoder and finalise the container. Must be called exactly
    /// once after the last write; consumes the sink so a second finish (or a
    /// write-after-finish) cannot compile.
    pub fn finish(mut self) -> Result<u64> {
        self.encoder.send_eof().ok();
        self.drain_encoder()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        tracing::info!(frames = self.frames_written, "output video finalised");
        Ok(self.frames_written)
    }

    /// Drain all pending packets from the encoder and write them out.
    fn drain_encoder(&mut self) -> Result<()> {
        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, self.ost_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_fps_is_a_ratio() {
        let desc = StreamDescriptor {
            width: 10,
            height: 10,
            fps_num: 30000,
            fps_den: 1001,
            duration_secs: 0.0,
        };
        assert!((desc.fps() - 29.97).abs() < 0.01);

        let zero = StreamDescriptor {
            fps_den: 0,
            ..desc
        };
        assert_eq!(zero.fps(), 0.0);
    }

    #[test]
    fn frame_layout_invariant() {
        let good = BgrFrame {
            data: vec![0; 300],
            width: 10,
            height: 10,
            pts: 0,
        };
        assert!(good.layout_is_valid());

        let bad = BgrFrame {
            data: vec![0; 299],
            width: 10,
            height: 10,
            pts: 0,
        };
        assert!(!bad.layout_is_valid());
        assert_eq!(bad.expected_len(), 300);
    }
}
