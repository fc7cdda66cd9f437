// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! CPU/software encoder backend, built on `ffmpeg-next`. One worker thread
//! per instance pulls submitted frames off a channel, feeds them to an
//! ffmpeg codec context, and pushes completed packets back into the shared
//! `EncoderBase` ring.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, trace, warn};

use crate::encoder::base::EncoderBase;
use crate::error::{Error, Result};
use crate::types::{CodecType, PixelFormat, VideoFrame, VideoPacket};

struct Submission {
    index: i64,
    frame: VideoFrame,
    data: Vec<u8>,
}

/// Software backend: an ffmpeg encode session run on a dedicated worker
/// thread, the way `cpu_encode.rs` hands frames to its own encode thread
/// rather than encoding inline on the caller's thread.
pub struct SoftwareBackend {
    base: Arc<EncoderBase>,
    tx: Sender<Submission>,
    worker: Option<std::thread::JoinHandle<()>>,
}

const QUEUE_DEPTH: usize = 8;

impl SoftwareBackend {
    pub fn start(
        base: Arc<EncoderBase>,
        codec: CodecType,
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        bit_rate: u32,
        gop_size: u32,
        frame_rate: u32,
        time_base: u32,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<Submission>(QUEUE_DEPTH);
        let base_for_worker = base.clone();

        let worker = std::thread::Builder::new()
            .name("cnvideo-sw-encode".into())
            .spawn(move || {
                run_worker(
                    base_for_worker,
                    rx,
                    codec,
                    pixel_format,
                    width,
                    height,
                    bit_rate,
                    gop_size,
                    frame_rate,
                    time_base,
                )
            })
            .map_err(|e| Error::resource(format!("failed to spawn encode thread: {e}")))?;

        Ok(SoftwareBackend {
            base,
            tx,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, index: i64, frame: VideoFrame, data: Vec<u8>) -> Result<()> {
        self.tx
            .send(Submission { index, frame, data })
            .map_err(|_| Error::state("encode worker has shut down"))
    }

    pub fn stop(&mut self) {
        // Dropping the sender tells the worker loop to drain and exit.
        drop(std::mem::replace(&mut self.tx, bounded(1).0));
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    base: Arc<EncoderBase>,
    rx: Receiver<Submission>,
    codec: CodecType,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    bit_rate: u32,
    gop_size: u32,
    frame_rate: u32,
    time_base: u32,
) {
    #[cfg(feature = "ffmpeg_encode")]
    {
        if let Err(e) = run_worker_ffmpeg(
            &base,
            &rx,
            codec,
            pixel_format,
            width,
            height,
            bit_rate,
            gop_size,
            frame_rate,
            time_base,
        ) {
            error!("software encode session failed: {e:#}");
            base.mark_error();
        }
        return;
    }

    #[cfg(not(feature = "ffmpeg_encode"))]
    {
        warn!("ffmpeg_encode feature disabled; software backend draining without encoding");
        for submission in rx.iter() {
            let mut packet = VideoPacket::new(bytes::Bytes::from(submission.data));
            packet.set_key(true);
            let _ = base.push_packet(submission.index, packet);
        }
        let _ = (codec, pixel_format, width, height, bit_rate, gop_size, frame_rate, time_base);
    }
}

#[cfg(feature = "ffmpeg_encode")]
#[allow(clippy::too_many_arguments)]
fn run_worker_ffmpeg(
    base: &Arc<EncoderBase>,
    rx: &Receiver<Submission>,
    codec: CodecType,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    bit_rate: u32,
    gop_size: u32,
    frame_rate: u32,
    time_base: u32,
) -> anyhow::Result<()> {
    use ffmpeg_next as ffmpeg;

    ffmpeg::init()?;

    let codec_id: ffmpeg::codec::Id = codec
        .try_into()
        .map_err(|_| anyhow::anyhow!("{codec} has no software encoder"))?;
    let encoder_codec = ffmpeg::encoder::find(codec_id)
        .ok_or_else(|| anyhow::anyhow!("ffmpeg has no encoder registered for {codec_id:?}"))?;

    let context = ffmpeg::codec::Context::new_with_codec(encoder_codec);
    let mut encoder = context.encoder().video()?;

    encoder.set_width(width);
    encoder.set_height(height);
    encoder.set_format(native_pixel_format(pixel_format));
    encoder.set_time_base(ffmpeg::Rational::new(1, time_base as i32));
    encoder.set_frame_rate(Some(ffmpeg::Rational::new(1, frame_rate.max(1) as i32)));
    encoder.set_bit_rate(bit_rate as usize);
    encoder.set_gop(gop_size);

    let mut encoder = encoder.open_as(encoder_codec)?;

    for submission in rx.iter() {
        let mut av_frame = ffmpeg::frame::Video::new(native_pixel_format(pixel_format), width, height);
        fill_frame_planes(&mut av_frame, &submission.frame, &submission.data);
        av_frame.set_pts(Some(submission.frame.pts));

        encoder.send_frame(&av_frame)?;
        drain_packets(&mut encoder, base, submission.index)?;
    }

    encoder.send_eof()?;
    drain_packets(&mut encoder, base, -1)?;
    Ok(())
}

#[cfg(feature = "ffmpeg_encode")]
fn drain_packets(
    encoder: &mut ffmpeg_next::encoder::Video,
    base: &Arc<EncoderBase>,
    index: i64,
) -> anyhow::Result<()> {
    use ffmpeg_next as ffmpeg;

    let mut av_packet = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut av_packet).is_ok() {
        let data = av_packet.data().unwrap_or(&[]);
        let mut packet = VideoPacket::new(bytes::Bytes::copy_from_slice(data));
        packet.set_key(av_packet.is_key());
        trace!(index, size = packet.size(), "software packet encoded");
        base.push_packet(if index >= 0 { index } else { 0 }, packet)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

#[cfg(feature = "ffmpeg_encode")]
fn native_pixel_format(pixel_format: PixelFormat) -> ffmpeg_next::format::Pixel {
    match pixel_format {
        PixelFormat::I420 => ffmpeg_next::format::Pixel::YUV420P,
        PixelFormat::Nv12 => ffmpeg_next::format::Pixel::NV12,
        PixelFormat::Nv21 => ffmpeg_next::format::Pixel::NV21,
    }
}

#[cfg(feature = "ffmpeg_encode")]
fn fill_frame_planes(av_frame: &mut ffmpeg_next::frame::Video, frame: &VideoFrame, data: &[u8]) {
    let planes = match frame.pixel_format {
        PixelFormat::I420 => 3,
        PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
    };
    let mut offset = 0usize;
    for p in 0..planes {
        let stride = av_frame.stride(p);
        let plane_height = if p == 0 {
            frame.height as usize
        } else {
            frame.height.div_ceil(2) as usize
        };
        let dst = av_frame.data_mut(p);
        let row_bytes = frame.stride[p] as usize;
        for row in 0..plane_height {
            let src_off = offset + row * row_bytes;
            let dst_off = row * stride;
            if src_off + row_bytes <= data.len() && dst_off + row_bytes <= dst.len() {
                dst[dst_off..dst_off + row_bytes].copy_from_slice(&data[src_off..src_off + row_bytes]);
            }
        }
        offset += row_bytes * plane_height;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_after_stop_is_rejected() {
        let base = Arc::new(EncoderBase::new(4096, 30, 1_000_000));
        base.begin_start().unwrap();
        base.finish_start();

        let mut backend = SoftwareBackend::start(
            base,
            CodecType::Jpeg,
            PixelFormat::Nv12,
            16,
            16,
            1_000_000,
            30,
            30,
            1_000_000,
        )
        .unwrap();
        backend.stop();

        let frame = VideoFrame::new(16, 16, PixelFormat::Nv12);
        assert!(backend.submit(0, frame, vec![0u8; 16 * 16 * 3 / 2]).is_err());
    }
}
