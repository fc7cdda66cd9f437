// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Asynchronous video encoder engine: one shared state machine/output-buffer
//! (`base`) composed with one of three backends, the way `mm-server`
//! composes a `compositor::Codec` trait object over a shared video pipeline
//! rather than subclassing a monolithic encoder type.

pub mod base;
pub mod device;
pub mod mlu200;
pub mod mlu300;
pub mod software;

use std::sync::Arc;

use tracing::instrument;

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::types::{CodecType, PixelFormat, VideoFrame, VideoPacket};

use base::{EncoderBase, PacketInfo};
use device::DeviceSession;
use mlu200::Mlu200Backend;
use mlu300::Mlu300Backend;
use software::SoftwareBackend;

/// The concrete hardware or software path backing an `Encoder`.
enum Backend {
    Software(SoftwareBackend),
    Mlu200(Mlu200Backend),
    Mlu300(Mlu300Backend),
}

/// Which MLU generation to target; chosen by the caller, since there is no
/// portable way to probe silicon revision from user space in this crate's
/// dependency set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceGeneration {
    Mlu200,
    Mlu300,
}

/// Public encoder handle: `Open`/`Start`/`Stop`/`SendFrame`/`GetPacket`, the
/// contract every backend serves through the shared `EncoderBase`.
pub struct Encoder {
    base: Arc<EncoderBase>,
    backend: Backend,
    codec: CodecType,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
}

pub struct OpenParams {
    pub codec: CodecType,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u32,
    pub gop_size: u32,
    pub frame_rate: u32,
    pub time_base: u32,
    pub mlu_encoder: bool,
    pub device_generation: DeviceGeneration,
    pub device_id: i32,
    pub ring_capacity: usize,
}

impl OpenParams {
    pub fn from_stream_config(cfg: &StreamConfig, ring_capacity: usize) -> Self {
        OpenParams {
            codec: cfg.codec_type,
            pixel_format: cfg.pixel_format,
            width: cfg.width,
            height: cfg.height,
            bit_rate: cfg.bit_rate,
            gop_size: cfg.gop_size,
            frame_rate: cfg.frame_rate,
            time_base: cfg.time_base,
            mlu_encoder: cfg.mlu_encoder,
            device_generation: DeviceGeneration::Mlu300,
            device_id: cfg.device_id,
            ring_capacity,
        }
    }
}

impl Encoder {
    /// Opens a new encoder instance. Mirrors spec-facing `Open`: validates
    /// the codec/pixel-format combination before committing to a backend.
    #[instrument(skip(params), fields(codec = %params.codec, mlu = params.mlu_encoder))]
    pub fn open(params: OpenParams) -> Result<Self> {
        if !params.codec.is_legal_encoder_target() {
            return Err(Error::parameters(format!("{} is not a legal encoder target", params.codec)));
        }
        if params.mlu_encoder && params.pixel_format.rejected_by_mlu() {
            return Err(Error::parameters("MLU backends reject I420 input"));
        }
        if !crate::codec::probe_codec(params.codec, params.mlu_encoder) {
            return Err(Error::resource(format!(
                "no available {} encoder for mlu_encoder={}",
                params.codec, params.mlu_encoder
            )));
        }

        let base = Arc::new(EncoderBase::new(params.ring_capacity, params.frame_rate, params.time_base));

        let backend = if params.mlu_encoder {
            match params.device_generation {
                DeviceGeneration::Mlu200 => {
                    Backend::Mlu200(Mlu200Backend::open(base.clone(), params.device_id, params.codec)?)
                }
                DeviceGeneration::Mlu300 => {
                    Backend::Mlu300(Mlu300Backend::open(base.clone(), params.device_id, params.codec)?)
                }
            }
        } else {
            Backend::Software(SoftwareBackend::start(
                base.clone(),
                params.codec,
                params.pixel_format,
                params.width,
                params.height,
                params.bit_rate,
                params.gop_size,
                params.frame_rate,
                params.time_base,
            )?)
        };

        Ok(Encoder {
            base,
            backend,
            codec: params.codec,
            pixel_format: params.pixel_format,
            width: params.width,
            height: params.height,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.base.begin_start()?;
        self.base.finish_start();
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.base.begin_stop()?;
        if let Backend::Software(sw) = &mut self.backend {
            sw.stop();
        }
        self.base.finish_stop();
        Ok(())
    }

    /// `RequestFrameBuffer`: the software backend encodes from a caller-
    /// supplied byte slice directly, so this only validates dimensions
    /// against the configured geometry; there is no pooled buffer to hand
    /// back in this crate's host-memory-only software path.
    pub fn request_frame_buffer(&self, width: u32, height: u32) -> Result<()> {
        if width != self.width || height != self.height {
            return Err(Error::parameters("frame buffer geometry mismatch"));
        }
        Ok(())
    }

    pub fn send_frame(&self, frame: VideoFrame, data: &[u8]) -> Result<()> {
        self.base.check_send_allowed(frame.is_eos() && data.is_empty())?;
        if frame.is_eos() {
            self.base.check_eos_not_yet_sent()?;
        }

        let index = self.base.begin_submission(frame.pts, frame.dts, 0);

        if frame.is_eos() && data.is_empty() {
            self.base.mark_eos_sent();
            let mut packet = VideoPacket::new(bytes::Bytes::new());
            packet.set_eos(true);
            return self.base.push_packet(index, packet);
        }

        match &self.backend {
            Backend::Software(sw) => sw.submit(index, frame, data.to_vec()),
            Backend::Mlu200(dev) => dev.submit(index, &frame, data),
            Backend::Mlu300(dev) => dev.submit(index, &frame, data),
        }
    }

    pub fn get_packet(&self, out: Option<&mut Vec<u8>>, max_len: usize, probe: bool) -> Result<PacketInfo> {
        self.base.get_packet(out, max_len, probe)
    }

    pub fn has_error(&self) -> bool {
        self.base.has_error()
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }
}

/// Sink trait every backend implements implicitly through `EncoderBase`:
/// push a finished packet, keyed by the submission index that produced it.
/// Exposed so tests and alternate backends can be driven without going
/// through the full `Encoder` facade.
pub trait Sink {
    fn push(&self, index: i64, packet: VideoPacket) -> Result<()>;
}

impl Sink for EncoderBase {
    fn push(&self, index: i64, packet: VideoPacket) -> Result<()> {
        self.push_packet(index, packet)
    }
}

#[allow(dead_code)]
fn _assert_device_session_send_sync() {
    fn assert_send<T: Send>() {}
    assert_send::<DeviceSession>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_mpeg4() {
        let params = OpenParams {
            codec: CodecType::Mpeg4,
            pixel_format: PixelFormat::Nv12,
            width: 16,
            height: 16,
            bit_rate: 100_000,
            gop_size: 30,
            frame_rate: 30,
            time_base: 1_000_000,
            mlu_encoder: false,
            device_generation: DeviceGeneration::Mlu300,
            device_id: 0,
            ring_capacity: 4096,
        };
        assert!(Encoder::open(params).is_err());
    }

    #[test]
    fn open_rejects_mlu_with_i420() {
        let params = OpenParams {
            codec: CodecType::H264,
            pixel_format: PixelFormat::I420,
            width: 16,
            height: 16,
            bit_rate: 100_000,
            gop_size: 30,
            frame_rate: 30,
            time_base: 1_000_000,
            mlu_encoder: true,
            device_generation: DeviceGeneration::Mlu300,
            device_id: 0,
            ring_capacity: 4096,
        };
        assert!(Encoder::open(params).is_err());
    }
}
