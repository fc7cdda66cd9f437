// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Codec capability probing: maps `CodecType` onto the software backend's
//! underlying library ids and reports whether a codec is usable before an
//! encoder session is opened.

use crate::types::CodecType;

#[cfg(feature = "ffmpeg_encode")]
use ffmpeg_next as ffmpeg;

#[cfg(feature = "ffmpeg_encode")]
impl TryFrom<CodecType> for ffmpeg::codec::Id {
    type Error = anyhow::Error;

    fn try_from(codec: CodecType) -> anyhow::Result<Self> {
        match codec {
            CodecType::H264 => Ok(ffmpeg::codec::Id::H264),
            CodecType::H265 => Ok(ffmpeg::codec::Id::HEVC),
            CodecType::Jpeg => Ok(ffmpeg::codec::Id::MJPEG),
            CodecType::Auto | CodecType::Mpeg4 => {
                Err(anyhow::anyhow!("{codec} has no software encoder mapping"))
            }
        }
    }
}

/// Reports whether `codec` is encodable by the given backend, without
/// opening a session. MLU backends always claim H264/H265/Jpeg support
/// since those are the only codecs the hardware exposes; the software
/// backend defers to whatever `libavcodec` was built with.
pub fn probe_codec(codec: CodecType, mlu_encoder: bool) -> bool {
    if !codec.is_legal_encoder_target() {
        return false;
    }

    if mlu_encoder {
        return matches!(codec, CodecType::H264 | CodecType::H265 | CodecType::Jpeg);
    }

    #[cfg(feature = "ffmpeg_encode")]
    {
        if let Ok(id) = ffmpeg::codec::Id::try_from(codec) {
            return ffmpeg::encoder::find(id).is_some();
        }
        return false;
    }

    #[cfg(not(feature = "ffmpeg_encode"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpeg4_never_probes_true() {
        assert!(!probe_codec(CodecType::Mpeg4, false));
        assert!(!probe_codec(CodecType::Mpeg4, true));
    }

    #[test]
    fn mlu_claims_h264_h265_jpeg() {
        assert!(probe_codec(CodecType::H264, true));
        assert!(probe_codec(CodecType::H265, true));
        assert!(probe_codec(CodecType::Jpeg, true));
    }
}
