// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Layered configuration: an all-`Option` parsed layer merged with
//! built-in defaults via `converge::Converge`, then flattened into a
//! fully-populated public `Config`.

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use regex::Regex;

use std::path::PathBuf;

use crate::types::{CodecType, PixelFormat};

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"\A[a-z][a-z0-9-_]{0,256}\z").unwrap();
    static ref DEFAULT_CFG: parsed::Config =
        toml::from_str(include_str!("../cnvideo.default.toml")).unwrap();
}

/// Serde representations of the configuration file; every field is
/// optional so a caller-supplied file only needs to mention overrides.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    pub(super) struct Config {
        #[converge(nest)]
        pub(super) stream: Option<StreamConfig>,
        #[converge(nest)]
        pub(super) tiler: Option<TilerConfig>,
        #[converge(nest)]
        pub(super) ring: Option<RingConfig>,
        #[converge(nest)]
        pub(super) tracker: Option<TrackerConfig>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct StreamConfig {
        pub(super) width: Option<u32>,
        pub(super) height: Option<u32>,
        pub(super) frame_rate: Option<u32>,
        pub(super) time_base: Option<u32>,
        pub(super) bit_rate: Option<u32>,
        pub(super) gop_size: Option<u32>,
        pub(super) pixel_format: Option<String>,
        pub(super) codec_type: Option<String>,
        pub(super) mlu_encoder: Option<bool>,
        pub(super) device_id: Option<i32>,
        pub(super) resample: Option<bool>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct TilerConfig {
        pub(super) tile_cols: Option<u32>,
        pub(super) tile_rows: Option<u32>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct RingConfig {
        pub(super) capacity: Option<usize>,
        pub(super) prefer_reader: Option<bool>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct TrackerConfig {
        pub(super) max_cosine_distance: Option<f64>,
        pub(super) nn_budget: Option<usize>,
        pub(super) max_iou_distance: Option<f64>,
        pub(super) max_age: Option<u32>,
        pub(super) n_init: Option<u32>,
    }
}

/// Fully-populated video stream configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub tile_cols: u32,
    pub tile_rows: u32,
    pub frame_rate: u32,
    pub time_base: u32,
    pub bit_rate: u32,
    pub gop_size: u32,
    pub pixel_format: PixelFormat,
    pub codec_type: CodecType,
    pub mlu_encoder: bool,
    pub resample: bool,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingConfig {
    pub capacity: usize,
    pub prefer_reader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub max_cosine_distance: f64,
    pub nn_budget: usize,
    pub max_iou_distance: f64,
    pub max_age: u32,
    pub n_init: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub stream: StreamConfig,
    pub ring: RingConfig,
    pub tracker: TrackerConfig,
}

impl Config {
    /// Loads `path` (if given) merged over the built-in defaults, and
    /// validates the result.
    pub fn new(path: Option<&PathBuf>) -> anyhow::Result<Config> {
        let overlay = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading configuration file {}", path.display()))?;
            let parsed: parsed::Config = toml::from_str(&content)
                .with_context(|| format!("parsing configuration file {}", path.display()))?;
            Some(parsed)
        } else {
            None
        };

        let mut this = Self::build(overlay)?;
        this.stream.frame_rate = this.stream.frame_rate.clamp(1, 60);
        this.validate()?;
        Ok(this)
    }

    fn build(overlay: Option<parsed::Config>) -> anyhow::Result<Config> {
        use converge::Converge;

        let merged = match overlay {
            Some(o) => o.converge(DEFAULT_CFG.clone()),
            None => DEFAULT_CFG.clone(),
        };

        let stream = merged.stream.context("missing [stream] section")?;
        let tiler = merged.tiler.context("missing [tiler] section")?;
        let ring = merged.ring.context("missing [ring] section")?;
        let tracker = merged.tracker.context("missing [tracker] section")?;

        Ok(Config {
            stream: StreamConfig {
                width: stream.width.context("stream.width")?,
                height: stream.height.context("stream.height")?,
                tile_cols: tiler.tile_cols.context("tiler.tile_cols")?,
                tile_rows: tiler.tile_rows.context("tiler.tile_rows")?,
                frame_rate: stream.frame_rate.context("stream.frame_rate")?,
                time_base: stream.time_base.context("stream.time_base")?,
                bit_rate: stream.bit_rate.context("stream.bit_rate")?,
                gop_size: stream.gop_size.context("stream.gop_size")?,
                pixel_format: parse_pixel_format(
                    &stream.pixel_format.context("stream.pixel_format")?,
                )?,
                codec_type: parse_codec_type(&stream.codec_type.context("stream.codec_type")?)?,
                mlu_encoder: stream.mlu_encoder.context("stream.mlu_encoder")?,
                resample: stream.resample.context("stream.resample")?,
                device_id: stream.device_id.context("stream.device_id")?,
            },
            ring: RingConfig {
                capacity: ring.capacity.context("ring.capacity")?,
                prefer_reader: ring.prefer_reader.context("ring.prefer_reader")?,
            },
            tracker: TrackerConfig {
                max_cosine_distance: tracker
                    .max_cosine_distance
                    .context("tracker.max_cosine_distance")?,
                nn_budget: tracker.nn_budget.context("tracker.nn_budget")?,
                max_iou_distance: tracker
                    .max_iou_distance
                    .context("tracker.max_iou_distance")?,
                max_age: tracker.max_age.context("tracker.max_age")?,
                n_init: tracker.n_init.context("tracker.n_init")?,
            },
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.stream.width < 2 || self.stream.width % 2 != 0 {
            bail!("stream.width must be even and >= 2");
        }
        if self.stream.height < 2 || self.stream.height % 2 != 0 {
            bail!("stream.height must be even and >= 2");
        }
        if self.stream.time_base < 1000 {
            bail!("stream.time_base must be >= 1000");
        }
        if !self.stream.codec_type.is_legal_encoder_target() {
            bail!(
                "stream.codec_type {} is not a legal encoder target",
                self.stream.codec_type
            );
        }
        if self.stream.mlu_encoder && self.stream.pixel_format.rejected_by_mlu() {
            bail!("MLU backends reject I420; choose NV12 or NV21");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build(None).expect("failed to build default config")
    }
}

fn parse_pixel_format(s: &str) -> anyhow::Result<PixelFormat> {
    match s.to_ascii_lowercase().as_str() {
        "i420" => Ok(PixelFormat::I420),
        "nv12" => Ok(PixelFormat::Nv12),
        "nv21" => Ok(PixelFormat::Nv21),
        other => bail!("unknown pixel_format {other:?}"),
    }
}

fn parse_codec_type(s: &str) -> anyhow::Result<CodecType> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(CodecType::Auto),
        "h264" => Ok(CodecType::H264),
        "h265" => Ok(CodecType::H265),
        "mpeg4" => Ok(CodecType::Mpeg4),
        "jpeg" => Ok(CodecType::Jpeg),
        other => bail!("unknown codec_type {other:?}"),
    }
}

/// Validates a source or track name the way the original's `NAME_RE`
/// pattern does, for callers that accept user-chosen identifiers.
pub fn validate_name(name: &str) -> anyhow::Result<()> {
    if !NAME_RE.is_match(name) {
        bail!("invalid name {name:?}: must match {}", NAME_RE.as_str());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_and_validate() {
        let cfg = Config::new(None).expect("default config should parse and validate");
        assert_eq!(cfg.stream.width, 1920);
        assert_eq!(cfg.stream.codec_type, CodecType::H264);
        assert_eq!(cfg.tracker.n_init, 3);
    }

    #[test]
    fn codec_type_parsing() {
        assert!(parse_codec_type("h264").is_ok());
        assert!(parse_codec_type("mpeg4").is_ok());
        assert!(parse_codec_type("bogus").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("camera-0").is_ok());
        assert!(validate_name("Camera0").is_err());
    }
}
