// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! `cnvideo-core`: a codec-agnostic asynchronous video encoder, a
//! multi-source stream compositor, and a DeepSORT-style multi-object
//! tracker, for Cambricon MLU accelerators and CPU fallback.

pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod mux;
pub mod perf;
pub mod ring;
pub mod scaler;
pub mod stream;
pub mod sync;
pub mod tiler;
pub mod tracker;
pub mod types;

pub use error::{Error, Result};
