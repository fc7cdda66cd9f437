// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cnvideo_core::config::Config;
use cnvideo_core::encoder::{Encoder, OpenParams};
use cnvideo_core::types::{VideoFrame, INVALID_TIMESTAMP};

#[derive(Debug, Parser)]
#[command(name = "cnvideo")]
#[command(about = "Cambricon MLU video pipeline demo CLI", long_about = None)]
struct Cli {
    /// Path to a config file. Defaults to the built-in configuration.
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Input raw frame file (a single planar frame matching the configured
    /// pixel format and geometry) to push through the encoder as a smoke
    /// test. If omitted, only `Open`/`Start`/`Stop` are exercised.
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,
    /// Write the first encoded packet here.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging()?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_handler = interrupted.clone();
    ctrlc::set_handler(move || interrupted_handler.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;

    let cfg = Config::new(args.config.as_ref()).context("failed to read config")?;
    debug!(codec = %cfg.stream.codec_type, "configuration loaded");

    let params = OpenParams::from_stream_config(&cfg.stream, cfg.ring.capacity);
    let mut encoder = Encoder::open(params).context("opening encoder")?;
    encoder.start().context("starting encoder")?;
    info!(codec = %encoder.codec(), "encoder running");

    if let Some(input_path) = args.input {
        let data = std::fs::read(&input_path)
            .with_context(|| format!("reading input frame {}", input_path.display()))?;

        let mut frame = VideoFrame::new(cfg.stream.width, cfg.stream.height, cfg.stream.pixel_format);
        frame.pts = 0;
        frame.dts = INVALID_TIMESTAMP;
        encoder.send_frame(frame, &data).context("sending frame")?;

        let probe = encoder
            .get_packet(None, 0, true)
            .context("probing encoded packet size")?;
        let mut packet_bytes = Vec::new();
        let info = encoder
            .get_packet(Some(&mut packet_bytes), probe.size, false)
            .context("reading back encoded packet")?;
        info!(size = info.size, pts = info.pts, "packet encoded");

        if let Some(output_path) = args.output {
            std::fs::write(&output_path, &packet_bytes)
                .with_context(|| format!("writing output packet {}", output_path.display()))?;
        }
    } else {
        warn!("no --input given; running until Ctrl-C");
        while !interrupted.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }

    encoder.stop().context("stopping encoder")?;
    Ok(())
}

fn init_logging() -> Result<()> {
    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("cnvideo=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();
    Ok(())
}
