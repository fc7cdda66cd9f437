// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Multi-source orchestrator: accepts per-source frames on arbitrary
//! timestamps, rectifies them onto a monotone pts, composes (directly or
//! through the Tiler) a canvas, and resamples it to the encoder at a fixed
//! frame rate.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::encoder::{Encoder, OpenParams};
use crate::error::{Error, Result};
use crate::tiler::Tiler;
use crate::types::{Buffer, ColorFormat, VideoFrame, INVALID_TIMESTAMP};

/// Per-source timestamp bookkeeping (§4.G): tracks the running rebase so a
/// looping or jittery source still produces monotone effective pts.
#[derive(Debug, Clone, Copy)]
struct TimestampState {
    init: i64,
    base: i64,
    last: i64,
    diff: i64,
    count: u64,
}

impl TimestampState {
    fn new() -> Self {
        TimestampState {
            init: 0,
            base: 0,
            last: INVALID_TIMESTAMP,
            diff: 0,
            count: 0,
        }
    }

    /// Applies the rectification rule and returns the effective pts.
    fn rectify(&mut self, ts: i64) -> i64 {
        if self.last == INVALID_TIMESTAMP {
            self.init = if ts == INVALID_TIMESTAMP { 0 } else { ts };
            self.base = 0;
        } else if ts < self.last {
            self.base += self.last + self.diff - ts;
        } else {
            self.diff = ts - self.last;
        }
        self.last = ts;
        self.count += 1;
        ts + self.base - self.init
    }
}

struct QueuedFrame {
    position: usize,
    pts: i64,
    buffer_owned: OwnedBuffer,
}

impl PartialEq for QueuedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.pts == other.pts
    }
}
impl Eq for QueuedFrame {}
impl PartialOrd for QueuedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedFrame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the minimum pts sorts first.
        other.pts.cmp(&self.pts)
    }
}

/// Host-memory snapshot of one incoming frame, independent of the caller's
/// buffer lifetime.
struct OwnedBuffer {
    width: u32,
    height: u32,
    color: ColorFormat,
    planes: Vec<Vec<u8>>,
    strides: Vec<u32>,
}

impl OwnedBuffer {
    fn capture(buf: &Buffer) -> Self {
        let strides = buf.normalized_strides();
        let mut planes = Vec::new();
        let mut out_strides = Vec::new();
        for p in 0..buf.color.plane_count() {
            if let Some(data) = buf.data[p] {
                planes.push(data.to_vec());
                out_strides.push(strides[p]);
            }
        }
        OwnedBuffer {
            width: buf.width,
            height: buf.height,
            color: buf.color,
            planes,
            strides: out_strides,
        }
    }

    fn as_buffer(&self) -> Buffer<'_> {
        let mut data = [None, None, None];
        let mut stride = [0u32; 3];
        for (p, plane) in self.planes.iter().enumerate() {
            data[p] = Some(plane.as_slice());
            stride[p] = self.strides[p];
        }
        Buffer {
            width: self.width,
            height: self.height,
            data,
            stride,
            color: self.color,
            device_id: -1,
        }
    }
}

struct SourceState {
    timestamps: Mutex<TimestampState>,
}

struct Shared {
    queue: Mutex<BinaryHeap<QueuedFrame>>,
    queue_cv: Condvar,
    sources: Vec<SourceState>,
    tiler: Option<Tiler>,
    single_canvas: Mutex<Option<OwnedBuffer>>,
    resample_index: AtomicI64,
    running: AtomicBool,
    eos_notified: Mutex<bool>,
    eos_cv: Condvar,
}

/// Video Stream orchestrator: owns the rearrange and resample threads and
/// the encoder they feed.
pub struct VideoStream {
    shared: Arc<Shared>,
    encoder: Arc<Mutex<Encoder>>,
    cfg: StreamConfig,
    rearrange: Mutex<Option<std::thread::JoinHandle<()>>>,
    resample: Mutex<Option<std::thread::JoinHandle<()>>>,
}

const QUEUE_FILL_MULTIPLIER: usize = 10;

impl VideoStream {
    pub fn open(cfg: StreamConfig, num_positions: usize, ring_capacity: usize) -> Result<Self> {
        let tiled = cfg.tile_cols > 1 || cfg.tile_rows > 1;
        let resample = cfg.resample || tiled;

        let tiler = if tiled {
            Some(Tiler::uniform(cfg.tile_cols, cfg.tile_rows, cfg.width, cfg.height, cfg.pixel_format.into()))
        } else {
            None
        };

        let sources = (0..num_positions.max(1))
            .map(|_| SourceState {
                timestamps: Mutex::new(TimestampState::new()),
            })
            .collect();

        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            queue_cv: Condvar::new(),
            sources,
            tiler,
            single_canvas: Mutex::new(None),
            resample_index: AtomicI64::new(0),
            running: AtomicBool::new(resample || tiled),
            eos_notified: Mutex::new(false),
            eos_cv: Condvar::new(),
        });

        let params = OpenParams::from_stream_config(&cfg, ring_capacity);
        let encoder = Arc::new(Mutex::new(Encoder::open(params)?));
        encoder.lock().unwrap().start()?;

        let mut stream = VideoStream {
            shared: shared.clone(),
            encoder: encoder.clone(),
            cfg: cfg.clone(),
            rearrange: Mutex::new(None),
            resample: Mutex::new(None),
        };

        if resample || tiled {
            stream.spawn_threads();
        }

        Ok(stream)
    }

    fn spawn_threads(&mut self) {
        let shared = self.shared.clone();
        let encoder = self.encoder.clone();
        let num_positions = shared.sources.len();
        let rearrange = std::thread::Builder::new()
            .name("cnvideo-rearrange".into())
            .spawn(move || rearrange_loop(shared, num_positions))
            .expect("failed to spawn rearrange thread");
        *self.rearrange.lock().unwrap() = Some(rearrange);

        let shared = self.shared.clone();
        let cfg = self.cfg.clone();
        let resample = std::thread::Builder::new()
            .name("cnvideo-resample".into())
            .spawn(move || resample_loop(shared, encoder, cfg))
            .expect("failed to spawn resample thread");
        *self.resample.lock().unwrap() = Some(resample);
    }

    /// `Update`: enqueues one frame from `position`. Non-tiled, non-resample
    /// configurations skip the queue entirely and synthesize pts directly.
    pub fn update(&self, buf: &Buffer, timestamp: i64, position: usize) -> Result<()> {
        let source = self
            .shared
            .sources
            .get(position)
            .ok_or_else(|| Error::parameters(format!("position {position} out of range")))?;

        let effective_pts = {
            let mut ts = source.timestamps.lock().unwrap();
            ts.rectify(timestamp)
        };

        if !self.cfg.resample && self.shared.tiler.is_none() {
            let count = {
                let ts = source.timestamps.lock().unwrap();
                ts.count
            };
            let pts = (count as i64) * self.cfg.time_base as i64 / self.cfg.frame_rate.max(1) as i64;
            let mut frame = VideoFrame::new(buf.width, buf.height, self.cfg.pixel_format);
            frame.pts = pts;
            let data = flatten_buffer(buf);
            self.encoder.lock().unwrap().send_frame(frame, &data)?;
            return Ok(());
        }

        let owned = OwnedBuffer::capture(buf);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push(QueuedFrame {
            position,
            pts: effective_pts,
            buffer_owned: owned,
        });
        drop(queue);
        self.shared.queue_cv.notify_one();
        Ok(())
    }

    /// `Clear`: blits a black frame into `position`.
    pub fn clear(&self, position: usize) -> Result<()> {
        let Some(tiler) = &self.shared.tiler else {
            return Err(Error::state("Clear requires a tiled stream"));
        };
        let rect = tiler
            .rect(position)
            .ok_or_else(|| Error::parameters(format!("position {position} out of range")))?;
        let black = vec![0u8; (rect.w.max(0) * rect.h.max(0)) as usize * 3 / 2];
        let buf = Buffer {
            width: rect.w.max(0) as u32,
            height: rect.h.max(0) as u32,
            data: [Some(&black), None, None],
            stride: [rect.w.max(0) as u32, 0, 0],
            color: self.cfg.pixel_format.into(),
            device_id: -1,
        };
        tiler.blit(&buf, Some(position)).map_err(Error::from_anyhow)
    }

    /// `Close`: stops the rearrange/resample threads and the encoder.
    pub fn close(&mut self, wait_finish: bool) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();

        if let Some(h) = self.rearrange.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.resample.lock().unwrap().take() {
            let _ = h.join();
        }

        if wait_finish {
            let mut frame = VideoFrame::new(self.cfg.width, self.cfg.height, self.cfg.pixel_format);
            frame.set_eos(true);
            let _ = self.encoder.lock().unwrap().send_frame(frame, &[]);

            let notified = self.shared.eos_notified.lock().unwrap();
            let (_guard, timed_out) = self
                .shared
                .eos_cv
                .wait_timeout_while(notified, Duration::from_secs(2), |n| !*n)
                .unwrap();
            if timed_out.timed_out() {
                warn!("timed out waiting for EOS callback on close");
            }
        }

        self.encoder.lock().unwrap().stop()
    }
}

fn flatten_buffer(buf: &Buffer) -> Vec<u8> {
    let strides = buf.normalized_strides();
    let mut out = Vec::new();
    for p in 0..buf.color.plane_count() {
        if let Some(plane) = buf.data[p] {
            let rows = if p == 0 { buf.height } else { buf.height.div_ceil(2) };
            let row_bytes = strides[p] as usize;
            for row in 0..rows as usize {
                let off = row * row_bytes;
                if off + row_bytes <= plane.len() {
                    out.extend_from_slice(&plane[off..off + row_bytes]);
                }
            }
        }
    }
    out
}

fn rearrange_loop(shared: Arc<Shared>, num_positions: usize) {
    let min_fill = QUEUE_FILL_MULTIPLIER * num_positions.max(1);

    while shared.running.load(Ordering::SeqCst) {
        let mut queue = shared.queue.lock().unwrap();
        while shared.running.load(Ordering::SeqCst) && queue.len() < min_fill {
            let (guard, timeout) = shared
                .queue_cv
                .wait_timeout(queue, Duration::from_millis(50))
                .unwrap();
            queue = guard;
            if timeout.timed_out() && !shared.running.load(Ordering::SeqCst) {
                break;
            }
            if timeout.timed_out() {
                break;
            }
        }
        if !shared.running.load(Ordering::SeqCst) && queue.is_empty() {
            return;
        }

        let Some(next) = queue.pop() else { continue };
        drop(queue);

        trace!(position = next.position, pts = next.pts, "rearranged frame ready");

        if let Some(tiler) = &shared.tiler {
            let buf = next.buffer_owned.as_buffer();
            if let Err(e) = tiler.blit(&buf, Some(next.position)) {
                warn!("tiler blit failed: {e:#}");
            }
        } else {
            *shared.single_canvas.lock().unwrap() = Some(next.buffer_owned);
        }
    }
}

fn resample_loop(shared: Arc<Shared>, encoder: Arc<Mutex<Encoder>>, cfg: StreamConfig) {
    let tick = Duration::from_secs_f64(1.0 / cfg.frame_rate.max(1) as f64);
    let mut next_tick = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        next_tick += tick;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }

        let index = shared.resample_index.fetch_add(1, Ordering::SeqCst);
        let pts = index * cfg.time_base as i64 / cfg.frame_rate.max(1) as i64;

        let (data, width, height) = if let Some(tiler) = &shared.tiler {
            let canvas = tiler.get_canvas(true);
            let d = canvas.data.clone();
            tiler.release_canvas();
            (d, canvas.width, canvas.height)
        } else {
            let guard = shared.single_canvas.lock().unwrap();
            match guard.as_ref() {
                Some(owned) => (flatten_buffer(&owned.as_buffer()), owned.width, owned.height),
                None => continue,
            }
        };

        let mut frame = VideoFrame::new(width, height, cfg.pixel_format);
        frame.pts = pts;

        if let Err(e) = encoder.lock().unwrap().send_frame(frame, &data) {
            debug!("resample send_frame failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_rectification_matches_looping_source_example() {
        let mut ts = TimestampState::new();
        assert_eq!(ts.rectify(1000), 0);
        assert_eq!(ts.rectify(2000), 1000);
        // ts < last (1500 < 2000): base += (2000 + 1000 - 1500) = 1500.
        assert_eq!(ts.rectify(1500), 2000);
    }

    #[test]
    fn monotone_within_one_position_after_loop() {
        let mut ts = TimestampState::new();
        let a = ts.rectify(5000);
        let b = ts.rectify(6000);
        let c = ts.rectify(100); // looped back to near zero
        assert!(a < b);
        assert!(b < c);
    }
}
