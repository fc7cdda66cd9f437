// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! 2-D canvas with a fixed grid (rows×cols) or explicit rectangles. Accepts
//! grid writes concurrently and exposes double-buffered canvas reads, the
//! way `mm-server`'s compositor swaps double-buffered `SwapFrame`s between
//! the blit and submit sides of its pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::scaler::Scaler;
use crate::types::{Buffer, ColorFormat, Rect};

/// An owned RGB/YUV canvas, sized to `width x height` of `color`.
#[derive(Debug, Clone)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub color: ColorFormat,
    pub data: Vec<u8>,
    pub stride: u32,
}

impl Canvas {
    fn new(width: u32, height: u32, color: ColorFormat) -> Self {
        let stride = width * if color.is_yuv() { 1 } else { color.bytes_per_pixel() as u32 };
        let size = canvas_byte_size(width, height, color);
        Canvas {
            width,
            height,
            color,
            data: vec![0u8; size],
            stride,
        }
    }
}

fn canvas_byte_size(width: u32, height: u32, color: ColorFormat) -> usize {
    match color {
        ColorFormat::YuvI420 => {
            (width * height) as usize + 2 * (width.div_ceil(2) * height.div_ceil(2)) as usize
        }
        ColorFormat::YuvNv12 | ColorFormat::YuvNv21 => {
            (width * height) as usize + (width * height.div_ceil(2)) as usize
        }
        _ => (width * height * color.bytes_per_pixel() as u32) as usize,
    }
}

/// Builds the rectangles for a uniform grid, distributing the remainder of
/// `W/cols` and `H/rows` one pixel at a time to the earlier grids.
pub fn uniform_grid(cols: u32, rows: u32, canvas_w: u32, canvas_h: u32) -> Vec<Rect> {
    let base_w = canvas_w / cols;
    let rem_w = canvas_w % cols;
    let base_h = canvas_h / rows;
    let rem_h = canvas_h % rows;

    let widths: Vec<u32> = (0..cols).map(|c| base_w + if c < rem_w { 1 } else { 0 }).collect();
    let heights: Vec<u32> = (0..rows).map(|r| base_h + if r < rem_h { 1 } else { 0 }).collect();

    let mut rects = Vec::with_capacity((cols * rows) as usize);
    let mut y = 0i32;
    for h in &heights {
        let mut x = 0i32;
        for w in &widths {
            rects.push(Rect::new(x, y, *w as i32, *h as i32));
            x += *w as i32;
        }
        y += *h as i32;
    }
    rects
}

struct DoubleBuffer {
    canvases: [Mutex<Canvas>; 2],
    /// index of the canvas currently exposed to readers.
    front: AtomicUsize,
    locked: Mutex<bool>,
    locked_cv: Condvar,
}

/// Tiler state: a fixed grid of rectangles over a shared canvas, with
/// double-buffered reads so writers never race a reader mid-frame.
pub struct Tiler {
    rects: Vec<Rect>,
    width: u32,
    height: u32,
    color: ColorFormat,
    buffers: DoubleBuffer,
    round_robin: Mutex<usize>,
    blit_permits: Mutex<usize>,
    blit_cv: Condvar,
    scaler: Scaler,
}

const MAX_BLITTERS_PER_GRID: usize = 4;

impl Tiler {
    pub fn uniform(cols: u32, rows: u32, width: u32, height: u32, color: ColorFormat) -> Self {
        Self::new(uniform_grid(cols, rows, width, height), width, height, color)
    }

    pub fn explicit(rects: Vec<Rect>, width: u32, height: u32, color: ColorFormat) -> Self {
        let clamped = rects
            .into_iter()
            .map(|r| {
                let r = r.resolve(width as i32, height as i32);
                Rect {
                    x: r.x.clamp(0, width as i32),
                    y: r.y.clamp(0, height as i32),
                    w: r.w.min(width as i32 - r.x.clamp(0, width as i32)),
                    h: r.h.min(height as i32 - r.y.clamp(0, height as i32)),
                }
            })
            .collect();
        Self::new(clamped, width, height, color)
    }

    fn new(rects: Vec<Rect>, width: u32, height: u32, color: ColorFormat) -> Self {
        let n = rects.len();
        Tiler {
            rects,
            width,
            height,
            color,
            buffers: DoubleBuffer {
                canvases: [
                    Mutex::new(Canvas::new(width, height, color)),
                    Mutex::new(Canvas::new(width, height, color)),
                ],
                front: AtomicUsize::new(0),
                locked: Mutex::new(false),
                locked_cv: Condvar::new(),
            },
            round_robin: Mutex::new(0),
            blit_permits: Mutex::new(n * MAX_BLITTERS_PER_GRID),
            blit_cv: Condvar::new(),
            scaler: Scaler::new(0),
        }
    }

    pub fn grid_count(&self) -> usize {
        self.rects.len()
    }

    pub fn rect(&self, position: usize) -> Option<Rect> {
        self.rects.get(position).copied()
    }

    /// Blits `src` into the canvas at `position`, or round-robin from where
    /// the last blit ended if `position` is `None`. Resizes into a
    /// thread-local staging buffer first, then copies the staging buffer
    /// into the canvas, so grid-local resampling never races the global
    /// canvas at a different position.
    pub fn blit(&self, src: &Buffer, position: Option<usize>) -> anyhow::Result<()> {
        {
            let mut permits = self.blit_permits.lock().unwrap();
            anyhow::ensure!(*permits > 0, "too many concurrent blitters");
            *permits -= 1;
        }
        let result = self.blit_inner(src, position);
        {
            let mut permits = self.blit_permits.lock().unwrap();
            *permits += 1;
        }
        self.blit_cv.notify_one();
        result
    }

    fn blit_inner(&self, src: &Buffer, position: Option<usize>) -> anyhow::Result<()> {
        let position = match position {
            Some(p) => p,
            None => {
                let mut rr = self.round_robin.lock().unwrap();
                let p = *rr % self.rects.len().max(1);
                *rr = (p + 1) % self.rects.len().max(1);
                p
            }
        };

        let rect = self
            .rects
            .get(position)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("blit position {position} out of range"))?;

        // Step 1: resize src into a grid-sized staging buffer.
        let mut staging = vec![0u8; canvas_byte_size(rect.w as u32, rect.h as u32, self.color)];
        let stride = if self.color.is_yuv() { rect.w as u32 } else { rect.w as u32 * self.color.bytes_per_pixel() as u32 };
        if !self.scaler.process(
            src,
            &mut staging,
            rect.w as u32,
            rect.h as u32,
            self.color,
            stride,
            None,
            None,
            None,
        ) {
            anyhow::bail!("scaler failed while blitting into grid {position}");
        }

        // Step 2: copy the staging buffer into the canvas at the grid's rect.
        let front = self.buffers.front.load(Ordering::SeqCst);
        let back = 1 - front;
        let mut canvas = self.buffers.canvases[back].lock().unwrap();
        blit_into_canvas(&mut canvas, &staging, rect);
        Ok(())
    }

    /// Returns a snapshot of the frozen canvas. If `freeze` is true, swaps
    /// canvases atomically so the writer paints into the other buffer until
    /// `release_canvas` is called.
    pub fn get_canvas(&self, freeze: bool) -> Canvas {
        if !freeze {
            let front = self.buffers.front.load(Ordering::SeqCst);
            return self.buffers.canvases[front].lock().unwrap().clone();
        }

        let mut locked = self.buffers.locked.lock().unwrap();
        while *locked {
            locked = self.buffers.locked_cv.wait(locked).unwrap();
        }
        *locked = true;
        drop(locked);

        let front = self.buffers.front.load(Ordering::SeqCst);
        let back = 1 - front;

        // `back` holds the latest composited data; `front` is the stale
        // buffer about to become the next write target. Propagate the fresh
        // contents forward into it first, so the next round of blits starts
        // from what was just frozen instead of regressing to older data.
        {
            let fresh = self.buffers.canvases[back].lock().unwrap().clone();
            let mut stale = self.buffers.canvases[front].lock().unwrap();
            if stale.data != fresh.data {
                *stale = fresh;
            }
        }

        self.buffers.front.store(back, Ordering::SeqCst);
        self.buffers.canvases[back].lock().unwrap().clone()
    }

    /// Clears the locked flag taken by a freezing `get_canvas`.
    pub fn release_canvas(&self) {
        let mut locked = self.buffers.locked.lock().unwrap();
        *locked = false;
        drop(locked);
        self.buffers.locked_cv.notify_one();
    }
}

fn blit_into_canvas(canvas: &mut Canvas, staging: &[u8], rect: Rect) {
    if canvas.color.is_yuv() {
        let y_off = rect.y as usize * canvas.stride as usize + rect.x as usize;
        for row in 0..rect.h as usize {
            let src_off = row * rect.w as usize;
            let dst_off = y_off + row * canvas.stride as usize;
            if src_off + rect.w as usize <= staging.len() && dst_off + rect.w as usize <= canvas.data.len() {
                canvas.data[dst_off..dst_off + rect.w as usize]
                    .copy_from_slice(&staging[src_off..src_off + rect.w as usize]);
            }
        }
        // Chroma planes, for I420/NV12/NV21, sit after the luma plane;
        // offset computation mirrors `scaler::copy_owned_into_strided`.
        let luma_size = (canvas.width * canvas.height) as usize;
        if staging.len() > rect.w as usize * rect.h as usize {
            let cw = rect.w as usize / 2;
            let ch = rect.h as usize / 2;
            let canvas_cw = canvas.width as usize / 2;
            let chroma_planes = if canvas.color == ColorFormat::YuvI420 { 2 } else { 1 };
            let mut staging_off = rect.w as usize * rect.h as usize;
            let mut canvas_off = luma_size + (rect.y as usize / 2) * canvas_cw + rect.x as usize / 2;
            let plane_stride = if chroma_planes == 1 { 2 } else { 1 };
            for _ in 0..chroma_planes {
                for row in 0..ch {
                    let src_off = staging_off + row * cw * plane_stride;
                    let dst_off = canvas_off + row * canvas_cw * plane_stride;
                    let n = cw * plane_stride;
                    if src_off + n <= staging.len() && dst_off + n <= canvas.data.len() {
                        canvas.data[dst_off..dst_off + n].copy_from_slice(&staging[src_off..src_off + n]);
                    }
                }
                staging_off += cw * ch * plane_stride;
                canvas_off = luma_size + canvas_cw * (canvas.height as usize / 2) * plane_stride;
            }
        }
    } else {
        let bpp = canvas.color.bytes_per_pixel();
        let row_bytes = rect.w as usize * bpp;
        for row in 0..rect.h as usize {
            let src_off = row * row_bytes;
            let dst_off = (rect.y as usize + row) * canvas.stride as usize + rect.x as usize * bpp;
            if src_off + row_bytes <= staging.len() && dst_off + row_bytes <= canvas.data.len() {
                canvas.data[dst_off..dst_off + row_bytes].copy_from_slice(&staging[src_off..src_off + row_bytes]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiler_uniform_grid() {
        let rects = uniform_grid(3, 2, 10, 4);
        let widths: Vec<i32> = rects.iter().step_by(1).take(3).map(|r| r.w).collect();
        assert_eq!(widths, vec![4, 3, 3]);

        let heights: Vec<i32> = vec![rects[0].h, rects[3].h];
        assert_eq!(heights, vec![2, 2]);
    }

    #[test]
    fn repeated_get_release_with_no_blit_is_stable() {
        let tiler = Tiler::uniform(2, 1, 4, 2, ColorFormat::Bgr);
        let a = tiler.get_canvas(true);
        tiler.release_canvas();
        let b = tiler.get_canvas(true);
        tiler.release_canvas();
        assert_eq!(a.data, b.data);
    }
}
