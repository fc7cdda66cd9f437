// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Concrete carriers the Scaler dispatches to. Each implements the same
//! small trait (`copy`, `convert_color`, `resize`, `convert_and_resize`),
//! standing in for the original's interchangeable OpenCV/libyuv/swscale
//! backends.

use crate::types::ColorFormat;

/// An owned planar image the carriers read from and write into. Unlike
/// `types::Buffer`, this owns its bytes, which keeps the carrier math free
/// of lifetime plumbing; `Scaler::Process` copies in and out of borrowed
/// `Buffer`s at its boundary.
#[derive(Debug, Clone)]
pub struct OwnedImage {
    pub width: u32,
    pub height: u32,
    pub color: ColorFormat,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<u32>,
}

impl OwnedImage {
    pub fn new(width: u32, height: u32, color: ColorFormat) -> Self {
        let (planes, strides) = allocate_planes(width, height, color);
        OwnedImage {
            width,
            height,
            color,
            planes,
            strides,
        }
    }
}

fn allocate_planes(width: u32, height: u32, color: ColorFormat) -> (Vec<Vec<u8>>, Vec<u32>) {
    match color {
        ColorFormat::YuvI420 => {
            let cw = width.div_ceil(2);
            let ch = height.div_ceil(2);
            (
                vec![
                    vec![0u8; (width * height) as usize],
                    vec![0u8; (cw * ch) as usize],
                    vec![0u8; (cw * ch) as usize],
                ],
                vec![width, cw, cw],
            )
        }
        ColorFormat::YuvNv12 | ColorFormat::YuvNv21 => {
            let ch = height.div_ceil(2);
            (
                vec![
                    vec![0u8; (width * height) as usize],
                    vec![0u8; (width * ch) as usize],
                ],
                vec![width, width],
            )
        }
        _ => {
            let bpp = color.bytes_per_pixel() as u32;
            (vec![vec![0u8; (width * height * bpp) as usize]], vec![width * bpp])
        }
    }
}

/// Trait shared by every carrier. `SoftwareGeneric` is the only carrier
/// that implements real pixel math in this crate; `PlanarYuv` and
/// `Swscale` are distinct dispatch targets (matching the spec's three
/// host-side carriers) that currently share that implementation, the way
/// a carrier enum with a common fallback does before a specialist
/// implementation is plugged in.
pub trait Carrier {
    fn copy(&self, src: &OwnedImage, dst: &mut OwnedImage) -> anyhow::Result<()>;
    fn convert_color(&self, src: &OwnedImage, dst_color: ColorFormat) -> anyhow::Result<OwnedImage>;
    fn resize(&self, src: &OwnedImage, width: u32, height: u32) -> anyhow::Result<OwnedImage>;
    fn convert_and_resize(
        &self,
        src: &OwnedImage,
        dst_color: ColorFormat,
        width: u32,
        height: u32,
        convert_first: bool,
    ) -> anyhow::Result<OwnedImage>;
}

pub struct SoftwareGeneric;
pub struct PlanarYuv;
pub struct Swscale;

impl Carrier for SoftwareGeneric {
    fn copy(&self, src: &OwnedImage, dst: &mut OwnedImage) -> anyhow::Result<()> {
        anyhow::ensure!(src.color == dst.color, "copy requires matching color");
        anyhow::ensure!(
            src.width == dst.width && src.height == dst.height,
            "copy requires matching dimensions"
        );
        for (s, d) in src.planes.iter().zip(dst.planes.iter_mut()) {
            d.copy_from_slice(s);
        }
        Ok(())
    }

    fn convert_color(&self, src: &OwnedImage, dst_color: ColorFormat) -> anyhow::Result<OwnedImage> {
        let argb = to_argb(src)?;
        if dst_color == ColorFormat::Argb {
            return Ok(argb);
        }
        from_argb(&argb, dst_color)
    }

    fn resize(&self, src: &OwnedImage, width: u32, height: u32) -> anyhow::Result<OwnedImage> {
        resize_same_color(src, width, height)
    }

    fn convert_and_resize(
        &self,
        src: &OwnedImage,
        dst_color: ColorFormat,
        width: u32,
        height: u32,
        convert_first: bool,
    ) -> anyhow::Result<OwnedImage> {
        if convert_first {
            let converted = self.convert_color(src, dst_color)?;
            self.resize(&converted, width, height)
        } else {
            let resized = self.resize(src, width, height)?;
            self.convert_color(&resized, dst_color)
        }
    }
}

impl Carrier for PlanarYuv {
    fn copy(&self, src: &OwnedImage, dst: &mut OwnedImage) -> anyhow::Result<()> {
        SoftwareGeneric.copy(src, dst)
    }
    fn convert_color(&self, src: &OwnedImage, dst_color: ColorFormat) -> anyhow::Result<OwnedImage> {
        anyhow::ensure!(src.color.is_yuv(), "PlanarYuv carrier requires a YUV source");
        SoftwareGeneric.convert_color(src, dst_color)
    }
    fn resize(&self, src: &OwnedImage, width: u32, height: u32) -> anyhow::Result<OwnedImage> {
        SoftwareGeneric.resize(src, width, height)
    }
    fn convert_and_resize(
        &self,
        src: &OwnedImage,
        dst_color: ColorFormat,
        width: u32,
        height: u32,
        convert_first: bool,
    ) -> anyhow::Result<OwnedImage> {
        SoftwareGeneric.convert_and_resize(src, dst_color, width, height, convert_first)
    }
}

impl Carrier for Swscale {
    fn copy(&self, src: &OwnedImage, dst: &mut OwnedImage) -> anyhow::Result<()> {
        SoftwareGeneric.copy(src, dst)
    }
    fn convert_color(&self, src: &OwnedImage, dst_color: ColorFormat) -> anyhow::Result<OwnedImage> {
        SoftwareGeneric.convert_color(src, dst_color)
    }
    fn resize(&self, src: &OwnedImage, width: u32, height: u32) -> anyhow::Result<OwnedImage> {
        SoftwareGeneric.resize(src, width, height)
    }
    fn convert_and_resize(
        &self,
        src: &OwnedImage,
        dst_color: ColorFormat,
        width: u32,
        height: u32,
        convert_first: bool,
    ) -> anyhow::Result<OwnedImage> {
        SoftwareGeneric.convert_and_resize(src, dst_color, width, height, convert_first)
    }
}

fn resize_same_color(src: &OwnedImage, width: u32, height: u32) -> anyhow::Result<OwnedImage> {
    if src.color.is_yuv() {
        // Resize luma at full res, chroma at half res, per plane.
        let mut dst = OwnedImage::new(width, height, src.color);
        let chroma_planes = src.color.plane_count();
        for p in 0..chroma_planes {
            let (sw, sh, dw, dh) = if p == 0 {
                (src.width, src.height, width, height)
            } else {
                (
                    src.width.div_ceil(2),
                    src.height.div_ceil(2),
                    width.div_ceil(2),
                    height.div_ceil(2),
                )
            };
            bilinear_plane(&src.planes[p], sw, sh, &mut dst.planes[p], dw, dh);
        }
        Ok(dst)
    } else {
        let bpp = src.color.bytes_per_pixel();
        let mut dst = OwnedImage::new(width, height, src.color);
        bilinear_plane_multi(&src.planes[0], src.width, src.height, bpp, &mut dst.planes[0], width, height);
        Ok(dst)
    }
}

fn bilinear_plane(src: &[u8], sw: u32, sh: u32, dst: &mut [u8], dw: u32, dh: u32) {
    bilinear_plane_multi(src, sw, sh, 1, dst, dw, dh)
}

fn bilinear_plane_multi(src: &[u8], sw: u32, sh: u32, bpp: usize, dst: &mut [u8], dw: u32, dh: u32) {
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return;
    }
    let x_ratio = sw as f64 / dw as f64;
    let y_ratio = sh as f64 / dh as f64;

    for y in 0..dh {
        let sy = ((y as f64 + 0.5) * y_ratio - 0.5).clamp(0.0, (sh - 1) as f64);
        let y0 = sy.floor() as u32;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = sy - y0 as f64;

        for x in 0..dw {
            let sx = ((x as f64 + 0.5) * x_ratio - 0.5).clamp(0.0, (sw - 1) as f64);
            let x0 = sx.floor() as u32;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = sx - x0 as f64;

            for c in 0..bpp {
                let p = |xx: u32, yy: u32| -> f64 {
                    src[((yy * sw + xx) as usize * bpp) + c] as f64
                };
                let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
                let bot = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
                let v = top * (1.0 - fy) + bot * fy;
                dst[((y * dw + x) as usize * bpp) + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Converts any supported source format to packed ARGB8888, the canonical
/// intermediate for non-trivial color+size changes.
fn to_argb(src: &OwnedImage) -> anyhow::Result<OwnedImage> {
    let mut dst = OwnedImage::new(src.width, src.height, ColorFormat::Argb);
    let w = src.width as usize;
    let h = src.height as usize;

    match src.color {
        ColorFormat::YuvI420 | ColorFormat::YuvNv12 | ColorFormat::YuvNv21 => {
            let y_plane = &src.planes[0];
            let y_stride = src.strides[0] as usize;
            for yy in 0..h {
                for xx in 0..w {
                    let y = y_plane[yy * y_stride + xx] as f64;
                    let (u, v) = sample_chroma(src, xx, yy);
                    let (r, g, b) = yuv_to_rgb(y, u, v);
                    let off = (yy * w + xx) * 4;
                    dst.planes[0][off] = 255;
                    dst.planes[0][off + 1] = r;
                    dst.planes[0][off + 2] = g;
                    dst.planes[0][off + 3] = b;
                }
            }
        }
        ColorFormat::Bgr | ColorFormat::Rgb | ColorFormat::Bgra | ColorFormat::Rgba
        | ColorFormat::Abgr | ColorFormat::Argb => {
            let bpp = src.color.bytes_per_pixel();
            let stride = src.strides[0] as usize;
            for yy in 0..h {
                for xx in 0..w {
                    let px = &src.planes[0][yy * stride + xx * bpp..][..bpp];
                    let (a, r, g, b) = unpack_rgb(src.color, px);
                    let off = (yy * w + xx) * 4;
                    dst.planes[0][off] = a;
                    dst.planes[0][off + 1] = r;
                    dst.planes[0][off + 2] = g;
                    dst.planes[0][off + 3] = b;
                }
            }
        }
    }

    Ok(dst)
}

fn from_argb(argb: &OwnedImage, dst_color: ColorFormat) -> anyhow::Result<OwnedImage> {
    let w = argb.width as usize;
    let h = argb.height as usize;
    let mut dst = OwnedImage::new(argb.width, argb.height, dst_color);

    if dst_color.is_yuv() {
        for yy in 0..h {
            for xx in 0..w {
                let off = (yy * w + xx) * 4;
                let r = argb.planes[0][off + 1] as f64;
                let g = argb.planes[0][off + 2] as f64;
                let b = argb.planes[0][off + 3] as f64;
                let (y, u, v) = rgb_to_yuv(r, g, b);
                dst.planes[0][yy * dst.strides[0] as usize + xx] = y;
                write_chroma(&mut dst, xx, yy, u, v);
            }
        }
    } else {
        let bpp = dst_color.bytes_per_pixel();
        for yy in 0..h {
            for xx in 0..w {
                let off_src = (yy * w + xx) * 4;
                let (a, r, g, b) = (
                    argb.planes[0][off_src],
                    argb.planes[0][off_src + 1],
                    argb.planes[0][off_src + 2],
                    argb.planes[0][off_src + 3],
                );
                let px = pack_rgb(dst_color, a, r, g, b);
                let off_dst = yy * dst.strides[0] as usize + xx * bpp;
                dst.planes[0][off_dst..off_dst + bpp].copy_from_slice(&px[..bpp]);
            }
        }
    }

    Ok(dst)
}

fn sample_chroma(src: &OwnedImage, x: usize, y: usize) -> (f64, f64) {
    let cx = x / 2;
    let cy = y / 2;
    match src.color {
        ColorFormat::YuvI420 => {
            let cstride = src.strides[1] as usize;
            let u = src.planes[1][cy * cstride + cx] as f64;
            let v = src.planes[2][cy * cstride + cx] as f64;
            (u, v)
        }
        ColorFormat::YuvNv12 => {
            let cstride = src.strides[1] as usize;
            let off = cy * cstride + cx * 2;
            (src.planes[1][off] as f64, src.planes[1][off + 1] as f64)
        }
        ColorFormat::YuvNv21 => {
            let cstride = src.strides[1] as usize;
            let off = cy * cstride + cx * 2;
            (src.planes[1][off + 1] as f64, src.planes[1][off] as f64)
        }
        _ => (128.0, 128.0),
    }
}

fn write_chroma(dst: &mut OwnedImage, x: usize, y: usize, u: u8, v: u8) {
    if x % 2 != 0 || y % 2 != 0 {
        return;
    }
    let cx = x / 2;
    let cy = y / 2;
    match dst.color {
        ColorFormat::YuvI420 => {
            let cstride = dst.strides[1] as usize;
            dst.planes[1][cy * cstride + cx] = u;
            dst.planes[2][cy * cstride + cx] = v;
        }
        ColorFormat::YuvNv12 => {
            let cstride = dst.strides[1] as usize;
            let off = cy * cstride + cx * 2;
            dst.planes[1][off] = u;
            dst.planes[1][off + 1] = v;
        }
        ColorFormat::YuvNv21 => {
            let cstride = dst.strides[1] as usize;
            let off = cy * cstride + cx * 2;
            dst.planes[1][off] = v;
            dst.planes[1][off + 1] = u;
        }
        _ => {}
    }
}

fn yuv_to_rgb(y: f64, u: f64, v: f64) -> (u8, u8, u8) {
    let c = y - 16.0;
    let d = u - 128.0;
    let e = v - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    (clamp8(r), clamp8(g), clamp8(b))
}

fn rgb_to_yuv(r: f64, g: f64, b: f64) -> (u8, u8, u8) {
    let y = 16.0 + 0.257 * r + 0.504 * g + 0.098 * b;
    let u = 128.0 - 0.148 * r - 0.291 * g + 0.439 * b;
    let v = 128.0 + 0.439 * r - 0.368 * g - 0.071 * b;
    (clamp8(y), clamp8(u), clamp8(v))
}

fn clamp8(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn unpack_rgb(color: ColorFormat, px: &[u8]) -> (u8, u8, u8, u8) {
    match color {
        ColorFormat::Bgr => (255, px[2], px[1], px[0]),
        ColorFormat::Rgb => (255, px[0], px[1], px[2]),
        ColorFormat::Bgra => (px[3], px[2], px[1], px[0]),
        ColorFormat::Rgba => (px[3], px[0], px[1], px[2]),
        ColorFormat::Abgr => (px[0], px[3], px[2], px[1]),
        ColorFormat::Argb => (px[0], px[1], px[2], px[3]),
        _ => unreachable!("unpack_rgb called on non-packed format"),
    }
}

fn pack_rgb(color: ColorFormat, a: u8, r: u8, g: u8, b: u8) -> [u8; 4] {
    match color {
        ColorFormat::Bgr | ColorFormat::Bgra => [b, g, r, a],
        ColorFormat::Rgb | ColorFormat::Rgba => [r, g, b, a],
        ColorFormat::Abgr => [a, b, g, r],
        ColorFormat::Argb => [a, r, g, b],
        _ => unreachable!("pack_rgb called on non-packed format"),
    }
}
