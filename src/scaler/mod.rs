// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Color-space conversion + resize + crop for buffers in host or device
//! memory, dispatching to one of several carriers.

pub mod carriers;

use std::sync::{Condvar, Mutex};

use crate::types::{Buffer, ColorFormat, Rect};
use carriers::{Carrier, OwnedImage, PlanarYuv, Swscale, SoftwareGeneric};

/// Which concrete carrier executes a `Process` call. `None` lets the
/// Scaler pick automatically based on source/destination memory location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierKind {
    SoftwareGeneric,
    PlanarYuv,
    Swscale,
    Device,
}

/// Tracks how many of a device's (at most two) resize contexts are
/// occupied, per the hardware concurrency constraint in the device path.
struct DeviceOccupancy {
    /// bit i set => slot i in use.
    occupied: Mutex<u8>,
    cv: Condvar,
}

impl DeviceOccupancy {
    fn new() -> Self {
        DeviceOccupancy {
            occupied: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a slot is free, claims it, and returns its index.
    fn claim(&self) -> u8 {
        let mut bits = self.occupied.lock().unwrap();
        loop {
            for slot in 0..2u8 {
                if *bits & (1 << slot) == 0 {
                    *bits |= 1 << slot;
                    return slot;
                }
            }
            bits = self.cv.wait(bits).unwrap();
        }
    }

    fn release(&self, slot: u8) {
        let mut bits = self.occupied.lock().unwrap();
        *bits &= !(1 << slot);
        drop(bits);
        self.cv.notify_one();
    }
}

/// Per-device-id occupancy table. In a full deployment this would be keyed
/// by the device session registry (see `encoder::device`); here it's
/// sized generously and indexed directly by device id.
pub struct Scaler {
    device_slots: Vec<DeviceOccupancy>,
}

impl Scaler {
    pub fn new(max_devices: usize) -> Self {
        let mut device_slots = Vec::with_capacity(max_devices);
        for _ in 0..max_devices {
            device_slots.push(DeviceOccupancy::new());
        }
        Scaler { device_slots }
    }

    /// Converts/resizes/crops `src` into `dst`. Both buffers must be on the
    /// same side of the host/device boundary; mixing fails. Returns `false`
    /// on any failure, with no partial writes to `dst`.
    pub fn process(
        &self,
        src: &Buffer,
        dst: &mut [u8],
        dst_width: u32,
        dst_height: u32,
        dst_color: ColorFormat,
        dst_stride: u32,
        src_crop: Option<Rect>,
        dst_crop: Option<Rect>,
        carrier: Option<CarrierKind>,
    ) -> bool {
        match self.try_process(
            src, dst, dst_width, dst_height, dst_color, dst_stride, src_crop, dst_crop, carrier,
        ) {
            Ok(()) => true,
            Err(_) => false,
        }
    }

    fn try_process(
        &self,
        src: &Buffer,
        dst: &mut [u8],
        dst_width: u32,
        dst_height: u32,
        dst_color: ColorFormat,
        dst_stride: u32,
        src_crop: Option<Rect>,
        dst_crop: Option<Rect>,
        carrier: Option<CarrierKind>,
    ) -> anyhow::Result<()> {
        let src_is_host = src.is_host();

        if src_is_host {
            anyhow::ensure!(
                !matches!(carrier, Some(CarrierKind::Device)),
                "device carrier requires device memory"
            );
            self.process_host(src, dst, dst_width, dst_height, dst_color, dst_stride, src_crop, carrier)
        } else {
            anyhow::ensure!(dst_crop.is_none(), "device path does not support destination crop");
            anyhow::ensure!(
                matches!(dst_color, ColorFormat::YuvNv12 | ColorFormat::YuvNv21),
                "device path only supports NV12/NV21"
            );
            self.process_device(src, dst, dst_width, dst_height, dst_color, src_crop)
        }
    }

    fn process_host(
        &self,
        src: &Buffer,
        dst: &mut [u8],
        dst_width: u32,
        dst_height: u32,
        dst_color: ColorFormat,
        dst_stride: u32,
        src_crop: Option<Rect>,
        carrier: Option<CarrierKind>,
    ) -> anyhow::Result<()> {
        let cropped = self.crop_view(src, src_crop)?;

        let same =
            cropped.color == dst_color && cropped.width == dst_width && cropped.height == dst_height;

        let carrier_impl: Box<dyn Carrier> = match carrier {
            Some(CarrierKind::PlanarYuv) => Box::new(PlanarYuv),
            Some(CarrierKind::Swscale) => Box::new(Swscale),
            Some(CarrierKind::SoftwareGeneric) | None => Box::new(SoftwareGeneric),
            Some(CarrierKind::Device) => unreachable!("filtered above"),
        };

        let result = if same {
            // Plane-wise memcpy respecting strides; the canonical fast path.
            let mut out = OwnedImage::new(dst_width, dst_height, dst_color);
            carrier_impl.copy(&cropped, &mut out)?;
            out
        } else {
            // convert-then-resize when destination is larger or either
            // dimension is odd (avoids chroma subsampling artifacts on
            // upsizing); resize-then-convert otherwise.
            let upsizing = dst_width > cropped.width || dst_height > cropped.height;
            let odd = dst_width % 2 != 0 || dst_height % 2 != 0;
            let convert_first = upsizing || odd;
            carrier_impl.convert_and_resize(&cropped, dst_color, dst_width, dst_height, convert_first)?
        };

        copy_owned_into_strided(&result, dst, dst_stride);
        Ok(())
    }

    fn process_device(
        &self,
        src: &Buffer,
        dst: &mut [u8],
        dst_width: u32,
        dst_height: u32,
        dst_color: ColorFormat,
        src_crop: Option<Rect>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(src.color, ColorFormat::YuvNv12 | ColorFormat::YuvNv21),
            "device path only supports NV12/NV21 sources"
        );
        anyhow::ensure!(src.device_id >= 0, "device path requires a device-resident source");

        let idx = src.device_id as usize;
        anyhow::ensure!(idx < self.device_slots.len(), "device id out of range");

        let slot = self.device_slots[idx].claim();
        let result = (|| -> anyhow::Result<()> {
            let cropped = self.crop_view(src, src_crop)?;
            let resized = SoftwareGeneric.resize(&cropped, dst_width, dst_height)?;
            let out = if resized.color == dst_color {
                resized
            } else {
                SoftwareGeneric.convert_color(&resized, dst_color)?
            };
            copy_owned_into_strided(&out, dst, out.strides[0]);
            Ok(())
        })();
        self.device_slots[idx].release(slot);
        result
    }

    /// Produces a view over `src` restricted to `crop`, the way
    /// `GetCropBuffer` does: plane pointers advanced by `y*stride + x*bpp`,
    /// with chroma offsets at half vertical resolution for YUV, and the
    /// resulting width/height forced even.
    pub fn get_crop_buffer<'a>(&self, src: &Buffer<'a>, crop: Option<Rect>) -> anyhow::Result<Buffer<'a>> {
        let Some(crop) = crop else {
            return Ok(src.clone());
        };

        let rect = if src.color.is_yuv() {
            crop.round_down_to_even()
        } else {
            crop
        };
        let rect = rect.resolve(src.width as i32, src.height as i32);

        anyhow::ensure!(
            rect.x >= 0
                && rect.y >= 0
                && rect.x + rect.w <= src.width as i32
                && rect.y + rect.h <= src.height as i32,
            "crop rectangle out of bounds"
        );

        let strides = src.normalized_strides();
        let mut data = [None, None, None];
        for p in 0..src.color.plane_count() {
            if let Some(plane) = src.data[p] {
                let (px, py) = if p == 0 {
                    (rect.x as u32, rect.y as u32)
                } else {
                    (rect.x as u32 / 2, rect.y as u32 / 2)
                };
                let bpp = if src.color.is_yuv() { 1 } else { src.color.bytes_per_pixel() as u32 };
                let offset = (py * strides[p] + px * bpp) as usize;
                data[p] = plane.get(offset..);
            }
        }

        Ok(Buffer {
            width: rect.w as u32,
            height: rect.h as u32,
            data,
            stride: strides,
            color: src.color,
            device_id: src.device_id,
        })
    }

    fn crop_view(&self, src: &Buffer, crop: Option<Rect>) -> anyhow::Result<OwnedImage> {
        let cropped = self.get_crop_buffer(src, crop)?;
        Ok(buffer_to_owned(&cropped))
    }
}

fn buffer_to_owned(src: &Buffer) -> OwnedImage {
    let mut img = OwnedImage::new(src.width, src.height, src.color);
    let strides = src.normalized_strides();
    for p in 0..src.color.plane_count() {
        if let Some(plane) = src.data[p] {
            let (pw, ph) = plane_dims(src.width, src.height, src.color, p);
            let dst_stride = img.strides[p] as usize;
            for row in 0..ph as usize {
                let src_off = row * strides[p] as usize;
                let dst_off = row * dst_stride;
                let n = (pw as usize * if src.color.is_yuv() { 1 } else { src.color.bytes_per_pixel() }).min(plane.len().saturating_sub(src_off));
                if n > 0 && src_off + n <= plane.len() && dst_off + n <= img.planes[p].len() {
                    img.planes[p][dst_off..dst_off + n].copy_from_slice(&plane[src_off..src_off + n]);
                }
            }
        }
    }
    img
}

fn plane_dims(width: u32, height: u32, color: ColorFormat, plane: usize) -> (u32, u32) {
    if plane == 0 || !color.is_yuv() {
        (width, height)
    } else {
        (width.div_ceil(2), height.div_ceil(2))
    }
}

fn copy_owned_into_strided(img: &OwnedImage, dst: &mut [u8], dst_stride: u32) {
    let row_bytes = if img.color.is_yuv() {
        img.width as usize
    } else {
        img.width as usize * img.color.bytes_per_pixel()
    };
    let stride = if dst_stride == 0 { row_bytes as u32 } else { dst_stride };

    let mut offset = 0usize;
    for (p, plane) in img.planes.iter().enumerate() {
        let (pw, ph) = plane_dims(img.width, img.height, img.color, p);
        let plane_row_bytes = if img.color.is_yuv() { pw as usize } else { pw as usize * img.color.bytes_per_pixel() };
        let plane_stride = if p == 0 { stride as usize } else { (stride as usize).div_ceil(2).max(plane_row_bytes) };
        for row in 0..ph as usize {
            let src_off = row * plane_row_bytes;
            let dst_off = offset + row * plane_stride;
            if dst_off + plane_row_bytes <= dst.len() && src_off + plane_row_bytes <= plane.len() {
                dst[dst_off..dst_off + plane_row_bytes].copy_from_slice(&plane[src_off..src_off + plane_row_bytes]);
            }
        }
        offset += plane_stride * ph as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgb(w: u32, h: u32, value: u8) -> Vec<u8> {
        vec![value; (w * h * 3) as usize]
    }

    #[test]
    fn identity_process_is_memcpy() {
        let scaler = Scaler::new(0);
        let w = 4u32;
        let h = 4u32;
        let data = solid_rgb(w, h, 200);

        let src = Buffer {
            width: w,
            height: h,
            data: [Some(&data), None, None],
            stride: [w * 3, 0, 0],
            color: ColorFormat::Rgb,
            device_id: -1,
        };

        let mut dst = vec![0u8; (w * h * 3) as usize];
        let ok = scaler.process(&src, &mut dst, w, h, ColorFormat::Rgb, w * 3, None, None, None);
        assert!(ok);
        assert_eq!(dst, data);
    }

    #[test]
    fn device_path_rejects_host_source() {
        let scaler = Scaler::new(2);
        let data = solid_rgb(4, 4, 10);
        let src = Buffer {
            width: 4,
            height: 4,
            data: [Some(&data), None, None],
            stride: [12, 0, 0],
            color: ColorFormat::YuvNv12,
            device_id: -1,
        };
        let mut dst = vec![0u8; 64];
        let ok = scaler.process(
            &src,
            &mut dst,
            4,
            4,
            ColorFormat::YuvNv12,
            4,
            None,
            None,
            Some(CarrierKind::Device),
        );
        assert!(!ok);
    }
}
