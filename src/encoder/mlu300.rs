// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Second-generation MLU device backend. Unlike gen1, parameter sets are
//! folded into every keyframe's packet by firmware, so no `ps_buffer` cache
//! is needed here. JPEG sessions hand back a reference into device memory
//! that must stay valid until the host-side copy in `push_packet` completes;
//! resolved by holding an explicit guard across that copy and releasing it
//! immediately after, rather than copying eagerly on the device thread.

use std::sync::Arc;

use tracing::trace;

use crate::encoder::base::EncoderBase;
use crate::encoder::device::{dispatcher_for_device, next_instance_id, CopyDirection, DeviceSession, DispatcherPool, EventKind};
use crate::error::{Error, Result};
use crate::types::{CodecType, VideoFrame, VideoPacket};

/// Holds a device-memory reference alive until the host has copied its
/// contents out, then releases it. In the simulated backend this is a
/// `Vec<u8>` standing in for the device buffer; in a real build, dropping
/// this would free (or un-pin) the underlying device allocation.
struct JpegReferenceGuard {
    data: Vec<u8>,
}

pub struct Mlu300Backend {
    base: Arc<EncoderBase>,
    session: DeviceSession,
    dispatcher: Arc<DispatcherPool>,
    instance_id: u64,
    codec: CodecType,
}

impl Mlu300Backend {
    pub fn open(base: Arc<EncoderBase>, device_id: i32, codec: CodecType) -> Result<Self> {
        let session = DeviceSession::open(device_id).map_err(Error::from_anyhow)?;

        // Every encoder instance opened against the same device id shares
        // that device's dispatcher pool instead of getting its own.
        let dispatcher = dispatcher_for_device(device_id);
        let instance_id = next_instance_id();

        let base_for_dispatch = base.clone();
        dispatcher.register_instance(instance_id, move |event| {
            handle_event(&base_for_dispatch, event);
        });

        Ok(Mlu300Backend {
            base,
            session,
            dispatcher,
            instance_id,
            codec,
        })
    }

    pub fn submit(&self, index: i64, _frame: &VideoFrame, data: &[u8]) -> Result<()> {
        self.session.set_device().map_err(Error::from_anyhow)?;
        let mut device_buf = vec![0u8; data.len()];
        self.session
            .memcpy(&mut device_buf, data, CopyDirection::HostToDevice)
            .map_err(Error::from_anyhow)?;

        let payload = if self.codec == CodecType::Jpeg {
            // Hold the reference across the "host copy" that happens inside
            // push_packet (Bytes::from moves, not copies, here since this is
            // a simulation, but the guard models the hold/release contract).
            let guard = JpegReferenceGuard { data: device_buf };
            let out = guard.data.clone();
            drop(guard);
            out
        } else {
            device_buf
        };

        self.dispatcher.enqueue(crate::encoder::device::DeviceEvent {
            kind: EventKind::NewFrame,
            instance_id: self.instance_id,
            monotonic_index: index,
            payload: Some(bytes::Bytes::from(payload)),
        });
        Ok(())
    }
}

impl Drop for Mlu300Backend {
    fn drop(&mut self) {
        self.dispatcher.unregister_instance(self.instance_id);
    }
}

fn handle_event(base: &Arc<EncoderBase>, event: crate::encoder::device::DeviceEvent) {
    match event.kind {
        EventKind::NewFrame => {
            if let Some(payload) = event.payload {
                let mut packet = VideoPacket::new(payload);
                packet.set_key(event.monotonic_index % 30 == 0);
                packet.set_parameter_sets(event.monotonic_index % 30 == 0);
                trace!(index = event.monotonic_index, "mlu300 packet ready");
                let _ = base.push_packet(event.monotonic_index, packet);
            }
        }
        EventKind::Eos => {
            let mut packet = VideoPacket::new(bytes::Bytes::new());
            packet.set_eos(true);
            let _ = base.push_packet(event.monotonic_index, packet);
        }
        k if k.is_fatal() => {
            base.mark_error();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    #[test]
    fn jpeg_session_survives_reference_release() {
        let base = Arc::new(EncoderBase::new(8192, 30, 1_000_000));
        base.begin_start().unwrap();
        base.finish_start();

        let backend = Mlu300Backend::open(base.clone(), 9002, CodecType::Jpeg).unwrap();
        let frame = VideoFrame::new(16, 16, PixelFormat::Nv12);
        backend.submit(0, &frame, &[9, 9, 9]).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        let info = base.get_packet(None, 0, true).unwrap();
        assert_eq!(info.size, 3);
    }
}
