// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! First-generation MLU device backend. Parameter sets (SPS/PPS/VPS) arrive
//! as a separate callback ahead of the first keyframe and must be cached and
//! re-emitted with every subsequent keyframe's packet, since gen1 firmware
//! does not repeat them inline.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::encoder::base::EncoderBase;
use crate::encoder::device::{dispatcher_for_device, next_instance_id, CopyDirection, DeviceSession, DispatcherPool, EventKind};
use crate::error::{Error, Result};
use crate::types::{CodecType, VideoFrame, VideoPacket};

pub struct Mlu200Backend {
    base: Arc<EncoderBase>,
    session: DeviceSession,
    dispatcher: Arc<DispatcherPool>,
    instance_id: u64,
    codec: CodecType,
    ps_buffer: Mutex<Option<bytes::Bytes>>,
}

impl Mlu200Backend {
    pub fn open(base: Arc<EncoderBase>, device_id: i32, codec: CodecType) -> Result<Self> {
        let session = DeviceSession::open(device_id).map_err(Error::from_anyhow)?;

        // Every encoder instance opened against the same device id shares
        // that device's dispatcher pool instead of getting its own.
        let dispatcher = dispatcher_for_device(device_id);
        let instance_id = next_instance_id();

        let base_for_dispatch = base.clone();
        let ps_buffer: Arc<Mutex<Option<bytes::Bytes>>> = Arc::new(Mutex::new(None));
        let ps_for_dispatch = ps_buffer.clone();
        dispatcher.register_instance(instance_id, move |event| {
            handle_event(&base_for_dispatch, &ps_for_dispatch, event);
        });

        Ok(Mlu200Backend {
            base,
            session,
            dispatcher,
            instance_id,
            codec,
            ps_buffer: Mutex::new(None),
        })
    }

    /// Copies `frame` into device memory and hands it to the (simulated)
    /// hardware codec, which will later raise a `NewFrame` event consumed by
    /// the dispatcher pool rather than returning the packet synchronously.
    pub fn submit(&self, index: i64, frame: &VideoFrame, data: &[u8]) -> Result<()> {
        self.session.set_device().map_err(Error::from_anyhow)?;
        let mut device_buf = vec![0u8; data.len()];
        self.session
            .memcpy(&mut device_buf, data, CopyDirection::HostToDevice)
            .map_err(Error::from_anyhow)?;

        // Real hardware would raise the completion event asynchronously from
        // an interrupt thread; the simulated encode emits it immediately.
        let is_keyframe = frame.buffer_index() == 0 || index % 30 == 0;
        let mut payload = Vec::new();
        if is_keyframe && self.codec != CodecType::Jpeg {
            if let Some(ps) = self.ps_buffer.lock().unwrap().clone() {
                payload.extend_from_slice(&ps);
            }
        }
        payload.extend_from_slice(&device_buf);

        self.dispatcher.enqueue(crate::encoder::device::DeviceEvent {
            kind: EventKind::NewFrame,
            instance_id: self.instance_id,
            monotonic_index: index,
            payload: Some(bytes::Bytes::from(payload)),
        });
        Ok(())
    }

    /// Caches parameter sets emitted ahead of the stream's first keyframe.
    pub fn set_parameter_sets(&self, ps: bytes::Bytes) {
        *self.ps_buffer.lock().unwrap() = Some(ps);
    }
}

impl Drop for Mlu200Backend {
    fn drop(&mut self) {
        self.dispatcher.unregister_instance(self.instance_id);
    }
}

fn handle_event(
    base: &Arc<EncoderBase>,
    _ps_buffer: &Arc<Mutex<Option<bytes::Bytes>>>,
    event: crate::encoder::device::DeviceEvent,
) {
    match event.kind {
        EventKind::NewFrame => {
            if let Some(payload) = event.payload {
                let mut packet = VideoPacket::new(payload);
                packet.set_key(event.monotonic_index % 30 == 0);
                trace!(index = event.monotonic_index, "mlu200 packet ready");
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
    fn keyframe_carries_cached_parameter_sets() {
        let base = Arc::new(EncoderBase::new(8192, 30, 1_000_000));
        base.begin_start().unwrap();
        base.finish_start();

        let backend = Mlu200Backend::open(base.clone(), 9001, CodecType::H264).unwrap();
        backend.set_parameter_sets(bytes::Bytes::from_static(b"SPSPPS"));

        let frame = VideoFrame::new(16, 16, PixelFormat::Nv12);
        backend.submit(0, &frame, &[1, 2, 3, 4]).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        let info = base.get_packet(None, 0, true).unwrap();
        assert!(info.size >= 6);
    }
}
