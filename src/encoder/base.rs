// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! State machine + output-buffer owner + packet fragmentation/probing logic
//! shared by all backends. This is the "shared helper struct, composed not
//! inherited" the design notes call for in place of an encoder class
//! hierarchy.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap as FastMap;
use lazy_static::lazy_static;
use tracing::{debug, trace};

lazy_static! {
    static ref CLOCK_START: Instant = Instant::now();
}

fn monotonic_micros() -> i64 {
    CLOCK_START.elapsed().as_micros() as i64
}

use crate::error::{Error, Result};
use crate::ring::CircularBuffer;
use crate::sync::RwMutex;
use crate::types::{EncodingInfo, VideoPacket};

/// Lifecycle of an encoder instance. Transitions are guarded by the write
/// side of `EncoderBase::state_lock`; `GetPacket` only needs the read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Info returned alongside a packet by a non-consuming probe, or after a
/// full `GetPacket` copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketInfo {
    pub size: usize,
    pub pts: i64,
    pub dts: i64,
    pub flags: u32,
    pub user_data: u64,
}

/// A packet that didn't fit in the caller's buffer on a previous
/// `GetPacket` call; subsequent calls drain this before touching the ring.
struct TruncatedPacket {
    packet: VideoPacket,
    info: PacketInfo,
    offset: usize,
}

struct RingState {
    ring: CircularBuffer,
    truncated: Option<TruncatedPacket>,
}

/// Shared state every backend pushes completed packets into and every
/// `GetPacket` caller reads from.
pub struct EncoderBase {
    state_lock: Arc<RwMutex>,
    state: Mutex<EncoderState>,

    ring: Mutex<RingState>,
    ring_cv: Condvar,

    encoding_info: Mutex<FastMap<i64, EncodingInfo>>,
    next_index: Mutex<i64>,
    packet_count: Mutex<i64>,

    eos_sent: Mutex<bool>,
    error: std::sync::atomic::AtomicBool,

    frame_rate: u32,
    time_base: u32,
}

impl EncoderBase {
    pub fn new(ring_capacity: usize, frame_rate: u32, time_base: u32) -> Self {
        EncoderBase {
            state_lock: RwMutex::new(),
            state: Mutex::new(EncoderState::Idle),
            ring: Mutex::new(RingState {
                ring: CircularBuffer::new(ring_capacity),
                truncated: None,
            }),
            ring_cv: Condvar::new(),
            encoding_info: Mutex::new(FastMap::new()),
            next_index: Mutex::new(0),
            packet_count: Mutex::new(0),
            eos_sent: Mutex::new(false),
            error: std::sync::atomic::AtomicBool::new(false),
            frame_rate,
            time_base,
        }
    }

    pub fn state(&self) -> EncoderState {
        *self.state.lock().unwrap()
    }

    pub fn mark_error(&self) {
        self.error.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Drives `Idle -> Starting -> Running`. Double-start returns
    /// `ERROR_STATE`.
    pub fn begin_start(&self) -> Result<()> {
        let _g = self.state_lock.write_guard();
        let mut st = self.state.lock().unwrap();
        if *st != EncoderState::Idle {
            return Err(Error::state("Start called while not Idle"));
        }
        *st = EncoderState::Starting;
        Ok(())
    }

    pub fn finish_start(&self) {
        let _g = self.state_lock.write_guard();
        *self.state.lock().unwrap() = EncoderState::Running;
        debug!("encoder running");
    }

    /// Drives `Running -> Stopping -> Idle`. Double-stop returns
    /// `ERROR_STATE`.
    pub fn begin_stop(&self) -> Result<()> {
        let _g = self.state_lock.write_guard();
        let mut st = self.state.lock().unwrap();
        if *st != EncoderState::Running {
            return Err(Error::state("Stop called while not Running"));
        }
        *st = EncoderState::Stopping;
        Ok(())
    }

    pub fn finish_stop(&self) {
        let _g = self.state_lock.write_guard();
        *self.state.lock().unwrap() = EncoderState::Idle;
        *self.eos_sent.lock().unwrap() = false;
        self.error.store(false, std::sync::atomic::Ordering::SeqCst);
        let mut ring = self.ring.lock().unwrap();
        ring.truncated = None;
        self.encoding_info.lock().unwrap().clear();
        *self.next_index.lock().unwrap() = 0;
        *self.packet_count.lock().unwrap() = 0;
        debug!("encoder stopped");
    }

    /// `SendFrame` is only legal while Running, or while Stopping for a
    /// trailing EOS-without-data.
    pub fn check_send_allowed(&self, is_eos_without_data: bool) -> Result<()> {
        let _g = self.state_lock.read_guard();
        match self.state() {
            EncoderState::Running => Ok(()),
            EncoderState::Stopping if is_eos_without_data => Ok(()),
            _ => Err(Error::state("SendFrame called in invalid state")),
        }
    }

    pub fn check_eos_not_yet_sent(&self) -> Result<()> {
        if *self.eos_sent.lock().unwrap() {
            return Err(Error::failed("SendFrame called after EOS"));
        }
        Ok(())
    }

    pub fn mark_eos_sent(&self) {
        *self.eos_sent.lock().unwrap() = true;
    }

    /// Allocates the next monotonic submission index and records its
    /// provisional encoding info.
    pub fn begin_submission(&self, pts: i64, dts: i64, user_data: u64) -> i64 {
        let mut next = self.next_index.lock().unwrap();
        let index = *next;
        *next += 1;
        drop(next);

        let now = monotonic_micros();
        self.encoding_info.lock().unwrap().insert(
            index,
            EncodingInfo {
                pts,
                dts,
                submit_tick: now,
                complete_tick: 0,
                user_data,
            },
        );
        index
    }

    /// Called from a backend's packet callback. Looks the submission up by
    /// index, rewrites pts/dts from the original (synthesizing dts when the
    /// original is invalid), and pushes an `IndexedVideoPacket` to the ring,
    /// blocking on backpressure while `capacity - size < required`.
    pub fn push_packet(&self, index: i64, mut packet: VideoPacket) -> Result<()> {
        let info = {
            let mut map = self.encoding_info.lock().unwrap();
            map.get_mut(&index).map(|e| {
                e.complete_tick = monotonic_micros();
                *e
            })
        };

        if let Some(info) = info {
            packet.pts = info.pts;
            packet.dts = if info.dts != crate::types::INVALID_TIMESTAMP {
                info.dts
            } else {
                let count = self.packet_count.lock().unwrap();
                (*count - 2) * self.time_base as i64 / self.frame_rate.max(1) as i64
            };
            packet.user_data = info.user_data;
        }

        *self.packet_count.lock().unwrap() += 1;

        let wire = encode_wire_packet(index, &packet);
        let required = wire.len();

        let mut ring = self.ring.lock().unwrap();
        loop {
            if self.state() != EncoderState::Running && self.state() != EncoderState::Stopping {
                return Err(Error::state("push_packet while not running"));
            }
            let capacity = ring.ring.capacity();
            if capacity - ring.ring.size() >= required {
                break;
            }
            ring = self.ring_cv.wait(ring).unwrap();
        }

        ring.ring.write(&wire);
        drop(ring);
        trace!(index, size = packet.size(), "packet pushed");
        Ok(())
    }

    /// `packet == None` skips one packet, returning bytes discarded.
    /// `probe == true` inspects without consuming. Otherwise copies up to
    /// `max_len` bytes (the caller's explicit "how much do you want",
    /// independent of `out`'s current capacity) into `out`, caching any
    /// remainder in the truncated-packet slot for the next call.
    pub fn get_packet(&self, out: Option<&mut Vec<u8>>, max_len: usize, probe: bool) -> Result<PacketInfo> {
        let mut ring = self.ring.lock().unwrap();

        if let Some(trunc) = ring.truncated.take() {
            return self.serve_truncated(&mut ring, trunc, out, max_len, probe);
        }

        let Some((index, packet, header_len)) = peek_next_packet(&mut ring.ring) else {
            return Err(Error::Timeout);
        };
        let _ = index;

        let info = PacketInfo {
            size: packet.size(),
            pts: packet.pts,
            dts: packet.dts,
            flags: packet.raw_flags(),
            user_data: packet.user_data,
        };

        if probe {
            return Ok(info);
        }

        if out.is_none() {
            // skip: discard the whole wire-format record.
            let total = header_len + packet.size();
            ring.ring.skip(total);
            self.ring_cv.notify_one();
            return Ok(info);
        }

        let out = out.unwrap();
        ring.ring.skip(header_len);
        let want = max_len.min(packet.size());

        let mut buf = vec![0u8; packet.size()];
        ring.ring.read_exact_into(&mut buf, false);
        out.clear();
        out.extend_from_slice(&buf[..want]);
        self.ring_cv.notify_one();

        if want < packet.size() {
            ring.truncated = Some(TruncatedPacket {
                packet,
                info,
                offset: want,
            });
        }

        Ok(info)
    }

    fn serve_truncated(
        &self,
        ring: &mut RingState,
        mut trunc: TruncatedPacket,
        out: Option<&mut Vec<u8>>,
        max_len: usize,
        probe: bool,
    ) -> Result<PacketInfo> {
        let remaining = trunc.packet.size() - trunc.offset;
        let info = trunc.info;

        if probe {
            ring.truncated = Some(trunc);
            return Ok(info);
        }

        let Some(out) = out else {
            // skip: drop the remainder of the cached packet.
            return Ok(info);
        };

        let want = max_len.min(remaining);
        out.clear();
        out.extend_from_slice(&trunc.packet.data[trunc.offset..trunc.offset + want]);

        if want < remaining {
            trunc.offset += want;
            ring.truncated = Some(trunc);
        }

        Ok(info)
    }
}

/// Serializes `[index:i64][flags:u32][pts:i64][dts:i64][user_data:u64][size:u64][payload]`.
fn encode_wire_packet(index: i64, packet: &VideoPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 4 + 8 + 8 + 8 + 8 + packet.size());
    buf.write_i64::<LittleEndian>(index).unwrap();
    buf.write_u32::<LittleEndian>(packet.raw_flags()).unwrap();
    buf.write_i64::<LittleEndian>(packet.pts).unwrap();
    buf.write_i64::<LittleEndian>(packet.dts).unwrap();
    buf.write_u64::<LittleEndian>(packet.user_data).unwrap();
    buf.write_u64::<LittleEndian>(packet.size() as u64).unwrap();
    buf.extend_from_slice(&packet.data);
    buf
}

const WIRE_HEADER_LEN: usize = 8 + 4 + 8 + 8 + 8 + 8;

fn peek_next_packet(ring: &mut CircularBuffer) -> Option<(i64, VideoPacket, usize)> {
    if ring.size() < WIRE_HEADER_LEN {
        return None;
    }
    let mut header = [0u8; WIRE_HEADER_LEN];
    ring.read_exact_into(&mut header, true);

    let mut cursor = &header[..];
    let index = cursor.read_i64::<LittleEndian>().unwrap();
    let flags = cursor.read_u32::<LittleEndian>().unwrap();
    let pts = cursor.read_i64::<LittleEndian>().unwrap();
    let dts = cursor.read_i64::<LittleEndian>().unwrap();
    let user_data = cursor.read_u64::<LittleEndian>().unwrap();
    let size = cursor.read_u64::<LittleEndian>().unwrap() as usize;

    if ring.size() < WIRE_HEADER_LEN + size {
        return None;
    }

    let mut full = vec![0u8; WIRE_HEADER_LEN + size];
    ring.read_exact_into(&mut full, true);
    let payload = bytes::Bytes::copy_from_slice(&full[WIRE_HEADER_LEN..]);

    let mut packet = VideoPacket::new(payload);
    packet.pts = pts;
    packet.dts = dts;
    packet.user_data = user_data;
    // Flags setters only expose named bits; restore the raw word directly
    // via the EOS/KEY/PS setters so the private field stays encapsulated.
    packet.set_eos(flags & 0x1 != 0);
    packet.set_key(flags & 0x2 != 0);
    packet.set_parameter_sets(flags & 0x4 != 0);

    Some((index, packet, WIRE_HEADER_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VideoPacket;

    #[test]
    fn push_then_probe_then_consume() {
        let base = EncoderBase::new(4096, 30, 1_000_000);
        base.begin_start().unwrap();
        base.finish_start();

        let idx = base.begin_submission(1000, crate::types::INVALID_TIMESTAMP, 0);
        let mut pkt = VideoPacket::new(bytes::Bytes::from_static(b"hello"));
        pkt.set_key(true);
        base.push_packet(idx, pkt).unwrap();

        let mut out = Vec::new();
        let info = base.get_packet(None, 0, true).unwrap();
        assert_eq!(info.pts, 1000);
        assert_eq!(info.size, 5);

        let info2 = base.get_packet(Some(&mut out), info.size, false).unwrap();
        assert_eq!(info2.pts, 1000);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn truncated_packet_drains_across_calls() {
        let base = EncoderBase::new(4096, 30, 1_000_000);
        base.begin_start().unwrap();
        base.finish_start();

        let idx = base.begin_submission(2000, crate::types::INVALID_TIMESTAMP, 0);
        let pkt = VideoPacket::new(bytes::Bytes::from_static(b"0123456789"));
        base.push_packet(idx, pkt).unwrap();

        let mut first = Vec::new();
        base.get_packet(Some(&mut first), 4, false).unwrap();
        assert_eq!(first, b"0123");

        let mut second = Vec::new();
        base.get_packet(Some(&mut second), 4, false).unwrap();
        assert_eq!(second, b"4567");

        let mut third = Vec::new();
        base.get_packet(Some(&mut third), 4, false).unwrap();
        assert_eq!(third, b"89");
    }
}
