// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! In-memory perf counter aggregation. Backing storage (a database, a
//! metrics exporter) is the collaborator's concern; this module only owns
//! the `(start, end, thread_id)` triples and their derived statistics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

/// One recorded span, in microseconds.
#[derive(Debug, Clone, Copy)]
struct Span {
    start_us: i64,
    end_us: i64,
    #[allow(dead_code)]
    thread_id: ThreadId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub min_us: i64,
    pub max_us: i64,
    pub avg_us: f64,
    pub frame_count: u64,
    pub fps: f64,
}

#[derive(Default)]
struct Bucket {
    spans: Vec<Span>,
}

/// Keyed perf-counter collector: one bucket of spans per named module.
pub struct Recorder {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, name: &str, start_us: i64, end_us: i64) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.entry(name.to_string()).or_default().spans.push(Span {
            start_us,
            end_us,
            thread_id: std::thread::current().id(),
        });
    }

    /// Aggregates the named bucket's spans into latency/throughput stats.
    /// Returns `None` for an unknown or empty bucket.
    pub fn stats(&self, name: &str) -> Option<Stats> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = buckets.get(name)?;
        if bucket.spans.is_empty() {
            return None;
        }

        let frame_count = bucket.spans.len() as u64;
        let mut min_us = i64::MAX;
        let mut max_us = i64::MIN;
        let mut total: i64 = 0;
        for span in &bucket.spans {
            let dur = span.end_us - span.start_us;
            min_us = min_us.min(dur);
            max_us = max_us.max(dur);
            total += dur;
        }

        let avg_us = total as f64 / frame_count as f64;
        // fps = ceil(frame_count * 1e7 / total) / 10, one decimal of precision.
        let fps = if total > 0 {
            ((frame_count as f64 * 1e7 / total as f64).ceil()) / 10.0
        } else {
            0.0
        };

        Some(Stats {
            min_us,
            max_us,
            avg_us,
            frame_count,
            fps,
        })
    }

    pub fn clear(&self, name: &str) {
        self.buckets.lock().unwrap().remove(name);
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII span: records `(start, now)` against `name` in `recorder` on drop.
pub struct ScopedTimer<'a> {
    recorder: &'a Recorder,
    name: String,
    start_us: i64,
}

impl<'a> ScopedTimer<'a> {
    pub fn start(recorder: &'a Recorder, name: impl Into<String>, now_us: i64) -> Self {
        ScopedTimer {
            recorder,
            name: name.into(),
            start_us: now_us,
        }
    }

    pub fn finish(self, now_us: i64) {
        self.recorder.record(&self.name, self.start_us, now_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_match_spec_formula() {
        let recorder = Recorder::new();
        // Ten 1ms spans back to back: total = 10_000us, frame_count = 10.
        for i in 0..10 {
            recorder.record("encode", i * 1000, i * 1000 + 1000);
        }
        let stats = recorder.stats("encode").unwrap();
        assert_eq!(stats.frame_count, 10);
        assert_eq!(stats.min_us, 1000);
        assert_eq!(stats.max_us, 1000);
        assert_eq!(stats.avg_us, 1000.0);
        // fps = ceil(10 * 1e7 / 10_000) / 10 = ceil(10_000) / 10 = 1000.0
        assert_eq!(stats.fps, 1000.0);
    }

    #[test]
    fn unknown_bucket_returns_none() {
        let recorder = Recorder::new();
        assert!(recorder.stats("nope").is_none());
    }

    #[test]
    fn clear_removes_bucket() {
        let recorder = Recorder::new();
        recorder.record("x", 0, 100);
        assert!(recorder.stats("x").is_some());
        recorder.clear("x");
        assert!(recorder.stats("x").is_none());
    }
}
