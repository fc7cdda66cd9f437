// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! DeepSORT-style multi-object tracker: per-track Kalman filter, cascade
//! matching gated by Mahalanobis distance, IoU fallback matching, and the
//! TENTATIVE/CONFIRMED/DELETED track life-cycle.

pub mod hungarian;
pub mod kalman;

use kalman::KalmanFilter;

use crate::types::Rect;

/// χ²(0.95, df=4), the Mahalanobis gate for the cascade match.
const CHI2_95_DF4: f64 = 9.4877;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

/// One incoming detection for this frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub rect: Rect,
    pub confidence: f64,
    pub feature: Vec<f32>,
}

/// A single tracked object.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u64,
    pub state: TrackState,
    pub age: u32,
    pub hits: u32,
    pub time_since_update: u32,
    pub rect: Rect,
    kalman: KalmanFilter,
    features: Vec<Vec<f32>>,
}

impl Track {
    fn new(detection: &Detection, tentative_id: u64, nn_budget: usize) -> Self {
        let xyah = detection.rect.to_xyah();
        let kalman = KalmanFilter::initiate(xyah);
        let mut features = Vec::with_capacity(nn_budget.min(8));
        if !detection.feature.is_empty() {
            features.push(detection.feature.clone());
        }
        Track {
            track_id: tentative_id,
            state: TrackState::Tentative,
            age: 1,
            hits: 1,
            time_since_update: 0,
            rect: detection.rect,
            kalman,
            features,
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.age += 1;
        self.time_since_update += 1;
        self.rect = Rect::from_xyah(self.kalman.xyah());
    }

    fn update(&mut self, detection: &Detection, nn_budget: usize, n_init: u32, next_id: &mut u64) {
        let xyah = detection.rect.to_xyah();
        self.kalman.update(xyah);
        self.rect = Rect::from_xyah(self.kalman.xyah());

        if !detection.feature.is_empty() {
            self.features.push(detection.feature.clone());
            if self.features.len() > nn_budget {
                self.features.remove(0);
            }
        }

        self.hits += 1;
        self.time_since_update = 0;

        if self.state == TrackState::Tentative && self.age > n_init {
            self.state = TrackState::Confirmed;
            self.track_id = *next_id;
            *next_id += 1;
        }
    }

    fn mark_missed(&mut self, max_age: u32) {
        if self.state == TrackState::Tentative {
            self.state = TrackState::Deleted;
        } else if self.time_since_update > max_age {
            self.state = TrackState::Deleted;
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerParams {
    pub max_cosine_distance: f64,
    pub nn_budget: usize,
    pub max_iou_distance: f64,
    pub max_age: u32,
    pub n_init: u32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        TrackerParams {
            max_cosine_distance: 0.2,
            nn_budget: 100,
            max_iou_distance: 0.7,
            max_age: 30,
            n_init: 3,
        }
    }
}

/// DeepSORT tracker: owns all live tracks and assigns monotonically
/// increasing ids on TENTATIVE -> CONFIRMED transitions.
pub struct Tracker {
    params: TrackerParams,
    tracks: Vec<Track>,
    next_track_id: u64,
}

impl Tracker {
    pub fn new() -> Self {
        Tracker {
            params: TrackerParams::default(),
            tracks: Vec::new(),
            next_track_id: 1,
        }
    }

    pub fn set_params(&mut self, params: TrackerParams) {
        self.params = params;
    }

    pub fn update_frame(&mut self, detections: &[Detection]) -> Vec<Track> {
        for track in &mut self.tracks {
            track.predict();
        }

        let mut unmatched_detections: Vec<usize> = (0..detections.len()).collect();
        let mut matched: Vec<(usize, usize)> = Vec::new(); // (track_index, detection_index)

        // Partition indices into confirmed and the rest.
        let confirmed: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_confirmed())
            .map(|(i, _)| i)
            .collect();
        let unconfirmed: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_confirmed())
            .map(|(i, _)| i)
            .collect();

        // Cascade match: age buckets 0..max_age-1, oldest-unmatched first.
        let mut remaining_tracks: Vec<usize> = confirmed;
        for age in 0..self.params.max_age {
            if unmatched_detections.is_empty() {
                break;
            }
            let (bucket, rest): (Vec<usize>, Vec<usize>) = remaining_tracks
                .into_iter()
                .partition(|&i| self.tracks[i].time_since_update == age + 1);
            remaining_tracks = rest;
            if bucket.is_empty() {
                continue;
            }

            let cost = self.cascade_cost_matrix(&bucket, &unmatched_detections, detections);
            let assignment = hungarian::solve(&cost);

            let mut still_unmatched = Vec::new();
            let mut consumed = vec![false; unmatched_detections.len()];
            for (row, col) in assignment.iter().enumerate() {
                match col {
                    Some(c) if cost[row][*c] <= self.params.max_cosine_distance => {
                        matched.push((bucket[row], unmatched_detections[*c]));
                        consumed[*c] = true;
                    }
                    _ => {}
                }
            }
            for (i, &d) in unmatched_detections.iter().enumerate() {
                if !consumed[i] {
                    still_unmatched.push(d);
                }
            }
            unmatched_detections = still_unmatched;
        }

        // IoU match on cascade leftovers plus all unconfirmed tracks.
        let mut iou_candidates = remaining_tracks;
        iou_candidates.extend(unconfirmed);
        // Only tracks missed for at most one frame participate in IoU match,
        // per the standard DeepSORT cascade/IoU split.
        let iou_candidates: Vec<usize> = iou_candidates
            .into_iter()
            .filter(|&i| self.tracks[i].time_since_update <= 1)
            .collect();

        if !iou_candidates.is_empty() && !unmatched_detections.is_empty() {
            let cost = self.iou_cost_matrix(&iou_candidates, &unmatched_detections, detections);
            let assignment = hungarian::solve(&cost);

            let mut consumed = vec![false; unmatched_detections.len()];
            for (row, col) in assignment.iter().enumerate() {
                if let Some(c) = col {
                    if cost[row][*c] <= self.params.max_iou_distance {
                        matched.push((iou_candidates[row], unmatched_detections[*c]));
                        consumed[*c] = true;
                    }
                }
            }
            unmatched_detections = unmatched_detections
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !consumed[*i])
                .map(|(_, d)| d)
                .collect();
        }

        let matched_track_indices: std::collections::HashSet<usize> =
            matched.iter().map(|(t, _)| *t).collect();

        for &(track_idx, det_idx) in &matched {
            let next_id = &mut self.next_track_id;
            self.tracks[track_idx].update(&detections[det_idx], self.params.nn_budget, self.params.n_init, next_id);
        }

        for (i, track) in self.tracks.iter_mut().enumerate() {
            if !matched_track_indices.contains(&i) {
                track.mark_missed(self.params.max_age);
            }
        }

        for det_idx in unmatched_detections {
            let mut track = Track::new(&detections[det_idx], 0, self.params.nn_budget);
            if self.params.n_init == 0 {
                track.state = TrackState::Confirmed;
                track.track_id = self.next_track_id;
                self.next_track_id += 1;
            }
            self.tracks.push(track);
        }

        self.tracks.retain(|t| t.state != TrackState::Deleted);

        self.tracks
            .iter()
            .filter(|t| t.is_confirmed())
            .cloned()
            .collect()
    }

    fn cascade_cost_matrix(
        &mut self,
        track_indices: &[usize],
        detection_indices: &[usize],
        detections: &[Detection],
    ) -> Vec<Vec<f64>> {
        let measurements: Vec<[f64; 4]> = detection_indices
            .iter()
            .map(|&d| detections[d].rect.to_xyah())
            .collect();

        track_indices
            .iter()
            .map(|&t| {
                let gating = self.tracks[t].kalman.gating_distance(&measurements);
                detection_indices
                    .iter()
                    .enumerate()
                    .map(|(i, &d)| {
                        let cosine = cosine_distance(&self.tracks[t].features, &detections[d].feature);
                        if gating[i] > CHI2_95_DF4 {
                            (cosine).max(self.params.max_cosine_distance + 1e-5)
                        } else {
                            cosine
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn iou_cost_matrix(
        &self,
        track_indices: &[usize],
        detection_indices: &[usize],
        detections: &[Detection],
    ) -> Vec<Vec<f64>> {
        track_indices
            .iter()
            .map(|&t| {
                detection_indices
                    .iter()
                    .map(|&d| 1.0 - self.tracks[t].rect.iou(&detections[d].rect))
                    .collect()
            })
            .collect()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `1 - max cosine similarity` between `query` and any feature in `history`,
/// with similarity clamped to `[0, 1]` before distance. An empty history or
/// query yields the maximum distance (1.0), since there is nothing to match.
fn cosine_distance(history: &[Vec<f32>], query: &[f32]) -> f64 {
    if history.is_empty() || query.is_empty() {
        return 1.0;
    }
    let q_norm = l2_norm(query);
    if q_norm <= 0.0 {
        return 1.0;
    }

    let mut best_similarity = f64::MIN;
    for feature in history {
        let f_norm = l2_norm(feature);
        if f_norm <= 0.0 {
            continue;
        }
        let dot: f64 = feature
            .iter()
            .zip(query.iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum();
        let similarity = (dot / (f_norm * q_norm)).clamp(0.0, 1.0);
        if similarity > best_similarity {
            best_similarity = similarity;
        }
    }

    if best_similarity == f64::MIN {
        1.0
    } else {
        1.0 - best_similarity
    }
}

fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: i32, y: i32, w: i32, h: i32, feature: Vec<f32>) -> Detection {
        Detection {
            rect: Rect::new(x, y, w, h),
            confidence: 1.0,
            feature,
        }
    }

    #[test]
    fn new_detection_spawns_tentative_then_confirms_after_n_init() {
        let mut tracker = Tracker::new();
        tracker.set_params(TrackerParams {
            n_init: 2,
            ..TrackerParams::default()
        });

        let confirmed0 = tracker.update_frame(&[det(10, 20, 40, 80, vec![1.0, 0.0])]);
        assert!(confirmed0.is_empty());

        let confirmed1 = tracker.update_frame(&[det(11, 20, 40, 80, vec![1.0, 0.0])]);
        assert!(confirmed1.is_empty());

        let confirmed2 = tracker.update_frame(&[det(12, 20, 40, 80, vec![1.0, 0.0])]);
        assert_eq!(confirmed2.len(), 1);
        assert_eq!(confirmed2[0].track_id, 1);
    }

    #[test]
    fn track_ids_are_never_reused() {
        let mut tracker = Tracker::new();
        tracker.set_params(TrackerParams {
            n_init: 0,
            ..TrackerParams::default()
        });

        let first = tracker.update_frame(&[det(0, 0, 10, 10, vec![])]);
        assert_eq!(first[0].track_id, 1);

        // Track ages out (no re-detection) and a new one spawns.
        for _ in 0..40 {
            tracker.update_frame(&[]);
        }
        let second = tracker.update_frame(&[det(100, 100, 10, 10, vec![])]);
        assert_eq!(second[0].track_id, 2);
    }

    #[test]
    fn cosine_distance_identical_features_is_zero() {
        let history = vec![vec![1.0f32, 0.0, 0.0]];
        let d = cosine_distance(&history, &[1.0, 0.0, 0.0]);
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn cosine_distance_orthogonal_features_is_one() {
        let history = vec![vec![1.0f32, 0.0]];
        let d = cosine_distance(&history, &[0.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-9);
    }
}
