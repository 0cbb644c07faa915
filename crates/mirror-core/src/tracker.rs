//! Frame-to-frame face tracking by greedy IoU association.
//!
//! Each live track keeps the box it was last seen at. Every frame, candidate
//! (track, detection) pairs are ranked by overlap and assigned greedily. A
//! track that goes unmatched for `max_missed` consecutive frames is dropped
//! and its id is never handed out again.

use crate::types::{FaceInfo, TrackState, TrackedFaceInfo};
use std::cmp::Ordering;
use thiserror::Error;

const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_MISSED: u32 = 3;

#[derive(Error, Debug, PartialEq)]
pub enum TrackerConfigError {
    #[error("iou_threshold must be in (0, 1], got {0}")]
    IouThreshold(f32),
    #[error("max_missed must be at least 1")]
    MaxMissed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    pub iou_threshold: f32,
    /// Consecutive missed frames after which a track is dropped.
    pub max_missed: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), TrackerConfigError> {
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return Err(TrackerConfigError::IouThreshold(self.iou_threshold));
        }
        if self.max_missed == 0 {
            return Err(TrackerConfigError::MaxMissed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    face: FaceInfo,
    state: TrackState,
    age: u32,
    missed: u32,
}

/// Assigns persistent identities to detections across frames.
///
/// Frames must be submitted in order, one call per frame.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    dropped: Vec<TrackedFaceInfo>,
    next_id: u64,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            dropped: Vec::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Number of tracks that are currently alive (New or Active).
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Tracks retired during the most recent frame, in `Dropped` state.
    pub fn dropped(&self) -> &[TrackedFaceInfo] {
        &self.dropped
    }

    /// Drop every live track. The id counter is not rewound.
    pub fn reset(&mut self) {
        tracing::debug!(dropped = self.tracks.len(), "tracker reset");
        self.tracks.clear();
        self.dropped.clear();
    }

    /// Process one frame of detections.
    ///
    /// Returns one entry per input detection, in input order.
    pub fn track(&mut self, faces: &[FaceInfo]) -> Vec<TrackedFaceInfo> {
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, face) in faces.iter().enumerate() {
                let iou = track.face.iou(face);
                if iou >= self.config.iou_threshold {
                    candidates.push((iou, t, d));
                }
            }
        }
        // Highest overlap first; ties by older track, then earlier detection.
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(self.tracks[a.1].id.cmp(&self.tracks[b.1].id))
                .then(a.2.cmp(&b.2))
        });

        let mut track_taken = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<(usize, f32)>> = vec![None; faces.len()];
        for (iou, t, d) in candidates {
            if track_taken[t] || assigned[d].is_some() {
                continue;
            }
            track_taken[t] = true;
            assigned[d] = Some((t, iou));
        }

        for (t, track) in self.tracks.iter_mut().enumerate() {
            track.age += 1;
            if !track_taken[t] {
                track.missed += 1;
            }
        }

        let mut output = Vec::with_capacity(faces.len());
        for (d, face) in faces.iter().enumerate() {
            let tracked = match assigned[d] {
                Some((t, iou)) => {
                    let track = &mut self.tracks[t];
                    track.face = *face;
                    track.state = TrackState::Active;
                    track.missed = 0;
                    TrackedFaceInfo {
                        face: *face,
                        track_id: track.id,
                        state: track.state,
                        age: track.age,
                        missed: 0,
                        iou,
                    }
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    tracing::debug!(track_id = id, "track started");
                    self.tracks.push(Track {
                        id,
                        face: *face,
                        state: TrackState::New,
                        age: 0,
                        missed: 0,
                    });
                    TrackedFaceInfo {
                        face: *face,
                        track_id: id,
                        state: TrackState::New,
                        age: 0,
                        missed: 0,
                        iou: 0.0,
                    }
                }
            };
            output.push(tracked);
        }

        let max_missed = self.config.max_missed;
        let dropped = &mut self.dropped;
        dropped.clear();
        self.tracks.retain(|track| {
            if track.missed < max_missed {
                return true;
            }
            tracing::debug!(track_id = track.id, age = track.age, "track dropped");
            dropped.push(TrackedFaceInfo {
                face: track.face,
                track_id: track.id,
                state: TrackState::Dropped,
                age: track.age,
                missed: track.missed,
                iou: 0.0,
            });
            false
        });

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_at(x: f32, y: f32) -> FaceInfo {
        FaceInfo { x, y, width: 100.0, height: 100.0, score: 0.9 }
    }

    #[test]
    fn test_first_detection_starts_new_track() {
        let mut tracker = Tracker::default();
        let out = tracker.track(&[face_at(0.0, 0.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 0);
        assert_eq!(out[0].state, TrackState::New);
        assert_eq!(out[0].iou, 0.0);
    }

    #[test]
    fn test_small_displacement_keeps_id() {
        let mut tracker = Tracker::default();
        tracker.track(&[face_at(0.0, 0.0)]);
        let out = tracker.track(&[face_at(5.0, 5.0)]);
        assert_eq!(out[0].track_id, 0);
        assert_eq!(out[0].state, TrackState::Active);
        assert_eq!(out[0].age, 1);
        assert!(out[0].iou > 0.8);
    }

    #[test]
    fn test_dropped_track_id_is_never_reused() {
        let config = TrackerConfig { iou_threshold: 0.3, max_missed: 3 };
        let mut tracker = Tracker::new(config);
        assert_eq!(tracker.track(&[face_at(0.0, 0.0)])[0].track_id, 0);
        assert_eq!(tracker.track(&[face_at(2.0, 2.0)])[0].track_id, 0);

        for _ in 0..config.max_missed {
            assert!(tracker.track(&[]).is_empty());
        }
        assert_eq!(tracker.live_tracks(), 0);
        assert_eq!(tracker.dropped().len(), 1);
        assert_eq!(tracker.dropped()[0].track_id, 0);
        assert_eq!(tracker.dropped()[0].state, TrackState::Dropped);

        let out = tracker.track(&[face_at(2.0, 2.0)]);
        assert_ne!(out[0].track_id, 0);
        assert_eq!(out[0].track_id, 1);
        assert_eq!(out[0].state, TrackState::New);
    }

    #[test]
    fn test_brief_miss_keeps_track_alive() {
        let mut tracker = Tracker::new(TrackerConfig { iou_threshold: 0.3, max_missed: 3 });
        tracker.track(&[face_at(0.0, 0.0)]);
        tracker.track(&[]);
        tracker.track(&[]);
        let out = tracker.track(&[face_at(0.0, 0.0)]);
        assert_eq!(out[0].track_id, 0);
        assert_eq!(out[0].missed, 0);
    }

    #[test]
    fn test_far_detection_starts_second_track() {
        let mut tracker = Tracker::default();
        tracker.track(&[face_at(0.0, 0.0)]);
        let out = tracker.track(&[face_at(500.0, 500.0)]);
        assert_eq!(out[0].track_id, 1);
        // Track 0 is still alive, just missed once.
        assert_eq!(tracker.live_tracks(), 2);
    }

    #[test]
    fn test_two_faces_keep_their_ids_and_output_order() {
        let mut tracker = Tracker::default();
        let first = tracker.track(&[face_at(0.0, 0.0), face_at(300.0, 0.0)]);
        assert_eq!(first[0].track_id, 0);
        assert_eq!(first[1].track_id, 1);

        // Reported in swapped order; identities follow the boxes.
        let second = tracker.track(&[face_at(305.0, 0.0), face_at(4.0, 0.0)]);
        assert_eq!(second[0].track_id, 1);
        assert_eq!(second[1].track_id, 0);
    }

    #[test]
    fn test_one_track_claims_at_most_one_detection() {
        let mut tracker = Tracker::default();
        tracker.track(&[face_at(0.0, 0.0)]);
        let out = tracker.track(&[face_at(1.0, 0.0), face_at(10.0, 0.0)]);
        assert_eq!(out[0].track_id, 0);
        assert_eq!(out[1].track_id, 1);
    }

    #[test]
    fn test_reset_does_not_rewind_ids() {
        let mut tracker = Tracker::default();
        tracker.track(&[face_at(0.0, 0.0)]);
        tracker.reset();
        assert_eq!(tracker.live_tracks(), 0);
        assert_eq!(tracker.track(&[face_at(0.0, 0.0)])[0].track_id, 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        assert_eq!(
            TrackerConfig { iou_threshold: 0.0, max_missed: 3 }.validate(),
            Err(TrackerConfigError::IouThreshold(0.0))
        );
        assert_eq!(
            TrackerConfig { iou_threshold: 0.5, max_missed: 0 }.validate(),
            Err(TrackerConfigError::MaxMissed)
        );
    }
}
