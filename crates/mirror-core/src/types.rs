use serde::{Deserialize, Serialize};

/// A 2D point in image coordinates.
pub type Point2D = (f32, f32);

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Keypoints = [Point2D; 5];

/// A detected face region in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceInfo {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

impl FaceInfo {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &FaceInfo) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Lifecycle of a track: `New -> Active -> Dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// First frame of the track.
    #[default]
    New,
    /// Matched in at least one frame after creation.
    Active,
    /// Missed for too many consecutive frames. The id is retired.
    Dropped,
}

/// A detection augmented with a persistent track identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedFaceInfo {
    pub face: FaceInfo,
    pub track_id: u64,
    pub state: TrackState,
    /// Frames since the track was created.
    pub age: u32,
    /// Consecutive frames without a matching detection.
    pub missed: u32,
    /// Overlap with the track's previous box (0.0 for a new track).
    pub iou: f32,
}

/// One enrolled face in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub index: i64,
    pub label: String,
    pub embedding: Vec<f32>,
}

/// Best-matching gallery record for a query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub index: i64,
    pub label: String,
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub score: f32,
}

/// Cosine similarity between two embeddings.
///
/// Returns a value in [-1, 1], or 0.0 when either vector has zero norm.
/// Callers are responsible for checking that the lengths agree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    // f64 sums: squares of large finite f32 values overflow f32.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}
