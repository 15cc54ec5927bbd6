//! tracking — blob identity over time
//!
//! Detectors produce instantaneous measurements; this module turns them into
//! persistent tracks.  Model: 2D constant-velocity Kalman filter over the
//! blob centre, one filter per track.
//!
//! State vector: [x, y, vx, vy]ᵀ  (position + velocity in pixels/frame)
//! Measurement:  [x, y]ᵀ
//!
//! The association step is a greedy minimum-distance matching: all
//! (track, measurement) pairs go through a heap ordered by distance, closest
//! pair wins, and every remaining pair sharing its track or measurement is
//! discarded.  Unmatched tracks age out; unmatched measurements are born as
//! new tracks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Process noise — how much we trust the motion model.
const PROCESS_NOISE: f32 = 4.0;
/// Measurement noise — how much we trust the detector.
const MEASUREMENT_NOISE: f32 = 16.0;
/// Cycles a freshly created track survives without a measurement.
pub const DEFAULT_LIFETIME: i32 = 30;

// ── Measurement ──────────────────────────────────────────────────────────────

/// An instantaneous blob measurement as produced by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobProperties {
    /// Centre position, integer pixel coordinates.
    pub position: Vector2<i32>,
    /// Velocity estimate in pixels/frame.
    pub speed: Vector2<f32>,
    /// Mean colour of the blob, RGB.
    pub color: [u8; 3],
    /// Principal-axis orientation in radians.
    pub orientation: f32,
    /// Scalar size (detector-defined unit, typically pixel count).
    pub size: f32,
}

impl Default for BlobProperties {
    fn default() -> Self {
        Self {
            position: Vector2::new(0, 0),
            speed: Vector2::new(0.0, 0.0),
            color: [0; 3],
            orientation: 0.0,
            size: 0.0,
        }
    }
}

impl BlobProperties {
    pub fn at(x: i32, y: i32) -> Self {
        Self {
            position: Vector2::new(x, y),
            ..Self::default()
        }
    }
}

// ── Kalman filter ─────────────────────────────────────────────────────────────

/// A minimal 2D constant-velocity Kalman filter.
#[derive(Debug, Clone)]
struct Kalman2D {
    /// State: [x, y, vx, vy]
    x: Vector4<f32>,
    /// State covariance
    p: Matrix4<f32>,
    /// State transition matrix (F)
    f: Matrix4<f32>,
    /// Measurement matrix (H): extracts [x, y] from state
    h: Matrix2x4<f32>,
    /// Process noise covariance (Q)
    q: Matrix4<f32>,
    /// Measurement noise covariance (R)
    r: Matrix2<f32>,
}

impl Kalman2D {
    fn new(x: f32, y: f32) -> Self {
        let state = Vector4::new(x, y, 0.0, 0.0);
        let p = Matrix4::identity() * 100.0;

        // x_{k+1} = F * x_k
        let f = Matrix4::new(
            1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
        );

        let h = Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0);

        let q = Matrix4::identity() * PROCESS_NOISE;
        let r = Matrix2::identity() * MEASUREMENT_NOISE;

        Self {
            x: state,
            p,
            f,
            h,
            q,
            r,
        }
    }

    /// Predict step — advance state one frame.
    fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Update step — incorporate a new measurement [x, y].
    fn update(&mut self, x: f32, y: f32) {
        let z = Vector2::new(x, y);
        let y_inno = z - self.h * self.x;
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix4x2<f32> = self.p * self.h.transpose() * s_inv;
        self.x = self.x + k * y_inno;
        self.p = (Matrix4::identity() - k * self.h) * self.p;
    }

    fn position(&self) -> Vector2<f32> {
        Vector2::new(self.x[0], self.x[1])
    }

    fn velocity(&self) -> Vector2<f32> {
        Vector2::new(self.x[2], self.x[3])
    }
}

// ── Tracked trait ─────────────────────────────────────────────────────────────

/// The operations the association algorithm needs from a track type.
///
/// `distance_from_prediction` is the pluggable part: the default blob uses
/// squared Euclidean position distance, richer detectors can weigh in size or
/// orientation.  Whatever the metric, it must be finite and monotone in the
/// per-component error.
pub trait Tracked: Default {
    /// Seed the filter from a first measurement; velocity starts at zero.
    fn init(&mut self, measure: &BlobProperties);
    /// Advance the filter one cycle and return the predicted measurement.
    /// Clears the `updated` flag.
    fn predict(&mut self) -> BlobProperties;
    /// Feed a new measurement into the filter and re-derive the velocity from
    /// the position delta.  Sets the `updated` flag.
    fn set_new_measures(&mut self, measure: &BlobProperties);
    /// Distance between the current prediction and a candidate measurement.
    fn distance_from_prediction(&self, measure: &BlobProperties) -> f32;

    fn renew_lifetime(&mut self);
    fn get_older(&mut self);
    fn lifetime(&self) -> i32;
    fn set_lifetime(&mut self, lifetime: i32);
}

// ── Blob2D ────────────────────────────────────────────────────────────────────

static NEXT_BLOB_ID: AtomicU32 = AtomicU32::new(0);

/// Reset the process-wide blob id counter.  Test hook only: production code
/// relies on ids never being reused.
pub fn reset_blob_id_counter() {
    NEXT_BLOB_ID.store(0, AtomicOrdering::SeqCst);
}

/// A persistent 2D blob identity: filter state, last measurement, lifetime.
#[derive(Debug, Clone)]
pub struct Blob2D {
    id: u32,
    filter: Kalman2D,
    properties: BlobProperties,
    prediction: BlobProperties,
    lifetime: i32,
    /// What `renew_lifetime` restores; set by `set_lifetime`.
    configured_lifetime: i32,
    updated: bool,
}

impl Default for Blob2D {
    fn default() -> Self {
        Self {
            id: NEXT_BLOB_ID.fetch_add(1, AtomicOrdering::SeqCst) + 1,
            filter: Kalman2D::new(0.0, 0.0),
            properties: BlobProperties::default(),
            prediction: BlobProperties::default(),
            lifetime: DEFAULT_LIFETIME,
            configured_lifetime: DEFAULT_LIFETIME,
            updated: false,
        }
    }
}

impl Blob2D {
    /// Unique for the process lifetime, never reused.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The last emitted measurement for this track.
    pub fn properties(&self) -> &BlobProperties {
        &self.properties
    }

    /// Whether the last cycle produced a new measurement for this track.
    pub fn is_updated(&self) -> bool {
        self.updated
    }
}

impl Tracked for Blob2D {
    fn init(&mut self, measure: &BlobProperties) {
        self.filter = Kalman2D::new(measure.position.x as f32, measure.position.y as f32);
        self.properties = measure.clone();
        self.properties.speed = Vector2::new(0.0, 0.0);
        self.prediction = self.properties.clone();
        self.updated = true;
    }

    fn predict(&mut self) -> BlobProperties {
        self.filter.predict();
        let pos = self.filter.position();
        self.prediction = BlobProperties {
            position: Vector2::new(pos.x.round() as i32, pos.y.round() as i32),
            speed: self.filter.velocity(),
            ..self.properties.clone()
        };
        self.updated = false;
        self.prediction.clone()
    }

    fn set_new_measures(&mut self, measure: &BlobProperties) {
        self.filter
            .update(measure.position.x as f32, measure.position.y as f32);
        let delta = measure.position - self.properties.position;
        self.properties = measure.clone();
        self.properties.speed = Vector2::new(delta.x as f32, delta.y as f32);
        self.updated = true;
    }

    fn distance_from_prediction(&self, measure: &BlobProperties) -> f32 {
        let delta = measure.position - self.prediction.position;
        (delta.x * delta.x + delta.y * delta.y) as f32
    }

    fn renew_lifetime(&mut self) {
        self.lifetime = self.configured_lifetime;
    }

    fn get_older(&mut self) {
        self.lifetime -= 1;
    }

    fn lifetime(&self) -> i32 {
        self.lifetime
    }

    fn set_lifetime(&mut self, lifetime: i32) {
        self.lifetime = lifetime;
        self.configured_lifetime = lifetime;
    }
}

// ── Association ───────────────────────────────────────────────────────────────

/// A candidate (track, measurement) pairing.  Ordered so the heap pops the
/// smallest distance first; equal distances break by ascending track index
/// then measurement index, which keeps replays of identical input
/// deterministic.
struct Candidate {
    distance: f32,
    track: usize,
    measure: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.track.cmp(&self.track))
            .then_with(|| other.measure.cmp(&self.measure))
    }
}

/// One tracking cycle: associate `measures` with `blobs`, update matched
/// tracks, age and retire unmatched ones, create tracks for new measurements.
///
/// Total function — empty inputs produce empty outputs, and identity is
/// preserved across cycles for every track that survives.
pub fn track_blobs<T: Tracked>(measures: &[BlobProperties], blobs: &mut Vec<T>, lifetime: i32) {
    // Predict phase: every track advances once, so association below works on
    // a coherent snapshot.
    for blob in blobs.iter_mut() {
        blob.predict();
    }

    // Candidate enumeration + greedy minimum-distance matching.
    let mut matched_track = vec![usize::MAX; measures.len()];
    let mut track_taken = vec![false; blobs.len()];

    if !blobs.is_empty() {
        let mut heap = BinaryHeap::with_capacity(blobs.len() * measures.len());
        for (mi, measure) in measures.iter().enumerate() {
            for (ti, blob) in blobs.iter().enumerate() {
                heap.push(Candidate {
                    distance: blob.distance_from_prediction(measure),
                    track: ti,
                    measure: mi,
                });
            }
        }

        // Lazy deletion: pairs sharing an already-committed track or
        // measurement are dead and get skipped as they surface.
        let mut measure_taken = vec![false; measures.len()];
        while let Some(candidate) = heap.pop() {
            if track_taken[candidate.track] || measure_taken[candidate.measure] {
                continue;
            }
            track_taken[candidate.track] = true;
            measure_taken[candidate.measure] = true;
            matched_track[candidate.measure] = candidate.track;
        }
    }

    // Apply updates for committed assignments.
    for (mi, &ti) in matched_track.iter().enumerate() {
        if ti != usize::MAX {
            blobs[ti].set_new_measures(&measures[mi]);
            blobs[ti].renew_lifetime();
        }
    }

    // Age unmatched tracks; a negative lifetime retires the track.
    let mut kept = Vec::with_capacity(blobs.len());
    for (ti, mut blob) in blobs.drain(..).enumerate() {
        if track_taken[ti] {
            kept.push(blob);
        } else {
            blob.get_older();
            if blob.lifetime() >= 0 {
                kept.push(blob);
            }
        }
    }
    *blobs = kept;

    // Birth phase: every unmatched measurement becomes a new track.
    for (mi, measure) in measures.iter().enumerate() {
        if matched_track[mi] == usize::MAX {
            let mut blob = T::default();
            blob.init(measure);
            blob.set_lifetime(lifetime);
            blobs.push(blob);
        }
    }
}
