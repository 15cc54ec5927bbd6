//! End-to-end tracker scenarios: birth, stable tracking, aging, tie-breaking.

use blobserver_core::tracking::{
    reset_blob_id_counter, track_blobs, Blob2D, BlobProperties, Tracked,
};
use nalgebra::Vector2;

fn measure(x: i32, y: i32, size: f32) -> BlobProperties {
    BlobProperties {
        position: Vector2::new(x, y),
        size,
        ..BlobProperties::default()
    }
}

/// Scenarios 1–3 share tracker state, so they run as one sequence.  This is
/// also the only test allowed to assert absolute ids: the id counter is
/// process-wide and other tests create blobs concurrently.
#[test]
fn test_blob_lifecycle() {
    reset_blob_id_counter();
    let mut blobs: Vec<Blob2D> = Vec::new();

    // Lone birth.
    track_blobs(&[measure(10, 10, 5.0)], &mut blobs, 3);
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].id(), 1);
    assert_eq!(blobs[0].lifetime(), 3);
    assert!(blobs[0].is_updated());

    // Stable tracking: same identity, velocity from the position delta,
    // lifetime renewed to the configured value.
    track_blobs(&[measure(11, 10, 5.0)], &mut blobs, 3);
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].id(), 1);
    assert_eq!(blobs[0].properties().speed, Vector2::new(1.0, 0.0));
    assert_eq!(blobs[0].lifetime(), 3);

    // Aging: lifetime runs 2, 1, 0, then the track is removed.
    for expected in [2, 1, 0] {
        track_blobs(&[], &mut blobs, 3);
        assert_eq!(blobs.len(), 1, "track gone too early");
        assert_eq!(blobs[0].lifetime(), expected);
        assert!(!blobs[0].is_updated());
    }
    track_blobs(&[], &mut blobs, 3);
    assert!(blobs.is_empty(), "track should be removed on the fourth call");
}

#[test]
fn test_greedy_matching_does_not_cross() {
    let mut blobs: Vec<Blob2D> = Vec::new();
    track_blobs(
        &[measure(0, 0, 1.0), measure(10, 0, 1.0)],
        &mut blobs,
        30,
    );
    let left = blobs[0].id();
    let right = blobs[1].id();

    track_blobs(
        &[measure(1, 0, 1.0), measure(11, 0, 1.0)],
        &mut blobs,
        30,
    );
    assert_eq!(blobs.len(), 2);

    let by_id = |id: u32| {
        blobs
            .iter()
            .find(|b| b.id() == id)
            .expect("identity preserved")
    };
    assert_eq!(by_id(left).properties().position, Vector2::new(1, 0));
    assert_eq!(by_id(right).properties().position, Vector2::new(11, 0));
}

#[test]
fn test_track_count_never_grows_past_measurement_count() {
    let mut blobs: Vec<Blob2D> = Vec::new();
    for cycle in 0..10 {
        let before = blobs.len();
        let measures: Vec<BlobProperties> = (0..cycle % 4)
            .map(|i| measure(i * 20, cycle, 1.0))
            .collect();
        track_blobs(&measures, &mut blobs, 2);
        assert!(
            blobs.len() <= before + measures.len(),
            "cycle {cycle} grew tracks by more than its measurements"
        );
    }
}

#[test]
fn test_empty_in_empty_out() {
    let mut blobs: Vec<Blob2D> = Vec::new();
    track_blobs(&[], &mut blobs, 30);
    assert!(blobs.is_empty());
}

#[test]
fn test_ids_are_monotonic_across_births() {
    let mut blobs: Vec<Blob2D> = Vec::new();
    track_blobs(&[measure(0, 0, 1.0)], &mut blobs, 0);
    let first = blobs[0].id();

    // Lifetime 0 dies on the first unmatched cycle.
    track_blobs(&[], &mut blobs, 0);
    assert!(blobs.is_empty());

    track_blobs(&[measure(0, 0, 1.0)], &mut blobs, 0);
    assert!(blobs[0].id() > first, "ids must never be reused");
}

#[test]
fn test_far_measurement_still_matches_lone_track() {
    // Greedy matching has no distance gate: with one track and one
    // measurement the pair is always committed.
    let mut blobs: Vec<Blob2D> = Vec::new();
    track_blobs(&[measure(0, 0, 1.0)], &mut blobs, 5);
    let id = blobs[0].id();

    track_blobs(&[measure(500, 500, 1.0)], &mut blobs, 5);
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].id(), id);
    assert_eq!(blobs[0].properties().position, Vector2::new(500, 500));
}
