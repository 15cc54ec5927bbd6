//! detection — the detector contract and the pieces every detector shares
//!
//! A detector consumes one corrected frame per source it declared, updates
//! its output image and emits a flat blob report: the first two values are
//! the blob count N and the per-blob field count S, followed by N×S record
//! values.  The scheduler re-packs each record as one OSC message on the
//! detector's path.

use std::sync::{Mutex, Weak};

use rayon::prelude::*;

use crate::message::Message;
use crate::source::Source;
use crate::video::{Frame, GrayFrame, Interpolation};

pub mod light_spots;
pub mod mean_outliers;

pub use light_spots::LightSpots;
pub use mean_outliers::MeanOutliers;

/// The per-flow detector contract.
///
/// One instance serves exactly one flow, so `detect` needs no internal
/// synchronisation: the scheduler serialises calls.
pub trait Detector: Send {
    /// Run one detection cycle over `frames`.  `frames.len()` is at least
    /// [`Detector::source_nbr`].  A cycle that finds nothing reports
    /// `N = 0, S = 0`, never an absent message.
    fn detect(&mut self, frames: &[Frame]) -> Message;

    /// The message built by the last call to `detect`.
    fn last_message(&self) -> Message;

    /// The derived image from the last call to `detect`.
    fn output(&self) -> Frame;

    /// Restrict detection to the non-zero pixels of `mask`.
    fn set_mask(&mut self, mask: GrayFrame);

    fn set_parameter(&mut self, message: &Message);
    fn get_parameter(&self, message: &Message) -> Message;

    /// Record a non-owning reference to a source this detector may influence
    /// (e.g. to adjust exposure).  Must not extend the source's lifetime.
    fn add_source(&mut self, source: Weak<Mutex<dyn Source + Send>>);

    fn name(&self) -> &str;
    /// Wire-level address for the per-blob messages.
    fn osc_path(&self) -> &str;
    /// How many frames `detect` expects per cycle.
    fn source_nbr(&self) -> u32;
}

// ── Shared base state ─────────────────────────────────────────────────────────

/// State common to every detector, composed rather than inherited: output
/// buffer, last message, mask, verbosity and the OSC identity.
#[derive(Default)]
pub struct DetectorBase {
    pub name: String,
    pub osc_path: String,
    pub output: Frame,
    pub last_message: Message,
    pub verbose: bool,
    pub sources: Vec<Weak<Mutex<dyn Source + Send>>>,
    mask: Option<GrayFrame>,
}

impl DetectorBase {
    pub fn new(name: &str, osc_path: &str) -> Self {
        Self {
            name: name.to_string(),
            osc_path: osc_path.to_string(),
            ..Self::default()
        }
    }

    pub fn set_mask(&mut self, mask: GrayFrame) {
        self.mask = Some(mask);
    }

    /// The mask resized to `frame`'s dimensions, or `None` when no mask is
    /// set (every pixel active).
    pub fn mask_for(&self, frame: &GrayFrame, interp: Interpolation) -> Option<GrayFrame> {
        let mask = self.mask.as_ref()?;
        match mask.resized(frame.width, frame.height, interp) {
            Ok(scaled) => Some(scaled),
            Err(err) => {
                tracing::warn!(error = %err, "mask resize failed; detection left unmasked");
                None
            }
        }
    }

    /// Handle the parameters every detector inherits.  Returns true when the
    /// message was consumed.
    pub fn set_base_parameter(&mut self, message: &Message) -> bool {
        match message.str_at(0) {
            Ok("verbose") => {
                if let Ok(value) = message.int_at(1) {
                    self.verbose = value != 0;
                }
                true
            }
            _ => false,
        }
    }

    pub fn get_base_parameter(&self, message: &Message) -> Option<Message> {
        match message.str_at(0) {
            Ok("verbose") => Some(crate::message!["verbose", self.verbose as i32]),
            _ => None,
        }
    }
}

// ── Masking utility ───────────────────────────────────────────────────────────

/// Zero every pixel of `buffer` whose mask pixel is zero.  Row-parallel: each
/// row is independent.
pub fn apply_mask(buffer: &mut GrayFrame, mask: &GrayFrame) {
    debug_assert_eq!(buffer.width, mask.width);
    debug_assert_eq!(buffer.height, mask.height);

    let width = buffer.width as usize;
    buffer
        .data
        .par_chunks_mut(width)
        .zip(mask.data.par_chunks(width))
        .for_each(|(row, mask_row)| {
            for (pixel, &mask_pixel) in row.iter_mut().zip(mask_row) {
                if mask_pixel == 0 {
                    *pixel = 0;
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_zeroes_only_inactive_pixels() {
        let mut buffer = GrayFrame::new(4, 2);
        buffer.data.fill(200);
        let mut mask = GrayFrame::new(4, 2);
        mask.data = vec![255, 0, 255, 0, 0, 255, 0, 255];

        apply_mask(&mut buffer, &mask);
        assert_eq!(buffer.data, vec![200, 0, 200, 0, 0, 200, 0, 200]);
    }

    #[test]
    fn missing_mask_means_every_pixel_active() {
        let base = DetectorBase::new("Test", "/blobserver/test");
        let frame = GrayFrame::new(8, 8);
        assert!(base.mask_for(&frame, Interpolation::Nearest).is_none());
    }

    #[test]
    fn verbose_is_a_base_parameter() {
        let mut base = DetectorBase::new("Test", "/blobserver/test");
        assert!(base.set_base_parameter(&crate::message!["verbose", 1]));
        assert!(base.verbose);

        let reply = base.get_base_parameter(&crate::message!["verbose"]).unwrap();
        assert_eq!(reply.int_at(1).unwrap(), 1);
    }
}
