//! source — the frame-producer contract and the correction pipeline
//!
//! A source is identified by its class name plus a sub-source index (which
//! physical device of that class).  `grab_frame` pulls raw data on the grab
//! thread; `retrieve_corrected_frame` hands out the rectified view and is
//! idempotent between grabs — the corrected frame is computed once and cached
//! until the next grab invalidates it.

use crate::message::Message;
use crate::video::Frame;

pub mod pattern;
pub mod shmdata;

pub use pattern::PatternSource;
pub use shmdata::ShmdataSource;

/// The frame-producer contract.  Two sources are the same physical source
/// iff their class name and sub-source index both match.
pub trait Source: Send {
    /// Open the underlying device.  Returns success.
    fn connect(&mut self) -> bool;
    /// Release the underlying device.
    fn disconnect(&mut self);
    /// Synchronously pull the next frame into the internal buffer.  May block
    /// on I/O; transient failures are logged and keep the previous frame.
    fn grab_frame(&mut self);
    /// The most recent frame after undistortion/colour correction.
    fn retrieve_corrected_frame(&mut self) -> Frame;

    fn set_parameter(&mut self, message: &Message);
    /// Reply carries the parameter name followed by its current value(s).
    fn get_parameter(&self, message: &Message) -> Message;

    /// Enumerate attachable sub-sources without opening them.  Factories call
    /// this on a probe instance built with sub-source index −1.
    fn get_subsources(&self) -> Message;

    fn name(&self) -> &str;
    fn subsource_nbr(&self) -> i32;
}

// ── Shared base state ─────────────────────────────────────────────────────────

/// State common to every source: identity, the raw/corrected buffer pair and
/// the correction parameters applied by `retrieve_corrected_frame`.
pub struct SourceBase {
    pub name: String,
    pub subsource: i32,
    pub raw: Frame,
    corrected: Option<Frame>,
    scale: f32,
    gamma: f32,
    white_balance: [f32; 3],
}

impl SourceBase {
    pub fn new(name: &str, subsource: i32) -> Self {
        Self {
            name: name.to_string(),
            subsource,
            raw: Frame::default(),
            corrected: None,
            scale: 1.0,
            gamma: 1.0,
            white_balance: [1.0; 3],
        }
    }

    /// Drop the cached corrected frame; called after every grab.
    pub fn invalidate(&mut self) {
        self.corrected = None;
    }

    /// The corrected view of the current raw frame, computed at most once per
    /// grab.
    pub fn corrected_frame(&mut self) -> Frame {
        if let Some(frame) = &self.corrected {
            return frame.clone();
        }
        let frame = self.correct(&self.raw);
        self.corrected = Some(frame.clone());
        frame
    }

    fn correct(&self, raw: &Frame) -> Frame {
        if raw.is_empty() {
            return raw.clone();
        }

        let mut frame = raw.clone();

        let balanced = self.white_balance != [1.0; 3];
        if balanced || self.gamma != 1.0 {
            // One 256-entry table per channel covers both corrections.
            let mut tables = [[0u8; 256]; 3];
            for channel in 0..3 {
                for value in 0..256usize {
                    let mut v = value as f32 / 255.0 * self.white_balance[channel];
                    if self.gamma != 1.0 {
                        v = v.max(0.0).powf(self.gamma);
                    }
                    tables[channel][value] = (v.clamp(0.0, 1.0) * 255.0) as u8;
                }
            }
            for chunk in frame.data.chunks_exact_mut(3) {
                chunk[0] = tables[0][chunk[0] as usize];
                chunk[1] = tables[1][chunk[1] as usize];
                chunk[2] = tables[2][chunk[2] as usize];
            }
        }

        if self.scale != 1.0 {
            let width = ((frame.width as f32 * self.scale) as u32).max(1);
            let height = ((frame.height as f32 * self.scale) as u32).max(1);
            match frame.resized(width, height) {
                Ok(scaled) => frame = scaled,
                Err(err) => {
                    tracing::warn!(error = %err, "scale correction failed; using unscaled frame")
                }
            }
        }

        frame
    }

    /// Parameters every source inherits.  Returns true when consumed.
    pub fn set_base_parameter(&mut self, message: &Message) -> bool {
        let Ok(name) = message.str_at(0) else {
            return false;
        };
        match name {
            "scale" => {
                if let Ok(value) = message.float_at(1) {
                    self.scale = value.max(0.01);
                    self.invalidate();
                }
                true
            }
            "gamma" => {
                if let Ok(value) = message.float_at(1) {
                    self.gamma = value.max(0.01);
                    self.invalidate();
                }
                true
            }
            "whiteBalanceRed" | "whiteBalanceGreen" | "whiteBalanceBlue" => {
                if let Ok(value) = message.float_at(1) {
                    let channel = match name {
                        "whiteBalanceRed" => 0,
                        "whiteBalanceGreen" => 1,
                        _ => 2,
                    };
                    self.white_balance[channel] = value.max(0.0);
                    self.invalidate();
                }
                true
            }
            _ => false,
        }
    }

    pub fn get_base_parameter(&self, message: &Message) -> Option<Message> {
        match message.str_at(0).ok()? {
            "id" => Some(crate::message!["id", self.subsource]),
            "scale" => Some(crate::message!["scale", self.scale]),
            "gamma" => Some(crate::message!["gamma", self.gamma]),
            "whiteBalanceRed" => Some(crate::message!["whiteBalanceRed", self.white_balance[0]]),
            "whiteBalanceGreen" => {
                Some(crate::message!["whiteBalanceGreen", self.white_balance[1]])
            }
            "whiteBalanceBlue" => Some(crate::message!["whiteBalanceBlue", self.white_balance[2]]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_parameter_returns_subsource_index() {
        let base = SourceBase::new("Pattern", 3);
        let reply = base.get_base_parameter(&crate::message!["id"]).unwrap();
        assert_eq!(reply.str_at(0).unwrap(), "id");
        assert_eq!(reply.int_at(1).unwrap(), 3);
    }

    #[test]
    fn corrected_frame_is_cached_until_invalidated() {
        let mut base = SourceBase::new("Pattern", 0);
        base.raw = Frame::black(8, 8);
        base.raw.data[0] = 100;

        let first = base.corrected_frame();
        base.raw.data[0] = 200;
        let second = base.corrected_frame();
        assert_eq!(first.data[0], second.data[0]);

        base.invalidate();
        let third = base.corrected_frame();
        assert_eq!(third.data[0], 200);
    }

    #[test]
    fn white_balance_scales_a_single_channel() {
        let mut base = SourceBase::new("Pattern", 0);
        base.raw = Frame::black(2, 2);
        base.raw.data.fill(100);
        base.set_base_parameter(&crate::message!["whiteBalanceRed", 2.0f32]);

        let frame = base.corrected_frame();
        assert!(frame.data[0] > 150);
        assert_eq!(frame.data[1], 100);
    }
}
