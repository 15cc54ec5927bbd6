//! A synthetic source: bright spots orbiting on a dark background.
//!
//! Stands in for a camera wherever a deterministic frame stream is needed —
//! integration tests, protocol demos, latency checks.  Spot positions are a
//! pure function of the grab counter, so two instances with the same
//! parameters produce identical streams.

use std::f32::consts::TAU;

use crate::message::Message;
use crate::source::{Source, SourceBase};
use crate::video::Frame;

pub const CLASS_NAME: &str = "Pattern";
pub const DOCUMENTATION: &str = "Synthetic source generating moving light spots";

/// How many sub-source slots the class advertises.
const SUBSOURCE_COUNT: i32 = 5;

pub struct PatternSource {
    base: SourceBase,
    connected: bool,
    tick: u64,
    width: u32,
    height: u32,
    spot_count: u32,
    spot_speed: f32,
}

impl PatternSource {
    pub fn new(subsource: i32) -> Self {
        Self {
            base: SourceBase::new(CLASS_NAME, subsource),
            connected: false,
            tick: 0,
            width: 640,
            height: 480,
            spot_count: 2,
            spot_speed: 0.02,
        }
    }

    fn render(&self) -> Frame {
        let mut frame = Frame::black(self.width, self.height);
        let cx = self.width as f32 / 2.0;
        let cy = self.height as f32 / 2.0;
        let radius = cx.min(cy) * 0.6;

        for spot in 0..self.spot_count {
            // Each spot orbits the centre with a phase offset; the sub-source
            // index shifts the whole constellation so distinct sub-sources
            // are distinguishable.
            let phase = spot as f32 / self.spot_count.max(1) as f32 * TAU
                + self.base.subsource.max(0) as f32;
            let angle = phase + self.tick as f32 * self.spot_speed;
            let x = cx + radius * angle.cos();
            let y = cy + radius * angle.sin();
            draw_spot(&mut frame, x as i32, y as i32, 6);
        }
        frame
    }
}

fn draw_spot(frame: &mut Frame, cx: i32, cy: i32, radius: i32) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let x = cx + dx;
            let y = cy + dy;
            if x < 0 || y < 0 || x >= frame.width as i32 || y >= frame.height as i32 {
                continue;
            }
            let idx = ((y as u32 * frame.width + x as u32) * 3) as usize;
            frame.data[idx] = 255;
            frame.data[idx + 1] = 255;
            frame.data[idx + 2] = 255;
        }
    }
}

impl Source for PatternSource {
    fn connect(&mut self) -> bool {
        if self.base.subsource < 0 || self.base.subsource >= SUBSOURCE_COUNT {
            return false;
        }
        self.connected = true;
        true
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn grab_frame(&mut self) {
        if !self.connected {
            return;
        }
        self.tick += 1;
        self.base.raw = self.render();
        self.base.invalidate();
    }

    fn retrieve_corrected_frame(&mut self) -> Frame {
        self.base.corrected_frame()
    }

    fn set_parameter(&mut self, message: &Message) {
        if self.base.set_base_parameter(message) {
            return;
        }
        let Ok(name) = message.str_at(0) else {
            return;
        };
        match name {
            "width" => {
                if let Ok(value) = message.int_at(1) {
                    self.width = value.clamp(16, 4096) as u32;
                }
            }
            "height" => {
                if let Ok(value) = message.int_at(1) {
                    self.height = value.clamp(16, 4096) as u32;
                }
            }
            "spotCount" => {
                if let Ok(value) = message.int_at(1) {
                    self.spot_count = value.clamp(0, 64) as u32;
                }
            }
            "spotSpeed" => {
                if let Ok(value) = message.float_at(1) {
                    self.spot_speed = value;
                }
            }
            _ => {}
        }
    }

    fn get_parameter(&self, message: &Message) -> Message {
        if let Some(reply) = self.base.get_base_parameter(message) {
            return reply;
        }
        match message.str_at(0) {
            Ok("width") => crate::message!["width", self.width as i32],
            Ok("height") => crate::message!["height", self.height as i32],
            Ok("spotCount") => crate::message!["spotCount", self.spot_count as i32],
            Ok("spotSpeed") => crate::message!["spotSpeed", self.spot_speed],
            _ => Message::new(),
        }
    }

    fn get_subsources(&self) -> Message {
        (0..SUBSOURCE_COUNT).collect()
    }

    fn name(&self) -> &str {
        &self.base.name
    }

    fn subsource_nbr(&self) -> i32 {
        self.base.subsource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_parameters_give_identical_streams() {
        let mut a = PatternSource::new(0);
        let mut b = PatternSource::new(0);
        assert!(a.connect());
        assert!(b.connect());

        for _ in 0..3 {
            a.grab_frame();
            b.grab_frame();
        }
        assert_eq!(
            a.retrieve_corrected_frame().data,
            b.retrieve_corrected_frame().data
        );
    }

    #[test]
    fn out_of_range_subsource_refuses_to_connect() {
        let mut source = PatternSource::new(99);
        assert!(!source.connect());
    }

    #[test]
    fn frames_contain_bright_pixels_after_grab() {
        let mut source = PatternSource::new(0);
        source.connect();
        source.grab_frame();
        let frame = source.retrieve_corrected_frame();
        assert!(frame.data.iter().any(|&v| v == 255));
    }
}
