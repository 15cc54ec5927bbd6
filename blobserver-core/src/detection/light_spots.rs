//! Bright-spot detector: luminance threshold, speck erosion, connected
//! components, one tracked blob per component.

use std::sync::{Mutex, Weak};

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_circle_mut;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use imageproc::region_labelling::{connected_components, Connectivity};
use nalgebra::Vector2;

use crate::detection::{apply_mask, Detector, DetectorBase};
use crate::message::Message;
use crate::source::Source;
use crate::tracking::{track_blobs, Blob2D, BlobProperties, DEFAULT_LIFETIME};
use crate::video::{Frame, GrayFrame, Interpolation};

pub const CLASS_NAME: &str = "LightSpots";
pub const DOCUMENTATION: &str =
    "Detects bright spots in the image and tracks them across frames";
pub const SOURCE_NBR: u32 = 1;

const OSC_PATH: &str = "/blobserver/lightSpots";
/// Fields per blob record: x, y, size, orientation, id.
const FIELDS_PER_BLOB: i32 = 5;

pub struct LightSpots {
    base: DetectorBase,
    blobs: Vec<Blob2D>,
    /// Luma threshold above which a pixel counts as lit.
    detection_level: u8,
    /// Erosion radius applied to the binary image before labelling.
    filter_size: u8,
    /// Cycles a lost blob survives before being dropped.
    lifetime: i32,
}

impl LightSpots {
    pub fn new() -> Self {
        Self {
            base: DetectorBase::new(CLASS_NAME, OSC_PATH),
            blobs: Vec::new(),
            detection_level: 200,
            filter_size: 1,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    fn measurements(&self, frame: &Frame, binary: &GrayImage) -> Vec<BlobProperties> {
        let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));

        // First and second moments per label.
        #[derive(Default, Clone)]
        struct Moments {
            count: u64,
            sum_x: u64,
            sum_y: u64,
            sum_xx: f64,
            sum_yy: f64,
            sum_xy: f64,
        }
        let mut moments: Vec<Moments> = Vec::new();

        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if label >= moments.len() {
                moments.resize(label + 1, Moments::default());
            }
            let m = &mut moments[label];
            m.count += 1;
            m.sum_x += x as u64;
            m.sum_y += y as u64;
            m.sum_xx += (x as f64) * (x as f64);
            m.sum_yy += (y as f64) * (y as f64);
            m.sum_xy += (x as f64) * (y as f64);
        }

        let mut measures = Vec::new();
        for m in moments.iter().filter(|m| m.count > 0) {
            let count = m.count as f64;
            let cx = m.sum_x as f64 / count;
            let cy = m.sum_y as f64 / count;
            // Central second moments give the principal axis.
            let mu20 = m.sum_xx / count - cx * cx;
            let mu02 = m.sum_yy / count - cy * cy;
            let mu11 = m.sum_xy / count - cx * cy;
            let orientation = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);

            let px = (cx as u32).min(frame.width - 1);
            let py = (cy as u32).min(frame.height - 1);

            measures.push(BlobProperties {
                position: Vector2::new(cx.round() as i32, cy.round() as i32),
                speed: Vector2::new(0.0, 0.0),
                color: frame.pixel(px, py),
                orientation: orientation as f32,
                size: m.count as f32,
            });
        }
        measures
    }

    fn render_output(&self, frame: &Frame) -> Frame {
        let mut img: RgbImage =
            ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                .expect("frame buffer matches its dimensions");

        for blob in &self.blobs {
            let props = blob.properties();
            let radius = (props.size.sqrt() as i32).max(4);
            draw_hollow_circle_mut(
                &mut img,
                (props.position.x, props.position.y),
                radius,
                Rgb([0, 255, 0]),
            );
        }

        Frame {
            data: img.into_raw(),
            width: frame.width,
            height: frame.height,
        }
    }
}

impl Default for LightSpots {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for LightSpots {
    fn detect(&mut self, frames: &[Frame]) -> Message {
        let Some(frame) = frames.first().filter(|f| !f.is_empty()) else {
            return self.base.last_message.clone();
        };

        let mut luma = frame.luma();
        if let Some(mask) = self.base.mask_for(&luma, Interpolation::Nearest) {
            apply_mask(&mut luma, &mask);
        }

        let level = self.detection_level;
        let mut binary: GrayImage = ImageBuffer::from_fn(luma.width, luma.height, |x, y| {
            if luma.pixel(x, y) >= level {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        if self.filter_size > 0 {
            binary = erode(&binary, Norm::LInf, self.filter_size);
        }

        let measures = self.measurements(frame, &binary);
        track_blobs(&measures, &mut self.blobs, self.lifetime);

        let mut message = Message::new();
        message.push(self.blobs.len() as i32);
        message.push(FIELDS_PER_BLOB);
        for blob in &self.blobs {
            let props = blob.properties();
            message.push(props.position.x);
            message.push(props.position.y);
            message.push(props.size as i32);
            message.push(props.orientation.to_degrees() as i32);
            message.push(blob.id() as i32);
        }

        if self.base.verbose {
            tracing::debug!(
                blobs = self.blobs.len(),
                measures = measures.len(),
                "light spots cycle"
            );
        }

        self.base.output = self.render_output(frame);
        self.base.last_message = message.clone();
        message
    }

    fn last_message(&self) -> Message {
        self.base.last_message.clone()
    }

    fn output(&self) -> Frame {
        self.base.output.clone()
    }

    fn set_mask(&mut self, mask: GrayFrame) {
        self.base.set_mask(mask);
    }

    fn set_parameter(&mut self, message: &Message) {
        if self.base.set_base_parameter(message) {
            return;
        }
        let Ok(name) = message.str_at(0) else {
            return;
        };
        match name {
            "detectionLevel" => {
                if let Ok(value) = message.int_at(1) {
                    self.detection_level = value.clamp(0, 255) as u8;
                }
            }
            "filterSize" => {
                if let Ok(value) = message.int_at(1) {
                    self.filter_size = value.clamp(0, 32) as u8;
                }
            }
            "lifetime" => {
                if let Ok(value) = message.int_at(1) {
                    self.lifetime = value.max(0);
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
            Ok("detectionLevel") => {
                crate::message!["detectionLevel", self.detection_level as i32]
            }
            Ok("filterSize") => crate::message!["filterSize", self.filter_size as i32],
            Ok("lifetime") => crate::message!["lifetime", self.lifetime],
            _ => Message::new(),
        }
    }

    fn add_source(&mut self, source: Weak<Mutex<dyn Source + Send>>) {
        self.base.sources.push(source);
    }

    fn name(&self) -> &str {
        &self.base.name
    }

    fn osc_path(&self) -> &str {
        &self.base.osc_path
    }

    fn source_nbr(&self) -> u32 {
        SOURCE_NBR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_spot(x: u32, y: u32) -> Frame {
        let mut frame = Frame::black(64, 64);
        for dy in 0..4 {
            for dx in 0..4 {
                let idx = (((y + dy) * 64 + x + dx) * 3) as usize;
                frame.data[idx] = 255;
                frame.data[idx + 1] = 255;
                frame.data[idx + 2] = 255;
            }
        }
        frame
    }

    #[test]
    fn a_bright_spot_becomes_one_blob() {
        let mut detector = LightSpots::new();
        detector.set_parameter(&crate::message!["filterSize", 0]);

        let report = detector.detect(&[frame_with_spot(10, 10)]);
        assert_eq!(report.int_at(0).unwrap(), 1);
        assert_eq!(report.int_at(1).unwrap(), FIELDS_PER_BLOB);

        let x = report.int_at(2).unwrap();
        let y = report.int_at(3).unwrap();
        assert!((10..14).contains(&x), "x = {x}");
        assert!((10..14).contains(&y), "y = {y}");
    }

    #[test]
    fn empty_frame_reports_zero_blobs() {
        let mut detector = LightSpots::new();
        detector.set_parameter(&crate::message!["lifetime", 0]);
        let report = detector.detect(&[Frame::black(32, 32)]);
        assert_eq!(report.int_at(0).unwrap(), 0);
        assert_eq!(report.int_at(1).unwrap(), FIELDS_PER_BLOB);
    }

    #[test]
    fn mask_suppresses_detection() {
        let mut detector = LightSpots::new();
        detector.set_parameter(&crate::message!["filterSize", 0]);
        detector.set_mask(GrayFrame::new(64, 64)); // all-zero: nothing active

        let report = detector.detect(&[frame_with_spot(20, 20)]);
        assert_eq!(report.int_at(0).unwrap(), 0);
    }

    #[test]
    fn output_has_the_input_dimensions() {
        let mut detector = LightSpots::new();
        detector.detect(&[frame_with_spot(8, 8)]);
        let output = detector.output();
        assert_eq!((output.width, output.height), (64, 64));
    }
}
