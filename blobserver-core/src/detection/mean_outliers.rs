//! Mean-outlier detector: flags the largest region deviating from the frame's
//! mean luminance and tracks it as a single blob.

use std::sync::{Mutex, Weak};

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use imageproc::region_labelling::{connected_components, Connectivity};
use nalgebra::Vector2;

use crate::detection::{apply_mask, Detector, DetectorBase};
use crate::message::Message;
use crate::source::Source;
use crate::tracking::{track_blobs, Blob2D, BlobProperties, DEFAULT_LIFETIME};
use crate::video::{Frame, GrayFrame, Interpolation};

pub const CLASS_NAME: &str = "MeanOutliers";
pub const DOCUMENTATION: &str =
    "Detects the largest area deviating from the mean image value and tracks it";
pub const SOURCE_NBR: u32 = 1;

const OSC_PATH: &str = "/blobserver/meanOutliers";
/// Fields per blob record: x, y, vx, vy, id.
const FIELDS_PER_BLOB: i32 = 5;

pub struct MeanOutliers {
    base: DetectorBase,
    blobs: Vec<Blob2D>,
    /// Deviation threshold as a multiple of the frame's standard deviation.
    detection_level: f32,
    filter_size: u8,
    lifetime: i32,
}

impl MeanOutliers {
    pub fn new() -> Self {
        Self {
            base: DetectorBase::new(CLASS_NAME, OSC_PATH),
            blobs: Vec::new(),
            detection_level: 2.0,
            filter_size: 1,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    /// Centroid and area of the largest connected outlier region, if any.
    fn largest_region(binary: &GrayImage) -> Option<(f64, f64, u64)> {
        let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));

        let mut counts: Vec<(u64, u64, u64)> = Vec::new(); // (count, sum_x, sum_y)
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if label >= counts.len() {
                counts.resize(label + 1, (0, 0, 0));
            }
            let entry = &mut counts[label];
            entry.0 += 1;
            entry.1 += x as u64;
            entry.2 += y as u64;
        }

        counts
            .iter()
            .filter(|entry| entry.0 > 0)
            .max_by_key(|entry| entry.0)
            .map(|&(count, sum_x, sum_y)| {
                (
                    sum_x as f64 / count as f64,
                    sum_y as f64 / count as f64,
                    count,
                )
            })
    }
}

impl Default for MeanOutliers {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for MeanOutliers {
    fn detect(&mut self, frames: &[Frame]) -> Message {
        let Some(frame) = frames.first().filter(|f| !f.is_empty()) else {
            return self.base.last_message.clone();
        };

        let mut luma = frame.luma();
        if let Some(mask) = self.base.mask_for(&luma, Interpolation::Nearest) {
            apply_mask(&mut luma, &mask);
        }

        let count = luma.data.len() as f64;
        let mean = luma.data.iter().map(|&v| v as f64).sum::<f64>() / count;
        let variance = luma
            .data
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count;
        let threshold = (self.detection_level as f64 * variance.sqrt()).max(1.0);

        let mut binary: GrayImage = ImageBuffer::from_fn(luma.width, luma.height, |x, y| {
            if (luma.pixel(x, y) as f64 - mean).abs() > threshold {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        if self.filter_size > 0 {
            binary = erode(&binary, Norm::LInf, self.filter_size);
        }

        let measures: Vec<BlobProperties> = Self::largest_region(&binary)
            .map(|(cx, cy, area)| {
                let px = (cx as u32).min(frame.width - 1);
                let py = (cy as u32).min(frame.height - 1);
                BlobProperties {
                    position: Vector2::new(cx.round() as i32, cy.round() as i32),
                    speed: Vector2::new(0.0, 0.0),
                    color: frame.pixel(px, py),
                    orientation: 0.0,
                    size: area as f32,
                }
            })
            .into_iter()
            .collect();

        track_blobs(&measures, &mut self.blobs, self.lifetime);

        let mut message = Message::new();
        message.push(self.blobs.len() as i32);
        message.push(FIELDS_PER_BLOB);
        for blob in &self.blobs {
            let props = blob.properties();
            message.push(props.position.x);
            message.push(props.position.y);
            message.push(props.speed.x as i32);
            message.push(props.speed.y as i32);
            message.push(blob.id() as i32);
        }

        if self.base.verbose {
            tracing::debug!(blobs = self.blobs.len(), mean, "mean outliers cycle");
        }

        // The binary outlier map is the useful derived view here.
        self.base.output = Frame {
            data: binary.pixels().flat_map(|p| [p[0], p[0], p[0]]).collect(),
            width: frame.width,
            height: frame.height,
        };
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
                if let Ok(value) = message.float_at(1) {
                    self.detection_level = value.max(0.1);
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
            Ok("detectionLevel") => crate::message!["detectionLevel", self.detection_level],
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
