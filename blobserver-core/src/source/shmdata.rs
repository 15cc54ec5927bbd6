//! Shared-memory ingest: frames published by another process through the
//! [`crate::shm`] wire format.
//!
//! The channel path is a parameter rather than part of the identity, so the
//! same sub-source can be re-pointed at a different producer at runtime.

use std::path::PathBuf;

use crate::message::Message;
use crate::shm;
use crate::source::{Source, SourceBase};
use crate::video::Frame;

pub const CLASS_NAME: &str = "Shmdata";
pub const DOCUMENTATION: &str = "Reads frames published to a shared-memory image channel";

pub struct ShmdataSource {
    base: SourceBase,
    path: PathBuf,
    connected: bool,
}

impl ShmdataSource {
    pub fn new(subsource: i32) -> Self {
        Self {
            base: SourceBase::new(CLASS_NAME, subsource),
            path: shm::output_path(subsource.max(0) as u32),
            connected: false,
        }
    }
}

impl Source for ShmdataSource {
    fn connect(&mut self) -> bool {
        self.connected = true;
        // The producer may not have published yet; a missing file here is not
        // an error, grabs will pick the channel up once it appears.
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "shm channel not yet present");
        }
        true
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn grab_frame(&mut self) {
        if !self.connected {
            return;
        }
        match shm::read_image(&self.path) {
            Ok(frame) => {
                self.base.raw = frame;
                self.base.invalidate();
            }
            Err(err) => {
                // Transient by policy: producer restarting, torn write, not
                // yet published.  Keep the previous frame.
                tracing::debug!(path = %self.path.display(), error = %err, "shm grab skipped");
            }
        }
    }

    fn retrieve_corrected_frame(&mut self) -> Frame {
        self.base.corrected_frame()
    }

    fn set_parameter(&mut self, message: &Message) {
        if self.base.set_base_parameter(message) {
            return;
        }
        if let (Ok("path"), Ok(value)) = (message.str_at(0), message.str_at(1)) {
            self.path = PathBuf::from(value);
        }
    }

    fn get_parameter(&self, message: &Message) -> Message {
        if let Some(reply) = self.base.get_base_parameter(message) {
            return reply;
        }
        match message.str_at(0) {
            Ok("path") => crate::message!["path", self.path.to_string_lossy().to_string()],
            _ => Message::new(),
        }
    }

    fn get_subsources(&self) -> Message {
        // Channels are addressed by path; there is no enumerable device list.
        Message::new()
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
    use crate::shm::ShmImage;

    #[test]
    fn grabs_frames_published_by_a_writer() {
        let path = std::env::temp_dir().join(format!("shmdata_src_{}", std::process::id()));
        let mut writer = ShmImage::open(&path).unwrap();
        let mut frame = Frame::black(8, 8);
        frame.data[5] = 99;
        writer.write(&frame).unwrap();

        let mut source = ShmdataSource::new(0);
        source.set_parameter(&crate::message!["path", path.to_string_lossy().to_string()]);
        assert!(source.connect());
        source.grab_frame();

        let grabbed = source.retrieve_corrected_frame();
        assert_eq!(grabbed.width, 8);
        assert_eq!(grabbed.data[5], 99);
    }

    #[test]
    fn missing_channel_keeps_previous_frame() {
        let mut source = ShmdataSource::new(0);
        source.set_parameter(&crate::message!["path", "/nonexistent/blob_channel"]);
        source.connect();
        source.grab_frame();
        assert!(source.retrieve_corrected_frame().is_empty());
    }
}
