//! shm — shared-memory image publishing
//!
//! Each flow owns one channel: a memory-mapped file at a stable,
//! flow-id-derived path, rewritten with the detector's output every cycle.
//! The wire format is a small fixed header followed by packed RGB24 pixels,
//! so external consumers (and the Shmdata source) can poll it without any
//! further protocol.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use memmap2::{Mmap, MmapMut};

use crate::video::Frame;

const MAGIC: u32 = 0x424c_4f42; // "BLOB"
const HEADER_LEN: usize = 24;

/// Default location of a flow's output channel.
pub fn output_path(flow_id: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/blobserver_output_{flow_id}"))
}

/// A writable shared-memory image channel.
pub struct ShmImage {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    frame_counter: u64,
}

impl ShmImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("could not create shm file {}", path.display()))?;
        Ok(Self {
            path,
            file,
            map: None,
            frame_counter: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish one frame.  The backing file is regrown (and remapped) when
    /// the image dimensions change.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        let needed = HEADER_LEN + frame.data.len();
        let resize = self.map.as_ref().map(|m| m.len() != needed).unwrap_or(true);
        if resize {
            self.file
                .set_len(needed as u64)
                .context("could not resize shm file")?;
            // SAFETY: the map lives as long as the file handle held above.
            self.map = Some(unsafe {
                MmapMut::map_mut(&self.file).context("could not map shm file")?
            });
        }

        self.frame_counter += 1;
        let map = self.map.as_mut().expect("mapped above");
        map[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        map[4..8].copy_from_slice(&frame.width.to_le_bytes());
        map[8..12].copy_from_slice(&frame.height.to_le_bytes());
        map[12..16].copy_from_slice(&3u32.to_le_bytes());
        map[16..24].copy_from_slice(&self.frame_counter.to_le_bytes());
        map[HEADER_LEN..].copy_from_slice(&frame.data);
        map.flush().context("shm flush failed")?;
        Ok(())
    }
}

impl Drop for ShmImage {
    fn drop(&mut self) {
        self.map = None;
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %err, "shm file not removed");
        }
    }
}

/// Read the latest published image from a channel, validating the header.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("could not open shm file {}", path.display()))?;
    // SAFETY: read-only map of a regular file; a concurrent writer can at
    // worst hand us a torn frame, which the caller treats as transient.
    let map = unsafe { Mmap::map(&file).context("could not map shm file")? };

    if map.len() < HEADER_LEN {
        bail!("shm file too short: {} bytes", map.len());
    }
    let magic = u32::from_le_bytes(map[0..4].try_into().expect("sliced"));
    if magic != MAGIC {
        bail!("shm file has wrong magic: {magic:#x}");
    }
    let width = u32::from_le_bytes(map[4..8].try_into().expect("sliced"));
    let height = u32::from_le_bytes(map[8..12].try_into().expect("sliced"));
    let channels = u32::from_le_bytes(map[12..16].try_into().expect("sliced"));
    if channels != 3 {
        bail!("unsupported channel count {channels}");
    }

    let len = (width * height * 3) as usize;
    if map.len() < HEADER_LEN + len {
        bail!("shm file truncated: header promises {len} pixel bytes");
    }

    Ok(Frame {
        data: map[HEADER_LEN..HEADER_LEN + len].to_vec(),
        width,
        height,
    })
}

/// Remove stale output files from a previous run: anything in /tmp whose
/// name contains "blobserver" goes.
pub fn clean_stale_outputs() {
    let Ok(entries) = std::fs::read_dir("/tmp") else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().contains("blobserver") {
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "removed stale shm file"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "could not remove stale file")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shm_image_test_{}_{tag}", std::process::id()))
    }

    #[test]
    fn write_then_read_round_trip() {
        let path = scratch_path("round_trip");
        {
            let mut shm = ShmImage::open(&path).unwrap();
            let mut frame = Frame::black(6, 4);
            frame.data[0] = 42;
            shm.write(&frame).unwrap();

            let back = read_image(&path).unwrap();
            assert_eq!(back.width, 6);
            assert_eq!(back.height, 4);
            assert_eq!(back.data[0], 42);
        }
        assert!(!path.exists(), "channel file should be removed on drop");
    }

    #[test]
    fn dimension_change_regrows_the_file() {
        let path = scratch_path("regrow");
        let mut shm = ShmImage::open(&path).unwrap();
        shm.write(&Frame::black(4, 4)).unwrap();
        shm.write(&Frame::black(16, 16)).unwrap();

        let back = read_image(&path).unwrap();
        assert_eq!((back.width, back.height), (16, 16));
    }

    #[test]
    fn reading_garbage_is_an_error() {
        let path = scratch_path("garbage");
        std::fs::write(&path, b"not a blob image").unwrap();
        assert!(read_image(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
