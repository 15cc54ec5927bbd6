//! runtime — the flow scheduler
//!
//! One `App` value owns the source set, the flow set and the counters; it is
//! built in the entry point and shared by `Arc` with the control server and
//! the grab thread.  Locking is two-level: the flow lock guards the flow set,
//! the source lock guards the source set.  Whoever needs both takes the flow
//! lock first; the grab thread only ever takes the source lock.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::factory::{detector_factory, source_factory, DetectorFactory, SourceFactory};
use crate::detection::Detector;
use crate::server::OscClient;
use crate::shm::ShmImage;
use crate::source::Source;
use crate::video::{Frame, GrayFrame};

/// Pause between grab sweeps.
const GRAB_INTERVAL: Duration = Duration::from_millis(1);
/// Placeholder dimensions for the first display buffer.
const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;

/// A subscription: one detector, its input sources, the subscriber endpoint
/// and the shared-memory output channel.
pub struct Flow {
    pub id: u32,
    pub detector: Box<dyn Detector + Send>,
    pub sources: Vec<Arc<Mutex<dyn Source + Send>>>,
    pub client: Arc<OscClient>,
    pub shm: ShmImage,
    pub run: bool,
}

/// The process-wide runtime, passed around explicitly.
pub struct App {
    pub detector_factory: DetectorFactory,
    pub source_factory: SourceFactory,
    pub sources: Mutex<Vec<Arc<Mutex<dyn Source + Send>>>>,
    pub flows: Mutex<Vec<Flow>>,
    /// Mask handed to every newly connected detector, from `--mask`.
    pub mask: Mutex<Option<GrayFrame>>,
    /// Whether subscriber transports use TCP instead of UDP.
    pub tcp: bool,
    next_flow_id: AtomicU32,
    frame_nbr: AtomicI32,
    running: AtomicBool,
}

impl App {
    pub fn new(tcp: bool) -> Self {
        Self {
            detector_factory: detector_factory(),
            source_factory: source_factory(),
            sources: Mutex::new(Vec::new()),
            flows: Mutex::new(Vec::new()),
            mask: Mutex::new(None),
            tcp,
            next_flow_id: AtomicU32::new(0),
            frame_nbr: AtomicI32::new(0),
            running: AtomicBool::new(true),
        }
    }

    /// A new unique flow id, strictly greater than every id handed out before.
    pub fn valid_id(&self) -> u32 {
        self.next_flow_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn frame_nbr(&self) -> i32 {
        self.frame_nbr.load(Ordering::SeqCst)
    }

    /// One grab sweep: pull a frame from every registered source in insertion
    /// order, then drop sources nothing references any more.  Takes only the
    /// source lock; the flow list is out of bounds here.
    pub fn grab_sweep(&self) {
        let mut sources = self.sources.lock().expect("source lock poisoned");
        for source in sources.iter() {
            source.lock().expect("source poisoned").grab_frame();
        }

        // A strong count of one means only this set still owns the source:
        // every flow using it is gone.
        sources.retain(|source| {
            if Arc::strong_count(source) == 1 {
                let mut source = source.lock().expect("source poisoned");
                tracing::info!(
                    source = source.name(),
                    subsource = source.subsource_nbr(),
                    "source no longer used, disconnecting"
                );
                source.disconnect();
                false
            } else {
                true
            }
        });
    }

    /// Grab loop body, run on its own thread.
    pub fn run_grab_loop(&self) {
        while self.is_running() {
            self.grab_sweep();
            std::thread::sleep(GRAB_INTERVAL);
        }
    }

    /// One main-loop cycle: refresh the display list, run every active flow
    /// and emit its frame envelope.  Returns the display buffers (label +
    /// image) for an attached preview.
    pub fn process_cycle(&self) -> Vec<(String, Frame)> {
        let mut display = vec![(
            "This is Blobserver".to_string(),
            Frame::black(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT),
        )];

        {
            let sources = self.sources.lock().expect("source lock poisoned");
            for source in sources.iter() {
                let mut source = source.lock().expect("source poisoned");
                let frame = source.retrieve_corrected_frame();
                let id = source
                    .get_parameter(&crate::message!["id"])
                    .int_at(1)
                    .unwrap_or(-1);
                display.push((format!("{} {}", source.name(), id), frame));
            }
        }

        let frame_nbr = self.frame_nbr.load(Ordering::SeqCst);
        {
            let mut flows = self.flows.lock().expect("flow lock poisoned");
            for flow in flows.iter_mut() {
                if !flow.run {
                    continue;
                }

                // The grab thread cannot drop these sources: the flow itself
                // keeps them alive.
                let frames: Vec<Frame> = flow
                    .sources
                    .iter()
                    .map(|s| s.lock().expect("source poisoned").retrieve_corrected_frame())
                    .collect();

                let message = flow.detector.detect(&frames);

                let output = flow.detector.output();
                if let Err(err) = flow.shm.write(&output) {
                    tracing::warn!(flow = flow.id, error = %err, "shm publish failed");
                }
                display.push((flow.detector.name().to_string(), output));

                // Frame envelope: start marker, one message per blob record,
                // end marker.  An unreachable subscriber is absorbed by the
                // client transport; the flow persists.
                flow.client.send(
                    crate::server::PATH_START_FRAME,
                    &crate::message![frame_nbr, flow.id as i32],
                );

                let nbr = message.int_at(0).unwrap_or(0).max(0) as usize;
                let size = message.int_at(1).unwrap_or(0).max(0) as usize;
                for i in 0..nbr {
                    let start = 2 + i * size;
                    let record = message.slice(start, start + size);
                    flow.client.send(flow.detector.osc_path(), &record);
                }

                flow.client.send(
                    crate::server::PATH_END_FRAME,
                    &crate::message![frame_nbr, flow.id as i32],
                );
            }
        }
        self.frame_nbr.fetch_add(1, Ordering::SeqCst);

        display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_ids_are_strictly_increasing() {
        let app = App::new(false);
        let first = app.valid_id();
        let second = app.valid_id();
        assert!(second > first);
        assert_eq!(first, 1);
    }

    #[test]
    fn cycle_on_an_empty_runtime_yields_the_placeholder() {
        let app = App::new(false);
        let display = app.process_cycle();
        assert_eq!(display.len(), 1);
        assert_eq!(display[0].0, "This is Blobserver");
    }

    #[test]
    fn frame_number_advances_once_per_cycle() {
        let app = App::new(false);
        assert_eq!(app.frame_nbr(), 0);
        app.process_cycle();
        app.process_cycle();
        assert_eq!(app.frame_nbr(), 2);
    }
}
