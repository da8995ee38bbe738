use super::backend::{BackendFactory, BackendKind, CameraBackend};
use crate::error::CameraError;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Shared switches and counters for a [`MockBackend`].
///
/// The same control is kept by whoever built the backend, so behaviour can be
/// scripted and observed after the backend has been moved into a session.
#[derive(Debug, Default)]
pub struct MockControl {
    fail_open: AtomicBool,
    blank_frames: AtomicBool,
    grab_delay_ms: AtomicU64,
    failing_grabs: Mutex<HashSet<u64>>,
    grabs: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    stream_starts: AtomicU64,
    stream_stops: AtomicU64,
    streaming: AtomicBool,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A device that refuses to open
    pub fn unavailable() -> Arc<Self> {
        let control = Self::default();
        control.fail_open.store(true, Ordering::Relaxed);
        Arc::new(control)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Make the `n`th grab (1-based, counted over the device lifetime) fail
    pub fn fail_grab(&self, n: u64) {
        self.failing_grabs.lock().insert(n);
    }

    /// Return zero-sized frames instead of images
    pub fn set_blank_frames(&self, blank: bool) {
        self.blank_frames.store(blank, Ordering::Relaxed);
    }

    /// Block every grab for `delay`, simulating a stuck device
    pub fn set_grab_delay(&self, delay: Duration) {
        self.grab_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn grab_count(&self) -> u64 {
        self.grabs.load(Ordering::Relaxed)
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn stream_starts(&self) -> u64 {
        self.stream_starts.load(Ordering::Relaxed)
    }

    pub fn stream_stops(&self) -> u64 {
        self.stream_stops.load(Ordering::Relaxed)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }
}

/// Synthetic camera producing a light background with a dark coupling blob
pub struct MockBackend {
    kind: BackendKind,
    name: String,
    resolution: (u32, u32),
    control: Arc<MockControl>,
    opened: bool,
}

impl MockBackend {
    pub fn new(
        kind: BackendKind,
        name: impl Into<String>,
        resolution: (u32, u32),
        control: Arc<MockControl>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            resolution,
            control,
            opened: false,
        }
    }

    fn synthetic_frame(&self, sequence: u64) -> RgbImage {
        let (width, height) = self.resolution;
        let mut image = RgbImage::from_fn(width, height, |x, y| {
            let shade = 200u8.saturating_add(((x + y) % 32) as u8);
            Rgb([shade, shade, shade])
        });

        // The blob drifts around the centre so consecutive frames differ
        let radius = (width.min(height) / 4) as i32;
        let offset = ((sequence % 16) as i32 - 8) * 2;
        let center = (width as i32 / 2 + offset, height as i32 / 2);
        draw_filled_circle_mut(&mut image, center, radius, Rgb([40, 40, 48]));
        draw_filled_circle_mut(&mut image, center, radius / 2, Rgb([180, 180, 190]));
        image
    }
}

impl CameraBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("mock {} {}", self.kind, self.name)
    }

    fn open(&mut self) -> Result<(), CameraError> {
        self.control.opens.fetch_add(1, Ordering::Relaxed);
        if self.control.fail_open.load(Ordering::Relaxed) {
            return Err(CameraError::Backend {
                details: format!("{} is not reachable", self.describe()),
            });
        }
        debug!("Opened {}", self.describe());
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.opened {
            self.control.closes.fetch_add(1, Ordering::Relaxed);
            self.control.streaming.store(false, Ordering::Relaxed);
            self.opened = false;
        }
    }

    fn grab_frame(&mut self) -> Option<RgbImage> {
        if !self.opened {
            return None;
        }

        let sequence = self.control.grabs.fetch_add(1, Ordering::Relaxed) + 1;

        let delay = self.control.grab_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        if self.control.failing_grabs.lock().contains(&sequence) {
            trace!("Scripted grab failure on grab {}", sequence);
            return None;
        }

        if self.control.blank_frames.load(Ordering::Relaxed) {
            return Some(RgbImage::new(0, 0));
        }

        Some(self.synthetic_frame(sequence))
    }

    fn start_streaming(&mut self) -> Result<(), CameraError> {
        if !self.opened {
            return Err(CameraError::Streaming {
                details: "device is not open".to_string(),
            });
        }
        if self.kind == BackendKind::GigE {
            self.control.stream_starts.fetch_add(1, Ordering::Relaxed);
            self.control.streaming.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if self.kind == BackendKind::GigE {
            self.control.stream_stops.fetch_add(1, Ordering::Relaxed);
            self.control.streaming.store(false, Ordering::Relaxed);
        }
    }
}

/// Factory handing out mock backends that share scripted controls
pub struct MockBackendFactory {
    resolution: (u32, u32),
    gige: Arc<MockControl>,
    webcams: Vec<Arc<MockControl>>,
}

impl MockBackendFactory {
    /// A reachable GigE camera and no fallback webcams
    pub fn new(resolution: (u32, u32)) -> Self {
        Self {
            resolution,
            gige: MockControl::new(),
            webcams: Vec::new(),
        }
    }

    pub fn with_gige(mut self, control: Arc<MockControl>) -> Self {
        self.gige = control;
        self
    }

    pub fn with_webcam(mut self, control: Arc<MockControl>) -> Self {
        self.webcams.push(control);
        self
    }

    pub fn gige_control(&self) -> Arc<MockControl> {
        Arc::clone(&self.gige)
    }

    pub fn webcam_control(&self, index: usize) -> Option<Arc<MockControl>> {
        self.webcams.get(index).cloned()
    }
}

impl BackendFactory for MockBackendFactory {
    fn gige(&self, address: &str) -> Box<dyn CameraBackend> {
        Box::new(MockBackend::new(
            BackendKind::GigE,
            address,
            self.resolution,
            Arc::clone(&self.gige),
        ))
    }

    fn webcams(&self) -> Vec<Box<dyn CameraBackend>> {
        self.webcams
            .iter()
            .enumerate()
            .map(|(index, control)| {
                Box::new(MockBackend::new(
                    BackendKind::Webcam,
                    format!("video{}", index),
                    self.resolution,
                    Arc::clone(control),
                )) as Box<dyn CameraBackend>
            })
            .collect()
    }
}
