use super::backend::{BackendFactory, BackendKind, CameraBackend};
use crate::config::CameraConfig;
use crate::error::CameraError;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use image::RgbImage;
use tracing::{debug, error, info, trace, warn};

/// GStreamer pipeline ending in an RGB appsink.
///
/// GigE cameras are reached through `aravissrc` and stream only between
/// `start_streaming` and `stop_streaming`. Webcams are reached through
/// `v4l2src` and run free from `open` to `close`; the single-buffer appsink
/// keeps the newest frame.
pub struct GstBackend {
    kind: BackendKind,
    device: String,
    pipeline_desc: String,
    pull_timeout_ms: u64,
    pipeline: Option<Pipeline>,
    appsink: Option<AppSink>,
    streaming: bool,
}

impl GstBackend {
    pub fn gige(address: &str, config: &CameraConfig) -> Self {
        let source = format!("aravissrc camera-name={}", address);
        Self::with_source(BackendKind::GigE, address.to_string(), &source, config)
    }

    pub fn webcam(index: u32, config: &CameraConfig) -> Self {
        let device = format!("/dev/video{}", index);
        let source = format!("v4l2src device={}", device);
        Self::with_source(BackendKind::Webcam, device, &source, config)
    }

    fn with_source(kind: BackendKind, device: String, source: &str, config: &CameraConfig) -> Self {
        let (width, height) = config.resolution;
        let pipeline_desc = format!(
            "{} ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=sink sync=false max-buffers=1 drop=true emit-signals=false",
            source, width, height
        );

        Self {
            kind,
            device,
            pipeline_desc,
            pull_timeout_ms: config.capture_timeout_ms,
            pipeline: None,
            appsink: None,
            streaming: false,
        }
    }

    fn build_pipeline(&self) -> Result<(Pipeline, AppSink), CameraError> {
        gstreamer::init().map_err(|e| CameraError::Backend {
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        debug!("Creating GStreamer pipeline: {}", self.pipeline_desc);

        let pipeline = gstreamer::parse::launch(&self.pipeline_desc)
            .map_err(|e| CameraError::Backend {
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| CameraError::Backend {
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Backend {
                details: "Pipeline has no appsink".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| CameraError::Backend {
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        Ok((pipeline, appsink))
    }

    /// Pipeline state held while nobody is streaming
    fn idle_state(&self) -> gstreamer::State {
        match self.kind {
            BackendKind::GigE => gstreamer::State::Ready,
            BackendKind::Webcam => gstreamer::State::Playing,
        }
    }

    fn free_running(&self) -> bool {
        self.idle_state() == gstreamer::State::Playing
    }

    fn set_state(&self, state: gstreamer::State) -> Result<(), CameraError> {
        let pipeline = self.pipeline.as_ref().ok_or_else(|| CameraError::Backend {
            details: "Pipeline not initialized".to_string(),
        })?;
        pipeline
            .set_state(state)
            .map(|_| ())
            .map_err(|e| CameraError::Backend {
                details: format!("Failed to set {} to {:?}: {}", self.device, state, e),
            })
    }

    fn pull_image(&self) -> Option<RgbImage> {
        let appsink = self.appsink.as_ref()?;
        let sample =
            appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(self.pull_timeout_ms))?;

        match sample_to_rgb(&sample) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Discarding sample from {}: {}", self.device, e);
                None
            }
        }
    }
}

impl CameraBackend for GstBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("{} {}", self.kind, self.device)
    }

    fn open(&mut self) -> Result<(), CameraError> {
        let (pipeline, appsink) = self.build_pipeline()?;
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);

        // READY opens a GigE device without starting acquisition
        if let Err(e) = self.set_state(self.idle_state()) {
            self.close();
            return Err(e);
        }

        info!("Opened {}", self.describe());
        Ok(())
    }

    fn close(&mut self) {
        if self.pipeline.is_some() {
            if let Err(e) = self.set_state(gstreamer::State::Null) {
                error!("Error closing {}: {}", self.device, e);
            }
        }
        self.streaming = false;
        self.appsink = None;
        self.pipeline = None;
    }

    fn grab_frame(&mut self) -> Option<RgbImage> {
        if self.streaming || self.free_running() {
            return self.pull_image();
        }

        // Single-shot: run the pipeline just long enough for one sample
        if let Err(e) = self.set_state(gstreamer::State::Playing) {
            warn!("Single-shot grab failed: {}", e);
            return None;
        }
        let image = self.pull_image();
        if let Err(e) = self.set_state(gstreamer::State::Ready) {
            warn!("Failed to pause {} after grab: {}", self.device, e);
        }
        image
    }

    fn start_streaming(&mut self) -> Result<(), CameraError> {
        if self.free_running() {
            self.streaming = true;
            return Ok(());
        }
        self.set_state(gstreamer::State::Playing)
            .map_err(|e| CameraError::Streaming {
                details: e.to_string(),
            })?;
        self.streaming = true;
        debug!("Continuous acquisition started on {}", self.device);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if self.free_running() {
            self.streaming = false;
            return;
        }
        if let Err(e) = self.set_state(gstreamer::State::Ready) {
            error!("Failed to stop continuous acquisition on {}: {}", self.device, e);
        }
        self.streaming = false;
        debug!("Continuous acquisition stopped on {}", self.device);
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy a packed RGB sample into an image, honouring the row stride
fn sample_to_rgb(sample: &gstreamer::Sample) -> Result<RgbImage, CameraError> {
    let buffer = sample.buffer().ok_or_else(|| CameraError::GrabFailed {
        details: "No buffer in sample".to_string(),
    })?;

    let caps = sample.caps().ok_or_else(|| CameraError::GrabFailed {
        details: "No caps in sample".to_string(),
    })?;

    let video_info = VideoInfo::from_caps(caps).map_err(|e| CameraError::GrabFailed {
        details: format!("Failed to get video info: {}", e),
    })?;

    let width = video_info.width();
    let height = video_info.height();
    let stride = video_info.stride()[0] as usize;
    let row_bytes = width as usize * 3;

    if width == 0 || height == 0 {
        return Err(CameraError::GrabFailed {
            details: "Empty sample".to_string(),
        });
    }

    let map = buffer.map_readable().map_err(|e| CameraError::GrabFailed {
        details: format!("Failed to map buffer: {}", e),
    })?;
    let data = map.as_slice();

    if stride < row_bytes || data.len() < stride * (height as usize - 1) + row_bytes {
        return Err(CameraError::GrabFailed {
            details: format!(
                "Buffer of {} bytes too small for {}x{} (stride {})",
                data.len(),
                width,
                height,
                stride
            ),
        });
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + row_bytes]);
    }

    trace!("Pulled {}x{} RGB frame", width, height);

    RgbImage::from_raw(width, height, pixels).ok_or_else(|| CameraError::GrabFailed {
        details: "Frame size does not match its dimensions".to_string(),
    })
}

/// Builds GStreamer backends from the camera configuration
pub struct GstBackendFactory {
    config: CameraConfig,
}

impl GstBackendFactory {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for GstBackendFactory {
    fn gige(&self, address: &str) -> Box<dyn CameraBackend> {
        Box::new(GstBackend::gige(address, &self.config))
    }

    fn webcams(&self) -> Vec<Box<dyn CameraBackend>> {
        self.config
            .webcam_indices
            .iter()
            .map(|&index| Box::new(GstBackend::webcam(index, &self.config)) as Box<dyn CameraBackend>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webcam_pipeline_runs_free_between_grabs() {
        let config = crate::config::InspectionConfig::default().camera;
        let webcam = GstBackend::webcam(0, &config);
        assert_eq!(webcam.idle_state(), gstreamer::State::Playing);
        assert!(webcam.free_running());
        assert!(webcam.pipeline_desc.starts_with("v4l2src device=/dev/video0"));

        let gige = GstBackend::gige("10.0.0.1", &config);
        assert_eq!(gige.idle_state(), gstreamer::State::Ready);
        assert!(!gige.free_running());
    }
}
