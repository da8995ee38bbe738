use super::backend::{BackendFactory, BackendKind, CameraBackend};
use super::state::{CameraState, CameraStatus};
use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::frame::Frame;
use crate::storage::RecordSink;
use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type SharedBackend = Arc<Mutex<Box<dyn CameraBackend>>>;

struct BoundBackend {
    kind: BackendKind,
    description: String,
    handle: SharedBackend,
    /// Continuous acquisition engaged (GigE only)
    streaming: bool,
}

struct PreviewTask {
    fps: u32,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Session {
    backend: Option<BoundBackend>,
    preview: Option<PreviewTask>,
    hibernated: bool,
    hibernation_timer: Option<JoinHandle<()>>,
    last_used: Option<DateTime<Utc>>,
    loaded_model: Option<String>,
}

struct Inner {
    config: CameraConfig,
    hibernation_window: Duration,
    factory: Arc<dyn BackendFactory>,
    sink: Option<Arc<dyn RecordSink>>,
    session: tokio::sync::Mutex<Session>,
    latest_frame: Arc<Mutex<Option<Frame>>>,
    frame_counter: Arc<AtomicU64>,
    hibernation_generation: AtomicU64,
    routine_lease: Arc<AtomicBool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Some(preview) = session.preview.take() {
            preview.cancel.cancel();
        }
        if let Some(timer) = session.hibernation_timer.take() {
            timer.abort();
        }
    }
}

/// The single camera session of the process.
///
/// Cloning is cheap and every clone drives the same session. Lifecycle
/// transitions are serialized; frame reads never wait on them.
#[derive(Clone)]
pub struct CameraLifecycle {
    inner: Arc<Inner>,
}

/// Exclusive claim on the camera held by a running inspection routine.
///
/// While it is alive `release()` is rejected. Dropping it gives the claim back.
pub struct RoutineLease {
    flag: Arc<AtomicBool>,
}

impl Drop for RoutineLease {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        debug!("Routine lease on camera released");
    }
}

impl CameraLifecycle {
    pub fn new(
        config: CameraConfig,
        factory: Arc<dyn BackendFactory>,
        sink: Option<Arc<dyn RecordSink>>,
    ) -> Self {
        let hibernation_window = config.hibernation_window();
        Self::with_hibernation_window(config, factory, sink, hibernation_window)
    }

    /// Like [`CameraLifecycle::new`] with an inactivity window finer than the
    /// whole seconds the configuration carries
    pub fn with_hibernation_window(
        config: CameraConfig,
        factory: Arc<dyn BackendFactory>,
        sink: Option<Arc<dyn RecordSink>>,
        hibernation_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hibernation_window,
                factory,
                sink,
                session: tokio::sync::Mutex::new(Session::default()),
                latest_frame: Arc::new(Mutex::new(None)),
                frame_counter: Arc::new(AtomicU64::new(0)),
                hibernation_generation: AtomicU64::new(0),
                routine_lease: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.inner.config
    }

    /// Bind a device: the GigE camera at `address` first, then the fallback
    /// webcams in order. A webcam only counts once it delivers a non-empty frame.
    pub async fn initialize(&self, address: &str) -> Result<BackendKind, CameraError> {
        let mut session = self.inner.session.lock().await;
        if session.backend.is_some() {
            return Err(CameraError::AlreadyInitialized);
        }

        info!("Initializing camera, trying GigE device at {}", address);
        let timeout = self.inner.config.capture_timeout();

        let bound = match open_backend(self.inner.factory.gige(address), false, timeout).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!("GigE camera at {} unavailable: {}", address, e);
                let candidates = self.inner.factory.webcams();
                let count = candidates.len();
                let mut found = None;
                for candidate in candidates {
                    let description = candidate.describe();
                    match open_backend(candidate, true, timeout).await {
                        Ok(bound) => {
                            found = Some(bound);
                            break;
                        }
                        Err(e) => debug!("Fallback {} rejected: {}", description, e),
                    }
                }
                found.ok_or_else(|| {
                    error!("No camera available (GigE and {} webcams failed)", count);
                    CameraError::NoDevice {
                        address: address.to_string(),
                        webcams: count,
                    }
                })?
            }
        };

        let kind = bound.kind;
        info!("Camera bound to {}", bound.description);
        session.backend = Some(bound);
        session.hibernated = false;
        session.last_used = Some(Utc::now());

        self.persist(&session).await;
        Ok(kind)
    }

    /// Single-shot grab from the bound device
    pub async fn capture(&self) -> Result<Frame, CameraError> {
        let handle = {
            let mut session = self.inner.session.lock().await;
            let handle = Arc::clone(
                &session
                    .backend
                    .as_ref()
                    .ok_or(CameraError::NotInitialized)?
                    .handle,
            );
            session.last_used = Some(Utc::now());
            handle
        };

        let image = grab(&handle, self.inner.config.capture_timeout()).await?;
        let id = self.inner.frame_counter.fetch_add(1, Ordering::Relaxed);
        debug!("Captured frame {} ({}x{})", id, image.width(), image.height());
        Ok(Frame::new(id, image))
    }

    pub async fn start_preview(&self, fps: u32) -> Result<(), CameraError> {
        let mut session = self.inner.session.lock().await;
        self.start_preview_locked(&mut session, fps).await?;
        self.persist(&session).await;
        Ok(())
    }

    pub async fn stop_preview(&self) -> Result<(), CameraError> {
        let mut session = self.inner.session.lock().await;
        self.stop_preview_locked(&mut session).await?;
        self.cancel_hibernation_timer(&mut session);
        self.persist(&session).await;
        Ok(())
    }

    /// Pause the preview while keeping the device bound
    pub async fn hibernate(&self) -> Result<(), CameraError> {
        let mut session = self.inner.session.lock().await;
        self.hibernate_locked(&mut session).await?;
        self.persist(&session).await;
        Ok(())
    }

    /// Resume the preview, leaving hibernation if needed
    pub async fn reactivate(&self, fps: u32) -> Result<(), CameraError> {
        let mut session = self.inner.session.lock().await;
        let was_hibernated = session.hibernated;
        if was_hibernated {
            info!("Reactivating camera from hibernation");
            session.hibernated = false;
        }

        let result = self.start_preview_locked(&mut session, fps).await;
        if result.is_err() && was_hibernated {
            session.hibernated = true;
        }

        self.persist(&session).await;
        result
    }

    /// Tear the session down completely. Safe to call in any state.
    pub async fn release(&self) -> Result<(), CameraError> {
        let mut session = self.inner.session.lock().await;
        if self.inner.routine_lease.load(Ordering::SeqCst) {
            warn!("Refusing to release camera while an inspection routine holds it");
            return Err(CameraError::RoutineActive);
        }

        if session.preview.is_some() {
            if let Err(e) = self.stop_preview_locked(&mut session).await {
                warn!("Error stopping preview during release: {}", e);
            }
        }
        self.cancel_hibernation_timer(&mut session);

        let timeout = self.inner.config.capture_timeout();
        let was_bound = match session.backend.take() {
            Some(backend) => {
                if backend.streaming {
                    stop_streaming(&backend.handle, timeout).await;
                }
                match with_backend(&backend.handle, "close", timeout, |b| b.close()).await {
                    Ok(()) => info!("Closed {}", backend.description),
                    Err(e) => warn!("Abandoning {}: {}", backend.description, e),
                }
                true
            }
            None => false,
        };

        session.hibernated = false;
        session.loaded_model = None;
        *self.inner.latest_frame.lock() = None;

        if was_bound {
            info!("Camera released");
            self.persist(&session).await;
        } else {
            debug!("Camera already released");
        }
        Ok(())
    }

    /// Most recent preview frame, without triggering a capture
    pub fn latest_frame(&self) -> Option<Frame> {
        self.inner.latest_frame.lock().clone()
    }

    /// Most recent preview frame as JPEG; encoded outside the frame lock
    pub fn latest_frame_jpeg(&self) -> Option<Vec<u8>> {
        let frame = self.latest_frame()?;
        match frame.to_jpeg(self.inner.config.jpeg_quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("Failed to encode preview frame {}: {}", frame.id, e);
                None
            }
        }
    }

    /// Postpone auto-hibernation. Call only for genuine user interaction,
    /// never from automatic frame polling.
    pub async fn reset_hibernation_timer(&self) -> bool {
        let mut session = self.inner.session.lock().await;
        session.last_used = Some(Utc::now());
        if session.preview.is_some() {
            self.arm_hibernation_timer(&mut session);
            true
        } else {
            false
        }
    }

    /// Record which segmentation model is resident
    pub async fn set_loaded_model(&self, model: Option<&str>) {
        let mut session = self.inner.session.lock().await;
        session.loaded_model = model.map(str::to_string);
    }

    pub async fn status(&self) -> CameraStatus {
        let session = self.inner.session.lock().await;
        self.snapshot(&session)
    }

    pub async fn is_active(&self) -> bool {
        self.inner.session.lock().await.backend.is_some()
    }

    /// Claim the camera for an inspection routine
    pub fn acquire_routine_lease(&self) -> Result<RoutineLease, CameraError> {
        self.inner
            .routine_lease
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CameraError::RoutineActive)?;
        debug!("Routine lease on camera acquired");
        Ok(RoutineLease {
            flag: Arc::clone(&self.inner.routine_lease),
        })
    }

    async fn start_preview_locked(&self, session: &mut Session, fps: u32) -> Result<(), CameraError> {
        if fps == 0 {
            return Err(CameraError::InvalidFrameRate { fps });
        }
        if session.preview.is_some() {
            return Err(CameraError::PreviewActive);
        }

        let handle = {
            let backend = session
                .backend
                .as_mut()
                .ok_or(CameraError::NotInitialized)?;

            if backend.kind == BackendKind::GigE && !backend.streaming {
                let timeout = self.inner.config.capture_timeout();
                with_backend(&backend.handle, "start streaming", timeout, |b| {
                    b.start_streaming()
                })
                .await
                .and_then(|result| result)
                .map_err(|e| match e {
                    streaming @ CameraError::Streaming { .. } => streaming,
                    other => CameraError::Streaming {
                        details: other.to_string(),
                    },
                })?;
                backend.streaming = true;
                debug!("Continuous acquisition engaged on {}", backend.description);
            }
            Arc::clone(&backend.handle)
        };

        let cancel = CancellationToken::new();
        let context = PreviewContext {
            backend: handle,
            latest_frame: Arc::clone(&self.inner.latest_frame),
            frame_counter: Arc::clone(&self.inner.frame_counter),
            fps,
            capture_timeout: self.inner.config.capture_timeout(),
            cancel: cancel.clone(),
        };

        session.preview = Some(PreviewTask {
            fps,
            cancel,
            handle: tokio::spawn(run_preview_loop(context)),
        });
        session.hibernated = false;
        session.last_used = Some(Utc::now());
        self.arm_hibernation_timer(session);

        info!("Preview started at {} fps", fps);
        Ok(())
    }

    async fn stop_preview_locked(&self, session: &mut Session) -> Result<(), CameraError> {
        let preview = session.preview.take().ok_or(CameraError::PreviewInactive)?;

        info!("Stopping preview");
        preview.cancel.cancel();

        let join_timeout = self.inner.config.preview_join_timeout();
        let mut handle = preview.handle;
        match tokio::time::timeout(join_timeout, &mut handle).await {
            Ok(Ok(())) => debug!("Preview task completed"),
            Ok(Err(e)) => error!("Error waiting for preview task: {}", e),
            Err(_) => {
                warn!(
                    "Preview task did not complete within {:?}, abandoning it",
                    join_timeout
                );
                handle.abort();
            }
        }

        // Continuous acquisition must always be torn down, or the next session
        // finds the device still streaming
        if let Some(backend) = session.backend.as_mut() {
            if backend.kind == BackendKind::GigE {
                stop_streaming(&backend.handle, self.inner.config.capture_timeout()).await;
                backend.streaming = false;
            }
        }

        Ok(())
    }

    async fn hibernate_locked(&self, session: &mut Session) -> Result<(), CameraError> {
        if session.backend.is_none() {
            return Err(CameraError::NotInitialized);
        }
        if session.preview.is_some() {
            self.stop_preview_locked(session).await?;
        }
        self.cancel_hibernation_timer(session);
        session.hibernated = true;
        info!("Camera hibernated, device kept bound");
        Ok(())
    }

    fn arm_hibernation_timer(&self, session: &mut Session) {
        if let Some(timer) = session.hibernation_timer.take() {
            timer.abort();
        }

        let generation = self
            .inner
            .hibernation_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let window = self.inner.hibernation_window;
        let weak = Arc::downgrade(&self.inner);

        session.hibernation_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                CameraLifecycle { inner }
                    .expire_hibernation(generation)
                    .await;
            }
        }));
        trace!("Hibernation timer armed for {:?}", window);
    }

    fn cancel_hibernation_timer(&self, session: &mut Session) {
        self.inner
            .hibernation_generation
            .fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = session.hibernation_timer.take() {
            timer.abort();
            trace!("Hibernation timer cancelled");
        }
    }

    /// Timer callback. A timer that lost a race with a reset or a stop finds a
    /// newer generation and does nothing.
    async fn expire_hibernation(&self, generation: u64) {
        let mut session = self.inner.session.lock().await;
        if self.inner.hibernation_generation.load(Ordering::SeqCst) != generation
            || session.preview.is_none()
        {
            trace!("Stale hibernation timer ignored");
            return;
        }

        // This task is the timer itself; detach its handle rather than abort it
        drop(session.hibernation_timer.take());

        info!(
            "No interaction for {:?}, hibernating camera",
            self.inner.hibernation_window
        );
        match self.hibernate_locked(&mut session).await {
            Ok(()) => self.persist(&session).await,
            Err(e) => warn!("Automatic hibernation failed: {}", e),
        }
    }

    fn snapshot(&self, session: &Session) -> CameraStatus {
        let previewing = session.preview.is_some();
        let state = match (&session.backend, previewing, session.hibernated) {
            (None, _, _) => CameraState::Uninitialized,
            (Some(_), true, _) => CameraState::Previewing,
            (Some(_), false, true) => CameraState::Hibernated,
            (Some(_), false, false) => CameraState::Active,
        };

        CameraStatus {
            state,
            active: session.backend.is_some(),
            previewing,
            hibernated: session.hibernated,
            backend: session.backend.as_ref().map(|b| b.kind),
            frame_rate: session.preview.as_ref().map(|p| p.fps).unwrap_or(0),
            last_used: session.last_used,
            loaded_model: session.loaded_model.clone(),
            has_frame: self.inner.latest_frame.lock().is_some(),
            routine_active: self.inner.routine_lease.load(Ordering::SeqCst),
            timestamp: Utc::now(),
        }
    }

    async fn persist(&self, session: &Session) {
        if let Some(sink) = &self.inner.sink {
            let status = self.snapshot(session);
            if let Err(e) = sink.save_camera_state(&status).await {
                warn!("Failed to persist camera state: {}", e);
            }
        }
    }
}

struct PreviewContext {
    backend: SharedBackend,
    latest_frame: Arc<Mutex<Option<Frame>>>,
    frame_counter: Arc<AtomicU64>,
    fps: u32,
    capture_timeout: Duration,
    cancel: CancellationToken,
}

/// Grab at a fixed cadence into the latest-frame buffer until cancelled.
/// Each iteration sleeps only what is left of its period.
async fn run_preview_loop(ctx: PreviewContext) {
    let period = Duration::from_secs_f64(1.0 / ctx.fps as f64);
    let mut consecutive_failures: u32 = 0;

    info!("Preview loop started ({:?} period)", period);

    loop {
        let started = Instant::now();

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            result = grab(&ctx.backend, ctx.capture_timeout) => {
                match result {
                    Ok(image) => {
                        let id = ctx.frame_counter.fetch_add(1, Ordering::Relaxed);
                        *ctx.latest_frame.lock() = Some(Frame::new(id, image));
                        consecutive_failures = 0;
                        trace!("Preview frame {} stored", id);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures == 1 || consecutive_failures % 50 == 0 {
                            warn!("Preview grab failed ({} in a row): {}", consecutive_failures, e);
                        } else {
                            debug!("Preview grab failed: {}", e);
                        }
                    }
                }
            }
        }

        let remaining = period.saturating_sub(started.elapsed());
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(remaining) => {}
        }
    }

    info!("Preview loop stopped");
}

/// Run `f` against the device on the blocking pool, giving up after `timeout`.
/// A call that times out keeps running detached.
async fn with_backend<T, F>(
    handle: &SharedBackend,
    operation: &str,
    timeout: Duration,
    f: F,
) -> Result<T, CameraError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn CameraBackend>) -> T + Send + 'static,
{
    let handle = Arc::clone(handle);
    let task = tokio::task::spawn_blocking(move || {
        let mut backend = handle.lock();
        f(&mut *backend)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CameraError::Backend {
            details: format!("Camera {} task failed: {}", operation, e),
        }),
        Err(_) => Err(CameraError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn grab(handle: &SharedBackend, timeout: Duration) -> Result<RgbImage, CameraError> {
    match with_backend(handle, "grab", timeout, |b| b.grab_frame()).await? {
        Some(image) if image.width() > 0 && image.height() > 0 => Ok(image),
        Some(_) => Err(CameraError::GrabFailed {
            details: "camera returned an empty frame".to_string(),
        }),
        None => Err(CameraError::GrabFailed {
            details: "camera returned no frame".to_string(),
        }),
    }
}

async fn stop_streaming(handle: &SharedBackend, timeout: Duration) {
    if let Err(e) = with_backend(handle, "stop streaming", timeout, |b| b.stop_streaming()).await {
        error!("Failed to stop continuous acquisition: {}", e);
    }
}

/// Open a candidate device, optionally requiring one good frame
async fn open_backend(
    backend: Box<dyn CameraBackend>,
    probe: bool,
    timeout: Duration,
) -> Result<BoundBackend, CameraError> {
    let kind = backend.kind();
    let description = backend.describe();
    debug!("Opening {}", description);

    let (backend, opened) = tokio::task::spawn_blocking(move || {
        let mut backend = backend;
        let result = backend.open();
        (backend, result)
    })
    .await
    .map_err(|e| CameraError::Backend {
        details: format!("Open task for {} failed: {}", description, e),
    })?;
    opened?;

    let handle: SharedBackend = Arc::new(Mutex::new(backend));

    if probe {
        if let Err(e) = grab(&handle, timeout).await {
            if let Err(close_err) = with_backend(&handle, "close", timeout, |b| b.close()).await {
                warn!("Failed to close {}: {}", description, close_err);
            }
            return Err(e);
        }
    }

    Ok(BoundBackend {
        kind,
        description,
        handle,
        streaming: false,
    })
}
