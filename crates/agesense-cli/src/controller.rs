//! Session controller: startup sequencing and the predict cycle.
//!
//! Owns the model session, the frame source and the published status.
//! `start` and `predict` take `&mut self`, so at most one cycle is ever
//! in flight.

use crate::status::{AppStatus, StatusKind, Timing};
use agesense_core::{
    decode, infer, preprocess, InferenceError, ModelSession, PostprocessError, Prediction,
    PreprocessError, PreprocessOptions, SessionFactory,
};
use agesense_hw::{CameraError, CameraProvider, Frame, FrameSource};
use agesense_models::{Capabilities, ProvisionError, ProvisionPhase, Provisioner};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("missing output tensor(s) for postprocessing: {0}")]
    Postprocess(#[from] PostprocessError),
    #[error("system not ready")]
    NotReady,
    #[error("inference panicked")]
    InferencePanicked,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Provisioning,
    Capturing,
    Ready,
    Predicting,
    /// Model loaded but no camera; predictions are impossible.
    CameraFailed,
    /// Startup failed before a session existed. Terminal.
    Failed,
}

pub struct SessionController {
    provisioner: Provisioner,
    factory: Arc<dyn SessionFactory>,
    camera: Arc<dyn CameraProvider>,
    options: PreprocessOptions,
    state: ControllerState,
    /// Trigger label shown while in `Failed`.
    failure_label: &'static str,
    session: Option<Box<dyn ModelSession>>,
    frames: Option<Box<dyn FrameSource>>,
    status: watch::Sender<AppStatus>,
}

impl SessionController {
    pub fn new(
        provisioner: Provisioner,
        factory: Arc<dyn SessionFactory>,
        camera: Arc<dyn CameraProvider>,
        options: PreprocessOptions,
    ) -> Self {
        let (status, _) = watch::channel(AppStatus::default());
        Self {
            provisioner,
            factory,
            camera,
            options,
            state: ControllerState::Uninitialized,
            failure_label: "Model Init Failed",
            session: None,
            frames: None,
            status,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> AppStatus {
        self.status.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<AppStatus> {
        self.status.subscribe()
    }

    /// Whether a predict request would be accepted right now.
    pub fn trigger_enabled(&self) -> bool {
        self.state == ControllerState::Ready
    }

    pub fn trigger_label(&self) -> String {
        match self.state {
            ControllerState::Ready => "Predict Age & Gender".to_string(),
            ControllerState::Predicting => "Processing...".to_string(),
            ControllerState::Capturing => "Starting Camera...".to_string(),
            ControllerState::CameraFailed => "Camera Failed".to_string(),
            ControllerState::Failed => self.failure_label.to_string(),
            ControllerState::Uninitialized => "Initializing...".to_string(),
            ControllerState::Provisioning => self.status.borrow().message.clone(),
        }
    }

    /// Capability check, model provisioning, session creation, then camera.
    ///
    /// On success the controller is `Ready`. A camera failure leaves the
    /// session loaded (`CameraFailed`); anything earlier is `Failed`.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        tracing::info!("initializing");
        let started = Instant::now();

        self.state = ControllerState::Provisioning;
        self.update(|s| {
            s.kind = StatusKind::Loading;
            s.message = "Initializing model...".to_string();
            s.load_time = Timing::Pending("Calculating...");
        });

        let caps = match self.provisioner.check_capabilities().await {
            Ok(caps) => caps,
            Err(e) => {
                self.state = ControllerState::Failed;
                self.failure_label = "Unsupported Platform";
                self.update(|s| {
                    s.kind = StatusKind::Error;
                    s.message = format!("Error: {e}. Cannot run.");
                    s.load_time = Timing::NotAvailable;
                    s.latency = Timing::NotAvailable;
                });
                return Err(e.into());
            }
        };

        match self.load_session(&caps).await {
            Ok(session) => {
                self.session = Some(session);
                let load_time = started.elapsed();
                tracing::info!(load_ms = load_time.as_millis() as u64, "total model load time");
                self.update(|s| s.load_time = Timing::Measured(load_time));
            }
            Err(e) => {
                self.state = ControllerState::Failed;
                self.failure_label = "Model Init Failed";
                self.update(|s| {
                    s.kind = StatusKind::Error;
                    s.message = format!("Model Init Error: {e}");
                    s.load_time = Timing::Error;
                });
                return Err(e);
            }
        }

        self.state = ControllerState::Capturing;
        self.update(|s| {
            s.kind = StatusKind::Loading;
            s.message = "Requesting camera access...".to_string();
        });

        let provider = Arc::clone(&self.camera);
        let camera = match tokio::task::spawn_blocking(move || provider.start()).await {
            Ok(result) => result.map_err(ControllerError::from),
            Err(e) => Err(e.into()),
        };

        match camera {
            Ok(frames) => {
                self.frames = Some(frames);
                self.state = ControllerState::Ready;
                self.update(|s| {
                    s.kind = StatusKind::Active;
                    s.message = "Ready. Press Predict.".to_string();
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "camera start failed");
                self.state = ControllerState::CameraFailed;
                self.update(|s| {
                    s.kind = StatusKind::Error;
                    s.message = "Model loaded, but camera failed. Check permissions.".to_string();
                });
                Err(e)
            }
        }
    }

    /// Provision the model bytes and build a session from them.
    async fn load_session(&self, caps: &Capabilities) -> Result<Box<dyn ModelSession>, ControllerError> {
        let status = &self.status;
        let on_phase = |phase: ProvisionPhase| {
            tracing::info!(?phase, "{}", phase.message());
            status.send_modify(|s| s.message = phase.message().to_string());
        };

        let model = self.provisioner.provision(caps, &on_phase).await?;
        tracing::info!(
            origin = ?model.origin,
            bytes = model.bytes.len(),
            elapsed_ms = model.elapsed.as_millis() as u64,
            "model bytes ready"
        );

        self.update(|s| s.message = "Creating inference session...".to_string());
        let factory = Arc::clone(&self.factory);
        let session_start = Instant::now();
        let session = tokio::task::spawn_blocking(move || factory.create(&model.bytes)).await??;
        tracing::info!(
            elapsed_ms = session_start.elapsed().as_millis() as u64,
            "inference session created"
        );

        Ok(session)
    }

    /// Run one capture → preprocess → infer → decode cycle.
    ///
    /// Refused with [`ControllerError::NotReady`] unless the controller is
    /// `Ready` with a live camera. Afterwards the controller is `Ready`
    /// again whenever session and camera are still usable.
    pub async fn predict(&mut self) -> Result<Prediction, ControllerError> {
        if self.state == ControllerState::Ready && !self.camera_active() {
            tracing::warn!("camera stream stopped");
            self.state = ControllerState::CameraFailed;
        }
        if self.state != ControllerState::Ready || self.session.is_none() {
            self.update(|s| {
                s.kind = StatusKind::Error;
                s.message = "System not ready. Wait for initialization.".to_string();
            });
            return Err(ControllerError::NotReady);
        }

        self.state = ControllerState::Predicting;
        self.update(|s| {
            s.prediction = None;
            s.kind = StatusKind::Processing;
            s.message = "Capturing & Preprocessing...".to_string();
            s.latency = Timing::Pending("Running...");
        });

        let result = self.run_cycle().await;

        match &result {
            Ok(prediction) => {
                tracing::info!(age = prediction.age, gender = %prediction.gender, "prediction finished");
                let prediction = *prediction;
                self.update(|s| {
                    s.prediction = Some(prediction);
                    s.kind = StatusKind::Success;
                    s.message = "Prediction complete! Ready for next.".to_string();
                });
            }
            Err(e) => {
                self.update(|s| {
                    s.kind = StatusKind::Error;
                    s.message = format!("Prediction Error: {e}");
                    s.latency = Timing::Error;
                });
            }
        }

        self.state = if self.session.is_none() {
            ControllerState::Failed
        } else if self.camera_active() {
            ControllerState::Ready
        } else {
            ControllerState::CameraFailed
        };

        result
    }

    async fn run_cycle(&mut self) -> Result<Prediction, ControllerError> {
        let frame = self.current_frame()?;
        let input = preprocess(&frame.image, &self.options)?;

        self.update(|s| s.message = "Running inference...".to_string());
        // The session travels into the blocking task and always comes back,
        // even when the run panics.
        let mut session = self.session.take();
        let (session, output) = tokio::task::spawn_blocking(move || {
            let output =
                std::panic::catch_unwind(AssertUnwindSafe(|| infer(session.as_deref_mut(), &input)));
            (session, output)
        })
        .await?;
        self.session = session;

        let output = output.map_err(|_| {
            tracing::warn!("inference panicked; session kept");
            ControllerError::InferencePanicked
        })??;
        tracing::info!(latency_ms = output.latency.as_millis() as u64, "inference latency");
        self.update(|s| {
            s.latency = Timing::Measured(output.latency);
            s.message = "Postprocessing...".to_string();
        });

        Ok(decode(&output)?)
    }

    /// Latest camera frame with nonzero dimensions.
    pub fn current_frame(&self) -> Result<Frame, ControllerError> {
        let frames = self.frames.as_ref().ok_or(CameraError::FrameNotReady)?;
        Ok(frames.current_frame()?)
    }

    /// Wait until the camera has produced its first frame.
    pub async fn wait_for_frame(&self, timeout: Duration) -> Result<(), ControllerError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.current_frame() {
                Ok(_) => return Ok(()),
                Err(ControllerError::Camera(CameraError::FrameNotReady))
                    if Instant::now() < deadline && self.camera_active() =>
                {
                    tokio::time::sleep(FRAME_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn camera_active(&self) -> bool {
        self.frames.as_ref().is_some_and(|f| f.is_active())
    }

    fn update(&self, f: impl FnOnce(&mut AppStatus)) {
        self.status.send_modify(f);
        let status = self.status.borrow();
        if status.kind == StatusKind::Error {
            tracing::warn!(kind = ?status.kind, "{}", status.message);
        } else {
            tracing::info!(kind = ?status.kind, "{}", status.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agesense_core::{Gender, InputTensor, OutputTensors};
    use agesense_models::{FileFetcher, ModelCache, ModelSource, ModelSpec, SqliteModelCache};
    use image::{Rgb, RgbImage};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};

    const MODEL: &[u8] = b"fake onnx graph";

    struct FakeSession {
        outputs: Vec<String>,
        values: OutputTensors,
        inputs: Vec<String>,
        panic_next: Arc<AtomicBool>,
    }

    impl ModelSession for FakeSession {
        fn input_names(&self) -> &[String] {
            &self.inputs
        }

        fn output_names(&self) -> &[String] {
            &self.outputs
        }

        fn run(&mut self, _input_name: &str, input: &InputTensor) -> Result<OutputTensors, InferenceError> {
            assert_eq!(input.shape(), &[1, 3, 224, 224]);
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("engine blew up");
            }
            Ok(self.values.clone())
        }
    }

    /// Builds sessions with fixed single-value outputs.
    #[derive(Default)]
    struct FakeFactory {
        outputs: Vec<(&'static str, f32)>,
        fail: bool,
        /// Makes the next `run` on any created session panic.
        panic_next: Arc<AtomicBool>,
    }

    impl SessionFactory for FakeFactory {
        fn create(&self, model: &[u8]) -> Result<Box<dyn ModelSession>, InferenceError> {
            if self.fail {
                return Err(InferenceError::SessionCreation("bad graph".into()));
            }
            assert_eq!(model, MODEL);
            Ok(Box::new(FakeSession {
                inputs: vec!["input".to_string()],
                outputs: self.outputs.iter().map(|(n, _)| n.to_string()).collect(),
                values: self.outputs.iter().map(|(n, v)| (n.to_string(), vec![*v])).collect(),
                panic_next: Arc::clone(&self.panic_next),
            }))
        }
    }

    struct FakeFrames {
        active: Arc<AtomicBool>,
        ready: Arc<AtomicBool>,
    }

    impl FrameSource for FakeFrames {
        fn current_frame(&self) -> Result<Frame, CameraError> {
            if !self.ready.load(Ordering::SeqCst) {
                return Err(CameraError::FrameNotReady);
            }
            Ok(Frame {
                image: RgbImage::from_pixel(64, 48, Rgb([120, 90, 60])),
                timestamp: std::time::Instant::now(),
                sequence: 1,
            })
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    struct FakeCamera {
        deny: bool,
        active: Arc<AtomicBool>,
        ready: Arc<AtomicBool>,
    }

    impl FakeCamera {
        fn working() -> Self {
            Self {
                deny: false,
                active: Arc::new(AtomicBool::new(true)),
                ready: Arc::new(AtomicBool::new(true)),
            }
        }

        fn denied() -> Self {
            Self {
                deny: true,
                active: Arc::new(AtomicBool::new(false)),
                ready: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl CameraProvider for FakeCamera {
        fn start(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            if self.deny {
                return Err(CameraError::PermissionDenied("/dev/video0".into()));
            }
            Ok(Box::new(FakeFrames {
                active: Arc::clone(&self.active),
                ready: Arc::clone(&self.ready),
            }))
        }
    }

    fn age_gender() -> FakeFactory {
        FakeFactory {
            outputs: vec![("age_output", 41.6), ("gender_output", 0.7)],
            ..Default::default()
        }
    }

    /// Model artifact on disk plus an empty cache next to it.
    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("ag_modelQ.onnx");
        std::fs::write(&artifact, MODEL).unwrap();
        let cache = dir.path().join("cache/models.db");
        (dir, artifact, cache)
    }

    fn controller(
        artifact: &Path,
        cache: &Path,
        encoding: &str,
        factory: FakeFactory,
        camera: FakeCamera,
    ) -> SessionController {
        let spec = ModelSpec {
            key: "ag_modelQ".into(),
            version: 1,
            source: ModelSource::File(artifact.to_path_buf()),
            encoding: encoding.into(),
        };
        let provisioner = Provisioner::new(
            spec,
            Arc::new(SqliteModelCache::new(cache)),
            Arc::new(FileFetcher::new(artifact.to_path_buf())),
        );
        SessionController::new(
            provisioner,
            Arc::new(factory),
            Arc::new(camera),
            PreprocessOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_fresh_install_reaches_ready_and_predicts() {
        let (_dir, artifact, cache) = fixture();
        let mut ctl = controller(&artifact, &cache, "identity", age_gender(), FakeCamera::working());
        let mut rx = ctl.subscribe();

        ctl.start().await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Ready);
        assert!(ctl.trigger_enabled());
        assert_eq!(ctl.trigger_label(), "Predict Age & Gender");
        assert!(rx.has_changed().unwrap());

        let status = rx.borrow_and_update().clone();
        assert_eq!(status.kind, StatusKind::Active);
        assert_eq!(status.message, "Ready. Press Predict.");
        assert!(matches!(status.load_time, Timing::Measured(_)));

        let record = SqliteModelCache::new(&cache).get("ag_modelQ").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.data.as_deref(), Some(MODEL));

        let prediction = ctl.predict().await.unwrap();
        assert_eq!(prediction.age, 42);
        assert_eq!(prediction.gender, Gender::Female);
        assert_eq!(ctl.state(), ControllerState::Ready);

        let status = ctl.status();
        assert_eq!(status.kind, StatusKind::Success);
        assert_eq!(status.prediction, Some(prediction));
        assert!(matches!(status.latency, Timing::Measured(_)));
    }

    #[tokio::test]
    async fn test_cache_hit_then_camera_denied() {
        let (_dir, artifact, cache) = fixture();
        controller(&artifact, &cache, "identity", age_gender(), FakeCamera::working())
            .start()
            .await
            .unwrap();

        // Only the cache can satisfy the second start.
        std::fs::remove_file(&artifact).unwrap();
        let mut ctl = controller(&artifact, &cache, "identity", age_gender(), FakeCamera::denied());

        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, ControllerError::Camera(CameraError::PermissionDenied(_))));
        assert_eq!(ctl.state(), ControllerState::CameraFailed);
        assert!(!ctl.trigger_enabled());
        assert_eq!(ctl.trigger_label(), "Camera Failed");

        let status = ctl.status();
        assert_eq!(status.kind, StatusKind::Error);
        assert_eq!(status.message, "Model loaded, but camera failed. Check permissions.");
        assert!(matches!(status.load_time, Timing::Measured(_)));

        assert!(matches!(ctl.predict().await, Err(ControllerError::NotReady)));
        assert_eq!(ctl.status().message, "System not ready. Wait for initialization.");
    }

    #[tokio::test]
    async fn test_missing_gender_output_fails_prediction_only() {
        let (_dir, artifact, cache) = fixture();
        let factory = FakeFactory {
            outputs: vec![("age_output", 30.0)],
            ..Default::default()
        };
        let mut ctl = controller(&artifact, &cache, "identity", factory, FakeCamera::working());
        ctl.start().await.unwrap();

        let err = ctl.predict().await.unwrap_err();
        match err {
            ControllerError::Inference(InferenceError::MissingOutputTensor(name)) => {
                assert_eq!(name, "gender")
            }
            other => panic!("expected MissingOutputTensor, got {other:?}"),
        }

        let status = ctl.status();
        assert_eq!(status.kind, StatusKind::Error);
        assert!(status.message.starts_with("Prediction Error:"));
        assert_eq!(status.latency, Timing::Error);
        assert_eq!(status.prediction, None);
        assert_eq!(ctl.state(), ControllerState::Ready);
        assert!(ctl.trigger_enabled());
    }

    #[tokio::test]
    async fn test_predict_before_start_is_refused() {
        let (_dir, artifact, cache) = fixture();
        let mut ctl = controller(&artifact, &cache, "identity", age_gender(), FakeCamera::working());

        assert!(matches!(ctl.predict().await, Err(ControllerError::NotReady)));
        assert_eq!(ctl.status().kind, StatusKind::Error);
        assert_eq!(ctl.state(), ControllerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_capability_failure_is_terminal() {
        let (_dir, artifact, cache) = fixture();
        let mut ctl = controller(&artifact, &cache, "zstd", age_gender(), FakeCamera::working());

        let err = ctl.start().await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Provision(ProvisionError::DecompressionUnsupported(_))
        ));
        assert_eq!(ctl.state(), ControllerState::Failed);
        assert_eq!(ctl.trigger_label(), "Unsupported Platform");

        let status = ctl.status();
        assert_eq!(status.load_time, Timing::NotAvailable);
        assert_eq!(status.latency, Timing::NotAvailable);
        assert!(!cache.exists());
    }

    #[tokio::test]
    async fn test_session_creation_failure() {
        let (_dir, artifact, cache) = fixture();
        let factory = FakeFactory {
            fail: true,
            ..Default::default()
        };
        let mut ctl = controller(&artifact, &cache, "identity", factory, FakeCamera::working());

        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, ControllerError::Inference(InferenceError::SessionCreation(_))));
        assert_eq!(ctl.state(), ControllerState::Failed);
        assert_eq!(ctl.trigger_label(), "Model Init Failed");
        assert_eq!(ctl.status().load_time, Timing::Error);
        assert!(ctl.status().message.starts_with("Model Init Error:"));
    }

    #[tokio::test]
    async fn test_camera_stopping_disables_trigger() {
        let (_dir, artifact, cache) = fixture();
        let camera = FakeCamera::working();
        let active = Arc::clone(&camera.active);
        let mut ctl = controller(&artifact, &cache, "identity", age_gender(), camera);
        ctl.start().await.unwrap();

        active.store(false, Ordering::SeqCst);
        assert!(matches!(ctl.predict().await, Err(ControllerError::NotReady)));
        assert_eq!(ctl.state(), ControllerState::CameraFailed);
    }

    #[tokio::test]
    async fn test_wait_for_frame() {
        let (_dir, artifact, cache) = fixture();
        let mut ctl = controller(&artifact, &cache, "identity", age_gender(), FakeCamera::working());
        assert!(ctl.wait_for_frame(Duration::from_millis(50)).await.is_err());

        ctl.start().await.unwrap();
        ctl.wait_for_frame(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_not_ready_fails_prediction_only() {
        let (_dir, artifact, cache) = fixture();
        let camera = FakeCamera::working();
        let ready = Arc::clone(&camera.ready);
        let mut ctl = controller(&artifact, &cache, "identity", age_gender(), camera);
        ctl.start().await.unwrap();

        ready.store(false, Ordering::SeqCst);
        let err = ctl.predict().await.unwrap_err();
        assert!(matches!(err, ControllerError::Camera(CameraError::FrameNotReady)), "got {err:?}");

        let status = ctl.status();
        assert_eq!(status.kind, StatusKind::Error);
        assert_eq!(status.latency, Timing::Error);
        assert_eq!(status.prediction, None);
        assert_eq!(ctl.state(), ControllerState::Ready);
        assert!(ctl.trigger_enabled());

        ready.store(true, Ordering::SeqCst);
        assert_eq!(ctl.predict().await.unwrap().age, 42);
    }

    #[tokio::test]
    async fn test_inference_panic_keeps_session() {
        let (_dir, artifact, cache) = fixture();
        let factory = age_gender();
        let panic_next = Arc::clone(&factory.panic_next);
        let mut ctl = controller(&artifact, &cache, "identity", factory, FakeCamera::working());
        ctl.start().await.unwrap();

        panic_next.store(true, Ordering::SeqCst);
        assert!(matches!(ctl.predict().await, Err(ControllerError::InferencePanicked)));
        assert_eq!(ctl.state(), ControllerState::Ready);
        assert_eq!(ctl.status().latency, Timing::Error);

        let prediction = ctl.predict().await.unwrap();
        assert_eq!(prediction.gender, Gender::Female);
    }
}
