//! Worker hosts for the batch and interactive pipelines
//!
//! Each worker is a tokio task that owns its model and state outright and
//! talks to the host only through bounded channels of `protocol` messages.
//! Model calls and pixel work run on the blocking pool; the task awaits them,
//! so a message still runs to completion before the next one is read. Every
//! failure is turned into `WorkerStatus::Error` at this boundary.
//!
//! Cancellation is termination: `WorkerHandle::terminate` (or dropping the
//! handle) aborts the task, and nothing it was doing is reported.

use crate::{
    config::{CoordinatorConfig, ExecutionProvider, MattingConfig, OutputFormat, SegmentationConfig},
    error::{ClearcutError, Result},
    inference::{load_with_fallback, BackendFactory, PromptableBackend, SegmentationBackend},
    matting::MattingCompositor,
    protocol::{DecodeRequest, MattingCommand, SegmentationCommand, WorkerStatus},
    session::InteractiveSession,
    types::{ItemId, SessionId},
};
use instant::Instant;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Host side of a running worker
#[derive(Debug)]
pub struct WorkerHandle<C> {
    commands: mpsc::Sender<C>,
    status: mpsc::Receiver<WorkerStatus>,
    task: JoinHandle<()>,
}

/// Batch matting worker
pub type MattingWorker = WorkerHandle<MattingCommand>;

/// Interactive segmentation worker
pub type SegmentationWorker = WorkerHandle<SegmentationCommand>;

impl<C> WorkerHandle<C> {
    /// Send a command to the worker
    ///
    /// # Errors
    /// Returns `ClearcutError::Worker` when the worker has stopped
    pub async fn send(&self, command: C) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClearcutError::worker("Worker has stopped"))
    }

    /// Next status message; `None` once the worker has stopped
    pub async fn recv(&mut self) -> Option<WorkerStatus> {
        self.status.recv().await
    }

    /// Status message if one is already waiting
    pub fn try_recv(&mut self) -> Option<WorkerStatus> {
        self.status.try_recv().ok()
    }

    /// Abort the worker immediately
    pub fn terminate(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<C> Drop for WorkerHandle<C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the batch matting worker
///
/// Must be called from within a tokio runtime.
///
/// # Errors
/// Returns `ClearcutError::InvalidConfig` for invalid configurations
pub fn spawn_matting_worker(
    factory: Arc<dyn BackendFactory<dyn SegmentationBackend>>,
    matting: MattingConfig,
    config: &CoordinatorConfig,
) -> Result<MattingWorker> {
    config.validate()?;
    let output_format = matting.output_format;
    let compositor = Arc::new(MattingCompositor::new(matting)?);

    let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
    let (status_tx, status_rx) = mpsc::channel(config.channel_capacity);

    let actor = MattingActor {
        factory,
        requested: config.execution_provider,
        compositor,
        output_format,
        backend: None,
        provider: None,
        status: status_tx,
    };
    let task = tokio::spawn(actor.run(command_rx));

    Ok(WorkerHandle {
        commands: command_tx,
        status: status_rx,
        task,
    })
}

/// Start the interactive segmentation worker
///
/// Must be called from within a tokio runtime.
///
/// # Errors
/// Returns `ClearcutError::InvalidConfig` for invalid configurations
pub fn spawn_segmentation_worker(
    factory: Arc<dyn BackendFactory<dyn PromptableBackend>>,
    segmentation: SegmentationConfig,
    config: &CoordinatorConfig,
) -> Result<SegmentationWorker> {
    config.validate()?;
    let debounce = segmentation.debounce();
    let session = InteractiveSession::new(segmentation.clone())?;

    let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
    let (status_tx, status_rx) = mpsc::channel(config.channel_capacity);

    let actor = SegmentationActor {
        factory,
        requested: config.execution_provider,
        config: segmentation,
        session: Some(session),
        debounce,
        status: status_tx,
    };
    let task = tokio::spawn(actor.run(command_rx));

    Ok(WorkerHandle {
        commands: command_tx,
        status: status_rx,
        task,
    })
}

fn decode_image(bytes: &[u8]) -> Result<image::DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| ClearcutError::processing(format!("Failed to decode image from bytes: {}", e)))
}

/// Run model or pixel work on the blocking pool
///
/// # Errors
/// Returns `ClearcutError::Worker` when the work panicked
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ClearcutError::worker(format!("Blocking task failed: {}", e)))
}

/// Send `status` without keeping the actor borrowed; resolves to `false`
/// once the host stopped listening
fn emit_to(
    status_tx: &mpsc::Sender<WorkerStatus>,
    status: WorkerStatus,
) -> impl Future<Output = bool> + Send + 'static {
    let status_tx = status_tx.clone();
    async move { status_tx.send(status).await.is_ok() }
}

fn matte_image(
    backend: &mut dyn SegmentationBackend,
    compositor: &MattingCompositor,
    format: OutputFormat,
    bytes: &[u8],
) -> Result<Vec<u8>> {
    let image = decode_image(bytes)?;
    let mut result = compositor.process(backend, &image)?;
    let encode_start = Instant::now();
    let encoded = result.to_bytes(format)?;
    result.timings.encode_ms = encode_start.elapsed().as_millis() as u64;
    result.timings.total_ms += result.timings.encode_ms;

    info!(
        width = image.width(),
        height = image.height(),
        inference_ms = result.timings.inference_ms,
        refinement_ms = result.timings.refinement_ms,
        encode_ms = result.timings.encode_ms,
        overhead_ms = result.timings.other_overhead_ms(),
        "Background removed"
    );
    Ok(encoded)
}

struct MattingActor {
    factory: Arc<dyn BackendFactory<dyn SegmentationBackend>>,
    requested: ExecutionProvider,
    compositor: Arc<MattingCompositor>,
    output_format: OutputFormat,
    backend: Option<Box<dyn SegmentationBackend>>,
    provider: Option<ExecutionProvider>,
    status: mpsc::Sender<WorkerStatus>,
}

impl MattingActor {
    async fn run(mut self, mut commands: mpsc::Receiver<MattingCommand>) {
        while let Some(command) = commands.recv().await {
            let host_alive = match command {
                MattingCommand::Preload => self.ensure_loaded().await,
                MattingCommand::Process { id, image } => self.process(id, image).await,
            };
            if !host_alive {
                break;
            }
        }
        debug!("Matting worker stopped");
    }

    async fn ensure_loaded(&mut self) -> bool {
        if let Some(provider) = self.provider {
            return emit_to(&self.status, WorkerStatus::Ready { provider }).await;
        }
        if !emit_to(&self.status, WorkerStatus::Loading).await {
            return false;
        }

        let factory = Arc::clone(&self.factory);
        let requested = self.requested;
        let loaded = run_blocking(move || load_with_fallback(factory.as_ref(), requested))
            .await
            .and_then(|loaded| loaded);

        match loaded {
            Ok(loaded) => {
                self.backend = Some(loaded.backend);
                self.provider = Some(loaded.provider);
                emit_to(
                    &self.status,
                    WorkerStatus::Ready {
                        provider: loaded.provider,
                    },
                )
                .await
            },
            Err(e) => {
                error!(error = %e, "Segmentation model failed to load");
                emit_to(&self.status, WorkerStatus::error(None, &e)).await
            },
        }
    }

    async fn process(&mut self, id: ItemId, image: Vec<u8>) -> bool {
        if self.backend.is_none() {
            if !self.ensure_loaded().await {
                return false;
            }
            // Initialization failure was already reported for the worker as a whole.
            if self.backend.is_none() {
                return true;
            }
        }

        if !emit_to(&self.status, WorkerStatus::Processing { id }).await {
            return false;
        }

        match self.matte(image).await {
            Ok(result) => emit_to(&self.status, WorkerStatus::Complete { id, result }).await,
            Err(e) => {
                warn!(%id, error = %e, "Item failed");
                emit_to(&self.status, WorkerStatus::error(Some(id), &e)).await
            },
        }
    }

    async fn matte(&mut self, image: Vec<u8>) -> Result<Vec<u8>> {
        let mut backend = self
            .backend
            .take()
            .ok_or_else(|| ClearcutError::internal("Backend not initialized"))?;
        let compositor = Arc::clone(&self.compositor);
        let format = self.output_format;

        let joined = run_blocking(move || {
            let outcome = matte_image(&mut *backend, &compositor, format, &image);
            (backend, outcome)
        })
        .await;

        match joined {
            Ok((backend, outcome)) => {
                self.backend = Some(backend);
                outcome
            },
            Err(e) => {
                // The backend was lost with the task; the next item reloads it.
                self.provider = None;
                Err(e)
            },
        }
    }
}

struct SegmentationActor {
    factory: Arc<dyn BackendFactory<dyn PromptableBackend>>,
    requested: ExecutionProvider,
    config: SegmentationConfig,
    session: Option<InteractiveSession>,
    debounce: Duration,
    status: mpsc::Sender<WorkerStatus>,
}

impl SegmentationActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SegmentationCommand>) {
        let mut pending: Option<DecodeRequest> = None;
        let deadline = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let host_alive = match command {
                        SegmentationCommand::Preload => self.ensure_loaded().await,
                        SegmentationCommand::Encode { session, image } => {
                            if pending.as_ref().is_some_and(|p| p.session != session) {
                                pending = None;
                            }
                            self.encode(session, image).await
                        },
                        SegmentationCommand::Decode(request) => {
                            if pending.replace(request).is_some() {
                                debug!("Superseded pending decode");
                            }
                            deadline
                                .as_mut()
                                .reset(tokio::time::Instant::now() + self.debounce);
                            true
                        },
                    };
                    if !host_alive {
                        break;
                    }
                },
                () = &mut deadline, if pending.is_some() => {
                    if let Some(request) = pending.take() {
                        if !self.decode(request).await {
                            break;
                        }
                    }
                },
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        debug!("Segmentation worker stopped");
    }

    fn provider(&self) -> Option<ExecutionProvider> {
        self.session.as_ref().and_then(InteractiveSession::provider)
    }

    /// Run `work` against the session on the blocking pool
    ///
    /// A session lost to a panic is replaced by a fresh, unloaded one.
    async fn with_session<T, F>(&mut self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut InteractiveSession) -> Result<T> + Send + 'static,
    {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => InteractiveSession::new(self.config.clone())?,
        };
        let (session, outcome) = run_blocking(move || {
            let outcome = work(&mut session);
            (session, outcome)
        })
        .await?;
        self.session = Some(session);
        outcome
    }

    async fn ensure_loaded(&mut self) -> bool {
        if let Some(provider) = self.provider() {
            return emit_to(&self.status, WorkerStatus::Ready { provider }).await;
        }
        if !emit_to(&self.status, WorkerStatus::Loading).await {
            return false;
        }

        let factory = Arc::clone(&self.factory);
        let requested = self.requested;
        let loaded = self
            .with_session(move |session| session.load(factory.as_ref(), requested))
            .await;
        match loaded {
            Ok(provider) => emit_to(&self.status, WorkerStatus::Ready { provider }).await,
            Err(e) => {
                error!(error = %e, "Promptable model failed to load");
                emit_to(&self.status, WorkerStatus::error(None, &e)).await
            },
        }
    }

    async fn encode(&mut self, session: SessionId, image: Vec<u8>) -> bool {
        if self.provider().is_none() {
            if !self.ensure_loaded().await {
                return false;
            }
            if self.provider().is_none() {
                return true;
            }
        }

        let encoded = self
            .with_session(move |interactive| {
                let image = decode_image(&image)?;
                interactive.encode(session, &image)
            })
            .await;
        match encoded {
            Ok(_) => emit_to(&self.status, WorkerStatus::Encoded { session }).await,
            Err(e) => emit_to(&self.status, WorkerStatus::error(Some(session), &e)).await,
        }
    }

    async fn decode(&mut self, request: DecodeRequest) -> bool {
        let session = request.session;
        let decoded = self
            .with_session(move |interactive| interactive.decode(&request)?.encode(OutputFormat::Png))
            .await;
        match decoded {
            Ok((display_mask, raw_mask)) => {
                emit_to(
                    &self.status,
                    WorkerStatus::Decoded {
                        session,
                        display_mask,
                        raw_mask,
                    },
                )
                .await
            },
            Err(e) => {
                warn!(%session, error = %e, "Decode failed");
                emit_to(&self.status, WorkerStatus::error(Some(session), &e)).await
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{MockPromptableFactory, MockSegmenterFactory};
    use crate::types::{encode_rgba, Point};
    use image::{Rgba, RgbaImage};
    use uuid::Uuid;

    fn png(width: u32, height: u32) -> Vec<u8> {
        encode_rgba(
            &RgbaImage::from_pixel(width, height, Rgba([120, 60, 30, 255])),
            OutputFormat::Png,
        )
        .unwrap()
    }

    fn matting_worker(factory: MockSegmenterFactory) -> MattingWorker {
        spawn_matting_worker(
            Arc::new(factory),
            MattingConfig::default(),
            &CoordinatorConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_matting_worker_processes_item() {
        let mut worker = matting_worker(MockSegmenterFactory::new());
        worker.send(MattingCommand::Preload).await.unwrap();
        assert_eq!(worker.recv().await, Some(WorkerStatus::Loading));
        assert_eq!(
            worker.recv().await,
            Some(WorkerStatus::Ready {
                provider: ExecutionProvider::Gpu
            })
        );

        let id = Uuid::new_v4();
        worker
            .send(MattingCommand::Process { id, image: png(40, 30) })
            .await
            .unwrap();
        assert_eq!(worker.recv().await, Some(WorkerStatus::Processing { id }));
        match worker.recv().await {
            Some(WorkerStatus::Complete { id: done, result }) => {
                assert_eq!(done, id);
                let decoded = image::load_from_memory(&result).unwrap();
                assert_eq!((decoded.width(), decoded.height()), (40, 30));
            },
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_item_does_not_stop_worker() {
        let mut worker = matting_worker(MockSegmenterFactory::new());
        let bad = Uuid::new_v4();
        let good = Uuid::new_v4();
        worker
            .send(MattingCommand::Process {
                id: bad,
                image: vec![1, 2, 3],
            })
            .await
            .unwrap();
        worker
            .send(MattingCommand::Process {
                id: good,
                image: png(8, 8),
            })
            .await
            .unwrap();

        let mut statuses = Vec::new();
        while statuses.len() < 6 {
            statuses.push(worker.recv().await.unwrap());
        }
        assert!(statuses
            .iter()
            .any(|s| matches!(s, WorkerStatus::Error { id: Some(id), .. } if *id == bad)));
        assert!(matches!(
            statuses.last(),
            Some(WorkerStatus::Complete { id, .. }) if *id == good
        ));
    }

    #[tokio::test]
    async fn test_initialization_failure_is_reported_without_id() {
        let factory = MockSegmenterFactory::new()
            .fail_on(ExecutionProvider::Gpu)
            .fail_on(ExecutionProvider::Cpu);
        let mut worker = matting_worker(factory);
        worker.send(MattingCommand::Preload).await.unwrap();
        assert_eq!(worker.recv().await, Some(WorkerStatus::Loading));
        let status = worker.recv().await.unwrap();
        assert!(status.is_system_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decodes_are_debounced() {
        let factory = MockPromptableFactory::new();
        let stats = factory.stats();
        let mut worker = spawn_segmentation_worker(
            Arc::new(factory),
            SegmentationConfig::default(),
            &CoordinatorConfig::default(),
        )
        .unwrap();

        let session = Uuid::new_v4();
        worker
            .send(SegmentationCommand::Encode {
                session,
                image: png(100, 60),
            })
            .await
            .unwrap();
        assert_eq!(worker.recv().await, Some(WorkerStatus::Loading));
        assert!(matches!(worker.recv().await, Some(WorkerStatus::Ready { .. })));
        assert_eq!(worker.recv().await, Some(WorkerStatus::Encoded { session }));

        for sensitivity in [0.2, 0.4, 0.6] {
            let request = DecodeRequest::new(
                session,
                vec![Point::keep(50.0, 30.0), Point::remove(5.0, 5.0)],
            )
            .with_sensitivity(sensitivity);
            worker.send(SegmentationCommand::Decode(request)).await.unwrap();
        }

        assert!(matches!(
            worker.recv().await,
            Some(WorkerStatus::Decoded { session: s, .. }) if s == session
        ));
        assert!(
            tokio::time::timeout(Duration::from_secs(1), worker.recv())
                .await
                .is_err()
        );
        assert_eq!(stats.decodes(), 1);
        assert_eq!(stats.encodes(), 1);
    }

    struct PanicsOnWidth(u32);

    impl SegmentationBackend for PanicsOnWidth {
        fn segment(&mut self, image: &image::DynamicImage) -> Result<crate::SegmentationMask> {
            assert_ne!(image.width(), self.0, "backend crashed");
            Ok(crate::SegmentationMask::new(vec![255; 4], (2, 2)))
        }
    }

    struct PanickingFactory;

    impl BackendFactory<dyn SegmentationBackend> for PanickingFactory {
        fn create_backend(&self, _provider: ExecutionProvider) -> Result<Box<dyn SegmentationBackend>> {
            Ok(Box::new(PanicsOnWidth(13)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashed_backend_is_reloaded_for_next_item() {
        let mut worker = spawn_matting_worker(
            Arc::new(PanickingFactory),
            MattingConfig::default(),
            &CoordinatorConfig::default(),
        )
        .unwrap();
        let crashed = Uuid::new_v4();
        let next = Uuid::new_v4();
        worker
            .send(MattingCommand::Process {
                id: crashed,
                image: png(13, 8),
            })
            .await
            .unwrap();
        worker
            .send(MattingCommand::Process { id: next, image: png(16, 8) })
            .await
            .unwrap();

        let mut statuses = Vec::new();
        loop {
            let status = worker.recv().await.unwrap();
            let finished = matches!(&status, WorkerStatus::Complete { id, .. } if *id == next);
            statuses.push(status);
            if finished {
                break;
            }
        }

        assert!(statuses.iter().any(|s| matches!(
            s,
            WorkerStatus::Error { id: Some(id), message } if *id == crashed && message.contains("Blocking task failed")
        )));
        let loads = statuses.iter().filter(|s| **s == WorkerStatus::Loading).count();
        assert_eq!(loads, 2);
    }

    #[tokio::test]
    async fn test_terminated_worker_reports_nothing() {
        let mut worker = matting_worker(MockSegmenterFactory::new());
        worker.terminate();
        assert_eq!(worker.recv().await, None);
        assert!(worker.send(MattingCommand::Preload).await.is_err());
    }
}
