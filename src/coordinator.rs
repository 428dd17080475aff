//! Single-flight batch processing queue
//!
//! `ProcessingCoordinator` is a pure state machine: it consumes worker status
//! messages and yields the next command to send. At most one item is in
//! flight at any time. `run_batch` drives it against a live matting worker.
//!
//! An item removed while in flight stays recorded as in flight until its
//! result arrives; that result is then dropped and the queue moves on.

use crate::{
    config::ExecutionProvider,
    error::{ClearcutError, Result},
    preview::{PreviewRegistry, PreviewUrl},
    protocol::{MattingCommand, WorkerStatus},
    types::ItemId,
    worker::MattingWorker,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a queued image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Queued,
    Processing,
    Done,
    Error,
}

/// One image in the queue
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub id: ItemId,
    pub name: String,
    /// Encoded source image
    pub source: Arc<[u8]>,
    pub status: ProcessStatus,
    /// Encoded lossless RGBA result once done
    pub result: Option<Arc<[u8]>>,
    pub error: Option<String>,
    pub original_preview: PreviewUrl,
    pub result_preview: Option<PreviewUrl>,
}

/// Items per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
}

impl QueueCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.done + self.error
    }
}

/// Outcome of one `run_batch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Items completed during the run and still in the queue
    pub done: usize,
    /// Items that failed during the run and are still in the queue
    pub failed: usize,
}

/// Queue of images feeding the matting worker one at a time
#[derive(Debug)]
pub struct ProcessingCoordinator {
    items: Vec<ImageItem>,
    previews: PreviewRegistry,
    provider: Option<ExecutionProvider>,
    running: bool,
    in_flight: Option<ItemId>,
    init_error: Option<String>,
}

impl ProcessingCoordinator {
    #[must_use]
    pub fn new(previews: PreviewRegistry) -> Self {
        Self {
            items: Vec::new(),
            previews,
            provider: None,
            running: false,
            in_flight: None,
            init_error: None,
        }
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    pub fn item(&self, id: ItemId) -> Option<&ImageItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }

    /// Provider reported by the worker, once the model is ready
    pub fn provider(&self) -> Option<ExecutionProvider> {
        self.provider
    }

    pub fn is_model_ready(&self) -> bool {
        self.provider.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Worker initialization failure blocking `start`
    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    /// Not running and nothing in flight
    pub fn is_idle(&self) -> bool {
        !self.running && self.in_flight.is_none()
    }

    pub fn counts(&self) -> QueueCounts {
        self.items
            .iter()
            .fold(QueueCounts::default(), |mut counts, item| {
                match item.status {
                    ProcessStatus::Queued => counts.queued += 1,
                    ProcessStatus::Processing => counts.processing += 1,
                    ProcessStatus::Done => counts.done += 1,
                    ProcessStatus::Error => counts.error += 1,
                }
                counts
            })
    }

    /// Add one image
    ///
    /// Images added as `Done` carry their own bytes as the result.
    ///
    /// # Errors
    /// Returns `ClearcutError::InvalidConfig` for `Processing`, which only the
    /// coordinator may assign
    pub fn add_image(
        &mut self,
        name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        status: ProcessStatus,
    ) -> Result<ItemId> {
        if status == ProcessStatus::Processing {
            return Err(ClearcutError::invalid_config(
                "Items cannot be added in the processing state",
            ));
        }

        let source: Arc<[u8]> = bytes.into();
        let original_preview = self.previews.create(Arc::clone(&source));
        let (result, result_preview) = if status == ProcessStatus::Done {
            let preview = self.previews.create(Arc::clone(&source));
            (Some(Arc::clone(&source)), Some(preview))
        } else {
            (None, None)
        };

        let item = ImageItem {
            id: Uuid::new_v4(),
            name: name.into(),
            source,
            status,
            result,
            error: None,
            original_preview,
            result_preview,
        };
        let id = item.id;
        debug!(%id, name = %item.name, ?status, "Image added");
        self.items.push(item);
        Ok(id)
    }

    /// Add several images with the same initial status
    ///
    /// # Errors
    /// See `add_image`
    pub fn add_images<N, B>(
        &mut self,
        images: impl IntoIterator<Item = (N, B)>,
        status: ProcessStatus,
    ) -> Result<Vec<ItemId>>
    where
        N: Into<String>,
        B: Into<Arc<[u8]>>,
    {
        images
            .into_iter()
            .map(|(name, bytes)| self.add_image(name, bytes, status))
            .collect()
    }

    /// Remove an item and release its previews
    ///
    /// Returns `false` for unknown ids.
    ///
    /// # Errors
    /// Returns preview release errors
    pub fn remove_item(&mut self, id: ItemId) -> Result<bool> {
        let Some(index) = self.items.iter().position(|item| item.id == id) else {
            return Ok(false);
        };
        let item = self.items.remove(index);
        if self.in_flight == Some(id) {
            debug!(%id, "Removed item is still in flight; its result will be dropped");
        }
        self.release_item(&item)?;
        Ok(true)
    }

    /// Replace an item's result with an edited version
    ///
    /// The previous result preview is released before the new one is created.
    /// Returns `false` for unknown ids.
    ///
    /// # Errors
    /// - `ClearcutError::Processing` while the item is being processed
    /// - Preview release errors
    pub fn update_result(&mut self, id: ItemId, bytes: impl Into<Arc<[u8]>>) -> Result<bool> {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return Ok(false);
        };
        if item.status == ProcessStatus::Processing {
            return Err(ClearcutError::processing(format!(
                "Item {} is being processed",
                id
            )));
        }

        if let Some(old) = item.result_preview.take() {
            self.previews.release(old)?;
        }
        let result: Arc<[u8]> = bytes.into();
        item.result_preview = Some(self.previews.create(Arc::clone(&result)));
        item.result = Some(result);
        item.status = ProcessStatus::Done;
        item.error = None;
        Ok(true)
    }

    /// Drop every item, release all previews and stop
    ///
    /// # Errors
    /// Returns preview release errors
    pub fn reset_all(&mut self) -> Result<()> {
        for item in std::mem::take(&mut self.items) {
            self.release_item(&item)?;
        }
        self.running = false;
        info!("Queue reset");
        Ok(())
    }

    fn release_item(&self, item: &ImageItem) -> Result<()> {
        self.previews.release(item.original_preview)?;
        if let Some(preview) = item.result_preview {
            self.previews.release(preview)?;
        }
        Ok(())
    }

    /// Begin processing queued items
    ///
    /// Returns the first command to send, if one can be dispatched now. When
    /// the model is not ready yet, dispatch starts on the `Ready` status.
    ///
    /// # Errors
    /// Returns `ClearcutError::Model` while an initialization error is unresolved
    pub fn start(&mut self) -> Result<Option<MattingCommand>> {
        if let Some(message) = &self.init_error {
            return Err(ClearcutError::model(format!(
                "Model initialization failed, retry before starting: {}",
                message
            )));
        }
        self.running = true;
        info!(queued = self.counts().queued, "Processing started");
        Ok(self.next_dispatch())
    }

    /// Clear an initialization error and return the command that reloads the model
    pub fn retry_init(&mut self) -> Option<MattingCommand> {
        self.init_error.take().map(|message| {
            info!(previous = %message, "Retrying model initialization");
            MattingCommand::Preload
        })
    }

    /// Next item to send to the worker, if the queue may advance
    pub fn next_dispatch(&mut self) -> Option<MattingCommand> {
        if !self.running
            || self.in_flight.is_some()
            || self.provider.is_none()
            || self.init_error.is_some()
        {
            return None;
        }

        let Some(item) = self
            .items
            .iter_mut()
            .find(|item| item.status == ProcessStatus::Queued)
        else {
            self.running = false;
            info!("Queue drained");
            return None;
        };

        item.status = ProcessStatus::Processing;
        item.error = None;
        self.in_flight = Some(item.id);
        debug!(id = %item.id, name = %item.name, "Dispatching item");
        Some(MattingCommand::Process {
            id: item.id,
            image: item.source.to_vec(),
        })
    }

    /// Apply a worker status and return the next command to send
    #[instrument(skip_all)]
    pub fn handle_status(&mut self, status: &WorkerStatus) -> Option<MattingCommand> {
        match status {
            WorkerStatus::Loading => {
                debug!("Model loading");
                None
            },
            WorkerStatus::Ready { provider } => {
                self.provider = Some(*provider);
                self.init_error = None;
                self.next_dispatch()
            },
            WorkerStatus::Processing { id } => {
                if let Some(item) = self.items.iter_mut().find(|item| item.id == *id) {
                    item.status = ProcessStatus::Processing;
                }
                None
            },
            WorkerStatus::Complete { id, result } => {
                self.finish(*id, Ok(result.as_slice()));
                self.next_dispatch()
            },
            WorkerStatus::Error { id: Some(id), message } => {
                self.finish(*id, Err(message.as_str()));
                self.next_dispatch()
            },
            WorkerStatus::Error { id: None, message } => {
                warn!(error = %message, "Matting worker failed to initialize");
                self.provider = None;
                self.running = false;
                self.init_error = Some(message.clone());
                if let Some(id) = self.in_flight.take() {
                    if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
                        item.status = ProcessStatus::Queued;
                    }
                }
                None
            },
            WorkerStatus::Encoded { .. } | WorkerStatus::Decoded { .. } => {
                debug!("Ignoring interactive status on the batch queue");
                None
            },
        }
    }

    fn finish(&mut self, id: ItemId, outcome: std::result::Result<&[u8], &str>) {
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }

        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            debug!(%id, "Result for a removed item dropped");
            return;
        };

        match outcome {
            Ok(bytes) => {
                let result: Arc<[u8]> = Arc::from(bytes);
                item.result_preview = Some(self.previews.create(Arc::clone(&result)));
                item.result = Some(result);
                item.status = ProcessStatus::Done;
                item.error = None;
                info!(%id, name = %item.name, "Item done");
            },
            Err(message) => {
                item.status = ProcessStatus::Error;
                item.error = Some(message.to_string());
                warn!(%id, name = %item.name, error = %message, "Item failed");
            },
        }
    }
}

/// Process every queued item through `worker`
///
/// # Errors
/// - `ClearcutError::Model` when the worker cannot load its model
/// - `ClearcutError::Worker` when the worker stops before the queue drains
pub async fn run_batch(
    coordinator: &mut ProcessingCoordinator,
    worker: &mut MattingWorker,
) -> Result<BatchSummary> {
    run_batch_with(coordinator, worker, |_, _| {}).await
}

/// `run_batch` calling `observer` after each status has been applied
///
/// # Errors
/// See `run_batch`
pub async fn run_batch_with<F>(
    coordinator: &mut ProcessingCoordinator,
    worker: &mut MattingWorker,
    mut observer: F,
) -> Result<BatchSummary>
where
    F: FnMut(&ProcessingCoordinator, &WorkerStatus),
{
    if !coordinator.is_model_ready() {
        worker.send(MattingCommand::Preload).await?;
    }
    if let Some(command) = coordinator.start()? {
        worker.send(command).await?;
    }

    let mut summary = BatchSummary::default();
    while !coordinator.is_idle() {
        let status = worker
            .recv()
            .await
            .ok_or_else(|| ClearcutError::worker("Matting worker stopped before the queue drained"))?;

        // Results for items removed mid-flight are dropped by the coordinator.
        match &status {
            WorkerStatus::Complete { id, .. } if coordinator.item(*id).is_some() => summary.done += 1,
            WorkerStatus::Error { id: Some(id), .. } if coordinator.item(*id).is_some() => summary.failed += 1,
            _ => {},
        }

        let next = coordinator.handle_status(&status);
        observer(coordinator, &status);

        if let WorkerStatus::Error { id: None, message } = &status {
            return Err(ClearcutError::model(message.clone()));
        }
        if let Some(command) = next {
            worker.send(command).await?;
        }
    }

    info!(done = summary.done, failed = summary.failed, "Batch finished");
    Ok(summary)
}
