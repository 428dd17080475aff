//! Batch queue driven end to end through the matting worker

use clearcut::{
    backends::MockSegmenterFactory, run_batch, run_batch_with, spawn_matting_worker, types::encode_rgba,
    ClearcutError, CoordinatorConfig, ExecutionProvider, MattingCommand, MattingConfig, MattingWorker,
    OutputFormat, PreviewRegistry, ProcessStatus, ProcessingCoordinator, WorkerStatus,
};
use image::{Rgba, RgbaImage};
use std::sync::Arc;

fn png(width: u32, height: u32) -> Vec<u8> {
    encode_rgba(
        &RgbaImage::from_pixel(width, height, Rgba([200, 180, 40, 255])),
        OutputFormat::Png,
    )
    .unwrap()
}

fn worker_for(factory: &MockSegmenterFactory, provider: ExecutionProvider) -> MattingWorker {
    let config = CoordinatorConfig {
        execution_provider: provider,
        ..CoordinatorConfig::default()
    };
    spawn_matting_worker(Arc::new(factory.clone()), MattingConfig::default(), &config).unwrap()
}

#[tokio::test]
async fn test_queue_drains_in_insertion_order() {
    let factory = MockSegmenterFactory::new();
    let stats = factory.stats();
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    queue
        .add_images(
            [("a.png", png(40, 20)), ("b.png", png(50, 20)), ("c.png", png(60, 20))],
            ProcessStatus::Queued,
        )
        .unwrap();

    let mut max_in_flight = 0;
    let summary = run_batch_with(&mut queue, &mut worker, |queue, _| {
        max_in_flight = max_in_flight.max(queue.counts().processing);
    })
    .await
    .unwrap();

    assert_eq!(summary.done, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(max_in_flight, 1);
    assert_eq!(stats.processed_widths(), vec![40, 50, 60]);
    assert!(queue.is_idle());
    assert_eq!(queue.counts().done, 3);
    assert_eq!(queue.provider(), Some(ExecutionProvider::Cpu));

    for item in queue.items() {
        let result = image::load_from_memory(item.result.as_deref().unwrap()).unwrap();
        assert_eq!(result.width(), image::load_from_memory(&item.source).unwrap().width());
    }
}

#[tokio::test]
async fn test_failed_item_does_not_stop_the_batch() {
    let factory = MockSegmenterFactory::new().fail_images_of_width(50);
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    let ids = queue
        .add_images(
            [("a.png", png(40, 20)), ("b.png", png(50, 20)), ("c.png", png(60, 20))],
            ProcessStatus::Queued,
        )
        .unwrap();

    let summary = run_batch(&mut queue, &mut worker).await.unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 1);

    let failed = queue.item(ids[1]).unwrap();
    assert_eq!(failed.status, ProcessStatus::Error);
    assert!(failed.error.as_deref().unwrap().contains("Mock segmentation failure"));
    assert!(failed.result.is_none());
    assert_eq!(queue.item(ids[2]).unwrap().status, ProcessStatus::Done);
}

#[tokio::test]
async fn test_gpu_failure_falls_back_to_cpu() {
    let factory = MockSegmenterFactory::new().fail_on(ExecutionProvider::Gpu);
    let mut worker = worker_for(&factory, ExecutionProvider::Auto);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    queue.add_image("a.png", png(32, 32), ProcessStatus::Queued).unwrap();

    let mut statuses = Vec::new();
    run_batch_with(&mut queue, &mut worker, |_, status| statuses.push(status.clone()))
        .await
        .unwrap();

    assert_eq!(statuses.first(), Some(&WorkerStatus::Loading));
    assert_eq!(
        statuses.get(1),
        Some(&WorkerStatus::Ready {
            provider: ExecutionProvider::Cpu
        })
    );
    assert_eq!(queue.provider(), Some(ExecutionProvider::Cpu));
}

#[tokio::test]
async fn test_initialization_failure_blocks_the_queue() {
    let factory = MockSegmenterFactory::new()
        .fail_on(ExecutionProvider::Gpu)
        .fail_on(ExecutionProvider::Cpu);
    let stats = factory.stats();
    let mut worker = worker_for(&factory, ExecutionProvider::Auto);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    let id = queue.add_image("a.png", png(32, 32), ProcessStatus::Queued).unwrap();

    let err = run_batch(&mut queue, &mut worker).await.unwrap_err();
    assert!(matches!(err, ClearcutError::Model(_)));
    assert!(queue.init_error().is_some());
    assert_eq!(queue.item(id).unwrap().status, ProcessStatus::Queued);
    assert_eq!(stats.segments(), 0);

    assert!(queue.start().is_err());
    assert_eq!(queue.retry_init(), Some(MattingCommand::Preload));
    assert!(queue.init_error().is_none());
}

#[tokio::test]
async fn test_item_removed_while_in_flight() {
    let factory = MockSegmenterFactory::new();
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    let ids = queue
        .add_images(
            [("a.png", png(40, 20)), ("b.png", png(50, 20))],
            ProcessStatus::Queued,
        )
        .unwrap();

    worker.send(MattingCommand::Preload).await.unwrap();
    assert_eq!(queue.start().unwrap(), None);

    let mut removed = false;
    while !queue.is_idle() {
        let status = worker.recv().await.unwrap();
        if status == (WorkerStatus::Processing { id: ids[0] }) && !removed {
            assert!(queue.remove_item(ids[0]).unwrap());
            removed = true;
        }
        if let Some(command) = queue.handle_status(&status) {
            worker.send(command).await.unwrap();
        }
    }

    assert!(removed);
    assert!(queue.item(ids[0]).is_none());
    assert_eq!(queue.item(ids[1]).unwrap().status, ProcessStatus::Done);
    assert_eq!(queue.items().len(), 1);

    // Remaining item holds its original and result previews only
    assert_eq!(queue.previews().stats().live, 2);
}

#[tokio::test]
async fn test_previews_are_released_on_reset() {
    let factory = MockSegmenterFactory::new();
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let previews = PreviewRegistry::new();
    let mut queue = ProcessingCoordinator::new(previews.clone());
    let queued = queue.add_image("a.png", png(24, 24), ProcessStatus::Queued).unwrap();
    queue.add_image("edited.png", png(24, 24), ProcessStatus::Done).unwrap();
    assert_eq!(previews.stats().live, 3);

    run_batch(&mut queue, &mut worker).await.unwrap();
    assert_eq!(previews.stats().live, 4);

    assert!(queue.update_result(queued, png(24, 24)).unwrap());
    assert_eq!(previews.stats().live, 4);

    queue.reset_all().unwrap();
    let stats = previews.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.created, stats.released);
}

#[tokio::test]
async fn test_worker_stopping_mid_batch_is_an_error() {
    let factory = MockSegmenterFactory::new();
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    queue.add_image("a.png", png(24, 24), ProcessStatus::Queued).unwrap();

    worker.terminate();
    let err = run_batch(&mut queue, &mut worker).await.unwrap_err();
    assert!(matches!(err, ClearcutError::Worker(_)));
}

#[tokio::test]
async fn test_summary_skips_items_removed_in_flight() {
    let factory = MockSegmenterFactory::new().fail_images_of_width(40);
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    let ids = queue
        .add_images(
            [("a.png", png(40, 20)), ("b.png", png(50, 20))],
            ProcessStatus::Queued,
        )
        .unwrap();

    worker.send(MattingCommand::Preload).await.unwrap();
    assert_eq!(queue.start().unwrap(), None);
    assert_eq!(worker.recv().await, Some(WorkerStatus::Loading));
    let ready = worker.recv().await.unwrap();
    let first = queue.handle_status(&ready).unwrap();
    assert_eq!(
        first,
        MattingCommand::Process {
            id: ids[0],
            image: png(40, 20)
        }
    );
    worker.send(first).await.unwrap();
    assert!(queue.remove_item(ids[0]).unwrap());

    // The failure of the removed item still arrives but is not counted
    let summary = run_batch(&mut queue, &mut worker).await.unwrap();
    assert_eq!(summary.done, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(queue.item(ids[1]).unwrap().status, ProcessStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_on_multi_thread_runtime() {
    let factory = MockSegmenterFactory::new();
    let stats = factory.stats();
    let mut worker = worker_for(&factory, ExecutionProvider::Cpu);
    let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
    queue
        .add_images(
            [("a.png", png(40, 20)), ("b.png", png(50, 20)), ("c.png", png(60, 20))],
            ProcessStatus::Queued,
        )
        .unwrap();

    let summary = run_batch(&mut queue, &mut worker).await.unwrap();
    assert_eq!(summary.done, 3);
    assert_eq!(stats.processed_widths(), vec![40, 50, 60]);
    assert!(queue.is_idle());
}
