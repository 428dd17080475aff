//! Interactive selection through the segmentation worker

use clearcut::{
    backends::MockPromptableFactory, spawn_segmentation_worker, types::encode_rgba, CoordinatorConfig,
    ExecutionProvider, OutputFormat, Point, PointLabel, PreviewRegistry, SegmentationClient,
    SegmentationConfig,
};
use image::{GenericImageView, Rgba, RgbaImage};
use std::sync::Arc;

fn png(width: u32, height: u32) -> Vec<u8> {
    encode_rgba(
        &RgbaImage::from_pixel(width, height, Rgba([30, 90, 160, 255])),
        OutputFormat::Png,
    )
    .unwrap()
}

async fn open(
    factory: &MockPromptableFactory,
    previews: &PreviewRegistry,
    config: SegmentationConfig,
    provider: ExecutionProvider,
) -> SegmentationClient {
    let coordinator = CoordinatorConfig {
        execution_provider: provider,
        ..CoordinatorConfig::default()
    };
    let worker =
        spawn_segmentation_worker(Arc::new(factory.clone()), config.clone(), &coordinator).unwrap();
    SegmentationClient::open(worker, previews.clone(), png(100, 50), &config)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_selection_keeps_the_clicked_object() {
    let factory = MockPromptableFactory::new();
    let previews = PreviewRegistry::new();
    let mut client = open(&factory, &previews, SegmentationConfig::default(), ExecutionProvider::Cpu).await;

    client.add_point(Point::keep(50.0, 25.0)).await.unwrap();
    client.wait_for_masks().await.unwrap();
    assert!(client.is_encoded());
    // one keep point plus four corner anchors
    assert_eq!(factory.stats().last_point_count(), 5);

    let cut = image::load_from_memory(&client.extract(OutputFormat::Png).unwrap()).unwrap();
    assert_eq!(cut.dimensions(), (100, 50));
    assert_eq!(cut.get_pixel(50, 25)[3], 255);
    assert_eq!(cut.get_pixel(0, 0)[3], 0);
    assert_eq!(cut.get_pixel(99, 49)[3], 0);

    client.close().unwrap();
    assert_eq!(previews.stats().live, 0);
}

#[tokio::test(start_paused = true)]
async fn test_prompt_changes_reuse_the_embedding() {
    let factory = MockPromptableFactory::new();
    let stats = factory.stats();
    let previews = PreviewRegistry::new();
    let mut client = open(&factory, &previews, SegmentationConfig::default(), ExecutionProvider::Cpu).await;

    client.add_point(Point::keep(50.0, 25.0)).await.unwrap();
    client.wait_for_masks().await.unwrap();

    client.set_mode(PointLabel::Remove);
    assert!(client.click((10.0, 10.0), (100.0, 50.0)).await.unwrap());
    client.wait_for_masks().await.unwrap();

    client.set_sensitivity(0.8).await.unwrap();
    client.wait_for_masks().await.unwrap();
    client.set_mask_index(Some(2)).await.unwrap();
    client.wait_for_masks().await.unwrap();

    assert_eq!(stats.encodes(), 1);
    assert_eq!(stats.decodes(), 4);
    assert_eq!(stats.last_point_count(), 2);

    // only the latest display/raw pair stays live
    let stats = previews.stats();
    assert_eq!(stats.live, 2);
    assert_eq!(stats.created, 8);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_changes_collapse_into_one_decode() {
    let factory = MockPromptableFactory::new();
    let stats = factory.stats();
    let previews = PreviewRegistry::new();
    let mut client = open(&factory, &previews, SegmentationConfig::default(), ExecutionProvider::Cpu).await;

    client.add_point(Point::keep(50.0, 25.0)).await.unwrap();
    for smoothness in [0.1, 0.3, 0.7, 0.9] {
        client.set_smoothness(smoothness).await.unwrap();
    }
    client.wait_for_masks().await.unwrap();

    assert_eq!(stats.decodes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_promptable_model_falls_back_to_cpu() {
    let factory = MockPromptableFactory::new().fail_on(ExecutionProvider::Gpu);
    let previews = PreviewRegistry::new();
    let mut client = open(&factory, &previews, SegmentationConfig::default(), ExecutionProvider::Auto).await;

    client.add_point(Point::keep(20.0, 20.0)).await.unwrap();
    client.wait_for_masks().await.unwrap();
    assert_eq!(client.provider(), Some(ExecutionProvider::Cpu));
}

#[tokio::test(start_paused = true)]
async fn test_clearing_points_releases_masks() {
    let factory = MockPromptableFactory::new();
    let previews = PreviewRegistry::new();
    let config = SegmentationConfig::builder().corner_anchors(false).build().unwrap();
    let mut client = open(&factory, &previews, config, ExecutionProvider::Cpu).await;

    client.add_point(Point::keep(50.0, 25.0)).await.unwrap();
    client.wait_for_masks().await.unwrap();
    assert_eq!(factory.stats().last_point_count(), 1);

    client.clear_points().unwrap();
    assert!(client.masks().is_none());
    assert!(client.points().is_empty());
    assert_eq!(previews.stats().live, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_selection_on_multi_thread_runtime() {
    let factory = MockPromptableFactory::new();
    let stats = factory.stats();
    let previews = PreviewRegistry::new();
    let mut client = open(&factory, &previews, SegmentationConfig::default(), ExecutionProvider::Cpu).await;

    client.add_point(Point::keep(50.0, 25.0)).await.unwrap();
    client.wait_for_masks().await.unwrap();
    assert!(client.masks().is_some());
    assert_eq!(stats.encodes(), 1);
    assert_eq!(stats.decodes(), 1);

    client.close().unwrap();
    assert_eq!(previews.stats().live, 0);
}
