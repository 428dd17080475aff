//! ONNX Runtime implementations of the model contracts
//!
//! `OnnxSegmenter` runs a single-input batch segmentation model (RMBG-style:
//! stretched 1024x1024 input, one foreground map out). `OnnxPromptable` runs
//! a split encoder/decoder promptable model (SAM-style). Encoder outputs are
//! kept by name and fed back to the decoder under the same names.

use crate::{
    config::ExecutionProvider,
    error::{ClearcutError, Result},
    inference::{
        BackendFactory, DecoderOutput, EncoderOutput, ImageEmbedding, PromptableBackend,
        SegmentationBackend,
    },
    types::SegmentationMask,
    utils::{ImagePreprocessor, PreprocessingConfig},
};
use image::DynamicImage;
use instant::Instant;
use ndarray::{Array3, Array4, ArrayD, Axis, Ix4};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::{Path, PathBuf};

/// Hardware execution providers available on this machine, in preference order
fn gpu_providers() -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::new();

    let cuda = CUDAExecutionProvider::default();
    if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
        log::debug!("CUDA execution provider is available");
        providers.push(cuda.build());
    }

    let coreml = CoreMLExecutionProvider::default();
    if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
        log::debug!("CoreML execution provider is available");
        providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
    }

    providers
}

/// Names of the hardware execution providers available on this machine
#[must_use]
pub fn available_gpu_providers() -> Vec<&'static str> {
    let mut names = Vec::new();
    if OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false) {
        names.push("cuda");
    }
    if OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false) {
        names.push("coreml");
    }
    names
}

/// Create a session for `model` bound to `provider`
///
/// GPU is only accepted when a hardware provider is actually available, so
/// callers can fall back to CPU.
fn create_session(model: &Path, provider: ExecutionProvider) -> Result<Session> {
    let builder = Session::builder()
        .map_err(|e| ClearcutError::model(format!("Failed to create session builder: {e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| ClearcutError::model(format!("Failed to set optimization level: {e}")))?;

    let builder = match provider {
        ExecutionProvider::Cpu => builder,
        ExecutionProvider::Gpu | ExecutionProvider::Auto => {
            let providers = gpu_providers();
            if providers.is_empty() {
                if provider == ExecutionProvider::Gpu {
                    return Err(ClearcutError::inference_error_with_provider(
                        "gpu",
                        "Session creation",
                        "no hardware execution provider is available",
                        &["cpu"],
                    ));
                }
                builder
            } else {
                builder.with_execution_providers(providers).map_err(|e| {
                    ClearcutError::model(format!("Failed to set execution providers: {e}"))
                })?
            }
        },
    };

    let start = Instant::now();
    let session = builder.commit_from_file(model).map_err(|e| {
        ClearcutError::model(format!("Failed to load model {}: {e}", model.display()))
    })?;
    log::debug!(
        "Loaded {} on {} in {:.2}ms",
        model.display(),
        provider,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(session)
}

fn to_value<D: ndarray::Dimension + 'static>(
    array: ndarray::Array<f32, D>,
) -> Result<ort::value::DynValue> {
    Value::from_array(array)
        .map(|tensor| tensor.into_dyn())
        .map_err(|e| ClearcutError::processing(format!("Failed to convert input tensor: {e}")))
}

/// Batch segmentation model on ONNX Runtime
#[derive(Debug)]
pub struct OnnxSegmenter {
    session: Session,
    preprocessing: PreprocessingConfig,
}

impl OnnxSegmenter {
    /// # Errors
    /// Returns `ClearcutError::Model` when the session cannot be created
    pub fn new(
        model: &Path,
        provider: ExecutionProvider,
        preprocessing: PreprocessingConfig,
    ) -> Result<Self> {
        Ok(Self {
            session: create_session(model, provider)?,
            preprocessing,
        })
    }
}

impl SegmentationBackend for OnnxSegmenter {
    fn segment(&mut self, image: &DynamicImage) -> Result<SegmentationMask> {
        let prepared = ImagePreprocessor::preprocess(image, &self.preprocessing)?;
        let input = to_value(prepared.tensor)?;

        let start = Instant::now();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| ClearcutError::inference(format!("ONNX inference failed: {e}")))?;
        log::debug!(
            "Segmentation inference: {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        // Positional access: the first output is the foreground map.
        let first_key = outputs
            .keys()
            .next()
            .ok_or_else(|| ClearcutError::inference("No output tensors found"))?;
        let output = outputs
            .get(first_key)
            .ok_or_else(|| ClearcutError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| ClearcutError::inference(format!("Failed to extract output: {e}")))?;

        let shape = output.shape().to_vec();
        let (height, width) = match shape.as_slice() {
            [.., h, w] if *h > 0 && *w > 0 => (*h, *w),
            _ => {
                return Err(ClearcutError::inference(format!(
                    "Unexpected segmentation output shape {:?}",
                    shape
                )))
            },
        };
        let plane = output
            .to_owned()
            .into_shape_with_order((height, width))
            .map_err(|e| ClearcutError::inference(format!("Failed to reshape output: {e}")))?;

        ImagePreprocessor::plane_to_mask(plane.view())
    }
}

/// Tensor names used by a split promptable model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptableIo {
    pub pixel_values: String,
    pub input_points: String,
    pub input_labels: String,
    pub pred_masks: String,
    pub iou_scores: String,
}

impl Default for PromptableIo {
    fn default() -> Self {
        Self {
            pixel_values: "pixel_values".to_string(),
            input_points: "input_points".to_string(),
            input_labels: "input_labels".to_string(),
            pred_masks: "pred_masks".to_string(),
            iou_scores: "iou_scores".to_string(),
        }
    }
}

/// Promptable model split into encoder and decoder sessions
#[derive(Debug)]
pub struct OnnxPromptable {
    encoder: Session,
    decoder: Session,
    preprocessing: PreprocessingConfig,
    io: PromptableIo,
}

impl OnnxPromptable {
    /// # Errors
    /// Returns `ClearcutError::Model` when either session cannot be created
    pub fn new(
        encoder: &Path,
        decoder: &Path,
        provider: ExecutionProvider,
        preprocessing: PreprocessingConfig,
        io: PromptableIo,
    ) -> Result<Self> {
        Ok(Self {
            encoder: create_session(encoder, provider)?,
            decoder: create_session(decoder, provider)?,
            preprocessing,
            io,
        })
    }
}

impl PromptableBackend for OnnxPromptable {
    fn encode(&mut self, image: &DynamicImage) -> Result<EncoderOutput> {
        let prepared = ImagePreprocessor::preprocess(image, &self.preprocessing)?;
        let input = to_value(prepared.tensor)?;

        let start = Instant::now();
        let outputs = self
            .encoder
            .run(ort::inputs![self.io.pixel_values.as_str() => input])
            .map_err(|e| ClearcutError::inference(format!("Encoder failed: {e}")))?;

        let mut embedding = ImageEmbedding::new();
        for (name, value) in outputs.iter() {
            let tensor: ArrayD<f32> = value
                .try_extract_array::<f32>()
                .map_err(|e| ClearcutError::inference(format!("Failed to extract {name}: {e}")))?
                .to_owned();
            embedding = embedding.with_tensor(name, tensor);
        }
        log::debug!(
            "Encoder produced {} tensors in {:.2}ms",
            embedding.tensors().count(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        if embedding.is_empty() {
            return Err(ClearcutError::inference("Encoder returned no tensors"));
        }
        Ok(EncoderOutput {
            embedding,
            reshaped_size: prepared.reshaped_size,
            input_size: prepared.input_size,
        })
    }

    fn decode(
        &mut self,
        embedding: &ImageEmbedding,
        points: &[[f32; 2]],
        labels: &[f32],
    ) -> Result<DecoderOutput> {
        if points.len() != labels.len() {
            return Err(ClearcutError::inference("Point and label counts differ"));
        }

        let count = points.len();
        let coords = Array4::from_shape_fn((1, 1, count, 2), |(_, _, i, axis)| points[i][axis]);
        let label_tensor = Array3::from_shape_fn((1, 1, count), |(_, _, i)| labels[i] as i64);

        let mut inputs: Vec<(String, ort::value::DynValue)> = Vec::new();
        for (name, tensor) in embedding.tensors() {
            inputs.push((name.to_string(), to_value(tensor.clone())?));
        }
        inputs.push((self.io.input_points.clone(), to_value(coords)?));
        inputs.push((
            self.io.input_labels.clone(),
            Value::from_array(label_tensor)
                .map(|tensor| tensor.into_dyn())
                .map_err(|e| ClearcutError::processing(format!("Failed to convert labels: {e}")))?,
        ));

        let outputs = self
            .decoder
            .run(inputs)
            .map_err(|e| ClearcutError::inference(format!("Decoder failed: {e}")))?;

        let masks = outputs
            .get(self.io.pred_masks.as_str())
            .ok_or_else(|| ClearcutError::inference("Decoder output has no masks"))?
            .try_extract_array::<f32>()
            .map_err(|e| ClearcutError::inference(format!("Failed to extract masks: {e}")))?
            .to_owned();
        let scores: Vec<f32> = outputs
            .get(self.io.iou_scores.as_str())
            .ok_or_else(|| ClearcutError::inference("Decoder output has no scores"))?
            .try_extract_array::<f32>()
            .map_err(|e| ClearcutError::inference(format!("Failed to extract scores: {e}")))?
            .iter()
            .copied()
            .collect();

        // Masks come as [.., candidates, h, w]; drop the leading singleton axes.
        let mut masks = masks;
        while masks.ndim() > 3 {
            masks = masks.index_axis_move(Axis(0), 0);
        }
        let logits = masks
            .insert_axis(Axis(0))
            .into_dimensionality::<Ix4>()
            .map_err(|e| ClearcutError::inference(format!("Unexpected mask shape: {e}")))?;

        let output = DecoderOutput { logits, scores };
        output.validate()?;
        Ok(output)
    }
}

/// Creates `OnnxSegmenter`s from a model file
#[derive(Debug, Clone)]
pub struct OnnxSegmenterFactory {
    pub model: PathBuf,
    pub preprocessing: PreprocessingConfig,
}

impl OnnxSegmenterFactory {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(model: P) -> Self {
        Self {
            model: model.into(),
            preprocessing: PreprocessingConfig::segmentation(),
        }
    }
}

impl BackendFactory<dyn SegmentationBackend> for OnnxSegmenterFactory {
    fn create_backend(&self, provider: ExecutionProvider) -> Result<Box<dyn SegmentationBackend>> {
        Ok(Box::new(OnnxSegmenter::new(
            &self.model,
            provider,
            self.preprocessing.clone(),
        )?))
    }
}

/// Creates `OnnxPromptable`s from encoder and decoder files
#[derive(Debug, Clone)]
pub struct OnnxPromptableFactory {
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub preprocessing: PreprocessingConfig,
    pub io: PromptableIo,
}

impl OnnxPromptableFactory {
    #[must_use]
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(encoder: P, decoder: Q) -> Self {
        Self {
            encoder: encoder.into(),
            decoder: decoder.into(),
            preprocessing: PreprocessingConfig::promptable(),
            io: PromptableIo::default(),
        }
    }
}

impl BackendFactory<dyn PromptableBackend> for OnnxPromptableFactory {
    fn create_backend(&self, provider: ExecutionProvider) -> Result<Box<dyn PromptableBackend>> {
        Ok(Box::new(OnnxPromptable::new(
            &self.encoder,
            &self.decoder,
            provider,
            self.preprocessing.clone(),
            self.io.clone(),
        )?))
    }
}
