//! Model factories for the command-line front end

use crate::backends::{OnnxPromptableFactory, OnnxSegmenterFactory};
use crate::inference::{BackendFactory, PromptableBackend, SegmentationBackend};
use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;

fn ensure_model_file(path: &Path, role: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{} model not found: {}", role, path.display());
    }
    Ok(())
}

/// ONNX segmentation model factory for `model`
pub(crate) fn segmenter_factory(model: &Path) -> Result<Arc<dyn BackendFactory<dyn SegmentationBackend>>> {
    ensure_model_file(model, "Segmentation")?;
    Ok(Arc::new(OnnxSegmenterFactory::new(model)))
}

/// ONNX promptable model factory for an encoder/decoder pair
pub(crate) fn promptable_factory(
    encoder: &Path,
    decoder: &Path,
) -> Result<Arc<dyn BackendFactory<dyn PromptableBackend>>> {
    ensure_model_file(encoder, "Encoder")?;
    ensure_model_file(decoder, "Decoder")?;
    Ok(Arc::new(OnnxPromptableFactory::new(encoder, decoder)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_models_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("model.onnx");
        assert!(segmenter_factory(&missing).is_err());

        let encoder = dir.path().join("encoder.onnx");
        std::fs::write(&encoder, b"onnx").unwrap();
        let err = promptable_factory(&encoder, &missing).err().unwrap();
        assert!(err.to_string().contains("Decoder model not found"));
    }

    #[test]
    fn test_existing_model_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        std::fs::write(&model, b"onnx").unwrap();
        assert!(segmenter_factory(&model).is_ok());
    }
}
