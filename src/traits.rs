use crate::common::{SegResult, Threshold};
use crate::errors::Result;
use image::RgbImage;

/// Abstraction over card segmentation backends, so pipelines can run against
/// the ONNX model or a test double.
pub trait CardSegmentationModel: Send + Sync {
    /// Segments one RGB image into per-card results.
    fn apply_with_threshold(&self, image: &RgbImage, threshold: Threshold)
        -> Result<Vec<SegResult>>;

    /// (width, height) the backend resizes inputs to.
    fn input_size(&self) -> (u32, u32);
}
