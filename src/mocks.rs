use crate::common::{BBox, SegResult, Threshold};
use crate::errors::Result;
use crate::traits::CardSegmentationModel;
use image::RgbImage;
use ndarray::Array2;

/// Deterministic segmentation backend for tests. Reports one card centered in
/// the image, covering half of each dimension, with a solid in-box mask.
#[derive(Debug, Clone)]
pub struct MockSegModel {
    pub input_size: (u32, u32),
    pub score: f32,
}

impl MockSegModel {
    pub const fn new(input_size: (u32, u32)) -> Self {
        Self {
            input_size,
            score: 0.9,
        }
    }
}

impl CardSegmentationModel for MockSegModel {
    fn apply_with_threshold(
        &self,
        image: &RgbImage,
        threshold: Threshold,
    ) -> Result<Vec<SegResult>> {
        if self.score <= threshold.confidence {
            return Ok(vec![]);
        }

        let (width, height) = image.dimensions();
        let bbox = BBox {
            x: width as f32 / 4.0,
            y: height as f32 / 4.0,
            w: width as f32 / 2.0,
            h: height as f32 / 2.0,
        };

        let mut mask = Array2::<f32>::zeros((height as usize, width as usize));
        let [x1, y1, x2, y2] = bbox.xyxy();
        for ((row, col), v) in mask.indexed_iter_mut() {
            let c = col as f32;
            let r = row as f32;
            if c >= x1 && c < x2 && r >= y1 && r < y2 {
                *v = 1.0;
            }
        }

        Ok(vec![SegResult {
            score: self.score,
            bbox,
            mask,
        }])
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }
}

pub const fn create_mock_model() -> MockSegModel {
    MockSegModel::new((640, 640))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_mock_model_creation() {
        let mock = create_mock_model();
        assert_eq!(mock.input_size(), (640, 640));
    }

    #[test]
    fn test_mock_model_detects_one_card() -> Result<()> {
        let mock = create_mock_model();
        let image = RgbImage::from_pixel(100, 80, Rgb([255, 0, 0]));

        let results = mock.apply_with_threshold(&image, Threshold::default())?;
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert_eq!(result.mask.dim(), (80, 100));
        assert_eq!(result.bbox.xyxy(), [25.0, 20.0, 75.0, 60.0]);
        assert_eq!(result.mask[(40, 50)], 1.0);
        assert_eq!(result.mask[(0, 0)], 0.0);
        Ok(())
    }

    #[test]
    fn test_mock_model_respects_confidence() -> Result<()> {
        let mock = create_mock_model();
        let image = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));

        let threshold = Threshold {
            confidence: 0.95,
            iou: 0.5,
        };
        assert!(mock.apply_with_threshold(&image, threshold)?.is_empty());
        Ok(())
    }
}
