use std::path::Path;

use image::{imageops, imageops::FilterType, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::clamp;
use ort::session::{builder::SessionBuilder, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;

use crate::{
    common::{sigmoid, BBox, SegResult, Threshold},
    errors::{MicrowinkError, Result},
    traits::CardSegmentationModel,
};

/// Letterbox fill, matching the value the model was trained with.
const BORDER_COLOR: Rgb<u8> = Rgb([114, 114, 114]);
/// Nudge for splitting an odd padding remainder between the two sides.
const EPS: f32 = 0.1;

/// Single-class card segmentation model backed by an ONNX inference session.
///
/// The session expects one `[1, 3, H, W]` f32 input and produces YOLO-seg
/// outputs: predictions `(1, 5 + nm, A)` and mask prototypes `(1, nm, ph, pw)`.
/// The session is behind a mutex, so `apply` calls on a shared instance
/// serialize.
#[derive(Debug)]
pub struct SegModel {
    session: Mutex<Session>,
    input_name: String,
    output_names: (String, String),
    model_width: u32,
    model_height: u32,
}

impl SegModel {
    /// Loads a model from a serialized ONNX file using CPU inference.
    ///
    /// To pick execution providers, build a [`Session`] with ort's builder
    /// and pass it to [`SegModel::from_session`].
    pub fn from_path(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(MicrowinkError::FileSystem {
                path: model_path.to_path_buf(),
                operation: "model file lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "model path does not exist",
                ),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| MicrowinkError::Model {
                operation: "session builder initialization".to_string(),
                source: Box::new(e),
            })?
            .commit_from_file(model_path)
            .map_err(|e| MicrowinkError::Model {
                operation: format!("model file load: {}", model_path.display()),
                source: Box::new(e),
            })?;
        Self::from_session(session)
    }

    /// Adopts a caller-built inference session.
    pub fn from_session(session: Session) -> Result<Self> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| MicrowinkError::Validation {
                field: "model inputs".to_string(),
                reason: "model declares no inputs".to_string(),
            })?;
        let input_name = input.name.clone();
        let shape = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| MicrowinkError::Validation {
                field: "model input".to_string(),
                reason: "input 0 is not a tensor".to_string(),
            })?;
        if shape.len() != 4 || shape[0] != 1 || shape[1] != 3 {
            return Err(MicrowinkError::Validation {
                field: "model input shape".to_string(),
                reason: format!("expected [1, 3, H, W], got {shape:?}"),
            });
        }
        if shape[2] <= 0 || shape[3] <= 0 {
            return Err(MicrowinkError::Validation {
                field: "model input shape".to_string(),
                reason: format!("dynamic spatial dimensions are not supported, got {shape:?}"),
            });
        }
        let model_height = shape[2] as u32;
        let model_width = shape[3] as u32;

        if session.outputs.len() < 2 {
            return Err(MicrowinkError::Validation {
                field: "model outputs".to_string(),
                reason: format!(
                    "expected predictions and mask prototypes, got {} outputs",
                    session.outputs.len()
                ),
            });
        }
        let output_names = (
            session.outputs[0].name.clone(),
            session.outputs[1].name.clone(),
        );

        let model = Self {
            session: Mutex::new(session),
            input_name,
            output_names,
            model_width,
            model_height,
        };
        model.warmup()?;
        Ok(model)
    }

    /// (width, height) the session resizes inputs to.
    pub fn input_size(&self) -> (u32, u32) {
        (self.model_width, self.model_height)
    }

    /// Runs segmentation with the default thresholds.
    pub fn apply(&self, image: &RgbImage) -> Result<Vec<SegResult>> {
        self.apply_with_threshold(image, Threshold::default())
    }

    /// Runs segmentation and returns one result per detected card, sorted by
    /// descending score. Returns an empty vector when nothing survives the
    /// confidence and overlap filtering.
    pub fn apply_with_threshold(
        &self,
        image: &RgbImage,
        threshold: Threshold,
    ) -> Result<Vec<SegResult>> {
        let (blob, ratio, padding) = letterbox(image, self.model_width, self.model_height);
        let (preds, protos) = self.run(blob.view())?;
        postprocess(
            preds.view(),
            protos.view(),
            image.dimensions(),
            ratio,
            padding,
            threshold,
        )
    }

    fn run(&self, blob: ArrayView4<f32>) -> Result<(Array2<f32>, Array3<f32>)> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&blob.as_standard_layout())?
        ])?;

        let preds = outputs[self.output_names.0.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?;
        // (1, channels, anchors) -> (anchors, channels)
        let preds = preds.index_axis(Axis(0), 0).t().to_owned();

        let protos = outputs[self.output_names.1.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?;
        let protos = protos.index_axis(Axis(0), 0).to_owned();
        Ok((preds, protos))
    }

    /// One inference pass on a zero tensor. Surfaces graph problems at load
    /// time instead of on the first `apply`.
    fn warmup(&self) -> Result<()> {
        let blob = Array4::<f32>::zeros((
            1,
            3,
            self.model_height as usize,
            self.model_width as usize,
        ));
        self.run(blob.view())?;
        Ok(())
    }
}

impl CardSegmentationModel for SegModel {
    fn apply_with_threshold(
        &self,
        image: &RgbImage,
        threshold: Threshold,
    ) -> Result<Vec<SegResult>> {
        SegModel::apply_with_threshold(self, image, threshold)
    }

    fn input_size(&self) -> (u32, u32) {
        SegModel::input_size(self)
    }
}

/// Resizes `image` preserving aspect ratio and centers it on a border-colored
/// canvas of the model's spatial size. Returns the CHW f32 blob in [0, 1]
/// with a leading batch axis, the resize ratio, and the (x, y) padding.
pub(crate) fn letterbox(
    image: &RgbImage,
    target_w: u32,
    target_h: u32,
) -> (Array4<f32>, f32, (f32, f32)) {
    let (iw, ih) = image.dimensions();
    let ratio = f32::min(target_h as f32 / ih as f32, target_w as f32 / iw as f32);
    let rw = ((iw as f32 * ratio).round().max(1.0)) as u32;
    let rh = ((ih as f32 * ratio).round().max(1.0)) as u32;
    let pad_w = (target_w as f32 - rw as f32) / 2.0;
    let pad_h = (target_h as f32 - rh as f32) / 2.0;

    let resized = if (rw, rh) != (iw, ih) {
        imageops::resize(image, rw, rh, FilterType::Lanczos3)
    } else {
        image.clone()
    };

    let left = (pad_w - EPS).round().max(0.0) as i64;
    let top = (pad_h - EPS).round().max(0.0) as i64;
    let mut canvas = RgbImage::from_pixel(target_w, target_h, BORDER_COLOR);
    imageops::overlay(&mut canvas, &resized, left, top);

    let blob = canvas
        .as_ndarray3()
        .map(|&v| f32::from(v) / 255.0)
        .insert_axis(Axis(0));
    (blob, ratio, (pad_w, pad_h))
}

/// Turns raw prediction and prototype tensors into per-card results.
///
/// `preds` is `(anchors, 4 + 1 + nm)` rows of `cx, cy, w, h, score, coefs..`
/// in model coordinates; `protos` is `(nm, ph, pw)` mask prototype logits.
pub(crate) fn postprocess(
    preds: ArrayView2<f32>,
    protos: ArrayView3<f32>,
    image_size: (u32, u32),
    ratio: f32,
    padding: (f32, f32),
    threshold: Threshold,
) -> Result<Vec<SegResult>> {
    let (nm, _, _) = protos.dim();
    let channels = preds.ncols();
    if channels != 4 + 1 + nm {
        return Err(MicrowinkError::Validation {
            field: "model predictions".to_string(),
            reason: format!(
                "expected {} channels for a single-class model with {} mask coefficients, got {}",
                4 + 1 + nm,
                nm,
                channels
            ),
        });
    }

    let mut scores = Vec::new();
    let mut boxes = Vec::new();
    let mut coefs = Vec::new();
    for row in preds.rows() {
        let score = row[4];
        if score > threshold.confidence {
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            scores.push(score);
            boxes.push(BBox::from_xyxy(
                cx - w / 2.0,
                cy - h / 2.0,
                cx + w / 2.0,
                cy + h / 2.0,
            ));
            coefs.push(row.slice(s![5..]).to_vec());
        }
    }

    let (iw, ih) = image_size;
    let (pad_w, pad_h) = padding;
    let mut results = Vec::new();
    for i in nms(&boxes, &scores, threshold.iou) {
        let [mx1, my1, mx2, my2] = boxes[i].xyxy();
        let x1 = clamp((mx1 - pad_w) / ratio, 0.0, iw as f32);
        let y1 = clamp((my1 - pad_h) / ratio, 0.0, ih as f32);
        let x2 = clamp((mx2 - pad_w) / ratio, 0.0, iw as f32);
        let y2 = clamp((my2 - pad_h) / ratio, 0.0, ih as f32);
        let bbox = BBox::from_xyxy(x1, y1, x2, y2);

        let mask = decode_mask(protos, &coefs[i], &bbox, image_size)?;
        results.push(SegResult {
            score: scores[i],
            bbox,
            mask,
        });
    }
    Ok(results)
}

/// Greedy IoU suppression. Returns kept indices in descending score order.
pub(crate) fn nms(boxes: &[BBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; scores.len()];
    let mut keep = Vec::new();
    for &i in &order {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order {
            if j != i && !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    keep
}

/// Combines prototype logits with one instance's coefficients and produces a
/// heat map at image resolution: prototype matmul, letterbox crop, resize,
/// zero outside the box, sigmoid.
fn decode_mask(
    protos: ArrayView3<f32>,
    coefs: &[f32],
    bbox: &BBox,
    image_size: (u32, u32),
) -> Result<Array2<f32>> {
    let (nm, ph, pw) = protos.dim();
    let flat = protos.to_shape((nm, ph * pw))?;
    let logits = ArrayView1::from(coefs)
        .dot(&flat)
        .into_shape_with_order((ph, pw))?;

    let mut mask = scale_mask(logits.view(), image_size)?;
    crop_mask(&mut mask, bbox);
    mask.mapv_inplace(sigmoid);
    Ok(mask)
}

/// Cuts the letterbox padding out of a prototype-resolution map and resizes
/// the remainder to image resolution.
fn scale_mask(mask: ArrayView2<f32>, image_size: (u32, u32)) -> Result<Array2<f32>> {
    let (mh, mw) = mask.dim();
    let (iw, ih) = image_size;

    let gain = f32::min(mh as f32 / ih as f32, mw as f32 / iw as f32);
    let pad_w = (mw as f32 - iw as f32 * gain) / 2.0;
    let pad_h = (mh as f32 - ih as f32 * gain) / 2.0;

    let top = ((pad_h - EPS).round().max(0.0)) as usize;
    let bottom = (((mh as f32 - pad_h + EPS).round()) as usize).min(mh);
    let left = ((pad_w - EPS).round().max(0.0)) as usize;
    let right = (((mw as f32 - pad_w + EPS).round()) as usize).min(mw);

    let cropped = mask.slice(s![top..bottom, left..right]);
    let (ch, cw) = cropped.dim();
    let buffer = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(
        cw as u32,
        ch as u32,
        cropped.to_owned().into_raw_vec_and_offset().0,
    )
    .ok_or_else(|| MicrowinkError::Model {
        operation: "mask buffer construction".to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "mask crop does not fit its buffer",
        )),
    })?;

    let resized = imageops::resize(&buffer, iw, ih, FilterType::Lanczos3);
    Ok(Array2::from_shape_vec(
        (ih as usize, iw as usize),
        resized.into_raw(),
    )?)
}

/// Zeroes the map outside the box: columns in `[x1, x2)`, rows in `[y1, y2)`.
fn crop_mask(mask: &mut Array2<f32>, bbox: &BBox) {
    let [x1, y1, x2, y2] = bbox.xyxy();
    for ((row, col), v) in mask.indexed_iter_mut() {
        let c = col as f32;
        let r = row as f32;
        if !(c >= x1 && c < x2 && r >= y1 && r < y2) {
            *v = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const BORDER_VALUE: f32 = 114.0 / 255.0;

    #[test]
    fn test_letterbox_shape_and_range() {
        let image = RgbImage::from_pixel(100, 50, Rgb([255, 255, 255]));
        let (blob, ratio, (pad_w, pad_h)) = letterbox(&image, 64, 64);

        assert_eq!(blob.shape(), &[1, 3, 64, 64]);
        assert!((ratio - 0.64).abs() < 1e-6);
        assert_eq!(pad_w, 0.0);
        assert_eq!(pad_h, 16.0);
        assert!(blob.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_letterbox_pads_with_border_color() {
        let image = RgbImage::from_pixel(100, 50, Rgb([255, 255, 255]));
        let (blob, _, _) = letterbox(&image, 64, 64);

        // rows 0..16 and 48..64 are padding, the middle is image content
        for c in 0..3 {
            assert!((blob[[0, c, 0, 0]] - BORDER_VALUE).abs() < 1e-6);
            assert!((blob[[0, c, 63, 63]] - BORDER_VALUE).abs() < 1e-6);
            assert!((blob[[0, c, 32, 32]] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_letterbox_noop_for_exact_fit() {
        let image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        let (blob, ratio, (pad_w, pad_h)) = letterbox(&image, 64, 64);

        assert_eq!(blob.shape(), &[1, 3, 64, 64]);
        assert_eq!(ratio, 1.0);
        assert_eq!((pad_w, pad_h), (0.0, 0.0));
        assert!(blob.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_letterbox_tiny_image() {
        let image = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        let (blob, _, _) = letterbox(&image, 64, 64);
        assert_eq!(blob.shape(), &[1, 3, 64, 64]);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let boxes = vec![
            BBox::from_xyxy(0.0, 0.0, 10.0, 10.0),
            BBox::from_xyxy(1.0, 1.0, 11.0, 11.0),
            BBox::from_xyxy(50.0, 50.0, 60.0, 60.0),
        ];
        let scores = vec![0.8, 0.9, 0.7];

        let keep = nms(&boxes, &scores, 0.5);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn test_nms_keeps_disjoint_boxes() {
        let boxes = vec![
            BBox::from_xyxy(0.0, 0.0, 10.0, 10.0),
            BBox::from_xyxy(20.0, 20.0, 30.0, 30.0),
            BBox::from_xyxy(40.0, 40.0, 50.0, 50.0),
        ];
        let scores = vec![0.7, 0.9, 0.8];

        let keep = nms(&boxes, &scores, 0.5);
        assert_eq!(keep, vec![1, 2, 0]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(&[], &[], 0.5).is_empty());
    }

    /// One confident anchor, one below the cutoff; prototypes are constant so
    /// the in-box mask saturates.
    #[test]
    fn test_postprocess_synthetic() {
        // model space is 8x8 for a 16x16 image (ratio 0.5, no padding)
        let preds = ndarray::array![
            [4.0, 4.0, 4.0, 4.0, 0.9, 2.0, 2.0],
            [4.0, 4.0, 4.0, 4.0, 0.3, 2.0, 2.0],
        ];
        let protos = Array3::<f32>::ones((2, 8, 8));

        let results = postprocess(
            preds.view(),
            protos.view(),
            (16, 16),
            0.5,
            (0.0, 0.0),
            Threshold::default(),
        )
        .unwrap();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.score, 0.9);
        assert_eq!(result.bbox.xyxy(), [4.0, 4.0, 12.0, 12.0]);
        assert_eq!(result.mask.dim(), (16, 16));
        assert!(result.mask.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // inside the box the constant logit 4.0 saturates the sigmoid
        assert!(result.mask[(8, 8)] > 0.9);
        // outside the box the logit is zeroed
        assert_eq!(result.mask[(0, 0)], 0.5);
    }

    #[test]
    fn test_postprocess_no_detections() {
        let preds = ndarray::array![[4.0, 4.0, 4.0, 4.0, 0.1, 0.0, 0.0]];
        let protos = Array3::<f32>::ones((2, 8, 8));

        let results = postprocess(
            preds.view(),
            protos.view(),
            (16, 16),
            0.5,
            (0.0, 0.0),
            Threshold::default(),
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_postprocess_empty_predictions() {
        let preds = Array2::<f32>::zeros((0, 7));
        let protos = Array3::<f32>::ones((2, 8, 8));

        let results = postprocess(
            preds.view(),
            protos.view(),
            (16, 16),
            0.5,
            (0.0, 0.0),
            Threshold::default(),
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_postprocess_rejects_channel_mismatch() {
        let preds = Array2::<f32>::zeros((1, 6));
        let protos = Array3::<f32>::ones((2, 8, 8));

        let err = postprocess(
            preds.view(),
            protos.view(),
            (16, 16),
            0.5,
            (0.0, 0.0),
            Threshold::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MicrowinkError::Validation { .. }));
    }

    #[test]
    fn test_postprocess_clamps_boxes_to_image() {
        // box hangs over the right and bottom edges in model space
        let preds = ndarray::array![[7.0, 7.0, 6.0, 6.0, 0.9, 1.0, 1.0]];
        let protos = Array3::<f32>::ones((2, 8, 8));

        let results = postprocess(
            preds.view(),
            protos.view(),
            (16, 16),
            0.5,
            (0.0, 0.0),
            Threshold::default(),
        )
        .unwrap();

        let [x1, y1, x2, y2] = results[0].bbox.xyxy();
        assert!(x1 >= 0.0 && y1 >= 0.0);
        assert!(x2 <= 16.0 && y2 <= 16.0);
    }

    #[test]
    fn test_scale_mask_dimensions() {
        let mask = Array2::<f32>::ones((8, 8));
        let scaled = scale_mask(mask.view(), (32, 16)).unwrap();
        assert_eq!(scaled.dim(), (16, 32));
    }

    #[test]
    fn test_crop_mask_zeroes_outside() {
        let mut mask = Array2::<f32>::ones((8, 8));
        let bbox = BBox::from_xyxy(2.0, 2.0, 6.0, 6.0);
        crop_mask(&mut mask, &bbox);

        assert_eq!(mask[(0, 0)], 0.0);
        assert_eq!(mask[(4, 4)], 1.0);
        // half-open interval: index 6 is outside
        assert_eq!(mask[(6, 6)], 0.0);
        assert_eq!(mask[(2, 2)], 1.0);
    }
}
