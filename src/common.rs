use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView2};

/// Axis-aligned bounding box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    pub fn xyxy(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.w, self.y + self.h]
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Self) -> f32 {
        let [ax1, ay1, ax2, ay2] = self.xyxy();
        let [bx1, by1, bx2, by2] = other.xyxy();
        let iw = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let ih = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        let inter = iw * ih;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Confidence and overlap cutoffs for detection filtering.
#[derive(Debug, Clone, Copy)]
pub struct Threshold {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for Threshold {
    fn default() -> Self {
        Self {
            confidence: 0.6,
            iou: 0.5,
        }
    }
}

/// One detected card. The mask is a (height, width) heat map with values in
/// [0.0, 1.0] at the resolution of the source image.
#[derive(Debug, Clone)]
pub struct SegResult {
    pub score: f32,
    pub bbox: BBox,
    pub mask: Array2<f32>,
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Returns a copy of `image` with the box outline drawn on top.
pub fn draw_box(image: &RgbImage, bbox: &BBox, color: Rgb<u8>) -> RgbImage {
    const THICKNESS: u32 = 3;

    let mut out = image.clone();
    let (width, height) = out.dimensions();
    let [x1, y1, x2, y2] = bbox.xyxy();
    let x1 = (x1.max(0.0) as u32).min(width.saturating_sub(1));
    let y1 = (y1.max(0.0) as u32).min(height.saturating_sub(1));
    let x2 = (x2.max(0.0) as u32).min(width.saturating_sub(1));
    let y2 = (y2.max(0.0) as u32).min(height.saturating_sub(1));

    for dt in 0..THICKNESS {
        for x in x1..=x2 {
            let top = y1.saturating_add(dt);
            let bottom = y2.saturating_sub(dt);
            if top < height {
                out.put_pixel(x, top, color);
            }
            out.put_pixel(x, bottom.max(y1), color);
        }
        for y in y1..=y2 {
            let left = x1.saturating_add(dt);
            let right = x2.saturating_sub(dt);
            if left < width {
                out.put_pixel(left, y, color);
            }
            out.put_pixel(right.max(x1), y, color);
        }
    }
    out
}

/// Returns a copy of `image` with `color` blended into every pixel whose mask
/// probability exceeds `threshold`. The mask is expected at image resolution;
/// excess rows or columns on either side are ignored.
pub fn draw_mask(
    image: &RgbImage,
    mask: ArrayView2<'_, f32>,
    threshold: f32,
    color: Rgb<u8>,
) -> RgbImage {
    const ALPHA: f32 = 0.5;

    let mut out = image.clone();
    let (width, height) = out.dimensions();
    let rows = (mask.nrows() as u32).min(height);
    let cols = (mask.ncols() as u32).min(width);

    for y in 0..rows {
        for x in 0..cols {
            if mask[(y as usize, x as usize)] > threshold {
                let Rgb([r, g, b]) = *out.get_pixel(x, y);
                let blend = |c: u8, t: u8| -> u8 {
                    (f32::from(c) * (1.0 - ALPHA) + f32::from(t) * ALPHA).round() as u8
                };
                out.put_pixel(
                    x,
                    y,
                    Rgb([
                        blend(r, color.0[0]),
                        blend(g, color.0[1]),
                        blend(b, color.0[2]),
                    ]),
                );
            }
        }
    }
    out
}
