pub mod common;
pub mod config;
pub mod errors;
pub mod model;
pub mod traits;

pub mod mocks;

use image::{ImageFormat, Rgb};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use common::{draw_box, draw_mask, BBox, SegResult, Threshold};
pub use config::Config;
pub use errors::{MicrowinkError, Result};
pub use model::SegModel;
pub use traits::CardSegmentationModel;

const MASK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Runs a segmentation backend over a directory of images and saves overlay
/// visualizations mirroring the input layout.
pub struct ImageProcessor<M: CardSegmentationModel> {
    model: M,
    config: Config,
}

impl<M: CardSegmentationModel> ImageProcessor<M> {
    pub const fn new(model: M, config: Config) -> Self {
        Self { model, config }
    }

    /// Processes every supported image under the input directory. Returns the
    /// number of processed files.
    pub fn process_directory(&self) -> Result<usize> {
        let input_path = &self.config.input_dir;
        let output_path = &self.config.output_dir;

        if !input_path.exists() {
            return Err(MicrowinkError::FileSystem {
                path: input_path.clone(),
                operation: "input directory lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(output_path).map_err(|e| MicrowinkError::FileSystem {
            path: output_path.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files(input_path)?;
        if image_files.is_empty() {
            return Ok(0);
        }

        let pb = ProgressBar::new(image_files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .map_err(|e| MicrowinkError::Configuration {
                    message: format!("invalid progress template: {e}"),
                })?
                .progress_chars("#>-"),
        );

        image_files
            .par_iter()
            .try_for_each(|input_file| -> Result<()> {
                self.process_single_image(input_file, output_path)?;
                pb.inc(1);
                Ok(())
            })?;

        pb.finish();
        Ok(image_files.len())
    }

    fn collect_image_files(&self, input_path: &Path) -> Result<Vec<PathBuf>> {
        let mut image_files = Vec::new();
        for entry in WalkDir::new(input_path).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() && self.is_supported_image_format(path) {
                image_files.push(path.to_path_buf());
            }
        }
        Ok(image_files)
    }

    pub fn is_supported_image_format(&self, path: &Path) -> bool {
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            matches!(extension.to_lowercase().as_str(), "jpg" | "jpeg" | "png" | "webp")
        } else {
            false
        }
    }

    /// Segments one image and saves it with mask and box overlays drawn for
    /// every detected card.
    fn process_single_image(&self, input_file: &Path, output_dir: &Path) -> Result<()> {
        let image = image::open(input_file)
            .map_err(|e| MicrowinkError::ImageProcessing {
                path: input_file.display().to_string(),
                operation: "image decoding".to_string(),
                source: Box::new(e),
            })?
            .into_rgb8();

        let cards = self
            .model
            .apply_with_threshold(&image, self.config.threshold())
            .map_err(|e| MicrowinkError::ImageProcessing {
                path: input_file.display().to_string(),
                operation: "card segmentation".to_string(),
                source: Box::new(e),
            })?;

        let mut canvas = image;
        for card in &cards {
            canvas = draw_mask(
                &canvas,
                card.mask.view(),
                self.config.mask_threshold,
                MASK_COLOR,
            );
            canvas = draw_box(&canvas, &card.bbox, BOX_COLOR);
        }

        let relative_path = self.get_relative_path(input_file)?;
        let output_file = output_dir
            .join(relative_path)
            .with_extension(&self.config.format);

        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent).map_err(|e| MicrowinkError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }

        let output_format =
            ImageFormat::from_extension(&self.config.format).unwrap_or(ImageFormat::Png);
        canvas
            .save_with_format(&output_file, output_format)
            .map_err(|e| MicrowinkError::ImageProcessing {
                path: output_file.display().to_string(),
                operation: "image saving".to_string(),
                source: Box::new(e),
            })?;

        Ok(())
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        let input_dir = &self.config.input_dir;
        input_file
            .strip_prefix(input_dir)
            .map(|p| p.to_path_buf())
            .map_err(|_| MicrowinkError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path resolution".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is outside the input directory",
                ),
            })
    }
}

impl ImageProcessor<SegModel> {
    pub fn with_onnx_model(config: Config) -> Result<Self> {
        let model = SegModel::from_path(&config.model_path)?;
        Ok(Self::new(model, config))
    }
}
