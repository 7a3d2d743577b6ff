use clap::Parser;
use image::ImageFormat;
use std::path::PathBuf;
use std::thread;

use crate::common::Threshold;

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(short, long, default_value_t = 0.6)]
    pub confidence: f32,

    #[arg(long, default_value_t = 0.5)]
    pub iou: f32,

    /// Cutoff for binarizing mask probabilities when drawing overlays.
    #[arg(long, default_value_t = 0.5)]
    pub mask_threshold: f32,

    #[arg(
        short, long, default_value_t = thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    )]
    pub num_threads: usize,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub const fn threshold(&self) -> Threshold {
        Threshold {
            confidence: self.confidence,
            iou: self.iou,
        }
    }
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_format() {
        assert!(check_format("png").is_ok());
        assert!(check_format("jpeg").is_ok());
        assert!(check_format("onnx").is_err());
    }

    #[test]
    fn test_threshold_from_config() {
        let config = Config {
            input_dir: "input".into(),
            output_dir: "output".into(),
            model_path: "model.onnx".into(),
            format: "png".to_string(),
            confidence: 0.7,
            iou: 0.4,
            mask_threshold: 0.5,
            num_threads: 1,
        };
        let threshold = config.threshold();
        assert_eq!(threshold.confidence, 0.7);
        assert_eq!(threshold.iou, 0.4);
    }
}
