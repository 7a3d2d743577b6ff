use anyhow::{ensure, Result};
use rayon::ThreadPoolBuilder;

use microwink::{Config, ImageProcessor};

fn main() -> Result<()> {
    let config = Config::new();

    ensure!(config.model_path.exists(), "Model path does not exist");
    ensure!(config.input_dir.exists(), "Input directory does not exist");

    ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build_global()?;

    let processor = ImageProcessor::with_onnx_model(config)?;
    let processed = processor.process_directory()?;
    println!("Processed {processed} images");

    Ok(())
}
