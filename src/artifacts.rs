use crate::config::RunConfig;
use crate::error::{Result, SyncError};
use crate::sampler::SampleOutput;
use candle_core::{DType, Tensor};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE: &str = "config.json";
pub const CANVAS_SAFETENSORS: &str = "canvas.safetensors";
pub const CANVAS_PNG: &str = "canvas.png";

/// `MM-DD-HHMMSS`, used to keep repeated runs of one tag apart.
pub fn current_time_tag() -> String {
    chrono::Local::now().format("%m-%d-%H%M%S").to_string()
}

/// Resolves the run's output directory, failing if it already exists.
/// Nothing is created.
pub fn check_output_dir(save_top_dir: &Path, tag: &str, time_tag: Option<&str>) -> Result<PathBuf> {
    let mut dir = save_top_dir.join(tag);
    if let Some(now) = time_tag {
        dir = dir.join(now);
    }
    if dir.is_dir() {
        return Err(SyncError::OutputDirectoryExists(dir));
    }
    Ok(dir)
}

/// Resolves and creates the run's output directory.
///
/// Fails without touching the filesystem if the directory already exists.
pub fn prepare_output_dir(save_top_dir: &Path, tag: &str, time_tag: Option<&str>) -> Result<PathBuf> {
    let dir = check_output_dir(save_top_dir, tag, time_tag)?;
    std::fs::create_dir_all(&dir)?;
    info!("Saving at {}", dir.display());
    Ok(dir)
}

/// Maps a `[3, H, W]` tensor in [-1, 1] to an 8-bit RGB image.
pub fn to_rgb_image(x: &Tensor) -> Result<RgbImage> {
    let x = match x.rank() {
        4 if x.dim(0)? == 1 => x.squeeze(0)?,
        _ => x.clone(),
    };
    let (channels, height, width) = x.dims3()?;
    if channels != 3 {
        return Err(SyncError::ShapeMismatch {
            expected: vec![3, height, width],
            actual: x.dims().to_vec(),
        });
    }
    let pixels = x
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| SyncError::ShapeMismatch {
        expected: vec![height, width, 3],
        actual: x.dims().to_vec(),
    })
}

/// Writes the config echo, the canonical tensor and, for pixel-space
/// canvases, PNGs of the canvas and of every view.
pub fn save_run_artifacts(dir: &Path, config: &RunConfig, output: &SampleOutput) -> Result<()> {
    let config_path = dir.join(CONFIG_FILE);
    std::fs::write(&config_path, serde_json::to_string_pretty(config)?)?;
    info!("Saved run configuration: {}", config_path.display());

    let canvas_path = dir.join(CANVAS_SAFETENSORS);
    output.canvas.save_safetensors("canvas", &canvas_path)?;
    info!("Saved canonical tensor: {}", canvas_path.display());

    if output.canvas.dim(0)? == 3 {
        to_rgb_image(&output.canvas)?.save(dir.join(CANVAS_PNG))?;
        for (i, view) in output.views.iter().enumerate() {
            to_rgb_image(view)?.save(dir.join(format!("view_{i}.png")))?;
        }
        info!("Saved {} view images", output.views.len());
    } else {
        info!(
            "Canvas has {} channels; decode {} with the model's VAE to obtain an image",
            output.canvas.dim(0)?,
            canvas_path.display()
        );
    }
    Ok(())
}
