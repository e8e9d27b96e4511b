use crate::error::{Result, SyncError};
use crate::schedule::ScheduleConfig;
use crate::views::ViewSpec;
use candle_core::{DType, Device};
use clap::ValueEnum;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Sizes the global rayon pool that maps views in parallel. Safe to call
/// more than once; only the first call has an effect.
pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let workers = num_cpus::get().max(1);
        if let Err(e) = ThreadPoolBuilder::new().num_threads(workers).build_global() {
            warn!("View mapping keeps the existing rayon pool ({})", e);
        } else {
            info!("View mapping runs on {} rayon workers", workers);
        }
    });
}

/// Device for the noise predictor and the canvas.
pub fn get_device(use_cuda: bool) -> Device {
    #[cfg(feature = "cuda")]
    {
        if use_cuda {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Sampling on CUDA device 0");
                    return device;
                }
                Err(e) => warn!("CUDA device 0 unavailable ({}); sampling on CPU", e),
            }
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        if use_cuda {
            warn!("Built without the 'cuda' feature; sampling on CPU");
        }
    }

    if cfg!(feature = "mkl") {
        info!("Sampling on CPU with MKL-backed convolutions and matmuls");
    } else {
        info!("Sampling on CPU (build with --features mkl to speed up the epsilon model's conv2d layers)");
    }
    Device::Cpu
}

/// Environment variable naming the default epsilon model checkpoint.
pub const WEIGHTS_ENV: &str = "MULTIVIEW_SYNC_WEIGHTS";

pub const DEFAULT_SEED: u64 = 2024;
pub const DEFAULT_INFERENCE_STEPS: usize = 30;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_SAVE_TOP_DIR: &str = "./output";
/// Side of the square canvas, in latent pixels for SD and pixels for DeepFloyd IF stage 1.
pub const CANVAS_SIZE: usize = 64;
/// Width of the wide-image canvas (8x the square canvas).
pub const WIDE_CANVAS_WIDTH: usize = 512;
/// Stride of the sliding crop windows for wide images.
pub const WIDE_WINDOW_STRIDE: usize = 8;

// ── Epsilon model ───────────────────────────────────────────────────────────
pub const MODEL_HIDDEN_CHANNELS: usize = 64;
pub const MODEL_NUM_BLOCKS: usize = 4;
/// Prompt slots of the epsilon model, including the empty prompt.
pub const MODEL_PROMPT_SLOTS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Stable Diffusion: 4-channel latent canvas.
    #[value(name = "sd")]
    #[serde(rename = "sd")]
    StableDiffusion,
    /// DeepFloyd IF stage 1: 3-channel pixel canvas, predicts noise and variance.
    #[value(name = "deepfloyd")]
    #[serde(rename = "deepfloyd")]
    DeepFloyd,
}

impl ModelKind {
    pub fn sample_channels(self) -> usize {
        match self {
            ModelKind::StableDiffusion => 4,
            ModelKind::DeepFloyd => 3,
        }
    }

    pub fn predicted_channels(self) -> usize {
        match self {
            ModelKind::StableDiffusion => 4,
            ModelKind::DeepFloyd => 6,
        }
    }

    pub fn schedule_config(self) -> ScheduleConfig {
        match self {
            ModelKind::StableDiffusion => ScheduleConfig::stable_diffusion(),
            ModelKind::DeepFloyd => ScheduleConfig::deepfloyd(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// Image that reads differently under a geometric transform.
    #[value(name = "ambiguous_image")]
    AmbiguousImage,
    /// Panorama stitched from overlapping crop windows.
    #[value(name = "wide_image")]
    WideImage,
}

impl AppKind {
    pub fn default_model(self) -> ModelKind {
        match self {
            AppKind::AmbiguousImage => ModelKind::DeepFloyd,
            AppKind::WideImage => ModelKind::StableDiffusion,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            AppKind::AmbiguousImage => "ambiguous_image",
            AppKind::WideImage => "wide_image",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSpec {
    pub height: usize,
    pub width: usize,
}

/// Fully resolved configuration of one run; echoed to `config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub app: AppKind,
    pub model: ModelKind,
    pub prompts: Vec<String>,
    pub views: Vec<ViewSpec>,
    /// Index into `prompts` for every view.
    pub view_prompts: Vec<usize>,
    pub canvas: CanvasSpec,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    pub tag: String,
    pub save_top_dir: PathBuf,
    pub save_dir_now: bool,
    #[serde(default = "default_true")]
    pub sync: bool,
    #[serde(default)]
    pub weights: Option<PathBuf>,
    #[serde(default)]
    pub scheduler_config: Option<PathBuf>,
    #[serde(default)]
    pub half: bool,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_true() -> bool {
    true
}

impl RunConfig {
    /// Defaults for an application, using the model it was built around
    /// unless one is given.
    pub fn for_app(app: AppKind, model: Option<ModelKind>) -> Self {
        let model = model.unwrap_or(app.default_model());
        let (prompts, views, view_prompts, canvas) = match app {
            AppKind::AmbiguousImage => (
                vec![
                    "an oil painting of a cat".to_string(),
                    "an oil painting of a truck".to_string(),
                ],
                vec![ViewSpec::Identity, ViewSpec::Rotate { quarter_turns: 1 }],
                vec![0, 1],
                CanvasSpec {
                    height: CANVAS_SIZE,
                    width: CANVAS_SIZE,
                },
            ),
            AppKind::WideImage => {
                let views = ViewSpec::sliding_windows(CANVAS_SIZE, WIDE_CANVAS_WIDTH, CANVAS_SIZE, WIDE_WINDOW_STRIDE);
                let view_prompts = vec![0; views.len()];
                (
                    vec!["a photo of a mountain range at twilight".to_string()],
                    views,
                    view_prompts,
                    CanvasSpec {
                        height: CANVAS_SIZE,
                        width: WIDE_CANVAS_WIDTH,
                    },
                )
            }
        };
        Self {
            app,
            model,
            prompts,
            views,
            view_prompts,
            canvas,
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: DEFAULT_SEED,
            tag: app.tag().to_string(),
            save_top_dir: PathBuf::from(DEFAULT_SAVE_TOP_DIR),
            save_dir_now: false,
            sync: true,
            weights: None,
            scheduler_config: None,
            half: false,
            dry_run: false,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Replaces the prompts. A single prompt is shared by every view;
    /// otherwise view `i` uses prompt `i % prompts.len()`.
    pub fn set_prompts(&mut self, prompts: Vec<String>) {
        self.view_prompts = if prompts.len() <= 1 {
            vec![0; self.views.len()]
        } else {
            (0..self.views.len()).map(|i| i % prompts.len()).collect()
        };
        self.prompts = prompts;
    }

    pub fn dtype(&self) -> DType {
        if self.half { DType::F16 } else { DType::F32 }
    }

    pub fn channels(&self) -> usize {
        self.model.sample_channels()
    }

    pub fn schedule_config(&self) -> Result<ScheduleConfig> {
        match &self.scheduler_config {
            Some(path) => ScheduleConfig::from_json_file(path),
            None => Ok(self.model.schedule_config()),
        }
    }

    /// Checks everything that can be checked before any computation runs.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SyncError::InvalidView(msg));
        if self.views.is_empty() {
            return invalid("at least one view is required".to_string());
        }
        if self.view_prompts.len() != self.views.len() {
            return invalid(format!(
                "{} views but {} view prompt assignments",
                self.views.len(),
                self.view_prompts.len()
            ));
        }
        if self.prompts.is_empty() {
            return invalid("at least one prompt is required".to_string());
        }
        if self.prompts.len() + 1 > MODEL_PROMPT_SLOTS {
            return invalid(format!(
                "at most {} prompts are supported, got {}",
                MODEL_PROMPT_SLOTS - 1,
                self.prompts.len()
            ));
        }
        if let Some(&p) = self.view_prompts.iter().find(|&&p| p >= self.prompts.len()) {
            return invalid(format!("view prompt index {p} out of range for {} prompts", self.prompts.len()));
        }
        if self.canvas.height == 0 || self.canvas.width == 0 {
            return invalid(format!("empty canvas {}x{}", self.canvas.height, self.canvas.width));
        }
        if self.tag.trim().is_empty() {
            return invalid("run tag must not be empty".to_string());
        }
        for spec in &self.views {
            spec.build(self.channels(), self.canvas.height, self.canvas.width)?;
        }
        Ok(())
    }
}
