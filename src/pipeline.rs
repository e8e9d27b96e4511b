use crate::artifacts::{check_output_dir, current_time_tag, prepare_output_dir, save_run_artifacts};
use crate::config::{MODEL_HIDDEN_CHANNELS, MODEL_NUM_BLOCKS, MODEL_PROMPT_SLOTS, RunConfig};
use crate::models::epsilon::EpsilonModelConfig;
use crate::models::{ClassifierFreeGuidance, Conditioning, ConvEpsilonModel, NoisePredictor, OracleNoisePredictor};
use crate::sampler::{SampleOutput, SyncSampler, initial_noise};
use crate::schedule::NoiseSchedule;
use crate::sync::ViewSynchronizer;
use crate::views::View;
use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub output: SampleOutput,
}

/// Smooth, deterministic RGB-ish pattern used as the dry-run target.
pub fn reference_canvas(channels: usize, height: usize, width: usize, device: &Device) -> candle_core::Result<Tensor> {
    let rows = Tensor::arange(0f32, height as f32, device)?
        .affine(2.0 * std::f64::consts::PI / height.max(1) as f64, 0.0)?
        .reshape((1, height, 1))?;
    let cols = Tensor::arange(0f32, width as f32, device)?
        .affine(2.0 * std::f64::consts::PI / width.max(1) as f64, 0.0)?
        .reshape((1, 1, width))?;
    let phases: Vec<f32> = (0..channels).map(|c| c as f32 * 0.7).collect();
    let phases = Tensor::from_vec(phases, (channels, 1, 1), device)?;
    let pattern = rows.broadcast_add(&cols)?.broadcast_add(&phases)?.sin()?;
    pattern.affine(0.8, 0.0)
}

/// Builds the noise predictor the configuration asks for.
fn build_predictor(
    config: &RunConfig,
    schedule: &NoiseSchedule,
    synchronizer: &ViewSynchronizer,
    device: &Device,
) -> Result<Box<dyn NoisePredictor>> {
    if config.dry_run {
        info!("Dry run: using the oracle predictor with a reference canvas");
        let target = reference_canvas(config.channels(), config.canvas.height, config.canvas.width, device)?;
        let targets = synchronizer.forward_all(&target, None)?;
        return Ok(Box::new(OracleNoisePredictor::new(targets, schedule.clone())));
    }

    let weights = config
        .weights
        .clone()
        .or_else(|| std::env::var(crate::config::WEIGHTS_ENV).ok().map(PathBuf::from));
    let model = ConvEpsilonModel::load(
        EpsilonModelConfig {
            in_channels: config.model.sample_channels(),
            out_channels: config.model.predicted_channels(),
            hidden_channels: MODEL_HIDDEN_CHANNELS,
            num_blocks: MODEL_NUM_BLOCKS,
            prompt_slots: MODEL_PROMPT_SLOTS,
        },
        weights.as_deref(),
        config.dtype(),
        device,
    )?;
    Ok(Box::new(ClassifierFreeGuidance::new(model, config.guidance_scale)))
}

/// Runs one generation end to end: pre-flight checks, sampling, artifacts.
///
/// Configuration problems and output-directory collisions are reported
/// before any tensor work starts. The output directory is only created once
/// sampling has succeeded.
pub fn run(config: &RunConfig, device: &Device) -> Result<RunSummary> {
    config.validate().context("invalid run configuration")?;
    let schedule = NoiseSchedule::new(&config.schedule_config()?, config.num_inference_steps)?;

    let time_tag = config.save_dir_now.then(current_time_tag);
    check_output_dir(&config.save_top_dir, &config.tag, time_tag.as_deref())?;

    let channels = config.channels();
    let (height, width) = (config.canvas.height, config.canvas.width);
    let views = config
        .views
        .iter()
        .map(|spec| spec.build(channels, height, width))
        .collect::<crate::error::Result<Vec<Box<dyn View>>>>()?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let z_t = initial_noise(&[channels, height, width], DType::F32, device, &mut rng)?;
    let synchronizer = ViewSynchronizer::new(views, &z_t)?;
    let predictor = build_predictor(config, &schedule, &synchronizer, device)?;
    let conditioning = Conditioning::per_view(&config.view_prompts);

    info!(
        "app={:?} model={:?} views={} canvas={}x{}x{} steps={} seed={}",
        config.app,
        config.model,
        synchronizer.len(),
        channels,
        height,
        width,
        config.num_inference_steps,
        config.seed
    );
    for (i, prompt) in config.prompts.iter().enumerate() {
        info!("prompt[{}]: {}", i, prompt);
    }

    let started = Instant::now();
    let total = schedule.timesteps().len();
    let output = SyncSampler::new(&schedule, &synchronizer)
        .with_sync(config.sync)
        .sample(predictor.as_ref(), &conditioning, z_t, |event| {
            if (event.step_index + 1) % 10 == 0 || event.step_index + 1 == total {
                info!("step {}/{} (t={})", event.step_index + 1, total, event.timestep);
            }
        })?;
    info!("Sampling finished in {:.2?}", started.elapsed());

    let canvas_std = output.canvas.to_dtype(DType::F32)?.flatten_all()?.var(0)?.sqrt()?.to_scalar::<f32>()?;
    info!("canvas std: {:.4}", canvas_std);

    let output_dir = prepare_output_dir(&config.save_top_dir, &config.tag, time_tag.as_deref())?;
    if let Err(e) = save_run_artifacts(&output_dir, config, &output) {
        if let Err(cleanup) = std::fs::remove_dir_all(&output_dir) {
            warn!("Could not remove incomplete output {}: {}", output_dir.display(), cleanup);
        }
        return Err(e.into());
    }
    Ok(RunSummary { output_dir, output })
}
