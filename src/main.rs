use clap::Parser;
use multiview_sync::config::{self, AppKind, ModelKind, RunConfig};
use multiview_sync::pipeline;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "multiview-sync: multi-view consistent image generation by synchronized diffusion sampling",
    after_help = "EXAMPLES:
    # Wide image
    cargo run --release -- --app wide_image --prompt \"A mountainous region during golden hour\" --tag wide_image --save-dir-now

    # Ambiguous image (identity view + 90 degree rotation)
    cargo run --release -- --app ambiguous_image --prompts 'an oil painting of a cat' 'an oil painting of a truck' --save-dir-now

    # Check the pipeline without model weights
    cargo run --release -- --app ambiguous_image --dry-run --steps 10 --save-dir-now"
)]
struct Args {
    /// Application to run
    #[arg(long, value_enum)]
    app: AppKind,

    /// Diffusion model (default: deepfloyd for ambiguous_image, sd for wide_image)
    #[arg(long, value_enum)]
    model: Option<ModelKind>,

    /// Prompt shared by every view
    #[arg(long, conflicts_with = "prompts")]
    prompt: Option<String>,

    /// One prompt per view group, assigned to views round-robin
    #[arg(long, num_args = 1..)]
    prompts: Vec<String>,

    /// Run configuration JSON; command line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// diffusers scheduler_config.json to build the noise schedule from
    #[arg(long)]
    scheduler_config: Option<PathBuf>,

    /// Epsilon model checkpoint (.safetensors). Defaults to $MULTIVIEW_SYNC_WEIGHTS.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Output sub-directory name
    #[arg(long)]
    tag: Option<String>,

    /// Top-level output directory
    #[arg(long)]
    save_top_dir: Option<PathBuf>,

    /// Write into a timestamped directory below the tag to avoid collisions
    #[arg(long)]
    save_dir_now: bool,

    /// Number of DDIM steps
    #[arg(long)]
    steps: Option<usize>,

    /// Random seed for the initial canvas noise
    #[arg(long)]
    seed: Option<u64>,

    /// Classifier-free guidance scale (<= 1 disables guidance)
    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Denoise every view independently (no synchronization)
    #[arg(long)]
    no_sync: bool,

    /// Run the noise predictor in f16
    #[arg(long)]
    half: bool,

    /// Use an oracle predictor with a reference canvas instead of a model
    #[arg(long)]
    dry_run: bool,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

fn resolve_config(args: &Args) -> anyhow::Result<RunConfig> {
    let mut run_config = match &args.config {
        Some(path) => {
            let loaded = RunConfig::from_json_file(path)?;
            if loaded.app != args.app {
                anyhow::bail!(
                    "{} is a {:?} configuration but --app {:?} was given",
                    path.display(),
                    loaded.app,
                    args.app
                );
            }
            loaded
        }
        None => RunConfig::for_app(args.app, args.model),
    };

    if let Some(model) = args.model {
        run_config.model = model;
    }
    if let Some(prompt) = &args.prompt {
        run_config.set_prompts(vec![prompt.clone()]);
    } else if !args.prompts.is_empty() {
        run_config.set_prompts(args.prompts.clone());
    }
    if let Some(path) = &args.scheduler_config {
        run_config.scheduler_config = Some(path.clone());
    }
    if let Some(path) = &args.weights {
        run_config.weights = Some(path.clone());
    }
    if let Some(tag) = &args.tag {
        run_config.tag = tag.clone();
    }
    if let Some(dir) = &args.save_top_dir {
        run_config.save_top_dir = dir.clone();
    }
    if let Some(steps) = args.steps {
        run_config.num_inference_steps = steps;
    }
    if let Some(seed) = args.seed {
        run_config.seed = seed;
    }
    if let Some(scale) = args.guidance_scale {
        run_config.guidance_scale = scale;
    }
    run_config.save_dir_now |= args.save_dir_now;
    run_config.sync &= !args.no_sync;
    run_config.half |= args.half;
    run_config.dry_run |= args.dry_run;
    Ok(run_config)
}

fn main() {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multiview_sync=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    config::init_cpu_parallelism();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!("--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --cuda");
        std::process::exit(2);
    }

    let run_config = match resolve_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration failed: {:#}", e);
            std::process::exit(2);
        }
    };

    let device = config::get_device(args.cuda);
    match pipeline::run(&run_config, &device) {
        Ok(summary) => info!("Generation completed. Results in {}", summary.output_dir.display()),
        Err(e) => {
            error!("Generation failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
