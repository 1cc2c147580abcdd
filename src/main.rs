use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info};

use patch_table::{
    DatasetConfig, DatasetResult, DecodeErrorPolicy, ElementType, Interpolation, PatchShape,
    Pipeline, ProgressBarSink, RunSummary,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Build paired img/label patch tables for restoration training")]
struct Args {
    /// Directory holding the full resolution images.
    #[arg(long)]
    source_dir: PathBuf,
    /// Wildcard pattern matched inside the source directory.
    #[arg(long, default_value = "*.jpg")]
    pattern: String,
    /// Base name of the output stores: {name}_{phase}.pytable
    #[arg(long)]
    name: String,
    #[arg(long)]
    output_dir: PathBuf,
    /// HxW or HxWxC, e.g. 64x64x3
    #[arg(long)]
    patch_shape: PatchShape,
    #[arg(long)]
    stride: u32,
    #[arg(long, default_value = "bicubic")]
    interp: Interpolation,
    /// Downsample factor applied before upsampling back, in (0, 1].
    #[arg(long, default_value_t = 0.5)]
    resize: f64,
    #[arg(long, default_value = "u8")]
    dtype: ElementType,
    #[arg(long, default_value_t = 0.1)]
    val_fraction: f64,
    /// Seed for the train/val split. Random (and logged) when omitted.
    #[arg(long)]
    seed: Option<u64>,
    /// Decode workers; 0 uses every core.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Log and skip files that fail to decode instead of aborting.
    #[arg(long)]
    skip_unreadable: bool,
}

fn main() -> ExitCode {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    let args = Args::parse();
    match run(args) {
        Ok(summary) => {
            for phase in &summary.phases {
                info!(
                    "{}: {} rows from {} files -> {}",
                    phase.phase,
                    phase.rows,
                    phase.files,
                    phase.path.display()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> DatasetResult<RunSummary> {
    let mut config = DatasetConfig::new(
        args.source_dir,
        args.pattern,
        args.name,
        args.output_dir,
        args.patch_shape,
        args.stride,
    );
    config.interpolation = args.interp;
    config.resize_factor = args.resize;
    config.element_type = args.dtype;
    config.validation_fraction = args.val_fraction;
    config.seed = args.seed;
    config.workers = if args.workers == 0 { num_cpus::get() } else { args.workers };
    if args.skip_unreadable {
        config.decode_errors = DecodeErrorPolicy::Skip;
    }

    let mut pipeline = Pipeline::new(config)?;
    pipeline.run(&ProgressBarSink::new())
}
