use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use brake_calibrator::config;
use brake_calibrator::link::{Link, SerialLink};
use brake_calibrator::lookup::BrakeLookup;
use brake_calibrator::pipeline::{CalibrationResult, PipelineConfig};
use brake_calibrator::run::{BrakeKind, Geometry};
use brake_calibrator::runtime::{self, AcquireOptions};

#[derive(Parser)]
#[command(name = "brake-calibrator")]
#[command(about = "Record brake ramp experiments and fit torque against twist angle")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the brake through its ramp sequence and save the run
    Acquire {
        #[arg(long, value_enum, default_value = "large")]
        brake: BrakeArg,

        /// Serial port of the rig bridge
        #[arg(short, long, default_value = config::RIG_PORT)]
        port: String,

        #[arg(long, default_value_t = config::RIG_BAUDRATE)]
        baudrate: u32,

        /// Use the simulated rig instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Ramp cycles per motor direction (default: brake preset)
        #[arg(long)]
        repeats: Option<u32>,

        /// Brake command step between ramp levels (default: brake preset)
        #[arg(long)]
        command_interval: Option<u8>,

        /// Seconds per ramp level (default: brake preset)
        #[arg(long)]
        time_interval: Option<f64>,

        /// Peak brake command, capped at the brake's limit
        #[arg(long)]
        max_torque: Option<u8>,

        /// Conical annulus width (in)
        #[arg(long, default_value_t = config::WIDTH_IN)]
        width: f64,

        /// Conical annulus height (in)
        #[arg(long, default_value_t = config::HEIGHT_IN)]
        height: f64,

        /// Conical annulus wall thickness (in)
        #[arg(long, default_value_t = config::WALL_THICKNESS_IN)]
        wall: f64,

        /// Output directory for run files
        #[arg(short, long, default_value = config::EXPERIMENTS_DIR)]
        dir: PathBuf,

        /// Do not publish live samples over zenoh
        #[arg(long)]
        no_publish: bool,
    },

    /// Fit torque against twist angle for recorded runs
    Analyze {
        /// Run files to analyze
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory holding the lookup tables
        #[arg(long, default_value = config::LOOKUP_TABLES_DIR)]
        tables: PathBuf,

        /// Outlier threshold in standard deviations
        #[arg(long, default_value_t = 6.0)]
        sigma: f64,

        /// Smoothing window (odd)
        #[arg(long, default_value_t = 501)]
        window: usize,

        /// Smoothing polynomial order
        #[arg(long, default_value_t = 5)]
        order: usize,

        /// Write results as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build lookup tables from the brake datasheets and write them out
    Lookups {
        #[arg(short, long, default_value = config::LOOKUP_TABLES_DIR)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum BrakeArg {
    Large,
    Small,
}

impl From<BrakeArg> for BrakeKind {
    fn from(arg: BrakeArg) -> Self {
        match arg {
            BrakeArg::Large => BrakeKind::Large,
            BrakeArg::Small => BrakeKind::Small,
        }
    }
}

#[derive(Serialize)]
struct AnalysisRecord<'a> {
    file: String,
    #[serde(flatten)]
    result: &'a CalibrationResult,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), BoxError> {
    match args.command {
        Commands::Acquire {
            brake,
            port,
            baudrate,
            simulate,
            repeats,
            command_interval,
            time_interval,
            max_torque,
            width,
            height,
            wall,
            dir,
            no_publish,
        } => {
            let kind = BrakeKind::from(brake);
            let mut params = config::preset(kind);
            if let Some(repeats) = repeats {
                params.repeats = repeats;
            }
            if let Some(step) = command_interval {
                params.command_interval = step;
            }
            if let Some(seconds) = time_interval {
                params.time_interval = seconds;
            }
            if let Some(max) = max_torque {
                let limit = config::max_torque_command(kind);
                if max > limit {
                    warn!("Max torque command {} exceeds the {} limit, using {}", max, kind.file_name(), limit);
                }
                params.max_torque_command = max.min(limit);
            }

            let mut options = AcquireOptions::new(kind, Geometry::from_inches(width, height, wall), params, dir);
            options.publish = !no_publish;

            let mut link: Box<dyn Link> = if simulate {
                let lookup = BrakeLookup::load_or_build(Path::new(config::LOOKUP_TABLES_DIR), kind)?;
                Box::new(runtime::dry_run_rig(lookup))
            } else {
                Box::new(SerialLink::open_with_baudrate(&port, baudrate)?)
            };

            let (acquisition, path) = runtime::acquire(&mut link, &options).await?;
            println!(
                "{} ({:?}): {} cycles, {} encoder samples at {:.1} Hz",
                path.display(),
                acquisition.summary.termination,
                acquisition.summary.completed_cycles,
                acquisition.summary.encoder_samples,
                acquisition.summary.sample_rate
            );
            Ok(())
        }

        Commands::Analyze {
            files,
            tables,
            sigma,
            window,
            order,
            output,
        } => {
            let pipeline_config = PipelineConfig {
                outlier_sigma: sigma,
                smoothing_window: window,
                smoothing_order: order,
                ..PipelineConfig::default()
            };

            let results = runtime::analyze_files(&files, &tables, pipeline_config);
            let mut records = Vec::new();
            let mut failed = 0;
            for (path, result) in &results {
                match result {
                    Ok(result) => {
                        println!(
                            "{}: m={:.4}, b={:.4} ({} samples)",
                            path.display(),
                            result.regression_slope,
                            result.regression_intercept,
                            result.torque_samples.len()
                        );
                        records.push(AnalysisRecord {
                            file: path.display().to_string(),
                            result,
                        });
                    }
                    Err(e) => {
                        eprintln!("{}", e);
                        failed += 1;
                    }
                }
            }

            if let Some(output) = output {
                std::fs::write(&output, serde_json::to_string_pretty(&records)?)?;
                info!("Wrote {} results to {}", records.len(), output.display());
            }

            if failed > 0 {
                return Err(format!("{} of {} runs failed", failed, results.len()).into());
            }
            Ok(())
        }

        Commands::Lookups { output } => {
            for kind in [BrakeKind::Large, BrakeKind::Small] {
                BrakeLookup::build(kind)?.save(&output, kind)?;
            }
            Ok(())
        }
    }
}
