use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cople_inspection::measurement::{self, Mask};
use cople_inspection::{AnalysisKind, InspectionConfig, InspectionSystem, RoutineState};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "cople-inspection")]
#[command(about = "Coupling inspection station: camera control, defect analysis and multi-angle routines")]
#[command(version)]
#[command(long_about = "Controls the inspection camera (GigE with webcam fallback), runs \
instance segmentation on captured images, measures every detected mask and drives \
multi-angle inspection routines that end in a composite image and a consolidated report.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cople.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the system")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR", help = "Directory for daily rolling log files")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream preview frames until Ctrl+C or SIGTERM (default)
    Preview {
        /// Preview rate; defaults to camera.preview_fps
        #[arg(long)]
        fps: Option<u32>,
    },
    /// Grab one frame and write it to a file
    Capture {
        #[arg(short, long, default_value = "capture.png")]
        output: PathBuf,
    },
    /// Capture and analyse one image
    Analyze {
        #[arg(short, long, value_enum, default_value_t = KindArg::Defects)]
        kind: KindArg,
        /// Millimeters per pixel; overrides measurement.conversion_factor_mm_per_px
        #[arg(long)]
        factor: Option<f64>,
    },
    /// Run one multi-angle inspection routine
    Routine {
        /// Number of angles; defaults to routine.angles
        #[arg(long)]
        angles: Option<u32>,
    },
    /// Measure a grayscale mask image without touching the camera
    Measure {
        mask: PathBuf,
        #[arg(long)]
        factor: Option<f64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Pieces,
    Defects,
}

impl From<KindArg> for AnalysisKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pieces => AnalysisKind::Pieces,
            KindArg::Defects => AnalysisKind::Defects,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting cople-inspection v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match InspectionConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let command = args.command.unwrap_or(Command::Preview { fps: None });

    if let Command::Measure { mask, factor } = &command {
        return measure_file(mask, factor.or(config.measurement.conversion_factor_mm_per_px));
    }

    let mut system = InspectionSystem::new(config).map_err(|e| {
        error!("Failed to create inspection system: {}", e);
        e
    })?;
    system.initialize().await?;
    system.start().await.map_err(|e| {
        error!("Failed to start system: {}", e);
        e
    })?;

    let exit_code = match command {
        Command::Preview { fps } => {
            let fps = fps.unwrap_or(system.config().camera.preview_fps);
            system.camera().start_preview(fps).await?;
            system.run().await.map_err(|e| {
                error!("System error during execution: {}", e);
                e
            })?
        }
        Command::Capture { output } => {
            let outcome = capture_to_file(&system, &output).await;
            let exit_code = system.shutdown().await?;
            outcome?;
            exit_code
        }
        Command::Analyze { kind, factor } => {
            let factor = factor.or(system.conversion_factor());
            let record = system
                .coordinator()
                .analyze_live(kind.into(), system.camera(), factor)
                .await;
            println!("{}", serde_json::to_string_pretty(&record)?);
            let exit_code = system.shutdown().await?;
            if record.error.is_some() {
                1
            } else {
                exit_code
            }
        }
        Command::Routine { angles } => {
            let mut routine_config = system.routines().defaults().clone();
            if let Some(angles) = angles {
                routine_config.angles = angles;
            }
            let outcome = system.routines().run_routine(routine_config).await;
            let exit_code = system.shutdown().await?;
            match outcome {
                Ok(routine) => {
                    println!("{}", serde_json::to_string_pretty(&routine)?);
                    if routine.state == RoutineState::Completed {
                        exit_code
                    } else {
                        1
                    }
                }
                Err(e) => {
                    error!("Routine failed: {}", e);
                    1
                }
            }
        }
        Command::Measure { mask, factor } => {
            measure_file(&mask, factor)?;
            system.shutdown().await?
        }
    };

    info!("cople-inspection exited with code: {}", exit_code);
    std::process::exit(exit_code);
}

async fn capture_to_file(system: &InspectionSystem, output: &Path) -> Result<()> {
    let frame = system.camera().capture().await?;
    frame
        .image
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "✓ Captured {}x{} frame to {}",
        frame.width(),
        frame.height(),
        output.display()
    );
    Ok(())
}

fn measure_file(path: &Path, factor: Option<f64>) -> Result<()> {
    let image = image::open(path)
        .with_context(|| format!("Failed to read mask {}", path.display()))?
        .to_luma8();
    if image.width() == 0 || image.height() == 0 {
        bail!("Mask {} is empty", path.display());
    }
    let mask = Mask::from_gray(&image);
    let measurements = measurement::compute(Some(&mask), factor);
    println!("{}", serde_json::to_string_pretty(&measurements)?);
    Ok(())
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cople_inspection={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "cople-inspection.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# cople-inspection configuration file");
    println!("# Every option with its default value; environment variables such as");
    println!("# COPLE_CAMERA__PREVIEW_FPS override file values");
    println!();
    println!("{}", toml::to_string_pretty(&InspectionConfig::default())?);
    Ok(())
}
