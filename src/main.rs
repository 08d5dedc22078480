// src/main.rs - Command line driver for the wave controller
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use wave_control::config::{self, Config};
use wave_control::hardware::select_channel;
use wave_control::motion::{AxisId, ControlError, MotionController, RunMode};
use wave_control::notify::TracingSink;
use wave_control::storage::{JsonStore, PresetStore, TelemetryStore};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "wave-control", about = "Multi-axis linear motor control for the wave tank.")]
struct Cli {
    /// Path to a TOML config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `wave_control=debug`
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Activate axes, home them and run one cycle (default)
    Cycle {
        /// Axes to drive
        #[arg(short, long, value_delimiter = ',', default_values_t = [0u8, 1, 2])]
        axes: Vec<u8>,
        #[arg(short, long, value_enum, default_value_t = Mode::Single)]
        mode: Mode,
        /// Seconds a continuous run is left going before it is stopped
        #[arg(long, default_value_t = 10)]
        run_secs: u64,
        /// Record telemetry during continuous and curve runs
        #[arg(long)]
        telemetry: bool,
        /// Apply this stored preset to the set before preparing
        #[arg(long)]
        preset: Option<String>,
    },
    /// Turn every motor off and return to the initial state
    Reset,
    /// List stored telemetry runs
    Runs,
    /// List stored presets
    Presets,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Single,
    Continuous,
    Curve,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => RunMode::SingleStroke,
            Mode::Continuous => RunMode::Continuous,
            Mode::Curve => RunMode::Curve,
        }
    }
}

async fn join(handle: JoinHandle<Result<(), ControlError>>) -> Result<(), ControlError> {
    handle.await.map_err(|e| ControlError::Task(e.to_string()))?
}

async fn cycle(
    controller: &MotionController,
    presets: &JsonStore,
    axes: &[u8],
    mode: RunMode,
    run_time: Duration,
    preset: Option<&str>,
) -> Result<(), BoxError> {
    let axes = axes
        .iter()
        .map(|id| AxisId::new(*id))
        .collect::<Result<Vec<_>, _>>()?;

    controller.activate_axes(&axes).await?;
    let set = controller.confirm_set().await?;
    for line in controller.set_summary().await {
        tracing::info!("{}", line);
    }

    if let Some(name) = preset {
        let preset = presets.load_preset(name).await?;
        controller.apply_preset(&preset, &[set]).await?;
    }

    join(controller.prepare().await?).await?;

    let run = controller.start(mode).await?;
    if mode == RunMode::Continuous {
        tokio::time::sleep(run_time).await;
        let outcome = controller.stop().await?;
        tracing::info!("Stop: {:?}", outcome);
    }
    join(run).await?;

    controller.motor_off().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting wave-control {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(&path.to_string_lossy())?
        }
        None => Config::default(),
    };

    let store = Arc::new(JsonStore::new(config.storage.directory.clone()));

    match cli.command {
        Some(Commands::Runs) => {
            for run in store.list_runs().await? {
                println!(
                    "{}  {}  {} samples every {}s over {}s{}",
                    run.timestamp,
                    run.id,
                    run.sample_count,
                    run.interval,
                    run.duration,
                    if run.completed { "" } else { " (stopped early)" }
                );
            }
            return Ok(());
        }
        Some(Commands::Presets) => {
            for name in store.list_presets().await? {
                println!("{}", name);
            }
            return Ok(());
        }
        _ => {}
    }

    let channel = select_channel(&config).await;
    let controller = MotionController::new(
        config,
        channel,
        Arc::new(TracingSink),
        Some(store.clone() as Arc<dyn TelemetryStore>),
    );

    match cli.command {
        Some(Commands::Reset) => controller.full_reset().await?,
        Some(Commands::Cycle {
            axes,
            mode,
            run_secs,
            telemetry,
            preset,
        }) => {
            if telemetry {
                let mut settings = controller.status().await.telemetry;
                settings.enabled = true;
                controller.set_telemetry(settings).await?;
            }
            cycle(
                &controller,
                &store,
                &axes,
                mode.into(),
                Duration::from_secs(run_secs),
                preset.as_deref(),
            )
            .await?;
        }
        _ => {
            cycle(&controller, &store, &[0, 1, 2], RunMode::SingleStroke, Duration::ZERO, None).await?;
        }
    }

    tracing::info!("Done ({})", controller.provenance());
    Ok(())
}
