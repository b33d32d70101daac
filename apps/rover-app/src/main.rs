//! Rover MPC simulation CLI.
//!
//! Provides two modes of operation:
//! - `run`: Drive the control loop headless for N ticks and print statistics
//! - `info`: Print crate versions and the resolved configuration

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rover_core::config::{ConstraintMode, FailurePolicy, RoverConfig, StalePolicy};
use rover_core::error::RoverError;
use rover_sim::{ControlLoop, TickOutcome};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Nonlinear MPC for a differential-drive rover.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop headless and print statistics.
    Run {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of ticks (overrides `sim.ticks`).
        #[arg(short = 'n', long)]
        ticks: Option<u32>,

        /// Dynamics defect formulation.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// What to do when the optimizer fails.
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Solve on a background worker thread.
        #[arg(long)]
        async_solve: bool,

        /// What a tick does when the background solve is still running.
        #[arg(long, value_enum)]
        stale: Option<StaleArg>,

        /// Seed each solve with the previous solution.
        #[arg(long)]
        warm_start: bool,

        /// Print the final world snapshot as TOML.
        #[arg(long)]
        snapshot: bool,
    },

    /// Print crate information and the resolved configuration.
    Info {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Dms,
    Coll,
}

impl From<ModeArg> for ConstraintMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Dms => Self::Dms,
            ModeArg::Coll => Self::Coll,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Fatal,
    HoldLast,
    SafeStop,
    RetryRelaxed,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Fatal => Self::Fatal,
            PolicyArg::HoldLast => Self::HoldLast,
            PolicyArg::SafeStop => Self::SafeStop,
            PolicyArg::RetryRelaxed => Self::RetryRelaxed,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StaleArg {
    Block,
    Drop,
    HoldLast,
}

impl From<StaleArg> for StalePolicy {
    fn from(arg: StaleArg) -> Self {
        match arg {
            StaleArg::Block => Self::Block,
            StaleArg::Drop => Self::Drop,
            StaleArg::HoldLast => Self::HoldLast,
        }
    }
}

/// Overrides collected from `run` flags.
struct RunArgs {
    ticks: Option<u32>,
    mode: Option<ModeArg>,
    policy: Option<PolicyArg>,
    async_solve: bool,
    stale: Option<StaleArg>,
    warm_start: bool,
    snapshot: bool,
}

// ---------------------------------------------------------------------------
// Mode implementations
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<RoverConfig, RoverError> {
    match path {
        Some(path) => Ok(RoverConfig::from_file(path)?),
        None => Ok(RoverConfig::default()),
    }
}

fn run(config_path: Option<&Path>, args: &RunArgs) -> Result<(), RoverError> {
    let mut config = load_config(config_path)?;
    if let Some(mode) = args.mode {
        config.controller.mode = mode.into();
    }
    if let Some(policy) = args.policy {
        config.sim.failure_policy = policy.into();
    }
    if let Some(stale) = args.stale {
        config.sim.stale_policy = stale.into();
    }
    config.sim.async_solve |= args.async_solve;
    config.controller.warm_start |= args.warm_start;
    let ticks = args.ticks.unwrap_or(config.sim.ticks);

    let mut control = ControlLoop::new(&config)?;
    info!(
        ticks,
        mode = ?config.controller.mode,
        horizon = config.controller.horizon,
        "starting run"
    );

    for _ in 0..ticks {
        if let TickOutcome::Collision { obstacle } = control.tick()? {
            info!(tick = control.tick_count(), %obstacle, "collision");
        }
    }

    let stats = control.stats();
    let pose = control.robot().state();
    println!(
        "ticks={}, solves={}, failures={}, fallbacks={}, collisions={}, stale={}",
        stats.ticks, stats.solves, stats.failures, stats.fallbacks, stats.collisions, stats.stale_ticks
    );
    if let Some(mean) = stats.mean_solve_time_us() {
        println!(
            "solve time: mean={mean:.0}us, max={}us, iterations={}",
            stats.max_solve_time_us, stats.total_iterations
        );
    }
    println!("final pose: x={:.2}, y={:.2}, theta={:.3}", pose.x, pose.y, pose.z);

    if args.snapshot {
        match toml::to_string_pretty(&control.snapshot()) {
            Ok(text) => println!("\n{text}"),
            Err(e) => eprintln!("failed to serialize snapshot: {e}"),
        }
    }
    Ok(())
}

fn run_info(config_path: Option<&Path>) -> Result<(), RoverError> {
    let config = load_config(config_path)?;
    println!("rover v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("crates:");
    println!("  rover-core  {}", env!("CARGO_PKG_VERSION"));
    println!("  rover-mpc   {}", env!("CARGO_PKG_VERSION"));
    println!("  rover-sim   {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("controller:");
    println!("  mode       {:?}", config.controller.mode);
    println!("  solver     {}", config.controller.solver);
    println!("  horizon    {}", config.controller.horizon);
    println!("  dt         {}", config.controller.dt);
    println!("sim:");
    println!("  screen     {}x{}", config.sim.screen_width, config.sim.screen_height);
    println!("  robot_dt   {}", config.sim.robot_dt);
    println!("  policy     {:?}", config.sim.failure_policy);
    println!("  obstacles  {}", config.environment.obstacles.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run {
            config,
            ticks,
            mode,
            policy,
            async_solve,
            stale,
            warm_start,
            snapshot,
        }) => run(
            config.as_deref(),
            &RunArgs {
                ticks,
                mode,
                policy,
                async_solve,
                stale,
                warm_start,
                snapshot,
            },
        ),
        Some(Commands::Info { config }) => run_info(config.as_deref()),
        None => run(
            None,
            &RunArgs {
                ticks: None,
                mode: None,
                policy: None,
                async_solve: false,
                stale: None,
                warm_start: false,
                snapshot: false,
            },
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
