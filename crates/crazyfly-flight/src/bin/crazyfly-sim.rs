//! Fly the scripted mission in closed-loop simulation and print a summary

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use crazyfly_core::estimation::SensorSource;
use crazyfly_core::simulation::Dropout;
use crazyfly_core::FaultKind;
use crazyfly_flight::{FlightConfig, QpBackend, Session};

#[derive(Parser, Debug)]
#[command(name = "crazyfly-sim")]
#[command(about = "Closed-loop quadrotor estimation and control simulation")]
#[command(version)]
struct Args {
    /// TOML configuration; defaults are used for anything missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated duration [s]
    #[arg(short, long)]
    duration: Option<f64>,

    /// Noise seed
    #[arg(long)]
    seed: Option<u64>,

    /// Start of a motion-capture dropout [s]
    #[arg(long, requires = "dropout_length")]
    dropout_start: Option<f64>,

    /// Length of the motion-capture dropout [s]
    #[arg(long, requires = "dropout_start")]
    dropout_length: Option<f64>,

    /// Solve the MPC problem with OSQP (needs the `osqp` feature)
    #[arg(long)]
    osqp: bool,

    /// Log per-tick details
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .try_init()
        .context("failed to install logger")?;

    let mut config = match &args.config {
        Some(path) => FlightConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FlightConfig::default(),
    };
    if let Some(duration) = args.duration {
        config.sim.duration = duration;
    }
    if let Some(seed) = args.seed {
        config.sim.seed = seed;
    }
    if let (Some(start), Some(length)) = (args.dropout_start, args.dropout_length) {
        config.sim.dropouts.push(Dropout {
            source: SensorSource::MotionCapture,
            start,
            end: start + length,
        });
    }
    if args.osqp {
        config.mpc.backend = QpBackend::Osqp;
    }

    let mut session = Session::new(config).context("invalid configuration")?;
    let summary = session.run();

    info!("{} ticks over {:.2} s", summary.ticks, summary.duration);
    info!(
        "final position [{:.3}, {:.3}, {:.3}] m",
        summary.final_position.x, summary.final_position.y, summary.final_position.z
    );
    if let Some(rms) = summary.tracking_rms {
        info!("circle tracking RMS error {:.3} m", rms);
    }
    info!(
        "safe-command ticks {}, estimator switches {}, MPC failures {}",
        summary.safe_ticks, summary.estimator_switches, summary.mpc_failures
    );
    for kind in [
        FaultKind::DivergenceWarning,
        FaultKind::StaleMeasurement,
        FaultKind::OutlierRejected,
        FaultKind::ControlFault,
        FaultKind::AdaptiveSaturation,
        FaultKind::NoFixAvailable,
    ] {
        let count = summary.fault_count(kind);
        if count > 0 {
            info!("{:?}: {}", kind, count);
        }
    }
    let mut controllers: Vec<_> = summary.controller_ticks.iter().collect();
    controllers.sort_by_key(|(_, ticks)| std::cmp::Reverse(**ticks));
    for (controller, ticks) in controllers {
        info!("{:?}: {} ticks", controller, ticks);
    }
    Ok(())
}
