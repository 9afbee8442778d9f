use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use tomo_xrd::collection::RunOutcome;
use tomo_xrd::hardware::SimulatedBeamline;
use tomo_xrd::logging::{self, LogFormat};
use tomo_xrd::planner::{plan, AxisSnapshot, Sense, Sweep};
use tomo_xrd::scan::ScanRequest;
use tomo_xrd::{AcquisitionApp, Settings};

#[derive(Parser, Debug)]
#[command(name = "tomo_xrd", about = "Rotation-stage and detector acquisition sequencing")]
struct Cli {
    /// TOML configuration file; `TOMOXRD_*` environment variables override it.
    #[arg(long, env = "TOMOXRD_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the motion profile of a rotation scan as JSON.
    Plan {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        /// Angular step; omit for a wide scan.
        #[arg(long)]
        step: Option<f64>,
        #[arg(long, default_value_t = 1.0)]
        exposure: f64,
        #[arg(long, default_value_t = 1000.0)]
        counts_per_degree: f64,
        #[arg(long, default_value_t = 0.5)]
        accel_time: f64,
        /// Motor record direction is reversed.
        #[arg(long)]
        motor_reversed: bool,
        /// Pulse generator counts per step is negative.
        #[arg(long)]
        encoder_reversed: bool,
    },
    /// Run a collection against the simulated beamline and print its events.
    Simulate {
        #[arg(long, default_value_t = 0.01)]
        exposure: f64,
        #[arg(long)]
        start: Option<f64>,
        #[arg(long)]
        end: Option<f64>,
        #[arg(long)]
        step: Option<f64>,
        /// Number of sample positions, 1 mm apart along X.
        #[arg(long, default_value_t = 0)]
        points: u32,
        #[arg(long, default_value = "sim")]
        filename: String,
    },
    /// Print the resolved configuration as TOML.
    DumpConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.application.log_level.clone());
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(&level, format);

    match cli.command {
        Command::Plan {
            start,
            end,
            step,
            exposure,
            counts_per_degree,
            accel_time,
            motor_reversed,
            encoder_reversed,
        } => {
            let sense = |reversed: bool| if reversed { Sense::Negative } else { Sense::Positive };
            let axis = AxisSnapshot {
                counts_per_degree,
                encoder_dir: sense(encoder_reversed),
                motor_dir: sense(motor_reversed),
                accel_time,
            };
            let sweep = Sweep {
                start,
                end,
                step,
                exposure,
            };
            let profile = plan(&sweep, &axis, settings.timing.frame_overhead_s)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Command::Simulate {
            exposure,
            start,
            end,
            step,
            points,
            filename,
        } => {
            let outcome = simulate(settings, exposure, start, end, step, points, filename).await?;
            info!(?outcome, "simulation finished");
        }
        Command::DumpConfig => {
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}

/// Scratch directory for simulated frames, with a trailing separator so file
/// names and step subdirectories append cleanly.
fn simulation_directory() -> String {
    let mut path = std::env::temp_dir()
        .join("tomo_xrd")
        .to_string_lossy()
        .into_owned();
    if !path.ends_with(std::path::MAIN_SEPARATOR) {
        path.push(std::path::MAIN_SEPARATOR);
    }
    path
}

async fn simulate(
    mut settings: Settings,
    exposure: f64,
    start: Option<f64>,
    end: Option<f64>,
    step: Option<f64>,
    points: u32,
    filename: String,
) -> anyhow::Result<RunOutcome> {
    settings.timing.settle_ms = 10;
    settings.timing.poll_interval_ms = 1;
    settings.geometry.abort_settle_ms = 10;
    let filepath = simulation_directory();

    let sim = SimulatedBeamline::new(&settings);
    let app = AcquisitionApp::connect(sim.client(), settings).await?;
    for n in 0..points {
        app.collector()
            .add_point(format!("pos{}", n + 1), Some(f64::from(n)), None, None)?;
    }

    let mut events = app.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "unprintable event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let request = match (start, end) {
        (Some(start), Some(end)) => ScanRequest::rotation(exposure, start, end, step, filename, filepath),
        _ => ScanRequest::still(exposure, filename, filepath),
    };
    let outcome = app.collect(request).await;
    drop(app);
    // Let the printer drain what is already queued.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    printer.abort();
    Ok(outcome?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_path_from_environment() {
        let command = Cli::command();
        let config = command
            .get_arguments()
            .find(|arg| arg.get_id() == "config")
            .unwrap();
        assert_eq!(config.get_env(), Some(std::ffi::OsStr::new("TOMOXRD_CONFIG")));

        let cli = Cli::try_parse_from(["tomo_xrd", "--config", "beamline.toml", "dump-config"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("beamline.toml")));
        assert!(matches!(cli.command, Command::DumpConfig));
    }

    #[test]
    fn test_step_scans_write_inside_simulation_directory() {
        let base = simulation_directory();
        assert!(base.ends_with(std::path::MAIN_SEPARATOR));
        let request = ScanRequest::rotation(0.01, 0.0, 1.0, Some(0.5), "sim", base.clone());
        assert_eq!(request.target_directory(), format!("{}sim", base));
    }
}
