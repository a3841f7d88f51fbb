//! Command-line tool for segmented deformable mirrors.
//!
//! Subcommands:
//! - `map`: Print the pupil layout
//! - `check`: Parse and validate a command file without touching hardware
//! - `render`: Print the device-native file a command would produce
//! - `apply`: Apply a command file and hold the shape
//! - `flatten`: Return the mirror to its flat
//! - `poke`: Move each pupil segment away from the flat in turn

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use segmented_dm::formats::device_native::serialize;
use segmented_dm::formats::RawCommand;
use segmented_dm::segment_map::hex::segment_position;
use segmented_dm::{
    validate, Command, DmConfig, DmController, DriverBackend, ExecutableDriver, MockDriver, Ptt,
};
use tracing::info;

/// Segmented DM control tool
#[derive(Parser, Debug)]
#[command(name = "dm_tool")]
#[command(about = "Validate and apply piston-tip-tilt commands to a segmented mirror")]
#[command(version)]
struct Args {
    /// Mirror configuration (JSON)
    #[arg(short, long, global = true, default_value = "dm_config.json")]
    config: PathBuf,

    /// Record driver invocations instead of running the driver executable
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Cmd,
}

/// Source format of a command file.
#[derive(Debug, Clone, Copy, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum InputFormat {
    /// Vendor GUI export
    Gui,
    /// Device-native INI file
    Native,
    /// Simulation array as JSON rows of [piston, tip, tilt]
    Sim,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the pupil layout
    Map,

    /// Parse and validate a command file
    Check {
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = InputFormat::Gui)]
        format: InputFormat,
    },

    /// Print the device-native file for a command
    Render {
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = InputFormat::Gui)]
        format: InputFormat,
    },

    /// Apply a command file
    Apply {
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = InputFormat::Gui)]
        format: InputFormat,

        /// Add the command to the custom flat instead of replacing it
        #[arg(long)]
        relative_to_flat: bool,

        /// Seconds to hold the shape before closing
        #[arg(long, default_value = "0")]
        hold: f64,
    },

    /// Return the mirror to its flat
    Flatten {
        /// Seconds to hold the flat before closing
        #[arg(long, default_value = "0")]
        hold: f64,
    },

    /// Offset each pupil segment from the flat, one at a time
    Poke {
        /// Piston offset in um
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        piston: f64,

        /// Tip offset in mrad
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        tip: f64,

        /// Tilt offset in mrad
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        tilt: f64,

        /// Seconds to hold each poked shape
        #[arg(long, default_value = "1")]
        hold: f64,
    },
}

fn load_command(config: &DmConfig, path: &Path, format: InputFormat) -> Result<Command> {
    let adapters = config.adapters()?;
    let command = match format {
        InputFormat::Gui => adapters.gui_export.load_file(path)?,
        InputFormat::Native => adapters.device_native.load_file(path)?,
        InputFormat::Sim => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let rows: Vec<[f64; 3]> = serde_json::from_str(&json)
                .with_context(|| format!("{} is not a JSON list of 3-element rows", path.display()))?;
            let array = Array2::from(rows);
            adapters.parse(RawCommand::Simulation(array.view()))?
        }
    };
    info!(
        "Loaded {} segments from {} ({format})",
        command.len(),
        path.display()
    );
    Ok(command)
}

fn cmd_map(config: &DmConfig) -> Result<()> {
    let map = config.segment_map()?;
    let geometry = config.simulation.geometry;

    println!(
        "Mirror {} / driver {}: {} of {} segments in pupil",
        config.mirror_serial,
        config.driver_serial,
        map.len(),
        map.total_segments()
    );
    for (segment, channel) in map.iter() {
        let ring = segment_position(segment.0).map_or(0, |hex| hex.ring());
        let status = if map.is_enabled(segment) { "" } else { "  (disabled)" };
        match geometry.and_then(|g| map.segment_center(segment, &g)) {
            Some((x, y)) => println!(
                "  segment {segment:>3}  channel {channel:>3}  ring {ring}  at ({:+.3}, {:+.3}) mm{status}",
                x * 1e3,
                y * 1e3
            ),
            None => println!("  segment {segment:>3}  channel {channel:>3}  ring {ring}{status}"),
        }
    }
    Ok(())
}

fn cmd_check(config: &DmConfig, file: &Path, format: InputFormat) -> Result<()> {
    let command = load_command(config, file, format)?;
    let map = config.segment_map()?;
    validate(command.clone(), &map, &config.limits)?;

    println!("{} is valid: {} segments commanded", file.display(), command.len());
    for (segment, ptt) in command.iter() {
        println!(
            "  segment {segment:>3}: piston {:+.4} um, tip {:+.4} mrad, tilt {:+.4} mrad",
            ptt.piston, ptt.tip, ptt.tilt
        );
    }
    Ok(())
}

fn cmd_render(config: &DmConfig, file: &Path, format: InputFormat) -> Result<()> {
    let command = load_command(config, file, format)?;
    let map = config.segment_map()?;
    let command = validate(command, &map, &config.limits)?;
    let flat = config.load_flat(&map)?;

    print!(
        "{}",
        serialize(&command, &map, &flat, config.unit_params().header())
    );
    Ok(())
}

fn hold(seconds: f64) -> Result<()> {
    if seconds > 0.0 {
        let duration = Duration::try_from_secs_f64(seconds).context("Invalid hold time")?;
        info!("Holding shape for {duration:?}");
        thread::sleep(duration);
    }
    Ok(())
}

fn cmd_apply<D: DriverBackend>(
    config: &DmConfig,
    driver: D,
    command: Command,
    relative_to_flat: bool,
    hold_secs: f64,
) -> Result<()> {
    let controller = DmController::new(config, driver)?;
    controller.with_session(|dm| -> Result<()> {
        if relative_to_flat {
            dm.apply_relative_to_flat(command)?;
        } else {
            dm.apply(command)?;
        }
        info!("Command applied to mirror {}", config.mirror_serial);
        hold(hold_secs)
    })
}

fn cmd_flatten<D: DriverBackend>(config: &DmConfig, driver: D, hold_secs: f64) -> Result<()> {
    let controller = DmController::new(config, driver)?;
    controller.with_session(|dm| -> Result<()> {
        dm.flatten()?;
        info!("Mirror {} flattened", config.mirror_serial);
        hold(hold_secs)
    })
}

fn cmd_poke<D: DriverBackend>(
    config: &DmConfig,
    driver: D,
    offset: Ptt,
    hold_secs: f64,
) -> Result<()> {
    let controller = DmController::new(config, driver)?;
    controller.with_session(|dm| -> Result<()> {
        let poked = dm.poke_each_segment(offset, |segment| -> Result<()> {
            info!(
                "Segment {segment} offset by piston {} um, tip {} mrad, tilt {} mrad",
                offset.piston, offset.tip, offset.tilt
            );
            hold(hold_secs)
        })?;
        info!("Poked {poked} segments of mirror {}", config.mirror_serial);
        Ok(())
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = DmConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    match args.command {
        Cmd::Map => cmd_map(&config),
        Cmd::Check { file, format } => cmd_check(&config, &file, format),
        Cmd::Render { file, format } => cmd_render(&config, &file, format),
        Cmd::Apply {
            file,
            format,
            relative_to_flat,
            hold,
        } => {
            let command = load_command(&config, &file, format)?;
            if args.mock {
                cmd_apply(&config, MockDriver::new(), command, relative_to_flat, hold)
            } else {
                cmd_apply(&config, ExecutableDriver::new(), command, relative_to_flat, hold)
            }
        }
        Cmd::Flatten { hold } => {
            if args.mock {
                cmd_flatten(&config, MockDriver::new(), hold)
            } else {
                cmd_flatten(&config, ExecutableDriver::new(), hold)
            }
        }
        Cmd::Poke {
            piston,
            tip,
            tilt,
            hold,
        } => {
            let offset = Ptt::new(piston, tip, tilt);
            if args.mock {
                cmd_poke(&config, MockDriver::new(), offset, hold)
            } else {
                cmd_poke(&config, ExecutableDriver::new(), offset, hold)
            }
        }
    }
}
