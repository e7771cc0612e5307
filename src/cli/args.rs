//! CLI argument definitions using clap derive
//!
//! Defines all command-line arguments and subcommands.

use crate::domain::{CurvePoint, FanCurve, FanRequest, SettingRequest};

use clap::{ArgGroup, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// NVIDIA GPU overclocking and fan control
///
/// Reads telemetry without privileges; every hardware write goes through a
/// separate privileged helper that re-validates it.
#[derive(Parser, Debug)]
#[command(name = "nvoc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(group(ArgGroup::new("action").args(["status", "apply_default"])))]
pub struct Cli {
    /// Print current telemetry and applied settings
    #[arg(long)]
    pub status: bool,

    /// Apply the default profile once (for boot-time services)
    #[arg(long)]
    pub apply_default: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "NVOC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Profile directory (overrides the configuration)
    #[arg(long, global = true)]
    pub profiles_dir: Option<PathBuf>,

    /// Target GPU by index (0-based); default is every GPU
    #[arg(long, global = true)]
    pub gpu: Option<u32>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the privileged gateway on stdin/stdout
    ///
    /// Started by `apply` through the escalation command; not meant to be
    /// run by hand.
    Serve,

    /// Apply a profile through the privileged gateway
    Apply(ApplyArgs),

    /// Manage stored profiles
    Profile(ProfileArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Arguments for the apply command
#[derive(Parser, Debug)]
pub struct ApplyArgs {
    /// Profile name (stored or built-in preset)
    pub profile: String,
}

/// Arguments for profile commands
#[derive(Parser, Debug)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommands,
}

/// Profile subcommands
#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// List stored profiles and built-in presets
    List,

    /// Show one profile
    Show {
        name: String,
    },

    /// Create or replace a profile
    Save(SaveArgs),

    /// Delete a stored profile
    Delete {
        name: String,
    },

    /// Apply this profile at boot (`--apply-default`)
    SetDefault {
        name: String,
    },

    /// Stop applying a profile at boot
    ClearDefault,

    /// Write a profile to a file
    Export {
        name: String,
        path: PathBuf,
    },

    /// Store a profile from a file written by `export`
    Import {
        path: PathBuf,

        /// Replace a stored profile of the same name
        #[arg(long)]
        force: bool,
    },
}

/// Fan mode argument
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanModeArg {
    /// Firmware-controlled fans
    Auto,
    /// Fixed duty (needs --fan-duty)
    Manual,
    /// Temperature curve (needs --curve)
    Custom,
}

/// Arguments for `profile save`
#[derive(Parser, Debug)]
pub struct SaveArgs {
    /// Profile name
    pub name: String,

    /// Free-form description
    #[arg(short, long, default_value = "")]
    pub description: String,

    /// Power limit in watts
    #[arg(long, allow_negative_numbers = true)]
    pub power_limit: Option<i32>,

    /// Core clock offset in MHz
    #[arg(long, allow_negative_numbers = true)]
    pub core_offset: Option<i32>,

    /// Memory clock offset in MHz
    #[arg(long, allow_negative_numbers = true)]
    pub mem_offset: Option<i32>,

    /// Fan mode
    #[arg(long, value_enum)]
    pub fan: Option<FanModeArg>,

    /// Fan duty percentage for manual mode
    #[arg(long, allow_negative_numbers = true)]
    pub fan_duty: Option<i32>,

    /// Fan curve points for custom mode (format: TEMP:DUTY, e.g., 60:50)
    #[arg(long = "curve", value_name = "TEMP:DUTY", value_parser = parse_curve_point)]
    pub curve: Vec<CurvePoint>,

    /// Take the settings from the GPU selected with --gpu (default 0)
    #[arg(long, conflicts_with_all = [
        "power_limit", "core_offset", "mem_offset", "fan", "fan_duty", "curve",
    ])]
    pub from_current: bool,
}

impl SaveArgs {
    /// Build the request these arguments describe
    ///
    /// Only the argument syntax is checked here; values are validated when
    /// the profile is saved.
    pub fn to_request(&self) -> Result<SettingRequest, String> {
        let fan = match self.fan {
            None if self.fan_duty.is_some() || !self.curve.is_empty() => {
                return Err("--fan-duty and --curve need --fan".to_string())
            }
            None => None,
            Some(FanModeArg::Auto) => Some(FanRequest::Auto),
            Some(FanModeArg::Manual) => Some(FanRequest::Manual {
                duty_percent: self.fan_duty,
            }),
            Some(FanModeArg::Custom) => Some(FanRequest::Custom {
                curve: (!self.curve.is_empty()).then(|| FanCurve::from_points(self.curve.clone())),
            }),
        };

        Ok(SettingRequest {
            power_limit_watts: self.power_limit,
            core_clock_offset_mhz: self.core_offset,
            mem_clock_offset_mhz: self.mem_offset,
            fan,
        })
    }
}

/// Parse a `TEMP:DUTY` curve point
pub fn parse_curve_point(pair: &str) -> Result<CurvePoint, String> {
    let (temp, duty) = pair.split_once(':').ok_or_else(|| {
        format!("Invalid curve point '{}'. Expected TEMP:DUTY (e.g., 60:50)", pair)
    })?;

    let temp: i32 = temp
        .trim()
        .parse()
        .map_err(|_| format!("Invalid temperature in '{}': not a number", pair))?;
    let duty: i32 = duty
        .trim()
        .parse()
        .map_err(|_| format!("Invalid duty in '{}': not a number", pair))?;

    Ok(CurvePoint::new(temp, duty))
}

/// Output format
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for machine parsing
    Json,
    /// Compact single-line format
    Compact,
}

/// Generate shell completions and print to stdout
pub fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}
