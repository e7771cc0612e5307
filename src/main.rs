//! nvoc - privilege-separated NVIDIA GPU overclocking
//!
//! Reads telemetry and manages profiles as the calling user; every
//! hardware write goes through the privileged `serve` helper.

use clap::{CommandFactory, Parser};
use nvoc::cli::args::{generate_completions, Cli, Commands};
use nvoc::commands::{run_apply, run_apply_default, run_profile, run_serve, run_status};
use nvoc::config::{Config, ConfigBuilder};
use nvoc::error::{AppError, IpcError, NvmlError};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Set log level based on verbose flag
    if cli.verbose {
        log::set_max_level(log::LevelFilter::Debug);
    }

    // Run the appropriate command
    let result = run(&cli);

    if let Err(e) = result {
        log::error!("{}", e);
        print_error(&e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<(Config, Option<std::path::PathBuf>), AppError> {
    let builder = ConfigBuilder::new()
        .with_file(cli.config.as_deref())?
        .with_verbose(cli.verbose.then_some(true))
        .with_profiles_dir(cli.profiles_dir.clone());
    let source = builder.source().map(|p| p.to_path_buf());
    let config = builder.build()?;

    if config.general.verbose {
        log::set_max_level(log::LevelFilter::Debug);
    }
    if let Some(path) = &source {
        log::debug!("Loaded configuration from {}", path.display());
    }
    Ok((config, source))
}

fn run(cli: &Cli) -> Result<(), AppError> {
    if cli.status {
        return run_status(cli.format, cli.gpu);
    }

    if let Some(Commands::Completions { shell }) = &cli.command {
        generate_completions(*shell);
        return Ok(());
    }

    let (config, source) = load_config(cli)?;

    if cli.apply_default {
        return run_apply_default(&config, cli.format, cli.gpu);
    }

    match &cli.command {
        Some(Commands::Serve) => run_serve(&config),

        Some(Commands::Apply(args)) => {
            run_apply(args, &config, source.as_deref(), cli.format, cli.gpu)
        }

        Some(Commands::Profile(args)) => run_profile(args, &config, cli.format, cli.gpu),

        Some(Commands::Completions { .. }) => Ok(()),

        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn print_error(err: &AppError) {
    eprintln!("Error: {}", err);

    // Print helpful hints for common errors
    match err {
        AppError::Nvml(NvmlError::LibraryNotFound) => {
            eprintln!();
            eprintln!("Hint: Make sure the NVIDIA driver is installed.");
            eprintln!("      On Linux, install the nvidia-utils package.");
        }
        AppError::Nvml(NvmlError::InsufficientPermissions(_)) => {
            eprintln!();
            eprintln!("Hint: Hardware writes go through `nvoc apply`, which asks for");
            eprintln!("      authentication. `--apply-default` must run as root.");
        }
        AppError::Ipc(IpcError::AuthenticationFailed) => {
            eprintln!();
            eprintln!("Hint: Authentication was cancelled; no settings were changed.");
        }
        AppError::Ipc(IpcError::Spawn { .. }) => {
            eprintln!();
            eprintln!("Hint: Set gateway.escalation_command in the configuration file");
            eprintln!("      (empty runs the helper without escalation).");
        }
        AppError::NoGpusFound => {
            eprintln!();
            eprintln!("Hint: Make sure you have an NVIDIA GPU installed.");
            eprintln!("      Check 'nvidia-smi' for GPU detection.");
        }
        _ => {}
    }
}
