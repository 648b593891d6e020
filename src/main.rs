use anyhow::{Context, Result};
use clap::Parser;
use perfrelay::{
    AgentIdentity, Config, DEFAULT_CONFIG_FILE, InterruptCoordinator, PerfCli, Session,
    connect_agent,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli_logger;

use cli_logger::CliLogger;

#[derive(Debug, Parser)]
#[command(
    name = "perfrelay",
    about = "Profile a program with perf and relay the per-symbol breakdown to telemetry",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Config file (defaults to ./perfrelay.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the session summary as JSON.
    #[arg(long)]
    json: bool,

    license_key: String,

    /// Record options, then the program to profile and its arguments.
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "ARGS"
    )]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let argv: Vec<OsString> = std::env::args_os().collect();
    let no_color = !std::io::stdout().is_terminal();

    if wants_help(&argv) {
        CliLogger::new(false, no_color).print_usage();
        return ExitCode::from(1);
    }
    let cli = match Cli::try_parse_from(&argv) {
        Ok(cli) => cli,
        Err(err) => {
            let logger = CliLogger::new(false, no_color);
            logger.print_error(err.to_string().trim_end());
            logger.print_usage();
            return ExitCode::from(1);
        }
    };

    init_tracing();
    let logger = CliLogger::new(cli.json, no_color);
    if let Err(err) = run(cli, &logger) {
        logger.print_error(&format!("{err:#}"));
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli, logger: &CliLogger) -> Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Config::load_optional(&config_path);

    let identity = AgentIdentity::new(cli.license_key, config.app_name.clone());
    let mut agent =
        connect_agent(&config, identity).context("failed to initialise the telemetry agent")?;
    let interrupts =
        InterruptCoordinator::install().context("failed to install the SIGINT handler")?;
    let mut profiler = PerfCli::new(&config.profiler);

    let report = Session::new(&config, agent.as_mut(), &mut profiler, interrupts.flag())
        .run(&cli.command);
    drop(interrupts);

    logger.print_session_report(&report)
}

/// `-h`/`--help` where the license key would go, after any leading options.
fn wants_help(argv: &[OsString]) -> bool {
    let mut rest = argv.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.to_str() {
            Some("-h" | "--help") => return true,
            Some("--config") => {
                rest.next();
            }
            Some(opt) if opt.starts_with("--config=") || opt == "--json" => {}
            _ => return false,
        }
    }
    false
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
