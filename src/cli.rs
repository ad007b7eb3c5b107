use clap::{ArgAction, builder::PossibleValuesParser, value_parser};
use easy_error::{Error, ResultExt};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config_file: String,
    pub config_test: bool,
    pub log_level: String,
}

fn command() -> clap::Command {
    clap::Command::new("hoprelay")
        .version(crate::VERSION)
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Config filename")
                .default_value("config.yaml")
                .value_parser(value_parser!(String))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log")
                .help("Set log level")
                .value_parser(PossibleValuesParser::new(LOG_LEVELS))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("config-check")
                .short('t')
                .long("test")
                .help("Load and check config file then exits")
                .action(ArgAction::SetTrue),
        )
}

fn from_matches(args: &clap::ArgMatches) -> AppArgs {
    let config_file = args
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.yaml")
        .to_string();
    let config_test = args.get_flag("config-check");
    let log_level = args
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info")
        .to_string();
    AppArgs {
        config_file,
        config_test,
        log_level,
    }
}

pub fn parse_args() -> Result<AppArgs, Error> {
    let args = from_matches(&command().get_matches());
    init_logging(&args.log_level)?;
    Ok(args)
}

/// `RUST_LOG` directives take precedence over `log_level`.
pub fn init_logging(log_level: &str) -> Result<(), Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.parse().context("parse log level")?)
        .from_env()
        .context("parse RUST_LOG")?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .context("init logging")
}
