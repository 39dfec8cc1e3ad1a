use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

pub struct CliOptions {
    pub config: PathBuf,
    pub backend: Option<String>,
}

impl From<ArgMatches> for CliOptions {
    fn from(matches: ArgMatches) -> Self {
        CliOptions {
            config: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("caravel.toml")),
            backend: matches.get_one::<String>("backend").cloned(),
        }
    }
}

pub(crate) fn configure_cli() -> CliOptions {
    let matches = Command::new("caravel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("container and pod status reconciliation for the caravel dashboard")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the TOML configuration file")
                .value_name("FILE")
                .num_args(1),
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .help("Force the backend instead of auto-detecting")
                .value_parser(["docker", "kubernetes"])
                .num_args(1),
        )
        .get_matches();
    matches.into()
}
