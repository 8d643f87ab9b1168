use crate::build_info;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Continuous block indexer daemon",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[clap(long)]
    /// Disable the tip-following collector
    pub no_collector: bool,

    #[clap(long)]
    /// Disable periodic gap detection and repair
    pub no_gap_repair: bool,

    #[clap(long = "metrics-bind", default_value = "0.0.0.0:3000")]
    /// Socket address for the health/metrics server
    pub metrics_bind: String,

    #[clap(long = "log-level", default_value = "info")]
    pub log_level: String,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
