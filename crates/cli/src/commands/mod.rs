mod pacer_subcommand;
pub mod report;
pub mod spam;
pub mod split;

use clap::Parser;

pub use pacer_subcommand::PacerSubcommand;
pub use report::report;
pub use spam::spam;
pub use split::split;

#[derive(Parser, Debug)]
#[command(name = "pacer", version, about = "Rate-controlled load generator for RPC node fleets")]
pub struct PacerCli {
    #[command(subcommand)]
    pub command: PacerSubcommand,
}

impl PacerCli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
