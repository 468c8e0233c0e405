use std::path::PathBuf;

use clap::Subcommand;

use super::{spam::SpamCliArgs, split::SplitCliArgs};

#[derive(Debug, Subcommand)]
pub enum PacerSubcommand {
    #[command(
        name = "spam",
        long_about = "Send value transfers from each account at a fixed aggregate rate across all \
                      nodes, and confirm them."
    )]
    Spam {
        #[command(flatten)]
        args: Box<SpamCliArgs>,
    },

    #[command(
        name = "split",
        long_about = "Print how an aggregate rate is divided across a set of nodes."
    )]
    Split {
        #[command(flatten)]
        args: SplitCliArgs,
    },

    #[command(
        name = "report",
        long_about = "Summarize a results CSV written by `pacer spam --out`."
    )]
    Report {
        /// Path to the results CSV.
        results: PathBuf,
    },
}
