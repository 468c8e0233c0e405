mod commands;
mod error;
mod results;
mod rpc;
mod util;

use commands::{PacerCli, PacerSubcommand};
use error::CliError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() -> miette::Result<()> {
    util::init_tracing();
    let args = PacerCli::parse_args();
    run(args).await?;
    Ok(())
}

async fn run(args: PacerCli) -> Result<(), CliError> {
    match args.command {
        PacerSubcommand::Spam { args } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling outstanding jobs");
                    on_signal.cancel();
                }
            });
            let output = commands::spam(&args, &cancel).await?;
            println!("{}", output.summary);
        }
        PacerSubcommand::Split { args } => commands::split(args)?,
        PacerSubcommand::Report { results } => commands::report(results)?,
    }
    Ok(())
}
