use std::path::Path;

use tracing::info;

use crate::{error::CliError, results};

/// Reloads a results CSV and prints its summary.
pub fn report(path: impl AsRef<Path>) -> Result<(), CliError> {
    let path = path.as_ref();
    let reports = results::read_results(path)?;
    info!("loaded {} results from {}", reports.len(), path.display());
    println!("{}", results::summarize(&reports));
    Ok(())
}
