use std::time::Duration;

use pacer_core::{
    fleet::RateLimiterFleet,
    limiter::{RateBudget, DEFAULT_BURST_WINDOW},
};
use url::Url;

use crate::{
    error::{ArgsError, CliError},
    util::bold,
};

#[derive(Clone, Debug, clap::Args)]
pub struct SplitCliArgs {
    /// Aggregate rate (requests per second) to divide.
    #[arg(long, short = 'r', visible_alias = "tps")]
    pub rate: u32,

    /// Node URLs; may be given multiple times.
    #[arg(long = "rpc-url", value_delimiter = ',')]
    pub rpc_urls: Vec<Url>,

    /// Number of nodes, when URLs are not given.
    #[arg(long, short = 'n', conflicts_with = "rpc_urls")]
    pub nodes: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_BURST_WINDOW.as_millis() as u64)]
    pub burst_window_ms: u64,
}

pub fn split(args: SplitCliArgs) -> Result<(), CliError> {
    println!("{}", render(&args)?);
    Ok(())
}

fn render(args: &SplitCliArgs) -> Result<String, CliError> {
    let urls = if args.rpc_urls.is_empty() {
        let count = args.nodes.ok_or(ArgsError::NoRpcUrls)?;
        (0..count).map(|i| format!("node-{i}")).collect()
    } else {
        args.rpc_urls.iter().map(Url::to_string).collect::<Vec<_>>()
    };
    let window = Duration::from_millis(args.burst_window_ms);
    let fleet = RateLimiterFleet::new("rate", &urls, args.rate, window)?;

    let mut out = format!(
        "{} split across {} nodes (burst window {}ms)\n",
        bold(format!("{}/s", args.rate)),
        fleet.node_count(),
        args.burst_window_ms
    );
    out.push_str(&format!(
        "{:<4} {:<40} {:>8} {:>12} {:>10}\n",
        "#", "node", "rate/s", "interval", "max burst"
    ));
    for (i, share) in fleet.per_node_rates().into_iter().enumerate() {
        let budget = RateBudget::new(share, window)?;
        out.push_str(&format!(
            "{:<4} {:<40} {:>8} {:>12} {:>10}\n",
            i,
            fleet.node_url(i).unwrap_or_default(),
            share,
            format!("{:?}", budget.token_interval()),
            budget.max_burst()
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(rate: u32, nodes: usize) -> SplitCliArgs {
        SplitCliArgs {
            rate,
            rpc_urls: vec![],
            nodes: Some(nodes),
            burst_window_ms: 100,
        }
    }

    #[test]
    fn renders_remainder_on_first_nodes() {
        let out = render(&args(10, 3)).unwrap();
        let shares = out
            .lines()
            .skip(2)
            .map(|l| l.split_whitespace().nth(2).unwrap().parse::<u32>().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(shares, vec![4, 3, 3]);
    }

    #[test]
    fn rejects_rates_that_cannot_cover_every_node() {
        assert!(matches!(
            render(&args(2, 3)),
            Err(CliError::Core(pacer_core::Error::Config(_)))
        ));
        assert!(matches!(
            render(&SplitCliArgs {
                nodes: None,
                ..args(10, 1)
            }),
            Err(CliError::Args(ArgsError::NoRpcUrls))
        ));
    }
}
