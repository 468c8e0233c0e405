use std::{path::PathBuf, sync::Arc, time::Duration};

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use pacer_core::{
    mock::{MockChain, MockSigner},
    AccountLane, Engine, EngineConfig, LaneOp, NodeAssignment, NodeClient, PayloadSigner,
    RunOutput,
};
use prometheus::{Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::{
    error::{ArgsError, CliError},
    results,
    rpc::{account_id, AlloyNodeClient, AlloySigner},
    util::{get_signers_with_defaults, read_keys_file},
};

const MOCK_NODES: usize = 3;
const MOCK_INCLUSION_DELAY: Duration = Duration::from_millis(200);
const MOCK_SUBMIT_LATENCY: Duration = Duration::from_millis(5);
const MOCK_SUBMIT_JITTER: Duration = Duration::from_millis(15);

#[derive(Clone, Debug, clap::Args)]
pub struct SpamCliArgs {
    /// Node URL; may be given multiple times (up to 13 nodes).
    #[arg(
        env = "PACER_RPC_URL",
        long = "rpc-url",
        short = 'r',
        value_delimiter = ',',
        long_help = "JSON-RPC endpoint of a node to drive. Repeat the flag (or separate with \
                     commas) to spread load across several nodes."
    )]
    pub rpc_urls: Vec<Url>,

    /// TOML file with engine settings; flags override it.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Aggregate submissions per second across all nodes.
    #[arg(long, visible_alias = "tps")]
    pub write_rate: Option<u32>,

    /// Aggregate receipt and nonce lookups per second across all nodes.
    #[arg(long)]
    pub read_rate: Option<u32>,

    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    #[arg(long)]
    pub per_node_cap: Option<usize>,

    #[arg(long, value_parser = clap::value_parser!(NodeAssignment))]
    pub assignment: Option<NodeAssignment>,

    #[arg(long)]
    pub confirm_timeout_ms: Option<u64>,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub burst_window_ms: Option<u64>,

    #[arg(long)]
    pub submit_timeout_ms: Option<u64>,

    /// Private key(s) of the sending accounts.
    #[arg(
        env = "PACER_PRIVATE_KEY",
        long = "private-key",
        short = 'p',
        long_help = "Private key of a sending account. Flag may be specified multiple times. \
                     Anvil's dev keys are used when no key is given."
    )]
    pub private_keys: Vec<String>,

    /// CSV file with a `private_key` column.
    #[arg(long, conflicts_with = "private_keys")]
    pub keys_file: Option<PathBuf>,

    /// Recipient of every transfer; each account pays itself by default.
    #[arg(long)]
    pub to: Option<Address>,

    #[arg(long, default_value_t = 1)]
    pub amount_wei: u128,

    /// Transfers sent by each account, in nonce order.
    #[arg(long, short = 'n', default_value_t = 10)]
    pub txs_per_account: u64,

    /// Adds (gas_price * percent) / 100 to the node's suggested gas price.
    #[arg(long, short = 'g', default_value_t = 0)]
    pub gas_price_percent_add: u16,

    /// Write per-job results to this CSV file.
    #[arg(long, short = 'o')]
    pub out: Option<PathBuf>,

    /// Write the latency histograms in Prometheus text format to this file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Drive in-process mock nodes instead of real endpoints.
    #[arg(long)]
    pub mock: bool,
}

impl SpamCliArgs {
    /// Defaults, then the config file, then flags.
    pub fn engine_config(&self) -> Result<EngineConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if !self.rpc_urls.is_empty() {
            config.node_urls = self.rpc_urls.iter().map(Url::to_string).collect();
        }
        if config.node_urls.is_empty() && self.mock {
            config.node_urls = (0..MOCK_NODES)
                .map(|i| format!("http://mock-{i}.local:8545"))
                .collect();
        }
        if config.node_urls.is_empty() {
            return Err(ArgsError::NoRpcUrls.into());
        }

        let ms = Duration::from_millis;
        if let Some(rate) = self.write_rate {
            config.write_rate = rate;
        }
        if let Some(rate) = self.read_rate {
            config.read_rate = rate;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(cap) = self.per_node_cap {
            config.per_node_cap = cap;
        }
        if let Some(assignment) = self.assignment {
            config.assignment = assignment;
        }
        if let Some(v) = self.confirm_timeout_ms {
            config.confirmation_timeout = ms(v);
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval = ms(v);
        }
        if let Some(v) = self.burst_window_ms {
            config.burst_window = ms(v);
        }
        if let Some(v) = self.submit_timeout_ms {
            config.submit_timeout = ms(v);
        }
        config.validate()?;
        Ok(config)
    }

    fn signers(&self) -> Result<Vec<PrivateKeySigner>, CliError> {
        match &self.keys_file {
            Some(path) => get_signers_with_defaults(&read_keys_file(path)?),
            None => get_signers_with_defaults(&self.private_keys),
        }
    }

    fn lanes(&self, signers: &[PrivateKeySigner]) -> Vec<AccountLane> {
        signers
            .iter()
            .enumerate()
            .map(|(a, signer)| {
                let target = self.to.unwrap_or(signer.address()).to_checksum(None);
                AccountLane {
                    account: account_id(signer.address()),
                    start_nonce: None,
                    ops: (0..self.txs_per_account)
                        .map(|i| LaneOp {
                            id: a as u64 * self.txs_per_account + i,
                            target: target.clone(),
                            amount: self.amount_wei,
                            node_hint: None,
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

pub async fn spam(args: &SpamCliArgs, cancel: &CancellationToken) -> Result<RunOutput, CliError> {
    if args.txs_per_account == 0 {
        return Err(ArgsError::NoTxsPerAccount.into());
    }
    let config = args.engine_config()?;
    let signers = args.signers()?;

    let (clients, signer): (Vec<Arc<dyn NodeClient>>, Arc<dyn PayloadSigner>) = if args.mock {
        info!("using {} in-process mock nodes", config.node_urls.len());
        let chain = MockChain::new();
        chain.set_inclusion_delay(MOCK_INCLUSION_DELAY);
        let clients = config
            .node_urls
            .iter()
            .map(|_| {
                let node = chain.node();
                node.set_submit_latency(MOCK_SUBMIT_LATENCY, MOCK_SUBMIT_JITTER);
                Arc::new(node) as Arc<dyn NodeClient>
            })
            .collect();
        (clients, Arc::new(MockSigner::new()))
    } else {
        let nodes = config
            .node_urls
            .iter()
            .map(|url| {
                let url = Url::parse(url).map_err(ArgsError::from)?;
                Ok(Arc::new(AlloyNodeClient::new(url)))
            })
            .collect::<Result<Vec<_>, CliError>>()?;
        let signer =
            AlloySigner::from_provider(&signers, nodes[0].provider(), args.gas_price_percent_add)
                .await?;
        let clients = nodes
            .into_iter()
            .map(|n| n as Arc<dyn NodeClient>)
            .collect();
        (clients, Arc::new(signer))
    };

    let registry = Registry::new();
    let engine = Engine::with_registry(config, clients, signer, &registry)?;
    let lanes = args.lanes(&signers);
    let output = engine.run_accounts(lanes, cancel).await?;

    if let Some(path) = &args.out {
        results::write_results(path, &output.reports)?;
    }
    if let Some(path) = &args.metrics_out {
        let text = TextEncoder::new().encode_to_string(&registry.gather())?;
        std::fs::write(path, text)?;
        info!("wrote metrics to {}", path.display());
    }
    if cancel.is_cancelled() {
        warn!("run was cancelled; results are partial");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pacer_core::dispatch::OutcomeKind;

    use super::*;
    use crate::commands::{PacerCli, PacerSubcommand};

    fn parse(extra: &[&str]) -> SpamCliArgs {
        let argv = ["pacer", "spam"].iter().chain(extra).copied();
        match PacerCli::try_parse_from(argv).unwrap().command {
            PacerSubcommand::Spam { args } => *args,
            other => panic!("unexpected subcommand {other:?}"),
        }
    }

    #[test]
    fn flags_override_config_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
            node_urls = ["http://a:8545", "http://b:8545"]
            write_rate = 300
            read_rate = 900
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_owned();

        let config = parse(&[
            "--config",
            &path,
            "--write-rate",
            "40",
            "--assignment",
            "global-least-loaded",
        ])
        .engine_config()
        .unwrap();
        assert_eq!(config.node_urls.len(), 2);
        assert_eq!(config.write_rate, 40);
        assert_eq!(config.read_rate, 900);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.workers, pacer_core::config::DEFAULT_WORKERS);
        assert_eq!(config.assignment, NodeAssignment::GlobalLeastLoaded);

        let config = parse(&["--config", &path, "-r", "http://c:8545"]).engine_config().unwrap();
        assert_eq!(config.node_urls, vec!["http://c:8545/".to_owned()]);
    }

    #[test]
    fn invalid_flags_are_rejected_before_running() {
        assert!(matches!(
            parse(&[]).engine_config(),
            Err(CliError::Args(ArgsError::NoRpcUrls))
        ));
        assert!(matches!(
            parse(&["--mock", "--workers", "0"]).engine_config(),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn lanes_number_jobs_per_account() {
        let to = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
        let args = parse(&["--mock", "-n", "3", "--to", to]);
        let signers = args.signers().unwrap();
        let lanes = args.lanes(&signers[..2]);
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[1].ops.iter().map(|op| op.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(lanes
            .iter()
            .flat_map(|l| &l.ops)
            .all(|op| op.target == to));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_run_writes_results_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results.csv");
        let metrics = dir.path().join("metrics.txt");
        let args = parse(&[
            "--mock",
            "--write-rate",
            "100",
            "--poll-interval-ms",
            "50",
            "-n",
            "4",
            "--out",
            out.to_str().unwrap(),
            "--metrics-out",
            metrics.to_str().unwrap(),
        ]);

        let output = spam(&args, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.reports.len(), 40);
        assert_eq!(output.summary.count(OutcomeKind::Confirmed), 40);

        let reloaded = results::read_results(&out).unwrap();
        assert_eq!(reloaded.len(), 40);
        let text = std::fs::read_to_string(&metrics).unwrap();
        assert!(text.contains("pacer_rpc_latency_seconds"));
    }
}
