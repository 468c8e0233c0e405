use alloy::{
    signers::local::LocalSignerError,
    transports::{RpcError, TransportErrorKind},
};
use miette::Diagnostic;
use pacer_core::error::ConfigError;
use thiserror::Error;

use crate::util::bold;

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("engine error")]
    Core(#[from] pacer_core::Error),

    #[error("invalid configuration")]
    #[diagnostic(help("check the --config file and the command-line flags"))]
    Config(#[from] ConfigError),

    #[error("invalid arg(s)")]
    Args(#[from] ArgsError),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("csv error")]
    Csv(#[from] csv::Error),

    #[error("malformed results row: {0}")]
    BadRow(String),

    #[error("rpc error")]
    Rpc(#[from] RpcError<TransportErrorKind>),

    #[error("invalid private key")]
    PrivateKey(#[from] LocalSignerError),

    #[error("failed to export metrics")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Error)]
pub enum ArgsError {
    #[error(
        "at least one node is required; pass {} or set node_urls in the config file",
        bold("--rpc-url")
    )]
    NoRpcUrls,

    #[error("failed to parse url")]
    UrlParse(#[from] url::ParseError),

    #[error("keys file {path} has no keys")]
    EmptyKeysFile { path: String },

    #[error("{} must be greater than zero", bold("--txs-per-account"))]
    NoTxsPerAccount,
}
