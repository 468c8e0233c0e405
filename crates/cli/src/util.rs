use std::{path::Path, str::FromStr};

use alloy::signers::local::PrivateKeySigner;
use csv::ReaderBuilder;
use nu_ansi_term::{AnsiGenericString, Style};
use serde::Deserialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::error::{ArgsError, CliError};

/// Anvil's default dev accounts.
pub const DEFAULT_PRV_KEYS: [&str; 10] = [
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
    "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
    "0x7c852118294e51e653712a81e05800f419141751be58f605c371e15141b007a6",
    "0x47e179ec197488593b187f80a00eb0da91f1b9d0b13f8733639f19c30a34926a",
    "0x8b3a350cf5c34c9194ca85829a2df0ec3153be0318b5e2d3348e872092edffba",
    "0x92db14e403b83dfe3df233f83dfa3a0d7096f21ca9b0d6d6b8d88b2b4ec1564e",
    "0x4bbbf85ce3377467afe5d46f804f221813b2bb87f24d81f60f1fcdbf7cbf4356",
    "0xdbda1821b80551c9d65939329250298aa3472ba22feea921c0cf5d620ea67b97",
    "0x2a871d0798f97d79848a013d4936a73bf4cc922c825d33c1cf7073dff6d409c6",
];

pub fn bold<'a>(msg: impl AsRef<str> + 'a) -> AnsiGenericString<'a, str> {
    Style::new().bold().paint(msg.as_ref().to_owned())
}

/// Installs the fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Parses the given keys, falling back to the anvil dev keys when none are given.
pub fn get_signers_with_defaults(
    private_keys: &[String],
) -> Result<Vec<PrivateKeySigner>, CliError> {
    if private_keys.is_empty() {
        warn!("No private keys provided. Using default private keys.");
        return DEFAULT_PRV_KEYS
            .iter()
            .map(|k| PrivateKeySigner::from_str(k).map_err(CliError::from))
            .collect();
    }
    private_keys
        .iter()
        .map(|k| PrivateKeySigner::from_str(k.trim()).map_err(CliError::from))
        .collect()
}

#[derive(Deserialize)]
struct KeyRow {
    private_key: String,
}

/// Reads private keys from a CSV file with a `private_key` column.
pub fn read_keys_file(path: impl AsRef<Path>) -> Result<Vec<String>, CliError> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let keys = reader
        .deserialize::<KeyRow>()
        .map(|row| row.map(|r| r.private_key))
        .collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        return Err(ArgsError::EmptyKeysFile {
            path: path.display().to_string(),
        }
        .into());
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn falls_back_to_dev_keys() {
        let signers = get_signers_with_defaults(&[]).unwrap();
        assert_eq!(signers.len(), DEFAULT_PRV_KEYS.len());
        assert_eq!(
            signers[0].address().to_checksum(None),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        );
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            get_signers_with_defaults(&["0x1234".to_owned()]),
            Err(CliError::PrivateKey(_))
        ));
    }

    #[test]
    fn reads_keys_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "label,private_key").unwrap();
        writeln!(file, "first,{}", DEFAULT_PRV_KEYS[1]).unwrap();
        writeln!(file, "second,{}", DEFAULT_PRV_KEYS[2]).unwrap();
        file.flush().unwrap();

        let keys = read_keys_file(file.path()).unwrap();
        assert_eq!(keys, vec![DEFAULT_PRV_KEYS[1], DEFAULT_PRV_KEYS[2]]);

        let empty = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(empty.path(), "private_key\n").unwrap();
        assert!(matches!(
            read_keys_file(empty.path()),
            Err(CliError::Args(ArgsError::EmptyKeysFile { .. }))
        ));
    }
}
