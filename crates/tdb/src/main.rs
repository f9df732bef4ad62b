// TDB - Trace Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! TDB - Trace Debugger
//!
//! Post-hoc, source-level debugging of Ethereum transactions from their struct-log
//! traces.

use std::{path::PathBuf, str::FromStr};

use alloy_primitives::{Address, TxHash};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};

mod cmd;
mod session;

use cmd::{show_calls, show_scopes, show_step};

/// Command-line interface for TDB
#[derive(Debug, Parser)]
#[command(name = "tdb")]
#[command(about = "Trace Debugger - source-level debugging of Ethereum transaction traces")]
#[command(version)]
pub struct Cli {
    /// Ethereum RPC endpoint with `debug_traceTransaction` support
    #[arg(long, env = "ETH_RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: String,

    /// Cache directory for fetched traces (default: ~/.tdb/cache)
    #[arg(long, env = "TDB_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Always fetch traces from the node
    #[arg(long)]
    pub disable_cache: bool,

    /// solc standard-JSON input of the contracts to debug
    #[arg(long, requires = "solc_output")]
    pub solc_input: Option<PathBuf>,

    /// solc standard-JSON output matching `--solc-input`
    #[arg(long, requires = "solc_input")]
    pub solc_output: Option<PathBuf>,

    /// Contract deployed at an address, as `ADDRESS=NAME` (repeatable)
    #[arg(long = "contract", value_name = "ADDRESS=NAME")]
    pub contracts: Vec<ContractArg>,

    /// Skip local variables when building the scope tree
    #[arg(long)]
    pub no_locals: bool,

    /// Cap on decoded array elements and mapping entries
    #[arg(long, default_value = "1024")]
    pub max_array_elements: usize,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the call tree, marking reverted frames
    Calls {
        /// Transaction hash
        tx_hash: TxHash,
    },
    /// Print the scope tree and the gas spent per source line
    Scopes {
        /// Transaction hash
        tx_hash: TxHash,
    },
    /// Print the stack, locals and state variables at a step
    Step {
        /// Transaction hash
        tx_hash: TxHash,
        /// Step index
        step: usize,
    },
}

/// A `--contract ADDRESS=NAME` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractArg {
    /// Deployment address
    pub address: Address,
    /// Contract name in the compiler output
    pub name: String,
}

impl FromStr for ContractArg {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let (address, name) =
            s.split_once('=').ok_or_else(|| eyre!("expected ADDRESS=NAME, got `{s}`"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(eyre!("missing contract name in `{s}`"));
        }
        Ok(Self { address: address.trim().parse()?, name: name.to_string() })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    tdb_common::init_logging("tdb", false)?;

    let debugger = session::open_debugger(&cli).await?;

    match &cli.command {
        Commands::Calls { tx_hash } => {
            tracing::info!("Showing call tree of {tx_hash}");
            show_calls(&debugger, *tx_hash, &cli).await
        }
        Commands::Scopes { tx_hash } => {
            tracing::info!("Showing scope tree of {tx_hash}");
            show_scopes(&debugger, *tx_hash, &cli).await
        }
        Commands::Step { tx_hash, step } => {
            tracing::info!("Inspecting step {step} of {tx_hash}");
            show_step(&debugger, *tx_hash, *step, &cli).await
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_contract_arg() {
        let arg: ContractArg = "0x00000000000000000000000000000000000000aa=Counter".parse().unwrap();
        assert_eq!(arg.address, Address::with_last_byte(0xaa));
        assert_eq!(arg.name, "Counter");

        assert!("Counter".parse::<ContractArg>().is_err());
        assert!("0xaa=Counter".parse::<ContractArg>().is_err());
        assert!("0x00000000000000000000000000000000000000aa=".parse::<ContractArg>().is_err());
    }

    #[test]
    fn test_parse_step_command() {
        let tx = "0x1282e09bb5118f619da81b6a24c97999e7057ee9975628562c7cecbb4aa9f5af";
        let cli = Cli::try_parse_from([
            "tdb",
            "--rpc-url",
            "http://127.0.0.1:8545",
            "--contract",
            "0x00000000000000000000000000000000000000aa=Counter",
            "--contract",
            "0x00000000000000000000000000000000000000bb=Vault",
            "step",
            tx,
            "42",
        ])
        .unwrap();
        assert_eq!(cli.contracts.len(), 2);
        assert_eq!(cli.contracts[1].name, "Vault");
        assert!(matches!(cli.command, Commands::Step { step: 42, .. }));
    }

    #[test]
    fn test_solc_files_come_in_pairs() {
        let tx = "0x1282e09bb5118f619da81b6a24c97999e7057ee9975628562c7cecbb4aa9f5af";
        assert!(Cli::try_parse_from(["tdb", "--solc-input", "in.json", "calls", tx]).is_err());
    }
}
