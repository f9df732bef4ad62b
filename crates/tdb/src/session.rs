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

//! Wiring of providers and the debugger from command-line options.

use std::{sync::Arc, time::Duration};

use alloy_primitives::TxHash;
use eyre::{eyre, Result};
use tdb_common::{env::trace_cache_ttl_from_env, DEFAULT_TRACE_CACHE_TTL};
use tdb_engine::{
    BuildOutcome, Debugger, DebuggerConfig, Providers, RpcStorageProvider, RpcTraceProvider,
    StaticCompilationProvider, TraceCache,
};

use crate::Cli;

/// Build a [`Debugger`] backed by the RPC node and the compilation data given on the
/// command line.
pub async fn open_debugger(cli: &Cli) -> Result<Debugger> {
    let ttl = trace_cache_ttl_from_env().unwrap_or(DEFAULT_TRACE_CACHE_TTL);
    let mut config = DebuggerConfig::default()
        .with_local_variables(!cli.no_locals)
        .with_max_array_elements(cli.max_array_elements)
        .with_cache_ttl(Duration::from_secs(ttl));
    if let Some(dir) = &cli.cache_dir {
        config = config.with_cache_dir(dir.clone());
    }

    let trace_provider = RpcTraceProvider::new(&cli.rpc_url)?;
    let cache: Option<Arc<dyn TraceCache>> = if cli.disable_cache {
        tracing::info!("Trace cache disabled, fetching from {}", cli.rpc_url);
        None
    } else {
        let chain_id = trace_provider.chain_id().await?;
        config.open_trace_cache(chain_id)?.map(|cache| {
            tracing::info!("Using trace cache at {}", cache.dir().display());
            Arc::new(cache) as Arc<dyn TraceCache>
        })
    };

    let compilations = StaticCompilationProvider::new();
    match (&cli.solc_input, &cli.solc_output) {
        (Some(input), Some(output)) => {
            let unit = StaticCompilationProvider::load_standard_json(input, output)?;
            for contract in &cli.contracts {
                compilations.register(contract.address, unit.clone(), &contract.name)?;
            }
        }
        _ if !cli.contracts.is_empty() => {
            return Err(eyre!("--contract needs --solc-input and --solc-output"));
        }
        _ => tracing::warn!("No compilation data given, only opcode-level views are available"),
    }

    let providers = Providers {
        trace: Some(Arc::new(trace_provider)),
        cache,
        compilations: Arc::new(compilations),
        storage: Some(Arc::new(RpcStorageProvider::new(&cli.rpc_url)?)),
    };
    Ok(Debugger::new(config, providers))
}

/// Load `tx` and wait for its scope tree.
pub async fn load(debugger: &Debugger, tx: TxHash) -> Result<Option<BuildOutcome>> {
    if !debugger.debug(tx).await? {
        return Err(eyre!("a trace fetch is already in progress"));
    }
    let outcome = debugger.tree_outcome().await;
    match &outcome {
        Some(BuildOutcome::Ready(tree)) => {
            tracing::info!("Scope tree ready with {} scopes", tree.scopes().len())
        }
        Some(BuildOutcome::BuildFailed(reason)) => {
            tracing::warn!("Scope tree build failed: {reason}")
        }
        Some(BuildOutcome::NoCompilationData) => {
            tracing::warn!("No compilation data for the transaction target")
        }
        None => tracing::warn!("Scope tree build did not finish"),
    }
    Ok(outcome)
}
