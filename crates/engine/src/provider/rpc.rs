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

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256, U64};
use alloy_provider::{Provider, RootProvider};
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tdb_common::types::{RawTrace, TraceOptions, TxContext};
use tracing::{debug, trace};

use super::{StorageProvider, TraceProvider};

/// `eth_getTransactionByHash` fields the debugger needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
    input: Bytes,
    block_hash: Option<B256>,
    transaction_index: Option<U64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    contract_address: Option<Address>,
}

/// Connect to an HTTP JSON-RPC endpoint.
fn connect(rpc_url: &str) -> Result<RootProvider> {
    let url = rpc_url.parse().map_err(|e| eyre!("invalid RPC URL {rpc_url}: {e}"))?;
    Ok(RootProvider::new_http(url))
}

/// Fetches struct logs from a node exposing the `debug` namespace.
#[derive(Debug, Clone)]
pub struct RpcTraceProvider {
    provider: RootProvider,
}

impl RpcTraceProvider {
    /// New provider for `rpc_url`.
    pub fn new(rpc_url: &str) -> Result<Self> {
        Ok(Self { provider: connect(rpc_url)? })
    }

    /// Chain id reported by the node, used to partition the trace cache.
    pub async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chain_id().await?)
    }
}

#[async_trait]
impl TraceProvider for RpcTraceProvider {
    async fn trace_transaction(&self, tx: B256, options: TraceOptions) -> Result<RawTrace> {
        debug!(%tx, "Requesting debug_traceTransaction");
        let trace: RawTrace =
            self.provider.raw_request("debug_traceTransaction".into(), (tx, options)).await?;
        debug!(%tx, steps = trace.len(), "Received trace");
        Ok(trace)
    }

    async fn transaction(&self, tx: B256) -> Result<TxContext> {
        let fetched: Option<RpcTransaction> =
            self.provider.raw_request("eth_getTransactionByHash".into(), (tx,)).await?;
        let fetched = fetched.ok_or_else(|| eyre!("transaction {tx} not found"))?;

        let contract_address = if fetched.to.is_none() {
            let receipt: Option<RpcReceipt> =
                self.provider.raw_request("eth_getTransactionReceipt".into(), (tx,)).await?;
            receipt.and_then(|r| r.contract_address)
        } else {
            None
        };

        Ok(TxContext {
            hash: fetched.hash,
            from: fetched.from,
            to: fetched.to,
            contract_address,
            input: fetched.input,
            block_hash: fetched.block_hash,
            transaction_index: fetched.transaction_index.map(|i| i.to::<u64>()),
        })
    }
}

/// One entry of a `debug_storageRangeAt` response.
#[derive(Debug, Deserialize)]
struct StorageEntry {
    key: Option<B256>,
    value: B256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageRange {
    storage: HashMap<B256, StorageEntry>,
}

/// Answers pre-transaction storage through `debug_storageRangeAt`, which reports state
/// right before the given transaction of a block executed.
#[derive(Debug, Clone)]
pub struct RpcStorageProvider {
    provider: RootProvider,
    cache: Arc<Mutex<HashMap<(Address, U256), U256>>>,
}

impl RpcStorageProvider {
    /// New provider for `rpc_url`.
    pub fn new(rpc_url: &str) -> Result<Self> {
        Ok(Self { provider: connect(rpc_url)?, cache: Default::default() })
    }
}

#[async_trait]
impl StorageProvider for RpcStorageProvider {
    async fn storage_before(&self, tx: &TxContext, address: Address, slot: U256) -> Result<U256> {
        if let Some(value) = self.cache.lock().get(&(address, slot)) {
            trace!(%address, %slot, "Storage cache hit");
            return Ok(*value);
        }

        let block_hash =
            tx.block_hash.ok_or_else(|| eyre!("transaction {} is not mined", tx.hash))?;
        let tx_index = tx
            .transaction_index
            .ok_or_else(|| eyre!("transaction {} has no block position", tx.hash))?;

        let key = B256::from(slot.to_be_bytes::<32>());
        let hashed = keccak256(key);
        let range: StorageRange = self
            .provider
            .raw_request(
                "debug_storageRangeAt".into(),
                (block_hash, tx_index, address, hashed, 1u64),
            )
            .await?;

        // The range starts at the hashed key; an absent entry means the slot is empty.
        let value = range
            .storage
            .get(&hashed)
            .filter(|entry| entry.key.is_none_or(|k| k == key))
            .map(|entry| U256::from_be_bytes(entry.value.0))
            .unwrap_or_default();

        self.cache.lock().insert((address, slot), value);
        Ok(value)
    }
}
