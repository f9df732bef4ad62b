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

//! External collaborators of the engine.
//!
//! The debugger never talks to a node or a compiler directly: it goes through the
//! traits below. Concrete implementations backed by JSON-RPC, the local file cache and
//! an in-memory artifact registry live in the submodules.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use tdb_common::types::{RawTrace, TraceOptions, TxContext};

use crate::source::ContractArtifact;

mod cache;
pub use cache::*;

mod registry;
pub use registry::*;

mod rpc;
pub use rpc::*;

/// Source of struct-log traces.
#[async_trait]
pub trait TraceProvider: Send + Sync {
    /// `debug_traceTransaction(tx, options)`.
    async fn trace_transaction(&self, tx: B256, options: TraceOptions) -> Result<RawTrace>;

    /// Sender, recipient, input and block position of `tx`.
    async fn transaction(&self, tx: B256) -> Result<TxContext>;
}

/// A trace together with the transaction it belongs to, as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTrace {
    /// The transaction
    pub tx: TxContext,
    /// Its struct log
    pub trace: RawTrace,
}

/// Optional persistent trace cache. Failures are logged by the caller and never fatal.
pub trait TraceCache: Send + Sync {
    /// Look up the trace of `tx`.
    fn get(&self, tx: &B256) -> Result<Option<CachedTrace>>;

    /// Store the trace of `tx`.
    fn set(&self, tx: &B256, trace: &CachedTrace) -> Result<()>;
}

/// Compiler output for the code deployed at an address.
#[async_trait]
pub trait CompilationResultProvider: Send + Sync {
    /// The artifact of the contract at `address`, `None` when it is unknown.
    async fn compilation(&self, address: Address) -> Result<Option<Arc<ContractArtifact>>>;
}

/// Storage values as they were before the debugged transaction executed.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Value of `slot` of `address` at the start of `tx`.
    async fn storage_before(&self, tx: &TxContext, address: Address, slot: U256) -> Result<U256>;
}
