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

//! Raw `debug_traceTransaction` struct-log types.
//!
//! These mirror the JSON returned by geth-compatible nodes for the default
//! (struct logger) tracer. Stack and memory entries are kept as the node sends
//! them and are normalised when the trace is analysed.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Options passed to `debug_traceTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceOptions {
    /// Do not record storage maps (storage is reconstructed from `SSTORE` steps)
    pub disable_storage: bool,
    /// Record memory at every step
    pub enable_memory: bool,
    /// Do not record the stack
    pub disable_stack: bool,
    /// Record the full storage map
    pub full_storage: bool,
}

impl TraceOptions {
    /// The fixed option set the debugger always requests.
    pub const fn debugger() -> Self {
        Self { disable_storage: true, enable_memory: true, disable_stack: false, full_storage: false }
    }
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self::debugger()
    }
}

/// A single struct-log entry: the machine state *before* the opcode executes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    /// Program counter
    pub pc: u64,
    /// Opcode mnemonic
    pub op: String,
    /// Remaining gas
    pub gas: u64,
    /// Gas charged for this opcode
    pub gas_cost: u64,
    /// Call depth, starting at 1 for the transaction's top frame
    pub depth: u64,
    /// Stack words, bottom first
    #[serde(default)]
    pub stack: Vec<String>,
    /// Memory as 32-byte hex words
    #[serde(default)]
    pub memory: Vec<String>,
    /// Execution error reported at this step (e.g. "out of gas")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `debug_traceTransaction` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrace {
    /// Whether the transaction failed
    pub failed: bool,
    /// Gas used by the transaction
    pub gas: u64,
    /// Hex-encoded return data of the top frame
    #[serde(default)]
    pub return_value: String,
    /// One entry per executed instruction
    #[serde(default)]
    pub struct_logs: Vec<StructLog>,
}

impl RawTrace {
    /// Number of executed instructions.
    pub fn len(&self) -> usize {
        self.struct_logs.len()
    }

    /// Whether no instruction was executed (plain value transfer).
    pub fn is_empty(&self) -> bool {
        self.struct_logs.is_empty()
    }
}

/// The transaction a trace belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxContext {
    /// Transaction hash
    pub hash: B256,
    /// Sender
    pub from: Address,
    /// Recipient, `None` for a contract creation
    pub to: Option<Address>,
    /// Deployed contract address of a creation transaction, from its receipt
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Calldata or init code
    pub input: Bytes,
    /// Block containing the transaction
    #[serde(default)]
    pub block_hash: Option<B256>,
    /// Position of the transaction inside its block
    #[serde(default)]
    pub transaction_index: Option<u64>,
}

impl TxContext {
    /// Whether this transaction deploys a contract.
    pub fn is_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Address whose code runs in the top-level frame.
    pub fn target(&self) -> Address {
        self.to.or(self.contract_address).unwrap_or_default()
    }
}
