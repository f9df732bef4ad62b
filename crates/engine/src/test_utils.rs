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

//! Shared fixtures for the engine's unit tests: a struct-log builder for synthetic
//! traces and a small hand-assembled `Counter` contract with a source map, an AST and
//! a storage layout.

use std::sync::Arc;

use alloy_primitives::{hex, Address, Bytes, U256};
use serde_json::json;
use tdb_common::types::{RawTrace, StructLog, TxContext};

use crate::source::{
    BytecodeOutput, CompilationOutput, CompilationUnit, ContractArtifact, ContractOutput,
    SourceFile, StorageLayout,
};

/// A deterministic address whose last byte is `n`.
pub fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// A call to `to` with empty calldata.
pub fn tx_to(to: Address) -> TxContext {
    TxContext { from: addr(0x01), to: Some(to), ..Default::default() }
}

/// Builds [`RawTrace`]s one step at a time. Gas decreases by the step cost.
pub struct TraceBuilder {
    logs: Vec<StructLog>,
    gas: u64,
    failed: bool,
}

impl Default for TraceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self { logs: Vec::new(), gas: 1_000_000, failed: false }
    }

    /// Append a step; `stack` is bottom first.
    pub fn step(mut self, pc: u64, op: &str, depth: u64, stack: &[U256]) -> Self {
        let gas_cost = 3;
        self.logs.push(StructLog {
            pc,
            op: op.to_string(),
            gas: self.gas,
            gas_cost,
            depth,
            stack: stack.iter().map(|w| format!("{w:#x}")).collect(),
            memory: self.logs.last().map(|l| l.memory.clone()).unwrap_or_default(),
            error: None,
        });
        self.gas -= gas_cost;
        self
    }

    /// Append steps at the given depth with the stacks listed, taking pcs and mnemonics
    /// from `program`.
    pub fn program(mut self, program: &Program, depth: u64, stacks: &[&[u64]]) -> Self {
        for (idx, stack) in stacks.iter().enumerate() {
            let words: Vec<U256> = stack.iter().map(|v| U256::from(*v)).collect();
            self = self.step(program.pcs[idx] as u64, program.ops[idx], depth, &words);
        }
        self
    }

    /// Replace the memory of the last step, padding to whole words.
    pub fn with_memory(mut self, memory: &[u8]) -> Self {
        if let Some(last) = self.logs.last_mut() {
            last.memory = memory.chunks(32).map(|c| {
                let mut word = [0u8; 32];
                word[..c.len()].copy_from_slice(c);
                hex::encode(word)
            }).collect();
        }
        self
    }

    /// Attach a node error to the last step.
    pub fn with_error(mut self, error: &str) -> Self {
        if let Some(last) = self.logs.last_mut() {
            last.error = Some(error.to_string());
        }
        self.failed = true;
        self
    }

    /// Override the gas cost of the last step.
    pub fn with_gas_cost(mut self, cost: u64) -> Self {
        if let Some(last) = self.logs.last_mut() {
            self.gas = self.gas + last.gas_cost - cost;
            last.gas_cost = cost;
        }
        self
    }

    pub fn build(self) -> RawTrace {
        let used = 1_000_000 - self.gas;
        RawTrace { failed: self.failed, gas: used, return_value: String::new(), struct_logs: self.logs }
    }
}

/// Hand-assembled bytecode with a matching uncompressed source map.
#[derive(Debug, Default)]
pub struct Program {
    pub code: Vec<u8>,
    pub map: Vec<String>,
    pub pcs: Vec<usize>,
    pub ops: Vec<&'static str>,
}

impl Program {
    /// Append one instruction mapped to `range` of source `file` (`None` for generated code).
    pub fn op(
        mut self,
        name: &'static str,
        bytes: &[u8],
        range: (usize, usize),
        file: Option<usize>,
        jump: char,
    ) -> Self {
        self.pcs.push(self.code.len());
        self.ops.push(name);
        self.code.extend_from_slice(bytes);
        self.map.push(match file {
            Some(file) => format!("{}:{}:{}:{}", range.0, range.1, file, jump),
            None => format!("-1:-1:-1:{jump}"),
        });
        self
    }

    pub fn bytecode(&self) -> BytecodeOutput {
        BytecodeOutput { object: Bytes::from(self.code.clone()), source_map: self.map.join(";") }
    }
}

pub const COUNTER_SOURCE: &str = "// SPDX-License-Identifier: MIT
pragma solidity ^0.8.0;

contract Counter {
    uint256 public count;

    function inc(uint256 by) public returns (uint256 total) {
        uint256 next = count + by;
        count = next;
        total = next;
    }
}
";

/// Byte range of the first occurrence of `needle` in the Counter source.
pub fn counter_range(needle: &str) -> (usize, usize) {
    let start = COUNTER_SOURCE.find(needle).unwrap_or_else(|| panic!("{needle:?} not in source"));
    (start, needle.len())
}

fn src((start, length): (usize, usize)) -> String {
    format!("{start}:{length}:0")
}

pub fn counter_contract_range() -> (usize, usize) {
    let start = COUNTER_SOURCE.find("contract Counter").unwrap();
    (start, COUNTER_SOURCE.trim_end().len() - start)
}

pub fn counter_function_range() -> (usize, usize) {
    let start = COUNTER_SOURCE.find("function inc").unwrap();
    let end = COUNTER_SOURCE.find("    }\n}").unwrap() + 5;
    (start, end - start)
}

fn counter_ast() -> serde_json::Value {
    let uint = json!({ "typeString": "uint256", "typeIdentifier": "t_uint256" });
    json!({
        "nodeType": "SourceUnit",
        "id": 1,
        "src": format!("0:{}:0", COUNTER_SOURCE.len()),
        "nodes": [
            { "nodeType": "PragmaDirective", "id": 2, "src": src(counter_range("pragma solidity ^0.8.0;")) },
            {
                "nodeType": "ContractDefinition",
                "id": 30,
                "name": "Counter",
                "src": src(counter_contract_range()),
                "nodes": [
                    {
                        "nodeType": "VariableDeclaration",
                        "id": 3,
                        "name": "count",
                        "stateVariable": true,
                        "storageLocation": "default",
                        "src": src(counter_range("uint256 public count")),
                        "typeDescriptions": uint,
                    },
                    {
                        "nodeType": "FunctionDefinition",
                        "id": 20,
                        "name": "inc",
                        "kind": "function",
                        "src": src(counter_function_range()),
                        "parameters": {
                            "nodeType": "ParameterList",
                            "id": 6,
                            "src": src(counter_range("(uint256 by)")),
                            "parameters": [{
                                "nodeType": "VariableDeclaration",
                                "id": 5,
                                "name": "by",
                                "stateVariable": false,
                                "storageLocation": "default",
                                "src": src(counter_range("uint256 by")),
                                "typeDescriptions": uint,
                            }]
                        },
                        "returnParameters": {
                            "nodeType": "ParameterList",
                            "id": 8,
                            "src": src(counter_range("(uint256 total)")),
                            "parameters": [{
                                "nodeType": "VariableDeclaration",
                                "id": 7,
                                "name": "total",
                                "stateVariable": false,
                                "storageLocation": "default",
                                "src": src(counter_range("uint256 total")),
                                "typeDescriptions": uint,
                            }]
                        },
                        "body": {
                            "nodeType": "Block",
                            "id": 19,
                            "src": src(counter_range("{\n        uint256 next")),
                            "statements": [{
                                "nodeType": "VariableDeclarationStatement",
                                "id": 12,
                                "src": src(counter_range("uint256 next = count + by")),
                                "declarations": [{
                                    "nodeType": "VariableDeclaration",
                                    "id": 9,
                                    "name": "next",
                                    "stateVariable": false,
                                    "storageLocation": "default",
                                    "src": src(counter_range("uint256 next")),
                                    "typeDescriptions": uint,
                                }]
                            }]
                        }
                    }
                ]
            }
        ]
    })
}

fn counter_storage_layout() -> StorageLayout {
    serde_json::from_value(json!({
        "storage": [{
            "astId": 3,
            "contract": "src/Counter.sol:Counter",
            "label": "count",
            "offset": 0,
            "slot": "0",
            "type": "t_uint256"
        }],
        "types": {
            "t_uint256": { "encoding": "inplace", "label": "uint256", "numberOfBytes": "32" }
        }
    }))
    .unwrap()
}

/// Runtime code of `Counter`: dispatch into `inc(7)`, add to `count`, store, return.
pub fn counter_program() -> Program {
    let contract = counter_contract_range();
    let function = counter_function_range();
    let f = Some(0);
    Program::default()
        .op("PUSH1", &[0x60, 0x03], contract, f, '-')
        .op("JUMP", &[0x56], function, f, 'i')
        .op("JUMPDEST", &[0x5b], function, f, '-')
        .op("PUSH1", &[0x60, 0x00], function, f, '-')
        .op("PUSH1", &[0x60, 0x00], counter_range("uint256 next"), f, '-')
        .op("PUSH1", &[0x60, 0x00], counter_range("count + by"), f, '-')
        .op("SLOAD", &[0x54], (counter_range("count + by").0, 5), f, '-')
        .op("DUP4", &[0x83], (counter_range("count + by").0 + 8, 2), f, '-')
        .op("ADD", &[0x01], counter_range("count + by"), f, '-')
        .op("SWAP1", &[0x90], counter_range("uint256 next = count + by"), f, '-')
        .op("POP", &[0x50], counter_range("uint256 next = count + by"), f, '-')
        .op("DUP1", &[0x80], counter_range("count = next"), f, '-')
        .op("PUSH1", &[0x60, 0x00], counter_range("count = next"), f, '-')
        .op("SSTORE", &[0x55], counter_range("count = next"), f, '-')
        .op("DUP1", &[0x80], counter_range("total = next"), f, '-')
        .op("SWAP2", &[0x91], counter_range("total = next"), f, '-')
        .op("POP", &[0x50], counter_range("total = next"), f, '-')
        .op("POP", &[0x50], function, f, '-')
        .op("SWAP1", &[0x90], function, f, '-')
        .op("POP", &[0x50], function, f, '-')
        .op("SWAP1", &[0x90], function, f, '-')
        .op("JUMP", &[0x56], function, f, 'o')
        .op("JUMPDEST", &[0x5b], contract, f, '-')
        .op("POP", &[0x50], contract, f, '-')
        .op("STOP", &[0x00], contract, f, '-')
}

/// Stacks observed when running [`counter_program`] with `count == 5`.
pub const COUNTER_STACKS: &[&[u64]] = &[
    &[0x1b, 7],
    &[0x1b, 7, 3],
    &[0x1b, 7],
    &[0x1b, 7],
    &[0x1b, 7, 0],
    &[0x1b, 7, 0, 0],
    &[0x1b, 7, 0, 0, 0],
    &[0x1b, 7, 0, 0, 5],
    &[0x1b, 7, 0, 0, 5, 7],
    &[0x1b, 7, 0, 0, 12],
    &[0x1b, 7, 0, 12, 0],
    &[0x1b, 7, 0, 12],
    &[0x1b, 7, 0, 12, 12],
    &[0x1b, 7, 0, 12, 12, 0],
    &[0x1b, 7, 0, 12],
    &[0x1b, 7, 0, 12, 12],
    &[0x1b, 7, 12, 12, 0],
    &[0x1b, 7, 12, 12],
    &[0x1b, 7, 12],
    &[0x1b, 12, 7],
    &[0x1b, 12],
    &[12, 0x1b],
    &[12],
    &[12],
    &[],
];

/// The Counter compilation with both code objects set to [`counter_program`].
pub fn counter_output() -> CompilationOutput {
    let program = counter_program();
    CompilationOutput {
        sources: vec![SourceFile {
            id: 0,
            path: "src/Counter.sol".into(),
            content: COUNTER_SOURCE.into(),
            ast: counter_ast(),
        }],
        contracts: vec![ContractOutput {
            name: "Counter".into(),
            file: "src/Counter.sol".into(),
            creation: program.bytecode(),
            runtime: program.bytecode(),
            storage_layout: Some(counter_storage_layout()),
        }],
    }
}

pub fn counter_artifact() -> Arc<ContractArtifact> {
    let unit = Arc::new(CompilationUnit::new(counter_output()));
    Arc::new(ContractArtifact::new(unit, "Counter").unwrap())
}

/// The Counter trace: 25 steps at depth 1 against `addr(0xaa)`.
pub fn counter_trace() -> RawTrace {
    TraceBuilder::new().program(&counter_program(), 1, COUNTER_STACKS).build()
}

/// A compilation whose code is `len` `JUMPDEST`s, every instruction mapped to the whole
/// contract. Any pc below `len` is an instruction boundary.
pub fn flat_artifact(len: usize) -> Arc<ContractArtifact> {
    let contract = counter_contract_range();
    let mut program = Program::default();
    for _ in 0..len {
        program = program.op("JUMPDEST", &[0x5b], contract, Some(0), '-');
    }
    let mut output = counter_output();
    output.contracts[0].creation = program.bytecode();
    output.contracts[0].runtime = program.bytecode();
    let unit = Arc::new(CompilationUnit::new(output));
    Arc::new(ContractArtifact::new(unit, "Counter").unwrap())
}

/// A source declaring `struct Vault.Position { address owner; uint256[] amounts; string note; }`
/// and `enum Vault.State { Open, Closed }`. Only the AST is meaningful.
pub fn vault_source() -> SourceFile {
    let member = |id: i64, name: &str, ty: &str| {
        json!({
            "nodeType": "VariableDeclaration",
            "id": id,
            "name": name,
            "stateVariable": false,
            "src": format!("{id}:1:1"),
            "typeDescriptions": { "typeString": ty },
        })
    };
    SourceFile {
        id: 1,
        path: "src/Vault.sol".into(),
        content: String::new(),
        ast: json!({
            "nodeType": "SourceUnit",
            "id": 100,
            "src": "0:0:1",
            "nodes": [{
                "nodeType": "ContractDefinition",
                "id": 101,
                "name": "Vault",
                "src": "0:0:1",
                "nodes": [
                    {
                        "nodeType": "StructDefinition",
                        "id": 102,
                        "name": "Position",
                        "canonicalName": "Vault.Position",
                        "src": "0:0:1",
                        "members": [
                            member(103, "owner", "address"),
                            member(104, "amounts", "uint256[]"),
                            member(105, "note", "string"),
                        ]
                    },
                    {
                        "nodeType": "EnumDefinition",
                        "id": 106,
                        "name": "State",
                        "canonicalName": "Vault.State",
                        "src": "0:0:1",
                        "members": [
                            { "nodeType": "EnumValue", "id": 107, "name": "Open" },
                            { "nodeType": "EnumValue", "id": 108, "name": "Closed" },
                        ]
                    }
                ]
            }]
        }),
    }
}

/// One 32-byte word holding `value`, big-endian.
pub fn word(value: u64) -> [u8; 32] {
    U256::from(value).to_be_bytes()
}
