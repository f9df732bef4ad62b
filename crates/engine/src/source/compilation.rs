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

use std::{collections::BTreeMap, str::FromStr, sync::Arc};

use alloy_primitives::{hex, Bytes, U256};
use eyre::{bail, eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{AstIndex, CodeMap, LineConverter};

/// Compiler output for one compilation: sources with their ASTs, and contracts with
/// their code, source maps and storage layouts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationOutput {
    /// Sources, positioned by their source id
    pub sources: Vec<SourceFile>,
    /// Contracts of all sources
    pub contracts: Vec<ContractOutput>,
}

/// A source file of a compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Source id used by source maps
    pub id: usize,
    /// Path as given to the compiler
    pub path: String,
    /// File content
    pub content: String,
    /// Compact JSON AST
    #[serde(default)]
    pub ast: Value,
}

/// A compiled contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOutput {
    /// Contract name
    pub name: String,
    /// Path of the defining source
    pub file: String,
    /// Init code
    pub creation: BytecodeOutput,
    /// Deployed code
    pub runtime: BytecodeOutput,
    /// Storage layout, when requested from the compiler
    #[serde(default)]
    pub storage_layout: Option<StorageLayout>,
}

/// Code object with its source map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytecodeOutput {
    /// Bytecode
    pub object: Bytes,
    /// Compressed solc source map
    pub source_map: String,
}

/// solc `storageLayout` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    /// State variables in declaration order
    pub storage: Vec<StorageEntry>,
    /// Type table referenced by `StorageEntry::ty`
    #[serde(default)]
    pub types: BTreeMap<String, StorageType>,
}

/// A state variable or struct member placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    /// AST id of the declaration
    #[serde(default)]
    pub ast_id: i64,
    /// Defining contract (`path:Name`)
    #[serde(default)]
    pub contract: String,
    /// Variable or member name
    pub label: String,
    /// Byte offset inside the slot, counted from the low-order end
    pub offset: usize,
    /// Slot, decimal
    pub slot: String,
    /// Key into the type table
    #[serde(rename = "type")]
    pub ty: String,
}

impl StorageEntry {
    /// The slot as a number.
    pub fn slot(&self) -> Result<U256> {
        U256::from_str(&self.slot).map_err(|e| eyre!("invalid slot {:?}: {e}", self.slot))
    }
}

/// An entry of the storage layout type table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageType {
    /// `inplace`, `mapping`, `dynamic_array` or `bytes`
    pub encoding: String,
    /// Solidity type name
    pub label: String,
    /// Size in bytes, decimal
    pub number_of_bytes: String,
    /// Element type of arrays
    #[serde(default)]
    pub base: Option<String>,
    /// Key type of mappings
    #[serde(default)]
    pub key: Option<String>,
    /// Value type of mappings
    #[serde(default)]
    pub value: Option<String>,
    /// Struct members
    #[serde(default)]
    pub members: Option<Vec<StorageEntry>>,
}

impl StorageType {
    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.number_of_bytes.parse().unwrap_or(32)
    }
}

impl CompilationOutput {
    /// Build from a solc standard-JSON input and output pair.
    ///
    /// Sources come from `output.sources` (ids and ASTs) joined with the contents of
    /// `input.sources`. Contracts whose code cannot be decoded (unlinked libraries) are
    /// skipped with a warning.
    pub fn from_standard_json(input: &Value, output: &Value) -> Result<Self> {
        if let Some(errors) = output.get("errors").and_then(Value::as_array) {
            let fatal: Vec<_> = errors
                .iter()
                .filter(|e| e.get("severity").and_then(Value::as_str) == Some("error"))
                .filter_map(|e| e.get("formattedMessage").and_then(Value::as_str))
                .collect();
            if !fatal.is_empty() {
                bail!("compilation failed:\n{}", fatal.join("\n"));
            }
        }

        let Some(sources) = output.get("sources").and_then(Value::as_object) else {
            bail!("compiler output has no sources");
        };

        let mut files: Vec<SourceFile> = Vec::with_capacity(sources.len());
        for (path, source) in sources {
            let id = source
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| eyre!("source {path} has no id"))? as usize;
            let content = input
                .pointer(&format!("/sources/{}/content", escape_pointer(path)))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if content.is_empty() {
                warn!(path, "Source content missing from compiler input");
            }
            let ast = source.get("ast").cloned().unwrap_or(Value::Null);
            files.push(SourceFile { id, path: path.clone(), content, ast });
        }
        files.sort_by_key(|f| f.id);

        // Source maps index sources by id, so ids must line up with positions.
        let mut positioned = Vec::with_capacity(files.len());
        for file in files {
            while positioned.len() < file.id {
                positioned.push(SourceFile { id: positioned.len(), ..Default::default() });
            }
            positioned.push(file);
        }

        let mut contracts = Vec::new();
        if let Some(by_file) = output.get("contracts").and_then(Value::as_object) {
            for (file, by_name) in by_file {
                let Some(by_name) = by_name.as_object() else { continue };
                for (name, contract) in by_name {
                    match parse_contract(file, name, contract) {
                        Ok(parsed) => contracts.push(parsed),
                        Err(err) => warn!(file, name, "Skipping contract: {err}"),
                    }
                }
            }
        }

        debug!(sources = positioned.len(), contracts = contracts.len(), "Parsed standard JSON");
        Ok(Self { sources: positioned, contracts })
    }

    /// Number of source slots (the range of valid source-map file indices).
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// The source with id `file`.
    pub fn source(&self, file: usize) -> Option<&SourceFile> {
        self.sources.get(file)
    }

    /// The contract named `name`; `name` may be qualified as `path:Name`.
    pub fn contract(&self, name: &str) -> Option<&ContractOutput> {
        match name.rsplit_once(':') {
            Some((file, name)) => self.contracts.iter().find(|c| c.name == name && c.file == file),
            None => self.contracts.iter().find(|c| c.name == name),
        }
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn parse_contract(file: &str, name: &str, contract: &Value) -> Result<ContractOutput> {
    let bytecode = |key: &str| -> Result<BytecodeOutput> {
        let Some(code) = contract.pointer(&format!("/evm/{key}")) else {
            return Ok(BytecodeOutput::default());
        };
        let object = code.get("object").and_then(Value::as_str).unwrap_or_default();
        let object = hex::decode(object).map_err(|e| eyre!("{key} is not plain hex: {e}"))?;
        let source_map = code.get("sourceMap").and_then(Value::as_str).unwrap_or_default();
        Ok(BytecodeOutput { object: object.into(), source_map: source_map.to_string() })
    };

    let storage_layout = match contract.get("storageLayout") {
        Some(layout) if !layout.is_null() => Some(serde_json::from_value(layout.clone())?),
        _ => None,
    };

    Ok(ContractOutput {
        name: name.to_string(),
        file: file.to_string(),
        creation: bytecode("bytecode")?,
        runtime: bytecode("deployedBytecode")?,
        storage_layout,
    })
}

/// A compilation with the indices derived from it. Shared by every contract it defines.
#[derive(Debug)]
pub struct CompilationUnit {
    /// Raw compiler output
    pub output: CompilationOutput,
    /// AST lookups
    pub ast: AstIndex,
    /// Offset to line conversion
    pub lines: LineConverter,
}

impl CompilationUnit {
    /// Index `output`.
    pub fn new(output: CompilationOutput) -> Self {
        let ast = AstIndex::build(&output.sources);
        let lines = LineConverter::new(&output.sources);
        Self { output, ast, lines }
    }

    /// Path of source `file`.
    pub fn path(&self, file: usize) -> Option<&str> {
        self.output.source(file).map(|s| s.path.as_str())
    }
}

/// One contract of a [`CompilationUnit`], with its code maps parsed.
#[derive(Debug)]
pub struct ContractArtifact {
    unit: Arc<CompilationUnit>,
    index: usize,
    creation: CodeMap,
    runtime: CodeMap,
}

impl ContractArtifact {
    /// Prepare contract `name` of `unit`.
    pub fn new(unit: Arc<CompilationUnit>, name: &str) -> Result<Self> {
        let index = unit
            .output
            .contracts
            .iter()
            .position(|c| match name.rsplit_once(':') {
                Some((file, short)) => c.file == file && c.name == short,
                None => c.name == name,
            })
            .ok_or_else(|| eyre!("contract {name} not found in compiler output"))?;
        let contract = &unit.output.contracts[index];
        let creation = CodeMap::new(&contract.creation)?;
        let runtime = CodeMap::new(&contract.runtime)?;
        Ok(Self { unit, index, creation, runtime })
    }

    /// The compilation the contract belongs to.
    pub fn unit(&self) -> &Arc<CompilationUnit> {
        &self.unit
    }

    /// Compiler output of the contract.
    pub fn contract(&self) -> &ContractOutput {
        &self.unit.output.contracts[self.index]
    }

    /// Contract name.
    pub fn name(&self) -> &str {
        &self.contract().name
    }

    /// Storage layout of the contract, if the compiler emitted one.
    pub fn storage_layout(&self) -> Option<&StorageLayout> {
        self.contract().storage_layout.as_ref()
    }

    /// Code map of the init code or of the deployed code.
    pub fn code_map(&self, creation: bool) -> &CodeMap {
        if creation {
            &self.creation
        } else {
            &self.runtime
        }
    }

    /// Number of sources in the compilation.
    pub fn source_count(&self) -> usize {
        self.unit.output.source_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_standard_json() {
        let input = json!({
            "language": "Solidity",
            "sources": {
                "src/B.sol": { "content": "contract B {}" },
                "src/A.sol": { "content": "contract A {}" }
            }
        });
        let output = json!({
            "sources": {
                "src/A.sol": { "id": 0, "ast": { "nodeType": "SourceUnit", "src": "0:13:0" } },
                "src/B.sol": { "id": 2, "ast": { "nodeType": "SourceUnit", "src": "0:13:2" } }
            },
            "contracts": {
                "src/A.sol": {
                    "A": {
                        "evm": {
                            "bytecode": { "object": "6080", "sourceMap": "0:13:0:-" },
                            "deployedBytecode": { "object": "0x00", "sourceMap": "0:13:0:-" }
                        },
                        "storageLayout": { "storage": [] }
                    }
                },
                "src/B.sol": {
                    "B": {
                        "evm": {
                            "bytecode": { "object": "__$abc$__", "sourceMap": "" },
                            "deployedBytecode": { "object": "", "sourceMap": "" }
                        }
                    }
                }
            }
        });

        let parsed = CompilationOutput::from_standard_json(&input, &output).unwrap();

        assert_eq!(parsed.source_count(), 3);
        assert_eq!(parsed.source(0).unwrap().path, "src/A.sol");
        assert_eq!(parsed.source(0).unwrap().content, "contract A {}");
        assert!(parsed.source(1).unwrap().path.is_empty());
        assert_eq!(parsed.source(2).unwrap().path, "src/B.sol");

        // B has unlinked code and is skipped.
        assert_eq!(parsed.contracts.len(), 1);
        let a = parsed.contract("src/A.sol:A").unwrap();
        assert_eq!(a.creation.object.as_ref(), &[0x60, 0x80]);
        assert_eq!(a.runtime.object.as_ref(), &[0x00]);
        assert!(a.storage_layout.as_ref().unwrap().storage.is_empty());
        assert!(parsed.contract("B").is_none());
    }

    #[test]
    fn test_compilation_errors_are_reported() {
        let output = json!({
            "errors": [{ "severity": "error", "formattedMessage": "ParserError: boom" }],
            "sources": {}
        });
        let err = CompilationOutput::from_standard_json(&json!({}), &output).unwrap_err();
        assert!(err.to_string().contains("ParserError"));
    }

    #[test]
    fn test_storage_entry_slot() {
        let entry: StorageEntry = serde_json::from_value(json!({
            "astId": 3, "contract": "C", "label": "x", "offset": 0, "slot": "12", "type": "t_uint256"
        }))
        .unwrap();
        assert_eq!(entry.slot().unwrap(), U256::from(12));
    }
}
