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

//! Lookups over solc compact JSON ASTs.
//!
//! The scope builder needs to answer "is there a function definition / variable
//! declaration exactly at this source range?" for every step, so the AST is flattened
//! once into hash maps keyed by `(start, length, file)`.

use std::collections::HashMap;

use serde_json::Value;
use tdb_common::types::{JumpKind, SourceLocation};
use tracing::{debug, warn};

use super::SourceFile;

type SrcKey = (usize, usize, usize);

fn key(location: &SourceLocation) -> Option<SrcKey> {
    Some((location.start, location.length, location.file?))
}

/// Parse an AST `src` attribute (`start:length:file`).
pub fn parse_src(src: &str) -> Option<SourceLocation> {
    let mut parts = src.split(':');
    let start = parts.next()?.parse::<i64>().ok()?;
    let length = parts.next()?.parse::<i64>().ok()?;
    let file = parts.next()?.parse::<i64>().ok()?;
    if start < 0 || length < 0 || file < 0 {
        return None;
    }
    Some(SourceLocation::new(start as usize, length as usize, Some(file as usize), JumpKind::Regular))
}

/// What kind of function a definition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Any other function definition
    Function,
    /// `constructor`
    Constructor,
    /// `fallback`
    Fallback,
    /// `receive`
    Receive,
}

/// A declared variable: parameter, return variable, local or state variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDecl {
    /// AST node id
    pub id: i64,
    /// Name, empty for unnamed parameters
    pub name: String,
    /// `typeDescriptions.typeString`
    pub type_string: String,
    /// Declaration range
    pub src: SourceLocation,
    /// Whether this is a state variable
    pub state: bool,
}

/// A function or constructor definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    /// AST node id
    pub id: i64,
    /// Name, empty for constructors and fallbacks
    pub name: String,
    pub kind: FunctionKind,
    /// Enclosing contract
    pub contract: Option<String>,
    /// Definition range
    pub src: SourceLocation,
    /// Input parameters
    pub parameters: Vec<VariableDecl>,
    /// Return parameters
    pub returns: Vec<VariableDecl>,
}

impl FunctionDef {
    /// `Contract.name`, or the bare name outside a contract.
    pub fn display_name(&self) -> String {
        let name = match self.kind {
            FunctionKind::Constructor => "constructor",
            FunctionKind::Fallback => "fallback",
            FunctionKind::Receive => "receive",
            FunctionKind::Function => &self.name,
        };
        match &self.contract {
            Some(contract) => format!("{contract}.{name}"),
            None => name.to_string(),
        }
    }
}

/// A struct definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    /// `Contract.Struct`
    pub canonical_name: String,
    pub members: Vec<VariableDecl>,
}

/// An enum definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    /// `Contract.Enum`
    pub canonical_name: String,
    pub members: Vec<String>,
}

/// Flattened view of every AST of a compilation.
#[derive(Debug, Clone, Default)]
pub struct AstIndex {
    functions: HashMap<SrcKey, FunctionDef>,
    variables: HashMap<SrcKey, VariableDecl>,
    state_variables: HashMap<i64, VariableDecl>,
    structs: HashMap<String, StructDef>,
    enums: HashMap<String, EnumDef>,
}

impl AstIndex {
    /// Index the ASTs of `sources`. Malformed nodes are logged and skipped.
    pub fn build(sources: &[SourceFile]) -> Self {
        let mut index = Self::default();
        for source in sources {
            if source.ast.is_null() {
                continue;
            }
            index.walk(&source.ast);
        }
        debug!(
            functions = index.functions.len(),
            variables = index.variables.len(),
            structs = index.structs.len(),
            enums = index.enums.len(),
            "AST indexed"
        );
        index
    }

    fn walk(&mut self, root: &Value) {
        let mut stack: Vec<(&Value, Option<String>)> = vec![(root, None)];

        while let Some((node, contract)) = stack.pop() {
            let node_type = node.get("nodeType").and_then(Value::as_str).unwrap_or_default();
            let mut contract = contract;
            let mut skip_keys: &[&str] = &[];

            match node_type {
                "ContractDefinition" => {
                    contract = node.get("name").and_then(Value::as_str).map(str::to_string);
                }
                "FunctionDefinition" => {
                    match parse_function(node, contract.clone()) {
                        Some(function) => {
                            if let Some(k) = key(&function.src) {
                                self.functions.insert(k, function);
                            }
                        }
                        None => warn!(id = ?node.get("id"), "Skipping malformed function definition"),
                    }
                    // Parameters are registered on function entry, not as locals.
                    skip_keys = &["parameters", "returnParameters"];
                }
                "VariableDeclaration" => match parse_variable(node) {
                    Some(variable) if variable.state => {
                        self.state_variables.insert(variable.id, variable);
                    }
                    Some(variable) => {
                        if let Some(k) = key(&variable.src) {
                            self.variables.insert(k, variable);
                        }
                    }
                    None => warn!(id = ?node.get("id"), "Skipping malformed variable declaration"),
                },
                "StructDefinition" => {
                    match parse_struct(node, contract.as_deref()) {
                        Some(def) => {
                            self.structs.insert(def.canonical_name.clone(), def);
                        }
                        None => warn!(id = ?node.get("id"), "Skipping malformed struct definition"),
                    }
                    skip_keys = &["members"];
                }
                "EnumDefinition" => match parse_enum(node, contract.as_deref()) {
                    Some(def) => {
                        self.enums.insert(def.canonical_name.clone(), def);
                    }
                    None => warn!(id = ?node.get("id"), "Skipping malformed enum definition"),
                },
                _ => {}
            }

            match node {
                Value::Object(map) => {
                    for (k, child) in map.iter().rev() {
                        if skip_keys.contains(&k.as_str()) {
                            continue;
                        }
                        if child.is_object() || child.is_array() {
                            stack.push((child, contract.clone()));
                        }
                    }
                }
                Value::Array(items) => {
                    for child in items.iter().rev() {
                        stack.push((child, contract.clone()));
                    }
                }
                _ => {}
            }
        }
    }

    /// The function definition spanning exactly `location`.
    pub fn function_at(&self, location: &SourceLocation) -> Option<&FunctionDef> {
        self.functions.get(&key(location)?)
    }

    /// The local variable declared exactly at `location`.
    pub fn variable_at(&self, location: &SourceLocation) -> Option<&VariableDecl> {
        self.variables.get(&key(location)?)
    }

    /// The state variable with AST id `id`.
    pub fn state_variable(&self, id: i64) -> Option<&VariableDecl> {
        self.state_variables.get(&id)
    }

    /// Struct by canonical name (`Contract.Struct`).
    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.get(name)
    }

    /// Enum by canonical name (`Contract.Enum`).
    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    /// All function definitions.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.values()
    }
}

fn parse_variable(node: &Value) -> Option<VariableDecl> {
    Some(VariableDecl {
        id: node.get("id")?.as_i64()?,
        name: node.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        type_string: node.pointer("/typeDescriptions/typeString")?.as_str()?.to_string(),
        src: parse_src(node.get("src")?.as_str()?)?,
        state: node.get("stateVariable").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_parameters(node: &Value, key: &str) -> Option<Vec<VariableDecl>> {
    match node.pointer(&format!("/{key}/parameters")) {
        Some(Value::Array(params)) => params.iter().map(parse_variable).collect(),
        _ => Some(Vec::new()),
    }
}

fn parse_function(node: &Value, contract: Option<String>) -> Option<FunctionDef> {
    let kind = match node.get("kind").and_then(Value::as_str) {
        Some("constructor") => FunctionKind::Constructor,
        Some("fallback") => FunctionKind::Fallback,
        Some("receive") => FunctionKind::Receive,
        Some(_) => FunctionKind::Function,
        // Pre-0.5 ASTs
        None if node.get("isConstructor").and_then(Value::as_bool) == Some(true) => {
            FunctionKind::Constructor
        }
        None => FunctionKind::Function,
    };
    Some(FunctionDef {
        id: node.get("id")?.as_i64()?,
        name: node.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        kind,
        contract,
        src: parse_src(node.get("src")?.as_str()?)?,
        parameters: parse_parameters(node, "parameters")?,
        returns: parse_parameters(node, "returnParameters")?,
    })
}

fn canonical_name(node: &Value, contract: Option<&str>) -> Option<String> {
    if let Some(name) = node.get("canonicalName").and_then(Value::as_str) {
        return Some(name.to_string());
    }
    let name = node.get("name")?.as_str()?;
    Some(match contract {
        Some(contract) => format!("{contract}.{name}"),
        None => name.to_string(),
    })
}

fn parse_struct(node: &Value, contract: Option<&str>) -> Option<StructDef> {
    let members = node.get("members")?.as_array()?.iter().map(parse_variable).collect::<Option<_>>()?;
    Some(StructDef { canonical_name: canonical_name(node, contract)?, members })
}

fn parse_enum(node: &Value, contract: Option<&str>) -> Option<EnumDef> {
    let members = node
        .get("members")?
        .as_array()?
        .iter()
        .map(|m| m.get("name").and_then(Value::as_str).map(str::to_string))
        .collect::<Option<_>>()?;
    Some(EnumDef { canonical_name: canonical_name(node, contract)?, members })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{counter_function_range, counter_output, counter_range};
    use serde_json::json;

    fn loc((start, length): (usize, usize)) -> SourceLocation {
        SourceLocation::new(start, length, Some(0), JumpKind::Into)
    }

    #[test]
    fn test_counter_index() {
        let index = AstIndex::build(&counter_output().sources);

        let inc = index.function_at(&loc(counter_function_range())).unwrap();
        assert_eq!(inc.display_name(), "Counter.inc");
        assert_eq!(inc.kind, FunctionKind::Function);
        assert_eq!(inc.parameters.len(), 1);
        assert_eq!(inc.parameters[0].name, "by");
        assert_eq!(inc.returns[0].name, "total");

        let next = index.variable_at(&loc(counter_range("uint256 next"))).unwrap();
        assert_eq!(next.name, "next");
        assert_eq!(next.type_string, "uint256");

        // Parameters are not indexed as locals.
        assert!(index.variable_at(&loc(counter_range("uint256 by"))).is_none());
        assert_eq!(index.state_variable(3).unwrap().name, "count");
        assert!(index.function_at(&SourceLocation::invalid()).is_none());
    }

    #[test]
    fn test_structs_enums_and_malformed_nodes() {
        let ast = json!({
            "nodeType": "SourceUnit",
            "src": "0:100:0",
            "nodes": [{
                "nodeType": "ContractDefinition",
                "name": "Vault",
                "src": "0:100:0",
                "nodes": [
                    {
                        "nodeType": "StructDefinition",
                        "name": "Position",
                        "src": "10:20:0",
                        "members": [
                            { "nodeType": "VariableDeclaration", "id": 1, "name": "owner", "src": "12:5:0",
                              "typeDescriptions": { "typeString": "address" } },
                            { "nodeType": "VariableDeclaration", "id": 2, "name": "amount", "src": "18:5:0",
                              "typeDescriptions": { "typeString": "uint128" } }
                        ]
                    },
                    {
                        "nodeType": "EnumDefinition",
                        "canonicalName": "Vault.State",
                        "src": "31:20:0",
                        "members": [{ "name": "Open" }, { "name": "Closed" }]
                    },
                    { "nodeType": "FunctionDefinition", "id": 9, "name": "broken", "src": "nonsense" },
                    { "nodeType": "FunctionDefinition", "id": 10, "kind": "constructor", "name": "",
                      "src": "60:30:0", "parameters": { "parameters": [] } }
                ]
            }]
        });
        let index = AstIndex::build(&[SourceFile { ast, ..Default::default() }]);

        let position = index.struct_def("Vault.Position").unwrap();
        assert_eq!(position.members[1].type_string, "uint128");
        assert_eq!(index.enum_def("Vault.State").unwrap().members, vec!["Open", "Closed"]);
        assert_eq!(index.functions().count(), 1);
        let ctor = index.functions().next().unwrap();
        assert_eq!(ctor.kind, FunctionKind::Constructor);
        assert_eq!(ctor.display_name(), "Vault.constructor");
    }

    #[test]
    fn test_parse_src() {
        assert_eq!(parse_src("1:2:3").unwrap().file, Some(3));
        assert!(parse_src("-1:-1:-1").is_none());
        assert!(parse_src("1:2").is_none());
    }
}
