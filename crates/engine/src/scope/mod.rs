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

//! Scope Tree Builder.
//!
//! Partitions a trace into nested scopes (the transaction itself, message calls,
//! internal function invocations and constructors), registers the variables visible in
//! each scope and attributes gas to source lines. The result is an arena, [`ScopeTree`],
//! addressed by [`ScopeIndex`] and [`VariableId`].

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use alloy_primitives::{Address, U256};
use futures::future::join_all;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tdb_common::types::SourceLocation;
use tracing::{debug, info, warn};

use crate::{
    provider::CompilationResultProvider,
    source::{ContractArtifact, SourceMapResolver},
    trace::TraceAnalysis,
    utils::{arena_id, find_lower_bound_by_key},
};

mod builder;
use builder::ScopeBuilder;

arena_id! {
    /// Index of a [`Scope`] in [`ScopeTree::scopes`]; the root is `ScopeIndex(0)`.
    ScopeIndex
}

arena_id! {
    /// Index of a [`Variable`] in [`ScopeTree::variables`], unique across the whole trace.
    VariableId
}

impl ScopeIndex {
    /// The transaction's top-level scope.
    pub const ROOT: Self = Self(0);
}

/// What a scope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    /// The whole transaction
    Root,
    /// A message call or contract creation
    Call,
    /// An internal function invocation
    Function,
    /// A constructor body
    Constructor,
}

/// Where a scope was left through `REVERT` or `INVALID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRevert {
    /// The reverting step
    pub step: usize,
    /// Zero-based source line of the reverting step, when known
    pub line: Option<usize>,
}

/// A contiguous step range with its own variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    /// Position in the tree's arena
    pub index: ScopeIndex,
    /// Enclosing scope; `None` for the root
    pub parent: Option<ScopeIndex>,
    /// Nested scopes in execution order
    pub children: Vec<ScopeIndex>,
    /// Position among the parent's children, starting at 1
    pub ordinal: usize,
    /// What opened the scope
    pub kind: ScopeKind,
    /// First step of the scope (the call or jump that opened it)
    pub first_step: usize,
    /// First step executing with the scope's own stack frame
    pub entry_step: usize,
    /// Last step, assigned once when the scope is left
    pub last_step: Option<usize>,
    /// Struct-log depth of the steps executing in the scope
    pub frame_depth: u64,
    /// Address whose code runs in the scope
    pub code_address: Address,
    /// Address whose storage the scope sees
    pub storage_address: Address,
    /// Whether the scope runs init code
    pub is_creation: bool,
    /// `Contract.function` for function and constructor scopes
    pub function: Option<String>,
    /// Gas spent over the scope's step range, nested scopes included
    pub gas_cost: u64,
    /// Set when the scope was left through a revert
    pub reverted: Option<ScopeRevert>,
    /// Variables declared in the scope by name
    pub locals: BTreeMap<String, VariableId>,
}

impl Scope {
    /// Whether `step` lies in the scope's range.
    pub fn contains(&self, step: usize) -> bool {
        self.first_step <= step && self.last_step.is_none_or(|last| step <= last)
    }
}

/// How a variable came into scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    /// Declared inside a function body
    Local,
    /// Function input
    Parameter,
    /// Named function output
    Return,
    /// Contract state variable
    State,
}

/// Storage placement of a state variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSlot {
    /// Base slot
    pub slot: U256,
    /// Byte offset inside the slot, from the low-order end
    pub offset: usize,
    /// Key into the storage layout type table
    pub type_id: String,
}

/// A variable registered during the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    /// Position in the tree's arena
    pub id: VariableId,
    /// Declared name
    pub name: String,
    /// Solidity type string (AST `typeString` or storage layout label)
    pub type_string: String,
    /// How the variable came into scope
    pub kind: VariableKind,
    /// Owning scope; `None` for state variables
    pub scope: Option<ScopeIndex>,
    /// Stack slot, counted from the bottom, recorded when the variable was declared
    pub stack_depth: usize,
    /// Step at which the declaration was met
    pub declared_at: usize,
    /// Declaration range
    pub location: SourceLocation,
    /// Storage owner for state variables, code address otherwise
    pub address: Address,
    /// Address of the code declaring the variable
    pub code_address: Address,
    /// Storage placement of state variables
    pub storage: Option<StateSlot>,
}

impl Variable {
    /// Whether the variable is a function input or output.
    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, VariableKind::Parameter | VariableKind::Return)
    }
}

/// Source line executed by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLine {
    /// Index into [`ScopeTree::files`]
    pub file: usize,
    /// Zero-based line
    pub line: usize,
}

/// Result of a successful build.
#[derive(Debug, Default)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    variables: Vec<Variable>,
    state_variables: BTreeMap<Address, Vec<VariableId>>,
    reduced_trace: Vec<usize>,
    gas_per_line: BTreeMap<String, BTreeMap<usize, u64>>,
    files: Vec<String>,
    step_lines: Vec<Option<StepLine>>,
    artifacts: HashMap<Address, Arc<ContractArtifact>>,
}

impl ScopeTree {
    /// All scopes in creation order, which is also `first_step` order.
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// Scope at `index`.
    pub fn scope(&self, index: ScopeIndex) -> &Scope {
        &self.scopes[index.index()]
    }

    /// The transaction scope.
    pub fn root(&self) -> &Scope {
        &self.scopes[0]
    }

    /// The deepest scope containing `step`.
    pub fn scope_at(&self, step: usize) -> Option<&Scope> {
        let idx = find_lower_bound_by_key(&self.scopes, step, |s| s.first_step)?;
        let mut scope = &self.scopes[idx];
        while !scope.contains(step) {
            scope = &self.scopes[scope.parent?.index()];
        }
        Some(scope)
    }

    /// Dotted id of a scope: `"1"` for the root, `"1.2"` for its second child.
    pub fn scope_id(&self, index: ScopeIndex) -> String {
        let mut parts = vec![self.scope(index).ordinal.to_string()];
        let mut current = self.scope(index).parent;
        while let Some(parent) = current {
            parts.push(self.scope(parent).ordinal.to_string());
            current = self.scope(parent).parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Look a scope up by its dotted id.
    pub fn find_scope(&self, id: &str) -> Option<ScopeIndex> {
        let mut parts = id.split('.');
        if parts.next()? != "1" {
            return None;
        }
        let mut current = ScopeIndex::ROOT;
        for part in parts {
            let ordinal: usize = part.parse().ok()?;
            current = *self.scope(current).children.get(ordinal.checked_sub(1)?)?;
        }
        Some(current)
    }

    /// Whether `scope` is `ancestor` or nested inside it.
    pub fn is_within(&self, scope: ScopeIndex, ancestor: ScopeIndex) -> bool {
        let mut current = Some(scope);
        while let Some(index) = current {
            if index == ancestor {
                return true;
            }
            current = self.scope(index).parent;
        }
        false
    }

    /// The child of `ancestor` on the path down to `scope`.
    pub fn child_towards(&self, ancestor: ScopeIndex, scope: ScopeIndex) -> Option<ScopeIndex> {
        let mut current = scope;
        loop {
            let parent = self.scope(current).parent?;
            if parent == ancestor {
                return Some(current);
            }
            current = parent;
        }
    }

    /// Every registered variable, indexed by [`VariableId`].
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Variable `id`, if registered.
    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(id.index())
    }

    /// Variables of the deepest scope at `step` that are declared by then.
    pub fn locals_at(&self, step: usize) -> Vec<&Variable> {
        let Some(scope) = self.scope_at(step) else { return Vec::new() };
        scope
            .locals
            .values()
            .filter_map(|id| self.variable(*id))
            .filter(|v| v.declared_at <= step)
            .sorted_by_key(|v| (v.stack_depth, v.id))
            .collect()
    }

    /// State variables of the contract whose storage lives at `address`.
    pub fn state_variables(&self, address: &Address) -> Vec<&Variable> {
        self.state_variables
            .get(address)
            .map(|ids| ids.iter().filter_map(|id| self.variable(*id)).collect())
            .unwrap_or_default()
    }

    /// Steps where the mapped source location changes; strictly increasing.
    pub fn reduced_trace(&self) -> &[usize] {
        &self.reduced_trace
    }

    /// Gas attributed to every executed line, by source path and zero-based line.
    pub fn gas_per_line(&self) -> &BTreeMap<String, BTreeMap<usize, u64>> {
        &self.gas_per_line
    }

    /// Source path and zero-based line executed at `step`.
    pub fn line_at(&self, step: usize) -> Option<(&str, usize)> {
        let line = self.step_lines.get(step).copied().flatten()?;
        Some((self.files.get(line.file)?.as_str(), line.line))
    }

    /// Raw line info of `step`, cheap to compare.
    pub fn step_line(&self, step: usize) -> Option<StepLine> {
        self.step_lines.get(step).copied().flatten()
    }

    /// Source paths met during the build.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Artifact of the code at `address`.
    pub fn artifact(&self, address: &Address) -> Option<&Arc<ContractArtifact>> {
        self.artifacts.get(address)
    }

    /// Render the tree, one scope per line.
    pub fn format_tree(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(ScopeIndex::ROOT, 0usize)];
        while let Some((index, indent)) = stack.pop() {
            let scope = self.scope(index);
            let label = match (&scope.kind, &scope.function) {
                (_, Some(function)) => function.clone(),
                (ScopeKind::Root, None) => format!("tx {}", scope.code_address),
                (_, None) => format!("call {}", scope.code_address),
            };
            let last = scope.last_step.map(|l| l.to_string()).unwrap_or_else(|| "?".into());
            let reverted = if scope.reverted.is_some() { " ✗" } else { "" };
            out.push_str(&format!(
                "{}{} {} [{}..{}] gas {}{}\n",
                "  ".repeat(indent),
                self.scope_id(index),
                label,
                scope.first_step,
                last,
                scope.gas_cost,
                reverted
            ));
            for child in scope.children.iter().rev() {
                stack.push((*child, indent + 1));
            }
        }
        out
    }
}

/// Terminal state of a scope build. `BuildFailed` and `NoCompilationData` both mean
/// "fall back to opcode-level debugging".
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// The tree was built
    Ready(Arc<ScopeTree>),
    /// Resolution failed; carries the reason
    BuildFailed(String),
    /// The transaction target has no compilation data
    NoCompilationData,
}

impl BuildOutcome {
    /// The tree, if the build succeeded.
    pub fn tree(&self) -> Option<&Arc<ScopeTree>> {
        match self {
            Self::Ready(tree) => Some(tree),
            _ => None,
        }
    }
}

/// Build the scope tree of `trace`, fetching compiler output for every code address it
/// runs.
pub async fn build_scope_tree(
    trace: Arc<TraceAnalysis>,
    compilations: Arc<dyn CompilationResultProvider>,
    include_locals: bool,
) -> BuildOutcome {
    let root = trace.root_frame().code_address;
    let addresses: BTreeSet<Address> = trace.frames().iter().map(|f| f.code_address).collect();

    let fetched = join_all(addresses.iter().map(|address| compilations.compilation(*address))).await;
    let mut artifacts = HashMap::new();
    for (address, result) in addresses.into_iter().zip(fetched) {
        match result {
            Ok(Some(artifact)) => {
                artifacts.insert(address, artifact);
            }
            Ok(None) if address == root => {
                info!(%address, "No compilation data for the transaction target");
                return BuildOutcome::NoCompilationData;
            }
            Ok(None) => debug!(%address, "No compilation data, steps stay unmapped"),
            Err(err) => {
                warn!(%address, "Compilation lookup failed: {err}");
                return BuildOutcome::BuildFailed(format!(
                    "compilation lookup for {address} failed: {err}"
                ));
            }
        }
    }

    let resolver = SourceMapResolver::new(trace.clone(), artifacts);
    match ScopeBuilder::new(&trace, &resolver, include_locals).build() {
        Ok(tree) => {
            info!(
                scopes = tree.scopes.len(),
                variables = tree.variables.len(),
                reduced = tree.reduced_trace.len(),
                "Scope tree ready"
            );
            BuildOutcome::Ready(Arc::new(tree))
        }
        Err(err) => {
            warn!("Scope tree build failed: {err}");
            BuildOutcome::BuildFailed(err.to_string())
        }
    }
}
