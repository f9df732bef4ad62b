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

use std::collections::{HashMap, HashSet};

use alloy_primitives::Address;
use tdb_common::{
    types::{JumpKind, SourceLocation},
    OpcodeTr,
};
use tracing::{debug, trace, warn};

use super::{
    Scope, ScopeIndex, ScopeKind, ScopeRevert, ScopeTree, StateSlot, StepLine, Variable,
    VariableId, VariableKind,
};
use crate::{
    decode::stack_width,
    error::BuildError,
    source::{
        ContractArtifact, FunctionDef, FunctionKind, OffsetToLineColumnConverter,
        SourceLocationResolver, SourceMapResolver, VariableDecl,
    },
    trace::TraceAnalysis,
};

/// Per-scope walk state.
struct OpenScope {
    index: ScopeIndex,
    kind: ScopeKind,
    frame_depth: u64,
    last_valid: Option<SourceLocation>,
    pending_constructor: Option<(usize, FunctionDef)>,
}

/// Single forward walk over the trace with an explicit stack of open scopes.
pub(super) struct ScopeBuilder<'a> {
    trace: &'a TraceAnalysis,
    resolver: &'a SourceMapResolver,
    include_locals: bool,
    tree: ScopeTree,
    open: Vec<OpenScope>,
    /// Last step whose gas and line were recorded; a replayed step is not counted twice
    accounted: Option<usize>,
    /// Location of the previous accounted step, reset at scope boundaries
    reduced_location: Option<SourceLocation>,
    gas_prefix: Vec<u64>,
    started_constructors: HashSet<(Address, i64)>,
    registered_layouts: HashSet<(Address, Address)>,
    file_ids: HashMap<String, usize>,
}

impl<'a> ScopeBuilder<'a> {
    pub(super) fn new(
        trace: &'a TraceAnalysis,
        resolver: &'a SourceMapResolver,
        include_locals: bool,
    ) -> Self {
        Self {
            trace,
            resolver,
            include_locals,
            tree: ScopeTree {
                step_lines: vec![None; trace.len()],
                artifacts: resolver.artifacts().clone(),
                ..Default::default()
            },
            open: Vec::new(),
            accounted: None,
            reduced_location: None,
            gas_prefix: Vec::new(),
            started_constructors: HashSet::new(),
            registered_layouts: HashSet::new(),
            file_ids: HashMap::new(),
        }
    }

    pub(super) fn build(mut self) -> Result<ScopeTree, BuildError> {
        let n = self.trace.len();
        let steps = self.trace.steps();

        let mut total = 0u64;
        self.gas_prefix.reserve(n + 1);
        self.gas_prefix.push(0);
        for s in 0..n {
            total = total.saturating_add(self.trace.step_gas_cost(s)?);
            self.gas_prefix.push(total);
        }

        let root = self.trace.root_frame();
        self.open_scope(ScopeKind::Root, 0, 0, steps[0].depth, root.code_address, root.storage_address, None);

        let mut s = 0;
        while s < n {
            let step = &steps[s];
            let address = self.trace.address_at(s)?;
            let artifact = self.resolver.artifact(&address).cloned();
            let raw = self.resolver.location_from_step(address, s)?;
            let sources = artifact.as_ref().map_or(0, |a| a.source_count());
            let raw_valid = raw.is_valid(sources);

            let valid = {
                let top = self.top_mut();
                if raw_valid {
                    top.last_valid = Some(raw);
                }
                top.last_valid
            };

            if self.accounted.is_none_or(|a| a < s) {
                self.accounted = Some(s);
                self.account(s, valid, artifact.as_deref())?;
            }

            if let (Some(artifact), Some(valid)) = (&artifact, valid) {
                if self.constructor_entry(s, address, artifact, valid)? {
                    // Replay this step inside the constructor scope.
                    continue;
                }
            }

            // Entering a new frame.
            if let Some(next) = steps.get(s + 1).filter(|next| next.depth > step.depth) {
                let callee = self.trace.frame_at(s + 1)?;
                self.open_scope(
                    ScopeKind::Call,
                    s,
                    s + 1,
                    next.depth,
                    callee.code_address,
                    callee.storage_address,
                    None,
                );
                s += 1;
                continue;
            }

            // Jumping into an internal function.
            if let Some(artifact) = &artifact {
                if raw.jump == JumpKind::Into
                    && steps.get(s + 1).is_some_and(|next| next.depth == step.depth)
                {
                    let target = self.resolver.location_from_step(address, s + 1)?;
                    if let Some(def) = artifact
                        .unit()
                        .ast
                        .function_at(&target)
                        .filter(|def| def.kind != FunctionKind::Constructor)
                        .cloned()
                    {
                        let storage = self.tree.scope(self.top().index).storage_address;
                        let scope = self.open_scope(
                            ScopeKind::Function,
                            s,
                            s + 1,
                            step.depth,
                            address,
                            storage,
                            Some(&def),
                        );
                        self.top_mut().last_valid = Some(target);
                        let stack_len = steps[s + 1].stack.len();
                        self.register_parameters(scope, &def, stack_len, s + 1, address);
                        s += 1;
                        continue;
                    }
                }
            }

            let reverted = step.op.is_some_and(|op| op.is_revert_class());
            if reverted {
                let line = valid.zip(artifact.as_deref()).and_then(|(valid, artifact)| {
                    artifact.unit().lines.offset_to_line_column(&valid).map(|r| r.start.line)
                });
                let index = self.top().index;
                self.tree.scopes[index.index()].reverted = Some(ScopeRevert { step: s, line });
            }

            if self.top().kind != ScopeKind::Root {
                let depth_change = steps.get(s + 1).is_some_and(|next| next.depth != step.depth);
                let function_exit = raw.jump == JumpKind::Out
                    && matches!(self.top().kind, ScopeKind::Function | ScopeKind::Constructor)
                    && artifact.as_ref().is_some_and(|a| a.unit().ast.function_at(&raw).is_some());

                if depth_change || reverted || function_exit {
                    self.close_top(s);
                    let out = s + 1;
                    while self.open.len() > 1 {
                        let parent_depth = self.top().frame_depth;
                        if out >= n || steps[out].depth < parent_depth {
                            self.close_top(out - 1);
                        } else {
                            break;
                        }
                    }
                    s = out;
                    continue;
                }
            }

            if self.include_locals && raw_valid {
                if let Some(decl) =
                    artifact.as_ref().and_then(|a| a.unit().ast.variable_at(&raw)).cloned()
                {
                    let scope = self.top().index;
                    self.register_variable(
                        scope,
                        &decl,
                        VariableKind::Local,
                        step.stack.len(),
                        s,
                        address,
                    );
                }
            }

            s += 1;
        }

        while !self.open.is_empty() {
            self.close_top(n - 1);
        }
        self.push_reduced(n - 1);

        Ok(self.tree)
    }

    fn top(&self) -> &OpenScope {
        // The root stays open until the walk ends.
        &self.open[self.open.len() - 1]
    }

    fn top_mut(&mut self) -> &mut OpenScope {
        let last = self.open.len() - 1;
        &mut self.open[last]
    }

    #[allow(clippy::too_many_arguments)]
    fn open_scope(
        &mut self,
        kind: ScopeKind,
        first_step: usize,
        entry_step: usize,
        frame_depth: u64,
        code_address: Address,
        storage_address: Address,
        function: Option<&FunctionDef>,
    ) -> ScopeIndex {
        let index = ScopeIndex::from(self.tree.scopes.len());
        let parent = self.open.last().map(|open| open.index);
        let ordinal = match parent {
            Some(parent) => {
                let siblings = &mut self.tree.scopes[parent.index()].children;
                siblings.push(index);
                siblings.len()
            }
            None => 1,
        };
        let is_creation = match kind {
            ScopeKind::Constructor => true,
            _ => self.trace.is_creation_step(entry_step.min(self.trace.len() - 1)).unwrap_or(false),
        };

        self.tree.scopes.push(Scope {
            index,
            parent,
            children: Vec::new(),
            ordinal,
            kind,
            first_step,
            entry_step,
            last_step: None,
            frame_depth,
            code_address,
            storage_address,
            is_creation,
            function: function.map(FunctionDef::display_name),
            gas_cost: 0,
            reverted: None,
            locals: Default::default(),
        });

        // Function bodies start from the caller's position in the same source.
        let last_valid = match kind {
            ScopeKind::Function | ScopeKind::Constructor => self.open.last().and_then(|o| o.last_valid),
            _ => None,
        };
        self.open.push(OpenScope { index, kind, frame_depth, last_valid, pending_constructor: None });

        if matches!(kind, ScopeKind::Root | ScopeKind::Call) {
            self.register_state_variables(storage_address, code_address);
        }

        self.push_reduced(first_step);
        self.reduced_location = None;
        debug!(scope = %self.tree.scope_id(index), ?kind, first_step, %code_address, "Scope opened");
        index
    }

    fn close_top(&mut self, last_step: usize) {
        let Some(open) = self.open.pop() else { return };
        let scope = &mut self.tree.scopes[open.index.index()];
        let last_step = last_step.max(scope.first_step);
        scope.last_step = Some(last_step);
        scope.gas_cost = self.gas_prefix[last_step + 1] - self.gas_prefix[scope.first_step];
        self.reduced_location = None;
        trace!(scope = %open.index, first = scope.first_step, last = last_step, "Scope closed");
    }

    /// Record gas, line and reduced-trace membership of step `s`.
    fn account(
        &mut self,
        s: usize,
        valid: Option<SourceLocation>,
        artifact: Option<&ContractArtifact>,
    ) -> Result<(), BuildError> {
        let (Some(valid), Some(artifact)) = (valid, artifact) else { return Ok(()) };
        let gas = self.trace.step_gas_cost(s)?;

        let path = valid.file.and_then(|file| artifact.unit().path(file));
        let range = artifact.unit().lines.offset_to_line_column(&valid);
        if let (Some(path), Some(range)) = (path, range) {
            let line = range.start.line;
            *self
                .tree
                .gas_per_line
                .entry(path.to_string())
                .or_default()
                .entry(line)
                .or_default() += gas;
            let file = self.intern_file(path);
            self.tree.step_lines[s] = Some(StepLine { file, line });
        }

        // A step starts a new source-level stop whenever its source range moves.
        if self.reduced_location.is_none_or(|previous| !valid.same_range(&previous)) {
            self.push_reduced(s);
        }
        self.reduced_location = Some(valid);
        Ok(())
    }

    fn push_reduced(&mut self, step: usize) {
        if self.tree.reduced_trace.last().is_none_or(|last| *last < step) {
            self.tree.reduced_trace.push(step);
        }
    }

    fn intern_file(&mut self, path: &str) -> usize {
        if let Some(id) = self.file_ids.get(path) {
            return *id;
        }
        let id = self.tree.files.len();
        self.tree.files.push(path.to_string());
        self.file_ids.insert(path.to_string(), id);
        id
    }

    /// Constructors run before their own source range becomes current: remember the
    /// definition when its range shows up and open the scope once execution moves past
    /// its start offset.
    fn constructor_entry(
        &mut self,
        s: usize,
        address: Address,
        artifact: &ContractArtifact,
        valid: SourceLocation,
    ) -> Result<bool, BuildError> {
        if let Some((offset, _)) = &self.top().pending_constructor {
            if *offset >= valid.start {
                return Ok(false);
            }
            let Some((_, def)) = self.top_mut().pending_constructor.take() else {
                return Ok(false);
            };
            let depth = self.trace.steps()[s].depth;
            let storage = self.tree.scope(self.top().index).storage_address;
            let scope =
                self.open_scope(ScopeKind::Constructor, s, s, depth, address, storage, Some(&def));
            let stack_len = self.trace.steps()[s].stack.len();
            self.register_parameters(scope, &def, stack_len, s, address);
            return Ok(true);
        }

        if self.top().kind == ScopeKind::Constructor || !self.trace.is_creation_step(s)? {
            return Ok(false);
        }
        if let Some(def) = artifact
            .unit()
            .ast
            .function_at(&valid)
            .filter(|def| def.kind == FunctionKind::Constructor)
        {
            if self.started_constructors.insert((address, def.id)) {
                debug!(step = s, constructor = %def.display_name(), "Constructor pending");
                self.top_mut().pending_constructor = Some((valid.start, def.clone()));
            }
        }
        Ok(false)
    }

    fn register_parameters(
        &mut self,
        scope: ScopeIndex,
        def: &FunctionDef,
        stack_len: usize,
        step: usize,
        address: Address,
    ) {
        let inputs: usize = def.parameters.iter().map(|p| stack_width(&p.type_string)).sum();
        let mut offset = 0;
        for param in &def.parameters {
            match (stack_len + offset).checked_sub(inputs) {
                Some(depth) => {
                    self.register_variable(scope, param, VariableKind::Parameter, depth, step, address)
                }
                None => warn!(
                    step,
                    param = %param.name,
                    stack_len,
                    "Stack too shallow for function parameters"
                ),
            }
            offset += stack_width(&param.type_string);
        }
        let mut offset = 0;
        for ret in &def.returns {
            self.register_variable(scope, ret, VariableKind::Return, stack_len + offset, step, address);
            offset += stack_width(&ret.type_string);
        }
    }

    fn register_variable(
        &mut self,
        scope: ScopeIndex,
        decl: &VariableDecl,
        kind: VariableKind,
        stack_depth: usize,
        step: usize,
        address: Address,
    ) {
        if decl.name.is_empty() || self.tree.scopes[scope.index()].locals.contains_key(&decl.name) {
            return;
        }
        let id = VariableId::from(self.tree.variables.len());
        self.tree.variables.push(Variable {
            id,
            name: decl.name.clone(),
            type_string: decl.type_string.clone(),
            kind,
            scope: Some(scope),
            stack_depth,
            declared_at: step,
            location: decl.src,
            address,
            code_address: address,
            storage: None,
        });
        self.tree.scopes[scope.index()].locals.insert(decl.name.clone(), id);
        trace!(step, name = %decl.name, stack_depth, ?kind, "Variable registered");
    }

    fn register_state_variables(&mut self, storage_address: Address, code_address: Address) {
        if !self.registered_layouts.insert((storage_address, code_address)) {
            return;
        }
        let Some(artifact) = self.resolver.artifact(&code_address).cloned() else { return };
        let Some(layout) = artifact.storage_layout() else { return };

        for entry in &layout.storage {
            let slot = match entry.slot() {
                Ok(slot) => slot,
                Err(err) => {
                    warn!(label = %entry.label, "Skipping state variable: {err}");
                    continue;
                }
            };
            let type_string =
                layout.types.get(&entry.ty).map(|t| t.label.clone()).unwrap_or_else(|| entry.ty.clone());
            let location = artifact
                .unit()
                .ast
                .state_variable(entry.ast_id)
                .map(|decl| decl.src)
                .unwrap_or_default();

            let id = VariableId::from(self.tree.variables.len());
            self.tree.variables.push(Variable {
                id,
                name: entry.label.clone(),
                type_string,
                kind: VariableKind::State,
                scope: None,
                stack_depth: 0,
                declared_at: 0,
                location,
                address: storage_address,
                code_address,
                storage: Some(StateSlot { slot, offset: entry.offset, type_id: entry.ty.clone() }),
            });
            self.tree.state_variables.entry(storage_address).or_default().push(id);
        }
    }
}
