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

//! Symbolic replay of a scope's stack.
//!
//! A local's stack slot is recorded once, when its declaration is met. Later pushes,
//! pops and swaps can move it, so decoding at a later step first replays the scope's
//! instructions on a stack of tags to find where the variable sits now.

use tdb_common::OpcodeTr;
use tracing::trace;

use crate::{
    scope::{ScopeTree, Variable, VariableId},
    trace::TraceAnalysis,
};

/// Stack of variable tags mirroring the real stack of one frame, bottom first.
#[derive(Debug, Default)]
struct SymbolicStack {
    slots: Vec<Option<VariableId>>,
}

impl SymbolicStack {
    /// Align with the observed stack height; the frame may have run code we did not
    /// replay (nested calls, unknown opcodes).
    fn resync(&mut self, height: usize) {
        self.slots.resize(height, None);
    }

    fn apply(&mut self, op: revm::bytecode::OpCode) {
        let len = self.slots.len();
        if let Some(n) = op.swap_depth() {
            // An untagged value swapped into a tagged slot is an assignment: the slot
            // keeps its variable.
            if len > n && self.slots[len - 1].is_some() {
                self.slots.swap(len - 1, len - 1 - n);
            }
            return;
        }
        if op.dup_depth().is_some() {
            self.slots.push(None);
            return;
        }
        self.slots.truncate(len.saturating_sub(op.inputs() as usize));
        self.slots.extend(std::iter::repeat_n(None, op.outputs() as usize));
    }

    fn position(&self, id: VariableId) -> Option<usize> {
        self.slots.iter().rposition(|slot| *slot == Some(id))
    }
}

/// Current stack index (from the bottom) of `variable` at `step`, or `None` if the
/// replay lost track of it.
pub(crate) fn locate(
    trace: &TraceAnalysis,
    tree: &ScopeTree,
    variable: &Variable,
    step: usize,
) -> Option<usize> {
    let scope = tree.scope(variable.scope?);
    let steps = trace.steps();
    let entry = steps.get(scope.entry_step)?;
    if step < scope.entry_step || step >= steps.len() {
        return None;
    }

    let mut pending: Vec<&Variable> = scope
        .locals
        .values()
        .filter_map(|id| tree.variable(*id))
        .filter(|v| v.declared_at <= step)
        .collect();
    pending.sort_by_key(|v| (v.declared_at, v.stack_depth));

    let mut stack = SymbolicStack::default();
    for s in scope.entry_step..=step {
        let current = &steps[s];
        if current.depth != entry.depth {
            continue;
        }
        stack.resync(current.stack.len());

        // A declaration claims its slot once the stack has grown to include it.
        pending.retain(|v| {
            if v.declared_at <= s && stack.slots.len() > v.stack_depth {
                stack.slots[v.stack_depth] = Some(v.id);
                false
            } else {
                true
            }
        });

        if s == step {
            break;
        }
        if let Some(op) = current.op {
            stack.apply(op);
        }
    }

    let found = stack.position(variable.id).or_else(|| {
        // Same name, different declaration (shadowing across re-entries).
        stack.slots.iter().rposition(|slot| {
            slot.and_then(|id| tree.variable(id)).is_some_and(|v| v.name == variable.name)
        })
    });
    trace!(name = %variable.name, step, ?found, "Symbolic stack lookup");
    found
}
