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

//! Step Navigator.
//!
//! A cursor over the loaded trace. Opcode-level moves work on the raw step list;
//! source-level moves hop along the scope tree's reduced trace so one move is one
//! source location. Without a scope tree the navigator falls back to call frames.
//!
//! Every move is a no-op when nothing is loaded, when the target is out of range, or
//! when it would land on the current step.

use std::sync::Arc;

use revm::bytecode::OpCode;
use tdb_common::types::RevertReason;
use tracing::{debug, trace};

use crate::{
    events::{DebuggerEvent, EventSender, StepChange, StepState},
    scope::{ScopeIndex, ScopeTree},
    trace::TraceAnalysis,
    utils::find_lower_bound,
};

mod breakpoint;
pub use breakpoint::*;

/// Cursor over the loaded trace, with breakpoints and revert tracking.
#[derive(Debug, Default)]
pub struct StepNavigator {
    trace: Option<Arc<TraceAnalysis>>,
    tree: Option<Arc<ScopeTree>>,
    current: Option<usize>,
    revertion_point: Option<usize>,
    revert_reason: RevertReason,
    breakpoints: BreakpointManager,
    events: EventSender,
}

impl StepNavigator {
    /// Navigator with nothing loaded, publishing on `events`.
    pub fn new(events: EventSender) -> Self {
        Self { events, ..Default::default() }
    }

    /// Attach a freshly analysed trace. The cursor stays unset until the first move.
    pub fn load(&mut self, trace: Arc<TraceAnalysis>) {
        self.trace = Some(trace);
        self.tree = None;
        self.current = None;
        self.revertion_point = None;
        self.revert_reason = RevertReason::None;
    }

    /// Attach (or drop) the scope tree of the loaded trace.
    pub fn set_tree(&mut self, tree: Option<Arc<ScopeTree>>) {
        self.tree = tree;
    }

    /// Forget the trace, the tree and the position. Breakpoints are kept.
    pub fn unload(&mut self) {
        self.trace = None;
        self.tree = None;
        self.current = None;
        self.revertion_point = None;
        self.revert_reason = RevertReason::None;
    }

    /// The loaded trace.
    pub fn trace(&self) -> Option<&Arc<TraceAnalysis>> {
        self.trace.as_ref()
    }

    /// The scope tree, once set.
    pub fn tree(&self) -> Option<&Arc<ScopeTree>> {
        self.tree.as_ref()
    }

    /// Current position.
    pub fn current_step(&self) -> Option<usize> {
        self.current
    }

    /// Why the current step is flagged, if it is in a reverting path.
    pub fn revert_reason(&self) -> RevertReason {
        self.revert_reason
    }

    /// The step where the frame responsible for the current revert warning failed.
    pub fn revertion_point(&self) -> Option<usize> {
        self.revertion_point
    }

    /// Registered breakpoints.
    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// Registered breakpoints, for editing.
    pub fn breakpoints_mut(&mut self) -> &mut BreakpointManager {
        &mut self.breakpoints
    }

    /// Move the cursor to `step`. Returns whether it moved.
    pub fn jump_to(&mut self, step: usize) -> bool {
        let Some(trace) = self.trace.clone() else { return false };
        if !trace.in_range(step) || self.current == Some(step) {
            return false;
        }
        self.current = Some(step);
        trace!(step, "Cursor moved");

        let change = StepChange {
            step,
            state: self.state_at(&trace, step),
            jump_out_disabled: self.jump_out_target(&trace, step) == Some(step),
        };
        self.events.send(DebuggerEvent::StepChanged(change));
        self.update_revert_warning(&trace, step);
        true
    }

    /// Next step, or the next source location change when `source_level` and a scope tree
    /// is set.
    pub fn step_into_forward(&mut self, source_level: bool) -> bool {
        let Some((trace, current)) = self.position() else { return false };
        let target = self.into_forward_target(&trace, current, source_level);
        self.move_to(target)
    }

    /// Previous step, or the previous source location change when `source_level`.
    pub fn step_into_back(&mut self, source_level: bool) -> bool {
        let Some((_, current)) = self.position() else { return false };
        let target = self.into_back_target(current, source_level);
        self.move_to(target)
    }

    /// Step forward, running nested calls and internal functions to completion.
    pub fn step_over_forward(&mut self, source_level: bool) -> bool {
        let Some((trace, current)) = self.position() else { return false };

        let target = match self.tree.clone() {
            Some(tree) => {
                let Some(scope) = tree.scope_at(current) else { return false };
                if scope.index != ScopeIndex::ROOT && scope.first_step == current {
                    scope.last_step.map(|last| last + 1)
                } else {
                    self.into_forward_target(&trace, current, source_level).map(|target| {
                        match tree.scope_at(target).map(|s| s.index) {
                            Some(inner) if inner != scope.index && tree.is_within(inner, scope.index) => {
                                tree.child_towards(scope.index, inner)
                                    .and_then(|child| tree.scope(child).last_step)
                                    .map_or(target, |last| last + 1)
                            }
                            _ => target,
                        }
                    })
                }
            }
            None => {
                let next = current + 1;
                match (trace.step(current), trace.step(next)) {
                    (Ok(now), Ok(then)) if then.depth > now.depth => trace.find_step_out(next).ok(),
                    _ => Some(next),
                }
            }
        };
        self.move_to(target)
    }

    /// Step backward, skipping over nested calls and internal functions.
    pub fn step_over_back(&mut self, source_level: bool) -> bool {
        let Some((trace, current)) = self.position() else { return false };

        let target = match self.tree.clone() {
            Some(tree) => {
                let Some(scope) = tree.scope_at(current) else { return false };
                self.into_back_target(current, source_level).and_then(|target| {
                    match tree.scope_at(target).map(|s| s.index) {
                        Some(inner) if inner != scope.index && tree.is_within(inner, scope.index) => {
                            let child = tree.child_towards(scope.index, inner)?;
                            let before = tree.scope(child).first_step.checked_sub(1)?;
                            Some(if source_level { self.reduced_floor(before) } else { before })
                        }
                        _ => Some(target),
                    }
                })
            }
            None => current.checked_sub(1).and_then(|previous| {
                match (trace.step(previous), trace.step(current)) {
                    (Ok(then), Ok(now)) if then.depth > now.depth => {
                        trace.frame_at(previous).ok().and_then(|frame| frame.call_step)
                    }
                    _ => Some(previous),
                }
            }),
        };
        self.move_to(target)
    }

    /// Leave the current scope: the step after its end, or where its frame returns.
    pub fn jump_out(&mut self) -> bool {
        let Some((trace, current)) = self.position() else { return false };
        let target = self.jump_out_target(&trace, current);
        self.move_to(target)
    }

    /// Jump to the point behind the current revert warning, or to the first failure of
    /// the trace. For a reverted frame that is its failing step; below a reverted
    /// ancestor it is the step where the ancestor returns to its caller.
    pub fn jump_to_exception(&mut self) -> bool {
        let Some((trace, _)) = self.position() else { return false };
        let target = self.revertion_point.or_else(|| trace.first_exception());
        self.move_to(target)
    }

    /// First breakpoint hit after the current step.
    pub fn jump_next_breakpoint(&mut self) -> bool {
        let Some((trace, current)) = self.position() else { return false };
        let tree = self.tree.as_deref();
        let target =
            (current + 1..trace.len()).find(|step| self.breakpoints.hits(&trace, tree, *step));
        debug!(?target, "Next breakpoint");
        self.move_to(target)
    }

    /// Last breakpoint hit before the current step.
    pub fn jump_previous_breakpoint(&mut self) -> bool {
        let Some((trace, current)) = self.position() else { return false };
        let tree = self.tree.as_deref();
        let target = (0..current).rev().find(|step| self.breakpoints.hits(&trace, tree, *step));
        debug!(?target, "Previous breakpoint");
        self.move_to(target)
    }

    fn position(&self) -> Option<(Arc<TraceAnalysis>, usize)> {
        Some((self.trace.clone()?, self.current?))
    }

    fn move_to(&mut self, target: Option<usize>) -> bool {
        match target {
            Some(target) => self.jump_to(target),
            None => false,
        }
    }

    /// Last reduced-trace entry at or before `step`.
    fn reduced_floor(&self, step: usize) -> usize {
        self.tree
            .as_deref()
            .and_then(|tree| {
                let reduced = tree.reduced_trace();
                find_lower_bound(reduced, step).map(|i| reduced[i])
            })
            .unwrap_or(step)
    }

    /// Source-level moves shift by one entry of the reduced trace, counted from the entry
    /// at or before the current step. Without a tree they degrade to opcode moves.
    fn reduced_neighbour(&self, current: usize, forward: bool) -> Option<Option<usize>> {
        let tree = self.tree.as_deref()?;
        let reduced = tree.reduced_trace();
        if reduced.is_empty() {
            return None;
        }
        let idx = find_lower_bound(reduced, current);
        Some(if forward {
            reduced.get(idx.map_or(0, |i| i + 1)).copied()
        } else {
            idx.and_then(|i| i.checked_sub(1)).map(|i| reduced[i])
        })
    }

    fn into_forward_target(
        &self,
        trace: &TraceAnalysis,
        current: usize,
        source_level: bool,
    ) -> Option<usize> {
        if source_level {
            if let Some(target) = self.reduced_neighbour(current, true) {
                return target;
            }
        }
        let next = current + 1;
        trace.in_range(next).then_some(next)
    }

    fn into_back_target(&self, current: usize, source_level: bool) -> Option<usize> {
        if source_level {
            if let Some(target) = self.reduced_neighbour(current, false) {
                return target;
            }
        }
        current.checked_sub(1)
    }

    fn jump_out_target(&self, trace: &TraceAnalysis, step: usize) -> Option<usize> {
        if let Some(scope) = self.tree.as_deref().and_then(|tree| tree.scope_at(step)) {
            if scope.index != ScopeIndex::ROOT {
                if let Some(after) = scope.last_step.map(|last| last + 1).filter(|s| trace.in_range(*s)) {
                    return Some(after);
                }
            }
        }
        trace.find_step_out(step).ok()
    }

    fn state_at(&self, trace: &TraceAnalysis, step: usize) -> StepState {
        if step == 0 {
            return StepState::Initial;
        }
        if step + 1 == trace.len() {
            return StepState::End;
        }
        match trace.step(step).ok().and_then(|s| s.op) {
            None | Some(OpCode::INVALID) => StepState::Invalid,
            Some(_) => StepState::Valid,
        }
    }

    /// The frame executing `step` reverted: `reverted`/`outofgas`. One of its callers
    /// reverted: `parenthasthrown`. Otherwise the warning is cleared.
    fn update_revert_warning(&mut self, trace: &TraceAnalysis, step: usize) {
        let Ok(path) = trace.call_path(step) else { return };
        let (reason, point) = match path.split_last() {
            Some((frame, _)) if frame.is_reverted() => {
                let reason =
                    if frame.is_out_of_gas() { RevertReason::OutOfGas } else { RevertReason::Reverted };
                (reason, Some(frame.exit))
            }
            Some((_, callers)) => {
                match callers.iter().rev().find(|frame| frame.is_reverted()) {
                    // Point at where the reverting ancestor hands control back.
                    Some(frame) => (
                        RevertReason::ParentHasThrown,
                        Some(frame.return_step.unwrap_or(frame.exit)),
                    ),
                    None => (RevertReason::None, None),
                }
            }
            None => (RevertReason::None, None),
        };
        self.revert_reason = reason;
        self.revertion_point = point;
        self.events.send(DebuggerEvent::RevertWarning(reason));
    }
}
