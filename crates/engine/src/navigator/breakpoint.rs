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

use std::collections::HashSet;

use eyre::{bail, Result};
use tdb_common::types::Breakpoint;
use tracing::debug;

use crate::{scope::ScopeTree, trace::TraceAnalysis};

/// Breakpoints of a session, addressed by 1-based ids in insertion order.
#[derive(Debug, Clone, Default)]
pub struct BreakpointManager {
    breakpoints: Vec<(Breakpoint, bool)>,
    breakpoint_set: HashSet<Breakpoint>,
}

impl BreakpointManager {
    /// No breakpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an enabled breakpoint. Returns `false` if it already exists.
    pub fn add(&mut self, bp: Breakpoint) -> Result<bool> {
        if let Breakpoint::Source { line_number: 0, .. } = bp {
            bail!("Line numbers start at 1");
        }
        if !self.breakpoint_set.insert(bp.clone()) {
            return Ok(false);
        }
        debug!(%bp, "Breakpoint added");
        self.breakpoints.push((bp, true));
        Ok(true)
    }

    /// Remove breakpoint `id` (1-based).
    pub fn remove(&mut self, id: usize) -> Result<Breakpoint> {
        self.check_id(id)?;
        let (bp, _) = self.breakpoints.remove(id - 1);
        self.breakpoint_set.remove(&bp);
        Ok(bp)
    }

    /// Enable breakpoint `id`.
    pub fn enable(&mut self, id: usize) -> Result<()> {
        self.check_id(id)?;
        self.breakpoints[id - 1].1 = true;
        Ok(())
    }

    /// Disable breakpoint `id` without removing it.
    pub fn disable(&mut self, id: usize) -> Result<()> {
        self.check_id(id)?;
        self.breakpoints[id - 1].1 = false;
        Ok(())
    }

    /// Remove every breakpoint.
    pub fn clear(&mut self) {
        self.breakpoints.clear();
        self.breakpoint_set.clear();
    }

    /// `(id, breakpoint, enabled)` for every breakpoint.
    pub fn list(&self) -> impl Iterator<Item = (usize, &Breakpoint, bool)> {
        self.breakpoints.iter().enumerate().map(|(i, (bp, enabled))| (i + 1, bp, *enabled))
    }

    /// Number of breakpoints, enabled or not.
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    fn check_id(&self, id: usize) -> Result<()> {
        if id == 0 || id > self.breakpoints.len() {
            bail!("Breakpoint id {id} out of bounds");
        }
        Ok(())
    }

    /// Whether an enabled breakpoint fires at `step`.
    ///
    /// Opcode breakpoints fire on their `(address, pc)`. Source breakpoints fire on the
    /// first step of a visit to their line, so a line spanning many instructions is hit
    /// once per visit. Source breakpoints need a scope tree.
    pub fn hits(&self, trace: &TraceAnalysis, tree: Option<&ScopeTree>, step: usize) -> bool {
        let enabled = || self.breakpoints.iter().filter(|(_, enabled)| *enabled).map(|(bp, _)| bp);

        let entered_line = tree.and_then(|tree| {
            let line = tree.step_line(step)?;
            let previous = step.checked_sub(1).and_then(|s| tree.step_line(s));
            if previous == Some(line) {
                return None;
            }
            Some((tree.files().get(line.file)?.as_str(), line.line))
        });
        let position = trace.step(step).ok().zip(trace.address_at(step).ok());

        enabled().any(|bp| match bp {
            Breakpoint::Source { line_number, .. } => entered_line
                .is_some_and(|(path, line)| line + 1 == *line_number && bp.matches_file(path)),
            Breakpoint::Opcode { bytecode_address, pc } => position
                .is_some_and(|(exec, address)| address == *bytecode_address && exec.pc == *pc),
        })
    }
}
