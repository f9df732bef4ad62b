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

use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use tdb_common::types::{CallKind, RevertKind};

use crate::utils::arena_id;

arena_id! {
    /// Index of a [`CallFrame`] inside [`super::TraceAnalysis::frames`]. The root frame is `FrameId(0)`.
    FrameId
}

impl FrameId {
    /// The transaction's top-level frame.
    pub const ROOT: Self = Self(0);
}

/// One message call or contract creation reconstructed from depth transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    /// This frame's id
    pub id: FrameId,
    /// The calling frame, `None` for the root
    pub parent: Option<FrameId>,
    /// How the frame was entered
    pub kind: CallKind,
    /// Address whose code runs in this frame
    pub code_address: Address,
    /// Address whose storage this frame reads and writes
    pub storage_address: Address,
    /// Struct-log depth of the steps executing in this frame
    pub depth: u64,
    /// The call-class step in the parent that opened this frame
    pub call_step: Option<usize>,
    /// First step attributed to the frame: the opening call step, or 0 for the root
    pub start: usize,
    /// Last step executing inside the frame
    pub exit: usize,
    /// First step back in the parent after the frame finished
    pub return_step: Option<usize>,
    /// Why the frame failed, if it did
    pub reverted: Option<RevertKind>,
    /// Input data of the frame (empty for creations)
    pub calldata: Bytes,
    /// Data returned through `RETURN` or `REVERT`
    pub output: Option<Bytes>,
    /// Frames opened from this one, in execution order
    pub children: Vec<FrameId>,
}

impl CallFrame {
    /// Whether the frame ended with a revert, an invalid instruction or an execution error.
    pub fn is_reverted(&self) -> bool {
        self.reverted.is_some()
    }

    /// Whether the frame ran out of gas.
    pub fn is_out_of_gas(&self) -> bool {
        self.reverted == Some(RevertKind::OutOfGas)
    }

    /// Whether `step` lies between the opening call step and the last step of the frame.
    pub fn covers(&self, step: usize) -> bool {
        self.start <= step && step <= self.exit
    }
}
