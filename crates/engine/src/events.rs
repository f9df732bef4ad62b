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

//! Notifications pushed to front ends while a session runs.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use tdb_common::types::RevertReason;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers observe `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Classification of the step the cursor sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// First step of the trace
    Initial,
    /// Any step strictly inside the trace
    Valid,
    /// Last step of the trace
    End,
    /// An unknown or `INVALID` instruction
    Invalid,
}

/// Payload of [`DebuggerEvent::StepChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepChange {
    pub step: usize,
    pub state: StepState,
    /// Whether `jump_out` would stay on the same step
    pub jump_out_disabled: bool,
}

/// Everything a session reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebuggerEvent {
    /// A trace was analysed and became the current session
    TraceLoaded {
        /// Transaction hash
        tx: B256,
        /// Number of steps
        length: usize,
    },
    /// The session was dropped
    TraceUnloaded,
    /// Step count of the current trace
    TraceLengthChanged(usize),
    /// The navigator moved
    StepChanged(StepChange),
    /// Revert state of the current step, sent on every move
    RevertWarning(RevertReason),
    /// The scope tree is available
    TreeReady {
        /// Number of scopes in the tree
        scopes: usize,
    },
    /// The scope build failed; opcode-level debugging only
    TreeBuildFailed(String),
    /// The build task died before reporting an outcome
    TreeNotReady,
    /// The transaction target has no compilation data
    NoCompilationData,
}

/// Cloneable sending half shared by the debugger and its navigator.
#[derive(Debug, Clone)]
pub struct EventSender(broadcast::Sender<DebuggerEvent>);

impl Default for EventSender {
    fn default() -> Self {
        Self(broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
    }
}

impl EventSender {
    /// Publish `event`. Having no subscriber is not an error.
    pub fn send(&self, event: DebuggerEvent) {
        let _ = self.0.send(event);
    }

    /// New receiver of every event sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent> {
        self.0.subscribe()
    }
}
