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

use std::fmt;

use revm::bytecode::OpCode;
use serde::{Deserialize, Serialize};

/// How a call frame was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// The transaction's own top-level frame
    Root,
    /// `CALL`
    Call,
    /// `CALLCODE`
    CallCode,
    /// `DELEGATECALL`
    DelegateCall,
    /// `STATICCALL`
    StaticCall,
    /// `CREATE`
    Create,
    /// `CREATE2`
    Create2,
}

impl CallKind {
    /// The frame kind opened by a call-class opcode.
    pub fn from_opcode(op: OpCode) -> Option<Self> {
        match op {
            OpCode::CALL => Some(Self::Call),
            OpCode::CALLCODE => Some(Self::CallCode),
            OpCode::DELEGATECALL => Some(Self::DelegateCall),
            OpCode::STATICCALL => Some(Self::StaticCall),
            OpCode::CREATE => Some(Self::Create),
            OpCode::CREATE2 => Some(Self::Create2),
            _ => None,
        }
    }

    /// Whether the frame runs init code.
    pub fn is_create(&self) -> bool {
        matches!(self, Self::Create | Self::Create2)
    }

    /// Whether the frame keeps the caller's storage context.
    pub fn keeps_caller_storage(&self) -> bool {
        matches!(self, Self::DelegateCall | Self::CallCode)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Root => "TX",
            Self::Call => "CALL",
            Self::CallCode => "CALLCODE",
            Self::DelegateCall => "DELEGATECALL",
            Self::StaticCall => "STATICCALL",
            Self::Create => "CREATE",
            Self::Create2 => "CREATE2",
        };
        write!(f, "{name}")
    }
}

/// Why a frame did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevertKind {
    /// Explicit `REVERT`
    Revert,
    /// `INVALID` (designated invalid instruction)
    Invalid,
    /// Out of gas
    OutOfGas,
    /// Any other execution error reported by the node
    Error,
}

impl RevertKind {
    /// Classify a node-reported step error.
    pub fn from_error(error: &str) -> Self {
        if error.to_ascii_lowercase().contains("gas") {
            Self::OutOfGas
        } else {
            Self::Error
        }
    }
}

/// The warning attached to the current step when the enclosing call path failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevertReason {
    /// Nothing on the call path failed
    #[default]
    None,
    /// The current frame reverted
    Reverted,
    /// The current frame ran out of gas
    OutOfGas,
    /// An ancestor frame failed
    ParentHasThrown,
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::None => "",
            Self::Reverted => "reverted",
            Self::OutOfGas => "outofgas",
            Self::ParentHasThrown => "parenthasthrown",
        };
        write!(f, "{reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_kind_from_opcode() {
        assert_eq!(CallKind::from_opcode(OpCode::DELEGATECALL), Some(CallKind::DelegateCall));
        assert_eq!(CallKind::from_opcode(OpCode::CREATE2), Some(CallKind::Create2));
        assert_eq!(CallKind::from_opcode(OpCode::ADD), None);
        assert!(CallKind::Create.is_create());
        assert!(CallKind::DelegateCall.keeps_caller_storage());
        assert!(!CallKind::StaticCall.keeps_caller_storage());
    }

    #[test]
    fn test_revert_reason_strings() {
        assert_eq!(RevertReason::None.to_string(), "");
        assert_eq!(RevertReason::OutOfGas.to_string(), "outofgas");
        assert_eq!(RevertReason::ParentHasThrown.to_string(), "parenthasthrown");
        assert_eq!(RevertKind::from_error("out of gas"), RevertKind::OutOfGas);
        assert_eq!(RevertKind::from_error("stack underflow"), RevertKind::Error);
    }
}
