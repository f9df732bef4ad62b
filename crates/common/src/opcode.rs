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

use std::collections::HashMap;

use once_cell::sync::Lazy;
use revm::bytecode::OpCode;

/// Mnemonic to opcode table, including the historical names nodes still emit
/// in struct logs (`SHA3`, `DIFFICULTY`/`PREVRANDAO`).
static OPCODES_BY_NAME: Lazy<HashMap<&'static str, OpCode>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, OpCode> =
        (0..=u8::MAX).filter_map(OpCode::new).map(|op| (op.as_str(), op)).collect();
    if let Some(op) = OpCode::new(0x20) {
        table.insert("SHA3", op);
        table.insert("KECCAK256", op);
    }
    if let Some(op) = OpCode::new(0x44) {
        table.insert("DIFFICULTY", op);
        table.insert("PREVRANDAO", op);
    }
    table
});

/// Parse an opcode mnemonic as it appears in a struct log (`"PUSH1"`, `"SHA3"`, ...).
///
/// Returns `None` for mnemonics unknown to the bundled EVM definition.
pub fn opcode_from_name(name: &str) -> Option<OpCode> {
    OPCODES_BY_NAME.get(name).copied()
}

/// Extended trait for EVM opcode analysis
///
/// Classifies opcodes the way a post-hoc trace debugger needs them: which
/// ones open call frames, which ones end execution abnormally and how they
/// shuffle the stack.
pub trait OpcodeTr {
    /// Check if this opcode is a message call (`CALL`, `CALLCODE`, `DELEGATECALL`, `STATICCALL`)
    fn is_call(&self) -> bool;

    /// Check if this opcode creates a contract (`CREATE`, `CREATE2`)
    fn is_create(&self) -> bool;

    /// Check if this opcode may open a new call frame
    fn is_call_class(&self) -> bool {
        self.is_call() || self.is_create()
    }

    /// Check if this opcode aborts the current frame and discards its state
    ///
    /// ```rust
    /// use revm::bytecode::OpCode;
    /// use tdb_common::OpcodeTr;
    ///
    /// assert!(OpCode::REVERT.is_revert_class());
    /// assert!(OpCode::INVALID.is_revert_class());
    /// assert!(!OpCode::RETURN.is_revert_class());
    /// ```
    fn is_revert_class(&self) -> bool;

    /// Check if this opcode ends the current frame successfully
    fn is_halt(&self) -> bool;

    /// Returns `n` for `DUPn`
    fn dup_depth(&self) -> Option<usize>;

    /// Returns `n` for `SWAPn`
    fn swap_depth(&self) -> Option<usize>;
}

impl OpcodeTr for OpCode {
    fn is_call(&self) -> bool {
        matches!(*self, Self::CALL | Self::CALLCODE | Self::DELEGATECALL | Self::STATICCALL)
    }

    fn is_create(&self) -> bool {
        matches!(*self, Self::CREATE | Self::CREATE2)
    }

    fn is_revert_class(&self) -> bool {
        matches!(*self, Self::REVERT | Self::INVALID)
    }

    fn is_halt(&self) -> bool {
        matches!(*self, Self::STOP | Self::RETURN | Self::SELFDESTRUCT)
    }

    fn dup_depth(&self) -> Option<usize> {
        let byte = self.get();
        (0x80..=0x8f).contains(&byte).then(|| (byte - 0x7f) as usize)
    }

    fn swap_depth(&self) -> Option<usize> {
        let byte = self.get();
        (0x90..=0x9f).contains(&byte).then(|| (byte - 0x8f) as usize)
    }
}
