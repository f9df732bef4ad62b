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

//! solc source maps.
//!
//! A source map is a `;`-separated list with one `s:l:f:j:m` entry per instruction.
//! Empty fields (and missing trailing fields) repeat the previous entry's value, and
//! `f == -1` marks code with no source counterpart.

use revm::bytecode::OpCode;
use tdb_common::types::{JumpKind, SourceLocation};
use thiserror::Error;

use super::compilation::BytecodeOutput;

/// Source-map related failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceMapError {
    /// A field could not be parsed
    #[error("invalid source map entry {index}: {reason}")]
    InvalidEntry {
        /// Entry position
        index: usize,
        /// What was wrong
        reason: String,
    },
    /// The pc is not the start of an instruction
    #[error("pc {0} is not an instruction boundary")]
    NotAnInstruction(usize),
    /// The source map is shorter than the code
    #[error("no source map entry for instruction {0}")]
    MissingEntry(usize),
}

/// Decompress a solc source map.
pub fn parse_source_map(map: &str) -> Result<Vec<SourceLocation>, SourceMapError> {
    if map.is_empty() {
        return Ok(Vec::new());
    }

    let mut locations = Vec::new();
    let (mut start, mut length, mut file, mut jump) = (-1i64, -1i64, -1i64, JumpKind::Regular);

    for (index, entry) in map.split(';').enumerate() {
        let invalid = |reason: String| SourceMapError::InvalidEntry { index, reason };
        for (field, value) in entry.split(':').enumerate() {
            if value.is_empty() {
                continue;
            }
            match field {
                0 => start = value.parse().map_err(|_| invalid(format!("start {value:?}")))?,
                1 => length = value.parse().map_err(|_| invalid(format!("length {value:?}")))?,
                2 => file = value.parse().map_err(|_| invalid(format!("file {value:?}")))?,
                3 => {
                    jump = value
                        .chars()
                        .next()
                        .and_then(JumpKind::from_char)
                        .ok_or_else(|| invalid(format!("jump {value:?}")))?
                }
                // Modifier depth
                4 => {}
                _ => return Err(invalid("too many fields".into())),
            }
        }

        locations.push(if start < 0 || length < 0 || file < 0 {
            SourceLocation { jump, ..SourceLocation::invalid() }
        } else {
            SourceLocation::new(start as usize, length as usize, Some(file as usize), jump)
        });
    }
    Ok(locations)
}

/// For every byte of `code`, the index of the instruction starting there.
pub fn instruction_indices(code: &[u8]) -> Vec<Option<usize>> {
    let mut indices = vec![None; code.len()];
    let (mut pc, mut index) = (0, 0);
    while pc < code.len() {
        indices[pc] = Some(index);
        let immediate = OpCode::new(code[pc]).map(|op| op.info().immediate_size()).unwrap_or(0);
        pc += 1 + immediate as usize;
        index += 1;
    }
    indices
}

/// Source locations of one code object addressed by pc.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    locations: Vec<SourceLocation>,
    pc_to_index: Vec<Option<usize>>,
}

impl CodeMap {
    /// Parse the source map of `code` and index its instructions.
    pub fn new(code: &BytecodeOutput) -> Result<Self, SourceMapError> {
        Ok(Self {
            locations: parse_source_map(&code.source_map)?,
            pc_to_index: instruction_indices(&code.object),
        })
    }

    /// Instruction index of `pc`.
    pub fn instruction_index(&self, pc: usize) -> Result<usize, SourceMapError> {
        self.pc_to_index.get(pc).copied().flatten().ok_or(SourceMapError::NotAnInstruction(pc))
    }

    /// Location of the instruction with index `index`.
    pub fn location_at_index(&self, index: usize) -> Result<SourceLocation, SourceMapError> {
        self.locations.get(index).copied().ok_or(SourceMapError::MissingEntry(index))
    }

    /// Location of the instruction at `pc`.
    pub fn location_at_pc(&self, pc: usize) -> Result<SourceLocation, SourceMapError> {
        self.location_at_index(self.instruction_index(pc)?)
    }

    /// Number of instructions covered by the source map.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_entries_inherit() {
        let map = parse_source_map("1:2:0:-;:3;;5::1:i;-1:-1:-1:o;:::-:1").unwrap();
        assert_eq!(map.len(), 6);
        assert_eq!(map[0], SourceLocation::new(1, 2, Some(0), JumpKind::Regular));
        assert_eq!(map[1], SourceLocation::new(1, 3, Some(0), JumpKind::Regular));
        assert_eq!(map[2], map[1]);
        assert_eq!(map[3], SourceLocation::new(5, 3, Some(1), JumpKind::Into));
        assert_eq!(map[4].file, None);
        assert_eq!(map[4].jump, JumpKind::Out);
        // Inherits -1 values from the previous entry.
        assert_eq!(map[5].file, None);
        assert_eq!(map[5].jump, JumpKind::Regular);
    }

    #[test]
    fn test_invalid_entries() {
        assert!(matches!(
            parse_source_map("1:2:0:x"),
            Err(SourceMapError::InvalidEntry { index: 0, .. })
        ));
        assert!(matches!(
            parse_source_map("1:2:0:-;a"),
            Err(SourceMapError::InvalidEntry { index: 1, .. })
        ));
        assert!(parse_source_map("").unwrap().is_empty());
    }

    #[test]
    fn test_instruction_indices_skip_push_data() {
        // PUSH1 0x80 PUSH2 0x0102 ADD STOP
        let code = [0x60, 0x80, 0x61, 0x01, 0x02, 0x01, 0x00];
        let indices = instruction_indices(&code);
        assert_eq!(indices, vec![Some(0), None, Some(1), None, None, Some(2), Some(3)]);
    }

    #[test]
    fn test_code_map_lookup() {
        let code = BytecodeOutput {
            object: vec![0x60, 0x80, 0x00].into(),
            source_map: "0:10:0:-;12:3".into(),
        };
        let map = CodeMap::new(&code).unwrap();
        assert_eq!(map.location_at_pc(2).unwrap().start, 12);
        assert_eq!(map.location_at_pc(1), Err(SourceMapError::NotAnInstruction(1)));
        assert_eq!(map.location_at_pc(99), Err(SourceMapError::NotAnInstruction(99)));
        assert_eq!(map.location_at_index(5), Err(SourceMapError::MissingEntry(5)));
    }
}
