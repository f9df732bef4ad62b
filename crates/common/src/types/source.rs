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

use serde::{Deserialize, Serialize};

/// Source-map jump classifier of an instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JumpKind {
    /// Jump into a function (`i`)
    #[serde(rename = "i")]
    Into,
    /// Return from a function (`o`)
    #[serde(rename = "o")]
    Out,
    /// Any other instruction (`-`)
    #[default]
    #[serde(rename = "-")]
    Regular,
}

impl JumpKind {
    /// Parse the single-character source-map field.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::Into),
            'o' => Some(Self::Out),
            '-' => Some(Self::Regular),
            _ => None,
        }
    }
}

impl fmt::Display for JumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Self::Into => 'i',
            Self::Out => 'o',
            Self::Regular => '-',
        };
        write!(f, "{c}")
    }
}

/// A byte range inside one source file, as produced by a solc source map.
///
/// `file == None` marks compiler-generated code with no source counterpart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Byte offset of the range start
    pub start: usize,
    /// Length of the range in bytes
    pub length: usize,
    /// Source index inside the compilation
    pub file: Option<usize>,
    /// Jump classifier of the instruction
    pub jump: JumpKind,
}

impl SourceLocation {
    /// New location.
    pub fn new(start: usize, length: usize, file: Option<usize>, jump: JumpKind) -> Self {
        Self { start, length, file, jump }
    }

    /// The location of code without any source counterpart.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Whether the location points into a real source file of a compilation
    /// with `source_count` sources.
    pub fn is_valid(&self, source_count: usize) -> bool {
        self.file.is_some_and(|file| file < source_count)
    }

    /// End offset (exclusive).
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    /// Whether `other` lies completely inside this range of the same file.
    pub fn contains(&self, other: &Self) -> bool {
        match (self.file, other.file) {
            (Some(a), Some(b)) => a == b && self.start <= other.start && other.end() <= self.end(),
            _ => false,
        }
    }

    /// Whether both locations denote the same byte range, ignoring the jump kind.
    pub fn same_range(&self, other: &Self) -> bool {
        self.start == other.start && self.length == other.length && self.file == other.file
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.file {
            Some(file) => write!(f, "{}:{}:{}:{}", self.start, self.length, file, self.jump),
            None => write!(f, "-1:-1:-1:{}", self.jump),
        }
    }
}

/// A zero-based line/column position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineColumn {
    /// Zero-based line
    pub line: usize,
    /// Zero-based column, in bytes
    pub column: usize,
}

/// The line/column span of a [`SourceLocation`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    /// Start position
    pub start: LineColumn,
    /// End position
    pub end: LineColumn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let outer = SourceLocation::new(10, 50, Some(0), JumpKind::Regular);
        let inner = SourceLocation::new(20, 5, Some(0), JumpKind::Into);
        let other_file = SourceLocation::new(20, 5, Some(1), JumpKind::Regular);

        assert!(outer.contains(&inner));
        assert!(outer.contains(&outer));
        assert!(!inner.contains(&outer));
        assert!(!outer.contains(&other_file));
        assert!(!SourceLocation::invalid().contains(&inner));
        assert!(!outer.contains(&SourceLocation::invalid()));
    }

    #[test]
    fn test_validity_and_display() {
        let loc = SourceLocation::new(3, 4, Some(1), JumpKind::Out);
        assert!(loc.is_valid(2));
        assert!(!loc.is_valid(1));
        assert!(!SourceLocation::invalid().is_valid(5));
        assert_eq!(loc.to_string(), "3:4:1:o");
        assert_eq!(SourceLocation::invalid().to_string(), "-1:-1:-1:-");
    }
}
