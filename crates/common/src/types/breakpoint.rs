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

use std::{fmt::Display, path::PathBuf, str::FromStr};

use alloy_primitives::Address;
use eyre::{bail, eyre, Error, Result};
use serde::{Deserialize, Serialize};

/// A breakpoint, either on a source line or on a specific instruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Breakpoint {
    /// A breakpoint on a source line.
    Source {
        /// Path of the source file, as named in the compiler output.
        file_path: PathBuf,
        /// Line number in the source file (1-based).
        line_number: usize,
    },
    /// A breakpoint at a specific opcode position.
    Opcode {
        /// The address of the bytecode contract.
        bytecode_address: Address,
        /// Program counter (PC) position in the bytecode.
        pc: usize,
    },
}

impl FromStr for Breakpoint {
    type Err = Error;

    /// Parses a breakpoint from a string in the format:
    /// - `[@]<addr>:<pc>` for opcode breakpoints
    /// - `[@]<path>:<line>` for source breakpoints
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);
        let Some((head, tail)) = trimmed.rsplit_once(':') else {
            bail!("Invalid breakpoint format. Expected <addr>:<pc> or <path>:<line>, got: {s}")
        };
        if head.is_empty() {
            bail!("Invalid breakpoint format. Missing address or path in: {s}");
        }

        if head.starts_with("0x") && !head.contains(['/', '.']) {
            let bytecode_address =
                head.parse::<Address>().map_err(|e| eyre!("Invalid address: {e}"))?;
            let pc = tail.parse::<usize>().map_err(|e| eyre!("Invalid PC: {e}"))?;
            Ok(Self::Opcode { bytecode_address, pc })
        } else {
            let line_number =
                tail.parse::<usize>().map_err(|e| eyre!("Invalid line number: {e}"))?;
            if line_number == 0 {
                bail!("Line numbers start at 1");
            }
            Ok(Self::Source { file_path: PathBuf::from(head), line_number })
        }
    }
}

impl Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opcode { bytecode_address, pc } => {
                let full_addr = format!("{bytecode_address}");
                write!(f, "@{}...{}:{pc}", &full_addr[..8], &full_addr[full_addr.len() - 6..])
            }
            Self::Source { file_path, line_number } => {
                write!(f, "@{}:{line_number}", file_path.display())
            }
        }
    }
}

impl Breakpoint {
    /// Whether a source breakpoint names `path`. Either side may be a suffix of the other,
    /// so `Token.sol` matches `src/Token.sol`.
    pub fn matches_file(&self, path: &str) -> bool {
        match self {
            Self::Source { file_path, .. } => {
                let bp = file_path.to_string_lossy();
                path == bp || path.ends_with(&format!("/{bp}")) || bp.ends_with(&format!("/{path}"))
            }
            Self::Opcode { .. } => false,
        }
    }
}
