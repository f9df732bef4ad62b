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

//! TDB Common - types and utilities shared by TDB components
//!
//! This crate holds the raw struct-log types, source locations, decoded
//! values and breakpoints, plus the file cache, logging setup and opcode
//! helpers used by both the engine and the `tdb` binary.

/// Common types used throughout TDB including struct logs, source locations and decoded values
pub mod types;

/// Caching utilities for storing fetched traces on disk
pub mod cache;
/// Environment variable names read by TDB
pub mod env;
/// Logging setup and utilities for consistent logging across TDB components
pub mod logging;
/// Opcode classification helpers for struct-log analysis
pub mod opcode;

pub use cache::*;
pub use logging::*;
pub use opcode::*;
