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

//! TDB engine: post-hoc debugging of EVM struct-log traces.
//!
//! A [`Debugger`] loads the trace of one transaction through the [`TraceStore`],
//! reconstructs its call frames ([`TraceAnalysis`]), builds a tree of call and function
//! scopes with source mappings ([`ScopeTree`]), and lets callers step through it
//! ([`StepNavigator`]) and decode variables at any step ([`VariableDecoder`]).

pub mod debugger;
pub use debugger::*;

pub mod decode;
pub use decode::*;

pub mod error;
pub use error::*;

pub mod events;
pub use events::*;

pub mod navigator;
pub use navigator::*;

pub mod provider;
pub use provider::*;

pub mod scope;
pub use scope::*;

pub mod source;
pub use source::*;

pub mod trace;
pub use trace::*;

pub mod utils;
pub use utils::*;

#[cfg(test)]
pub(crate) mod test_utils;
