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

//! Error types of the engine.
//!
//! Input errors ([`TraceError`]) fail fast. Resolution problems during the scope
//! build are reported through [`crate::BuildOutcome`], and decode failures
//! ([`DecodeError`]) are rendered inline next to the variable they concern.

use thiserror::Error;

/// Errors raised while loading or querying a trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// No trace provider is configured
    #[error("no trace provider configured")]
    NoProvider,

    /// The transaction executed no instruction
    #[error("not a contract invocation: the trace has no steps")]
    NotAContractInvocation,

    /// A step index beyond the end of the trace
    #[error("step {step} is out of range (trace length {length})")]
    StepOutOfRange {
        /// Requested step
        step: usize,
        /// Number of steps in the trace
        length: usize,
    },

    /// No trace is loaded
    #[error("no trace available")]
    NotLoaded,

    /// The trace provider failed
    #[error("trace provider failed: {0}")]
    Provider(eyre::Report),

    /// The trace is not well-formed
    #[error("malformed trace: {0}")]
    Malformed(String),
}

/// Errors aborting a scope-tree build. Reported as [`crate::BuildOutcome::BuildFailed`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// A step could not be mapped to source
    #[error(transparent)]
    Resolve(#[from] crate::source::ResolveError),

    /// The trace query failed
    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// Errors raised while decoding a single variable.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No variable with this id exists
    #[error("unknown variable {0}")]
    UnknownVariable(usize),

    /// The variable is not of the requested kind
    #[error("variable {0} is not a {1} variable")]
    WrongKind(usize, &'static str),

    /// The stack slot does not exist at this step
    #[error("no stack found at depth {depth} (stack height {height})")]
    NoStack {
        /// Slot the variable was expected in
        depth: usize,
        /// Actual stack height
        height: usize,
    },

    /// The type is not supported at this location
    #[error("unsupported type {0}")]
    UnsupportedType(String),

    /// A memory or calldata read went past the end of the buffer
    #[error("read of {length} bytes at offset {offset} is out of bounds")]
    OutOfBounds {
        /// Start offset
        offset: usize,
        /// Requested length
        length: usize,
    },

    /// Reading storage failed
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// ABI decoding of calldata failed
    #[error("ABI decoding failed: {0}")]
    Abi(#[from] alloy_dyn_abi::Error),

    /// No compilation data is available for the contract
    #[error("no compilation data for {0}")]
    NoCompilation(alloy_primitives::Address),

    /// The trace query failed
    #[error(transparent)]
    Trace(#[from] TraceError),
}
