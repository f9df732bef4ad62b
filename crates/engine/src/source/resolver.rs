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

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::Address;
use tdb_common::types::{LineColumn, LineRange, SourceLocation};
use thiserror::Error;

use super::{ContractArtifact, SourceFile, SourceMapError};
use crate::{error::TraceError, trace::TraceAnalysis};

/// Why a step could not be mapped to source.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The trace query failed
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// The source map has no entry for the step's pc
    #[error("cannot map step {step} of {address} to source: {source}")]
    SourceMap {
        /// Code address
        address: Address,
        /// Step index
        step: usize,
        /// Underlying failure
        source: SourceMapError,
    },
}

/// Maps trace steps to source ranges.
pub trait SourceLocationResolver: Send + Sync {
    /// Raw source-map location of `step`, executing code at `address`. Code without
    /// compilation data resolves to [`SourceLocation::invalid`].
    fn location_from_step(&self, address: Address, step: usize)
        -> Result<SourceLocation, ResolveError>;

    /// The closest location at or before `step`, within code at `address`, that points into
    /// a real source file.
    fn valid_location_from_step(
        &self,
        address: Address,
        step: usize,
    ) -> Result<Option<SourceLocation>, ResolveError>;

    /// Location of the `index`-th instruction of the init code (`creation`) or deployed
    /// code at `address`.
    fn location_from_instruction_index(
        &self,
        address: Address,
        index: usize,
        creation: bool,
    ) -> Result<SourceLocation, ResolveError>;
}

/// Converts byte ranges to line/column ranges.
pub trait OffsetToLineColumnConverter: Send + Sync {
    /// Line/column span of `location`, `None` if it points nowhere.
    fn offset_to_line_column(&self, location: &SourceLocation) -> Option<LineRange>;
}

/// Line start offsets of every source of a compilation.
#[derive(Debug, Clone, Default)]
pub struct LineConverter {
    line_starts: Vec<Vec<usize>>,
}

impl LineConverter {
    /// Precompute line starts for `sources`.
    pub fn new(sources: &[SourceFile]) -> Self {
        let line_starts = sources
            .iter()
            .map(|source| {
                std::iter::once(0)
                    .chain(source.content.match_indices('\n').map(|(i, _)| i + 1))
                    .collect()
            })
            .collect();
        Self { line_starts }
    }

    /// Zero-based line and column of byte `offset` in source `file`.
    pub fn position(&self, file: usize, offset: usize) -> Option<LineColumn> {
        let starts = self.line_starts.get(file)?;
        let line = starts.partition_point(|start| *start <= offset).checked_sub(1)?;
        Some(LineColumn { line, column: offset - starts[line] })
    }
}

impl OffsetToLineColumnConverter for LineConverter {
    fn offset_to_line_column(&self, location: &SourceLocation) -> Option<LineRange> {
        let file = location.file?;
        Some(LineRange {
            start: self.position(file, location.start)?,
            end: self.position(file, location.end())?,
        })
    }
}

/// [`SourceLocationResolver`] backed by solc source maps.
#[derive(Debug, Clone)]
pub struct SourceMapResolver {
    trace: Arc<TraceAnalysis>,
    artifacts: HashMap<Address, Arc<ContractArtifact>>,
}

impl SourceMapResolver {
    /// New resolver over `trace`, with the artifacts of the code addresses it runs.
    pub fn new(trace: Arc<TraceAnalysis>, artifacts: HashMap<Address, Arc<ContractArtifact>>) -> Self {
        Self { trace, artifacts }
    }

    /// Artifact of the code at `address`.
    pub fn artifact(&self, address: &Address) -> Option<&Arc<ContractArtifact>> {
        self.artifacts.get(address)
    }

    /// All known artifacts.
    pub fn artifacts(&self) -> &HashMap<Address, Arc<ContractArtifact>> {
        &self.artifacts
    }
}

impl SourceLocationResolver for SourceMapResolver {
    fn location_from_step(
        &self,
        address: Address,
        step: usize,
    ) -> Result<SourceLocation, ResolveError> {
        let Some(artifact) = self.artifacts.get(&address) else {
            return Ok(SourceLocation::invalid());
        };
        let pc = self.trace.step(step)?.pc;
        let creation = self.trace.is_creation_step(step)?;
        artifact
            .code_map(creation)
            .location_at_pc(pc)
            .map_err(|source| ResolveError::SourceMap { address, step, source })
    }

    fn valid_location_from_step(
        &self,
        address: Address,
        step: usize,
    ) -> Result<Option<SourceLocation>, ResolveError> {
        let Some(artifact) = self.artifacts.get(&address) else {
            return Ok(None);
        };
        let sources = artifact.source_count();
        for s in (0..=step).rev() {
            if self.trace.address_at(s)? != address {
                continue;
            }
            let location = self.location_from_step(address, s)?;
            if location.is_valid(sources) {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    fn location_from_instruction_index(
        &self,
        address: Address,
        index: usize,
        creation: bool,
    ) -> Result<SourceLocation, ResolveError> {
        let Some(artifact) = self.artifacts.get(&address) else {
            return Ok(SourceLocation::invalid());
        };
        artifact
            .code_map(creation)
            .location_at_index(index)
            .map_err(|source| ResolveError::SourceMap { address, step: index, source })
    }
}
