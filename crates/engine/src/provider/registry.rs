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

use std::{collections::HashMap, path::Path, sync::Arc};

use alloy_primitives::Address;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use tracing::info;

use super::CompilationResultProvider;
use crate::source::{CompilationOutput, CompilationUnit, ContractArtifact};

/// In-memory registry of contract artifacts keyed by deployment address.
///
/// Artifacts are parsed once when registered, so lookups during a scope build are cheap.
#[derive(Debug, Default)]
pub struct StaticCompilationProvider {
    artifacts: RwLock<HashMap<Address, Arc<ContractArtifact>>>,
}

impl StaticCompilationProvider {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register contract `name` of `unit` as the code deployed at `address`.
    pub fn register(
        &self,
        address: Address,
        unit: Arc<CompilationUnit>,
        name: &str,
    ) -> Result<Arc<ContractArtifact>> {
        let artifact = Arc::new(ContractArtifact::new(unit, name)?);
        info!(%address, contract = name, "Registered contract artifact");
        self.artifacts.write().insert(address, artifact.clone());
        Ok(artifact)
    }

    /// Register an already built artifact.
    pub fn insert(&self, address: Address, artifact: Arc<ContractArtifact>) {
        self.artifacts.write().insert(address, artifact);
    }

    /// Load a solc standard-JSON input/output pair from disk.
    pub fn load_standard_json(
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<Arc<CompilationUnit>> {
        let read = |path: &Path| -> Result<serde_json::Value> {
            let content = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .wrap_err_with(|| format!("failed to parse {}", path.display()))
        };
        let output = CompilationOutput::from_standard_json(
            &read(input.as_ref())?,
            &read(output.as_ref())?,
        )?;
        Ok(Arc::new(CompilationUnit::new(output)))
    }

    /// Addresses with a registered artifact.
    pub fn addresses(&self) -> Vec<Address> {
        self.artifacts.read().keys().copied().collect()
    }
}

#[async_trait]
impl CompilationResultProvider for StaticCompilationProvider {
    async fn compilation(&self, address: Address) -> Result<Option<Arc<ContractArtifact>>> {
        Ok(self.artifacts.read().get(&address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{addr, counter_output};

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = StaticCompilationProvider::new();
        let unit = Arc::new(CompilationUnit::new(counter_output()));
        registry.register(addr(0xaa), unit.clone(), "Counter").unwrap();

        let found = registry.compilation(addr(0xaa)).await.unwrap().unwrap();
        assert_eq!(found.name(), "Counter");
        assert!(registry.compilation(addr(0xbb)).await.unwrap().is_none());
        assert!(registry.register(addr(0xcc), unit, "Missing").is_err());
        assert_eq!(registry.addresses(), vec![addr(0xaa)]);
    }
}
