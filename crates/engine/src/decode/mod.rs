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

//! Variable Decoders.
//!
//! Locals are found on the stack through a symbolic replay of their scope and then
//! decoded from the stack word itself or from the memory, calldata or storage it points
//! to. State variables are decoded from the contract's storage layout. Failures are
//! reported inline as [`DecodedValue::Error`] so one bad variable never hides the others.

use std::sync::Arc;

use alloy_primitives::Address;
use tdb_common::types::{DecodedValue, DecodedVariable, VariableValue};
use tracing::{debug, warn};

use crate::{
    error::DecodeError,
    provider::StorageProvider,
    scope::{ScopeTree, Variable, VariableId, VariableKind},
    trace::TraceAnalysis,
};

mod local;
pub(crate) use local::DecodeContext;

mod storage;
pub use storage::StorageViewer;
use storage::StorageDecoder;

mod symbolic;

mod types;
pub use types::*;

/// Default cap on decoded array elements and mapping entries.
pub const DEFAULT_MAX_ARRAY_ELEMENTS: usize = 1024;

/// Decodes the variables of one analysed trace.
#[derive(Clone)]
pub struct VariableDecoder {
    trace: Arc<TraceAnalysis>,
    tree: Arc<ScopeTree>,
    storage: Option<Arc<dyn StorageProvider>>,
    max_array_elements: usize,
}

impl std::fmt::Debug for VariableDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableDecoder")
            .field("steps", &self.trace.len())
            .field("variables", &self.tree.variables().len())
            .field("has_storage", &self.storage.is_some())
            .field("max_array_elements", &self.max_array_elements)
            .finish()
    }
}

impl VariableDecoder {
    /// Decoder over `trace` and its scope tree. Without `storage`, untouched slots fail to decode.
    pub fn new(
        trace: Arc<TraceAnalysis>,
        tree: Arc<ScopeTree>,
        storage: Option<Arc<dyn StorageProvider>>,
    ) -> Self {
        Self { trace, tree, storage, max_array_elements: DEFAULT_MAX_ARRAY_ELEMENTS }
    }

    pub fn with_max_array_elements(mut self, max: usize) -> Self {
        self.max_array_elements = max;
        self
    }

    /// Storage of `address` as seen at `step`.
    pub fn storage_viewer(&self, step: usize, address: Address) -> StorageViewer {
        StorageViewer::new(self.trace.clone(), step, address, self.storage.clone())
    }

    /// Decode local variable `id` at `step`.
    pub async fn decode_local_variable_by_id(&self, step: usize, id: VariableId) -> DecodedValue {
        match self.tree.variable(id) {
            Some(variable) => render(variable, self.try_decode_local(step, variable).await),
            None => unknown(id),
        }
    }

    /// Decode state variable `id` at `step`.
    pub async fn decode_state_variable_by_id(&self, step: usize, id: VariableId) -> DecodedValue {
        match self.tree.variable(id) {
            Some(variable) => render(variable, self.try_decode_state(step, variable).await),
            None => unknown(id),
        }
    }

    /// Every local in scope at `step`, ordered by stack position.
    pub async fn decode_locals_at(&self, step: usize) -> Vec<DecodedVariable> {
        let mut decoded = Vec::new();
        for variable in self.tree.locals_at(step) {
            decoded.push(DecodedVariable {
                name: variable.name.clone(),
                decoded: render(variable, self.try_decode_local(step, variable).await),
            });
        }
        decoded
    }

    /// The state variables of the storage context executing at `step`.
    pub async fn decode_state_at(&self, step: usize) -> Vec<DecodedVariable> {
        let address = match self.trace.storage_address_at(step) {
            Ok(address) => address,
            Err(err) => {
                debug!(step, "No storage context: {err}");
                return Vec::new();
            }
        };
        let mut decoded = Vec::new();
        for variable in self.tree.state_variables(&address) {
            decoded.push(DecodedVariable {
                name: variable.name.clone(),
                decoded: render(variable, self.try_decode_state(step, variable).await),
            });
        }
        decoded
    }

    async fn try_decode_local(&self, step: usize, variable: &Variable) -> Result<VariableValue, DecodeError> {
        if variable.kind == VariableKind::State {
            return Err(DecodeError::WrongKind(variable.id.index(), "local"));
        }
        let stack = self.trace.stack_at(step)?;
        let (ty, location) = parse_type_string(&variable.type_string)?;

        let index = symbolic::locate(&self.trace, &self.tree, variable, step).unwrap_or_else(|| {
            warn!(
                name = %variable.name,
                step,
                depth = variable.stack_depth,
                "Lost track of variable on the stack, using its declaration slot"
            );
            variable.stack_depth
        });
        let word = *stack
            .get(index)
            .ok_or(DecodeError::NoStack { depth: index, height: stack.len() })?;

        let artifact = self
            .tree
            .artifact(&variable.code_address)
            .ok_or(DecodeError::NoCompilation(variable.code_address))?;
        let ctx = DecodeContext { ast: &artifact.unit().ast, max_elements: self.max_array_elements };

        match location {
            DataLocation::Stack => local::decode_word(&ty, word, ctx.ast),
            DataLocation::Memory => local::decode_memory(&ty, self.trace.memory_at(step)?, word, ctx),
            DataLocation::Calldata => {
                let length = match ty {
                    VariableType::Bytes | VariableType::String | VariableType::Array(_, None) => {
                        Some(*stack.get(index + 1).ok_or(DecodeError::NoStack {
                            depth: index + 1,
                            height: stack.len(),
                        })?)
                    }
                    _ => None,
                };
                local::decode_calldata(&ty, self.trace.calldata_at(step)?, word, length, ctx)
            }
            DataLocation::Storage => {
                let layout = artifact.storage_layout().ok_or_else(|| {
                    DecodeError::Storage(format!("no storage layout for {}", artifact.name()))
                })?;
                let viewer = self.storage_viewer(step, self.trace.storage_address_at(step)?);
                let decoder = StorageDecoder::new(&viewer, layout, ctx);
                let (label, _) = strip_location(&variable.type_string);
                let type_id = decoder.type_id_by_label(label).ok_or_else(|| {
                    DecodeError::UnsupportedType(format!("{label} is not in the storage layout"))
                })?;
                decoder.decode(type_id, word, 0).await
            }
        }
    }

    async fn try_decode_state(&self, step: usize, variable: &Variable) -> Result<VariableValue, DecodeError> {
        let slot = variable
            .storage
            .as_ref()
            .filter(|_| variable.kind == VariableKind::State)
            .ok_or(DecodeError::WrongKind(variable.id.index(), "state"))?;
        self.trace.step(step)?;

        let artifact = self
            .tree
            .artifact(&variable.code_address)
            .ok_or(DecodeError::NoCompilation(variable.code_address))?;
        let layout = artifact
            .storage_layout()
            .ok_or_else(|| DecodeError::Storage(format!("no storage layout for {}", artifact.name())))?;
        let ctx = DecodeContext { ast: &artifact.unit().ast, max_elements: self.max_array_elements };

        let viewer = self.storage_viewer(step, variable.address);
        StorageDecoder::new(&viewer, layout, ctx).decode(&slot.type_id, slot.slot, slot.offset).await
    }
}

fn render(variable: &Variable, result: Result<VariableValue, DecodeError>) -> DecodedValue {
    let ty = variable.type_string.clone();
    match result {
        Ok(value) => DecodedValue::Value { ty, value },
        Err(err) => {
            debug!(name = %variable.name, "Decoding failed: {err}");
            DecodedValue::Error { ty, error: err.to_string() }
        }
    }
}

fn unknown(id: VariableId) -> DecodedValue {
    DecodedValue::Error { ty: String::new(), error: DecodeError::UnknownVariable(id.index()).to_string() }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy_primitives::U256;
    use async_trait::async_trait;
    use tdb_common::types::TxContext;

    use super::*;
    use crate::{
        provider::StaticCompilationProvider,
        scope::build_scope_tree,
        test_utils::*,
    };

    struct PreTxStorage(AtomicUsize);

    #[async_trait]
    impl StorageProvider for PreTxStorage {
        async fn storage_before(&self, _: &TxContext, address: Address, slot: U256) -> eyre::Result<U256> {
            assert_eq!((address, slot), (addr(0xaa), U256::ZERO));
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(U256::from(5))
        }
    }

    async fn counter_decoder(storage: Option<Arc<dyn StorageProvider>>) -> VariableDecoder {
        let trace = Arc::new(TraceAnalysis::analyse(tx_to(addr(0xaa)), &counter_trace()).unwrap());
        let registry = StaticCompilationProvider::new();
        registry.insert(addr(0xaa), counter_artifact());
        let outcome = build_scope_tree(trace.clone(), Arc::new(registry), true).await;
        VariableDecoder::new(trace, outcome.tree().unwrap().clone(), storage)
    }

    fn id_of(decoder: &VariableDecoder, name: &str) -> VariableId {
        decoder.tree.variables().iter().find(|v| v.name == name).unwrap().id
    }

    fn uint(v: u64) -> Option<VariableValue> {
        Some(VariableValue::Uint(U256::from(v)))
    }

    #[tokio::test]
    async fn test_decode_counter_locals() {
        let decoder = counter_decoder(None).await;
        let total = id_of(&decoder, "total");

        let decoded = decoder.decode_local_variable_by_id(21, total).await;
        assert_eq!(decoded.ty(), "uint256");
        assert_eq!(decoded.value().cloned(), uint(12));

        let locals = decoder.decode_locals_at(10).await;
        let values: Vec<_> = locals.iter().map(|v| (v.name.as_str(), v.decoded.value().cloned())).collect();
        assert_eq!(values, [("by", uint(7)), ("total", uint(0)), ("next", uint(12))]);

        // A state variable asked for as a local.
        let count = id_of(&decoder, "count");
        let wrong = decoder.decode_local_variable_by_id(10, count).await;
        assert!(matches!(wrong, DecodedValue::Error { ref error, .. } if error.contains("not a local")));

        let missing = decoder.decode_local_variable_by_id(10, VariableId::from(99)).await;
        assert!(matches!(missing, DecodedValue::Error { ref error, .. } if error == "unknown variable 99"));
    }

    #[tokio::test]
    async fn test_decode_counter_state() {
        let provider = Arc::new(PreTxStorage(AtomicUsize::new(0)));
        let decoder = counter_decoder(Some(provider.clone())).await;
        let count = id_of(&decoder, "count");

        // Before the SSTORE at step 13 the value predates the transaction.
        assert_eq!(decoder.decode_state_variable_by_id(6, count).await.value().cloned(), uint(5));
        assert_eq!(decoder.decode_state_variable_by_id(24, count).await.value().cloned(), uint(12));
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);

        let state = decoder.decode_state_at(24).await;
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].name, "count");
        assert_eq!(state[0].decoded.value().cloned(), uint(12));
    }

    #[tokio::test]
    async fn test_missing_storage_is_inline_error() {
        let decoder = counter_decoder(None).await;
        let count = id_of(&decoder, "count");
        let decoded = decoder.decode_state_variable_by_id(6, count).await;
        assert_eq!(decoded.ty(), "uint256");
        assert!(matches!(decoded, DecodedValue::Error { ref error, .. } if error.contains("no storage provider")));

        let local = decoder.decode_state_variable_by_id(6, id_of(&decoder, "by")).await;
        assert!(matches!(local, DecodedValue::Error { ref error, .. } if error.contains("not a state")));
    }
}
