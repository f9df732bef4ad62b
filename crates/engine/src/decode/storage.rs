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

//! Storage as of a step, and decoding of values laid out by a solc storage layout.

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{keccak256, Address, Bytes, U256};
use futures::{future::BoxFuture, FutureExt};
use itertools::Itertools;
use parking_lot::Mutex;
use tdb_common::types::{MappingEntry, StructMember, VariableValue};
use tracing::{debug, trace};

use super::{
    local::{decode_word, DecodeContext},
    types::{low_mask, parse_type_string, VariableType},
};
use crate::{
    error::DecodeError,
    provider::StorageProvider,
    source::{StorageLayout, StorageType},
    trace::TraceAnalysis,
};

/// Read-only view of one account's storage at one step.
///
/// A slot is resolved from the last write in the trace that is still in effect at the
/// step. Slots the trace never wrote come from the storage provider, unless the account
/// was created earlier in the transaction, in which case they are zero. Results are
/// memoised per viewer.
pub struct StorageViewer {
    trace: Arc<TraceAnalysis>,
    step: usize,
    address: Address,
    provider: Option<Arc<dyn StorageProvider>>,
    cache: Mutex<HashMap<U256, U256>>,
}

impl std::fmt::Debug for StorageViewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageViewer")
            .field("step", &self.step)
            .field("address", &self.address)
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl StorageViewer {
    /// View of `address`'s storage as execution reaches `step`.
    pub fn new(
        trace: Arc<TraceAnalysis>,
        step: usize,
        address: Address,
        provider: Option<Arc<dyn StorageProvider>>,
    ) -> Self {
        Self { trace, step, address, provider, cache: Mutex::new(HashMap::new()) }
    }

    /// Step the storage is viewed at.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Storage address viewed.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The trace the storage is rebuilt from.
    pub fn trace(&self) -> &TraceAnalysis {
        &self.trace
    }

    /// Value of `slot` when execution reaches the step.
    pub async fn slot(&self, slot: U256) -> Result<U256, DecodeError> {
        if let Some(value) = self.cache.lock().get(&slot) {
            return Ok(*value);
        }

        let value = match self.last_write(slot) {
            Some(value) => value,
            None if self.trace.created_before(self.address, self.step) => U256::ZERO,
            None => {
                let provider = self
                    .provider
                    .as_ref()
                    .ok_or_else(|| DecodeError::Storage("no storage provider configured".into()))?;
                trace!(address = %self.address, %slot, "Fetching storage from provider");
                provider
                    .storage_before(self.trace.tx(), self.address, slot)
                    .await
                    .map_err(|err| DecodeError::Storage(err.to_string()))?
            }
        };
        self.cache.lock().insert(slot, value);
        Ok(value)
    }

    /// Slots written by the transaction and in effect at the step, with their values.
    pub fn modified_slots(&self) -> HashMap<U256, U256> {
        self.trace
            .storage_writes()
            .iter()
            .filter(|w| w.address == self.address && w.visible_at(self.step))
            .map(|w| (w.slot, w.value))
            .collect()
    }

    fn last_write(&self, slot: U256) -> Option<U256> {
        self.trace
            .storage_writes()
            .iter()
            .rev()
            .find(|w| w.address == self.address && w.slot == slot && w.visible_at(self.step))
            .map(|w| w.value)
    }
}

/// Walks a storage layout type table, reading slots through a [`StorageViewer`].
pub(crate) struct StorageDecoder<'a> {
    viewer: &'a StorageViewer,
    layout: &'a StorageLayout,
    ctx: DecodeContext<'a>,
}

impl<'a> StorageDecoder<'a> {
    pub(crate) fn new(viewer: &'a StorageViewer, layout: &'a StorageLayout, ctx: DecodeContext<'a>) -> Self {
        Self { viewer, layout, ctx }
    }

    /// The type table entry whose label is `label`, e.g. `struct Vault.Position`.
    pub(crate) fn type_id_by_label(&self, label: &str) -> Option<&'a str> {
        self.layout.types.iter().find(|(_, ty)| ty.label == label).map(|(id, _)| id.as_str())
    }

    /// Decode the value of layout type `type_id` stored at `slot`, starting `offset`
    /// bytes from the low-order end of the slot.
    pub(crate) fn decode<'b>(
        &'b self,
        type_id: &'b str,
        slot: U256,
        offset: usize,
    ) -> BoxFuture<'b, Result<VariableValue, DecodeError>> {
        async move {
            let ty = self
                .layout
                .types
                .get(type_id)
                .ok_or_else(|| DecodeError::Storage(format!("unknown layout type {type_id}")))?;
            match ty.encoding.as_str() {
                "inplace" => self.decode_inplace(ty, slot, offset).await,
                "dynamic_array" => {
                    let base = element_type(ty)?;
                    let length = self.viewer.slot(slot).await?.saturating_to::<usize>();
                    self.decode_elements(base, data_slot(slot), length).await
                }
                "bytes" => self.decode_bytes(ty, slot).await,
                "mapping" => self.decode_mapping(ty, slot).await,
                other => {
                    Err(DecodeError::UnsupportedType(format!("{} ({other} encoding)", ty.label)))
                }
            }
        }
        .boxed()
    }

    async fn decode_inplace(
        &self,
        ty: &'a StorageType,
        slot: U256,
        offset: usize,
    ) -> Result<VariableValue, DecodeError> {
        if let Some(members) = &ty.members {
            let mut decoded = Vec::with_capacity(members.len());
            for member in members {
                let member_slot =
                    member.slot().map_err(|err| DecodeError::Storage(err.to_string()))?;
                decoded.push(StructMember {
                    name: member.label.clone(),
                    value: self.decode(&member.ty, slot + member_slot, member.offset).await?,
                });
            }
            return Ok(VariableValue::Struct(decoded));
        }

        let (parsed, _) = parse_type_string(&ty.label)?;
        if let VariableType::Array(_, Some(length)) = parsed {
            return self.decode_elements(element_type(ty)?, slot, length).await;
        }

        let size = ty.size().min(32);
        let word = self.viewer.slot(slot).await?;
        let value = (word >> (offset * 8)) & low_mask(size * 8);
        let value = match &parsed {
            // bytesN is decoded from a left-aligned word.
            VariableType::Value(alloy_dyn_abi::DynSolType::FixedBytes(_)) => value << ((32 - size) * 8),
            _ => value,
        };
        decode_word(&parsed, value, self.ctx.ast)
    }

    /// Array elements starting at `start`. Elements smaller than a slot are packed.
    async fn decode_elements(
        &self,
        base: &'a str,
        start: U256,
        length: usize,
    ) -> Result<VariableValue, DecodeError> {
        let element = self
            .layout
            .types
            .get(base)
            .ok_or_else(|| DecodeError::Storage(format!("unknown layout type {base}")))?;
        let size = element.size().max(1);

        let mut items = Vec::with_capacity(length.min(self.ctx.max_elements));
        for i in 0..length.min(self.ctx.max_elements) {
            let (slot, offset) = if size < 32 {
                let per_slot = 32 / size;
                (start + U256::from(i / per_slot), (i % per_slot) * size)
            } else {
                (start + U256::from(i * size.div_ceil(32)), 0)
            };
            items.push(self.decode(base, slot, offset).await?);
        }
        Ok(VariableValue::Array { items, length })
    }

    /// `bytes` and `string`: up to 31 bytes are stored in the slot itself with `2 * len`
    /// in the lowest byte; longer values store `2 * len + 1` and their data from
    /// `keccak256(slot)`.
    async fn decode_bytes(&self, ty: &StorageType, slot: U256) -> Result<VariableValue, DecodeError> {
        let word = self.viewer.slot(slot).await?;
        let data = if !word.bit(0) {
            let length = (word.byte(0) / 2) as usize;
            word.to_be_bytes::<32>()[..length.min(31)].to_vec()
        } else {
            let length = ((word - U256::from(1)) / U256::from(2)).saturating_to::<usize>();
            let words = length.div_ceil(32).min(self.ctx.max_elements);
            let start = data_slot(slot);
            let mut data = Vec::with_capacity(words * 32);
            for i in 0..words {
                data.extend_from_slice(&self.viewer.slot(start + U256::from(i)).await?.to_be_bytes::<32>());
            }
            data.truncate(length);
            data
        };
        Ok(if ty.label == "string" {
            VariableValue::String(String::from_utf8_lossy(&data).into_owned())
        } else {
            VariableValue::Bytes(data.into())
        })
    }

    /// Mapping entries are recovered from the `KECCAK256` preimages seen in the trace:
    /// every hash of `key ++ slot` names an entry stored at that hash.
    async fn decode_mapping(&self, ty: &StorageType, slot: U256) -> Result<VariableValue, DecodeError> {
        let (Some(key_id), Some(value_id)) = (&ty.key, &ty.value) else {
            return Err(DecodeError::Storage(format!("mapping {} without key or value", ty.label)));
        };
        let key_label = self.layout.types.get(key_id).map(|t| t.label.as_str()).unwrap_or(key_id.as_str());
        let (key_ty, _) = parse_type_string(key_label)?;

        let preimages = self
            .viewer
            .trace()
            .preimages()
            .filter(|(_, preimage)| preimage.base_slot == slot)
            .map(|(hash, preimage)| (&preimage.key, U256::from_be_bytes(hash.0)))
            .sorted();

        let mut entries = Vec::new();
        for (key, value_slot) in preimages {
            if entries.len() >= self.ctx.max_elements {
                break;
            }
            let key = match decode_key(&key_ty, key, self.ctx) {
                Ok(key) => key,
                Err(err) => {
                    debug!(%slot, "Skipping preimage that is not a {key_ty} key: {err}");
                    continue;
                }
            };
            let value = self.decode(value_id, value_slot, 0).await?;
            entries.push(MappingEntry { key, value });
        }
        Ok(VariableValue::Mapping(entries))
    }
}

/// Value-type keys are hashed as a padded word, `bytes` and `string` keys as is.
fn decode_key(ty: &VariableType, key: &Bytes, ctx: DecodeContext<'_>) -> Result<VariableValue, DecodeError> {
    match ty {
        VariableType::String => Ok(VariableValue::String(String::from_utf8_lossy(key).into_owned())),
        VariableType::Bytes => Ok(VariableValue::Bytes(key.clone())),
        ty if key.len() == 32 => decode_word(ty, U256::from_be_slice(key), ctx.ast),
        _ => Err(DecodeError::OutOfBounds { offset: 0, length: key.len() }),
    }
}

fn element_type(ty: &StorageType) -> Result<&str, DecodeError> {
    ty.base
        .as_deref()
        .ok_or_else(|| DecodeError::Storage(format!("array {} without base type", ty.label)))
}

/// First data slot of a dynamic array or long `bytes` value stored at `slot`.
fn data_slot(slot: U256) -> U256 {
    U256::from_be_bytes(keccak256(slot.to_be_bytes::<32>()).0)
}
