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

//! Values reachable from a stack word: the word itself, memory behind a pointer, or
//! calldata behind an offset.

use alloy_dyn_abi::DynSolType;
use alloy_primitives::{Bytes, U256};
use tdb_common::types::{StructMember, VariableValue};

use super::types::{decode_value_word, from_dyn_value, parse_type_string, VariableType};
use crate::{error::DecodeError, source::AstIndex, trace::word_to_address};

/// Pointer chains deeper than this are cut off.
const MAX_NESTING: usize = 16;

/// What every decode of one variable needs besides the data itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecodeContext<'a> {
    pub ast: &'a AstIndex,
    pub max_elements: usize,
}

/// Decode a value that fits in one word.
pub(crate) fn decode_word(
    ty: &VariableType,
    word: U256,
    ast: &AstIndex,
) -> Result<VariableValue, DecodeError> {
    match ty {
        VariableType::Value(ty) => decode_value_word(ty, word),
        VariableType::Contract(_) => Ok(VariableValue::Address(word_to_address(word))),
        VariableType::Enum(name) => Ok(decode_enum(name, word, ast)),
        other => Err(DecodeError::UnsupportedType(other.to_string())),
    }
}

/// Enum value with its member name, when the definition is known.
pub(crate) fn decode_enum(name: &str, word: U256, ast: &AstIndex) -> VariableValue {
    let index = word.saturating_to::<u64>();
    let name = ast
        .enum_def(name)
        .and_then(|def| usize::try_from(index).ok().and_then(|i| def.members.get(i)))
        .cloned();
    VariableValue::Enum { name, index }
}

fn to_offset(word: U256) -> Result<usize, DecodeError> {
    usize::try_from(word).map_err(|_| DecodeError::OutOfBounds { offset: usize::MAX, length: 32 })
}

fn slice(buf: &[u8], offset: usize, length: usize) -> Result<&[u8], DecodeError> {
    offset
        .checked_add(length)
        .and_then(|end| buf.get(offset..end))
        .ok_or(DecodeError::OutOfBounds { offset, length })
}

fn word_at(buf: &[u8], offset: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_be_slice(slice(buf, offset, 32)?))
}

fn bytes_value(ty: &VariableType, data: &[u8]) -> VariableValue {
    match ty {
        VariableType::String => VariableValue::String(String::from_utf8_lossy(data).into_owned()),
        _ => VariableValue::Bytes(Bytes::copy_from_slice(data)),
    }
}

/// Decode the value of type `ty` that `pointer` points to in `memory`.
///
/// Memory values are word-aligned: dynamic arrays, `bytes` and `string` start with their
/// length, static arrays and structs hold one word per element or member, and elements
/// of reference type are pointers themselves.
pub(crate) fn decode_memory(
    ty: &VariableType,
    memory: &[u8],
    pointer: U256,
    ctx: DecodeContext<'_>,
) -> Result<VariableValue, DecodeError> {
    decode_memory_at(ty, memory, pointer, ctx, 0)
}

fn decode_memory_at(
    ty: &VariableType,
    memory: &[u8],
    pointer: U256,
    ctx: DecodeContext<'_>,
    nesting: usize,
) -> Result<VariableValue, DecodeError> {
    if nesting > MAX_NESTING {
        return Err(DecodeError::UnsupportedType(format!("{ty} nested too deeply")));
    }
    let offset = to_offset(pointer)?;
    match ty {
        ty if ty.is_value() => decode_word(ty, word_at(memory, offset)?, ctx.ast),
        VariableType::Bytes | VariableType::String => {
            let length = to_offset(word_at(memory, offset)?)?;
            Ok(bytes_value(ty, slice(memory, offset.saturating_add(32), length)?))
        }
        VariableType::Array(element, static_len) => {
            let (length, start) = match static_len {
                Some(len) => (*len, offset),
                None => (to_offset(word_at(memory, offset)?)?, offset.saturating_add(32)),
            };
            let items = (0..length.min(ctx.max_elements))
                .map(|i| {
                    let slot = start.saturating_add(i.saturating_mul(32));
                    decode_memory_slot(element, memory, slot, ctx, nesting)
                })
                .collect::<Result<_, _>>()?;
            Ok(VariableValue::Array { items, length })
        }
        VariableType::Struct(name) => {
            let def = ctx
                .ast
                .struct_def(name)
                .ok_or_else(|| DecodeError::UnsupportedType(ty.to_string()))?;
            let mut members = Vec::with_capacity(def.members.len());
            for (i, member) in def.members.iter().enumerate() {
                let (member_ty, _) = parse_type_string(&member.type_string)?;
                let slot = offset.saturating_add(i.saturating_mul(32));
                members.push(StructMember {
                    name: member.name.clone(),
                    value: decode_memory_slot(&member_ty, memory, slot, ctx, nesting)?,
                });
            }
            Ok(VariableValue::Struct(members))
        }
        other => Err(DecodeError::UnsupportedType(format!("{other} memory"))),
    }
}

/// Decode the word at `slot`: inline for value types, followed as a pointer otherwise.
fn decode_memory_slot(
    ty: &VariableType,
    memory: &[u8],
    slot: usize,
    ctx: DecodeContext<'_>,
    nesting: usize,
) -> Result<VariableValue, DecodeError> {
    let word = word_at(memory, slot)?;
    if ty.is_value() {
        decode_word(ty, word, ctx.ast)
    } else {
        decode_memory_at(ty, memory, word, ctx, nesting + 1)
    }
}

/// Decode a calldata variable from its stack words.
///
/// `bytes`, `string` and dynamic arrays occupy two stack slots (data offset, length);
/// static arrays a single offset. Only arrays of value types are supported.
pub(crate) fn decode_calldata(
    ty: &VariableType,
    calldata: &[u8],
    offset: U256,
    length: Option<U256>,
    ctx: DecodeContext<'_>,
) -> Result<VariableValue, DecodeError> {
    let offset = to_offset(offset)?;
    match (ty, length) {
        (VariableType::Bytes | VariableType::String, Some(length)) => {
            Ok(bytes_value(ty, slice(calldata, offset, to_offset(length)?)?))
        }
        (VariableType::Array(element, None), Some(length)) => {
            decode_calldata_array(element, calldata, offset, to_offset(length)?, ctx)
        }
        (VariableType::Array(element, Some(length)), _) => {
            decode_calldata_array(element, calldata, offset, *length, ctx)
        }
        (ty, _) => Err(DecodeError::UnsupportedType(format!("{ty} calldata"))),
    }
}

fn decode_calldata_array(
    element: &VariableType,
    calldata: &[u8],
    offset: usize,
    length: usize,
    ctx: DecodeContext<'_>,
) -> Result<VariableValue, DecodeError> {
    let VariableType::Value(sol) = element else {
        return Err(DecodeError::UnsupportedType(format!("{element}[] calldata")));
    };
    let shown = length.min(ctx.max_elements);
    let data = slice(calldata, offset, shown.saturating_mul(32))?;
    let decoded = DynSolType::FixedArray(Box::new(sol.clone()), shown).abi_decode(data)?;
    match from_dyn_value(decoded)? {
        VariableValue::Array { items, .. } => Ok(VariableValue::Array { items, length }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use alloy_dyn_abi::DynSolType;

    use super::*;
    use crate::test_utils::{addr, vault_source, word};

    fn uint(v: u64) -> VariableValue {
        VariableValue::Uint(U256::from(v))
    }

    fn position_memory() -> Vec<u8> {
        let mut memory = Vec::new();
        // struct at 0x00
        memory.extend_from_slice(addr(0xaa).into_word().as_slice());
        memory.extend_from_slice(&word(0x60));
        memory.extend_from_slice(&word(0xc0));
        // amounts at 0x60
        memory.extend_from_slice(&word(2));
        memory.extend_from_slice(&word(5));
        memory.extend_from_slice(&word(9));
        // note at 0xc0
        memory.extend_from_slice(&word(2));
        let mut note = [0u8; 32];
        note[..2].copy_from_slice(b"hi");
        memory.extend_from_slice(&note);
        memory
    }

    #[test]
    fn test_decode_memory_struct() {
        let ast = AstIndex::build(&[vault_source()]);
        let ctx = DecodeContext { ast: &ast, max_elements: 1024 };
        let memory = position_memory();

        let value =
            decode_memory(&VariableType::Struct("Vault.Position".into()), &memory, U256::ZERO, ctx)
                .unwrap();
        assert_eq!(
            value,
            VariableValue::Struct(vec![
                StructMember { name: "owner".into(), value: VariableValue::Address(addr(0xaa)) },
                StructMember {
                    name: "amounts".into(),
                    value: VariableValue::Array { items: vec![uint(5), uint(9)], length: 2 },
                },
                StructMember { name: "note".into(), value: VariableValue::String("hi".into()) },
            ])
        );
    }

    #[test]
    fn test_decode_memory_limits() {
        let ast = AstIndex::default();
        let ctx = DecodeContext { ast: &ast, max_elements: 1 };
        let memory = position_memory();
        let amounts = VariableType::Array(Box::new(VariableType::Value(DynSolType::Uint(256))), None);

        assert_eq!(
            decode_memory(&amounts, &memory, U256::from(0x60), ctx).unwrap(),
            VariableValue::Array { items: vec![uint(5)], length: 2 }
        );
        assert!(matches!(
            decode_memory(&VariableType::Bytes, &memory, U256::from(0x200), ctx),
            Err(DecodeError::OutOfBounds { offset: 0x200, length: 32 })
        ));
        // Unknown struct definitions cannot be laid out.
        assert!(matches!(
            decode_memory(&VariableType::Struct("Vault.Position".into()), &memory, U256::ZERO, ctx),
            Err(DecodeError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_decode_enum_names() {
        let ast = AstIndex::build(&[vault_source()]);
        let state = VariableType::Enum("Vault.State".into());
        assert_eq!(
            decode_word(&state, U256::from(1), &ast).unwrap(),
            VariableValue::Enum { name: Some("Closed".into()), index: 1 }
        );
        assert_eq!(
            decode_word(&state, U256::from(7), &ast).unwrap(),
            VariableValue::Enum { name: None, index: 7 }
        );
    }

    #[test]
    fn test_decode_calldata() {
        let ast = AstIndex::default();
        let ctx = DecodeContext { ast: &ast, max_elements: 1024 };
        // f(uint256[] xs, bytes b) with xs = [3, 4], b = 0xbeef
        let mut calldata = vec![0x12, 0x34, 0x56, 0x78];
        for w in [0x40, 0xa0, 2, 3, 4, 2] {
            calldata.extend_from_slice(&word(w));
        }
        let mut b = [0u8; 32];
        b[..2].copy_from_slice(&[0xbe, 0xef]);
        calldata.extend_from_slice(&b);

        let xs = VariableType::Array(Box::new(VariableType::Value(DynSolType::Uint(256))), None);
        assert_eq!(
            decode_calldata(&xs, &calldata, U256::from(4 + 0x60), Some(U256::from(2)), ctx).unwrap(),
            VariableValue::Array { items: vec![uint(3), uint(4)], length: 2 }
        );
        assert_eq!(
            decode_calldata(&VariableType::Bytes, &calldata, U256::from(4 + 0xc0), Some(U256::from(2)), ctx)
                .unwrap(),
            VariableValue::Bytes(Bytes::from_static(&[0xbe, 0xef]))
        );
        assert!(matches!(
            decode_calldata(&VariableType::Struct("S".into()), &calldata, U256::from(4), None, ctx),
            Err(DecodeError::UnsupportedType(_))
        ));
    }
}
