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

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Bytes, I256, U256};
use tdb_common::types::VariableValue;

use crate::{error::DecodeError, trace::word_to_address};

/// Where a variable's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLocation {
    /// Directly on the stack (value types)
    Stack,
    /// The stack holds a memory pointer
    Memory,
    /// The stack holds a storage slot
    Storage,
    /// The stack holds a calldata offset (and a length for dynamic types)
    Calldata,
}

/// A Solidity type as needed for decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableType {
    /// `uintN`, `intN`, `bool`, `address`, `bytesN`
    Value(DynSolType),
    /// Contract or interface reference, an address at runtime
    Contract(String),
    /// Enum by canonical name
    Enum(String),
    /// Dynamic `bytes`
    Bytes,
    /// Dynamic `string`
    String,
    /// Element type and static length
    Array(Box<VariableType>, Option<usize>),
    /// Struct by canonical name
    Struct(String),
    /// Key and value type
    Mapping(Box<VariableType>, Box<VariableType>),
}

impl VariableType {
    /// Whether values of this type fit in a single word.
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_) | Self::Contract(_) | Self::Enum(_))
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(ty) => write!(f, "{ty}"),
            Self::Contract(name) => write!(f, "contract {name}"),
            Self::Enum(name) => write!(f, "enum {name}"),
            Self::Bytes => write!(f, "bytes"),
            Self::String => write!(f, "string"),
            Self::Array(inner, Some(len)) => write!(f, "{inner}[{len}]"),
            Self::Array(inner, None) => write!(f, "{inner}[]"),
            Self::Struct(name) => write!(f, "struct {name}"),
            Self::Mapping(key, value) => write!(f, "mapping({key} => {value})"),
        }
    }
}

const LOCATION_SUFFIXES: [(&str, DataLocation); 5] = [
    (" storage ref", DataLocation::Storage),
    (" storage pointer", DataLocation::Storage),
    (" storage", DataLocation::Storage),
    (" memory", DataLocation::Memory),
    (" calldata", DataLocation::Calldata),
];

/// Split the data location suffix off a `typeString`. Strings without one are stack
/// values.
pub fn strip_location(type_string: &str) -> (&str, DataLocation) {
    let trimmed = type_string.trim();
    LOCATION_SUFFIXES
        .iter()
        .find_map(|(suffix, location)| trimmed.strip_suffix(suffix).map(|b| (b, *location)))
        .unwrap_or((trimmed, DataLocation::Stack))
}

/// Parse an AST `typeString` (or storage layout label) into a type and data location.
pub fn parse_type_string(type_string: &str) -> Result<(VariableType, DataLocation), DecodeError> {
    let (base, location) = strip_location(type_string);
    let ty = parse_type(base).ok_or_else(|| DecodeError::UnsupportedType(type_string.to_string()))?;
    Ok((ty, location))
}

/// Number of stack slots a variable of this type occupies: dynamic calldata values are
/// an offset and a length.
pub fn stack_width(type_string: &str) -> usize {
    match parse_type_string(type_string) {
        Ok((VariableType::Bytes | VariableType::String | VariableType::Array(_, None), DataLocation::Calldata)) => 2,
        _ => 1,
    }
}

fn parse_type(s: &str) -> Option<VariableType> {
    let s = s.trim();

    // The outermost dimension is the last one: `uint256[2][]` is a dynamic array of pairs.
    if let Some(inner) = s.strip_suffix(']') {
        let open = inner.rfind('[')?;
        let len = &inner[open + 1..];
        let len = if len.is_empty() { None } else { Some(len.parse().ok()?) };
        return Some(VariableType::Array(Box::new(parse_type(&inner[..open])?), len));
    }

    if let Some(inner) = s.strip_prefix("mapping(").and_then(|r| r.strip_suffix(')')) {
        let (key, value) = split_mapping(inner)?;
        return Some(VariableType::Mapping(Box::new(parse_type(key)?), Box::new(parse_type(value)?)));
    }

    if let Some(name) = s.strip_prefix("struct ") {
        return Some(VariableType::Struct(name.to_string()));
    }
    if let Some(name) = s.strip_prefix("enum ") {
        return Some(VariableType::Enum(name.to_string()));
    }
    if let Some(name) = s.strip_prefix("contract ").or_else(|| s.strip_prefix("library ")) {
        return Some(VariableType::Contract(name.to_string()));
    }

    match s {
        "bytes" => Some(VariableType::Bytes),
        "string" => Some(VariableType::String),
        "address payable" => Some(VariableType::Value(DynSolType::Address)),
        _ => match DynSolType::parse(s).ok()? {
            ty @ (DynSolType::Bool
            | DynSolType::Int(_)
            | DynSolType::Uint(_)
            | DynSolType::Address
            | DynSolType::FixedBytes(_)) => Some(VariableType::Value(ty)),
            _ => None,
        },
    }
}

/// Split `K => V` at the arrow that is not nested inside another mapping.
fn split_mapping(inner: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1)?,
            '=' if depth == 0 && inner[i..].starts_with("=>") => {
                return Some((inner[..i].trim(), inner[i + 2..].trim()));
            }
            _ => {}
        }
    }
    None
}

/// Decode a single-word value type from a full, right-aligned 32-byte word.
pub fn decode_value_word(ty: &DynSolType, word: U256) -> Result<VariableValue, DecodeError> {
    Ok(match ty {
        DynSolType::Bool => VariableValue::Bool(!word.is_zero()),
        DynSolType::Uint(bits) => VariableValue::Uint(word & low_mask(*bits)),
        DynSolType::Int(bits) => VariableValue::Int(sign_extend(word, *bits)),
        DynSolType::Address => VariableValue::Address(word_to_address(word)),
        // bytesN is left-aligned in its word.
        DynSolType::FixedBytes(size) => {
            let bytes = word.to_be_bytes::<32>();
            VariableValue::FixedBytes(Bytes::copy_from_slice(&bytes[..(*size).min(32)]))
        }
        other => return Err(DecodeError::UnsupportedType(other.to_string())),
    })
}

/// Mask keeping the low `bits` bits.
pub fn low_mask(bits: usize) -> U256 {
    if bits >= 256 {
        U256::MAX
    } else {
        (U256::from(1) << bits) - U256::from(1)
    }
}

fn sign_extend(word: U256, bits: usize) -> I256 {
    if bits >= 256 || bits == 0 {
        return I256::from_raw(word);
    }
    let value = word & low_mask(bits);
    let negative = value.bit(bits - 1);
    I256::from_raw(if negative { value | !low_mask(bits) } else { value })
}

/// Convert an ABI-decoded value into the debugger's value model.
pub fn from_dyn_value(value: DynSolValue) -> Result<VariableValue, DecodeError> {
    Ok(match value {
        DynSolValue::Bool(b) => VariableValue::Bool(b),
        DynSolValue::Uint(v, _) => VariableValue::Uint(v),
        DynSolValue::Int(v, _) => VariableValue::Int(v),
        DynSolValue::Address(a) => VariableValue::Address(a),
        DynSolValue::FixedBytes(word, size) => {
            VariableValue::FixedBytes(Bytes::copy_from_slice(&word[..size.min(32)]))
        }
        DynSolValue::Bytes(b) => VariableValue::Bytes(b.into()),
        DynSolValue::String(s) => VariableValue::String(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            let length = items.len();
            let items = items.into_iter().map(from_dyn_value).collect::<Result<_, _>>()?;
            VariableValue::Array { items, length }
        }
        other => {
            return Err(DecodeError::UnsupportedType(
                other.sol_type_name().map(|n| n.into_owned()).unwrap_or_default(),
            ))
        }
    })
}
