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

use alloy_primitives::{hex, Address, Bytes, I256, U256};
use serde::{Deserialize, Serialize};

/// A decoded Solidity value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum VariableValue {
    /// `uintN`
    Uint(U256),
    /// `intN`
    Int(I256),
    /// `bool`
    Bool(bool),
    /// `address` and contract types
    Address(Address),
    /// `bytesN`
    FixedBytes(Bytes),
    /// `bytes`
    Bytes(Bytes),
    /// `string`, lossily converted when not valid UTF-8
    String(String),
    /// Enum member
    Enum {
        /// Member name, when the definition is known and the index is in range
        name: Option<String>,
        /// Raw index
        index: u64,
    },
    /// Static or dynamic array
    Array {
        /// Decoded elements (may be a prefix when the array is large)
        items: Vec<VariableValue>,
        /// Full length of the array
        length: usize,
    },
    /// Struct, members in declaration order
    Struct(Vec<StructMember>),
    /// Mapping, restricted to the keys observed in the trace
    Mapping(Vec<MappingEntry>),
}

/// A named struct member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructMember {
    /// Member name
    pub name: String,
    /// Member value
    pub value: VariableValue,
}

/// One key/value pair of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Decoded key
    pub key: VariableValue,
    /// Decoded value
    pub value: VariableValue,
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Address(v) => write!(f, "{}", v.to_checksum(None)),
            Self::FixedBytes(v) | Self::Bytes(v) => write!(f, "{}", hex::encode_prefixed(v)),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Enum { name: Some(name), .. } => write!(f, "{name}"),
            Self::Enum { name: None, index } => write!(f, "<unknown enum member {index}>"),
            Self::Array { items, length } => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() < *length {
                    write!(f, ", ... ({} more)", length - items.len())?;
                }
                write!(f, "]")
            }
            Self::Struct(members) => {
                write!(f, "{{ ")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", member.name, member.value)?;
                }
                write!(f, " }}")
            }
            Self::Mapping(entries) => {
                write!(f, "{{")?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {} => {}", entry.key, entry.value)?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// Outcome of decoding one variable: either a value or an inline error.
///
/// A failure never aborts the decoding of sibling variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecodedValue {
    /// Successfully decoded
    Value {
        /// Solidity type string
        #[serde(rename = "type")]
        ty: String,
        /// The value
        value: VariableValue,
    },
    /// Decoding failed
    Error {
        /// Solidity type string
        #[serde(rename = "type")]
        ty: String,
        /// Human readable reason
        error: String,
    },
}

impl DecodedValue {
    /// Solidity type string of the variable.
    pub fn ty(&self) -> &str {
        match self {
            Self::Value { ty, .. } | Self::Error { ty, .. } => ty,
        }
    }

    /// The decoded value, if decoding succeeded.
    pub fn value(&self) -> Option<&VariableValue> {
        match self {
            Self::Value { value, .. } => Some(value),
            Self::Error { .. } => None,
        }
    }

    /// The error message, if decoding failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Value { .. } => None,
            Self::Error { error, .. } => Some(error),
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value { value, .. } => write!(f, "{value}"),
            Self::Error { error, .. } => write!(f, "<{error}>"),
        }
    }
}

/// A decoded variable together with its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedVariable {
    /// Variable name
    pub name: String,
    /// Decoding outcome
    #[serde(flatten)]
    pub decoded: DecodedValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_display_nested() {
        let value = VariableValue::Struct(vec![
            StructMember { name: "owner".into(), value: VariableValue::Address(Address::ZERO) },
            StructMember {
                name: "ids".into(),
                value: VariableValue::Array {
                    items: vec![VariableValue::Uint(U256::from(1)), VariableValue::Uint(U256::from(2))],
                    length: 5,
                },
            },
        ]);
        assert_eq!(
            value.to_string(),
            "{ owner: 0x0000000000000000000000000000000000000000, ids: [1, 2, ... (3 more)] }"
        );
    }

    #[test]
    fn test_decoded_value_serialization() {
        let ok = DecodedValue::Value {
            ty: "address".into(),
            value: VariableValue::Address(address!("0x00000000000000000000000000000000000000aa")),
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["type"], "address");
        assert_eq!(json["value"]["kind"], "address");

        let err = DecodedValue::Error { ty: "function".into(), error: "unsupported type".into() };
        let json = serde_json::to_value(DecodedVariable { name: "f".into(), decoded: err }).unwrap();
        assert_eq!(json, serde_json::json!({"name": "f", "type": "function", "error": "unsupported type"}));
    }
}
