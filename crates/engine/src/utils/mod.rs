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

//! Utility functions and helpers for the TDB engine.
//!
//! - [`search`] - lower-bound lookups over monotonic step indices
//! - [`arena_id`] - newtype indices into the engine's arenas

pub mod search;
pub use search::*;

mod macros {
    /// Declares a `usize` newtype used to address one of the engine's arenas.
    macro_rules! arena_id {
        (
            $(#[$attr:meta])*
            $name:ident
        ) => {
            $(#[$attr])*
            #[derive(
                Clone,
                Copy,
                Debug,
                PartialEq,
                Eq,
                Hash,
                Default,
                PartialOrd,
                Ord,
                serde::Serialize,
                serde::Deserialize,
            )]
            pub struct $name(usize);

            impl $name {
                /// Position inside the arena.
                pub const fn index(self) -> usize {
                    self.0
                }
            }

            impl From<usize> for $name {
                fn from(value: usize) -> Self {
                    Self(value)
                }
            }

            impl From<$name> for usize {
                fn from(value: $name) -> Self {
                    value.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        };
    }

    pub(crate) use arena_id;
}

pub(crate) use macros::arena_id;
