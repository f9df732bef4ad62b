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

//! Environment variable name constants for TDB configuration.
//!
//! These constants are the single source of truth for every environment variable
//! TDB reads.
//!
//! # Environment Variables
//!
//! - [`TDB_CACHE_DIR`] - Specifies the cache directory location
//! - [`TDB_TRACE_CACHE_TTL`] - Sets the trace cache time-to-live

/// Environment variable for specifying the cache directory.
///
/// TDB stores fetched struct-log traces under `<cache_dir>/traces/<chain>`.
///
/// # Default
///
/// When not set, TDB uses `~/.tdb/cache` (see [`crate::TdbCachePath`]).
///
/// # Examples
///
/// ```bash
/// TDB_CACHE_DIR=/tmp/tdb-cache tdb calls <tx-hash>
/// ```
///
/// The CLI argument `--cache-dir` takes precedence over the environment variable.
pub const TDB_CACHE_DIR: &str = "TDB_CACHE_DIR";

/// Environment variable for setting the trace cache time-to-live (TTL) in seconds.
///
/// # Value Format
///
/// Must be a valid `u64` integer representing seconds. Invalid values are ignored.
///
/// # Default
///
/// When not set, [`crate::DEFAULT_TRACE_CACHE_TTL`] is used.
pub const TDB_TRACE_CACHE_TTL: &str = "TDB_TRACE_CACHE_TTL";

/// Reads [`TDB_TRACE_CACHE_TTL`], ignoring values that are not valid seconds.
pub fn trace_cache_ttl_from_env() -> Option<u64> {
    std::env::var(TDB_TRACE_CACHE_TTL).ok().and_then(|v| v.trim().parse().ok())
}
