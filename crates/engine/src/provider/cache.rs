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

use std::{path::PathBuf, time::Duration};

use alloy_chains::Chain;
use alloy_primitives::B256;
use eyre::Result;
use tdb_common::{Cache, CachePath, TdbCache, TdbCachePath};
use tracing::debug;

use super::{CachedTrace, TraceCache};

/// Trace cache on the local file system: one JSON file per transaction under
/// `<cache_root>/traces/<chain>/`.
#[derive(Debug, Clone)]
pub struct FileTraceCache {
    cache: TdbCache<CachedTrace>,
}

impl FileTraceCache {
    /// Open the cache for `chain`. Returns `None` when no cache directory can be determined
    /// (no explicit root and no home directory).
    pub fn new(
        cache_root: Option<PathBuf>,
        chain: impl Into<Chain>,
        ttl: Option<Duration>,
    ) -> Result<Option<Self>> {
        let dir = TdbCachePath::new(cache_root).trace_chain_cache_dir(chain);
        debug!(?dir, ?ttl, "Opening trace cache");
        Ok(TdbCache::new(dir, ttl)?.map(|cache| Self { cache }))
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &PathBuf {
        self.cache.cache_dir()
    }
}

impl TraceCache for FileTraceCache {
    fn get(&self, tx: &B256) -> Result<Option<CachedTrace>> {
        Ok(self.cache.load_cache(tx.to_string()))
    }

    fn set(&self, tx: &B256, trace: &CachedTrace) -> Result<()> {
        self.cache.save_cache(tx.to_string(), trace)
    }
}
