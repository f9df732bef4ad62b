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

//! On-disk caching of fetched traces.
//!
//! Entries are JSON files named after their label (the transaction hash for traces),
//! each wrapped with an expiry timestamp. Unreadable or expired entries are deleted on
//! load and reported as misses.

use std::{fs, marker::PhantomData, path::PathBuf, time::Duration};

use alloy_chains::Chain;
use eyre::{Result, WrapErr};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{trace, warn};

use crate::env::TDB_CACHE_DIR;

/// Default cache TTL for struct-log traces.
/// Set to 1 week since the trace of a mined transaction never changes.
pub const DEFAULT_TRACE_CACHE_TTL: u64 = 7 * 86400;

/// Layout of TDB's cache directories.
pub trait CachePath {
    /// Root of TDB's cache.
    fn tdb_cache_dir(&self) -> Option<PathBuf>;

    /// `<cache_root>/traces`
    fn trace_cache_dir(&self) -> Option<PathBuf> {
        Some(self.tdb_cache_dir()?.join("traces"))
    }

    /// `<cache_root>/traces/<chain>`, so traces of different networks never collide.
    fn trace_chain_cache_dir(&self, chain: impl Into<Chain>) -> Option<PathBuf> {
        Some(self.trace_cache_dir()?.join(chain.into().to_string()))
    }
}

/// Cache root chosen from, in order, an explicit directory, [`TDB_CACHE_DIR`] and
/// `~/.tdb/cache`.
#[derive(Debug, Clone, Default)]
pub struct TdbCachePath {
    root: Option<PathBuf>,
}

impl TdbCachePath {
    /// Resolve the cache root.
    pub fn new(root: Option<impl Into<PathBuf>>) -> Self {
        let root = root
            .map(Into::into)
            .or_else(|| std::env::var_os(TDB_CACHE_DIR).filter(|v| !v.is_empty()).map(PathBuf::from))
            .or_else(|| dirs_next::home_dir().map(|home| home.join(".tdb").join("cache")));
        Self { root }
    }
}

impl CachePath for TdbCachePath {
    fn tdb_cache_dir(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}

/// A cached value with the unix time it expires at.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    expires_at: u64,
}

fn now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

impl<T> CacheEntry<T> {
    fn new(data: T, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map_or(u64::MAX, |ttl| now().saturating_add(ttl.as_secs()));
        Self { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at < now()
    }
}

/// Key-value cache of serializable data.
pub trait Cache {
    /// The type of the cached data.
    type Data: Serialize + DeserializeOwned;

    /// The entry stored under `label`, if present and fresh.
    fn load_cache(&self, label: impl Into<String>) -> Option<Self::Data>;

    /// Store `data` under `label`, replacing any previous entry.
    fn save_cache(&self, label: impl Into<String>, data: &Self::Data) -> Result<()>;
}

/// A [`Cache`] keeping one JSON file per label in `cache_dir`. Entries never expire
/// when `cache_ttl` is `None`.
#[derive(Debug, Clone)]
pub struct TdbCache<T> {
    cache_dir: PathBuf,
    cache_ttl: Option<Duration>,
    phantom: PhantomData<T>,
}

impl<T> TdbCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create the cache directory. Returns `None` when no directory is given.
    pub fn new(
        cache_dir: Option<impl Into<PathBuf>>,
        cache_ttl: Option<Duration>,
    ) -> Result<Option<Self>> {
        let Some(cache_dir) = cache_dir.map(Into::into) else { return Ok(None) };
        fs::create_dir_all(&cache_dir)
            .wrap_err_with(|| format!("failed to create cache dir {}", cache_dir.display()))?;
        Ok(Some(Self { cache_dir, cache_ttl, phantom: PhantomData }))
    }

    /// Directory holding the cache files.
    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Lifetime of new entries.
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    fn entry_file(&self, label: String) -> PathBuf {
        self.cache_dir.join(format!("{label}.json"))
    }
}

impl<T> Cache for TdbCache<T>
where
    T: Serialize + DeserializeOwned,
{
    type Data = T;

    fn load_cache(&self, label: impl Into<String>) -> Option<T> {
        let file = self.entry_file(label.into());
        let content = fs::read_to_string(&file).ok()?;

        let entry: CacheEntry<T> = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(?file, "Dropping unreadable cache entry: {err}");
                let _ = fs::remove_file(&file);
                return None;
            }
        };
        if entry.is_expired() {
            trace!(?file, "Cache entry expired");
            let _ = fs::remove_file(&file);
            return None;
        }
        trace!(?file, "Cache hit");
        Some(entry.data)
    }

    /// Entries are written to a temporary file first and renamed into place, so a
    /// concurrent reader never sees a partial file.
    fn save_cache(&self, label: impl Into<String>, data: &T) -> Result<()> {
        let file = self.entry_file(label.into());
        let partial = file.with_extension("json.partial");
        trace!(?file, "Saving cache entry");

        let content = serde_json::to_string(&CacheEntry::new(data, self.cache_ttl))?;
        fs::write(&partial, content)?;
        fs::rename(&partial, &file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        steps: Vec<String>,
        gas: u64,
    }

    fn sample() -> Sample {
        Sample { steps: vec!["PUSH1".into(), "STOP".into()], gas: 3 }
    }

    #[test]
    #[serial]
    fn test_cache_path_precedence() {
        let saved = std::env::var_os(TDB_CACHE_DIR);

        std::env::set_var(TDB_CACHE_DIR, "/tmp/from-env");
        let explicit = TdbCachePath::new(Some("/tmp/explicit"));
        assert_eq!(explicit.tdb_cache_dir(), Some(PathBuf::from("/tmp/explicit")));
        let from_env = TdbCachePath::new(None::<PathBuf>);
        assert_eq!(from_env.tdb_cache_dir(), Some(PathBuf::from("/tmp/from-env")));

        std::env::remove_var(TDB_CACHE_DIR);
        if let Some(dir) = TdbCachePath::new(None::<PathBuf>).tdb_cache_dir() {
            assert!(dir.ends_with(".tdb/cache"));
        }

        if let Some(saved) = saved {
            std::env::set_var(TDB_CACHE_DIR, saved);
        }
    }

    #[test]
    fn test_trace_chain_cache_dir() {
        let root = std::env::temp_dir().join("tdb_test_dirs");
        let path = TdbCachePath::new(Some(&root));
        assert_eq!(path.trace_cache_dir(), Some(root.join("traces")));
        assert_eq!(path.trace_chain_cache_dir(Chain::mainnet()), Some(root.join("traces/mainnet")));
        assert!(TdbCachePath::default().trace_cache_dir().is_none());
    }

    #[test]
    fn test_cache_entry_ttl() {
        let forever = CacheEntry::new(sample(), None);
        assert_eq!(forever.expires_at, u64::MAX);
        assert!(!forever.is_expired());
        assert!(!CacheEntry::new(sample(), Some(Duration::from_secs(3600))).is_expired());

        let stale = CacheEntry { data: sample(), expires_at: 0 };
        assert!(stale.is_expired());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = TdbCache::<Sample>::new(Some(dir.path()), None).unwrap().unwrap();

        assert!(cache.load_cache("missing").is_none());
        cache.save_cache("0xabc", &sample()).unwrap();
        assert_eq!(cache.load_cache("0xabc"), Some(sample()));
        assert!(!dir.path().join("0xabc.json.partial").exists());
    }

    #[test]
    fn test_expired_and_unreadable_entries_are_removed() {
        let dir = TempDir::new().unwrap();
        let cache = TdbCache::<Sample>::new(Some(dir.path()), None).unwrap().unwrap();

        let expired = dir.path().join("expired.json");
        let entry = CacheEntry { data: sample(), expires_at: 0 };
        fs::write(&expired, serde_json::to_string(&entry).unwrap()).unwrap();
        assert!(cache.load_cache("expired").is_none());
        assert!(!expired.exists());

        let unreadable = dir.path().join("unreadable.json");
        fs::write(&unreadable, "{ not json").unwrap();
        assert!(cache.load_cache("unreadable").is_none());
        assert!(!unreadable.exists());
    }

    #[test]
    fn test_no_directory_means_no_cache() {
        assert!(TdbCache::<Sample>::new(None::<PathBuf>, None).unwrap().is_none());
    }
}
