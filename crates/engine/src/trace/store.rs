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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use alloy_primitives::B256;
use parking_lot::RwLock;
use tdb_common::types::{RawTrace, TraceOptions, TxContext};
use tracing::{debug, info, trace, warn};

use super::TraceAnalysis;
use crate::{
    error::TraceError,
    provider::{CachedTrace, TraceCache, TraceProvider},
};

/// Owns the analysed trace of the current session.
///
/// Loading is single-flight: while one [`TraceStore::resolve_trace`] is in progress,
/// further calls return `Ok(false)` without doing anything.
pub struct TraceStore {
    provider: Option<Arc<dyn TraceProvider>>,
    cache: Option<Arc<dyn TraceCache>>,
    slot: RwLock<Option<Arc<TraceAnalysis>>>,
    resolving: AtomicBool,
}

/// Clears the in-flight flag when a resolve finishes, however it finishes.
struct ResolveGuard<'a>(&'a AtomicBool);

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TraceStore {
    /// New store. Without a provider only [`TraceStore::load`] can populate it.
    pub fn new(
        provider: Option<Arc<dyn TraceProvider>>,
        cache: Option<Arc<dyn TraceCache>>,
    ) -> Self {
        Self { provider, cache, slot: RwLock::new(None), resolving: AtomicBool::new(false) }
    }

    /// Fetch and analyse the trace of `tx`, replacing the current one.
    ///
    /// Returns `Ok(false)` if another resolve is still in flight.
    pub async fn resolve_trace(&self, tx: B256) -> Result<bool, TraceError> {
        let Some(analysis) = self.fetch_trace(tx).await? else { return Ok(false) };
        self.replace(analysis);
        Ok(true)
    }

    /// Fetch and analyse the trace of `tx` without touching the current one.
    ///
    /// The cache is consulted first; the trace provider is only required on a miss.
    /// Returns `Ok(None)` if another fetch is still in flight.
    pub async fn fetch_trace(&self, tx: B256) -> Result<Option<Arc<TraceAnalysis>>, TraceError> {
        if self
            .resolving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(%tx, "Trace resolution already in flight");
            return Ok(None);
        }
        let _guard = ResolveGuard(&self.resolving);

        let cached = match self.cache.as_ref().map(|cache| cache.get(&tx)) {
            Some(Ok(hit)) => hit,
            Some(Err(err)) => {
                warn!(%tx, "Trace cache lookup failed, fetching from the node: {err}");
                None
            }
            None => None,
        };

        let entry = match cached {
            Some(entry) => {
                trace!(%tx, "Trace cache hit");
                entry
            }
            None => {
                let Some(provider) = self.provider.clone() else {
                    return Err(TraceError::NoProvider);
                };
                let context = provider.transaction(tx).await.map_err(TraceError::Provider)?;
                let raw = provider
                    .trace_transaction(tx, TraceOptions::debugger())
                    .await
                    .map_err(TraceError::Provider)?;
                let entry = CachedTrace { tx: context, trace: raw };
                self.spawn_cache_write(tx, &entry);
                entry
            }
        };

        let analysis = Arc::new(TraceAnalysis::analyse(entry.tx, &entry.trace)?);
        info!(%tx, steps = analysis.len(), "Trace analysed");
        Ok(Some(analysis))
    }

    /// Analyse an already available trace, replacing the current one.
    pub fn load(&self, tx: TxContext, raw: &RawTrace) -> Result<Arc<TraceAnalysis>, TraceError> {
        let analysis = Arc::new(TraceAnalysis::analyse(tx, raw)?);
        self.replace(analysis.clone());
        Ok(analysis)
    }

    /// Make `analysis` the current trace.
    pub fn replace(&self, analysis: Arc<TraceAnalysis>) {
        info!(tx = %analysis.tx().hash, steps = analysis.len(), "Trace loaded");
        *self.slot.write() = Some(analysis);
    }

    fn spawn_cache_write(&self, tx: B256, entry: &CachedTrace) {
        let Some(cache) = self.cache.clone() else { return };
        if entry.trace.is_empty() {
            return;
        }
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = cache.set(&tx, &entry) {
                warn!(%tx, "Failed to write trace cache: {err}");
            }
        });
    }

    /// Drop the current trace.
    pub fn reset(&self) {
        *self.slot.write() = None;
    }

    /// The current trace, if one is loaded.
    pub fn analysis(&self) -> Option<Arc<TraceAnalysis>> {
        self.slot.read().clone()
    }

    /// The current trace, failing with [`TraceError::NotLoaded`].
    pub fn loaded(&self) -> Result<Arc<TraceAnalysis>, TraceError> {
        self.analysis().ok_or(TraceError::NotLoaded)
    }

    /// Whether a resolve is in progress.
    pub fn is_resolving(&self) -> bool {
        self.resolving.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("has_provider", &self.provider.is_some())
            .field("has_cache", &self.cache.is_some())
            .field("loaded", &self.slot.read().as_ref().map(|a| a.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{addr, tx_to, TraceBuilder};
    use async_trait::async_trait;
    use eyre::{bail, Result};
    use parking_lot::Mutex;
    use std::{collections::HashMap, time::Duration};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockProvider {
        traces: HashMap<B256, RawTrace>,
        calls: Mutex<usize>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl TraceProvider for MockProvider {
        async fn trace_transaction(&self, tx: B256, options: TraceOptions) -> Result<RawTrace> {
            assert_eq!(options, TraceOptions::debugger());
            *self.calls.lock() += 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.traces.get(&tx) {
                Some(trace) => Ok(trace.clone()),
                None => bail!("unknown transaction"),
            }
        }

        async fn transaction(&self, tx: B256) -> Result<TxContext> {
            Ok(TxContext { hash: tx, ..tx_to(addr(0xaa)) })
        }
    }

    #[derive(Default)]
    struct MemoryCache {
        entries: Mutex<HashMap<B256, CachedTrace>>,
        broken: bool,
    }

    impl TraceCache for MemoryCache {
        fn get(&self, tx: &B256) -> Result<Option<CachedTrace>> {
            if self.broken {
                bail!("disk on fire");
            }
            Ok(self.entries.lock().get(tx).cloned())
        }

        fn set(&self, tx: &B256, trace: &CachedTrace) -> Result<()> {
            self.entries.lock().insert(*tx, trace.clone());
            Ok(())
        }
    }

    fn one_step() -> RawTrace {
        TraceBuilder::new().step(0, "STOP", 1, &[]).build()
    }

    #[tokio::test]
    async fn test_no_provider() {
        let store = TraceStore::new(None, None);
        assert!(matches!(store.resolve_trace(B256::ZERO).await, Err(TraceError::NoProvider)));
        assert!(matches!(store.loaded(), Err(TraceError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_cached_trace_without_provider() {
        let hash = B256::repeat_byte(5);
        let cache = Arc::new(MemoryCache::default());
        let entry = CachedTrace { tx: TxContext { hash, ..tx_to(addr(0xaa)) }, trace: one_step() };
        cache.set(&hash, &entry).unwrap();
        let store = TraceStore::new(None, Some(cache));

        assert!(store.resolve_trace(hash).await.unwrap());
        assert_eq!(store.loaded().unwrap().tx().hash, hash);
        assert!(matches!(
            store.resolve_trace(B256::repeat_byte(6)).await,
            Err(TraceError::NoProvider)
        ));
    }

    #[tokio::test]
    async fn test_fetch_leaves_current_trace() {
        let hash = B256::repeat_byte(7);
        let provider =
            MockProvider { traces: HashMap::from([(hash, one_step())]), ..Default::default() };
        let store = TraceStore::new(Some(Arc::new(provider)), None);

        let fetched = store.fetch_trace(hash).await.unwrap().unwrap();
        assert_eq!(fetched.tx().hash, hash);
        assert!(store.analysis().is_none());
        store.replace(fetched);
        assert_eq!(store.loaded().unwrap().tx().hash, hash);
    }

    #[tokio::test]
    async fn test_empty_trace_rejected() {
        let hash = B256::repeat_byte(1);
        let provider =
            MockProvider { traces: HashMap::from([(hash, RawTrace::default())]), ..Default::default() };
        let store = TraceStore::new(Some(Arc::new(provider)), None);
        assert!(matches!(
            store.resolve_trace(hash).await,
            Err(TraceError::NotAContractInvocation)
        ));
        assert!(store.analysis().is_none());
    }

    #[tokio::test]
    async fn test_fetch_then_cache() {
        let hash = B256::repeat_byte(2);
        let provider = Arc::new(MockProvider {
            traces: HashMap::from([(hash, one_step())]),
            ..Default::default()
        });
        let cache = Arc::new(MemoryCache::default());
        let store = TraceStore::new(Some(provider.clone()), Some(cache.clone()));

        assert!(store.resolve_trace(hash).await.unwrap());
        assert_eq!(store.loaded().unwrap().len(), 1);
        assert_eq!(store.loaded().unwrap().tx().hash, hash);

        // The cache write is detached; give it a moment.
        for _ in 0..50 {
            if cache.entries.lock().contains_key(&hash) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.entries.lock().contains_key(&hash));

        store.reset();
        assert!(store.analysis().is_none());
        assert!(store.resolve_trace(hash).await.unwrap());
        assert_eq!(*provider.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_cache_failure_falls_back_to_provider() {
        let hash = B256::repeat_byte(3);
        let provider = Arc::new(MockProvider {
            traces: HashMap::from([(hash, one_step())]),
            ..Default::default()
        });
        let cache = Arc::new(MemoryCache { broken: true, ..Default::default() });
        let store = TraceStore::new(Some(provider.clone()), Some(cache));
        assert!(store.resolve_trace(hash).await.unwrap());
        assert_eq!(*provider.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let hash = B256::repeat_byte(4);
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(MockProvider {
            traces: HashMap::from([(hash, one_step())]),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let store = Arc::new(TraceStore::new(Some(provider), None));

        let first = tokio::spawn({
            let store = store.clone();
            async move { store.resolve_trace(hash).await }
        });
        while !store.is_resolving() {
            tokio::task::yield_now().await;
        }
        assert!(!store.resolve_trace(hash).await.unwrap());

        gate.notify_one();
        assert!(first.await.unwrap().unwrap());
        assert!(!store.is_resolving());
    }

    #[tokio::test]
    async fn test_provider_error_surfaces() {
        let store = TraceStore::new(Some(Arc::new(MockProvider::default())), None);
        let err = store.resolve_trace(B256::repeat_byte(9)).await.unwrap_err();
        assert!(err.to_string().contains("unknown transaction"));
    }
}
