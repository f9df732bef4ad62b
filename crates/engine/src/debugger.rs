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

//! Orchestrator: the composition root of a debugging session.
//!
//! [`Debugger`] owns the [`TraceStore`], starts the scope-tree build in the background
//! once a trace is loaded, and routes navigation and decoding to the
//! [`StepNavigator`] and [`VariableDecoder`]. Every state change is published on a
//! broadcast channel of [`DebuggerEvent`]s.
//!
//! Loading a new trace always starts from scratch: the previous session is unloaded
//! first, and a build that finishes after its session was abandoned is discarded.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy_chains::Chain;
use alloy_primitives::B256;
use eyre::Result;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tdb_common::types::{DecodedValue, DecodedVariable, RawTrace, TxContext};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    decode::{VariableDecoder, DEFAULT_MAX_ARRAY_ELEMENTS},
    error::TraceError,
    events::{DebuggerEvent, EventSender},
    navigator::StepNavigator,
    provider::{
        CompilationResultProvider, FileTraceCache, StorageProvider, TraceCache, TraceProvider,
    },
    scope::{build_scope_tree, BuildOutcome, ScopeTree, VariableId},
    trace::{TraceAnalysis, TraceStore},
};

/// Settings of a [`Debugger`].
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// Register locals and parameters during the scope build
    pub include_local_variables: bool,
    /// Cap on decoded array elements, `bytes` words and mapping entries
    pub max_array_elements: usize,
    /// Lifetime of cached traces; `None` keeps them forever
    pub cache_ttl: Option<Duration>,
    /// Root of the trace cache; `None` uses `TDB_CACHE_DIR` or `~/.tdb/cache`
    pub cache_dir: Option<PathBuf>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            include_local_variables: true,
            max_array_elements: DEFAULT_MAX_ARRAY_ELEMENTS,
            cache_ttl: None,
            cache_dir: None,
        }
    }
}

impl DebuggerConfig {
    /// Whether locals and parameters are registered.
    pub fn with_local_variables(mut self, include: bool) -> Self {
        self.include_local_variables = include;
        self
    }

    /// Cap on decoded collection sizes.
    pub fn with_max_array_elements(mut self, max: usize) -> Self {
        self.max_array_elements = max;
        self
    }

    /// Lifetime of newly cached traces.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Root directory of the trace cache.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Open the file trace cache for `chain` as configured.
    pub fn open_trace_cache(&self, chain: impl Into<Chain>) -> Result<Option<FileTraceCache>> {
        FileTraceCache::new(self.cache_dir.clone(), chain, self.cache_ttl)
    }
}

/// External collaborators of a [`Debugger`].
#[derive(Clone)]
pub struct Providers {
    /// Source of struct logs; without one only [`Debugger::debug_raw`] works
    pub trace: Option<Arc<dyn TraceProvider>>,
    /// Optional trace cache consulted before the trace provider
    pub cache: Option<Arc<dyn TraceCache>>,
    /// Compiler output by code address
    pub compilations: Arc<dyn CompilationResultProvider>,
    /// Pre-transaction storage values
    pub storage: Option<Arc<dyn StorageProvider>>,
}

impl Providers {
    /// Only compilation data: traces must be supplied with [`Debugger::debug_raw`].
    pub fn offline(compilations: Arc<dyn CompilationResultProvider>) -> Self {
        Self { trace: None, cache: None, compilations, storage: None }
    }
}

/// A source line, 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Source path as named in the compiler input
    pub file: String,
    /// 1-based line
    pub line: usize,
}

type BuildFuture = Shared<BoxFuture<'static, Option<BuildOutcome>>>;

/// State of the loaded trace.
struct Session {
    trace: Arc<TraceAnalysis>,
    build: BuildFuture,
}

/// Debugging session manager.
pub struct Debugger {
    config: DebuggerConfig,
    store: Arc<TraceStore>,
    compilations: Arc<dyn CompilationResultProvider>,
    storage: Option<Arc<dyn StorageProvider>>,
    navigator: Arc<Mutex<StepNavigator>>,
    session: Mutex<Option<Session>>,
    /// Bumped on every load and unload; a build only publishes into its own generation
    generation: Arc<AtomicU64>,
    events: EventSender,
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("generation", &self.generation.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Debugger {
    /// Debugger with nothing loaded.
    pub fn new(config: DebuggerConfig, providers: Providers) -> Self {
        let events = EventSender::default();
        Self {
            config,
            store: Arc::new(TraceStore::new(providers.trace, providers.cache)),
            compilations: providers.compilations,
            storage: providers.storage,
            navigator: Arc::new(Mutex::new(StepNavigator::new(events.clone()))),
            session: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Settings this debugger was created with.
    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent> {
        self.events.subscribe()
    }

    /// Fetch, analyse and start debugging `tx`, discarding the current session.
    ///
    /// Returns `Ok(false)` if a fetch is already in flight, or if another load or unload
    /// happened while the trace was being fetched. The late trace is dropped then.
    pub async fn debug(&self, tx: B256) -> Result<bool, TraceError> {
        let generation = self.end_session();
        info!(%tx, "Debugging transaction");
        let Some(trace) = self.store.fetch_trace(tx).await? else {
            return Ok(false);
        };
        if !self.start_session(trace, generation) {
            debug!(%tx, "Session was replaced while fetching, dropping the trace");
            return Ok(false);
        }
        Ok(true)
    }

    /// Start debugging an already fetched trace, discarding the current session.
    pub fn debug_raw(&self, tx: TxContext, raw: &RawTrace) -> Result<(), TraceError> {
        let generation = self.end_session();
        let trace = Arc::new(TraceAnalysis::analyse(tx, raw)?);
        self.start_session(trace, generation);
        Ok(())
    }

    /// Drop the current session. A no-op when nothing is loaded.
    pub fn unload(&self) {
        self.end_session();
    }

    /// Unload and return the generation a new session has to start from.
    fn end_session(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(session) = self.session.lock().take() else { return generation };
        self.navigator.lock().unload();
        self.store.reset();
        debug!(tx = %session.trace.tx().hash, "Session unloaded");
        self.events.send(DebuggerEvent::TraceUnloaded);
        generation
    }

    /// Install `trace` unless the session moved past `expected` in the meantime.
    fn start_session(&self, trace: Arc<TraceAnalysis>, expected: u64) -> bool {
        let mut session = self.session.lock();
        let generation = expected + 1;
        if self
            .generation
            .compare_exchange(expected, generation, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.store.replace(trace.clone());
        self.navigator.lock().load(trace.clone());
        self.events.send(DebuggerEvent::TraceLoaded { tx: trace.tx().hash, length: trace.len() });
        self.events.send(DebuggerEvent::TraceLengthChanged(trace.len()));

        let task = tokio::spawn(build_scope_tree(
            trace.clone(),
            self.compilations.clone(),
            self.config.include_local_variables,
        ));
        let current = self.generation.clone();
        let navigator = self.navigator.clone();
        let events = self.events.clone();
        let build = async move {
            let outcome = match task.await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    warn!("Scope tree build task failed: {err}");
                    None
                }
            };
            if current.load(Ordering::Acquire) != generation {
                debug!(generation, "Discarding scope tree of an abandoned session");
                return outcome;
            }
            let event = match &outcome {
                Some(BuildOutcome::Ready(tree)) => {
                    navigator.lock().set_tree(Some(tree.clone()));
                    DebuggerEvent::TreeReady { scopes: tree.scopes().len() }
                }
                Some(BuildOutcome::BuildFailed(reason)) => DebuggerEvent::TreeBuildFailed(reason.clone()),
                Some(BuildOutcome::NoCompilationData) => DebuggerEvent::NoCompilationData,
                None => DebuggerEvent::TreeNotReady,
            };
            events.send(event);
            outcome
        }
        .boxed()
        .shared();

        // Drive the build even if nobody awaits it.
        tokio::spawn(build.clone());
        *session = Some(Session { trace, build });
        true
    }

    /// The loaded trace.
    pub fn trace(&self) -> Option<Arc<TraceAnalysis>> {
        self.session.lock().as_ref().map(|s| s.trace.clone())
    }

    /// Wait for the scope build of the current session to finish.
    ///
    /// `None` when nothing is loaded or the build task died.
    pub async fn tree_outcome(&self) -> Option<BuildOutcome> {
        let build = self.session.lock().as_ref().map(|s| s.build.clone())?;
        build.await
    }

    /// The scope tree, once the build has succeeded.
    pub fn tree(&self) -> Option<Arc<ScopeTree>> {
        self.navigator.lock().tree().cloned()
    }

    /// Exclusive access to the navigator, for breakpoint management and stepping.
    pub fn navigator(&self) -> MutexGuard<'_, StepNavigator> {
        self.navigator.lock()
    }

    /// Step the navigator is at, `None` when nothing is loaded.
    pub fn current_step(&self) -> Option<usize> {
        self.navigator.lock().current_step()
    }

    /// Move to `step`. Returns whether the step changed.
    pub fn jump_to(&self, step: usize) -> bool {
        self.navigator.lock().jump_to(step)
    }

    /// See [`StepNavigator::step_into_forward`].
    pub fn step_into_forward(&self, source_level: bool) -> bool {
        self.navigator.lock().step_into_forward(source_level)
    }

    /// See [`StepNavigator::step_into_back`].
    pub fn step_into_back(&self, source_level: bool) -> bool {
        self.navigator.lock().step_into_back(source_level)
    }

    /// See [`StepNavigator::step_over_forward`].
    pub fn step_over_forward(&self, source_level: bool) -> bool {
        self.navigator.lock().step_over_forward(source_level)
    }

    /// See [`StepNavigator::step_over_back`].
    pub fn step_over_back(&self, source_level: bool) -> bool {
        self.navigator.lock().step_over_back(source_level)
    }

    /// See [`StepNavigator::jump_out`].
    pub fn jump_out(&self) -> bool {
        self.navigator.lock().jump_out()
    }

    /// See [`StepNavigator::jump_to_exception`].
    pub fn jump_to_exception(&self) -> bool {
        self.navigator.lock().jump_to_exception()
    }

    /// Next enabled breakpoint hit after the current step.
    pub fn jump_next_breakpoint(&self) -> bool {
        self.navigator.lock().jump_next_breakpoint()
    }

    /// Closest enabled breakpoint hit before the current step.
    pub fn jump_previous_breakpoint(&self) -> bool {
        self.navigator.lock().jump_previous_breakpoint()
    }

    fn decoder(&self) -> Option<VariableDecoder> {
        let trace = self.trace()?;
        let tree = self.tree()?;
        Some(
            VariableDecoder::new(trace, tree, self.storage.clone())
                .with_max_array_elements(self.config.max_array_elements),
        )
    }

    /// Decode local variable `id` at `step`; an inline error until the scope tree is ready.
    pub async fn decode_local_variable_by_id(&self, step: usize, id: VariableId) -> DecodedValue {
        match self.decoder() {
            Some(decoder) => decoder.decode_local_variable_by_id(step, id).await,
            None => not_ready(),
        }
    }

    /// Decode state variable `id` at `step`; an inline error until the scope tree is ready.
    pub async fn decode_state_variable_by_id(&self, step: usize, id: VariableId) -> DecodedValue {
        match self.decoder() {
            Some(decoder) => decoder.decode_state_variable_by_id(step, id).await,
            None => not_ready(),
        }
    }

    /// Locals in scope at `step`; empty until the scope tree is ready.
    pub async fn decode_locals_at(&self, step: usize) -> Vec<DecodedVariable> {
        match self.decoder() {
            Some(decoder) => decoder.decode_locals_at(step).await,
            None => Vec::new(),
        }
    }

    /// State variables of the storage context at `step`; empty until the scope tree is
    /// ready.
    pub async fn decode_state_at(&self, step: usize) -> Vec<DecodedVariable> {
        match self.decoder() {
            Some(decoder) => decoder.decode_state_at(step).await,
            None => Vec::new(),
        }
    }

    /// Gas spent per source line (1-based), by file.
    pub fn gas_per_line(&self) -> Option<BTreeMap<String, BTreeMap<usize, u64>>> {
        let tree = self.tree()?;
        Some(
            tree.gas_per_line()
                .iter()
                .map(|(file, lines)| {
                    (file.clone(), lines.iter().map(|(line, gas)| (line + 1, *gas)).collect())
                })
                .collect(),
        )
    }

    /// Source line executed at `step`.
    pub fn source_location_at(&self, step: usize) -> Option<SourcePosition> {
        let tree = self.tree()?;
        let (file, line) = tree.line_at(step)?;
        Some(SourcePosition { file: file.to_string(), line: line + 1 })
    }
}

fn not_ready() -> DecodedValue {
    DecodedValue::Error { ty: String::new(), error: "scope tree not ready".into() }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tdb_common::types::TraceOptions;
    use tokio::sync::{broadcast::error::TryRecvError, Notify};

    use super::*;
    use crate::{provider::StaticCompilationProvider, test_utils::*};

    /// Serves the counter trace once the gate is opened.
    struct GatedProvider {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TraceProvider for GatedProvider {
        async fn trace_transaction(&self, _tx: B256, _options: TraceOptions) -> Result<RawTrace> {
            self.gate.notified().await;
            Ok(counter_trace())
        }

        async fn transaction(&self, tx: B256) -> Result<TxContext> {
            Ok(TxContext { hash: tx, ..tx_to(addr(0xaa)) })
        }
    }

    fn counter_debugger() -> Debugger {
        tdb_common::ensure_test_logging(None);
        let registry = StaticCompilationProvider::new();
        registry.insert(addr(0xaa), counter_artifact());
        Debugger::new(DebuggerConfig::default(), Providers::offline(Arc::new(registry)))
    }

    fn drain(events: &mut broadcast::Receiver<DebuggerEvent>) -> Vec<DebuggerEvent> {
        let mut out = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) => return out,
                Err(err) => panic!("event channel: {err}"),
            }
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let debugger = counter_debugger();
        let mut events = debugger.subscribe();

        debugger.debug_raw(tx_to(addr(0xaa)), &counter_trace()).unwrap();
        let outcome = debugger.tree_outcome().await.unwrap();
        assert!(outcome.tree().is_some());
        assert_eq!(
            drain(&mut events),
            [
                DebuggerEvent::TraceLoaded { tx: B256::ZERO, length: 25 },
                DebuggerEvent::TraceLengthChanged(25),
                DebuggerEvent::TreeReady { scopes: 2 },
            ]
        );

        assert!(debugger.jump_to(0));
        assert!(debugger.step_over_forward(true));
        assert_eq!(debugger.current_step(), Some(22));
        assert_eq!(
            debugger.source_location_at(4),
            Some(SourcePosition { file: "src/Counter.sol".into(), line: 8 })
        );
        let gas: u64 = debugger.gas_per_line().unwrap().values().flat_map(|l| l.values()).sum();
        assert_eq!(gas, 75);

        let locals = debugger.decode_locals_at(10).await;
        assert_eq!(locals.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(), ["by", "total", "next"]);

        debugger.unload();
        assert!(drain(&mut events).contains(&DebuggerEvent::TraceUnloaded));
        assert!(!debugger.jump_to(3));
        assert!(debugger.tree_outcome().await.is_none());
        assert!(debugger.decode_locals_at(10).await.is_empty());
        assert!(matches!(
            debugger.decode_local_variable_by_id(10, VariableId::from(0)).await,
            DecodedValue::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_compilation_falls_back_to_opcodes() {
        let debugger = Debugger::new(
            DebuggerConfig::default(),
            Providers::offline(Arc::new(StaticCompilationProvider::new())),
        );
        let mut events = debugger.subscribe();
        debugger.debug_raw(tx_to(addr(0xaa)), &counter_trace()).unwrap();

        assert!(matches!(debugger.tree_outcome().await, Some(BuildOutcome::NoCompilationData)));
        assert_eq!(drain(&mut events).last(), Some(&DebuggerEvent::NoCompilationData));
        assert!(debugger.tree().is_none());
        assert!(debugger.gas_per_line().is_none());

        assert!(debugger.jump_to(0));
        assert!(debugger.step_into_forward(true));
        assert_eq!(debugger.current_step(), Some(1));
    }

    #[tokio::test]
    async fn test_reload_discards_previous_session() {
        let debugger = counter_debugger();
        debugger.debug_raw(tx_to(addr(0xaa)), &counter_trace()).unwrap();
        debugger.jump_to(5);

        let mut events = debugger.subscribe();
        debugger.debug_raw(tx_to(addr(0xaa)), &counter_trace()).unwrap();
        assert_eq!(debugger.current_step(), None);
        assert!(debugger.tree_outcome().await.unwrap().tree().is_some());

        let received = drain(&mut events);
        assert_eq!(received.first(), Some(&DebuggerEvent::TraceUnloaded));
        // Only the live session's build reports.
        assert_eq!(
            received.iter().filter(|e| matches!(e, DebuggerEvent::TreeReady { .. })).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_errors() {
        let debugger = counter_debugger();
        assert!(matches!(debugger.debug(B256::ZERO).await, Err(TraceError::NoProvider)));

        let empty = TraceBuilder::new().build();
        assert!(matches!(
            debugger.debug_raw(tx_to(addr(0xaa)), &empty),
            Err(TraceError::NotAContractInvocation)
        ));
        assert!(debugger.trace().is_none());
    }

    #[tokio::test]
    async fn test_late_fetch_does_not_replace_newer_session() {
        tdb_common::ensure_test_logging(None);
        let gate = Arc::new(Notify::new());
        let registry = StaticCompilationProvider::new();
        registry.insert(addr(0xaa), counter_artifact());
        let providers = Providers {
            trace: Some(Arc::new(GatedProvider { gate: gate.clone() })),
            cache: None,
            compilations: Arc::new(registry),
            storage: None,
        };
        let debugger = Arc::new(Debugger::new(DebuggerConfig::default(), providers));

        let fetched = B256::repeat_byte(1);
        let pending = tokio::spawn({
            let debugger = debugger.clone();
            async move { debugger.debug(fetched).await }
        });
        while !debugger.store.is_resolving() {
            tokio::task::yield_now().await;
        }

        let raw = B256::repeat_byte(2);
        debugger.debug_raw(TxContext { hash: raw, ..tx_to(addr(0xaa)) }, &counter_trace()).unwrap();
        let mut events = debugger.subscribe();

        gate.notify_one();
        assert!(!pending.await.unwrap().unwrap());
        assert_eq!(debugger.trace().unwrap().tx().hash, raw);
        assert_eq!(debugger.store.loaded().unwrap().tx().hash, raw);
        assert!(debugger.tree_outcome().await.unwrap().tree().is_some());
        assert!(!drain(&mut events).iter().any(|event| matches!(
            event,
            DebuggerEvent::TraceLoaded { .. } | DebuggerEvent::TraceUnloaded
        )));
    }
}
