//! The runtime: registered instances, transactions, ticks and watchers.
//!
//! [`Runtime`] is a cheap handle to shared state behind one mutex. Work is
//! queued by transactions, links and deferred lanes, and applied by
//! [`Runtime::flush_now`], which runs one scheduler tick. Listeners and
//! telemetry callbacks are invoked after the lock is released, so they may
//! start new transactions.
//!
//! Deferred lanes and watchers need a tokio runtime. The handle is taken
//! from the context the runtime is created (or first used) in; without one,
//! deferred steps run synchronously after each commit.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use converge_foundation::{FieldPath, InstanceId, ModuleKey, should_sample};
use indexmap::IndexMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::config::{OverrideSet, ResolvedPolicies, RuntimeConfig};
use crate::converge::deferred::{DeferredFlush, FlushFn};
use crate::declaration::ModuleDeclaration;
use crate::diagnostics::{
    DiagnosticEvent, Diagnostics, DiagnosticsSink, HandlerFailureEvent, SchemaMismatchEvent,
    TracingSink,
};
use crate::error::{Error, Result, panic_message};
use crate::handlers::{
    ActionHandler, ActionSender, HandlerResult, WatcherHandle, WatcherSpec, spawn_watcher,
};
use crate::ir::{IrCache, StaticIrExport};
use crate::links::{InstanceLink, LinkTable};
use crate::scheduler::{Scheduler, TickReport};
use crate::state;
use crate::store::{DeferredWork, Instance, Priority, Store};
use crate::transaction::{StateTransaction, TxnMeta};

/// Called with the latest committed state of an instance after a tick.
pub type Listener = Arc<dyn Fn(&ModuleKey, &Value) + Send + Sync>;

/// Receives sampled reports of unstable ticks.
pub type TickTelemetry = Arc<dyn Fn(&TickReport) + Send + Sync>;

/// Identifies a listener registered with [`Runtime::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct RuntimeInner {
    config: RuntimeConfig,
    diagnostics: Diagnostics,
    ir_cache: IrCache,
    store: Store,
    links: LinkTable,
    scheduler: Scheduler,
    /// Instances with an open transaction.
    active: HashSet<ModuleKey>,
    listeners: IndexMap<ModuleKey, Vec<(SubscriptionId, Listener)>>,
    next_subscription: u64,
    telemetry: Option<TickTelemetry>,
    watchers: IndexMap<(ModuleKey, String), Vec<ActionSender>>,
    handle: Option<Handle>,
}

impl RuntimeInner {
    fn handle(&mut self) -> Option<Handle> {
        if self.handle.is_none() {
            self.handle = Handle::try_current().ok();
        }
        self.handle.clone()
    }

    /// Bring an instance's lane in line with its policies, queueing any
    /// work the lane gave back.
    fn sync_lane(&mut self, key: &ModuleKey, weak: &WeakRuntime) -> Result<()> {
        let handle = self.handle();
        let instance = self.store.get_mut(key)?;
        let replay = instance
            .sync_lane(handle.as_ref(), || lane_flush(weak.clone()))
            .map(|flush| instance.deferred_commit(flush.into()));
        if let Some(commit) = replay {
            self.store.enqueue(key, commit)?;
        }
        Ok(())
    }
}

/// Handle to a runtime; clones share state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Mutex<RuntimeInner>>,
}

/// Non-owning handle held by lanes and watchers.
#[derive(Clone)]
pub(crate) struct WeakRuntime {
    inner: Weak<Mutex<RuntimeInner>>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Runtime")
            .field("tick_seq", &inner.scheduler.tick_seq())
            .field("backlog", &inner.store.backlog())
            .field("links", &inner.links.len())
            .finish_non_exhaustive()
    }
}

/// Flush callback of a deferred lane: queue the work and run a tick.
fn lane_flush(weak: WeakRuntime) -> FlushFn {
    Arc::new(move |flush: DeferredFlush| {
        let Some(runtime) = weak.upgrade() else {
            return;
        };
        if runtime.accept_deferred(flush) {
            runtime.flush_now();
        }
    })
}

impl Runtime {
    /// Runtime reporting diagnostics to `tracing`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Runtime reporting diagnostics to `sink`.
    pub fn with_sink(config: RuntimeConfig, sink: Arc<dyn DiagnosticsSink>) -> Self {
        let diagnostics = Diagnostics::new(config.diagnostics.clone(), sink);
        let inner = RuntimeInner {
            scheduler: Scheduler::new(config.tick.clone()),
            config,
            diagnostics,
            ir_cache: IrCache::new(),
            store: Store::default(),
            links: LinkTable::default(),
            active: HashSet::new(),
            listeners: IndexMap::new(),
            next_subscription: 0,
            telemetry: None,
            watchers: IndexMap::new(),
            handle: Handle::try_current().ok(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Compile (or reuse) a module's IR and register one instance of it.
    ///
    /// Derived fields are computed by the instance's first commit, which
    /// always runs a full pass.
    #[instrument(skip_all, fields(module = %declaration.module_id()))]
    pub fn register_module(
        &self,
        declaration: &ModuleDeclaration,
        instance_id: impl Into<InstanceId>,
        initial: Value,
    ) -> Result<ModuleKey> {
        let weak = self.downgrade();
        let mut inner = self.lock();
        let module = declaration.module_id();
        let key = ModuleKey::new(module.clone(), instance_id.into());
        if inner.store.contains(&key) {
            return Err(Error::DuplicateInstance(key));
        }

        let compiled = inner.ir_cache.get_or_compile(declaration)?;
        for path in compiled.ir.shape_warnings() {
            inner
                .diagnostics
                .warn_once(&format!("schema:{module}:{path}"), || {
                    DiagnosticEvent::SchemaMismatch(SchemaMismatchEvent {
                        module: module.to_string(),
                        path: path.to_string(),
                    })
                });
        }

        let siblings: Vec<ModuleKey> = inner
            .store
            .instances_of(module)
            .map(|instance| {
                instance.rebind(&compiled);
                instance.key().clone()
            })
            .collect();
        for sibling in &siblings {
            inner.sync_lane(sibling, &weak)?;
        }

        let options = declaration.module_options().clone();
        let policies = ResolvedPolicies::resolve(&inner.config, module, &options, None);
        let instance = Instance::new(key.clone(), &compiled, options, policies, initial);
        inner.store.insert(instance)?;
        inner.sync_lane(&key, &weak)?;
        info!(
            key = %key,
            steps = compiled.ir.steps().len(),
            deferred = compiled.ir.deferred_count(),
            generation = compiled.ir.generation(),
            "instance registered"
        );
        Ok(key)
    }

    /// Run `body` against a draft of the instance's state and queue the
    /// result as a commit.
    ///
    /// The draft includes every commit already queued. A body returning an
    /// error commits nothing. Opening a second transaction on the same
    /// instance from inside `body` fails with [`Error::NestedTransaction`].
    /// The commit is applied by the next [`Runtime::flush_now`].
    pub fn run_with_state_transaction<R>(
        &self,
        key: &ModuleKey,
        meta: TxnMeta,
        body: impl FnOnce(&mut StateTransaction) -> Result<R>,
    ) -> Result<R> {
        let draft = {
            let mut inner = self.lock();
            let draft = inner.store.get(key)?.pending().clone();
            if !inner.active.insert(key.clone()) {
                return Err(Error::NestedTransaction(key.clone()));
            }
            draft
        };
        let mut guard = TxnGuard {
            runtime: self,
            key,
            armed: true,
        };

        let mut txn = StateTransaction::new(key.clone(), draft);
        let out = body(&mut txn)?;

        let mut inner = self.lock();
        inner.active.remove(key);
        guard.armed = false;
        if let Some(commit) = txn.into_commit(&meta) {
            let op_seq = inner.store.enqueue(key, commit)?;
            debug!(key = %key, op_seq, origin = %meta.origin_kind, "transaction committed");
        }
        Ok(out)
    }

    /// Queue a single write.
    pub fn set(&self, key: &ModuleKey, path: &str, value: Value) -> Result<()> {
        self.run_with_state_transaction(key, TxnMeta::default(), |txn| txn.set(path, value))
    }

    /// Run one scheduler tick and notify listeners of changed instances.
    pub fn flush_now(&self) -> TickReport {
        let (report, notifications, telemetry, diagnostics) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let output = inner
                .scheduler
                .tick(&mut inner.store, &inner.links, &inner.diagnostics);

            let notifications: Vec<(ModuleKey, Value, Vec<Listener>)> = output
                .changed
                .into_iter()
                .filter_map(|(key, value)| {
                    let listeners = inner.listeners.get(&key)?;
                    let listeners = listeners.iter().map(|(_, l)| l.clone()).collect();
                    Some((key, value, listeners))
                })
                .collect();

            let report = output.report;
            let sampled = !report.stable
                && inner
                    .config
                    .tick
                    .telemetry_sample_rate
                    .is_some_and(|rate| should_sample(report.tick_seq, rate));
            let telemetry = inner.telemetry.clone().filter(|_| sampled);
            (report, notifications, telemetry, inner.diagnostics.clone())
        };

        for (key, value, listeners) in notifications {
            for listener in listeners {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&key, &value))) {
                    report_panic(&diagnostics, &key, "listener", payload.as_ref());
                }
            }
        }
        if let Some(telemetry) = telemetry
            && let Err(payload) = catch_unwind(AssertUnwindSafe(|| telemetry(&report)))
        {
            let message = panic_message(payload.as_ref()).unwrap_or_default();
            warn!(tick_seq = report.tick_seq, %message, "tick telemetry callback panicked");
        }
        report
    }

    /// Flush until a tick finds nothing queued, at most `max_ticks` times.
    ///
    /// Returns the report of every non-idle tick.
    pub fn flush_until_idle(&self, max_ticks: usize) -> Vec<TickReport> {
        let mut reports = Vec::new();
        for _ in 0..max_ticks {
            let report = self.flush_now();
            if report.idle {
                break;
            }
            reports.push(report);
        }
        reports
    }

    /// Queue work handed back by a lane. Returns false if the instance is
    /// gone.
    fn accept_deferred(&self, flush: DeferredFlush) -> bool {
        let mut inner = self.lock();
        let key = flush.key.clone();
        let Ok(instance) = inner.store.get(&key) else {
            return false;
        };
        let commit = instance.deferred_commit(DeferredWork::from(flush));
        inner.store.enqueue(&key, commit).is_ok()
    }

    /// Committed state of an instance.
    pub fn state(&self, key: &ModuleKey) -> Result<Value> {
        Ok(self.lock().store.get(key)?.state().clone())
    }

    /// Read one field of an instance's committed state.
    pub fn read(&self, key: &ModuleKey, path: &str) -> Result<Option<Value>> {
        let path = FieldPath::parse(path).map_err(|source| Error::InvalidFieldPath {
            raw: path.to_string(),
            context: format!("read on {key}"),
            source,
        })?;
        self.lock().store.read(key, &path)
    }

    /// Transactions applied to an instance so far.
    pub fn txn_seq(&self, key: &ModuleKey) -> Result<u64> {
        Ok(self.lock().store.get(key)?.txn_seq())
    }

    pub fn tick_seq(&self) -> u64 {
        self.lock().scheduler.tick_seq()
    }

    /// Instances with queued commits, as (urgent, non-urgent) counts.
    pub fn backlog(&self) -> (usize, usize) {
        self.lock().store.backlog()
    }

    /// Whether the instance's deferred lane holds work not flushed yet.
    pub fn lane_pending(&self, key: &ModuleKey) -> Result<bool> {
        Ok(self.lock().store.get(key)?.lane_pending())
    }

    pub fn policies(&self, key: &ModuleKey) -> Result<ResolvedPolicies> {
        Ok(self.lock().store.get(key)?.policies().clone())
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.lock().diagnostics.clone()
    }

    /// Serializable description of the IR an instance runs.
    pub fn export_ir(&self, key: &ModuleKey) -> Result<StaticIrExport> {
        Ok(self.lock().store.get(key)?.executor().ir().export())
    }

    /// IR cache (hits, misses).
    pub fn ir_cache_stats(&self) -> (u64, u64) {
        self.lock().ir_cache.stats()
    }

    /// Replace the provider layer of an instance's policies.
    ///
    /// Lane changes apply immediately; pending deferred work is replayed
    /// under the new mode. Running watchers keep the limits they started
    /// with.
    pub fn set_provider_overrides(
        &self,
        key: &ModuleKey,
        provider: Option<OverrideSet>,
    ) -> Result<()> {
        let weak = self.downgrade();
        let mut inner = self.lock();
        let inner = &mut *inner;
        let instance = inner.store.get_mut(key)?;
        let policies = ResolvedPolicies::resolve(
            &inner.config,
            &key.module_id,
            instance.options(),
            provider.as_ref(),
        );
        debug!(
            key = %key,
            converge = ?policies.converge.config_scope,
            lanes = ?policies.lanes.config_scope,
            "provider overrides applied"
        );
        instance.set_policies(provider, policies);
        inner.sync_lane(key, &weak)
    }

    /// Copy `src_path` of `src` into `dst_path` of `dst` whenever it changes.
    ///
    /// The current source value is queued for the target right away.
    /// Returns false if the same link already exists.
    pub fn link_instances(
        &self,
        src: &ModuleKey,
        src_path: &str,
        dst: &ModuleKey,
        dst_path: &str,
    ) -> Result<bool> {
        let link = InstanceLink::new(src.clone(), src_path, dst.clone(), dst_path)?;
        let mut inner = self.lock();
        let value = state::read_value(inner.store.get(src)?.state(), &link.src_path);
        let prev = state::read_value(inner.store.get(dst)?.pending(), &link.dst_path);
        if !inner.links.add(link.clone()) {
            return Ok(false);
        }
        info!(src = %src, src_path, dst = %dst, dst_path, "instances linked");
        if let Some(value) = value
            && prev.as_ref() != Some(&value)
        {
            let commit = link.commit(value, prev, Priority::Normal);
            inner.store.enqueue(dst, commit)?;
        }
        Ok(true)
    }

    /// Call `listener` with the instance's state after every tick that
    /// changed it.
    pub fn subscribe(
        &self,
        key: &ModuleKey,
        listener: impl Fn(&ModuleKey, &Value) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let mut inner = self.lock();
        inner.store.get(key)?;
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        Ok(id)
    }

    /// Remove a listener; returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let mut removed = false;
        for listeners in inner.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(sid, _)| *sid != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    /// Receive sampled reports of unstable ticks.
    ///
    /// Sampling is off unless `tick.telemetry_sample_rate` is configured.
    pub fn set_degraded_tick_telemetry(
        &self,
        telemetry: impl Fn(&TickReport) + Send + Sync + 'static,
    ) {
        self.lock().telemetry = Some(Arc::new(telemetry));
    }

    /// Start a watcher running `handler` for every payload dispatched to
    /// `action` on `key`.
    ///
    /// Handlers commit through [`Runtime::run_with_state_transaction`] and
    /// call [`Runtime::flush_now`] when they want their writes applied.
    pub fn watch<F, Fut>(
        &self,
        key: &ModuleKey,
        action: impl Into<String>,
        handler: F,
    ) -> Result<WatcherHandle>
    where
        F: Fn(Runtime, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let action = action.into();
        let handler: ActionHandler = Arc::new(move |runtime, payload| Box::pin(handler(runtime, payload)));
        let runtime = self.downgrade();
        let mut inner = self.lock();
        let policy = inner.store.get(key)?.policies().concurrency.clone();
        let handle = inner.handle().ok_or_else(|| Error::NoAsyncRuntime {
            action: action.clone(),
        })?;
        let (watcher, sender) = spawn_watcher(
            &handle,
            WatcherSpec {
                key: key.clone(),
                action: action.clone(),
                policy,
                diagnostics: inner.diagnostics.clone(),
                runtime,
                handler,
            },
        );
        let senders = inner.watchers.entry((key.clone(), action)).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(sender);
        Ok(watcher)
    }

    fn senders(&self, key: &ModuleKey, action: &str) -> Result<Vec<ActionSender>> {
        let mut inner = self.lock();
        inner.store.get(key)?;
        let Some(senders) = inner.watchers.get_mut(&(key.clone(), action.to_string())) else {
            return Ok(Vec::new());
        };
        senders.retain(|s| !s.is_closed());
        Ok(senders.clone())
    }

    /// Send `payload` to every watcher of `action` on `key`, waiting while
    /// a watcher's channel is full. Returns the number of watchers reached.
    pub async fn dispatch(&self, key: &ModuleKey, action: &str, payload: Value) -> Result<usize> {
        let senders = self.senders(key, action)?;
        for sender in &senders {
            sender.send(payload.clone()).await?;
        }
        Ok(senders.len())
    }

    /// Like [`Runtime::dispatch`] without waiting; a full channel fails
    /// with [`Error::Backpressure`].
    pub fn try_dispatch(&self, key: &ModuleKey, action: &str, payload: Value) -> Result<usize> {
        let senders = self.senders(key, action)?;
        for sender in &senders {
            sender.try_send(payload.clone())?;
        }
        Ok(senders.len())
    }
}

/// Releases the open-transaction mark when a body fails or panics.
struct TxnGuard<'a> {
    runtime: &'a Runtime,
    key: &'a ModuleKey,
    armed: bool,
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.runtime.lock().active.remove(self.key);
        }
    }
}

fn report_panic(
    diagnostics: &Diagnostics,
    key: &ModuleKey,
    action: &str,
    payload: &(dyn std::any::Any + Send),
) {
    let (message, downgrade) = match panic_message(payload) {
        Some(message) => (message, None),
        None => (
            format!("{action} panicked"),
            Some("panic payload was not a string".to_string()),
        ),
    };
    warn!(module = %key, action, %message, "callback panicked");
    diagnostics.emit(DiagnosticEvent::HandlerFailure(HandlerFailureEvent {
        module: key.to_string(),
        action: action.to_string(),
        message,
        downgrade,
    }));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::declaration::{DeclarationGroup, FieldEntry};
    use crate::diagnostics::{DiagnosticsConfig, DiagnosticsLevel, MemorySink};

    fn counter() -> ModuleDeclaration {
        ModuleDeclaration::new("counter").group(DeclarationGroup::new("derived").field(
            "double",
            FieldEntry::computed(["n"], |s| Ok(json!(s.get("n").as_i64().unwrap_or(0) * 2))),
        ))
    }

    fn runtime() -> (Runtime, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = RuntimeConfig {
            diagnostics: DiagnosticsConfig {
                level: DiagnosticsLevel::Light,
                ..DiagnosticsConfig::default()
            },
            ..RuntimeConfig::default()
        };
        (Runtime::with_sink(config, sink.clone()), sink)
    }

    #[test]
    fn test_transaction_commits_on_flush() {
        let (rt, _) = runtime();
        let key = rt.register_module(&counter(), "a", json!({"n": 0})).unwrap();
        rt.set(&key, "n", json!(4)).unwrap();
        assert_eq!(rt.state(&key).unwrap(), json!({"n": 0}));
        assert_eq!(rt.backlog(), (1, 0));

        let report = rt.flush_now();
        assert!(report.stable);
        assert_eq!(rt.state(&key).unwrap(), json!({"n": 4, "double": 8}));
        assert_eq!(rt.read(&key, "double").unwrap(), Some(json!(8)));
        assert_eq!(rt.txn_seq(&key).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let (rt, _) = runtime();
        rt.register_module(&counter(), "a", json!({})).unwrap();
        assert!(matches!(
            rt.register_module(&counter(), "a", json!({})),
            Err(Error::DuplicateInstance(_))
        ));
        assert_eq!(rt.ir_cache_stats(), (0, 1));
    }

    #[test]
    fn test_reregistered_module_uses_latest_derive() {
        let offset = |by: i64| {
            ModuleDeclaration::new("offset").group(DeclarationGroup::new("derived").field(
                "d",
                FieldEntry::computed(["n"], move |s| {
                    Ok(json!(s.get("n").as_i64().unwrap_or(0) + by))
                }),
            ))
        };
        let (rt, _) = runtime();
        let a = rt.register_module(&offset(1), "a", json!({"n": 0})).unwrap();
        let b = rt.register_module(&offset(100), "b", json!({"n": 0})).unwrap();
        assert_eq!(rt.ir_cache_stats(), (1, 1));

        rt.set(&a, "n", json!(1)).unwrap();
        rt.set(&b, "n", json!(1)).unwrap();
        rt.flush_now();
        // Instances of a module share its latest declaration.
        assert_eq!(rt.read(&a, "d").unwrap(), Some(json!(101)));
        assert_eq!(rt.read(&b, "d").unwrap(), Some(json!(101)));
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let (rt, _) = runtime();
        let key = rt.register_module(&counter(), "a", json!({"n": 0})).unwrap();
        let nested = rt.run_with_state_transaction(&key, TxnMeta::default(), |txn| {
            txn.set("n", json!(1))?;
            Ok(rt.set(&key, "n", json!(2)))
        });
        assert!(matches!(nested, Ok(Err(Error::NestedTransaction(_)))));

        // The mark is released once the outer body returns.
        rt.set(&key, "n", json!(3)).unwrap();
        rt.flush_now();
        assert_eq!(rt.read(&key, "n").unwrap(), Some(json!(3)));
    }

    #[test]
    fn test_failed_body_commits_nothing() {
        let (rt, _) = runtime();
        let key = rt.register_module(&counter(), "a", json!({"n": 0})).unwrap();
        let result = rt.run_with_state_transaction(&key, TxnMeta::default(), |txn| {
            txn.set("n", json!(9))?;
            txn.set("items[x]", json!(1))
        });
        assert!(result.is_err());
        assert_eq!(rt.backlog(), (0, 0));
        assert!(rt.flush_now().idle);
    }

    #[test]
    fn test_listener_panic_is_isolated() {
        let (rt, sink) = runtime();
        let key = rt.register_module(&counter(), "a", json!({"n": 0})).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        rt.subscribe(&key, |_, _| panic!("listener exploded")).unwrap();
        let id = rt
            .subscribe(&key, move |_, state| {
                assert_eq!(state["double"], json!(2));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        rt.set(&key, "n", json!(1)).unwrap();
        assert!(rt.flush_now().stable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failures = sink.of_kind("diagnostic:handler-failure");
        assert_eq!(failures.len(), 1);
        let DiagnosticEvent::HandlerFailure(event) = &failures[0] else {
            unreachable!()
        };
        assert_eq!(event.message, "listener exploded");

        assert!(rt.unsubscribe(id));
        assert!(!rt.unsubscribe(id));
    }

    #[test]
    fn test_link_queues_initial_copy() {
        let (rt, _) = runtime();
        let a = rt.register_module(&counter(), "a", json!({"n": 5})).unwrap();
        let b = rt.register_module(&counter(), "b", json!({"n": 0})).unwrap();
        assert!(rt.link_instances(&a, "n", &b, "n").unwrap());
        assert!(!rt.link_instances(&a, "n", &b, "n").unwrap());

        rt.flush_now();
        assert_eq!(rt.state(&b).unwrap(), json!({"n": 5, "double": 10}));
    }

    #[test]
    fn test_degraded_tick_telemetry_sampled() {
        let sink = Arc::new(MemorySink::new());
        let mut config = RuntimeConfig::default();
        config.tick.urgent_step_cap = 0;
        config.tick.telemetry_sample_rate = Some(1.0);
        let rt = Runtime::with_sink(config, sink);
        let key = rt.register_module(&counter(), "a", json!({"n": 0})).unwrap();
        let sampled = Arc::new(AtomicUsize::new(0));
        let counter = sampled.clone();
        rt.set_degraded_tick_telemetry(move |report| {
            assert!(!report.stable);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rt.set(&key, "n", json!(1)).unwrap();
        let report = rt.flush_now();
        assert!(!report.stable);
        assert_eq!(sampled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_background_work_degrades_tick() {
        let sink = Arc::new(MemorySink::new());
        let mut config = RuntimeConfig::default();
        config.tick.max_steps = 1;
        config.tick.telemetry_sample_rate = Some(1.0);
        let rt = Runtime::with_sink(config, sink);
        let urgent = rt.register_module(&counter(), "urgent", json!({"n": 0})).unwrap();
        let background = rt.register_module(&counter(), "background", json!({"n": 0})).unwrap();
        let sampled = Arc::new(AtomicUsize::new(0));
        let counter = sampled.clone();
        rt.set_degraded_tick_telemetry(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rt.run_with_state_transaction(
            &background,
            TxnMeta::action("prefetch").with_priority(Priority::Low),
            |txn| txn.set("n", json!(7)),
        )
        .unwrap();
        rt.set(&urgent, "n", json!(3)).unwrap();

        let report = rt.flush_now();
        assert_eq!(report.deferred, vec![background.clone()]);
        assert!(!report.stable);
        assert_eq!(sampled.load(Ordering::SeqCst), 1);

        assert!(rt.flush_now().stable);
        assert_eq!(sampled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watcher_commits_through_transactions() {
        let (rt, _) = runtime();
        let key = rt.register_module(&counter(), "a", json!({"n": 0})).unwrap();
        let target = key.clone();
        let watcher = rt
            .watch(&key, "add", move |rt, payload| {
                let key = target.clone();
                async move {
                    let by = payload.as_i64().ok_or("payload must be an integer")?;
                    rt.run_with_state_transaction(&key, TxnMeta::action("add"), |txn| {
                        let n = txn.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                        txn.set("n", json!(n + by))
                    })
                    .map_err(|e| e.to_string())?;
                    rt.flush_now();
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(rt.dispatch(&key, "add", json!(2)).await.unwrap(), 1);
        assert_eq!(rt.dispatch(&key, "none", json!(2)).await.unwrap(), 0);
        watcher.dispatch(json!(3)).await.unwrap();

        let stats = loop {
            if rt.read(&key, "n").unwrap() == Some(json!(5)) {
                break watcher.shutdown().await;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(stats.completed, 2);
        assert_eq!(rt.read(&key, "double").unwrap(), Some(json!(10)));
    }

    #[test]
    fn test_watch_without_tokio_fails() {
        let (rt, _) = runtime();
        let key = rt.register_module(&counter(), "a", json!({})).unwrap();
        let result = rt.watch(&key, "noop", |_, _| async { Ok(()) });
        assert!(matches!(result, Err(Error::NoAsyncRuntime { .. })));
    }
}
