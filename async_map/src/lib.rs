// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Subjective style.
#![allow(clippy::type_complexity, clippy::new_without_default)]

use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use futures::channel::oneshot;
use parking_lot::Mutex;
use petgraph::graph::DiGraph;
use task_executor::Executor;

///
/// A failure produced by a keyed consumer. Failures are sticky: once a key has failed, all
/// current and future waiters observe the same failure, and the producer is never retried.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Failure {
    pub message: String,
    pub fatal: bool,
}

impl Failure {
    pub fn new(message: impl Into<String>, fatal: bool) -> Failure {
        Failure {
            message: message.into(),
            fatal,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Failure {
        Failure::new(message, true)
    }

    ///
    /// Decorates the message with enclosing context, preserving fatality.
    ///
    pub fn decorate(self, context: impl fmt::Display) -> Failure {
        Failure {
            message: format!("{}:\n{}", context, self.message),
            fatal: self.fatal,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type Result<V> = std::result::Result<V, Failure>;

///
/// Identifies one key of one consumer map in the waits-for registry.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeId {
    map: &'static str,
    key: String,
}

impl NodeId {
    fn new(map: &'static str, key: String) -> NodeId {
        NodeId { map, key }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.map, self.key)
    }
}

type FailHandle = Box<dyn FnOnce(Failure) + Send>;

#[derive(Default)]
struct RegistryInner {
    /// Fail handles for producers that are currently running.
    running: HashMap<NodeId, FailHandle>,
    /// For each running producer, the keys it is currently suspended on.
    waits: HashMap<NodeId, HashSet<NodeId>>,
    /// Bumped whenever any producer completes; used to detect quiescence.
    progress: u64,
}

///
/// The shared waits-for registry of all consumer maps in one build. When no producer has
/// completed for a full scheduling quantum, the registry is asked to locate cycles among
/// suspended producers and terminate one key per cycle.
///
pub struct WaitRegistry {
    inner: Mutex<RegistryInner>,
}

impl WaitRegistry {
    pub fn new() -> WaitRegistry {
        WaitRegistry {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn producer_started(&self, node: NodeId, fail: FailHandle) {
        let mut inner = self.inner.lock();
        inner.running.insert(node, fail);
    }

    fn producer_finished(&self, node: &NodeId) {
        let mut inner = self.inner.lock();
        inner.running.remove(node);
        inner.waits.remove(node);
        inner.progress += 1;
    }

    fn wait_edge(&self, from: &NodeId, to: &NodeId) {
        let mut inner = self.inner.lock();
        inner.waits.entry(from.clone()).or_default().insert(to.clone());
    }

    fn unwait_edge(&self, from: &NodeId, to: &NodeId) {
        let mut inner = self.inner.lock();
        if let Some(targets) = inner.waits.get_mut(from) {
            targets.remove(to);
        }
    }

    fn progress(&self) -> u64 {
        self.inner.lock().progress
    }

    ///
    /// Locates cycles among suspended producers and fails one key in each. Returns the
    /// number of keys failed.
    ///
    /// Finding all simple cycles is not necessary: killing one member per strongly
    /// connected component unblocks the rest, and the check runs again if the build
    /// stalls once more.
    ///
    pub fn terminate_cycles(&self) -> usize {
        let mut inner = self.inner.lock();

        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut indices = HashMap::default();
        for node in inner.running.keys() {
            let index = graph.add_node(node.clone());
            indices.insert(node.clone(), index);
        }
        for (from, targets) in &inner.waits {
            let Some(&from_index) = indices.get(from) else {
                continue;
            };
            for to in targets {
                if let Some(&to_index) = indices.get(to) {
                    graph.add_edge(from_index, to_index, ());
                }
            }
        }

        let mut terminated = 0;
        for scc in petgraph::algo::kosaraju_scc(&graph) {
            let is_cycle = scc.len() > 1
                || (scc.len() == 1 && graph.contains_edge(scc[0], scc[0]));
            if !is_cycle {
                continue;
            }
            let mut path: Vec<String> = scc.iter().map(|&i| graph[i].to_string()).collect();
            path.push(graph[scc[0]].to_string());
            let message = format!("cycle detected: {}", path.join(" -> "));
            let candidate = graph[scc[0]].clone();
            if let Some(fail) = inner.running.remove(&candidate) {
                inner.waits.remove(&candidate);
                inner.progress += 1;
                log::debug!("Terminating {candidate} to break a cycle");
                fail(Failure::fatal(message));
                terminated += 1;
            }
        }
        terminated
    }
}

///
/// The task-side handle threaded through producers: the executor producers are spawned on,
/// the shared waits-for registry, and the identity of the producer the handle belongs to.
///
#[derive(Clone)]
pub struct Context {
    executor: Executor,
    registry: Arc<WaitRegistry>,
    current: Option<NodeId>,
    quantum: Duration,
}

impl Context {
    pub fn new(executor: Executor) -> Context {
        Context::with_quantum(executor, Duration::from_millis(500))
    }

    ///
    /// As `new`, with an explicit scheduling quantum after which a stalled wait triggers
    /// the cycle check.
    ///
    pub fn with_quantum(executor: Executor, quantum: Duration) -> Context {
        Context {
            executor,
            registry: Arc::new(WaitRegistry::new()),
            current: None,
            quantum,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.registry
    }

    fn for_node(&self, node: NodeId) -> Context {
        Context {
            executor: self.executor.clone(),
            registry: self.registry.clone(),
            current: Some(node),
            quantum: self.quantum,
        }
    }
}

enum Slot<V> {
    Running(Vec<oneshot::Sender<Result<V>>>),
    Completed(Result<V>),
}

///
/// A keyed memoising consumer: stores `K -> V` and suspends requesters until the value is
/// ready. The producer for a key runs at most once per map; errors are sticky.
///
pub struct AsyncMap<K, V> {
    name: &'static str,
    inner: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> Clone for AsyncMap<K, V> {
    fn clone(&self) -> Self {
        AsyncMap {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> AsyncMap<K, V>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> AsyncMap<K, V> {
        AsyncMap {
            name,
            inner: Arc::new(Mutex::new(HashMap::default())),
        }
    }

    ///
    /// Returns the value for the key, producing it via `producer` if this is the first
    /// request. Later requesters suspend until the producer completes; while suspended,
    /// the requesting producer's waits-for edge is visible to the cycle check.
    ///
    pub async fn get<F, Fut>(&self, context: &Context, key: K, producer: F) -> Result<V>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let node = NodeId::new(self.name, key.to_string());

        enum Acquired<V> {
            Done(Result<V>),
            Wait(oneshot::Receiver<Result<V>>),
            Spawn(oneshot::Receiver<Result<V>>),
        }

        let acquired = {
            let mut inner = self.inner.lock();
            match inner.entry(key.clone()) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    Slot::Completed(result) => Acquired::Done(result.clone()),
                    Slot::Running(waiters) => {
                        let (send, recv) = oneshot::channel();
                        waiters.push(send);
                        Acquired::Wait(recv)
                    }
                },
                Entry::Vacant(vacant) => {
                    let (send, recv) = oneshot::channel();
                    vacant.insert(Slot::Running(vec![send]));
                    Acquired::Spawn(recv)
                }
            }
        };

        let recv = match acquired {
            Acquired::Done(result) => return result,
            Acquired::Wait(recv) => recv,
            Acquired::Spawn(recv) => {
                let fail_handle: FailHandle = {
                    let map = self.clone();
                    let key = key.clone();
                    Box::new(move |failure| map.complete(&key, Err(failure)))
                };
                context.registry.producer_started(node.clone(), fail_handle);

                let future = producer(context.for_node(node.clone()));
                let map = self.clone();
                let registry = context.registry.clone();
                let completed_node = node.clone();
                context.executor.native_spawn(async move {
                    let result = future.await;
                    registry.producer_finished(&completed_node);
                    map.complete(&key, result);
                });
                recv
            }
        };

        self.wait(context, node, recv).await
    }

    ///
    /// Returns the value for the key iff it has already completed.
    ///
    pub fn peek(&self, key: &K) -> Option<Result<V>> {
        match self.inner.lock().get(key) {
            Some(Slot::Completed(result)) => Some(result.clone()),
            _ => None,
        }
    }

    async fn wait(
        &self,
        context: &Context,
        node: NodeId,
        mut recv: oneshot::Receiver<Result<V>>,
    ) -> Result<V> {
        if let Some(from) = &context.current {
            context.registry.wait_edge(from, &node);
        }

        let mut last_progress = context.registry.progress();
        let result = loop {
            match tokio::time::timeout(context.quantum, &mut recv).await {
                Ok(Ok(result)) => break result,
                Ok(Err(_cancelled)) => {
                    break Err(Failure::fatal(format!("Producer for {node} went away")))
                }
                Err(_elapsed) => {
                    // Nothing has completed for a full quantum: look for cycles among the
                    // suspended producers.
                    let progress = context.registry.progress();
                    if progress == last_progress {
                        context.registry.terminate_cycles();
                    }
                    last_progress = progress;
                }
            }
        };

        if let Some(from) = &context.current {
            context.registry.unwait_edge(from, &node);
        }
        result
    }

    fn complete(&self, key: &K, result: Result<V>) {
        let waiters = {
            let mut inner = self.inner.lock();
            match inner.get_mut(key) {
                Some(slot @ Slot::Running(_)) => {
                    let previous = std::mem::replace(slot, Slot::Completed(result.clone()));
                    match previous {
                        Slot::Running(waiters) => waiters,
                        Slot::Completed(_) => unreachable!(),
                    }
                }
                // Already completed (e.g. failed by the cycle check): the first result is
                // sticky, so a late producer result is dropped.
                _ => return,
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests;
