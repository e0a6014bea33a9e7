use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

use super::error::{ComputeError, GraphError};
use super::event::{Event, EventId};
use super::processor::{Inputs, Processor};
use super::result::{NodeResult, ResultStatus, Value};

/// Diagnostics kept for every node which hit a data error
#[derive(Debug, Clone, PartialEq)]
pub struct DataErrorRecord {
    pub count: u64,
    pub last_event: EventId,
    pub last_message: String,
}

#[derive(Debug)]
enum EntryState {
    Building,
    Ready(Arc<NodeResult>),
    Failed(GraphError),
}

/// One (node, event id) slot of the result cache. The first caller builds it, everyone
/// else waits on `ready`.
#[derive(Debug)]
struct CacheEntry {
    state: Mutex<EntryState>,
    ready: Condvar,
}

impl CacheEntry {
    fn building() -> Self {
        Self {
            state: Mutex::new(EntryState::Building),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, state: EntryState) {
        *self.state.lock() = state;
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Arc<NodeResult>, GraphError> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                EntryState::Ready(result) => return Ok(result.clone()),
                EntryState::Failed(e) => return Err(e.clone()),
                EntryState::Building => self.ready.wait(&mut state),
            }
        }
    }

    fn is_building(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Building)
    }

    fn ready_result(&self) -> Option<Arc<NodeResult>> {
        match &*self.state.lock() {
            EntryState::Ready(result) => Some(result.clone()),
            _ => None,
        }
    }
}

/// Sliding window of cached results, oldest settled event ids evicted first.
/// Entries still being built are never evicted.
#[derive(Debug, Default)]
struct NodeCache {
    entries: FxHashMap<EventId, Arc<CacheEntry>>,
    order: VecDeque<EventId>,
}

impl NodeCache {
    /// Returns the entry for `id` and whether the caller has to build it
    fn claim(&mut self, id: EventId, depth: usize) -> (Arc<CacheEntry>, bool) {
        if let Some(entry) = self.entries.get(&id) {
            return (entry.clone(), false);
        }
        let entry = Arc::new(CacheEntry::building());
        self.entries.insert(id, entry.clone());
        self.order.push_back(id);
        while self.order.len() > depth {
            let entries = &self.entries;
            let Some(pos) = self
                .order
                .iter()
                .position(|old| entries.get(old).map_or(true, |e| !e.is_building()))
            else {
                break;
            };
            if let Some(old) = self.order.remove(pos) {
                self.entries.remove(&old);
            }
        }
        (entry, true)
    }

    fn remove(&mut self, id: EventId) {
        if self.entries.remove(&id).is_some() {
            self.order.retain(|other| *other != id);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

struct Node {
    processor: Box<dyn Processor>,
    dependency_names: Vec<String>,
    dependencies: Vec<usize>,
    condition: Option<usize>,
    cache: Mutex<NodeCache>,
}

impl Node {
    fn name(&self) -> &str {
        self.processor.name()
    }
}

/// Publishes the outcome of a build. If the builder unwinds, waiters are released
/// with an error and the entry is dropped from the cache.
struct BuildGuard<'a> {
    node: &'a Node,
    entry: Arc<CacheEntry>,
    id: EventId,
    finished: bool,
}

impl BuildGuard<'_> {
    fn finish(mut self, outcome: &Result<Arc<NodeResult>, GraphError>) {
        self.finished = true;
        match outcome {
            Ok(result) => self.entry.publish(EntryState::Ready(result.clone())),
            Err(e) => {
                self.entry.publish(EntryState::Failed(e.clone()));
                self.node.cache.lock().remove(self.id);
            }
        }
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.entry.publish(EntryState::Failed(GraphError::Fatal {
                node: self.node.name().to_string(),
                event: self.id,
                message: String::from("compute step panicked"),
            }));
            self.node.cache.lock().remove(self.id);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

/// The processor registry: a DAG of named processors evaluated lazily per event.
///
/// Each node computes at most once per event id. Concurrent requests for the same
/// (node, event id) wait for the first caller's result. Results are kept for the
/// `cache_depth` most recent event ids of each node.
pub struct ComputationGraph {
    nodes: Vec<Node>,
    index: FxHashMap<String, usize>,
    order: Vec<usize>,
    cache_depth: usize,
    data_errors: Mutex<FxHashMap<String, DataErrorRecord>>,
}

impl std::fmt::Debug for ComputationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationGraph")
            .field("nodes", &self.names())
            .field("cache_depth", &self.cache_depth)
            .finish()
    }
}

impl ComputationGraph {
    /// Register processors and resolve their dependencies.
    ///
    /// Duplicate names, missing dependencies and cycles are rejected here.
    pub fn from_processors(
        processors: Vec<Box<dyn Processor>>,
        cache_depth: usize,
    ) -> Result<Self, GraphError> {
        let mut index = FxHashMap::default();
        for (idx, processor) in processors.iter().enumerate() {
            if index.insert(processor.name().to_string(), idx).is_some() {
                return Err(GraphError::DuplicateName(processor.name().to_string()));
            }
        }

        let lookup = |node: &str, dependency: &str| -> Result<usize, GraphError> {
            index
                .get(dependency)
                .copied()
                .ok_or_else(|| GraphError::MissingDependency {
                    node: node.to_string(),
                    dependency: dependency.to_string(),
                })
        };

        let mut nodes = Vec::with_capacity(processors.len());
        for processor in processors {
            let dependency_names = processor.dependencies();
            let dependencies = dependency_names
                .iter()
                .map(|d| lookup(processor.name(), d))
                .collect::<Result<Vec<usize>, GraphError>>()?;
            let condition = match processor.condition() {
                Some(c) => Some(lookup(processor.name(), &c)?),
                None => None,
            };
            nodes.push(Node {
                processor,
                dependency_names,
                dependencies,
                condition,
                cache: Mutex::new(NodeCache::default()),
            });
        }

        let order = Self::resolve_order(&nodes)?;
        spdlog::debug!(
            "Resolved {} processors with cache depth {}",
            nodes.len(),
            cache_depth
        );

        Ok(Self {
            nodes,
            index,
            order,
            cache_depth: cache_depth.max(1),
            data_errors: Mutex::new(FxHashMap::default()),
        })
    }

    /// Topological order, dependencies (and conditions) first
    fn resolve_order(nodes: &[Node]) -> Result<Vec<usize>, GraphError> {
        fn visit(
            idx: usize,
            nodes: &[Node],
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
            order: &mut Vec<usize>,
        ) -> Result<(), GraphError> {
            match marks[idx] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    let start = stack.iter().position(|n| *n == idx).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|n| nodes[*n].name().to_string())
                        .collect();
                    cycle.push(nodes[idx].name().to_string());
                    return Err(GraphError::Cycle(cycle));
                }
                Mark::New => (),
            }
            marks[idx] = Mark::Active;
            stack.push(idx);
            let node = &nodes[idx];
            for dep in node.condition.iter().chain(node.dependencies.iter()) {
                visit(*dep, nodes, marks, stack, order)?;
            }
            stack.pop();
            marks[idx] = Mark::Done;
            order.push(idx);
            Ok(())
        }

        let mut marks = vec![Mark::New; nodes.len()];
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(nodes.len());
        for idx in 0..nodes.len() {
            visit(idx, nodes, &mut marks, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    /// Get the result of processor `name` for `event`, computing it if needed
    pub fn result(&self, name: &str, event: &Event) -> Result<Arc<NodeResult>, GraphError> {
        let idx = self
            .index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownProcessor(name.to_string()))?;
        let mut resolved: Vec<Option<Arc<NodeResult>>> = vec![None; self.nodes.len()];
        self.evaluate(idx, event, &mut resolved)
    }

    /// Evaluate every processor for `event`.
    ///
    /// Results resolved during the call are reused for the rest of it, so a dependency
    /// evicted from its cache window meanwhile is not computed again.
    pub fn evaluate_event(&self, event: &Event) -> Result<(), GraphError> {
        let mut resolved: Vec<Option<Arc<NodeResult>>> = vec![None; self.nodes.len()];
        for idx in self.order.iter() {
            self.evaluate(*idx, event, &mut resolved)?;
        }
        Ok(())
    }

    /// A result already computed for `id`, without triggering computation
    pub fn cached(&self, name: &str, id: EventId) -> Option<Arc<NodeResult>> {
        let node = &self.nodes[*self.index.get(name)?];
        let entry = node.cache.lock().entries.get(&id).cloned()?;
        entry.ready_result()
    }

    /// Forget every result for `id`
    pub fn invalidate(&self, id: EventId) {
        for node in self.nodes.iter() {
            node.cache.lock().remove(id);
        }
    }

    pub fn clear_cache(&self) {
        for node in self.nodes.iter() {
            node.cache.lock().clear();
        }
    }

    fn evaluate(
        &self,
        idx: usize,
        event: &Event,
        resolved: &mut [Option<Arc<NodeResult>>],
    ) -> Result<Arc<NodeResult>, GraphError> {
        if let Some(result) = &resolved[idx] {
            return Ok(result.clone());
        }
        let node = &self.nodes[idx];
        let (entry, is_builder) = node.cache.lock().claim(event.id(), self.cache_depth);
        if !is_builder {
            let result = entry.wait()?;
            resolved[idx] = Some(result.clone());
            return Ok(result);
        }
        let guard = BuildGuard {
            node,
            entry,
            id: event.id(),
            finished: false,
        };
        let outcome = self.build(node, event, resolved);
        guard.finish(&outcome);
        if let Ok(result) = &outcome {
            resolved[idx] = Some(result.clone());
        }
        outcome
    }

    fn build(
        &self,
        node: &Node,
        event: &Event,
        resolved: &mut [Option<Arc<NodeResult>>],
    ) -> Result<Arc<NodeResult>, GraphError> {
        let id = event.id();
        if let Some(condition) = node.condition {
            if !self.evaluate(condition, event, resolved)?.is_condition_true() {
                spdlog::trace!("Condition false for {} at event {}", node.name(), id);
                return Ok(Arc::new(NodeResult::skipped(id)));
            }
        }

        let mut inputs = Vec::with_capacity(node.dependencies.len());
        for dep in node.dependencies.iter() {
            inputs.push(self.evaluate(*dep, event, resolved)?);
        }

        let result = Arc::new(NodeResult::new(id));
        if let Some(pos) = inputs.iter().position(|r| r.is_unavailable()) {
            let message = format!(
                "upstream processor {} is unavailable",
                node.dependency_names[pos]
            );
            self.record_data_error(node.name(), id, &message);
            result.store(ResultStatus::Unavailable(message), Value::Empty);
            return Ok(result);
        }

        let view = Inputs::new(&node.dependency_names, &inputs);
        match node.processor.compute(event, &view) {
            Ok(value) => result.store(ResultStatus::Available, value),
            Err(ComputeError::Data(message)) => {
                self.record_data_error(node.name(), id, &message);
                result.store(ResultStatus::Unavailable(message), Value::Empty);
            }
            Err(ComputeError::Fatal(message)) => {
                return Err(GraphError::Fatal {
                    node: node.name().to_string(),
                    event: id,
                    message,
                })
            }
        }
        Ok(result)
    }

    fn record_data_error(&self, node: &str, id: EventId, message: &str) {
        spdlog::debug!("Processor {} unavailable for event {}: {}", node, id, message);
        let mut errors = self.data_errors.lock();
        match errors.get_mut(node) {
            Some(record) => {
                record.count += 1;
                record.last_event = id;
                record.last_message = message.to_string();
            }
            None => {
                errors.insert(
                    node.to_string(),
                    DataErrorRecord {
                        count: 1,
                        last_event: id,
                        last_message: message.to_string(),
                    },
                );
            }
        }
    }

    /// Snapshot of the data error diagnostics, sorted by processor name
    pub fn data_errors(&self) -> Vec<(String, DataErrorRecord)> {
        let mut errors: Vec<(String, DataErrorRecord)> = self
            .data_errors
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        errors.sort_by(|a, b| a.0.cmp(&b.0));
        errors
    }

    /// Processor names in evaluation order
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|idx| self.nodes[*idx].name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> Option<&[String]> {
        self.index
            .get(name)
            .map(|idx| self.nodes[*idx].dependency_names.as_slice())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn cache_depth(&self) -> usize {
        self.cache_depth
    }
}
