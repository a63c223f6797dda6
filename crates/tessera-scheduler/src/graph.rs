//! Task-graph compilation.
//!
//! [`compile`] expands every task into one instance per selected patch,
//! derives dependency edges from the `computes`/`requires`/`modifies`
//! declarations, and produces a deterministic execution order:
//!
//! ```text
//!   producer of (L, q, m) ──L──▶ reader of L on p     (q = p or q within the ghost halo of p)
//!   producer of (L, p, m) ──L──▶ modifier of L on p ──L──▶ later modifiers / readers
//!   contributors to R     ──R──▶ reduce(R) ──R──▶ readers of R
//! ```
//!
//! Only new-generation reads create edges; old-generation data is
//! complete before the timestep starts. The order is a topological sort
//! whose ties are broken by task index, then patch id, so every rank of
//! a run derives the same global order from the same declarations.

use crate::balance::LoadBalancer;
use crate::error::GraphError;
use crate::task::{Dependency, PatchSelection, Role, Task};
use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use tessera_core::{Grid, MaterialIndex, PatchId, Rank, VarLabel, VariableCatalog};
use tessera_warehouse::Which;
use tracing::debug;

// ── Compiled form ────────────────────────────────────────────────

/// One task running on one patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskInstance {
    /// Index of the task in declaration order.
    pub task: usize,
    /// Patch it runs on.
    pub patch: PatchId,
    /// Rank that executes it.
    pub rank: Rank,
}

/// Cross-rank combination of one reduction variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReduceStep {
    /// The reduction.
    pub label: VarLabel,
    /// Materials contributed to.
    pub materials: Vec<MaterialIndex>,
}

/// One entry of the execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduledNode {
    /// Run a task instance (only on its assigned rank).
    Task(TaskInstance),
    /// Seal and combine a reduction (on every rank).
    Reduce(ReduceStep),
}

/// Number of `modifies` writes one rank will make to one variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Modification {
    /// The modified label.
    pub label: VarLabel,
    /// Its patch.
    pub patch: PatchId,
    /// Its material.
    pub material: MaterialIndex,
    /// Rank running the modifiers.
    pub rank: Rank,
    /// Number of modifying task instances.
    pub count: u32,
}

/// The rank that holds one `(label, patch)` this timestep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ownership {
    /// Grid variable.
    pub label: VarLabel,
    /// Its patch.
    pub patch: PatchId,
    /// Rank holding it.
    pub rank: Rank,
    /// Materials written on that rank, ascending.
    pub materials: Vec<MaterialIndex>,
}

/// A validated task graph with its global execution order.
#[derive(Clone, Debug)]
pub struct CompiledGraph {
    tasks: Vec<Task>,
    order: Vec<ScheduledNode>,
    ownership: Vec<Ownership>,
    carried_ownership: Vec<Ownership>,
    modifications: Vec<Modification>,
    edges: usize,
}

impl CompiledGraph {
    /// The tasks, in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Global execution order.
    pub fn order(&self) -> &[ScheduledNode] {
        &self.order
    }

    /// Owner of every grid variable produced, sorted by label then patch.
    pub fn ownership(&self) -> &[Ownership] {
        &self.ownership
    }

    /// Owner of every carried-forward key that a task modifies: the rank
    /// the patch is assigned to now, which need not be the rank that
    /// held the value last timestep.
    pub fn carried_ownership(&self) -> &[Ownership] {
        &self.carried_ownership
    }

    /// Every key written by `modifies` declarations.
    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// Number of scheduled nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Task instances assigned to `rank`, in execution order.
    pub fn instances_on(&self, rank: Rank) -> impl Iterator<Item = &TaskInstance> + '_ {
        self.order.iter().filter_map(move |n| match n {
            ScheduledNode::Task(i) if i.rank == rank => Some(i),
            _ => None,
        })
    }

    /// Human-readable order: `task@patch` and `reduce(label)`.
    pub fn describe(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|n| match n {
                ScheduledNode::Task(i) => format!("{}@{}", self.tasks[i.task].name(), i.patch),
                ScheduledNode::Reduce(r) => format!("reduce({})", r.label),
            })
            .collect()
    }
}

// ── Compilation ──────────────────────────────────────────────────

type VarKey = (VarLabel, PatchId, MaterialIndex);

/// Ordering key: `(task index, kind, patch or sequence)`.
type OrderKey = (usize, u8, u32);

struct Contribution {
    nodes: Vec<NodeIndex>,
    materials: BTreeSet<MaterialIndex>,
    last_task: usize,
}

/// Compile `tasks` for `grid`.
///
/// `carried` lists labels copied forward from the old generation; they
/// satisfy new-generation reads without a producer and may not be
/// computed.
pub fn compile(
    tasks: &[Task],
    grid: &Grid,
    catalog: &VariableCatalog,
    balancer: &dyn LoadBalancer,
    carried: &[VarLabel],
    max_ghost: u32,
) -> Result<CompiledGraph, GraphError> {
    let mut names = HashSet::new();
    for task in tasks {
        if !names.insert(task.name()) {
            return Err(GraphError::DuplicateTaskName {
                name: task.name().to_string(),
            });
        }
    }
    let carried: BTreeSet<VarLabel> = carried.iter().cloned().collect();
    let world_size = balancer.world_size();

    let mut graph: DiGraph<ScheduledNode, VarLabel> = DiGraph::new();
    let mut instances: IndexMap<(usize, PatchId), NodeIndex> = IndexMap::new();

    // 1. Validate declarations and create one node per (task, patch).
    for (t, task) in tasks.iter().enumerate() {
        for (role, dep) in task.dependencies() {
            validate_dependency(task, role, dep, catalog, &carried, max_ghost)?;
        }
        for patch in select_patches(task, grid)? {
            let rank = balancer.processor_assignment(patch);
            if rank.index() >= world_size {
                return Err(GraphError::UnknownRank {
                    patch,
                    rank,
                    world_size,
                });
            }
            let node = graph.add_node(ScheduledNode::Task(TaskInstance {
                task: t,
                patch,
                rank,
            }));
            instances.insert((t, patch), node);
        }
    }

    // 2. Index writers.
    let mut producers: IndexMap<VarKey, NodeIndex> = IndexMap::new();
    let mut modifiers: IndexMap<VarKey, Vec<NodeIndex>> = IndexMap::new();
    let mut contributions: IndexMap<VarLabel, Contribution> = IndexMap::new();
    for (&(t, patch), &node) in &instances {
        let task = &tasks[t];
        for dep in task.computes_list() {
            let materials = dep.materials_for(task.task_materials());
            if dep.label.is_reduction() {
                let c = contributions
                    .entry(dep.label.clone())
                    .or_insert_with(|| Contribution {
                        nodes: Vec::new(),
                        materials: BTreeSet::new(),
                        last_task: t,
                    });
                c.nodes.push(node);
                c.materials.extend(materials.iter().copied());
                c.last_task = c.last_task.max(t);
                continue;
            }
            for &material in materials {
                let key = (dep.label.clone(), patch, material);
                if let Some(&first) = producers.get(&key) {
                    return Err(GraphError::DuplicateProducer {
                        label: dep.label.name().to_string(),
                        patch,
                        material,
                        first: node_name(&graph, tasks, first),
                        second: task.name().to_string(),
                    });
                }
                producers.insert(key, node);
            }
        }
        for dep in task.modifies_list() {
            for &material in dep.materials_for(task.task_materials()) {
                modifiers
                    .entry((dep.label.clone(), patch, material))
                    .or_default()
                    .push(node);
            }
        }
    }

    // 3. One reduce node per computed reduction.
    let mut reduce_nodes: IndexMap<VarLabel, NodeIndex> = IndexMap::new();
    let mut reduce_keys: IndexMap<NodeIndex, OrderKey> = IndexMap::new();
    for (seq, (label, c)) in contributions.iter().enumerate() {
        let node = graph.add_node(ScheduledNode::Reduce(ReduceStep {
            label: label.clone(),
            materials: c.materials.iter().copied().collect(),
        }));
        for &from in &c.nodes {
            graph.add_edge(from, node, label.clone());
        }
        reduce_nodes.insert(label.clone(), node);
        reduce_keys.insert(node, (c.last_task, 1, seq as u32));
    }

    // 4. Read edges.
    for (&(t, patch), &node) in &instances {
        let task = &tasks[t];
        for dep in task.requires_list() {
            if dep.which == Which::Old {
                continue;
            }
            let materials = dep.materials_for(task.task_materials());
            if dep.label.is_reduction() {
                match reduce_nodes.get(&dep.label) {
                    Some(&r) => {
                        graph.add_edge(r, node, dep.label.clone());
                    }
                    None if carried.contains(&dep.label) => {}
                    None => {
                        return Err(GraphError::MissingProducer {
                            task: task.name().to_string(),
                            label: dep.label.name().to_string(),
                            patch,
                            material: materials.first().copied().unwrap_or_default(),
                        })
                    }
                }
                continue;
            }
            let mut sources = vec![patch];
            if dep.ghost > 0 {
                sources.extend(grid.patches_within(patch, dep.ghost));
            }
            for q in sources {
                for &material in materials {
                    let key = (dep.label.clone(), q, material);
                    let mut found = false;
                    if let Some(&p) = producers.get(&key) {
                        graph.add_edge(p, node, dep.label.clone());
                        found = true;
                    }
                    if let Some(ms) = modifiers.get(&key) {
                        for &w in ms.iter().filter(|w| **w != node) {
                            graph.add_edge(w, node, dep.label.clone());
                        }
                        found |= !ms.is_empty();
                    }
                    if !found && !carried.contains(&dep.label) {
                        return Err(GraphError::MissingProducer {
                            task: task.name().to_string(),
                            label: dep.label.name().to_string(),
                            patch: q,
                            material,
                        });
                    }
                }
            }
        }
        for dep in task.modifies_list() {
            for &material in dep.materials_for(task.task_materials()) {
                let key = (dep.label.clone(), patch, material);
                match producers.get(&key) {
                    Some(&p) => {
                        graph.add_edge(p, node, dep.label.clone());
                    }
                    None if carried.contains(&dep.label) => {}
                    None => {
                        return Err(GraphError::MissingProducer {
                            task: task.name().to_string(),
                            label: dep.label.name().to_string(),
                            patch,
                            material,
                        })
                    }
                }
                // Modifiers of one key run in task order.
                if let Some(ms) = modifiers.get(&key) {
                    for &w in ms {
                        if matches!(&graph[w], ScheduledNode::Task(i) if i.task < t) {
                            graph.add_edge(w, node, dep.label.clone());
                        }
                    }
                }
            }
        }
    }

    // 5. Deterministic topological order.
    let keys: Vec<OrderKey> = graph
        .node_indices()
        .map(|n| match &graph[n] {
            ScheduledNode::Task(i) => (i.task, 0, i.patch.0),
            ScheduledNode::Reduce(_) => reduce_keys.get(&n).copied().unwrap_or((usize::MAX, 1, 0)),
        })
        .collect();
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.edges_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<(OrderKey, usize)>> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .map(|n| Reverse((keys[n.index()], n.index())))
        .collect();
    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, i))) = ready.pop() {
        let n = NodeIndex::new(i);
        order.push(n);
        for e in graph.edges_directed(n, Direction::Outgoing) {
            let t = e.target().index();
            indegree[t] -= 1;
            if indegree[t] == 0 {
                ready.push(Reverse((keys[t], t)));
            }
        }
    }
    if order.len() < graph.node_count() {
        return Err(cycle_error(&graph, tasks));
    }

    // 6. Ownership of every produced grid variable and every modified
    //    carried one.
    let ownership = collect_ownership(&graph, producers.iter().map(|(k, &n)| (k, n)));
    let carried_ownership = collect_ownership(
        &graph,
        modifiers
            .iter()
            .filter(|(key, _)| !producers.contains_key(*key))
            .filter_map(|(k, nodes)| Some((k, *nodes.first()?))),
    );
    let mut modifications: Vec<Modification> = modifiers
        .iter()
        .filter_map(|((label, patch, material), nodes)| match &graph[*nodes.first()?] {
            ScheduledNode::Task(i) => Some(Modification {
                label: label.clone(),
                patch: *patch,
                material: *material,
                rank: i.rank,
                count: nodes.len() as u32,
            }),
            ScheduledNode::Reduce(_) => None,
        })
        .collect();
    modifications.sort_by(|a, b| {
        (&a.label, a.patch, a.material).cmp(&(&b.label, b.patch, b.material))
    });

    debug!(
        tasks = tasks.len(),
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        reductions = reduce_nodes.len(),
        "task graph compiled"
    );
    Ok(CompiledGraph {
        tasks: tasks.to_vec(),
        order: order.into_iter().map(|n| graph[n].clone()).collect(),
        ownership,
        carried_ownership,
        modifications,
        edges: graph.edge_count(),
    })
}

/// Group written keys by `(label, patch)` under the rank of their writer.
fn collect_ownership<'a>(
    graph: &DiGraph<ScheduledNode, VarLabel>,
    writers: impl Iterator<Item = (&'a VarKey, NodeIndex)>,
) -> Vec<Ownership> {
    let mut owners: IndexMap<(VarLabel, PatchId), (Rank, BTreeSet<MaterialIndex>)> =
        IndexMap::new();
    for ((label, patch, material), node) in writers {
        if let ScheduledNode::Task(i) = &graph[node] {
            owners
                .entry((label.clone(), *patch))
                .or_insert_with(|| (i.rank, BTreeSet::new()))
                .1
                .insert(*material);
        }
    }
    owners.sort_keys();
    owners
        .into_iter()
        .map(|((label, patch), (rank, materials))| Ownership {
            label,
            patch,
            rank,
            materials: materials.into_iter().collect(),
        })
        .collect()
}

fn select_patches(task: &Task, grid: &Grid) -> Result<Vec<PatchId>, GraphError> {
    let patches: Vec<PatchId> = match task.patches() {
        PatchSelection::All => grid.patch_ids().collect(),
        PatchSelection::Only(list) => {
            if let Some(&missing) = list.iter().find(|p| !grid.contains(**p)) {
                return Err(GraphError::UnknownPatch {
                    task: task.name().to_string(),
                    patch: missing,
                });
            }
            let mut v = list.clone();
            v.sort_unstable();
            v.dedup();
            v
        }
    };
    if patches.is_empty() {
        return Err(GraphError::NoPatches {
            task: task.name().to_string(),
        });
    }
    Ok(patches)
}

fn validate_dependency(
    task: &Task,
    role: Role,
    dep: &Dependency,
    catalog: &VariableCatalog,
    carried: &BTreeSet<VarLabel>,
    max_ghost: u32,
) -> Result<(), GraphError> {
    let task_name = || task.name().to_string();
    let label_name = || dep.label.name().to_string();
    let invalid = |reason: &str| GraphError::InvalidDependency {
        task: task_name(),
        label: label_name(),
        reason: reason.to_string(),
    };
    let bad_ghost = |reason: String| GraphError::InvalidGhost {
        task: task_name(),
        label: label_name(),
        ghost: dep.ghost,
        reason,
    };

    if !catalog.contains(&dep.label) {
        return Err(GraphError::UnknownLabel {
            task: task_name(),
            label: label_name(),
        });
    }
    if dep.materials.as_ref().is_some_and(|m| m.is_empty()) {
        return Err(invalid("empty material subset"));
    }

    match role {
        Role::Requires => {
            if dep.label.is_reduction() && dep.ghost > 0 {
                return Err(bad_ghost("reduction variables have no halo".into()));
            }
            if dep.ghost > max_ghost {
                return Err(bad_ghost(format!("the configured limit is {max_ghost}")));
            }
        }
        Role::Computes => {
            if dep.which == Which::Old {
                return Err(invalid("outputs must target the new generation"));
            }
            if dep.ghost > 0 {
                return Err(bad_ghost("outputs have no halo".into()));
            }
            if carried.contains(&dep.label) {
                return Err(GraphError::ComputesCarriedLabel {
                    task: task_name(),
                    label: label_name(),
                });
            }
        }
        Role::Modifies => {
            if dep.which == Which::Old {
                return Err(GraphError::ModifiesOldGeneration {
                    task: task_name(),
                    label: label_name(),
                });
            }
            if dep.label.is_reduction() {
                return Err(invalid("reduction variables cannot be modified"));
            }
            if dep.ghost > 0 {
                return Err(bad_ghost("outputs have no halo".into()));
            }
        }
    }
    Ok(())
}

fn node_name(graph: &DiGraph<ScheduledNode, VarLabel>, tasks: &[Task], n: NodeIndex) -> String {
    match &graph[n] {
        ScheduledNode::Task(i) => tasks[i.task].name().to_string(),
        ScheduledNode::Reduce(r) => format!("reduce({})", r.label),
    }
}

fn cycle_error(graph: &DiGraph<ScheduledNode, VarLabel>, tasks: &[Task]) -> GraphError {
    let mut names = BTreeSet::new();
    let mut labels = BTreeSet::new();
    for scc in tarjan_scc(graph) {
        let cyclic = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
        if !cyclic {
            continue;
        }
        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        for &n in &scc {
            names.insert(node_name(graph, tasks, n));
            for e in graph.edges_directed(n, Direction::Outgoing) {
                if members.contains(&e.target()) {
                    labels.insert(e.weight().name().to_string());
                }
            }
        }
    }
    GraphError::Cycle {
        tasks: names.into_iter().collect(),
        labels: labels.into_iter().collect(),
    }
}
