//! Dependency graph for units
//!
//! Builds the unit dependency graph, detects cycles, produces a
//! deterministic topological order and partitions it into waves.
//! Uses petgraph for graph storage and SCC detection.
//!
//! Edge direction: `u -> v` means "u depends on v".

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use super::unit::{Unit, UnitId};

/// A set of units that depend on each other in a loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Members in declaration order
    pub members: Vec<UnitId>,
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.members.iter().map(UnitId::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Dependency cycle(s) detected: {}", format_cycles(.cycles))]
pub struct CycleError {
    pub cycles: Vec<Cycle>,
}

fn format_cycles(cycles: &[Cycle]) -> String {
    cycles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of the scheduler's own bookkeeping; the only fatal class
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Scheduler bookkeeping failed: {0}")]
    Bookkeeping(String),
}

/// Why a unit was removed from the graph before scheduling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Declared dependencies that are not enabled this session
    Unresolved { missing: Vec<UnitId> },

    /// A dependency was itself excluded
    DependencyExcluded { dependency: UnitId },

    /// The unit participates in a dependency cycle
    Cycle(Cycle),
}

/// A unit excluded from scheduling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excluded {
    pub unit: UnitId,
    pub reason: ExclusionReason,
}

/// Result of building a graph from the enabled units
#[derive(Debug)]
pub struct GraphBuild {
    pub graph: DependencyGraph,
    pub excluded: Vec<Excluded>,
}

/// A cycle-free order plus the units removed to obtain it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub order: Vec<UnitId>,
    pub excluded: Vec<Excluded>,
}

/// One stage of concurrently runnable units, in declaration order
pub type Wave = Vec<UnitId>;

/// A dependency graph over enabled units
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// The underlying directed graph (dependent -> dependency)
    graph: DiGraph<UnitId, ()>,

    /// Map from UnitId to node index
    node_map: HashMap<UnitId, NodeIndex>,

    /// Declaration position of each unit, for tie-breaks
    positions: HashMap<UnitId, usize>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from the enabled units
    ///
    /// A unit with a dependency outside the enabled set is excluded with one
    /// `Unresolved` record listing every missing id. Exclusion then cascades
    /// to anything depending on an excluded unit.
    pub fn build(units: &[Unit]) -> GraphBuild {
        Self::build_with_rejected(units, &HashSet::new())
    }

    /// Builds a graph where `rejected` units are enabled but unusable
    ///
    /// A dependency on a rejected unit is not unresolved: the dependent is
    /// excluded as `DependencyExcluded` instead.
    pub fn build_with_rejected(units: &[Unit], rejected: &HashSet<UnitId>) -> GraphBuild {
        let known: HashSet<&UnitId> = units.iter().map(Unit::id).chain(rejected).collect();
        let mut excluded = Vec::new();
        let mut removed: HashSet<UnitId> = rejected.clone();

        for unit in units {
            let missing: Vec<UnitId> = unit
                .dependencies()
                .iter()
                .filter(|dep| !known.contains(dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                removed.insert(unit.id().clone());
                excluded.push(Excluded {
                    unit: unit.id().clone(),
                    reason: ExclusionReason::Unresolved { missing },
                });
            }
        }

        cascade(
            units.iter().map(|u| (u.id(), u.dependencies())),
            &mut removed,
            &mut excluded,
        );

        let mut graph = Self::new();
        let mut kept: Vec<&Unit> = units.iter().filter(|u| !removed.contains(u.id())).collect();
        kept.sort_by_key(|u| u.position);

        for unit in &kept {
            graph.add_unit(unit.id().clone(), unit.position);
        }
        for unit in &kept {
            for dep in unit.dependencies() {
                graph.add_dependency(unit.id(), dep);
            }
        }

        GraphBuild { graph, excluded }
    }

    /// Adds a unit node (no-op if already present)
    pub fn add_unit(&mut self, id: UnitId, position: usize) {
        if !self.node_map.contains_key(&id) {
            let idx = self.graph.add_node(id.clone());
            self.node_map.insert(id.clone(), idx);
            self.positions.insert(id, position);
        }
    }

    /// Adds a dependency edge: `unit` depends on `depends_on`
    ///
    /// Returns false if either unit is unknown. Self-dependencies are kept so
    /// that cycle detection reports them.
    pub fn add_dependency(&mut self, unit: &UnitId, depends_on: &UnitId) -> bool {
        let (Some(&from), Some(&to)) = (self.node_map.get(unit), self.node_map.get(depends_on))
        else {
            return false;
        };
        self.graph.update_edge(from, to, ());
        true
    }

    /// Returns the direct dependencies of a unit, in declaration order
    pub fn dependencies(&self, id: &UnitId) -> Vec<UnitId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Returns the direct dependents of a unit, in declaration order
    pub fn dependents(&self, id: &UnitId) -> Vec<UnitId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &UnitId, direction: Direction) -> Vec<UnitId> {
        let Some(&idx) = self.node_map.get(id) else {
            return vec![];
        };

        let mut ids: Vec<UnitId> = self
            .graph
            .neighbors_directed(idx, direction)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();
        ids.sort_by_key(|u| self.position(u));
        ids.dedup();
        ids
    }

    /// Finds every dependency cycle, including self-loops
    ///
    /// Cycles are the strongly connected components with more than one
    /// member, plus single units that depend on themselves.
    pub fn detect_cycles(&self) -> Vec<Cycle> {
        let mut cycles: Vec<Cycle> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| match scc.as_slice() {
                [single] => self.graph.contains_edge(*single, *single),
                _ => true,
            })
            .map(|scc| {
                let mut members: Vec<UnitId> = scc
                    .into_iter()
                    .filter_map(|n| self.graph.node_weight(n).cloned())
                    .collect();
                members.sort_by_key(|u| self.position(u));
                Cycle { members }
            })
            .collect();

        cycles.sort_by_key(|c| c.members.first().map(|u| self.position(u)));
        cycles
    }

    /// Returns all units in dependency order (Kahn's algorithm)
    ///
    /// Among units that are ready at the same time, the one declared first
    /// comes first.
    pub fn topo_sort(&self) -> Result<Vec<UnitId>, CycleError> {
        let mut pending: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Outgoing).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| Reverse((self.position_of(*n), *n)))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse((_, idx))) = ready.pop() {
            if let Some(id) = self.graph.node_weight(idx) {
                order.push(id.clone());
            }
            for dependent in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push(Reverse((self.position_of(dependent), dependent)));
                    }
                }
            }
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            Err(CycleError {
                cycles: self.detect_cycles(),
            })
        }
    }

    /// Produces a cycle-free order by excluding every cycle member
    ///
    /// Units depending on an excluded cycle member are excluded as well.
    /// The result is deterministic for a given graph and declaration order.
    pub fn resolve(&self) -> Result<Resolution, ScheduleError> {
        let mut graph = self.clone();
        let mut excluded = Vec::new();

        loop {
            let cycles = match graph.topo_sort() {
                Ok(order) => return Ok(Resolution { order, excluded }),
                Err(err) => err.cycles,
            };
            if cycles.is_empty() {
                return Err(ScheduleError::Bookkeeping(
                    "topological sort stalled without a detectable cycle".to_string(),
                ));
            }

            let mut removed = HashSet::new();
            for cycle in &cycles {
                for member in &cycle.members {
                    removed.insert(member.clone());
                    excluded.push(Excluded {
                        unit: member.clone(),
                        reason: ExclusionReason::Cycle(cycle.clone()),
                    });
                }
            }

            let edges: Vec<(UnitId, Vec<UnitId>)> = graph
                .units_in_order()
                .into_iter()
                .map(|u| {
                    let deps = graph.dependencies(&u);
                    (u, deps)
                })
                .collect();
            cascade(
                edges.iter().map(|(u, deps)| (u, deps.as_slice())),
                &mut removed,
                &mut excluded,
            );

            graph = graph.without(&removed);
        }
    }

    /// Copies the graph without the given units and their edges
    fn without(&self, removed: &HashSet<UnitId>) -> Self {
        let mut next = Self::new();
        let keep: Vec<UnitId> = self
            .units_in_order()
            .into_iter()
            .filter(|u| !removed.contains(u))
            .collect();

        for id in &keep {
            next.add_unit(id.clone(), self.position(id));
        }
        for id in &keep {
            for dep in self.dependencies(id) {
                next.add_dependency(id, &dep);
            }
        }
        next
    }

    /// Groups an order into waves of concurrently runnable units
    ///
    /// `wave(u)` is 0 for units without dependencies and otherwise
    /// `1 + max(wave(dep))`, the length of the longest dependency chain
    /// ending at `u`. Fails only if `order` is not a topological order of
    /// this graph.
    pub fn partition_waves(&self, order: &[UnitId]) -> Result<Vec<Wave>, ScheduleError> {
        if order.len() != self.len() {
            return Err(ScheduleError::Bookkeeping(format!(
                "order covers {} units but the graph has {}",
                order.len(),
                self.len()
            )));
        }

        let mut levels: HashMap<&UnitId, usize> = HashMap::with_capacity(order.len());
        let mut waves: Vec<Wave> = Vec::new();

        for id in order {
            if !self.contains(id) {
                return Err(ScheduleError::Bookkeeping(format!(
                    "unit '{}' is ordered but not in the graph",
                    id
                )));
            }

            let mut level = 0;
            for dep in self.dependencies(id) {
                let dep_level = levels.get(&dep).ok_or_else(|| {
                    ScheduleError::Bookkeeping(format!(
                        "unit '{}' is ordered before its dependency '{}'",
                        id, dep
                    ))
                })?;
                level = level.max(dep_level + 1);
            }

            if levels.insert(id, level).is_some() {
                return Err(ScheduleError::Bookkeeping(format!(
                    "unit '{}' appears twice in the order",
                    id
                )));
            }
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            if let Some(wave) = waves.get_mut(level) {
                wave.push(id.clone());
            }
        }

        for wave in &mut waves {
            wave.sort_by_key(|u| self.position(u));
        }
        Ok(waves)
    }

    /// Returns the declaration position of a unit
    pub fn position(&self, id: &UnitId) -> usize {
        self.positions.get(id).copied().unwrap_or(usize::MAX)
    }

    fn position_of(&self, idx: NodeIndex) -> usize {
        self.graph
            .node_weight(idx)
            .map(|id| self.position(id))
            .unwrap_or(usize::MAX)
    }

    /// Returns all units sorted by declaration position
    pub fn units_in_order(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.node_map.keys().cloned().collect();
        ids.sort_by_key(|u| self.position(u));
        ids
    }

    /// Returns true if the graph contains the unit
    pub fn contains(&self, id: &UnitId) -> bool {
        self.node_map.contains_key(id)
    }

    /// Returns the number of units in the graph
    pub fn len(&self) -> usize {
        self.node_map.len()
    }

    /// Returns true if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.node_map.is_empty()
    }
}

/// Excludes, to a fixed point, every unit with a dependency in `removed`
fn cascade<'a>(
    edges: impl Iterator<Item = (&'a UnitId, &'a [UnitId])> + Clone,
    removed: &mut HashSet<UnitId>,
    excluded: &mut Vec<Excluded>,
) {
    loop {
        let mut changed = false;
        for (unit, deps) in edges.clone() {
            if removed.contains(unit) {
                continue;
            }
            if let Some(dep) = deps.iter().find(|d| removed.contains(*d)) {
                removed.insert(unit.clone());
                excluded.push(Excluded {
                    unit: unit.clone(),
                    reason: ExclusionReason::DependencyExcluded {
                        dependency: dep.clone(),
                    },
                });
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}
