//! Dependency DAG construction, rank assignment, and cycle detection.
//!
//! The DAG tracks which views read the materialized output table of another
//! view in the same view set. Edges to raw source tables are not part of the
//! graph: they never need ordering.
//!
//! # Prior Art — Graph Algorithms
//!
//! Rank assignment is Kahn's algorithm with level tracking:
//! - Kahn, A.B. (1962). "Topological sorting of large networks."
//!   Communications of the ACM, 5(11), 558–562.
//!
//! A view's rank is `1 + max(rank of its dependencies)`, and views without
//! inter-view dependencies rank 0. Refreshing in ascending rank therefore
//! always refreshes a dependency before anything that reads it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::catalog::{Table, View, ViewSources};
use crate::error::ViewMatError;

/// The materialized output table for `view`.
///
/// A view's output table has the view's name and lives in the materialized
/// schema. This is the only place that convention is spelled out; the graph
/// builder relies on it to recognise inter-view dependencies.
pub fn output_table_for(view: &View, materialized_schema: &str) -> Table {
    Table::new(materialized_schema, view.name())
}

/// In-memory dependency graph between views.
///
/// Nodes are addressed by their position in discovery order.
#[derive(Debug, Clone)]
pub struct ViewDag {
    /// Catalog snapshot, in discovery order.
    sources: Vec<ViewSources>,
    /// View → discovery position.
    index: HashMap<View, usize>,
    /// Position → positions of the views it reads. Sorted, no duplicates.
    dependencies: Vec<Vec<usize>>,
    /// Position → positions of the views that read it. Sorted, no duplicates.
    dependants: Vec<Vec<usize>>,
}

impl ViewDag {
    /// Build the graph from a catalog snapshot.
    ///
    /// An edge `V → U` exists iff `V` reads `output_table_for(U)`. Fails when
    /// a view reads its own output table, when a table in the materialized
    /// schema is not produced by any known view, or when two entries share
    /// a view identity or an output table.
    pub fn build(
        sources: Vec<ViewSources>,
        materialized_schema: &str,
    ) -> Result<Self, ViewMatError> {
        let n = sources.len();
        let mut index = HashMap::with_capacity(n);
        let mut producers: HashMap<Table, usize> = HashMap::with_capacity(n);

        for (pos, vs) in sources.iter().enumerate() {
            if index.insert(vs.view.clone(), pos).is_some() {
                return Err(ViewMatError::DuplicateView(vs.view.to_string()));
            }
            let output = output_table_for(&vs.view, materialized_schema);
            if let Some(prev) = producers.insert(output.clone(), pos) {
                return Err(ViewMatError::DuplicateView(format!(
                    "{} and {} both materialize into {}",
                    sources[prev].view, vs.view, output
                )));
            }
        }

        let mut dependencies = Vec::with_capacity(n);
        let mut dependants: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];

        for (pos, vs) in sources.iter().enumerate() {
            let mut deps = BTreeSet::new();
            for table in vs
                .tables
                .iter()
                .filter(|t| t.schema() == materialized_schema)
            {
                match producers.get(table) {
                    Some(&producer) if producer == pos => {
                        return Err(ViewMatError::SelfDependency(vs.view.to_string()));
                    }
                    Some(&producer) => {
                        deps.insert(producer);
                        dependants[producer].insert(pos);
                    }
                    None => {
                        return Err(ViewMatError::UnknownDependency {
                            view: vs.view.to_string(),
                            table: table.to_string(),
                        });
                    }
                }
            }
            dependencies.push(deps.into_iter().collect());
        }

        Ok(ViewDag {
            sources,
            index,
            dependencies,
            dependants: dependants
                .into_iter()
                .map(|d| d.into_iter().collect())
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// All views, in discovery order.
    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.sources.iter().map(|vs| &vs.view)
    }

    /// Views `view` reads, in discovery order.
    pub fn dependencies_of(&self, view: &View) -> Vec<&View> {
        self.neighbours(view, &self.dependencies)
    }

    /// Views that read `view`, in discovery order.
    pub fn dependants_of(&self, view: &View) -> Vec<&View> {
        self.neighbours(view, &self.dependants)
    }

    /// Number of inter-view edges.
    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(Vec::len).sum()
    }

    /// Assign every view its rank.
    ///
    /// Fails with [`ViewMatError::CycleDetected`] if any view can never have
    /// all of its dependencies ranked.
    pub fn assign_ranks(&self) -> Result<HashMap<View, u32>, ViewMatError> {
        let ranks = self.rank_by_position()?;
        Ok(self.views().cloned().zip(ranks).collect())
    }

    /// Rank the views and return the refresh schedule.
    ///
    /// Entries are ordered by ascending rank, ties broken by discovery order,
    /// so the same snapshot always yields the same schedule.
    pub fn schedule(&self) -> Result<Schedule, ViewMatError> {
        let ranks = self.rank_by_position()?;
        let mut entries: Vec<ScheduleEntry> = self
            .sources
            .iter()
            .zip(ranks)
            .enumerate()
            .map(|(position, (vs, rank))| ScheduleEntry {
                view: vs.view.clone(),
                tables: vs.tables.clone(),
                rank,
                position,
            })
            .collect();
        entries.sort_by_key(|e| (e.rank, e.position));
        Ok(Schedule { entries })
    }

    // ── Private helpers ─────────────────────────────────────────────────

    fn neighbours<'a>(&'a self, view: &View, adjacency: &[Vec<usize>]) -> Vec<&'a View> {
        match self.index.get(view) {
            Some(&pos) => adjacency[pos]
                .iter()
                .map(|&p| &self.sources[p].view)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Kahn's algorithm with level tracking.
    ///
    /// A view enters the frontier only once every dependency has been
    /// finalized, so its rank is final when it is dequeued.
    fn rank_by_position(&self) -> Result<Vec<u32>, ViewMatError> {
        let n = self.sources.len();
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut rank = vec![0u32; n];

        let mut frontier: VecDeque<usize> = (0..n).filter(|&p| pending[p] == 0).collect();
        let mut finalized = 0usize;

        while let Some(pos) = frontier.pop_front() {
            finalized += 1;
            for &dependant in &self.dependants[pos] {
                rank[dependant] = rank[dependant].max(rank[pos] + 1);
                pending[dependant] -= 1;
                if pending[dependant] == 0 {
                    frontier.push_back(dependant);
                }
            }
        }

        if finalized < n {
            return Err(ViewMatError::CycleDetected(self.cycle_members(&pending)));
        }
        Ok(rank)
    }

    /// Names of the unresolved views that lie on a cycle, in discovery order.
    ///
    /// Tarjan's strongly connected components over the unresolved subgraph;
    /// only components with more than one view are cycles (a view reading
    /// its own output is rejected earlier). Views that are unresolved only
    /// because they read from or feed into a cycle are left out.
    ///
    /// - Tarjan, R.E. (1972). "Depth-first search and linear graph
    ///   algorithms." SIAM Journal on Computing, 1(2), 146–160.
    fn cycle_members(&self, pending: &[usize]) -> Vec<String> {
        const UNVISITED: usize = usize::MAX;

        let n = pending.len();
        let unresolved = |p: usize| pending[p] > 0;
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0usize;
        let mut members: Vec<usize> = Vec::new();

        for root in (0..n).filter(|&p| unresolved(p)) {
            if index[root] != UNVISITED {
                continue;
            }
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;

            // (view, next dependency to look at)
            let mut work: Vec<(usize, usize)> = vec![(root, 0)];
            while let Some((v, edge)) = work.last().copied() {
                if let Some(&w) = self.dependencies[v].get(edge) {
                    if let Some(top) = work.last_mut() {
                        top.1 += 1;
                    }
                    if !unresolved(w) {
                        continue;
                    }
                    if index[w] == UNVISITED {
                        index[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        work.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    if component.len() > 1 {
                        members.extend(component);
                    }
                }
            }
        }

        members.sort_unstable();
        members
            .into_iter()
            .map(|p| self.sources[p].view.to_string())
            .collect()
    }
}

// ── Schedule ───────────────────────────────────────────────────────────────

/// One view to refresh, with every table it reads and its rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub view: View,
    pub tables: Vec<Table>,
    pub rank: u32,
    /// Discovery position in the catalog snapshot.
    pub position: usize,
}

/// The rank-ordered refresh schedule, fixed for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Build the graph for `sources` and rank it in one step.
    pub fn from_sources(
        sources: Vec<ViewSources>,
        materialized_schema: &str,
    ) -> Result<Self, ViewMatError> {
        ViewDag::build(sources, materialized_schema)?.schedule()
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScheduleEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rank of `view`, if it is scheduled.
    pub fn rank_of(&self, view: &View) -> Option<u32> {
        self.entries.iter().find(|e| &e.view == view).map(|e| e.rank)
    }

    /// Highest rank in the schedule (`0` when empty).
    pub fn max_rank(&self) -> u32 {
        self.entries.last().map(|e| e.rank).unwrap_or(0)
    }

    /// Every table read by any view, each once, in schedule order.
    pub fn distinct_tables(&self) -> Vec<&Table> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .flat_map(|e| e.tables.iter())
            .filter(|t| seen.insert(*t))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Schedule {
    type Item = &'a ScheduleEntry;
    type IntoIter = std::slice::Iter<'a, ScheduleEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
