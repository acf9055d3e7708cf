//! In-memory dependency DAG mirror (spec §4.2).
//!
//! Forward adjacency answers "who do I unblock when I finish", reverse adjacency
//! answers "who am I waiting on", and an unsatisfied-parent counter per job
//! turns "is this job ready" into an O(1) check instead of a graph walk.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

use crate::model::{DependencyKind, JobId, JobStatus};

/// Default bound on DFS depth during cycle checks (spec §6 `dependency_max_depth`).
pub const DEFAULT_MAX_DEPTH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddEdgeOutcome {
    Ok,
    /// The edge would introduce a cycle; the graph is unchanged.
    Cycle,
    UnknownJob,
    Duplicate,
    /// The parent already ended in a terminal state that can never satisfy
    /// this edge's kind.
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    kind: DependencyKind,
    satisfied: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// parent -> (child -> edge)
    forward: HashMap<JobId, HashMap<JobId, Edge>>,
    /// child -> (parent -> edge)
    reverse: HashMap<JobId, HashMap<JobId, Edge>>,
    /// Number of unsatisfied *blocking* parent edges, per job.
    unsatisfied_count: HashMap<JobId, u32>,
    /// Jobs known to the graph (submitted, regardless of dependency edges).
    known: HashSet<JobId>,
    /// Terminal status recorded for jobs that have reached one, so late-added
    /// edges onto an already-terminal parent can be resolved immediately.
    terminal: HashMap<JobId, JobStatus>,
    /// Jobs whose dependencies became permanently unsatisfiable; the
    /// `SchedulerCore` is expected to propagate this as `Cancelled`.
    unsatisfiable: HashSet<JobId>,
}

/// In-memory mirror of the dependency DAG.
///
/// Guarded by a single readers-writer lock (spec §5): mutations and cycle
/// checks take the writer side, pure queries take the reader side.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    inner: RwLock<Inner>,
    max_depth: usize,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_depth,
        }
    }

    /// Register a job with the graph, independent of any edges. Must be
    /// called before an edge referencing this job can be added.
    pub fn register_job(&self, id: JobId) {
        self.inner.write().known.insert(id);
    }

    pub fn mark_terminal_no_edges(&self, id: JobId, status: JobStatus) {
        let mut inner = self.inner.write();
        inner.known.insert(id);
        inner.terminal.insert(id, status);
    }

    pub fn is_known(&self, id: JobId) -> bool {
        self.inner.read().known.contains(&id)
    }

    /// Add a directed dependency edge `parent -> child`.
    pub fn add_edge(&self, parent: JobId, child: JobId, kind: DependencyKind) -> AddEdgeOutcome {
        let mut inner = self.inner.write();

        if !inner.known.contains(&parent) || !inner.known.contains(&child) {
            return AddEdgeOutcome::UnknownJob;
        }
        if inner
            .forward
            .get(&parent)
            .map(|children| children.contains_key(&child))
            .unwrap_or(false)
        {
            return AddEdgeOutcome::Duplicate;
        }

        // Cycle check: DFS from `child` along forward edges; if we reach
        // `parent`, adding parent -> child would close a cycle.
        if parent == child || Self::reaches(&inner.forward, child, parent, self.max_depth) {
            return AddEdgeOutcome::Cycle;
        }

        // If the parent already terminated, resolve the edge immediately
        // instead of leaving it pending forever.
        if let Some(&terminal) = inner.terminal.get(&parent) {
            if kind.is_unsatisfiable_by(terminal) {
                inner.unsatisfiable.insert(child);
                return AddEdgeOutcome::Unsatisfiable;
            }
            let satisfied = kind.is_satisfied_by(terminal);
            inner
                .forward
                .entry(parent)
                .or_default()
                .insert(child, Edge { kind, satisfied });
            inner
                .reverse
                .entry(child)
                .or_default()
                .insert(parent, Edge { kind, satisfied });
            if kind.blocks() && !satisfied {
                *inner.unsatisfied_count.entry(child).or_insert(0) += 1;
            }
            return AddEdgeOutcome::Ok;
        }

        inner
            .forward
            .entry(parent)
            .or_default()
            .insert(child, Edge { kind, satisfied: false });
        inner
            .reverse
            .entry(child)
            .or_default()
            .insert(parent, Edge { kind, satisfied: false });
        if kind.blocks() {
            *inner.unsatisfied_count.entry(child).or_insert(0) += 1;
        }
        AddEdgeOutcome::Ok
    }

    /// DFS over forward edges starting at `start`, bounded by `max_depth`
    /// nodes visited. Returns true if `target` is reachable from `start`.
    fn reaches(
        forward: &HashMap<JobId, HashMap<JobId, Edge>>,
        start: JobId,
        target: JobId,
        max_depth: usize,
    ) -> bool {
        if start == target {
            return true;
        }
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        visited.insert(start);
        let mut visited_count = 0usize;

        while let Some(node) = stack.pop() {
            visited_count += 1;
            if visited_count > max_depth {
                // Graph too deep to check safely; treat as a cycle to be
                // conservative rather than risk an unbounded walk.
                return true;
            }
            if node == target {
                return true;
            }
            if let Some(children) = forward.get(&node) {
                for &child in children.keys() {
                    if visited.insert(child) {
                        stack.push(child);
                    }
                }
            }
        }
        false
    }

    /// Remove an edge. May unblock the child if it was the last unsatisfied
    /// blocking edge. Returns `true` if the child became ready as a result.
    pub fn remove_edge(&self, parent: JobId, child: JobId) -> bool {
        let mut inner = self.inner.write();
        let removed = inner
            .forward
            .get_mut(&parent)
            .and_then(|children| children.remove(&child));
        inner
            .reverse
            .get_mut(&child)
            .and_then(|parents| parents.remove(&parent));

        match removed {
            Some(edge) if edge.kind.blocks() && !edge.satisfied => {
                let count = inner.unsatisfied_count.entry(child).or_insert(0);
                *count = count.saturating_sub(1);
                *count == 0
            }
            _ => false,
        }
    }

    /// Apply a parent's terminal status to all of its forward edges.
    ///
    /// Returns `(newly_ready, newly_unsatisfiable)`: job ids whose last
    /// blocking edge just became satisfied, and job ids whose dependency on
    /// this parent just became permanently unsatisfiable.
    pub fn on_job_terminal(
        &self,
        parent: JobId,
        terminal: JobStatus,
    ) -> (Vec<JobId>, Vec<JobId>) {
        let mut inner = self.inner.write();
        inner.terminal.insert(parent, terminal);

        let mut newly_ready = Vec::new();
        let mut newly_unsatisfiable = Vec::new();

        let children: Vec<(JobId, Edge)> = inner
            .forward
            .get(&parent)
            .map(|m| m.iter().map(|(c, e)| (*c, *e)).collect())
            .unwrap_or_default();

        for (child, edge) in children {
            if edge.satisfied || !edge.kind.blocks() {
                continue;
            }
            if edge.kind.is_unsatisfiable_by(terminal) {
                inner.unsatisfiable.insert(child);
                newly_unsatisfiable.push(child);
                continue;
            }
            if edge.kind.is_satisfied_by(terminal) {
                if let Some(e) = inner
                    .forward
                    .get_mut(&parent)
                    .and_then(|m| m.get_mut(&child))
                {
                    e.satisfied = true;
                }
                if let Some(e) = inner
                    .reverse
                    .get_mut(&child)
                    .and_then(|m| m.get_mut(&parent))
                {
                    e.satisfied = true;
                }
                let count = inner.unsatisfied_count.entry(child).or_insert(0);
                *count = count.saturating_sub(1);
                if *count == 0 {
                    newly_ready.push(child);
                }
            }
        }

        (newly_ready, newly_unsatisfiable)
    }

    /// Remove a job that was speculatively registered (e.g. during an
    /// all-or-nothing submission that failed partway through) from the
    /// graph, along with any edges already attached to it. Callers must have
    /// already removed those edges via [`Self::remove_edge`]; this only
    /// clears bookkeeping that would otherwise leak.
    pub fn unregister_job(&self, id: JobId) {
        let mut inner = self.inner.write();
        inner.known.remove(&id);
        inner.unsatisfied_count.remove(&id);
        inner.terminal.remove(&id);
        inner.unsatisfiable.remove(&id);
        inner.forward.remove(&id);
        inner.reverse.remove(&id);
    }

    /// Resolve any `MustStart` edges once `parent` begins running. Unlike
    /// [`Self::on_job_terminal`] this does not take a terminal status: a
    /// `MustStart` dependent only needs its parent to have started at least
    /// once, not finished.
    pub fn on_job_started(&self, parent: JobId) -> Vec<JobId> {
        let mut inner = self.inner.write();
        let mut newly_ready = Vec::new();
        let children: Vec<JobId> = inner
            .forward
            .get(&parent)
            .map(|m| {
                m.iter()
                    .filter(|(_, e)| e.kind == DependencyKind::MustStart && !e.satisfied)
                    .map(|(c, _)| *c)
                    .collect()
            })
            .unwrap_or_default();

        for child in children {
            if let Some(e) = inner.forward.get_mut(&parent).and_then(|m| m.get_mut(&child)) {
                e.satisfied = true;
            }
            if let Some(e) = inner.reverse.get_mut(&child).and_then(|m| m.get_mut(&parent)) {
                e.satisfied = true;
            }
            let count = inner.unsatisfied_count.entry(child).or_insert(0);
            *count = count.saturating_sub(1);
            if *count == 0 {
                newly_ready.push(child);
            }
        }
        newly_ready
    }

    pub fn unsatisfied_count(&self, job: JobId) -> u32 {
        self.inner
            .read()
            .unsatisfied_count
            .get(&job)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_unsatisfiable(&self, job: JobId) -> bool {
        self.inner.read().unsatisfiable.contains(&job)
    }

    pub fn parents(&self, job: JobId) -> Vec<(JobId, DependencyKind)> {
        self.inner
            .read()
            .reverse
            .get(&job)
            .map(|m| m.iter().map(|(p, e)| (*p, e.kind)).collect())
            .unwrap_or_default()
    }

    pub fn children(&self, job: JobId) -> Vec<(JobId, DependencyKind)> {
        self.inner
            .read()
            .forward
            .get(&job)
            .map(|m| m.iter().map(|(c, e)| (*c, e.kind)).collect())
            .unwrap_or_default()
    }

    /// Jobs with zero unsatisfied blocking parents among `candidates`. Used
    /// at submission time and during startup recovery, not on the dispatch
    /// hot path (dispatch consults the priority queue instead).
    pub fn ready_among(&self, candidates: &[JobId]) -> HashSet<JobId> {
        let inner = self.inner.read();
        candidates
            .iter()
            .filter(|id| inner.unsatisfied_count.get(id).copied().unwrap_or(0) == 0)
            .copied()
            .collect()
    }

    /// Full integrity check using Kahn's algorithm. Returns `Ok(())` if the
    /// graph is acyclic, `Err(cycle_member)` naming a job on some cycle
    /// otherwise. Intended for periodic background validation (spec §4.2
    /// `ValidateAcyclic`), not the hot admission path.
    pub fn validate_acyclic(&self) -> Result<(), JobId> {
        let inner = self.inner.read();
        let mut in_degree: HashMap<JobId, usize> = HashMap::new();
        for &job in &inner.known {
            in_degree.entry(job).or_insert(0);
        }
        for children in inner.forward.values() {
            for &child in children.keys() {
                *in_degree.entry(child).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<JobId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0usize;

        while let Some(node) = queue.pop_front() {
            visited += 1;
            if let Some(children) = inner.forward.get(&node) {
                for &child in children.keys() {
                    if let Some(deg) = in_degree.get_mut(&child) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        if visited == in_degree.len() {
            Ok(())
        } else {
            let stuck = in_degree
                .into_iter()
                .find(|&(_, deg)| deg > 0)
                .map(|(id, _)| id)
                .unwrap_or_default();
            Err(stuck)
        }
    }

    pub fn job_count(&self) -> usize {
        self.inner.read().known.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_jobs(n: usize) -> (DependencyGraph, Vec<JobId>) {
        let g = DependencyGraph::new();
        let ids: Vec<JobId> = (0..n).map(|_| JobId::new_v4()).collect();
        for id in &ids {
            g.register_job(*id);
        }
        (g, ids)
    }

    #[test]
    fn linear_chain_unblocks_in_order() {
        let (g, jobs) = graph_with_jobs(3);
        assert_eq!(
            g.add_edge(jobs[0], jobs[1], DependencyKind::MustComplete),
            AddEdgeOutcome::Ok
        );
        assert_eq!(
            g.add_edge(jobs[1], jobs[2], DependencyKind::MustComplete),
            AddEdgeOutcome::Ok
        );
        assert_eq!(g.unsatisfied_count(jobs[0]), 0);
        assert_eq!(g.unsatisfied_count(jobs[1]), 1);
        assert_eq!(g.unsatisfied_count(jobs[2]), 1);

        let (ready, unsat) = g.on_job_terminal(jobs[0], JobStatus::Completed);
        assert_eq!(ready, vec![jobs[1]]);
        assert!(unsat.is_empty());
        assert_eq!(g.unsatisfied_count(jobs[1]), 0);

        let (ready, _) = g.on_job_terminal(jobs[1], JobStatus::Completed);
        assert_eq!(ready, vec![jobs[2]]);
    }

    #[test]
    fn rejects_direct_and_indirect_cycles() {
        let (g, jobs) = graph_with_jobs(3);
        assert_eq!(
            g.add_edge(jobs[1], jobs[0], DependencyKind::MustComplete),
            AddEdgeOutcome::Ok
        );
        // jobs[0] -> jobs[1] would close a 2-cycle with jobs[1] -> jobs[0].
        assert_eq!(
            g.add_edge(jobs[0], jobs[1], DependencyKind::MustComplete),
            AddEdgeOutcome::Cycle
        );

        assert_eq!(
            g.add_edge(jobs[0], jobs[2], DependencyKind::MustComplete),
            AddEdgeOutcome::Ok
        );
        // jobs[2] -> jobs[1] -> jobs[0] -> jobs[2] would close a 3-cycle.
        assert_eq!(
            g.add_edge(jobs[2], jobs[1], DependencyKind::MustComplete),
            AddEdgeOutcome::Cycle
        );
        assert!(g.validate_acyclic().is_ok());
    }

    #[test]
    fn must_succeed_propagates_unsatisfiable_on_dead_letter() {
        let (g, jobs) = graph_with_jobs(2);
        g.add_edge(jobs[0], jobs[1], DependencyKind::MustSucceed);
        let (ready, unsat) = g.on_job_terminal(jobs[0], JobStatus::DeadLettered);
        assert!(ready.is_empty());
        assert_eq!(unsat, vec![jobs[1]]);
        assert!(g.is_unsatisfiable(jobs[1]));
    }

    #[test]
    fn must_complete_is_satisfied_by_dead_letter() {
        let (g, jobs) = graph_with_jobs(2);
        g.add_edge(jobs[0], jobs[1], DependencyKind::MustComplete);
        let (ready, unsat) = g.on_job_terminal(jobs[0], JobStatus::DeadLettered);
        assert_eq!(ready, vec![jobs[1]]);
        assert!(unsat.is_empty());
    }

    #[test]
    fn soft_edge_never_blocks() {
        let (g, jobs) = graph_with_jobs(2);
        g.add_edge(jobs[0], jobs[1], DependencyKind::Soft);
        assert_eq!(g.unsatisfied_count(jobs[1]), 0);
    }

    #[test]
    fn adding_edge_to_already_failed_must_succeed_parent_is_rejected() {
        let (g, jobs) = graph_with_jobs(2);
        g.mark_terminal_no_edges(jobs[0], JobStatus::Failed);
        assert_eq!(
            g.add_edge(jobs[0], jobs[1], DependencyKind::MustSucceed),
            AddEdgeOutcome::Unsatisfiable
        );
        assert!(g.is_unsatisfiable(jobs[1]));
    }

    #[test]
    fn duplicate_edge_rejected() {
        let (g, jobs) = graph_with_jobs(2);
        assert_eq!(
            g.add_edge(jobs[0], jobs[1], DependencyKind::MustComplete),
            AddEdgeOutcome::Ok
        );
        assert_eq!(
            g.add_edge(jobs[0], jobs[1], DependencyKind::MustComplete),
            AddEdgeOutcome::Duplicate
        );
    }

    #[test]
    fn remove_edge_can_unblock() {
        let (g, jobs) = graph_with_jobs(2);
        g.add_edge(jobs[0], jobs[1], DependencyKind::MustComplete);
        assert_eq!(g.unsatisfied_count(jobs[1]), 1);
        assert!(g.remove_edge(jobs[0], jobs[1]));
        assert_eq!(g.unsatisfied_count(jobs[1]), 0);
    }

    /// Invariant 1: any sequence of edges that only ever points from an
    /// earlier-registered job to a later one is by construction acyclic, so
    /// every add_edge in the sequence must succeed and validate_acyclic must
    /// hold throughout. Randomized over edge count and fan-out.
    #[test]
    fn random_forward_only_edges_never_trip_the_cycle_check() {
        for _ in 0..50 {
            let n = 2 + fastrand::usize(..30);
            let (g, jobs) = graph_with_jobs(n);
            for child in 1..n {
                let parent = fastrand::usize(..child);
                assert_eq!(
                    g.add_edge(jobs[parent], jobs[child], DependencyKind::MustComplete),
                    AddEdgeOutcome::Ok
                );
            }
            assert!(g.validate_acyclic().is_ok());
        }
    }
}
