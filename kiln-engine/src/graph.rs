//! Frozen dependency graph for one build run.
//!
//! Nodes live in dense storage keyed by `NodeId`; the scheduler is the only
//! mutator. Completion updates run in O(out-degree) per node, so unblocking
//! work after a finished build never rescans the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;

use kiln_core::{BuildPhase, DepPhase, Fingerprint, PortId};

/// Index of a node in the graph's dense storage.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);

/// Runtime state of one port in the build state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortState {
    Pending,
    Ready,
    Staging,
    Building,
    Packaging,
    Succeeded,
    Failed,
    Skipped,
    Ignored,
}

impl PortState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        match self {
            PortState::Succeeded | PortState::Failed | PortState::Skipped | PortState::Ignored => {
                true
            }
            _ => false,
        }
    }

    /// States in which a worker slot holds the port.
    pub fn is_active(self) -> bool {
        match self {
            PortState::Staging | PortState::Building | PortState::Packaging => true,
            _ => false,
        }
    }
}

/// Why a port ended up `Failed`, `Skipped`, or `Ignored`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureReason {
    /// A build phase exited non-zero.
    Phase(BuildPhase),
    /// The worker slot died twice while holding this port.
    WorkerAborted,
    /// The run was interrupted while this port was building.
    Cancelled,
    /// A port this one depends on failed to build.
    UpstreamFailure(PortId),
    /// A port this one depends on was dropped during resolution.
    UpstreamIgnored(PortId),
    /// The port participates in a dependency cycle.
    DependencyCycle,
    /// Metadata extraction failed.
    Metadata(String),
}

impl Display for FailureReason {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        match *self {
            FailureReason::Phase(phase) => write!(fmt, "{}", phase),
            FailureReason::WorkerAborted => fmt.write_str("worker aborted"),
            FailureReason::Cancelled => fmt.write_str("cancelled"),
            FailureReason::UpstreamFailure(ref port) => {
                write!(fmt, "upstream failure of {}", port)
            }
            FailureReason::UpstreamIgnored(_) => fmt.write_str("upstream ignored"),
            FailureReason::DependencyCycle => fmt.write_str("dependency cycle"),
            FailureReason::Metadata(ref msg) => write!(fmt, "metadata: {}", msg),
        }
    }
}

/// One entry in the build graph.
#[derive(Debug)]
pub struct PortNode {
    id: PortId,
    version: String,
    pkgname: String,
    fingerprint: Option<Fingerprint>,
    deps: BTreeMap<DepPhase, BTreeSet<NodeId>>,
    /// Union of `deps` across all phases; gates the `Ready` transition.
    blocking: BTreeSet<NodeId>,
    /// Blocking dependencies not yet `Succeeded`.
    dep_count: usize,
    /// Inverse of `blocking`; used for unblocking and failure fan-out.
    rdeps: BTreeSet<NodeId>,
    /// Longest path to a leaf; undefined for `Ignored` nodes.
    depth: Option<usize>,
    state: PortState,
    failure_reason: Option<FailureReason>,
    log_path: PathBuf,
}

impl PortNode {
    #[inline]
    pub fn id(&self) -> &PortId {
        &self.id
    }

    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[inline]
    pub fn pkgname(&self) -> &str {
        &self.pkgname
    }

    #[inline]
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn deps(&self, phase: DepPhase) -> impl Iterator<Item = NodeId> + '_ {
        self.deps.get(&phase).into_iter().flatten().cloned()
    }

    #[inline]
    pub fn blocking_deps(&self) -> &BTreeSet<NodeId> {
        &self.blocking
    }

    #[inline]
    pub fn dep_count(&self) -> usize {
        self.dep_count
    }

    #[inline]
    pub fn rdeps(&self) -> &BTreeSet<NodeId> {
        &self.rdeps
    }

    #[inline]
    pub fn depth(&self) -> Option<usize> {
        self.depth
    }

    #[inline]
    pub fn state(&self) -> PortState {
        self.state
    }

    #[inline]
    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.failure_reason.as_ref()
    }

    #[inline]
    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Totals across the graph, published through the status bus.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Tally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub remaining: usize,
    pub total: usize,
}

/// Directed acyclic graph of port nodes, owned by the scheduler.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: Vec<PortNode>,
    index: HashMap<PortId, NodeId>,
    frozen: bool,
}

impl BuildGraph {
    pub fn new() -> Self {
        BuildGraph::default()
    }

    /// Interns a port, creating a `Pending` node on first sight.
    pub fn add_node(
        &mut self,
        id: PortId,
        version: String,
        pkgname: String,
        log_path: PathBuf,
    ) -> NodeId {
        debug_assert!(!self.frozen);
        if let Some(&existing) = self.index.get(&id) {
            return existing;
        }

        let node_id = NodeId(self.nodes.len());
        self.index.insert(id.clone(), node_id);
        self.nodes.push(PortNode {
            id,
            version,
            pkgname,
            fingerprint: None,
            deps: BTreeMap::new(),
            blocking: BTreeSet::new(),
            dep_count: 0,
            rdeps: BTreeSet::new(),
            depth: None,
            state: PortState::Pending,
            failure_reason: None,
            log_path,
        });
        node_id
    }

    /// Records dependency edges for one phase of a node.
    pub fn add_deps(&mut self, node: NodeId, phase: DepPhase, deps: &[NodeId]) {
        debug_assert!(!self.frozen);
        let entry = self.nodes[node.0].deps.entry(phase).or_default();
        for &dep in deps {
            entry.insert(dep);
        }
    }

    /// Marks a node `Ignored` before the graph is frozen (metadata failure).
    pub fn ignore_node(&mut self, node: NodeId, reason: FailureReason) {
        debug_assert!(!self.frozen);
        let entry = &mut self.nodes[node.0];
        entry.state = PortState::Ignored;
        entry.failure_reason = Some(reason);
    }

    /// Freezes the graph: computes blocking unions, reverse dependencies,
    /// cycle membership, depths, and initial readiness.
    ///
    /// After this call the only mutations are scheduler state transitions.
    pub fn freeze(&mut self) {
        debug_assert!(!self.frozen);

        for idx in 0..self.nodes.len() {
            let blocking: BTreeSet<NodeId> = self.nodes[idx]
                .deps
                .values()
                .flatten()
                .cloned()
                .filter(|dep| dep.0 != idx)
                .collect();
            self.nodes[idx].blocking = blocking;
        }

        for idx in 0..self.nodes.len() {
            let deps: Vec<NodeId> = self.nodes[idx].blocking.iter().cloned().collect();
            for dep in deps {
                self.nodes[dep.0].rdeps.insert(NodeId(idx));
            }
        }

        for cycle_member in self.find_cycle_members() {
            let entry = &mut self.nodes[cycle_member.0];
            if entry.state != PortState::Ignored {
                entry.state = PortState::Ignored;
                entry.failure_reason = Some(FailureReason::DependencyCycle);
            }
        }

        // A self-dependency never reaches the cycle pass because the union
        // above strips it; treat it as a cycle of one.
        for idx in 0..self.nodes.len() {
            let self_dep = self.nodes[idx]
                .deps
                .values()
                .flatten()
                .any(|dep| dep.0 == idx);
            if self_dep && self.nodes[idx].state != PortState::Ignored {
                self.nodes[idx].state = PortState::Ignored;
                self.nodes[idx].failure_reason = Some(FailureReason::DependencyCycle);
            }
        }

        self.cascade_ignored();
        self.compute_depths();

        for idx in 0..self.nodes.len() {
            let dep_count = {
                let node = &self.nodes[idx];
                node.blocking
                    .iter()
                    .filter(|dep| self.nodes[dep.0].state != PortState::Succeeded)
                    .count()
            };
            let node = &mut self.nodes[idx];
            node.dep_count = dep_count;
            if node.state == PortState::Pending && dep_count == 0 {
                node.state = PortState::Ready;
            }
        }

        self.frozen = true;
    }

    /// Iterative depth-first coloring; returns every node on a cycle.
    fn find_cycle_members(&self) -> Vec<NodeId> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; self.nodes.len()];
        let mut on_cycle = BTreeSet::new();

        for root in 0..self.nodes.len() {
            if color[root] != WHITE {
                continue;
            }

            let mut stack = vec![(root, false)];
            while let Some((idx, children_done)) = stack.pop() {
                if children_done {
                    color[idx] = BLACK;
                    continue;
                }
                if color[idx] == BLACK {
                    continue;
                }
                color[idx] = GRAY;
                stack.push((idx, true));
                for dep in &self.nodes[idx].blocking {
                    match color[dep.0] {
                        WHITE => stack.push((dep.0, false)),
                        GRAY => {
                            // Back edge: walk the gray region reachable from
                            // the target to collect the cycle membership.
                            let mut queue = VecDeque::new();
                            queue.push_back(dep.0);
                            let mut seen = BTreeSet::new();
                            while let Some(at) = queue.pop_front() {
                                if !seen.insert(at) {
                                    continue;
                                }
                                if color[at] == GRAY {
                                    on_cycle.insert(NodeId(at));
                                    for next in &self.nodes[at].blocking {
                                        queue.push_back(next.0);
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        on_cycle.into_iter().collect()
    }

    /// Marks every node reachable from an `Ignored` node via reverse
    /// dependencies as `Skipped`.
    fn cascade_ignored(&mut self) {
        let roots: Vec<NodeId> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.nodes[id.0].state == PortState::Ignored)
            .collect();

        for root in roots {
            let root_port = self.nodes[root.0].id.clone();
            let mut queue: VecDeque<NodeId> = self.nodes[root.0].rdeps.iter().cloned().collect();
            while let Some(at) = queue.pop_front() {
                let entry = &mut self.nodes[at.0];
                if entry.state.is_terminal() {
                    continue;
                }
                entry.state = PortState::Skipped;
                entry.failure_reason = Some(FailureReason::UpstreamIgnored(root_port.clone()));
                queue.extend(entry.rdeps.iter().cloned());
            }
        }
    }

    /// Longest-path-to-leaf depth over blocking edges, `Ignored` excluded.
    fn compute_depths(&mut self) {
        // The graph is acyclic once cycle members are ignored, so a memoized
        // post-order walk terminates.
        let mut depth: Vec<Option<usize>> = vec![None; self.nodes.len()];

        for root in 0..self.nodes.len() {
            if self.nodes[root].state == PortState::Ignored || depth[root].is_some() {
                continue;
            }

            let mut stack = vec![(root, false)];
            while let Some((idx, children_done)) = stack.pop() {
                if self.nodes[idx].state == PortState::Ignored {
                    continue;
                }
                if children_done {
                    let computed = self.nodes[idx]
                        .blocking
                        .iter()
                        .filter_map(|dep| depth[dep.0])
                        .max()
                        .map(|max| max + 1)
                        .unwrap_or(0);
                    depth[idx] = Some(computed);
                } else if depth[idx].is_none() {
                    stack.push((idx, true));
                    for dep in &self.nodes[idx].blocking {
                        if depth[dep.0].is_none() {
                            stack.push((dep.0, false));
                        }
                    }
                }
            }
        }

        for (idx, d) in depth.into_iter().enumerate() {
            if self.nodes[idx].state != PortState::Ignored {
                self.nodes[idx].depth = d;
            }
        }
    }

    /// Nodes in dependency-before-dependent order, `Ignored` excluded.
    pub fn topo_order(&self) -> Vec<NodeId> {
        let mut order: Vec<NodeId> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.nodes[id.0].state != PortState::Ignored)
            .collect();
        order.sort_by_key(|id| (self.nodes[id.0].depth, id.0));
        order
    }

    /// Records the computed fingerprint for a node.
    pub fn set_fingerprint(&mut self, node: NodeId, fingerprint: Fingerprint) {
        self.nodes[node.0].fingerprint = Some(fingerprint);
    }

    #[inline]
    pub fn node_id(&self, port: &PortId) -> Option<NodeId> {
        self.index.get(port).cloned()
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &PortNode {
        &self.nodes[id.0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PortNode)> {
        self.nodes.iter().enumerate().map(|(idx, n)| (NodeId(idx), n))
    }

    /// Transitions a node to `Succeeded` and unblocks its dependents.
    ///
    /// Returns the dependents that became `Ready`.
    pub fn mark_succeeded(&mut self, node: NodeId) -> Vec<NodeId> {
        self.nodes[node.0].state = PortState::Succeeded;

        let rdeps: Vec<NodeId> = self.nodes[node.0].rdeps.iter().cloned().collect();
        let mut newly_ready = Vec::new();
        for rdep in rdeps {
            let entry = &mut self.nodes[rdep.0];
            if entry.dep_count > 0 {
                entry.dep_count -= 1;
            }
            if entry.state == PortState::Pending && entry.dep_count == 0 {
                entry.state = PortState::Ready;
                newly_ready.push(rdep);
            }
        }
        newly_ready
    }

    /// Transitions a node to `Failed` and cascades `Skipped` through its
    /// reverse dependencies.
    ///
    /// Returns the skipped nodes in cascade order.
    pub fn mark_failed(&mut self, node: NodeId, reason: FailureReason) -> Vec<NodeId> {
        let root_port = self.nodes[node.0].id.clone();
        self.nodes[node.0].state = PortState::Failed;
        self.nodes[node.0].failure_reason = Some(reason);

        let mut skipped = Vec::new();
        let mut queue: VecDeque<NodeId> = self.nodes[node.0].rdeps.iter().cloned().collect();
        while let Some(at) = queue.pop_front() {
            let entry = &mut self.nodes[at.0];
            if entry.state.is_terminal() {
                continue;
            }
            entry.state = PortState::Skipped;
            entry.failure_reason = Some(FailureReason::UpstreamFailure(root_port.clone()));
            skipped.push(at);
            queue.extend(entry.rdeps.iter().cloned());
        }
        skipped
    }

    /// Returns a dispatched node to `Ready` after a worker abort so it can
    /// be retried on a fresh slot.
    pub fn requeue(&mut self, node: NodeId) {
        debug_assert!(self.nodes[node.0].state.is_active());
        self.nodes[node.0].state = PortState::Ready;
    }

    /// Transitions a `Ready` node to `Staging` for dispatch.
    pub fn begin_staging(&mut self, node: NodeId) {
        debug_assert_eq!(self.nodes[node.0].state, PortState::Ready);
        self.nodes[node.0].state = PortState::Staging;
    }

    /// Advances a dispatched node's state from a worker phase notification.
    pub fn note_phase(&mut self, node: NodeId, phase: BuildPhase) {
        let entry = &mut self.nodes[node.0];
        if entry.state.is_terminal() {
            return;
        }
        entry.state = if phase == BuildPhase::Package {
            PortState::Packaging
        } else {
            PortState::Building
        };
    }

    /// `Ready` nodes ordered by dispatch priority: depth descending, then
    /// reverse-dependency count descending, then port id.
    pub fn ready_nodes_ordered(&self) -> Vec<NodeId> {
        let mut ready: Vec<NodeId> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.nodes[id.0].state == PortState::Ready)
            .collect();
        ready.sort_by(|a, b| {
            let na = &self.nodes[a.0];
            let nb = &self.nodes[b.0];
            nb.depth
                .cmp(&na.depth)
                .then(nb.rdeps.len().cmp(&na.rdeps.len()))
                .then(na.id.cmp(&nb.id))
        });
        ready
    }

    /// The packages to install into the sandbox before building `node`:
    /// its direct blocking dependencies plus their transitive run-time
    /// closure, in dependency order.
    pub fn staging_set(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> =
            self.nodes[node.0].blocking.iter().cloned().collect();
        while let Some(at) = queue.pop_front() {
            if !seen.insert(at) {
                continue;
            }
            for dep in self.nodes[at.0].deps(DepPhase::Run) {
                queue.push_back(dep);
            }
        }

        let mut ordered: Vec<NodeId> = seen.into_iter().collect();
        ordered.sort_by_key(|id| (self.nodes[id.0].depth, id.0));
        ordered
    }

    /// True when every node is in a terminal state.
    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(|node| node.state.is_terminal())
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally {
            total: self.nodes.len(),
            ..Tally::default()
        };
        for node in &self.nodes {
            match node.state {
                PortState::Succeeded => tally.succeeded += 1,
                PortState::Failed => tally.failed += 1,
                PortState::Skipped => tally.skipped += 1,
                PortState::Ignored => tally.ignored += 1,
                _ => tally.remaining += 1,
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(s: &str) -> PortId {
        s.parse().expect("Failed to parse port id")
    }

    fn add(graph: &mut BuildGraph, origin: &str) -> NodeId {
        let id = port(origin);
        let log = PathBuf::from(format!("/logs/{}.log", id.as_log_stem()));
        graph.add_node(id, "1.0".to_string(), format!("{}-1.0", origin.replace('/', "-")), log)
    }

    /// joe -> gettext, both leaves otherwise.
    fn chain() -> (BuildGraph, NodeId, NodeId) {
        let mut graph = BuildGraph::new();
        let joe = add(&mut graph, "editors/joe");
        let gettext = add(&mut graph, "devel/gettext");
        graph.add_deps(joe, DepPhase::Build, &[gettext]);
        graph.freeze();
        (graph, joe, gettext)
    }

    #[test]
    fn leaves_start_ready_and_dependents_pending() {
        let (graph, joe, gettext) = chain();
        assert_eq!(graph.node(gettext).state(), PortState::Ready);
        assert_eq!(graph.node(joe).state(), PortState::Pending);
        assert_eq!(graph.node(joe).dep_count(), 1);
        assert_eq!(graph.node(gettext).depth(), Some(0));
        assert_eq!(graph.node(joe).depth(), Some(1));
    }

    #[test]
    fn success_unblocks_dependents() {
        let (mut graph, joe, gettext) = chain();
        let newly_ready = graph.mark_succeeded(gettext);
        assert_eq!(newly_ready, vec![joe]);
        assert_eq!(graph.node(joe).state(), PortState::Ready);
    }

    #[test]
    fn failure_skips_the_whole_downstream_cone() {
        // libc <- libfoo <- app, plus app <- extra edge from libc directly.
        let mut graph = BuildGraph::new();
        let app = add(&mut graph, "www/app");
        let libfoo = add(&mut graph, "devel/libfoo");
        let libc = add(&mut graph, "devel/libc");
        graph.add_deps(app, DepPhase::Build, &[libfoo, libc]);
        graph.add_deps(libfoo, DepPhase::Build, &[libc]);
        graph.freeze();

        let skipped = graph.mark_failed(libc, FailureReason::Phase(BuildPhase::Build));
        let mut skipped_ports: Vec<String> = skipped
            .iter()
            .map(|id| graph.node(*id).id().to_string())
            .collect();
        skipped_ports.sort();
        assert_eq!(skipped_ports, ["devel/libfoo", "www/app"]);

        match graph.node(app).failure_reason() {
            Some(FailureReason::UpstreamFailure(root)) => {
                assert_eq!(root.to_string(), "devel/libc")
            }
            other => panic!("unexpected reason: {:?}", other),
        }
        assert_eq!(
            graph.node(app).failure_reason().map(|r| r.to_string()),
            Some("upstream failure of devel/libc".to_string())
        );
    }

    #[test]
    fn terminal_tally_accounts_for_every_node() {
        let (mut graph, _joe, gettext) = chain();
        graph.mark_failed(gettext, FailureReason::Phase(BuildPhase::Fetch));

        let tally = graph.tally();
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.skipped, 1);
        assert_eq!(tally.failed + tally.skipped + tally.succeeded + tally.ignored, tally.total);
        assert!(graph.is_complete());
    }

    #[test]
    fn self_dependency_is_ignored() {
        let mut graph = BuildGraph::new();
        let node = add(&mut graph, "misc/selfloop");
        graph.add_deps(node, DepPhase::Build, &[node]);
        graph.freeze();

        assert_eq!(graph.node(node).state(), PortState::Ignored);
        assert_eq!(
            graph.node(node).failure_reason(),
            Some(&FailureReason::DependencyCycle)
        );
    }

    #[test]
    fn two_node_cycle_is_ignored_and_dependent_skipped() {
        let mut graph = BuildGraph::new();
        let a = add(&mut graph, "devel/a");
        let b = add(&mut graph, "devel/b");
        let c = add(&mut graph, "devel/c");
        graph.add_deps(a, DepPhase::Build, &[b]);
        graph.add_deps(b, DepPhase::Build, &[a]);
        graph.add_deps(c, DepPhase::Build, &[a]);
        graph.freeze();

        assert_eq!(graph.node(a).state(), PortState::Ignored);
        assert_eq!(graph.node(b).state(), PortState::Ignored);
        assert_eq!(graph.node(c).state(), PortState::Skipped);
        assert_eq!(graph.tally().ignored, 2);
        assert!(graph.node(a).depth().is_none());
    }

    #[test]
    fn ready_order_prefers_depth_then_fanout_then_name() {
        let mut graph = BuildGraph::new();
        // wide: a leaf with two rdeps; lone_*: plain leaves that tie-break
        // by name. mid becomes ready later with a higher depth than any
        // remaining leaf.
        let top = add(&mut graph, "x11/top");
        let mid = add(&mut graph, "x11/mid");
        let deep = add(&mut graph, "devel/deep");
        let wide = add(&mut graph, "devel/wide");
        let user1 = add(&mut graph, "www/user1");
        let user2 = add(&mut graph, "www/user2");
        let lone_b = add(&mut graph, "misc/beta");
        let lone_a = add(&mut graph, "misc/alpha");
        graph.add_deps(top, DepPhase::Build, &[mid]);
        graph.add_deps(mid, DepPhase::Build, &[deep]);
        graph.add_deps(user1, DepPhase::Build, &[wide]);
        graph.add_deps(user2, DepPhase::Build, &[wide]);
        graph.freeze();

        // All initial leaves share depth 0, so fan-out decides first.
        let ready: Vec<String> = graph
            .ready_nodes_ordered()
            .iter()
            .map(|id| graph.node(*id).id().to_string())
            .collect();
        assert_eq!(
            ready,
            ["devel/wide", "devel/deep", "misc/alpha", "misc/beta"]
        );

        // Once deep succeeds, mid (depth 1) outranks every remaining leaf.
        graph.mark_succeeded(deep);
        let ready: Vec<String> = graph
            .ready_nodes_ordered()
            .iter()
            .map(|id| graph.node(*id).id().to_string())
            .collect();
        assert_eq!(
            ready,
            ["x11/mid", "devel/wide", "misc/alpha", "misc/beta"]
        );
        let _ = (lone_a, lone_b, user1, user2, top);
    }

    #[test]
    fn staging_set_includes_run_closure_of_build_deps() {
        // app build-depends on tool; tool run-depends on lib.
        let mut graph = BuildGraph::new();
        let app = add(&mut graph, "www/app");
        let tool = add(&mut graph, "devel/tool");
        let lib = add(&mut graph, "devel/lib");
        graph.add_deps(app, DepPhase::Build, &[tool]);
        graph.add_deps(tool, DepPhase::Run, &[lib]);
        graph.freeze();

        let staged: Vec<String> = graph
            .staging_set(app)
            .iter()
            .map(|id| graph.node(*id).id().to_string())
            .collect();
        assert_eq!(staged, ["devel/lib", "devel/tool"]);
    }

    #[test]
    fn requeue_returns_a_dispatched_node_to_ready() {
        let (mut graph, _joe, gettext) = chain();
        graph.begin_staging(gettext);
        assert_eq!(graph.node(gettext).state(), PortState::Staging);
        graph.requeue(gettext);
        assert_eq!(graph.node(gettext).state(), PortState::Ready);
    }

    #[test]
    fn phase_notes_move_through_building_to_packaging() {
        let (mut graph, _joe, gettext) = chain();
        graph.begin_staging(gettext);
        graph.note_phase(gettext, BuildPhase::Fetch);
        assert_eq!(graph.node(gettext).state(), PortState::Building);
        graph.note_phase(gettext, BuildPhase::Package);
        assert_eq!(graph.node(gettext).state(), PortState::Packaging);
    }
}
