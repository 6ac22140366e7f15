//! # Reference Migration Engine
//!
//! Retargets stale cross-references in working documents.
//!
//! The graph has one `GraphNode` per distinct `Xid` met while walking the
//! documents, and two edge kinds:
//!
//! - **Inclusion**: nearest identified ancestor -> identified descendant
//!   (inline or placeholder). Acyclic by construction.
//! - **Reference**: nearest identified ancestor of a reference attribute ->
//!   the attribute's `Xref` base. May form cycles.
//!
//! Nodes and edges live in arenas and refer to each other by index.
//!
//! ## Fixed point
//!
//! A reference edge is examined from a work queue. If its destination has a
//! newer revision in the current tree, every attribute site is rewritten to
//! it; if the destination is itself about to change, sites are rewritten to
//! `id:#` (assign on commit). A rewrite modifies the edge source, which
//! happens at most once per node: its reference parents are re-queued and its
//! inclusion ancestors are marked breadth-first, re-queuing theirs.
//! Each node is marked at most once, so the run terminates on any finite graph.

use crate::identity::{Rev, Xid, Xref, read_xid};
use crate::normalize::placeholder_target;
use crate::repository::{Node, Repository};
use crate::tree::{Document, Element, ElementPath};
use crate::types::{ReferenceRole, XrevError};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

pub type GraphNodeId = usize;
pub type EdgeId = usize;

// =============================================================================
// GRAPH
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeKind {
    Inclusion,
    Reference,
}

/// An element instantiating a graph node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub doc: usize,
    pub path: ElementPath,
}

/// One attribute holding a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSite {
    pub doc: usize,
    pub path: ElementPath,
    pub attr: String,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub xid: Xid,
    /// Stored node, when the repository knows this identity.
    pub node: Option<Node>,
    /// Live elements carrying this identity.
    pub manifestations: Vec<Site>,
    pub inclusion_parents: Vec<EdgeId>,
    pub reference_parents: Vec<EdgeId>,
    /// Set once this node's content will change at the next commit.
    pub modified: bool,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub kind: EdgeKind,
    /// `None` for references outside any identified element.
    pub source: Option<GraphNodeId>,
    pub dest: GraphNodeId,
    /// Attribute sites; empty for inclusion edges.
    pub sites: Vec<AttrSite>,
}

/// Inclusion and reference graph over a set of working documents.
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
    index: BTreeMap<Xid, GraphNodeId>,
}

// =============================================================================
// REPORT
// =============================================================================

/// Why a reference could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnresolvableReason {
    #[error("{0} is not in the repository")]
    NotInRepository(Xid),
    #[error("newest revision {0} is not in the current tree")]
    NotInCurrentTree(Xid),
}

/// A reference left unmigrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolvable {
    pub location: String,
    pub xref: Xref,
    pub reason: UnresolvableReason,
}

/// One rewritten attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub location: String,
    pub from: Xref,
    pub to: Xref,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub rewritten: Vec<Rewrite>,
    pub unresolvable: Vec<Unresolvable>,
    /// Nodes whose content changes because of the migration, in marking order.
    pub modified: Vec<Xid>,
    /// Locations of the live elements that get a new revision at the next commit.
    pub revised: Vec<String>,
}

impl MigrationReport {
    /// Whether the migration left every reference current.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rewritten.is_empty() && self.unresolvable.is_empty()
    }
}

// =============================================================================
// BUILD
// =============================================================================

/// Build the graph in one depth-first pass per document.
pub fn build_graph<R: Repository + ?Sized>(
    repo: &R,
    documents: &[Document],
    role: &dyn ReferenceRole,
) -> Result<MigrationGraph, XrevError> {
    let mut builder = Builder {
        repo,
        role,
        graph: MigrationGraph::default(),
        keys: BTreeMap::new(),
    };
    for (doc, document) in documents.iter().enumerate() {
        builder.walk(doc, document, &document.root, ElementPath::root(), None)?;
    }
    Ok(builder.graph)
}

struct Builder<'a, R: Repository + ?Sized> {
    repo: &'a R,
    role: &'a dyn ReferenceRole,
    graph: MigrationGraph,
    keys: BTreeMap<(EdgeKind, Option<GraphNodeId>, GraphNodeId), EdgeId>,
}

impl<R: Repository + ?Sized> Builder<'_, R> {
    fn walk(
        &mut self,
        doc: usize,
        document: &Document,
        element: &Element,
        path: ElementPath,
        context: Option<GraphNodeId>,
    ) -> Result<(), XrevError> {
        let mut context = context;

        if let Some(xid) = read_xid(element).map_err(|e| e.at(&document.location_of(&path)))? {
            let id = self.graph.intern(self.repo, xid)?;
            self.graph.nodes[id].manifestations.push(Site {
                doc,
                path: path.clone(),
            });
            if let Some(parent) = context {
                self.link(EdgeKind::Inclusion, Some(parent), id);
            }
            context = Some(id);
        } else if let Some(target) =
            placeholder_target(element).map_err(|e| e.at(&document.location_of(&path)))?
        {
            let id = self.graph.intern(self.repo, target)?;
            if let Some(parent) = context {
                self.link(EdgeKind::Inclusion, Some(parent), id);
            }
            return Ok(());
        }

        for attr in &element.attrs {
            if !self.role.is_reference(element, &attr.name) {
                continue;
            }
            let xref: Xref = attr
                .value
                .parse()
                .map_err(|e: XrevError| e.at(&document.location_of(&path)))?;
            let dest = self.graph.intern(self.repo, xref.base)?;
            let edge = self.link(EdgeKind::Reference, context, dest);
            self.graph.edges[edge].sites.push(AttrSite {
                doc,
                path: path.clone(),
                attr: attr.name.clone(),
            });
        }

        for (index, child) in element.child_elements() {
            self.walk(doc, document, child, path.child(index), context)?;
        }
        Ok(())
    }

    fn link(&mut self, kind: EdgeKind, source: Option<GraphNodeId>, dest: GraphNodeId) -> EdgeId {
        if let Some(&edge) = self.keys.get(&(kind, source, dest)) {
            return edge;
        }
        let edge = self.graph.add_edge(kind, source, dest);
        self.keys.insert((kind, source, dest), edge);
        edge
    }
}

// =============================================================================
// QUERIES AND MIGRATION
// =============================================================================

impl MigrationGraph {
    /// Number of graph nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges of both kinds.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn node(&self, id: GraphNodeId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// The graph node of `xid`, if it was met.
    #[must_use]
    pub fn lookup(&self, xid: &Xid) -> Option<GraphNodeId> {
        self.index.get(xid).copied()
    }

    /// Edges of one kind, in creation order.
    pub fn edges_of(&self, kind: EdgeKind) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.kind == kind)
    }

    fn intern<R: Repository + ?Sized>(&mut self, repo: &R, xid: Xid) -> Result<GraphNodeId, XrevError> {
        if let Some(&id) = self.index.get(&xid) {
            return Ok(id);
        }
        let node = match xid.rev {
            Rev::Assigned(_) => repo.get_node(&xid)?,
            Rev::Missing | Rev::Unassigned => None,
        };
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            xid: xid.clone(),
            node,
            manifestations: Vec::new(),
            inclusion_parents: Vec::new(),
            reference_parents: Vec::new(),
            modified: false,
        });
        self.index.insert(xid, id);
        Ok(id)
    }

    fn add_edge(&mut self, kind: EdgeKind, source: Option<GraphNodeId>, dest: GraphNodeId) -> EdgeId {
        let edge = self.edges.len();
        self.edges.push(Edge {
            kind,
            source,
            dest,
            sites: Vec::new(),
        });
        match kind {
            EdgeKind::Inclusion => self.nodes[dest].inclusion_parents.push(edge),
            EdgeKind::Reference => self.nodes[dest].reference_parents.push(edge),
        }
        edge
    }

    /// Migrate every reference edge to a fixed point.
    pub fn migrate_all<R: Repository + ?Sized>(
        &mut self,
        repo: &R,
        documents: &mut [Document],
    ) -> Result<MigrationReport, XrevError> {
        let mut queue: VecDeque<EdgeId> = self
            .edges_of(EdgeKind::Reference)
            .map(|(id, _)| id)
            .collect();
        let mut report = MigrationReport::default();
        self.run(repo, documents, &mut queue, &mut report)?;
        Ok(report)
    }

    /// Migrate the references pointing at `xid`, and whatever that triggers.
    pub fn migrate_node<R: Repository + ?Sized>(
        &mut self,
        repo: &R,
        documents: &mut [Document],
        xid: &Xid,
    ) -> Result<MigrationReport, XrevError> {
        let mut report = MigrationReport::default();
        let Some(id) = self.lookup(xid) else {
            return Ok(report);
        };
        let mut queue: VecDeque<EdgeId> = self.nodes[id].reference_parents.iter().copied().collect();
        self.run(repo, documents, &mut queue, &mut report)?;
        Ok(report)
    }

    fn run<R: Repository + ?Sized>(
        &mut self,
        repo: &R,
        documents: &mut [Document],
        queue: &mut VecDeque<EdgeId>,
        report: &mut MigrationReport,
    ) -> Result<(), XrevError> {
        let mut reported = vec![false; self.edges.len()];
        while let Some(edge) = queue.pop_front() {
            match self.target_of(repo, edge)? {
                Target::Current => {}
                Target::Unresolvable(reason) => {
                    if reported.get(edge).copied().unwrap_or(true) {
                        continue;
                    }
                    reported[edge] = true;
                    self.report_unresolvable(documents, edge, reason, report)?;
                }
                Target::Rewrite(target) => {
                    let changed = self.rewrite_sites(documents, edge, &target, report)?;
                    if target.rev != Rev::Unassigned {
                        let dest = self.intern(repo, target)?;
                        self.relink(edge, dest);
                    }
                    if changed {
                        if let Some(source) = self.edges[edge].source {
                            self.propagate(documents, source, queue, report);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn target_of<R: Repository + ?Sized>(&self, repo: &R, edge: EdgeId) -> Result<Target, XrevError> {
        let dest = &self.nodes[self.edges[edge].dest];
        if dest.modified {
            return Ok(Target::Rewrite(dest.xid.at_rev(Rev::Unassigned)));
        }
        if dest.xid.rev.number().is_none() {
            return Ok(Target::Current);
        }
        if dest.node.is_none() && repo.get_node(&dest.xid)?.is_none() {
            return Ok(Target::Unresolvable(UnresolvableReason::NotInRepository(
                dest.xid.clone(),
            )));
        }

        let newest = repo.newest_revision(&dest.xid)?;
        if newest == dest.xid {
            return Ok(Target::Current);
        }
        let leaser = repo.get_latest_leaser(&newest.id)?.map(|n| n.payload_xid);
        if leaser.as_ref() != Some(&newest) {
            return Ok(Target::Unresolvable(UnresolvableReason::NotInCurrentTree(
                newest,
            )));
        }
        Ok(Target::Rewrite(newest))
    }

    fn rewrite_sites(
        &self,
        documents: &mut [Document],
        edge: EdgeId,
        target: &Xid,
        report: &mut MigrationReport,
    ) -> Result<bool, XrevError> {
        let mut changed = false;
        for site in &self.edges[edge].sites {
            let document = documents.get_mut(site.doc).ok_or_else(|| {
                XrevError::integrity(format!("migration site names missing document {}", site.doc))
            })?;
            let location = document.location_of(&site.path);
            let element = document.root.at_mut(&site.path).ok_or_else(|| {
                XrevError::integrity("migration site no longer exists").at(&location)
            })?;
            let Some(text) = element.attr(&site.attr) else {
                return Err(XrevError::integrity(format!(
                    "reference attribute '{}' disappeared",
                    site.attr
                ))
                .at(&location));
            };
            let from: Xref = text.parse().map_err(|e: XrevError| e.at(&location))?;
            let to = from.rebased(target.clone());
            if to.to_string() == from.to_string() {
                continue;
            }

            element.set_attr(site.attr.clone(), to.to_string());
            tracing::debug!(%location, %from, %to, "reference migrated");
            report.rewritten.push(Rewrite { location, from, to });
            changed = true;
        }
        Ok(changed)
    }

    fn report_unresolvable(
        &self,
        documents: &[Document],
        edge: EdgeId,
        reason: UnresolvableReason,
        report: &mut MigrationReport,
    ) -> Result<(), XrevError> {
        for site in &self.edges[edge].sites {
            let Some(document) = documents.get(site.doc) else {
                continue;
            };
            let location = document.location_of(&site.path);
            let Some(text) = document.root.at(&site.path).and_then(|e| e.attr(&site.attr)) else {
                continue;
            };
            let xref: Xref = text.parse().map_err(|e: XrevError| e.at(&location))?;
            tracing::warn!(%location, %xref, %reason, "unresolvable reference");
            report.unresolvable.push(Unresolvable {
                location,
                xref,
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    /// Point a reference edge at a new destination node.
    fn relink(&mut self, edge: EdgeId, dest: GraphNodeId) {
        let old = self.edges[edge].dest;
        if old == dest {
            return;
        }
        self.nodes[old].reference_parents.retain(|&e| e != edge);
        self.nodes[dest].reference_parents.push(edge);
        self.edges[edge].dest = dest;
    }

    /// Mark `start` and its inclusion ancestors modified, queueing the
    /// reference edges that point at each of them.
    fn propagate(
        &mut self,
        documents: &[Document],
        start: GraphNodeId,
        queue: &mut VecDeque<EdgeId>,
        report: &mut MigrationReport,
    ) {
        if self.nodes[start].modified {
            return;
        }
        self.mark(documents, start, queue, report);

        let mut upward = VecDeque::from([start]);
        while let Some(id) = upward.pop_front() {
            let parents: Vec<GraphNodeId> = self.nodes[id]
                .inclusion_parents
                .iter()
                .filter_map(|&e| self.edges[e].source)
                .collect();
            for parent in parents {
                if !self.nodes[parent].modified {
                    self.mark(documents, parent, queue, report);
                    upward.push_back(parent);
                }
            }
        }
    }

    fn mark(
        &mut self,
        documents: &[Document],
        id: GraphNodeId,
        queue: &mut VecDeque<EdgeId>,
        report: &mut MigrationReport,
    ) {
        let node = &mut self.nodes[id];
        node.modified = true;
        queue.extend(node.reference_parents.iter().copied());
        report.modified.push(node.xid.clone());
        for site in &node.manifestations {
            if let Some(document) = documents.get(site.doc) {
                report.revised.push(document.location_of(&site.path));
            }
        }
        tracing::debug!(xid = %node.xid, "marked modified");
    }
}

enum Target {
    Current,
    Rewrite(Xid),
    Unresolvable(UnresolvableReason),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{File, FileChange, MemoryRepository};
    use crate::types::PrefixRole;

    fn track(path: &str, root: Xid) -> FileChange {
        FileChange::Write(File {
            path: path.to_string(),
            revision: 0,
            digest: String::new(),
            root,
            prev: None,
            manifestation: None,
        })
    }

    /// t:1 committed, then superseded by t:2 which is the tracked head.
    fn repo_with_successor() -> MemoryRepository {
        let mut repo = MemoryRepository::new();
        repo.add_node(
            Element::new("target")
                .with_attr("xid", "t:1")
                .with_child(Element::new("p").with_text("old")),
            None,
        )
        .expect("t1");
        repo.finish_commit("one", vec![track("t.json", Xid::new("t", 1))]);
        repo.add_node(
            Element::new("target")
                .with_attr("xid", "t:2")
                .with_child(Element::new("p").with_text("new")),
            Some(&Xid::new("t", 1)),
        )
        .expect("t2");
        repo.finish_commit("two", vec![track("t.json", Xid::new("t", 2))]);
        repo
    }

    fn referrer(reference: &str) -> Document {
        Document::new(
            "s.json",
            Element::new("source").with_attr("xid", "s:1").with_child(
                Element::new("inner")
                    .with_attr("xid", "i:1")
                    .with_child(Element::new("see").with_attr("ref", reference)),
            ),
        )
    }

    #[test]
    fn build_creates_both_edge_kinds() {
        let repo = repo_with_successor();
        let docs = vec![referrer("t:1/p")];
        let graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");

        assert_eq!(graph.edges_of(EdgeKind::Inclusion).count(), 1);
        assert_eq!(graph.edges_of(EdgeKind::Reference).count(), 1);
        let (_, reference) = graph.edges_of(EdgeKind::Reference).next().expect("edge");
        assert_eq!(reference.source, graph.lookup(&Xid::new("i", 1)));
        assert_eq!(reference.dest, graph.lookup(&Xid::new("t", 1)).expect("t"));
        assert!(graph.node(reference.dest).and_then(|n| n.node.as_ref()).is_some());
    }

    #[test]
    fn stale_reference_is_rewritten_and_ancestors_marked() {
        let repo = repo_with_successor();
        let mut docs = vec![referrer("t:1/p")];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");
        let report = graph.migrate_all(&repo, &mut docs).expect("migrate");

        let see = docs[0].root.at(&ElementPath::from(vec![0, 0])).expect("see");
        assert_eq!(see.attr("ref"), Some("t:2/p"));
        assert_eq!(report.rewritten.len(), 1);
        assert_eq!(report.modified, vec![Xid::new("i", 1), Xid::new("s", 1)]);
        assert_eq!(
            report.revised,
            vec!["s.json:/source/inner[0]".to_string(), "s.json:/source".to_string()]
        );
        assert!(report.unresolvable.is_empty());
    }

    #[test]
    fn reference_to_modified_node_is_deferred() {
        let repo = repo_with_successor();
        let mut docs = vec![
            referrer("t:1/p"),
            Document::new(
                "u.json",
                Element::new("user")
                    .with_attr("xid", "u:1")
                    .with_attr("ref", "i:1"),
            ),
        ];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");
        let report = graph.migrate_all(&repo, &mut docs).expect("migrate");

        assert_eq!(docs[1].root.attr("ref"), Some("i:#"));
        assert!(report.modified.contains(&Xid::new("u", 1)));
    }

    #[test]
    fn current_reference_is_untouched() {
        let repo = repo_with_successor();
        let mut docs = vec![referrer("t:2/p")];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");
        let report = graph.migrate_all(&repo, &mut docs).expect("migrate");
        assert!(report.is_clean());
        assert!(report.modified.is_empty());
    }

    #[test]
    fn unknown_destination_is_reported() {
        let repo = repo_with_successor();
        let mut docs = vec![referrer("nowhere:4")];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");
        let report = graph.migrate_all(&repo, &mut docs).expect("migrate");
        assert_eq!(report.unresolvable.len(), 1);
        assert_eq!(
            report.unresolvable[0].reason,
            UnresolvableReason::NotInRepository(Xid::new("nowhere", 4))
        );
        assert_eq!(report.unresolvable[0].location, "s.json:/source/inner[0]/see[0]");
    }

    #[test]
    fn newest_outside_current_tree_is_reported() {
        let mut repo = repo_with_successor();
        repo.finish_commit(
            "untrack",
            vec![FileChange::Delete {
                path: "t.json".to_string(),
            }],
        );
        let mut docs = vec![referrer("t:1")];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");
        let report = graph.migrate_all(&repo, &mut docs).expect("migrate");
        assert_eq!(
            report.unresolvable[0].reason,
            UnresolvableReason::NotInCurrentTree(Xid::new("t", 2))
        );
        assert_eq!(
            docs[0].root.at(&ElementPath::from(vec![0, 0])).and_then(|e| e.attr("ref")),
            Some("t:1")
        );
    }

    #[test]
    fn reference_cycles_terminate() {
        let repo = repo_with_successor();
        let mut docs = vec![
            Document::new(
                "a.json",
                Element::new("a")
                    .with_attr("xid", "a:1")
                    .with_attr("ref", "b:1")
                    .with_child(Element::new("see").with_attr("ref", "t:1")),
            ),
            Document::new(
                "b.json",
                Element::new("b").with_attr("xid", "b:1").with_attr("ref", "a:1"),
            ),
        ];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");
        let report = graph.migrate_all(&repo, &mut docs).expect("migrate");

        assert_eq!(report.modified.len(), 2);
        assert_eq!(docs[0].root.attr("ref"), Some("b:#"));
        assert_eq!(docs[1].root.attr("ref"), Some("a:#"));
    }

    #[test]
    fn migrate_node_only_touches_its_referrers() {
        let repo = repo_with_successor();
        let mut docs = vec![referrer("t:1/p")];
        let mut graph = build_graph(&repo, &docs, &PrefixRole::default()).expect("build");

        let report = graph
            .migrate_node(&repo, &mut docs, &Xid::new("s", 1))
            .expect("migrate");
        assert!(report.is_clean());

        let report = graph
            .migrate_node(&repo, &mut docs, &Xid::new("t", 1))
            .expect("migrate");
        assert_eq!(report.rewritten.len(), 1);
    }

    #[test]
    fn malformed_reference_fails_build() {
        let repo = MemoryRepository::new();
        let docs = vec![referrer("t:1/")];
        let err = build_graph(&repo, &docs, &PrefixRole::default()).expect_err("syntax");
        assert!(matches!(err, XrevError::Syntax { .. }));
    }
}
