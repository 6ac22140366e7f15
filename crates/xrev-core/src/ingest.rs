//! # Ingest Engine
//!
//! Commit-time processing of one document: every identified element is
//! visited depth-first post-order (children before parents) and classified as
//! duplicate, new node, or legal new revision of an existing lifeline.
//!
//! ## Per-element decision
//!
//! ```text
//! rev == #           -> assign commit revision, allow_new
//! stored, same       -> duplicate (no node)
//! stored, different  -> bump revision, recheck, then branch/lease checks, new node
//! not stored         -> new node if allowed, else unrev_unknowns / ingest_unknowns / error
//! ```
//!
//! The engine is strict: every violated rule aborts the document with a
//! location-tagged error. Rolling back nodes already added is the caller's
//! job (see `MemoryRepository::abort_commit`).

use crate::identity::{Rev, Xid, Xref, read_xid, strip_xid, write_xid};
use crate::normalize::{
    Manifestation, Normalized, PayloadStore, RefXidRecord, denormalize_refs, equivalent,
    normalize, scan_table,
};
use crate::primitives::{LINK_TYPE, PROPERTY_ATTR};
use crate::repository::Repository;
use crate::resolve::resolve;
use crate::tree::{Content, Document, Element, ElementPath};
use crate::types::{PolicyViolation, ReferenceRole, XrevError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// POLICY AND OUTCOME
// =============================================================================

/// Override switches for identities the repository does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestPolicy {
    /// Store unknown identities as-is instead of failing.
    pub ingest_unknowns: bool,
    /// Give unknown identities a fresh revision and treat them as new.
    pub unrev_unknowns: bool,
    /// Resolve every reference attribute after ingest and report dangling ones.
    pub validate_references: bool,
}

/// A reference attribute that did not resolve after ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub location: String,
    pub attribute: String,
    pub xref: Xref,
}

/// What ingesting one document produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Identity of the document root, if it carries one.
    pub root: Option<Xid>,
    /// Nodes created, in creation order.
    pub created: Vec<Xid>,
    /// Identified elements that matched stored content.
    pub duplicates: Vec<Xid>,
    /// Inclusion points of the root left collapsed in this document.
    pub manifestation: Manifestation,
    /// Filled only when `validate_references` is set.
    pub dangling: Vec<DanglingReference>,
}

/// Result of processing one identified element.
struct Ingested {
    xid: Xid,
    stacks: Vec<Vec<Xid>>,
}

/// Property names registered in one identified scope.
struct PropertyScope {
    owner: String,
    names: BTreeMap<String, String>,
}

impl PropertyScope {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            names: BTreeMap::new(),
        }
    }

    fn register(&mut self, name: &str, location: &str) -> Result<(), XrevError> {
        if self.names.contains_key(name) {
            return Err(XrevError::policy(
                location,
                PolicyViolation::DuplicateProperty {
                    name: name.to_string(),
                    scope: self.owner.clone(),
                },
            ));
        }
        self.names.insert(name.to_string(), location.to_string());
        Ok(())
    }
}

// =============================================================================
// INGESTOR
// =============================================================================

/// Commit-time ingest of documents into a repository.
pub struct Ingestor<'a> {
    policy: IngestPolicy,
    role: &'a dyn ReferenceRole,
}

impl<'a> Ingestor<'a> {
    #[must_use]
    pub fn new(policy: IngestPolicy, role: &'a dyn ReferenceRole) -> Self {
        Self { policy, role }
    }

    /// Rewrite a document into ingestible form.
    ///
    /// Missing revisions become unassigned; references whose base revision is
    /// unassigned are pinned to the commit revision.
    pub fn preprocess<R: Repository + ?Sized>(
        &self,
        repo: &R,
        document: &mut Document,
    ) -> Result<(), XrevError> {
        let paths: Vec<ElementPath> = document
            .root
            .elements()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        let revision = repo.revision();

        for path in paths {
            let location = document.location_of(&path);
            let Some(element) = document.root.at_mut(&path) else {
                continue;
            };

            if let Some(xid) = read_xid(element).map_err(|e| e.at(&location))? {
                if xid.rev == Rev::Missing {
                    write_xid(element, &xid.at_rev(Rev::Unassigned));
                }
            }

            let names: Vec<String> = element
                .attrs
                .iter()
                .filter(|a| self.role.is_reference(element, &a.name))
                .map(|a| a.name.clone())
                .collect();
            for name in names {
                let Some(text) = element.attr(&name) else {
                    continue;
                };
                let xref: Xref = text.parse().map_err(|e: XrevError| e.at(&location))?;
                if xref.base.rev == Rev::Unassigned {
                    let pinned = xref.rebased(xref.base.at_rev(Rev::Assigned(revision)));
                    element.set_attr(name, pinned.to_string());
                }
            }
        }
        Ok(())
    }

    /// Ingest one document.
    ///
    /// Assigned revisions are written back into `document`. On error the
    /// document may be partially rewritten; callers ingest a copy.
    pub fn ingest<R>(&self, repo: &mut R, document: &mut Document) -> Result<IngestOutcome, XrevError>
    where
        R: Repository + PayloadStore + ?Sized,
    {
        self.preprocess(&*repo, document)?;

        let source = document.path.clone();
        let root_location = format!("{}:/{}", source, document.root.tag);
        let mut run = Run {
            repo: &mut *repo,
            policy: self.policy,
            created: Vec::new(),
            duplicates: Vec::new(),
        };

        let root_xid = read_xid(&document.root).map_err(|e| e.at(&root_location))?;
        let (root, manifestation) = match root_xid {
            Some(xid) => {
                if let Some(name) = document.root.attr(PROPERTY_ATTR) {
                    tracing::debug!(location = %root_location, name, "ignoring property marker on document root");
                }
                let ingested = run.process(&mut document.root, xid, &root_location)?;
                (
                    Some(ingested.xid),
                    Manifestation {
                        stacks: ingested.stacks,
                    },
                )
            }
            None => {
                let mut scope = PropertyScope::new(&root_location);
                let mut found = Vec::new();
                run.scan_scope(
                    &mut document.root,
                    &root_location,
                    &ElementPath::root(),
                    &mut scope,
                    &mut found,
                )?;
                (None, Manifestation::default())
            }
        };

        let created = std::mem::take(&mut run.created);
        let duplicates = std::mem::take(&mut run.duplicates);
        let dangling = if self.policy.validate_references {
            self.dangling_references(&*repo, document)?
        } else {
            Vec::new()
        };

        tracing::debug!(
            document = %source,
            created = created.len(),
            duplicates = duplicates.len(),
            "document ingested"
        );
        Ok(IngestOutcome {
            root,
            created,
            duplicates,
            manifestation,
            dangling,
        })
    }

    /// Every reference attribute of `document` that does not resolve.
    pub fn dangling_references<S: PayloadStore + ?Sized>(
        &self,
        store: &S,
        document: &Document,
    ) -> Result<Vec<DanglingReference>, XrevError> {
        let mut dangling = Vec::new();
        for (path, element) in document.root.elements() {
            for attr in &element.attrs {
                if !self.role.is_reference(element, &attr.name) {
                    continue;
                }
                let location = document.location_of(&path);
                let xref: Xref = attr.value.parse().map_err(|e: XrevError| e.at(&location))?;
                if resolve(store, &xref).map_err(|e| e.at(&location))?.is_none() {
                    tracing::warn!(%location, attribute = %attr.name, %xref, "dangling reference");
                    dangling.push(DanglingReference {
                        location,
                        attribute: attr.name.clone(),
                        xref,
                    });
                }
            }
        }
        Ok(dangling)
    }
}

// =============================================================================
// ONE INGEST RUN
// =============================================================================

struct Run<'r, R: Repository + ?Sized> {
    repo: &'r mut R,
    policy: IngestPolicy,
    created: Vec<Xid>,
    duplicates: Vec<Xid>,
}

impl<R: Repository + ?Sized> Run<'_, R> {
    /// Visit the property scope rooted at `element`, ingesting identified
    /// descendants as they are found.
    fn scan_scope(
        &mut self,
        element: &mut Element,
        location: &str,
        relative: &ElementPath,
        scope: &mut PropertyScope,
        found: &mut Vec<(ElementPath, Ingested)>,
    ) -> Result<(), XrevError> {
        for (index, child) in element.children.iter_mut().enumerate() {
            let Content::Element(child) = child else {
                continue;
            };
            let child_location = format!("{}/{}[{}]", location, child.tag, index);
            let child_path = relative.child(index);

            if let Some(name) = child.attr(PROPERTY_ATTR) {
                scope.register(name, &child_location)?;
            }

            if let Some(xid) = read_xid(child).map_err(|e| e.at(&child_location))? {
                let ingested = self.process(child, xid, &child_location)?;
                found.push((child_path, ingested));
            } else if !child.is_placeholder() {
                self.scan_scope(child, &child_location, &child_path, scope, found)?;
            }
        }
        Ok(())
    }

    /// Post-order processing of one identified element.
    fn process(
        &mut self,
        element: &mut Element,
        xid: Xid,
        location: &str,
    ) -> Result<Ingested, XrevError> {
        let mut scope = PropertyScope::new(location);
        let mut found = Vec::new();
        self.scan_scope(element, location, &ElementPath::root(), &mut scope, &mut found)?;

        self.ingest_element(element, xid, found)
            .map_err(|e| e.at(location))
    }

    fn ingest_element(
        &mut self,
        element: &mut Element,
        mut xid: Xid,
        found: Vec<(ElementPath, Ingested)>,
    ) -> Result<Ingested, XrevError> {
        let mut allow_new = false;
        match xid.rev {
            Rev::Missing => {
                return Err(XrevError::integrity(format!(
                    "{} reached ingest without a revision",
                    xid
                )));
            }
            Rev::Unassigned => {
                self.assign_revision(element, None, &mut xid);
                allow_new = true;
            }
            Rev::Assigned(_) => {}
        }

        let mut normalized = normalize(element)?;
        normalized.tree.remove_attr(PROPERTY_ATTR);
        self.check_collapsed_targets(&normalized.table)?;

        loop {
            if let Some(existing) = self.repo.get_node(&xid)? {
                if let Some(links) = same_content(&normalized, &existing.payload)? {
                    return Ok(self.duplicate(xid, &normalized.table, &links, &found));
                }
                return self.modify(element, normalized, xid, &found);
            }

            if allow_new {
                self.check_lease(&xid, None)?;
                return self.create(normalized, xid, None, &found);
            }
            if self.policy.unrev_unknowns {
                tracing::debug!(%xid, "unknown identity, assigning fresh revision");
                self.assign_revision(element, Some(&mut normalized.tree), &mut xid);
                allow_new = true;
                continue;
            }
            if self.policy.ingest_unknowns {
                tracing::debug!(%xid, "unknown identity, ingesting as-is");
                self.check_lease(&xid, None)?;
                return self.create(normalized, xid, None, &found);
            }
            return Err(XrevError::policy(
                "",
                PolicyViolation::UnknownIdentity(xid),
            ));
        }
    }

    /// Content changed under an existing identity: open a new revision.
    fn modify(
        &mut self,
        element: &mut Element,
        mut normalized: Normalized,
        mut xid: Xid,
        found: &[(ElementPath, Ingested)],
    ) -> Result<Ingested, XrevError> {
        let original = xid.clone();
        self.assign_revision(element, Some(&mut normalized.tree), &mut xid);
        if xid == original {
            return Err(XrevError::policy(
                "",
                PolicyViolation::ConcurrentRevision(original),
            ));
        }

        if let Some(newer) = self.repo.get_node(&xid)? {
            // Another element already made the same modification in this commit.
            return match same_content(&normalized, &newer.payload)? {
                Some(links) => Ok(self.duplicate(xid, &normalized.table, &links, found)),
                None => Err(XrevError::policy(
                    "",
                    PolicyViolation::ConcurrentRevision(xid),
                )),
            };
        }

        if let Some(successor) = self.repo.successor(&original)? {
            return Err(XrevError::policy(
                "",
                PolicyViolation::Branch {
                    base: original,
                    successor,
                },
            ));
        }
        self.check_lease(&xid, Some(&original))?;

        tracing::debug!(from = %original, to = %xid, "modification");
        self.create(normalized, xid, Some(original), found)
    }

    fn create(
        &mut self,
        mut normalized: Normalized,
        xid: Xid,
        prev: Option<Xid>,
        found: &[(ElementPath, Ingested)],
    ) -> Result<Ingested, XrevError> {
        let mut links = Vec::with_capacity(normalized.table.len());
        for record in &mut normalized.table {
            let link = self.repo.generate_xid(LINK_TYPE)?;
            record.link = Some(link.clone());
            links.push(Some(link));
        }
        denormalize_refs(&mut normalized.tree, &normalized.table)?;

        let stacks = collect_stacks(&normalized.table, &links, found);
        self.repo.add_node(normalized.tree, prev.as_ref())?;
        if prev.is_none() {
            tracing::debug!(%xid, "new node");
        }
        self.created.push(xid.clone());
        Ok(Ingested { xid, stacks })
    }

    fn duplicate(
        &mut self,
        xid: Xid,
        table: &[RefXidRecord],
        stored_links: &[Option<Xid>],
        found: &[(ElementPath, Ingested)],
    ) -> Ingested {
        tracing::debug!(%xid, "duplicate");
        let stacks = collect_stacks(table, stored_links, found);
        self.duplicates.push(xid.clone());
        Ingested { xid, stacks }
    }

    /// Move `xid` to the commit revision and write it to the live element
    /// (and the normalized copy, when there is one).
    fn assign_revision(&self, element: &mut Element, normalized: Option<&mut Element>, xid: &mut Xid) {
        self.repo.set_new_revision(xid);
        write_xid(element, xid);
        if let Some(tree) = normalized {
            write_xid(tree, xid);
        }
    }

    /// The id must not be leased by another lifeline in the current tree.
    fn check_lease(&self, candidate: &Xid, original: Option<&Xid>) -> Result<(), XrevError> {
        let Some(leaser) = self.repo.get_latest_leaser(&candidate.id)? else {
            return Ok(());
        };
        if original == Some(&leaser.payload_xid) {
            return Ok(());
        }
        Err(XrevError::policy(
            "",
            PolicyViolation::LeaseConflict {
                id: candidate.id.clone(),
                leaser: leaser.payload_xid,
                candidate: candidate.clone(),
            },
        ))
    }

    /// Placeholders already present in the source must point at stored nodes.
    fn check_collapsed_targets(&self, table: &[RefXidRecord]) -> Result<(), XrevError> {
        for record in table.iter().filter(|r| !r.expand) {
            if self.repo.get_node(&record.target)?.is_none() {
                tracing::debug!(handle = %record.handle, target = %record.target, "collapsed placeholder target unknown");
                return Err(XrevError::policy(
                    "",
                    PolicyViolation::UnknownIdentity(record.target.clone()),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Compare a fresh normalized copy with a stored payload.
///
/// Identity attributes on the two roots are ignored (the lookup already
/// matched them). Returns the stored link identities, in table order, when
/// the content is the same.
fn same_content(ours: &Normalized, stored: &Element) -> Result<Option<Vec<Option<Xid>>>, XrevError> {
    let mut a = ours.clone();
    strip_xid(&mut a.tree);

    let mut b = Normalized {
        tree: stored.clone(),
        table: scan_table(stored)?,
    };
    strip_xid(&mut b.tree);

    if equivalent(&mut a, &mut b)? {
        Ok(Some(b.table.into_iter().map(|r| r.link).collect()))
    } else {
        Ok(None)
    }
}

/// Manifestation stacks of one element, relative to its own table.
///
/// A collapsed inclusion point contributes `[link]`; an expanded one lifts the
/// included element's stacks by pushing its link on top.
fn collect_stacks(
    table: &[RefXidRecord],
    links: &[Option<Xid>],
    found: &[(ElementPath, Ingested)],
) -> Vec<Vec<Xid>> {
    let mut stacks = Vec::new();
    for (record, link) in table.iter().zip(links) {
        let Some(link) = link else {
            continue;
        };
        if !record.expand {
            stacks.push(vec![link.clone()]);
            continue;
        }
        let Some((_, child)) = found.iter().find(|(path, _)| *path == record.handle) else {
            continue;
        };
        for stack in &child.stacks {
            let mut lifted = stack.clone();
            lifted.push(link.clone());
            stacks.push(lifted);
        }
    }
    stacks
}

// =============================================================================
// TESTS
// =============================================================================
