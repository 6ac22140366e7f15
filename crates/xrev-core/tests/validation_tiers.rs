//! # Validation Tier Tests (T0-T5)
//!
//! If ANY tier fails, the engine is INVALID.
//!
//! ## Tiers
//! - T0: Identity Encoding
//! - T1: Normalization and Equivalence
//! - T2: Ingest Decisions
//! - T3: Lifeline Rules
//! - T4: Reference Migration
//! - T5: Resolution and Checkout

use xrev_core::{
    Content, Document, Element, ElementPath, IngestOutcome, IngestPolicy, Ingestor,
    MemoryRepository, PolicyViolation, PrefixRole, Repository, Session, Xid, Xref, XrevError,
};

/// A session whose next commit gets `revision`.
fn session_at(revision: u64) -> Session {
    let mut session = Session::default();
    while session.repository().revision() < revision {
        session.repository_mut().finish_commit("", vec![]);
    }
    session
}

/// Replace the content of the element at `path` with a single text node.
fn retext(root: &mut Element, path: &[usize], text: &str) {
    let element = root
        .at_mut(&ElementPath::from(path.to_vec()))
        .expect("element to edit");
    element.children = vec![Content::Text(text.to_string())];
}

fn ingest_at(repo: &mut MemoryRepository, root: Element) -> Result<IngestOutcome, XrevError> {
    let role = PrefixRole::default();
    let ingestor = Ingestor::new(IngestPolicy::default(), &role);
    let mut doc = Document::new("scenario.json", root);
    ingestor.ingest(repo, &mut doc)
}

// =============================================================================
// TIER T0: IDENTITY ENCODING
// =============================================================================

mod t0_identity {
    use super::*;

    /// T0.1: The canonical Xref example round-trips.
    #[test]
    fn xref_example_roundtrips() {
        let xref: Xref = "x:5/prop1/prop2".parse().expect("parse");
        assert_eq!(xref.base, Xid::new("x", 5));
        assert_eq!(xref.path, vec!["prop1".to_string(), "prop2".to_string()]);
        assert_eq!(xref.to_string(), "x:5/prop1/prop2");
    }

    /// T0.2: Malformed identities are syntax errors.
    #[test]
    fn malformed_identities_rejected() {
        for bad in ["", "x:", ":1", "x:1x", "x:1/", "x//p", "x:1/a b"] {
            let result = bad.parse::<Xref>();
            assert!(
                matches!(result, Err(XrevError::Syntax { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    /// T0.3: Identity attributes must not mix forms.
    #[test]
    fn mixed_identity_forms_rejected() {
        let el = Element::new("a")
            .with_attr("xid", "x:1")
            .with_attr("id", "x")
            .with_attr("rev", "1");
        assert!(matches!(
            xrev_core::read_xid(&el),
            Err(XrevError::Syntax { .. })
        ));
    }
}

// =============================================================================
// TIER T1: NORMALIZATION AND EQUIVALENCE
// =============================================================================

mod t1_normalization {
    use super::*;
    use std::collections::BTreeMap;
    use xrev_core::{canonical_string, denormalize, equal, normalize};

    fn nested() -> Element {
        Element::new("doc")
            .with_attr("xid", "d:1")
            .with_child(
                Element::new("part")
                    .with_attr("xid", "p:1")
                    .with_child(Element::new("leaf").with_attr("xid", "l:1").with_text("deep")),
            )
            .with_child(Element::new("note").with_text("plain"))
    }

    /// T1.1: Only the outermost identified descendants are pruned.
    #[test]
    fn normalization_prunes_one_level() {
        let n = normalize(&nested()).expect("normalize");
        assert_eq!(n.table.len(), 1);
        assert_eq!(n.table[0].target, Xid::new("p", 1));
        let note = n.tree.at(&ElementPath::from(vec![1])).expect("note");
        assert_eq!(note.tag, "note");
    }

    /// T1.2: Round-trip through a store reproduces the source.
    #[test]
    fn roundtrip_through_store() {
        let source = nested();
        let n = normalize(&source).expect("normalize");
        let store: BTreeMap<Xid, Element> = n
            .table
            .iter()
            .map(|r| (r.target.clone(), source.at(&r.handle).expect("original").clone()))
            .collect();
        let back = denormalize(&store, &n.tree, None, None).expect("denormalize");
        assert!(equal(&back, &source));
    }

    /// T1.3: Canonical form is whitespace- and attribute-order-insensitive.
    #[test]
    fn canonical_form_is_stable() {
        let a = Element::new("p")
            .with_attr("b", "2")
            .with_attr("a", "1")
            .with_text("  two   words ");
        let b = Element::new("p")
            .with_attr("a", "1")
            .with_attr("b", "2")
            .with_text("two words");
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }
}

// =============================================================================
// TIER T2: INGEST DECISIONS
// =============================================================================

mod t2_ingest {
    use super::*;

    /// T2.1: Fresh, duplicate and modified content at revisions 5 and 6.
    #[test]
    fn revision_five_then_six() {
        let mut session = session_at(5);
        let repo = session.repository_mut();

        let outcome = ingest_at(repo, Element::new("A").with_attr("id", "x").with_attr("rev", "#"))
            .expect("fresh");
        assert_eq!(outcome.root, Some(Xid::new("x", 5)));
        repo.finish_commit("five", vec![]);
        assert_eq!(repo.revision(), 6);

        let before = repo.node_count();
        let outcome = ingest_at(repo, Element::new("A").with_attr("id", "x").with_attr("rev", "5"))
            .expect("duplicate");
        assert!(outcome.created.is_empty());
        assert_eq!(repo.node_count(), before);

        let outcome = ingest_at(
            repo,
            Element::new("A")
                .with_attr("id", "x")
                .with_attr("rev", "5")
                .with_attr("text", "changed"),
        )
        .expect("modified");
        assert_eq!(outcome.created, vec![Xid::new("x", 6)]);
        let node = repo.get_node(&Xid::new("x", 6)).expect("get").expect("stored");
        assert_eq!(node.prev, Some(Xid::new("x", 5)));
    }

    /// T2.2: Re-ingesting an unmodified document creates nothing.
    #[test]
    fn idempotent_reingest() {
        let mut repo = MemoryRepository::new();
        let role = PrefixRole::default();
        let ingestor = Ingestor::new(IngestPolicy::default(), &role);
        let mut doc = Document::new(
            "a.json",
            Element::new("a")
                .with_attr("xid", "a:#")
                .with_child(Element::new("b").with_attr("xid", "b:#").with_text("x")),
        );
        ingestor.ingest(&mut repo, &mut doc).expect("first");
        repo.finish_commit("one", vec![]);

        let outcome = ingestor.ingest(&mut repo, &mut doc).expect("second");
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.duplicates.len(), 2);
    }

    /// T2.3: Equivalent sub-trees in two documents share one node.
    #[test]
    fn dedup_across_documents() {
        let mut session = Session::default();
        let mut docs = vec![Document::new(
            "one.json",
            Element::new("one")
                .with_attr("xid", "one:#")
                .with_child(Element::new("s").with_attr("xid", "s:#").with_text("shared")),
        )];
        session.commit("one", &mut docs, &[]).expect("commit one");

        let mut more = vec![Document::new(
            "two.json",
            Element::new("two")
                .with_attr("xid", "two:#")
                .with_child(Element::new("s").with_attr("xid", "s:1").with_text("  shared ")),
        )];
        let summary = session.commit("two", &mut more, &[]).expect("commit two");
        assert_eq!(summary.created, vec![Xid::new("two", 2)]);
        assert_eq!(session.lifeline("s"), vec![Xid::new("s", 1)]);
    }

    /// T2.4: Equivalent fresh sub-trees in one commit share one node.
    #[test]
    fn dedup_within_commit() {
        let mut session = Session::default();
        let shared = || Element::new("s").with_attr("xid", "s:#").with_text("same");
        let mut docs = vec![
            Document::new("a.json", Element::new("a").with_attr("xid", "a:#").with_child(shared())),
            Document::new("b.json", Element::new("b").with_attr("xid", "b:#").with_child(shared())),
        ];
        let summary = session.commit("both", &mut docs, &[]).expect("commit");
        assert_eq!(summary.created.len(), 3);
        assert_eq!(summary.duplicates, 1);
    }

    /// T2.5: Different fresh content under one id in one commit conflicts.
    #[test]
    fn concurrent_revision_conflict() {
        let mut session = Session::default();
        let mut docs = vec![
            Document::new("a.json", Element::new("x").with_attr("xid", "x:#").with_text("one")),
            Document::new("b.json", Element::new("x").with_attr("xid", "x:#").with_text("two")),
        ];
        let err = session.commit("clash", &mut docs, &[]).expect_err("conflict");
        assert_eq!(
            err.violation(),
            Some(&PolicyViolation::ConcurrentRevision(Xid::new("x", 1)))
        );
        assert_eq!(err.location(), "b.json:/x");
        assert_eq!(session.repository().node_count(), 0);
    }

    /// T2.6: Parents of a modified child get a new revision too.
    #[test]
    fn modification_propagates_to_parent() {
        let mut session = Session::default();
        let mut docs = vec![Document::new(
            "a.json",
            Element::new("a")
                .with_attr("xid", "a:#")
                .with_child(Element::new("b").with_attr("xid", "b:#").with_text("v1")),
        )];
        session.commit("one", &mut docs, &[]).expect("one");

        retext(&mut docs[0].root, &[0], "v2");

        let summary = session.commit("two", &mut docs, &[]).expect("two");
        assert_eq!(summary.created, vec![Xid::new("b", 2), Xid::new("a", 2)]);
        assert_eq!(docs[0].root.attr("xid"), Some("a:2"));
    }
}

// =============================================================================
// TIER T3: LIFELINE RULES
// =============================================================================

mod t3_lifelines {
    use super::*;
    use std::collections::BTreeMap;

    fn committed_x() -> (Session, Vec<Document>) {
        let mut session = Session::default();
        let mut docs = vec![Document::new(
            "x.json",
            Element::new("x").with_attr("xid", "x:#").with_text("v1"),
        )];
        session.commit("one", &mut docs, &[]).expect("commit");
        (session, docs)
    }

    /// T3.1: Modifying a superseded node is a branch.
    #[test]
    fn no_branching() {
        let (mut session, mut docs) = committed_x();
        let stale = docs[0].clone();

        retext(&mut docs[0].root, &[], "v2");
        session.commit("two", &mut docs, &[]).expect("v2");

        let mut branch = vec![stale];
        retext(&mut branch[0].root, &[], "v2 elsewhere");
        let err = session.commit("branch", &mut branch, &[]).expect_err("branch");
        assert!(matches!(
            err.violation(),
            Some(PolicyViolation::Branch { base, .. }) if *base == Xid::new("x", 1)
        ));
    }

    /// T3.2: A fresh lifeline cannot take a leased id.
    #[test]
    fn lease_exclusivity() {
        let (mut session, _) = committed_x();
        let mut docs = vec![Document::new(
            "other.json",
            Element::new("x").with_attr("xid", "x:#").with_text("impostor"),
        )];
        let err = session.commit("steal", &mut docs, &[]).expect_err("lease");
        assert!(matches!(
            err.violation(),
            Some(PolicyViolation::LeaseConflict { leaser, .. }) if *leaser == Xid::new("x", 1)
        ));
    }

    /// T3.3: Untracking frees the id for a new lifeline.
    #[test]
    fn deletion_releases_lease() {
        let (mut session, _) = committed_x();
        session
            .commit("rm", &mut [], &["x.json".to_string()])
            .expect("delete");
        let mut docs = vec![Document::new(
            "other.json",
            Element::new("x").with_attr("xid", "x:#").with_text("fresh"),
        )];
        session.commit("reuse", &mut docs, &[]).expect("fresh lifeline");
        assert_eq!(session.lifeline("x").len(), 2);
    }

    /// T3.4: At most one reachable node per id lacks a successor.
    #[test]
    fn single_leaser_per_id() {
        let (mut session, mut docs) = committed_x();
        for text in ["v2", "v3", "v4"] {
            retext(&mut docs[0].root, &[], text);
            session.commit(text, &mut docs, &[]).expect("commit");
        }

        let repo = session.repository();
        let mut heads: BTreeMap<String, usize> = BTreeMap::new();
        let nodes: Vec<_> = repo.nodes().cloned().collect();
        let reachable = repo.reachable().expect("reachable");
        for slot in reachable {
            let node = &nodes[slot];
            if repo.successor(&node.payload_xid).expect("succ").is_none() {
                *heads.entry(node.payload_xid.id.clone()).or_default() += 1;
            }
        }
        assert!(heads.values().all(|&n| n == 1));
        assert_eq!(session.lifeline("x").len(), 4);
    }

    /// T3.5: Two unknown revisions of one id cannot both open a lifeline in
    /// the same commit.
    #[test]
    fn lease_exclusivity_within_commit() {
        let mut session = Session::with_policy(
            MemoryRepository::new(),
            IngestPolicy {
                ingest_unknowns: true,
                ..IngestPolicy::default()
            },
            Box::new(PrefixRole::default()),
        );
        let mut docs = vec![
            Document::new("a.json", Element::new("x").with_attr("xid", "x:3")),
            Document::new("b.json", Element::new("x").with_attr("xid", "x:7")),
        ];
        let err = session.commit("both", &mut docs, &[]).expect_err("lease");
        assert!(matches!(
            err.violation(),
            Some(PolicyViolation::LeaseConflict { leaser, candidate, .. })
                if *leaser == Xid::new("x", 3) && *candidate == Xid::new("x", 7)
        ));
        assert!(session.lifeline("x").is_empty());
        assert!(session.repository().commits().is_empty());
    }

    /// T3.6: Unknown identities need an override.
    #[test]
    fn unknown_identity_needs_override() {
        let mut session = Session::default();
        let mut docs = vec![Document::new("y.json", Element::new("y").with_attr("xid", "y:40"))];
        let err = session.commit("unknown", &mut docs, &[]).expect_err("unknown");
        assert_eq!(
            err.violation(),
            Some(&PolicyViolation::UnknownIdentity(Xid::new("y", 40)))
        );

        let mut lenient = Session::with_policy(
            MemoryRepository::new(),
            IngestPolicy {
                unrev_unknowns: true,
                ..IngestPolicy::default()
            },
            Box::new(PrefixRole::default()),
        );
        lenient.commit("unrev", &mut docs, &[]).expect("unrev");
        assert_eq!(docs[0].root.attr("xid"), Some("y:1"));
    }
}

// =============================================================================
// TIER T4: REFERENCE MIGRATION
// =============================================================================

mod t4_migration {
    use super::*;

    fn target(text: &str) -> Element {
        Element::new("t")
            .with_attr("xid", "t:#")
            .with_child(Element::new("p").with_attr("prop", "p").with_text(text))
    }

    /// T4.1: A stale reference is migrated and the referrer revised on commit.
    #[test]
    fn migrate_then_commit() {
        let mut session = Session::default();
        let mut docs = vec![
            Document::new("t.json", target("old")),
            Document::new(
                "s.json",
                Element::new("s")
                    .with_attr("xid", "s:#")
                    .with_child(Element::new("see").with_attr("ref", "t:#/p")),
            ),
        ];
        session.commit("one", &mut docs, &[]).expect("one");
        assert_eq!(
            docs[1].root.at(&ElementPath::from(vec![0])).and_then(|e| e.attr("ref")),
            Some("t:1/p")
        );

        retext(&mut docs[0].root, &[0], "new");
        session.commit("two", &mut docs[..1], &[]).expect("two");

        let mut working = vec![docs[1].clone()];
        let report = session.migrate(&mut working).expect("migrate");
        assert_eq!(report.rewritten.len(), 1);
        assert_eq!(report.modified, vec![Xid::new("s", 1)]);

        let summary = session.commit("three", &mut working, &[]).expect("three");
        assert_eq!(summary.created, vec![Xid::new("s", 3)]);

        let xref: Xref = working[0]
            .root
            .at(&ElementPath::from(vec![0]))
            .and_then(|e| e.attr("ref"))
            .expect("ref")
            .parse()
            .expect("xref");
        let resolved = session.resolve(&xref).expect("resolve").expect("found");
        assert!(xrev_core::equal(&resolved, &Element::new("p").with_attr("prop", "p").with_text("new")));
    }

    /// T4.2: References to nodes changed by the migration itself are assigned on commit.
    #[test]
    fn deferred_references_pin_on_commit() {
        let mut session = Session::default();
        let mut docs = vec![
            Document::new("t.json", target("old")),
            Document::new(
                "s.json",
                Element::new("s").with_attr("xid", "s:#").with_child(
                    Element::new("inner")
                        .with_attr("xid", "i:#")
                        .with_attr("prop", "in")
                        .with_child(Element::new("see").with_attr("ref", "t:#/p")),
                ),
            ),
            Document::new(
                "u.json",
                Element::new("u").with_attr("xid", "u:#").with_attr("ref", "i:#"),
            ),
        ];
        session.commit("one", &mut docs, &[]).expect("one");

        retext(&mut docs[0].root, &[0], "new");
        session.commit("two", &mut docs[..1], &[]).expect("two");

        let mut working = docs[1..].to_vec();
        let report = session.migrate(&mut working).expect("migrate");
        assert_eq!(working[1].root.attr("ref"), Some("i:#"));
        assert_eq!(report.modified.len(), 3);

        session.commit("three", &mut working, &[]).expect("three");
        assert_eq!(working[1].root.attr("ref"), Some("i:3"));
        assert!(session.show(&Xid::new("i", 3)).expect("show").is_some());
    }

    /// T4.3: Unknown reference targets are reported, not fatal.
    #[test]
    fn unresolvable_is_reported() {
        let session = Session::default();
        let mut working = vec![Document::new(
            "s.json",
            Element::new("s").with_attr("xid", "s:1").with_attr("ref", "ghost:3"),
        )];
        let report = session.migrate(&mut working).expect("migrate");
        assert_eq!(report.unresolvable.len(), 1);
        assert_eq!(working[0].root.attr("ref"), Some("ghost:3"));
    }
}

// =============================================================================
// TIER T5: RESOLUTION AND CHECKOUT
// =============================================================================

mod t5_resolution {
    use super::*;

    fn library() -> Session {
        let mut session = Session::default();
        let mut docs = vec![Document::new(
            "lib.json",
            Element::new("lib")
                .with_attr("xid", "lib:#")
                .with_child(Element::new("item").with_attr("xid", "it:#").with_text("content")),
        )];
        session.commit("lib", &mut docs, &[]).expect("lib");
        session
    }

    /// T5.1: Property paths cross inclusion boundaries.
    #[test]
    fn resolve_across_documents() {
        let mut session = Session::default();
        let mut docs = vec![Document::new(
            "x.json",
            Element::new("book").with_attr("xid", "x:#").with_child(
                Element::new("chapter")
                    .with_attr("xid", "c:#")
                    .with_attr("prop", "prop1")
                    .with_child(Element::new("para").with_attr("prop", "prop2").with_text("found")),
            ),
        )];
        session.commit("one", &mut docs, &[]).expect("commit");

        let xref: Xref = "x:1/prop1/prop2".parse().expect("xref");
        let found = session.resolve(&xref).expect("resolve").expect("found");
        assert_eq!(found.tag, "para");

        let missing: Xref = "x:1/prop1/nothing".parse().expect("xref");
        assert!(session.resolve(&missing).expect("resolve").is_none());
    }

    /// T5.2: Checkout keeps collapsed inclusions collapsed.
    #[test]
    fn checkout_honours_manifestation() {
        let mut session = library();
        let mut docs = vec![Document::new(
            "view.json",
            Element::new("view")
                .with_attr("xid", "v:#")
                .with_child(Element::new("item").with_attr("ref_xid", "it:1"))
                .with_child(
                    Element::new("box")
                        .with_child(Element::new("item").with_attr("xid", "it:1").with_text("content")),
                ),
        )];
        session.commit("view", &mut docs, &[]).expect("view");

        let out = session.checkout("view.json", false).expect("checkout");
        let collapsed = out.root.at(&ElementPath::from(vec![0])).expect("collapsed");
        assert!(collapsed.is_placeholder());
        assert_eq!(collapsed.attr("expand"), Some("false"));
        let expanded = out.root.at(&ElementPath::from(vec![1, 0])).expect("expanded");
        assert!(!expanded.is_placeholder());
        assert_eq!(expanded.attr("xid"), Some("it:1"));
    }

    /// T5.3: Manifestations are per document, even for shared nodes.
    #[test]
    fn nested_manifestations_are_per_document() {
        let mut session = library();
        let mut docs = vec![
            Document::new(
                "w.json",
                Element::new("w").with_attr("xid", "w:#").with_child(
                    Element::new("mid")
                        .with_attr("xid", "m:#")
                        .with_child(Element::new("item").with_attr("ref_xid", "it:1")),
                ),
            ),
        ];
        session.commit("w", &mut docs, &[]).expect("w");

        let mut expanded_docs = vec![Document::new(
            "w2.json",
            Element::new("w2").with_attr("xid", "w2:#").with_child(
                Element::new("mid").with_attr("xid", "m:2").with_child(
                    Element::new("item").with_attr("xid", "it:1").with_text("content"),
                ),
            ),
        )];
        let summary = session.commit("w2", &mut expanded_docs, &[]).expect("w2");
        assert!(!summary.created.contains(&Xid::new("m", 3)));

        let w = session.checkout("w.json", false).expect("w");
        assert!(w.root.at(&ElementPath::from(vec![0, 0])).expect("item").is_placeholder());

        let w2 = session.checkout("w2.json", false).expect("w2");
        let item = w2.root.at(&ElementPath::from(vec![0, 0])).expect("item");
        assert!(!item.is_placeholder());
        assert_eq!(item.attr("xid"), Some("it:1"));
    }

    /// T5.4: `latest` checkout follows successor links.
    #[test]
    fn checkout_latest_follows_successors() {
        let mut session = library();
        let mut view = vec![Document::new(
            "view.json",
            Element::new("view")
                .with_attr("xid", "v:#")
                .with_child(Element::new("item").with_attr("xid", "it:1").with_text("content")),
        )];
        session.commit("view", &mut view, &[]).expect("view");

        let mut lib = vec![session.checkout("lib.json", false).expect("lib")];
        retext(&mut lib[0].root, &[0], "revised");
        session.commit("revise", &mut lib, &[]).expect("revise");

        let pinned = session.checkout("view.json", false).expect("pinned");
        let latest = session.checkout("view.json", true).expect("latest");
        let text = |doc: &Document| {
            doc.root
                .at(&ElementPath::from(vec![0]))
                .and_then(|e| e.attr("xid").map(str::to_string))
        };
        assert_eq!(text(&pinned), Some("it:1".to_string()));
        assert_eq!(text(&latest), Some("it:3".to_string()));
    }
}
