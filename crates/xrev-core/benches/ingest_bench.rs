//! # Ingest Benchmarks
//!
//! Performance benchmarks for xrev-core commit, dedup and checkout paths.
//!
//! Run with: `cargo bench -p xrev-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use xrev_core::{
    Document, Element, IngestPolicy, Ingestor, MemoryRepository, PrefixRole, Session, canonical_string,
};

/// A book with N identified chapters, each holding a few plain paragraphs.
fn create_book(chapters: usize) -> Document {
    let mut book = Element::new("book").with_attr("xid", "book:#");
    for i in 0..chapters {
        let mut chapter = Element::new("chapter")
            .with_attr("xid", format!("ch{}:#", i))
            .with_attr("prop", format!("c{}", i));
        for p in 0..4 {
            chapter = chapter.with_child(Element::new("para").with_text(format!("chapter {} para {}", i, p)));
        }
        book = book.with_child(chapter);
    }
    Document::new("book.json", book)
}

/// A session with the book already committed, and the written-back document.
fn committed_book(chapters: usize) -> (Session, Document) {
    let mut session = Session::default();
    let mut docs = vec![create_book(chapters)];
    session.commit("init", &mut docs, &[]).expect("commit");
    let doc = docs.pop().expect("document");
    (session, doc)
}

fn bench_first_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_commit");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let doc = create_book(size);
            b.iter(|| {
                let mut session = Session::default();
                let mut docs = vec![doc.clone()];
                session.commit("init", &mut docs, &[]).expect("commit");
                black_box(session.repository().node_count())
            });
        });
    }

    group.finish();
}

fn bench_duplicate_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_ingest");
    let role = PrefixRole::default();
    let ingestor = Ingestor::new(IngestPolicy::default(), &role);

    for size in [10, 100, 1000] {
        let (session, doc) = committed_book(size);
        let repo: MemoryRepository = session.into_repository();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut scratch = repo.clone();
                let mut work = doc.clone();
                let outcome = ingestor.ingest(&mut scratch, &mut work).expect("ingest");
                black_box(outcome.duplicates.len())
            });
        });
    }

    group.finish();
}

fn bench_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkout");

    for size in [10, 100, 1000] {
        let (session, _) = committed_book(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(session.checkout("book.json", false).expect("checkout")));
        });
    }

    group.finish();
}

fn bench_canonical(c: &mut Criterion) {
    let doc = create_book(100);
    c.bench_function("canonical_string_100", |b| {
        b.iter(|| black_box(canonical_string(black_box(&doc.root))));
    });
}

criterion_group!(
    benches,
    bench_first_commit,
    bench_duplicate_ingest,
    bench_checkout,
    bench_canonical
);
criterion_main!(benches);
