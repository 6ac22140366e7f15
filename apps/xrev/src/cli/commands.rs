//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//!
//! Documents on disk are JSON element trees (`{"tag": .., "attrs": [..],
//! "children": [..]}`); the tracked path of a document is the path it was
//! given on the command line. The repository is a single snapshot file,
//! replaced atomically after every successful mutation.

use crate::config;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use xrev_core::formats::MAX_PERSISTENCE_PAYLOAD_SIZE;
use xrev_core::{
    Document, Element, FileChange, FileState, MemoryRepository, Repository, Session, Xid, Xref,
    XrevError, repository_from_bytes, repository_to_bytes,
};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a document file (100 MB).
const MAX_DOCUMENT_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), XrevError> {
    let metadata = fs::metadata(path).map_err(|e| {
        XrevError::IoError(format!("cannot read metadata of {}: {}", path.display(), e))
    })?;

    if metadata.len() > max_size {
        return Err(XrevError::IoError(format!(
            "file {} is {} bytes, maximum allowed is {} bytes",
            path.display(),
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Global output switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn print_json(&self, value: &serde_json::Value) {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_default()
        );
    }

    /// Whether human-readable progress lines should be printed.
    fn chatty(&self) -> bool {
        !self.json && !self.quiet
    }
}

fn element_json(element: &Element) -> Result<serde_json::Value, XrevError> {
    serde_json::to_value(element).map_err(|e| XrevError::SerializationError(e.to_string()))
}

fn state_label(state: FileState) -> &'static str {
    match state {
        FileState::Untracked => "untracked",
        FileState::Unchanged => "unchanged",
        FileState::Modified => "modified",
    }
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create an empty repository file.
pub fn cmd_init(repo_path: &Path, out: Output, force: bool) -> Result<(), XrevError> {
    if repo_path.exists() && !force {
        return Err(XrevError::IoError(format!(
            "repository {} already exists. Use --force to overwrite.",
            repo_path.display()
        )));
    }

    let config = config::load(repo_path)?;
    let repository = config.new_repository();
    save_repository(&repository, repo_path)?;
    tracing::info!(path = %repo_path.display(), seed = config.repository.seed, "repository initialized");

    if out.json {
        out.print_json(&serde_json::json!({
            "repository": repo_path.to_string_lossy(),
            "revision": repository.revision(),
        }));
    } else if !out.quiet {
        println!("Initialized empty repository at {}", repo_path.display());
    }
    Ok(())
}

// =============================================================================
// COMMIT COMMAND
// =============================================================================

/// Commit documents and deletions; assigned revisions are written back to the files.
pub fn cmd_commit(
    repo_path: &Path,
    out: Output,
    message: &str,
    files: &[PathBuf],
    deletions: &[String],
) -> Result<(), XrevError> {
    let mut session = load_session(repo_path)?;
    let mut documents = read_documents(files)?;

    let summary = session.commit(message, &mut documents, deletions)?;
    if summary.revision.is_some() {
        let outputs: Vec<(&Path, &Element)> = files
            .iter()
            .zip(&documents)
            .filter(|(_, document)| summary.written.contains(&document.path))
            .map(|(file, document)| (file.as_path(), &document.root))
            .collect();
        save_commit(session.repository(), repo_path, &outputs)?;
    }

    if out.json {
        out.print_json(&serde_json::json!({
            "revision": summary.revision,
            "written": summary.written,
            "deleted": summary.deleted,
            "skipped": summary.skipped,
            "created": summary.created.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "duplicates": summary.duplicates,
            "dangling": summary.dangling.iter().map(|d| serde_json::json!({
                "location": d.location,
                "attribute": d.attribute,
                "xref": d.xref.to_string(),
            })).collect::<Vec<_>>(),
        }));
        return Ok(());
    }

    for dangling in &summary.dangling {
        eprintln!(
            "warning: {} {}=\"{}\" does not resolve",
            dangling.location, dangling.attribute, dangling.xref
        );
    }
    if out.quiet {
        return Ok(());
    }
    match summary.revision {
        Some(revision) => {
            println!("Committed revision {}", revision);
            println!(
                "  {} written, {} deleted, {} unchanged",
                summary.written.len(),
                summary.deleted.len(),
                summary.skipped.len()
            );
            println!(
                "  {} nodes created, {} duplicates",
                summary.created.len(),
                summary.duplicates
            );
        }
        None => println!("Nothing to commit ({} unchanged)", summary.skipped.len()),
    }
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Repository summary plus the state of each given document.
pub fn cmd_status(
    repo_path: &Path,
    out: Output,
    files: &[PathBuf],
) -> Result<(), XrevError> {
    let session = load_session(repo_path)?;
    let documents = read_documents(files)?;
    let statuses = session.status(&documents);
    let repository = session.repository();
    let head = repository.head().map(|c| c.revision);

    if out.json {
        out.print_json(&serde_json::json!({
            "repository": repo_path.to_string_lossy(),
            "head": head,
            "commits": session.log().len(),
            "nodes": repository.node_count(),
            "tracked": repository
                .layout()
                .values()
                .map(|f| serde_json::json!({ "path": f.path, "root": f.root.to_string() }))
                .collect::<Vec<_>>(),
            "files": statuses
                .iter()
                .map(|s| serde_json::json!({ "path": s.path, "state": state_label(s.state) }))
                .collect::<Vec<_>>(),
        }));
        return Ok(());
    }

    println!("xrev Repository Status");
    println!("======================");
    println!("Repository: {}", repo_path.display());
    match head {
        Some(revision) => println!("Head:       revision {}", revision),
        None => println!("Head:       (no commits)"),
    }
    println!("Nodes:      {}", repository.node_count());
    println!("Tracked:    {}", repository.layout().len());
    for file in repository.layout().values() {
        println!("  {} -> {}", file.path, file.root);
    }
    if !statuses.is_empty() {
        println!();
        for status in &statuses {
            println!("  {:<10} {}", state_label(status.state), status.path);
        }
    }
    Ok(())
}

// =============================================================================
// LOG COMMAND
// =============================================================================

/// Commit history, newest first.
pub fn cmd_log(repo_path: &Path, out: Output) -> Result<(), XrevError> {
    let session = load_session(repo_path)?;

    if out.json {
        let commits: Vec<_> = session
            .log()
            .iter()
            .rev()
            .map(|commit| {
                serde_json::json!({
                    "revision": commit.revision,
                    "message": commit.message,
                    "nodes": commit.nodes.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "changes": commit.changes.iter().map(|change| match change {
                        FileChange::Write(file) => serde_json::json!({
                            "write": file.path,
                            "root": file.root.to_string(),
                        }),
                        FileChange::Delete { path } => serde_json::json!({ "delete": path }),
                    }).collect::<Vec<_>>(),
                })
            })
            .collect();
        out.print_json(&serde_json::Value::Array(commits));
        return Ok(());
    }

    if session.log().is_empty() {
        println!("No commits yet");
        return Ok(());
    }
    for commit in session.log().iter().rev() {
        println!(
            "revision {}: {} ({} nodes)",
            commit.revision,
            commit.message,
            commit.nodes.len()
        );
        for change in &commit.changes {
            match change {
                FileChange::Write(file) => println!("  W {} -> {}", file.path, file.root),
                FileChange::Delete { path } => println!("  D {}", path),
            }
        }
    }
    Ok(())
}

// =============================================================================
// SHOW / RESOLVE COMMANDS
// =============================================================================

/// Print the expanded content of one stored revision.
pub fn cmd_show(repo_path: &Path, out: Output, xid: &str) -> Result<(), XrevError> {
    let xid: Xid = xid.parse()?;
    let session = load_session(repo_path)?;
    let found = session.show(&xid)?;
    print_lookup(out, "xid", &xid.to_string(), found.as_ref())
}

/// Resolve a reference and print the expanded result.
pub fn cmd_resolve(repo_path: &Path, out: Output, xref: &str) -> Result<(), XrevError> {
    let xref: Xref = xref.parse()?;
    let session = load_session(repo_path)?;
    let found = session.resolve(&xref)?;
    print_lookup(out, "xref", &xref.to_string(), found.as_ref())
}

fn print_lookup(
    out: Output,
    key: &str,
    query: &str,
    found: Option<&Element>,
) -> Result<(), XrevError> {
    let element = found.map(element_json).transpose()?;
    if out.json {
        out.print_json(&serde_json::json!({
            key: query,
            "found": element.is_some(),
            "element": element,
        }));
        return Ok(());
    }
    match element {
        Some(value) => out.print_json(&value),
        None => println!("{} not found", query),
    }
    Ok(())
}

// =============================================================================
// CHECKOUT COMMAND
// =============================================================================

/// Rebuild a tracked document; stdout unless `output` is given.
pub fn cmd_checkout(
    repo_path: &Path,
    out: Output,
    path: &str,
    latest: bool,
    output: Option<&Path>,
) -> Result<(), XrevError> {
    let session = load_session(repo_path)?;
    let document = session.checkout(path, latest)?;

    match output {
        Some(target) => {
            write_element(target, &document.root)?;
            if out.chatty() {
                println!("Checked out {} to {}", path, target.display());
            }
        }
        None => out.print_json(&element_json(&document.root)?),
    }
    Ok(())
}

// =============================================================================
// MIGRATE COMMAND
// =============================================================================

/// Retarget stale references in place.
pub fn cmd_migrate(
    repo_path: &Path,
    out: Output,
    files: &[PathBuf],
    dry_run: bool,
) -> Result<(), XrevError> {
    let session = load_session(repo_path)?;
    let originals = read_documents(files)?;
    let mut documents = originals.clone();
    let report = session.migrate(&mut documents)?;

    let mut changed = Vec::new();
    for ((file, before), after) in files.iter().zip(&originals).zip(&documents) {
        if before.root != after.root {
            if !dry_run {
                write_element(file, &after.root)?;
            }
            changed.push(after.path.clone());
        }
    }

    if out.json {
        out.print_json(&serde_json::json!({
            "dry_run": dry_run,
            "changed": changed,
            "rewritten": report.rewritten.iter().map(|r| serde_json::json!({
                "location": r.location,
                "from": r.from.to_string(),
                "to": r.to.to_string(),
            })).collect::<Vec<_>>(),
            "unresolvable": report.unresolvable.iter().map(|u| serde_json::json!({
                "location": u.location,
                "xref": u.xref.to_string(),
                "reason": u.reason.to_string(),
            })).collect::<Vec<_>>(),
            "modified": report.modified.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "revised": report.revised,
        }));
        return Ok(());
    }

    for unresolvable in &report.unresolvable {
        eprintln!(
            "warning: {} {}: {}",
            unresolvable.location, unresolvable.xref, unresolvable.reason
        );
    }
    if out.quiet {
        return Ok(());
    }
    if report.is_clean() {
        println!("All references are current");
        return Ok(());
    }
    for rewrite in &report.rewritten {
        println!("  {}: {} -> {}", rewrite.location, rewrite.from, rewrite.to);
    }
    println!(
        "{} references rewritten in {} documents{}; {} nodes will get a new revision on commit",
        report.rewritten.len(),
        changed.len(),
        if dry_run { " (dry run)" } else { "" },
        report.modified.len()
    );
    for location in &report.revised {
        println!("  revise {}", location);
    }
    Ok(())
}

// =============================================================================
// LIFELINE COMMAND
// =============================================================================

/// All revisions of an id, oldest first, with the current leaser marked.
pub fn cmd_lifeline(repo_path: &Path, out: Output, id: &str) -> Result<(), XrevError> {
    let session = load_session(repo_path)?;
    let repository = session.repository();
    let leaser = repository.get_latest_leaser(id)?.map(|n| n.payload_xid);

    let mut rows = Vec::new();
    for xid in session.lifeline(id) {
        let prev = repository.get_node(&xid)?.and_then(|n| n.prev);
        let current = leaser.as_ref() == Some(&xid);
        rows.push((xid, prev, current));
    }

    if out.json {
        out.print_json(&serde_json::Value::Array(
            rows.iter()
                .map(|(xid, prev, current)| {
                    serde_json::json!({
                        "xid": xid.to_string(),
                        "prev": prev.as_ref().map(ToString::to_string),
                        "current": current,
                    })
                })
                .collect(),
        ));
        return Ok(());
    }

    if rows.is_empty() {
        println!("No revisions of '{}'", id);
        return Ok(());
    }
    for (xid, prev, current) in &rows {
        let marker = if *current { "*" } else { " " };
        match prev {
            Some(prev) => println!("{} {} (from {})", marker, xid, prev),
            None => println!("{} {}", marker, xid),
        }
    }
    Ok(())
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Tracked path of a document file.
pub fn tracked_path(file: &Path) -> String {
    file.to_string_lossy().replace('\\', "/")
}

/// Read a JSON element tree as a document tracked under its path.
pub fn read_document(file: &Path) -> Result<Document, XrevError> {
    validate_file_size(file, MAX_DOCUMENT_FILE_SIZE)?;
    let bytes = fs::read(file)
        .map_err(|e| XrevError::IoError(format!("cannot read {}: {}", file.display(), e)))?;
    let root: Element = serde_json::from_slice(&bytes).map_err(|e| {
        XrevError::DeserializationError(format!("{} is not an element tree: {}", file.display(), e))
    })?;
    Ok(Document::new(tracked_path(file), root))
}

fn read_documents(files: &[PathBuf]) -> Result<Vec<Document>, XrevError> {
    files.iter().map(PathBuf::as_path).map(read_document).collect()
}

/// Write an element tree as pretty JSON, replacing the file atomically.
pub fn write_element(file: &Path, element: &Element) -> Result<(), XrevError> {
    persist(stage_element(file, element)?, file)
}

/// Serialize `element` into a temp file beside `file`, ready to be persisted.
fn stage_element(file: &Path, element: &Element) -> Result<tempfile::NamedTempFile, XrevError> {
    let data = serde_json::to_vec_pretty(element)
        .map_err(|e| XrevError::SerializationError(e.to_string()))?;
    stage_bytes(file, &data)
}

fn stage_bytes(file: &Path, data: &[u8]) -> Result<tempfile::NamedTempFile, XrevError> {
    let dir = parent_dir(file);
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        XrevError::IoError(format!("cannot create temp file in {}: {}", dir.display(), e))
    })?;
    temp.write_all(data)
        .map_err(|e| XrevError::IoError(format!("cannot write {}: {}", file.display(), e)))?;
    Ok(temp)
}

fn persist(temp: tempfile::NamedTempFile, file: &Path) -> Result<(), XrevError> {
    temp.persist(file)
        .map_err(|e| XrevError::IoError(format!("cannot replace {}: {}", file.display(), e)))?;
    Ok(())
}

fn parent_dir(file: &Path) -> &Path {
    file.parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

/// Save a finished commit: the repository and the documents it rewrote.
///
/// Every document is staged before the repository is replaced, so a document
/// that cannot be written leaves both untouched. Once the repository is
/// saved, documents that still fail to move into place are named in the
/// error.
pub fn save_commit(
    repository: &MemoryRepository,
    repo_path: &Path,
    outputs: &[(&Path, &Element)],
) -> Result<(), XrevError> {
    let staged = outputs
        .iter()
        .map(|(file, element)| Ok((*file, stage_element(file, element)?)))
        .collect::<Result<Vec<_>, XrevError>>()?;
    save_repository(repository, repo_path)?;

    let mut stale = Vec::new();
    for (file, temp) in staged {
        if let Err(e) = persist(temp, file) {
            tracing::error!(error = %e, "document not updated after commit");
            stale.push(file.display().to_string());
        }
    }
    if stale.is_empty() {
        return Ok(());
    }
    Err(XrevError::IoError(format!(
        "commit saved to {} but these documents still lack their new revisions: {}",
        repo_path.display(),
        stale.join(", ")
    )))
}

/// Open the repository file under the configuration next to it.
pub fn load_session(repo_path: &Path) -> Result<Session, XrevError> {
    let config = config::load(repo_path)?;
    if !repo_path.exists() {
        return Err(XrevError::IoError(format!(
            "no repository at {}; run `xrev init` first",
            repo_path.display()
        )));
    }
    validate_file_size(repo_path, MAX_PERSISTENCE_PAYLOAD_SIZE as u64)?;
    let bytes = fs::read(repo_path).map_err(|e| {
        XrevError::IoError(format!("cannot read {}: {}", repo_path.display(), e))
    })?;
    let repository = repository_from_bytes(&bytes)?;
    tracing::debug!(path = %repo_path.display(), revision = repository.revision(), "repository loaded");
    Ok(config.session(repository))
}

/// Replace the repository file atomically.
pub fn save_repository(repository: &MemoryRepository, repo_path: &Path) -> Result<(), XrevError> {
    let bytes = repository_to_bytes(repository)?;
    persist(stage_bytes(repo_path, &bytes)?, repo_path)
}
