//! # Session
//!
//! Orchestrates whole commits over a `MemoryRepository`.
//!
//! A commit ingests copies of the changed documents. Only when every
//! document succeeds is the commit finished and the assigned revisions
//! written back to the caller's documents; any error rolls the repository
//! back to the previous commit.

use crate::canonical::content_digest;
use crate::identity::{Xid, Xref, read_xid};
use crate::ingest::{DanglingReference, IngestPolicy, Ingestor};
use crate::migrate::{MigrationReport, build_graph};
use crate::normalize::{PayloadStore, denormalize};
use crate::repository::{Commit, File, FileChange, MemoryRepository, Repository};
use crate::resolve::resolve;
use crate::tree::{Document, Element};
use crate::types::{PolicyViolation, PrefixRole, ReferenceRole, XrevError};

/// What a commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Revision of the finished commit; `None` when there was nothing to commit.
    pub revision: Option<u64>,
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    /// Documents whose digest matched the head layout.
    pub skipped: Vec<String>,
    pub created: Vec<Xid>,
    pub duplicates: usize,
    pub dangling: Vec<DanglingReference>,
}

/// Working-copy state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Untracked,
    Unchanged,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: String,
    pub state: FileState,
}

/// A repository plus the policies commits run under.
pub struct Session {
    repo: MemoryRepository,
    policy: IngestPolicy,
    role: Box<dyn ReferenceRole>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("repo", &self.repo)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(MemoryRepository::new())
    }
}

impl Session {
    /// Session with default policy and the default `ref` prefix role.
    #[must_use]
    pub fn new(repo: MemoryRepository) -> Self {
        Self::with_policy(repo, IngestPolicy::default(), Box::new(PrefixRole::default()))
    }

    #[must_use]
    pub fn with_policy(
        repo: MemoryRepository,
        policy: IngestPolicy,
        role: Box<dyn ReferenceRole>,
    ) -> Self {
        Self { repo, policy, role }
    }

    #[must_use]
    pub fn repository(&self) -> &MemoryRepository {
        &self.repo
    }

    pub fn repository_mut(&mut self) -> &mut MemoryRepository {
        &mut self.repo
    }

    #[must_use]
    pub fn into_repository(self) -> MemoryRepository {
        self.repo
    }

    #[must_use]
    pub fn policy(&self) -> IngestPolicy {
        self.policy
    }

    /// Commit changed documents and deletions atomically.
    ///
    /// On success the documents carry their assigned revisions. On error the
    /// repository and the documents are left as they were.
    pub fn commit(
        &mut self,
        message: &str,
        documents: &mut [Document],
        deletions: &[String],
    ) -> Result<CommitSummary, XrevError> {
        let result = self.stage(documents, deletions);
        let (staged, mut summary) = match result {
            Ok(staged) => staged,
            Err(err) => {
                self.repo.abort_commit();
                tracing::warn!(error = %err, "commit aborted");
                return Err(err);
            }
        };

        if staged.is_empty() && summary.deleted.is_empty() {
            tracing::info!(skipped = summary.skipped.len(), "nothing to commit");
            return Ok(summary);
        }

        let mut changes = Vec::with_capacity(staged.len() + summary.deleted.len());
        for (_, _, file) in &staged {
            changes.push(FileChange::Write(file.clone()));
        }
        for path in &summary.deleted {
            changes.push(FileChange::Delete { path: path.clone() });
        }

        let revision = self.repo.finish_commit(message, changes).revision;
        for (index, work, _) in staged {
            documents[index] = work;
        }
        summary.revision = Some(revision);
        Ok(summary)
    }

    #[allow(clippy::type_complexity)]
    fn stage(
        &mut self,
        documents: &[Document],
        deletions: &[String],
    ) -> Result<(Vec<(usize, Document, File)>, CommitSummary), XrevError> {
        let mut summary = CommitSummary::default();
        for path in deletions {
            if self.repo.file(path).is_none() {
                return Err(XrevError::policy(
                    path.as_str(),
                    PolicyViolation::UntrackedPath(path.clone()),
                ));
            }
            summary.deleted.push(path.clone());
        }

        let ingestor = Ingestor::new(self.policy, self.role.as_ref());
        let mut staged = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            let head = self.repo.file(&document.path).cloned();
            if head
                .as_ref()
                .is_some_and(|f| f.digest == content_digest(&document.root))
            {
                summary.skipped.push(document.path.clone());
                continue;
            }

            let root_location = format!("{}:/{}", document.path, document.root.tag);
            if read_xid(&document.root)
                .map_err(|e| e.at(&root_location))?
                .is_none()
            {
                return Err(XrevError::policy(
                    root_location,
                    PolicyViolation::UnidentifiedRoot,
                ));
            }

            let mut work = document.clone();
            let outcome = ingestor.ingest(&mut self.repo, &mut work)?;
            let root = outcome
                .root
                .ok_or_else(|| XrevError::integrity("ingested root lost its identity"))?;

            let file = File {
                path: work.path.clone(),
                revision: self.repo.revision(),
                digest: content_digest(&work.root),
                root,
                prev: head.map(|f| f.revision),
                manifestation: (!outcome.manifestation.is_empty())
                    .then_some(outcome.manifestation),
            };
            summary.written.push(work.path.clone());
            summary.created.extend(outcome.created);
            summary.duplicates += outcome.duplicates.len();
            summary.dangling.extend(outcome.dangling);
            staged.push((index, work, file));
        }
        Ok((staged, summary))
    }

    /// Rebuild the head version of a tracked path.
    ///
    /// With `latest`, placeholders are remapped to the newest revision of
    /// their lifeline.
    pub fn checkout(&self, path: &str, latest: bool) -> Result<Document, XrevError> {
        let file = self.repo.file(path).ok_or_else(|| {
            XrevError::policy(path, PolicyViolation::UntrackedPath(path.to_string()))
        })?;
        let payload = self.repo.payload(&file.root)?.ok_or_else(|| {
            XrevError::integrity(format!("root {} is not stored", file.root)).at(path)
        })?;
        let migration = if latest {
            Some(self.repo.migration_map()?)
        } else {
            None
        };
        let manifestation = file.manifestation.clone().unwrap_or_default();
        let root = denormalize(&self.repo, &payload, Some(&manifestation), migration.as_ref())
            .map_err(|e| e.at(path))?;
        Ok(Document::new(path, root))
    }

    /// Retarget stale references in working documents.
    pub fn migrate(&self, documents: &mut [Document]) -> Result<MigrationReport, XrevError> {
        let mut graph = build_graph(&self.repo, documents, self.role.as_ref())?;
        let report = graph.migrate_all(&self.repo, documents)?;
        tracing::info!(
            rewritten = report.rewritten.len(),
            unresolvable = report.unresolvable.len(),
            modified = report.modified.len(),
            "migration finished"
        );
        Ok(report)
    }

    /// Resolve a reference to an expanded sub-tree.
    pub fn resolve(&self, xref: &Xref) -> Result<Option<Element>, XrevError> {
        resolve(&self.repo, xref)?
            .map(|found| denormalize(&self.repo, &found, None, None))
            .transpose()
    }

    /// Expanded content of one stored revision.
    pub fn show(&self, xid: &Xid) -> Result<Option<Element>, XrevError> {
        self.resolve(&Xref::new(xid.clone(), Vec::new()))
    }

    /// All revisions of a lifeline, oldest first.
    #[must_use]
    pub fn lifeline(&self, id: &str) -> Vec<Xid> {
        self.repo.lifeline(id)
    }

    /// Commit history, oldest first.
    #[must_use]
    pub fn log(&self) -> &[Commit] {
        self.repo.commits()
    }

    /// Compare working documents with the head layout.
    #[must_use]
    pub fn status(&self, documents: &[Document]) -> Vec<FileStatus> {
        documents
            .iter()
            .map(|document| {
                let state = match self.repo.file(&document.path) {
                    None => FileState::Untracked,
                    Some(file) if file.digest == content_digest(&document.root) => {
                        FileState::Unchanged
                    }
                    Some(_) => FileState::Modified,
                };
                FileStatus {
                    path: document.path.clone(),
                    state,
                }
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
