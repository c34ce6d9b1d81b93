//! Target adapters and the replay ordering they share.
//!
//! By the time a target replays a changeset the source has already brought
//! the working directory up to date; the target only has to register the
//! same operations with its own VCS. The order of those operations is fixed
//! by [`plan_replay`].

pub mod git;

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob_match::glob_match;

use crate::changeset::{Changeset, Entry};
use crate::commit_format::CommitMessage;
use crate::config::{Config, TargetKind};
use crate::errors::TargetError;

pub use git::GitTarget;

/// Metadata directories of the supported VCSs, never replayed.
pub const METADATA_DIRS: &[&str] = &[".svn", "_darcs", "CVS", ".git", ".hg", "MT"];

#[async_trait]
pub trait TargetAdapter: Send + Sync {
    /// Backend name for logs.
    fn kind(&self) -> &str;

    /// Create or open the target repository.
    async fn initialize(&self) -> Result<(), TargetError>;

    /// Register the changeset's operations. Returns conflicting paths.
    async fn replay(&self, changeset: &Changeset) -> Result<Vec<String>, TargetError>;

    /// Record `entries` (paths relative to the working directory, `.` for
    /// the whole tree) as one commit.
    async fn commit(
        &self,
        date: DateTime<Utc>,
        author: &str,
        message: &CommitMessage,
        entries: &[String],
    ) -> Result<(), TargetError>;

    /// Attach a tag to the last commit. Targets without tags ignore it.
    async fn tag(&self, _name: &str) -> Result<(), TargetError> {
        Ok(())
    }
}

/// Build the adapter selected by `[target] kind`.
pub fn build_target(config: &Config) -> Box<dyn TargetAdapter> {
    let exclude = ExcludeRules::new(&config.replay.exclude);
    match config.target.kind {
        TargetKind::Git => {
            // keep the state store out of the mirrored tree
            let ignored = config
                .state_path()
                .strip_prefix(&config.project.root)
                .map(|rel| vec![format!("/{}*", rel.display())])
                .unwrap_or_default();
            Box::new(
                GitTarget::new(
                    config.project.root.clone(),
                    config.target.repository.clone(),
                    exclude,
                )
                .with_ignored(ignored),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Replay ordering
// ---------------------------------------------------------------------------

/// One working-tree operation, in the order a target must perform it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStep {
    AddDir(String),
    Rename { from: String, to: String },
    Remove(String),
    AddFile(String),
    /// Add everything below an added directory that no entry names.
    AddSubtree(String),
}

/// Order a changeset's entries for replay:
/// added directories ascending, renames, removals descending, added files,
/// then the contents of each outermost added directory.
///
/// `is_dir` tells whether an added name is a directory in the working tree.
pub fn plan_replay(changeset: &Changeset, is_dir: impl Fn(&str) -> bool) -> Vec<ReplayStep> {
    let (mut dirs, files): (Vec<&Entry>, Vec<&Entry>) = changeset
        .added_entries()
        .into_iter()
        .partition(|e| is_dir(e.name()));
    dirs.sort_by(|a, b| a.name().cmp(b.name()));

    let mut removed = changeset.removed_entries();
    removed.sort_by(|a, b| b.name().cmp(a.name()));

    let mut steps: Vec<ReplayStep> = dirs
        .iter()
        .map(|e| ReplayStep::AddDir(e.name().to_string()))
        .collect();
    steps.extend(changeset.renamed_entries().into_iter().map(|e| ReplayStep::Rename {
        from: e.old_name().unwrap_or_default().to_string(),
        to: e.name().to_string(),
    }));
    steps.extend(removed.iter().map(|e| ReplayStep::Remove(e.name().to_string())));
    steps.extend(files.iter().map(|e| ReplayStep::AddFile(e.name().to_string())));

    let mut outer: Vec<&str> = Vec::new();
    for dir in &dirs {
        if !outer.iter().any(|parent| is_within(dir.name(), parent)) {
            outer.push(dir.name());
        }
    }
    steps.extend(outer.into_iter().map(|d| ReplayStep::AddSubtree(d.to_string())));
    steps
}

/// `path` equals `dir` or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Files below `dir` (relative to `root`), skipping VCS metadata,
/// excluded paths and anything in `handled`. Sorted by path.
pub fn walk_subtree(
    root: &Path,
    dir: &str,
    handled: &HashSet<String>,
    exclude: &ExcludeRules,
) -> std::io::Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_string()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(root.join(&current))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if METADATA_DIRS.contains(&name.as_str()) {
                continue;
            }
            let rel = format!("{current}/{name}");
            if handled.contains(&rel) || exclude.is_excluded(&rel) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                pending.push(rel);
            } else {
                found.push(rel);
            }
        }
    }
    found.sort();
    Ok(found)
}

// ---------------------------------------------------------------------------
// Boring files
// ---------------------------------------------------------------------------

/// Glob patterns of paths that are never replayed.
///
/// A pattern matches against the full relative path and against the final
/// path component, so `*.pyc` excludes compiled files at any depth.
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
    patterns: Vec<String>,
}

impl ExcludeRules {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.to_vec(),
        }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        let base = path.rsplit('/').next().unwrap_or(path);
        self.patterns
            .iter()
            .any(|p| glob_match(p, path) || glob_match(p, base))
    }

    /// `path` or one of its parent directories is excluded.
    pub fn covers(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path = path.trim_start_matches("./");
        path.match_indices('/')
            .map(|(i, _)| &path[..i])
            .chain(std::iter::once(path))
            .any(|prefix| self.is_excluded(prefix))
    }

    /// Copy of `changeset` without excluded entries. A rename is dropped
    /// only when both of its names are excluded.
    pub fn apply(&self, changeset: &Changeset) -> Changeset {
        if self.patterns.is_empty() {
            return changeset.clone();
        }
        changeset.filtered(|e| {
            !self.is_excluded(e.name())
                || e.old_name().is_some_and(|old| !self.is_excluded(old))
        })
    }
}
