//! Git target backed by `git2`.
//!
//! The git repository lives in the same directory as the source working
//! copy. Replay only touches the index; commits are built from it with the
//! upstream author and date.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{Index, IndexAddOption, IndexMatchedPath, Repository, Signature, Time};
use tracing::{debug, info, instrument};

use super::{plan_replay, walk_subtree, ExcludeRules, ReplayStep, TargetAdapter, METADATA_DIRS};
use crate::changeset::Changeset;
use crate::commit_format::CommitMessage;
use crate::errors::TargetError;

pub struct GitTarget {
    root: PathBuf,
    remote: Option<String>,
    exclude: ExcludeRules,
    ignored: Vec<String>,
}

impl GitTarget {
    pub fn new(root: impl Into<PathBuf>, remote: Option<String>, exclude: ExcludeRules) -> Self {
        Self {
            root: root.into(),
            remote,
            exclude,
            ignored: Vec::new(),
        }
    }

    /// Extra `info/exclude` lines, e.g. the state file when it lives in the
    /// working directory.
    pub fn with_ignored(mut self, lines: Vec<String>) -> Self {
        self.ignored = lines;
        self
    }

    fn open(&self) -> Result<Repository, TargetError> {
        Repository::open(&self.root)
            .map_err(|_| TargetError::RepositoryNotFound(self.root.display().to_string()))
    }

    fn check_inside(&self, path: &str) -> Result<(), TargetError> {
        if Path::new(path).is_absolute() || path.split('/').any(|c| c == "..") {
            return Err(TargetError::PathOutsideTree(path.to_string()));
        }
        Ok(())
    }

    /// Bring the index entry for `path` in line with the working tree.
    fn stage(&self, index: &mut Index, path: &str) -> Result<(), TargetError> {
        self.check_inside(path)?;
        let full = self.root.join(path);
        // add_all callback: non-zero skips the matched file
        let mut skip_excluded = |matched: &Path, _: &[u8]| -> i32 {
            i32::from(self.exclude.covers(&matched.to_string_lossy()))
        };
        if path == "." {
            index.add_all(
                ["*"].iter(),
                IndexAddOption::DEFAULT,
                Some(&mut skip_excluded as &mut IndexMatchedPath),
            )?;
            // add_all never drops entries whose files are gone
            index.update_all(["*"].iter(), None)?;
        } else if full.is_dir() {
            let spec = format!("{path}/*");
            index.add_all(
                [spec.as_str()].iter(),
                IndexAddOption::DEFAULT,
                Some(&mut skip_excluded as &mut IndexMatchedPath),
            )?;
        } else if self.exclude.covers(path) {
            debug!(path, "excluded, not staging");
        } else if full.exists() {
            index.add_path(Path::new(path))?;
        } else {
            unstage(index, path)?;
        }
        Ok(())
    }

    fn write_exclude(&self, repo: &Repository) -> Result<(), TargetError> {
        let info = repo.path().join("info");
        std::fs::create_dir_all(&info)?;
        let path = info.join("exclude");
        let mut content = std::fs::read_to_string(&path).unwrap_or_default();
        let existing: HashSet<String> = content.lines().map(str::to_string).collect();
        let wanted = METADATA_DIRS
            .iter()
            .filter(|d| **d != ".git")
            .map(|d| format!("{d}/"))
            .chain(self.ignored.iter().cloned());
        for line in wanted {
            if !existing.contains(&line) {
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&line);
                content.push('\n');
            }
        }
        std::fs::write(&path, content)?;
        Ok(())
    }
}

fn unstage(index: &mut Index, path: &str) -> Result<(), TargetError> {
    index.remove_path(Path::new(path))?;
    index.remove_dir(Path::new(path), 0)?;
    Ok(())
}

/// Split an upstream author into a git name and email.
///
/// `Name <mail>` is taken apart, a bare address is used as both, and
/// anything else gets a placeholder host.
pub fn split_author(author: &str) -> (String, String) {
    let author = author.trim();
    if author.is_empty() {
        return ("unknown".to_string(), "unknown@localhost".to_string());
    }
    if let (Some(lt), Some(gt)) = (author.find('<'), author.rfind('>')) {
        if lt < gt {
            let name = author[..lt].trim();
            let email = author[lt + 1..gt].trim();
            let name = if name.is_empty() { email } else { name };
            return (name.to_string(), email.to_string());
        }
    }
    if let Some((local, _)) = author.split_once('@') {
        return (local.to_string(), author.to_string());
    }
    let login: String = author.split_whitespace().collect::<Vec<_>>().join(".");
    (author.to_string(), format!("{login}@localhost"))
}

#[async_trait]
impl TargetAdapter for GitTarget {
    fn kind(&self) -> &str {
        "git"
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn initialize(&self) -> Result<(), TargetError> {
        let repo = if self.root.join(".git").exists() {
            self.open()?
        } else {
            std::fs::create_dir_all(&self.root)?;
            let repo = Repository::init(&self.root)
                .map_err(|e| TargetError::InitializationFailed(e.message().to_string()))?;
            info!("initialized git repository");
            repo
        };
        self.write_exclude(&repo)?;

        if let Some(url) = &self.remote {
            if repo.find_remote("origin").is_err() {
                repo.remote("origin", url)
                    .map_err(|e| TargetError::InitializationFailed(e.message().to_string()))?;
                info!(url = %url, "added origin remote");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, changeset), fields(revision = %changeset.revision()))]
    async fn replay(&self, changeset: &Changeset) -> Result<Vec<String>, TargetError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        let handled: HashSet<String> = changeset
            .entries()
            .iter()
            .map(|e| e.name().to_string())
            .collect();

        for step in plan_replay(changeset, |name| self.root.join(name).is_dir()) {
            debug!(?step, "replaying");
            match step {
                ReplayStep::AddDir(_) => {}
                ReplayStep::Rename { from, to } => {
                    self.check_inside(&from)?;
                    unstage(&mut index, &from)?;
                    self.stage(&mut index, &to)?;
                }
                ReplayStep::Remove(path) => {
                    self.check_inside(&path)?;
                    unstage(&mut index, &path)?;
                }
                ReplayStep::AddFile(path) => self.stage(&mut index, &path)?,
                ReplayStep::AddSubtree(dir) => {
                    for file in walk_subtree(&self.root, &dir, &handled, &self.exclude)? {
                        index.add_path(Path::new(&file))?;
                    }
                }
            }
        }
        index.write()?;
        Ok(Vec::new())
    }

    #[instrument(skip(self, message, entries), fields(patch = %message.patch_name))]
    async fn commit(
        &self,
        date: DateTime<Utc>,
        author: &str,
        message: &CommitMessage,
        entries: &[String],
    ) -> Result<(), TargetError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        for path in entries {
            self.stage(&mut index, path)?;
        }
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;

        let (name, email) = split_author(author);
        let signature = Signature::new(&name, &email, &Time::new(date.timestamp(), 0))?;
        let parent_commit = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &message.to_string(),
            &tree,
            &parents,
        )?;
        info!(sha = %oid, author = %name, "created commit");
        Ok(())
    }

    async fn tag(&self, name: &str) -> Result<(), TargetError> {
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?;
        let tag: String = name
            .trim()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        repo.tag_lightweight(&tag, head.as_object(), true)?;
        info!(tag = %tag, "tagged commit");
        Ok(())
    }
}
