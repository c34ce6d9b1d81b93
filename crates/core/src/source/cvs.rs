//! CVS source adapter.
//!
//! Revisions are the synthetic `DATE; AUTHOR, "MESSAGE"` tokens built by the
//! CVS log parser, so the stored cursor's date prefix bounds the next log
//! query.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::{conflict_lines, run_command, SourceAdapter, HEAD, INITIAL};
use crate::changeset::{Changeset, Entry, EntryAction};
use crate::config::SourceConfig;
use crate::errors::SourceError;
use crate::parser::cvs::{parse_cvs_log, revision_timestamp, synthetic_revision};

#[derive(Debug, Clone)]
pub struct CvsSource {
    repository: String,
    module: String,
    root: PathBuf,
    refill: bool,
    threshold: Duration,
}

impl CvsSource {
    pub fn new(config: &SourceConfig, root: PathBuf, refill: bool, threshold: Duration) -> Self {
        Self {
            repository: config.repository.clone(),
            module: config.module.clone(),
            root,
            refill,
            threshold,
        }
    }

    async fn cvs(&self, args: &[&str]) -> Result<String, SourceError> {
        run_command("cvs", args, Some(&self.root)).await
    }
}

fn cvs_date(date: DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Last entry per file wins: a file touched twice in one coalesced
/// changeset only needs its newest revision.
fn latest_per_file(changeset: &Changeset) -> Vec<&Entry> {
    let mut latest: BTreeMap<&str, &Entry> = BTreeMap::new();
    for entry in changeset.entries() {
        latest.insert(entry.name(), entry);
    }
    latest.into_values().collect()
}

/// Keep only changesets sorting after `cursor`. The date bound given to
/// `cvs log` is inclusive, so the cursor itself comes back.
fn after_cursor(changesets: Vec<Changeset>, cursor: Option<&str>) -> Vec<Changeset> {
    match cursor {
        None => changesets,
        Some(cursor) => changesets
            .into_iter()
            .filter(|cs| cs.revision() > cursor)
            .collect(),
    }
}

#[async_trait]
impl SourceAdapter for CvsSource {
    fn kind(&self) -> &str {
        "cvs"
    }

    #[instrument(skip(self), fields(module = %self.module))]
    async fn fetch_changesets_since(
        &self,
        cursor: Option<&str>,
    ) -> Result<Vec<Changeset>, SourceError> {
        let bound = cursor
            .map(revision_timestamp)
            .transpose()?
            .map(|since| format!("{}<", cvs_date(since)));
        let mut args = vec!["-f", "-q", "log"];
        if let Some(bound) = bound.as_deref() {
            args.extend(["-d", bound]);
        }
        let output = self.cvs(&args).await?;
        let parsed = parse_cvs_log(output.as_bytes(), self.threshold, self.refill)?;
        let changesets = after_cursor(parsed, cursor);
        info!(count = changesets.len(), "fetched cvs changesets");
        Ok(changesets)
    }

    #[instrument(skip(self), fields(module = %self.module))]
    async fn checkout_initial(&self, revision: &str) -> Result<Changeset, SourceError> {
        if revision == INITIAL {
            return Err(SourceError::RevisionNotFound(format!(
                "{INITIAL} is not available for cvs; bootstrap from {HEAD} or a date"
            )));
        }
        let date = if revision == HEAD {
            Utc::now()
        } else {
            revision_timestamp(revision)?
        };

        if self.root.join("CVS").exists() {
            debug!(root = %self.root.display(), "cvs working copy exists, not checking out");
        } else {
            let parent = self
                .root
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let dirname = self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| SourceError::RevisionNotFound(self.root.display().to_string()))?;
            tokio::fs::create_dir_all(&parent).await?;

            let stamp = cvs_date(date);
            let mut args = vec![
                "-f",
                "-q",
                "-d",
                self.repository.as_str(),
                "checkout",
                "-d",
                dirname.as_str(),
            ];
            if revision != HEAD {
                args.extend(["-D", stamp.as_str()]);
            }
            args.push(&self.module);
            run_command("cvs", &args, Some(&parent)).await?;
            info!(root = %self.root.display(), revision, "cvs checkout completed");
        }

        let token = if revision.contains(';') {
            revision.to_string()
        } else {
            synthetic_revision(date, "vcsmirror", "checkout")
        };
        Ok(Changeset::new(token, date, "vcsmirror", "", Vec::new(), false))
    }

    #[instrument(skip(self, changeset), fields(revision = %changeset.revision()))]
    async fn apply_changeset(&self, changeset: &Changeset) -> Result<Vec<String>, SourceError> {
        let mut conflicts = Vec::new();
        for entry in latest_per_file(changeset) {
            if entry.action() == EntryAction::Deleted {
                match tokio::fs::remove_file(self.root.join(entry.name())).await {
                    Ok(()) => debug!(path = entry.name(), "removed dead file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
            let stamp;
            let mut args = vec!["-f", "-q", "update", "-d"];
            match entry.new_revision() {
                Some(rev) => args.extend(["-r", rev]),
                None => {
                    stamp = cvs_date(changeset.date());
                    args.extend(["-D", stamp.as_str()]);
                }
            }
            args.push(entry.name());
            let output = self.cvs(&args).await?;
            conflicts.extend(conflict_lines(&output));
        }
        for path in &conflicts {
            warn!(path, "conflict after cvs update");
        }
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cs(date: DateTime<Utc>, author: &str, entries: Vec<Entry>) -> Changeset {
        Changeset::new(
            synthetic_revision(date, author, "msg"),
            date,
            author,
            "msg",
            entries,
            false,
        )
    }

    #[test]
    fn test_after_cursor_drops_already_applied() {
        let t0 = Utc.with_ymd_and_hms(2005, 3, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2005, 3, 1, 11, 0, 0).unwrap();
        let applied = cs(t0, "ann", vec![]);
        let same_second = cs(t0, "bob", vec![]);
        let later = cs(t1, "ann", vec![]);
        let cursor = applied.revision().to_string();

        let kept = after_cursor(
            vec![applied, same_second.clone(), later.clone()],
            Some(&cursor),
        );
        assert_eq!(kept, vec![same_second, later]);
    }

    #[test]
    fn test_latest_per_file() {
        let t0 = Utc.with_ymd_and_hms(2005, 3, 1, 10, 0, 0).unwrap();
        let changeset = cs(
            t0,
            "bob",
            vec![
                Entry::added("a.txt").at_revision("1.1"),
                Entry::updated("a.txt").at_revision("1.2"),
                Entry::added("b.txt").at_revision("1.1"),
            ],
        );
        let picked: Vec<(&str, Option<&str>)> = latest_per_file(&changeset)
            .into_iter()
            .map(|e| (e.name(), e.new_revision()))
            .collect();
        assert_eq!(picked, vec![("a.txt", Some("1.2")), ("b.txt", Some("1.1"))]);
    }

    #[test]
    fn test_cvs_date_format() {
        let t = Utc.with_ymd_and_hms(2004, 6, 10, 2, 17, 20).unwrap();
        assert_eq!(cvs_date(t), "2004-06-10 02:17:20 UTC");
    }
}
