//! Darcs source adapter.
//!
//! The working directory is a darcs repository, so it doubles as the
//! resume point: `darcs pull --dry-run` lists exactly the patches that have
//! not been applied yet, whatever the stored cursor says.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{run_command, SourceAdapter, HEAD, INITIAL};
use crate::changeset::Changeset;
use crate::config::SourceConfig;
use crate::errors::SourceError;
use crate::parser::collect_darcs_changes;

const CONFLICT_MARKER: &str = "We have conflicts in the following files:";

#[derive(Debug, Clone)]
pub struct DarcsSource {
    repository: String,
    root: PathBuf,
    refill: bool,
}

impl DarcsSource {
    pub fn new(config: &SourceConfig, root: PathBuf, refill: bool) -> Self {
        Self {
            repository: config.repository.clone(),
            root,
            refill,
        }
    }

    fn parse(&self, output: &str) -> Result<Vec<Changeset>, SourceError> {
        let xml = xml_body(output);
        Ok(collect_darcs_changes(xml.as_bytes(), self.refill)?)
    }

    async fn darcs(&self, args: &[&str]) -> Result<String, SourceError> {
        run_command("darcs", args, Some(&self.root)).await
    }
}

/// The XML document inside darcs output, which may be wrapped in chatter
/// such as `No remote changes to pull in!`.
fn xml_body(output: &str) -> &str {
    match (output.find('<'), output.rfind('>')) {
        (Some(start), Some(end)) if start < end => &output[start..=end],
        _ => "",
    }
}

/// Hash selector for a changeset, falling back to its patch name.
fn match_pattern(changeset: &Changeset) -> String {
    match changeset.upstream_id() {
        Some(hash) => format!("hash {hash}"),
        None => format!("exact \"{}\"", changeset.revision()),
    }
}

/// Files listed after the conflict marker, as `./path` entries.
fn parse_conflicts(output: &str) -> Vec<String> {
    let mut conflicts = Vec::new();
    let mut lines = output.lines();
    while let Some(line) = lines.next() {
        if line.starts_with(CONFLICT_MARKER) {
            if let Some(files) = lines.next() {
                // Space separated, and names may themselves contain spaces.
                conflicts.extend(
                    files
                        .split("./")
                        .skip(1)
                        .map(|f| format!("./{}", f.trim_end())),
                );
            }
        }
    }
    conflicts
}

#[async_trait]
impl SourceAdapter for DarcsSource {
    fn kind(&self) -> &str {
        "darcs"
    }

    #[instrument(skip(self), fields(repository = %self.repository))]
    async fn fetch_changesets_since(
        &self,
        cursor: Option<&str>,
    ) -> Result<Vec<Changeset>, SourceError> {
        let output = self
            .darcs(&[
                "pull",
                "--dry-run",
                "--xml-output",
                "--summary",
                &self.repository,
            ])
            .await?;
        let changesets = self.parse(&output)?;
        info!(count = changesets.len(), ?cursor, "fetched darcs patches");
        Ok(changesets)
    }

    #[instrument(skip(self), fields(repository = %self.repository))]
    async fn checkout_initial(&self, revision: &str) -> Result<Changeset, SourceError> {
        let selector = match revision {
            HEAD => None,
            INITIAL => {
                let output = run_command(
                    "darcs",
                    &[
                        "changes",
                        "--xml-output",
                        "--reverse",
                        "--repo",
                        &self.repository,
                    ],
                    None,
                )
                .await?;
                let first = self
                    .parse(&output)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| SourceError::RevisionNotFound(INITIAL.to_string()))?;
                Some(match_pattern(&first))
            }
            hash => Some(format!("hash {hash}")),
        };

        if self.root.join("_darcs").exists() {
            debug!(root = %self.root.display(), "darcs repository exists, not pulling");
        } else {
            tokio::fs::create_dir_all(&self.root).await?;
            self.darcs(&["initialize"]).await?;
            let mut args = vec!["pull", "--all", "--quiet"];
            if let Some(pattern) = selector.as_deref() {
                args.extend(["--to-match", pattern]);
            }
            args.push(&self.repository);
            self.darcs(&args).await?;
            info!(root = %self.root.display(), revision, "darcs checkout completed");
        }

        let last = self
            .darcs(&["changes", "--last", "1", "--xml-output", "--summary"])
            .await?;
        self.parse(&last)?
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::RevisionNotFound(revision.to_string()))
    }

    #[instrument(skip(self, changeset), fields(revision = %changeset.revision()))]
    async fn apply_changeset(&self, changeset: &Changeset) -> Result<Vec<String>, SourceError> {
        let pattern = match_pattern(changeset);
        let output = self
            .darcs(&[
                "pull",
                "--all",
                "--quiet",
                "--match",
                &pattern,
                &self.repository,
            ])
            .await?;
        let conflicts = parse_conflicts(&output);
        if !conflicts.is_empty() {
            warn!(files = %conflicts.join(" "), "conflict after darcs pull");
        }
        Ok(conflicts)
    }

    /// Upstream wins: revert the conflicted files. The working directory
    /// carries no local edits of its own.
    async fn resolve_conflicts(
        &self,
        changeset: &Changeset,
        conflicts: &[String],
    ) -> Result<bool, SourceError> {
        info!(
            revision = changeset.revision(),
            files = %conflicts.join(" "),
            "reverting conflicted files"
        );
        let mut args = vec!["revert", "--all"];
        args.extend(conflicts.iter().map(String::as_str));
        self.darcs(&args).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_conflicts() {
        let output = "Pulling...\nWe have conflicts in the following files:\n./a.txt ./dir/b c.txt\nFinished pulling.\n";
        assert_eq!(parse_conflicts(output), vec!["./a.txt", "./dir/b c.txt"]);
        assert!(parse_conflicts("Finished pulling.\n").is_empty());
    }

    #[test]
    fn test_match_pattern_prefers_hash() {
        let cs = Changeset::new("Fix it", Utc::now(), "me", "", vec![], false);
        assert_eq!(match_pattern(&cs), "exact \"Fix it\"");
        let cs = cs.with_upstream_id("20040101-abc.gz");
        assert_eq!(match_pattern(&cs), "hash 20040101-abc.gz");
    }

    #[test]
    fn test_no_remote_changes_is_empty() {
        let source = DarcsSource {
            repository: "/srv/darcs".into(),
            root: PathBuf::from("/tmp/wd"),
            refill: true,
        };
        assert!(source.parse("No remote changes to pull in!\n").unwrap().is_empty());
    }
}
