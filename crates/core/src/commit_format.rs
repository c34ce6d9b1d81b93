//! Commit message formatting for replayed changesets.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::changeset::Changeset;
use crate::config::ReplayOptions;

/// Used as `{firstlogline}` when the upstream log is empty.
pub const EMPTY_LOG_LINE: &str = "Empty log message";

/// Subject line plus body of a target commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub patch_name: String,
    pub changelog: String,
}

impl fmt::Display for CommitMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changelog.is_empty() {
            f.write_str(&self.patch_name)
        } else {
            write!(f, "{}\n\n{}", self.patch_name, self.changelog)
        }
    }
}

/// One commit covering several changesets.
#[derive(Debug, Clone)]
pub struct CombinedCommit {
    pub message: CommitMessage,
    pub author: String,
    pub date: DateTime<Utc>,
}

/// Renders commit messages from the `patch_name_format` template.
///
/// Placeholders: `{module}`, `{revision}`, `{author}`, `{date}`,
/// `{firstlogline}` and `{remaininglog}`.
#[derive(Debug, Clone)]
pub struct CommitFormatter {
    module: String,
    patch_name_format: String,
    remove_first_log_line: bool,
}

impl CommitFormatter {
    pub fn new(options: &ReplayOptions) -> Self {
        Self {
            module: options.module.clone(),
            patch_name_format: options.patch_name_format.clone(),
            remove_first_log_line: options.remove_first_log_line,
        }
    }

    /// Message for a single replayed changeset.
    pub fn format(&self, changeset: &Changeset) -> CommitMessage {
        let (first, remaining) = split_log(changeset.log());
        let patch_name = self
            .patch_name_format
            .replace("{module}", &self.module)
            .replace("{revision}", changeset.revision())
            .replace("{author}", changeset.author())
            .replace("{date}", &format_date(changeset.date()))
            .replace("{firstlogline}", first)
            .replace("{remaininglog}", remaining);
        let changelog = if self.remove_first_log_line {
            remaining.to_string()
        } else {
            changeset.log().to_string()
        };
        CommitMessage {
            patch_name,
            changelog,
        }
    }

    /// Fold several applied changesets into one commit.
    ///
    /// Returns `None` for an empty slice. Authors are listed once each in
    /// order of first appearance; the date is the latest one.
    pub fn format_combined(
        &self,
        changesets: &[Changeset],
        concatenate_logs: bool,
    ) -> Option<CombinedCommit> {
        let min = changesets.iter().map(Changeset::date).min()?;
        let max = changesets.iter().map(Changeset::date).max()?;

        let mut authors: Vec<&str> = Vec::new();
        let mut log: Vec<String> = Vec::new();
        for cs in changesets {
            if !authors.contains(&cs.author()) {
                authors.push(cs.author());
            }
            let heading = format!("changeset {} by {}", cs.revision(), cs.author());
            if concatenate_logs {
                let underline = "=".repeat(heading.chars().count());
                log.push(heading);
                log.push(underline);
                log.push(cs.log().to_string());
            } else {
                log.push(format!("* {heading}"));
            }
        }

        let patch_name = format!(
            "Merged {} changesets from {} to {}",
            changesets.len(),
            format_date(min),
            format_date(max)
        );
        Some(CombinedCommit {
            message: CommitMessage {
                patch_name,
                changelog: log.join("\n"),
            },
            author: authors.join(", "),
            date: max,
        })
    }

    /// Message for the initial full-tree import.
    pub fn format_bootstrap(&self, repository: &str, revision: &str) -> CommitMessage {
        CommitMessage {
            patch_name: format!("Tailorization of {}", self.module),
            changelog: format!(
                "Import of the upstream sources from\n\n Repository: {}\n Module: {}\n Revision: {}",
                repository, self.module, revision
            ),
        }
    }
}

fn split_log(log: &str) -> (&str, &str) {
    if log.is_empty() {
        return (EMPTY_LOG_LINE, "");
    }
    match log.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (log, ""),
    }
}

fn format_date(date: DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
