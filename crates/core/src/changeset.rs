//! Canonical changeset model shared by every backend.
//!
//! A [`Changeset`] is one unit of upstream history: an opaque revision
//! token, a timestamp, an author, a (normalized) log message, and the
//! path-level [`Entry`] list. Parsers build changesets; the engine only
//! ever derives new values from them ([`Changeset::filtered`],
//! [`Changeset::with_status`]) and never edits them in place.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Column at which [`refill`] wraps log messages.
pub const REFILL_WIDTH: usize = 70;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryAction {
    Added,
    Deleted,
    Updated,
    Renamed,
}

impl fmt::Display for EntryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Deleted => write!(f, "deleted"),
            Self::Updated => write!(f, "updated"),
            Self::Renamed => write!(f, "renamed"),
        }
    }
}

/// Outcome annotated by the engine after replay. Parsers never set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Applied,
    Conflict,
}

/// One path-level change inside a changeset.
///
/// Only [`EntryAction::Renamed`] entries carry an `old_name`; the
/// constructors and mutators keep it that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_name: Option<String>,
    action: EntryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<EntryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    copied_from: Option<String>,
}

impl Entry {
    fn with_action(name: impl Into<String>, action: EntryAction) -> Self {
        Self {
            name: name.into(),
            old_name: None,
            action,
            status: None,
            new_revision: None,
            copied_from: None,
        }
    }

    pub fn added(name: impl Into<String>) -> Self {
        Self::with_action(name, EntryAction::Added)
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self::with_action(name, EntryAction::Deleted)
    }

    pub fn updated(name: impl Into<String>) -> Self {
        Self::with_action(name, EntryAction::Updated)
    }

    pub fn renamed(name: impl Into<String>, old_name: impl Into<String>) -> Self {
        let mut entry = Self::with_action(name, EntryAction::Renamed);
        entry.old_name = Some(old_name.into());
        entry
    }

    /// Attach the per-file revision this entry moves to.
    pub fn at_revision(mut self, revision: impl Into<String>) -> Self {
        self.new_revision = Some(revision.into());
        self
    }

    /// Record the in-module source of a copy. Informational only.
    pub fn with_copy_source(mut self, source: impl Into<String>) -> Self {
        self.copied_from = Some(source.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn old_name(&self) -> Option<&str> {
        self.old_name.as_deref()
    }

    pub fn action(&self) -> EntryAction {
        self.action
    }

    pub fn status(&self) -> Option<EntryStatus> {
        self.status
    }

    pub fn new_revision(&self) -> Option<&str> {
        self.new_revision.as_deref()
    }

    pub fn copied_from(&self) -> Option<&str> {
        self.copied_from.as_deref()
    }

    /// Turn this entry into a rename of `old_name`.
    pub(crate) fn mark_renamed(&mut self, old_name: impl Into<String>) {
        self.action = EntryAction::Renamed;
        self.old_name = Some(old_name.into());
        self.copied_from = None;
    }

    /// Turn this entry into a plain addition, dropping any rename source.
    pub(crate) fn mark_added(&mut self) {
        self.action = EntryAction::Added;
        self.old_name = None;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.action, self.old_name.as_deref()) {
            (EntryAction::Renamed, Some(old)) => write!(f, "{} (rename from {})", self.name, old),
            (EntryAction::Deleted, _) => write!(f, "{} (deleted)", self.name),
            (action, _) => match self.new_revision.as_deref() {
                Some(rev) => write!(f, "{} ({} at {})", self.name, action, rev),
                None => write!(f, "{} ({})", self.name, action),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Changeset
// ---------------------------------------------------------------------------

/// One atomic unit of upstream history, normalized across backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    revision: String,
    date: DateTime<Utc>,
    author: String,
    log: String,
    entries: Vec<Entry>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upstream_id: Option<String>,
}

impl Changeset {
    /// Build a changeset. Entries are stably sorted by name; the log is
    /// passed through [`refill`] unless `refill_log` is false.
    pub fn new(
        revision: impl Into<String>,
        date: DateTime<Utc>,
        author: impl Into<String>,
        log: &str,
        mut entries: Vec<Entry>,
        refill_log: bool,
    ) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            revision: revision.into(),
            date,
            author: author.into(),
            log: if refill_log {
                refill(log)
            } else {
                log.to_string()
            },
            entries,
            tags: BTreeSet::new(),
            upstream_id: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Backend-native identifier, when it differs from the revision token
    /// (e.g. a darcs patch hash).
    pub fn with_upstream_id(mut self, id: impl Into<String>) -> Self {
        self.upstream_id = Some(id.into());
        self
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn upstream_id(&self) -> Option<&str> {
        self.upstream_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entries_with(&self, action: EntryAction) -> Vec<&Entry> {
        self.entries.iter().filter(|e| e.action == action).collect()
    }

    pub fn added_entries(&self) -> Vec<&Entry> {
        self.entries_with(EntryAction::Added)
    }

    pub fn removed_entries(&self) -> Vec<&Entry> {
        self.entries_with(EntryAction::Deleted)
    }

    pub fn renamed_entries(&self) -> Vec<&Entry> {
        self.entries_with(EntryAction::Renamed)
    }

    pub fn modified_entries(&self) -> Vec<&Entry> {
        self.entries_with(EntryAction::Updated)
    }

    /// A copy of this changeset holding only the entries `keep` accepts.
    pub fn filtered<F>(&self, keep: F) -> Changeset
    where
        F: Fn(&Entry) -> bool,
    {
        Changeset {
            entries: self.entries.iter().filter(|e| keep(e)).cloned().collect(),
            ..self.clone()
        }
    }

    /// A copy annotated with replay outcome: entries named in `conflicts`
    /// are marked [`EntryStatus::Conflict`], the rest [`EntryStatus::Applied`].
    pub fn with_status(&self, conflicts: &[String]) -> Changeset {
        let conflicting: BTreeSet<&str> = conflicts
            .iter()
            .map(|c| c.trim_start_matches("./"))
            .collect();
        let mut annotated = self.clone();
        for entry in &mut annotated.entries {
            entry.status = Some(if conflicting.contains(entry.name.as_str()) {
                EntryStatus::Conflict
            } else {
                EntryStatus::Applied
            });
        }
        annotated
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Revision: {}", self.revision)?;
        writeln!(f, "Date: {}", self.date)?;
        writeln!(f, "Author: {}", self.author)?;
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            writeln!(f, "Tags: {}", tags.join(","))?;
        }
        let groups = [
            ("Modified", self.modified_entries()),
            ("Removed", self.removed_entries()),
            ("Renamed", self.renamed_entries()),
            ("Added", self.added_entries()),
        ];
        for (label, entries) in groups {
            if !entries.is_empty() {
                let names: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
                writeln!(f, "{}: {}", label, names.join(","))?;
            }
        }
        write!(f, "Log: {}", self.log)
    }
}

// ---------------------------------------------------------------------------
// Log normalization
// ---------------------------------------------------------------------------

/// Normalize a changelog message.
///
/// Runs of whitespace collapse to single spaces and paragraphs are
/// re-wrapped at [`REFILL_WIDTH`]. Lines starting with `-` or `*` begin
/// bullet items; a message with several items is rendered as a `- `
/// bulleted list separated by blank lines.
pub fn refill(msg: &str) -> String {
    // Pattern is a literal and always compiles.
    let Ok(itemize) = Regex::new(r"(?m)^[ ]*[-*] ") else {
        return msg.trim().to_string();
    };

    let mut items: Vec<&str> = itemize.split(msg.trim()).collect();
    let mut bulleted = false;
    if items.len() > 1 {
        if items[0].is_empty() {
            items.remove(0);
        }
        bulleted = items.len() > 1;
    }

    let (initial, subsequent) = if bulleted { ("- ", "  ") } else { ("", "") };

    items
        .iter()
        .map(|item| item.split_whitespace().collect::<Vec<_>>())
        .filter(|words| !words.is_empty())
        .map(|words| wrap(&words, REFILL_WIDTH, initial, subsequent))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Greedy word wrap. Words longer than a whole line are split.
fn wrap(words: &[&str], width: usize, initial: &str, subsequent: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::from(initial);
    let mut line_len = initial.chars().count();
    let mut indent_len = line_len;

    for word in words {
        let mut word: Vec<char> = word.chars().collect();
        loop {
            let sep = usize::from(line_len > indent_len);
            if line_len + sep + word.len() <= width {
                if sep == 1 {
                    line.push(' ');
                }
                line.extend(word.iter());
                line_len += sep + word.len();
                break;
            }
            if line_len > indent_len {
                lines.push(std::mem::replace(&mut line, subsequent.to_string()));
                line_len = subsequent.chars().count();
                indent_len = line_len;
                continue;
            }
            // Empty line and the word still does not fit: break it.
            let room = width.saturating_sub(line_len).max(1);
            let rest = word.split_off(room.min(word.len()));
            line.extend(word.iter());
            lines.push(std::mem::replace(&mut line, subsequent.to_string()));
            line_len = subsequent.chars().count();
            indent_len = line_len;
            if rest.is_empty() {
                break;
            }
            word = rest;
        }
    }
    if line_len > indent_len {
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2004, 11, 12, 15, 5, 37).unwrap()
    }

    #[test]
    fn test_entries_sorted_by_name() {
        let cs = Changeset::new(
            "3",
            date(),
            "lele",
            "msg",
            vec![Entry::added("b"), Entry::deleted("a"), Entry::updated("a/x")],
            true,
        );
        let names: Vec<&str> = cs.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "a/x", "b"]);
    }

    #[test]
    fn test_sort_is_stable_for_duplicate_names() {
        let cs = Changeset::new(
            "x",
            date(),
            "bob",
            "fix",
            vec![
                Entry::added("a.txt").at_revision("1.1"),
                Entry::added("b.txt").at_revision("1.1"),
                Entry::updated("a.txt").at_revision("1.2"),
            ],
            true,
        );
        let revs: Vec<_> = cs.entries().iter().map(|e| e.new_revision()).collect();
        assert_eq!(revs, vec![Some("1.1"), Some("1.2"), Some("1.1")]);
    }

    #[test]
    fn test_only_renames_carry_old_name() {
        let mut e = Entry::added("new").with_copy_source("old");
        assert_eq!(e.old_name(), None);
        e.mark_renamed("old");
        assert_eq!(e.action(), EntryAction::Renamed);
        assert_eq!(e.old_name(), Some("old"));
        assert_eq!(e.copied_from(), None);
        e.mark_added();
        assert_eq!(e.old_name(), None);
    }

    #[test]
    fn test_filtered_returns_new_value() {
        let cs = Changeset::new(
            "1",
            date(),
            "a",
            "log",
            vec![Entry::added("keep.c"), Entry::added("drop.o")],
            true,
        );
        let filtered = cs.filtered(|e| !e.name().ends_with(".o"));
        assert_eq!(filtered.entries().len(), 1);
        assert_eq!(filtered.revision(), "1");
        assert_eq!(filtered.log(), "log");
        assert_eq!(cs.entries().len(), 2);

        let empty = cs.filtered(|_| false);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_with_status_marks_conflicts() {
        let cs = Changeset::new(
            "1",
            date(),
            "a",
            "",
            vec![Entry::updated("a"), Entry::updated("b")],
            true,
        );
        let annotated = cs.with_status(&["./b".to_string()]);
        assert_eq!(annotated.entries()[0].status(), Some(EntryStatus::Applied));
        assert_eq!(annotated.entries()[1].status(), Some(EntryStatus::Conflict));
        assert_eq!(cs.entries()[0].status(), None);
    }

    #[test]
    fn test_display_lists_entries() {
        let cs = Changeset::new(
            "3",
            date(),
            "lele",
            "rename dir",
            vec![Entry::renamed("new", "dir"), Entry::deleted("gone")],
            true,
        );
        let text = cs.to_string();
        assert!(text.starts_with("Revision: 3\n"));
        assert!(text.contains("Removed: gone (deleted)"));
        assert!(text.contains("Renamed: new (rename from dir)"));
        assert!(text.ends_with("Log: rename dir"));
    }

    #[test]
    fn test_serde_round_trip_preserves_entries() {
        let cs = Changeset::new("5", date(), "x", "m", vec![Entry::renamed("b", "a")], true)
            .with_tags(["v1"])
            .with_upstream_id("hash");
        let json = serde_json::to_string(&cs).unwrap();
        let back: Changeset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cs);
    }

    #[test]
    fn test_refill_collapses_whitespace() {
        assert_eq!(refill("  fix   the\n  parser  \n"), "fix the parser");
    }

    #[test]
    fn test_refill_wraps_at_width() {
        let words = vec!["word"; 30].join(" ");
        let out = refill(&words);
        for line in out.lines() {
            assert!(line.len() <= REFILL_WIDTH, "line too long: {line:?}");
        }
        assert_eq!(out.split_whitespace().count(), 30);
    }

    #[test]
    fn test_refill_bullets() {
        let msg = "Changes:\n- first item\n  continues here\n* second item";
        assert_eq!(
            refill(msg),
            "- Changes:\n\n- first item continues here\n\n- second item"
        );
    }

    #[test]
    fn test_refill_single_leading_bullet_is_plain() {
        assert_eq!(refill("- only one"), "only one");
    }

    #[test]
    fn test_refill_breaks_overlong_words() {
        let long = "x".repeat(150);
        let out = refill(&long);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), REFILL_WIDTH);
    }

    #[test]
    fn test_refill_empty() {
        assert_eq!(refill(""), "");
        assert_eq!(refill("   \n "), "");
    }
}
