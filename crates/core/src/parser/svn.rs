//! Incremental parser for `svn log --xml --verbose` output.
//!
//! Subversion has no atomic rename: a move shows up as a delete of the
//! old path plus an add carrying `copyfrom-path`. A replace (`R`) is an
//! add over an existing path. Once a `<logentry>` closes, its paths are
//! post-processed so that such pairs become a single `Renamed` entry.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::xml::{XmlEvent, XmlTokenizer};
use super::IncrementalParser;
use crate::changeset::{Changeset, Entry, EntryAction};
use crate::errors::ParseError;

/// Action letter reported for a changed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathAction {
    Added,
    Deleted,
    Modified,
    Replaced,
}

impl PathAction {
    fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "A" => Some(Self::Added),
            "D" => Some(Self::Deleted),
            "M" => Some(Self::Modified),
            "R" => Some(Self::Replaced),
            _ => None,
        }
    }
}

/// A changed path, already relative to the module.
#[derive(Debug)]
struct RawPath {
    name: String,
    action: PathAction,
    /// Copy source, when it lies inside the module.
    copy_from: Option<String>,
}

#[derive(Debug, Default)]
struct LogEntryDraft {
    revision: String,
    author: String,
    date: Option<String>,
    msg: String,
    paths: Vec<RawPath>,
    /// Targets of copies, wherever their source lies.
    copies: Vec<String>,
}

/// Attributes of the `<path>` element being read.
#[derive(Debug)]
struct PathAttrs {
    action: String,
    copy_from: Option<String>,
}

/// Streaming `svn log --xml` parser.
///
/// Paths are made relative to `module` (a repository-absolute prefix such
/// as `/trunk`). Paths outside the module are dropped with a warning.
pub struct SvnLogParser {
    xml: XmlTokenizer,
    module: String,
    refill: bool,
    current: Option<LogEntryDraft>,
    text: Option<String>,
    path: Option<PathAttrs>,
}

impl SvnLogParser {
    pub fn new(module: &str, refill: bool) -> Self {
        let trimmed = module.trim_end_matches('/');
        let module = if trimmed.is_empty() || trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self {
            xml: XmlTokenizer::new(),
            module,
            refill,
            current: None,
            text: None,
            path: None,
        }
    }

    /// Map a repository-absolute path to a module-relative one.
    ///
    /// Returns `None` for paths outside the module and for the module root.
    fn relative(&self, path: &str) -> Option<String> {
        let rest = match path.strip_prefix(self.module.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => {
                warn!(path, module = %self.module, "ignoring path outside the tracked module");
                return None;
            }
        };
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    fn handle(&mut self, event: XmlEvent) -> Result<Option<Changeset>, ParseError> {
        match event {
            XmlEvent::Start { ref name, empty, .. } => {
                match name.as_str() {
                    "logentry" => {
                        let revision = event.attr("revision").ok_or_else(|| {
                            ParseError::MissingAttribute {
                                element: "logentry".into(),
                                attribute: "revision".into(),
                            }
                        })?;
                        self.current = Some(LogEntryDraft {
                            revision: revision.to_string(),
                            ..Default::default()
                        });
                    }
                    "author" | "date" | "msg" => self.text = Some(String::new()),
                    "path" => {
                        let action = event.attr("action").ok_or_else(|| {
                            ParseError::MissingAttribute {
                                element: "path".into(),
                                attribute: "action".into(),
                            }
                        })?;
                        self.path = Some(PathAttrs {
                            action: action.to_string(),
                            copy_from: event.attr("copyfrom-path").map(str::to_string),
                        });
                        self.text = Some(String::new());
                    }
                    _ => {}
                }
                if empty {
                    return self.handle(XmlEvent::End { name: name.clone() });
                }
            }
            XmlEvent::Text(text) => {
                if let Some(buf) = self.text.as_mut() {
                    buf.push_str(&text);
                }
            }
            XmlEvent::End { name } => match name.as_str() {
                "logentry" => {
                    if let Some(draft) = self.current.take() {
                        return self.complete(draft).map(Some);
                    }
                }
                "author" | "date" | "msg" => {
                    let text = self.text.take().unwrap_or_default();
                    if let Some(draft) = self.current.as_mut() {
                        match name.as_str() {
                            "author" => draft.author = text,
                            "date" => draft.date = Some(text),
                            _ => draft.msg = text,
                        }
                    }
                }
                "path" => {
                    let text = self.text.take().unwrap_or_default();
                    if let Some(attrs) = self.path.take() {
                        self.add_path(text.trim(), attrs);
                    }
                }
                _ => {}
            },
        }
        Ok(None)
    }

    fn add_path(&mut self, path: &str, attrs: PathAttrs) {
        let Some(name) = self.relative(path) else {
            return;
        };
        let Some(mut action) = PathAction::from_letter(&attrs.action) else {
            warn!(path, action = %attrs.action, "ignoring path with unknown svn action");
            return;
        };

        let mut copy_from = None;
        if let Some(source) = attrs.copy_from.as_deref() {
            match self.relative(source) {
                Some(old) => copy_from = Some(old),
                // Copied in from outside the module: nothing to rename from.
                None => action = PathAction::Added,
            }
        }

        if let Some(draft) = self.current.as_mut() {
            if attrs.copy_from.is_some() {
                draft.copies.push(name.clone());
            }
            draft.paths.push(RawPath {
                name,
                action,
                copy_from,
            });
        }
    }

    fn complete(&self, mut draft: LogEntryDraft) -> Result<Changeset, ParseError> {
        draft.paths.sort_by(|a, b| a.name.cmp(&b.name));
        let entries = disambiguate(&draft.paths, &draft.copies);

        let date = match draft.date.as_deref() {
            Some(raw) => parse_svn_date(raw)?,
            None => {
                warn!(revision = %draft.revision, "log entry without a date");
                DateTime::<Utc>::default()
            }
        };

        debug!(
            revision = %draft.revision,
            entries = entries.len(),
            "parsed svn log entry"
        );
        Ok(Changeset::new(
            draft.revision,
            date,
            draft.author,
            &draft.msg,
            entries,
            self.refill,
        ))
    }
}

impl IncrementalParser for SvnLogParser {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Changeset>, ParseError> {
        self.xml.feed(chunk);
        let mut done = Vec::new();
        while let Some(event) = self.xml.next_event()? {
            if let Some(cs) = self.handle(event)? {
                done.push(cs);
            }
        }
        Ok(done)
    }

    fn finish(&mut self) -> Result<Vec<Changeset>, ParseError> {
        self.xml.finish()?;
        if let Some(draft) = &self.current {
            return Err(ParseError::Truncated(format!(
                "logentry {} was never closed",
                draft.revision
            )));
        }
        Ok(Vec::new())
    }
}

/// Collapse delete+copy pairs into renames and normalize replaces.
///
/// `paths` must already be sorted by name.
fn disambiguate(paths: &[RawPath], copies: &[String]) -> Vec<Entry> {
    // old path -> index of the add that copied it
    let mut copied_from: HashMap<&str, usize> = HashMap::new();
    for (i, p) in paths.iter().enumerate() {
        if p.action == PathAction::Added {
            if let Some(old) = p.copy_from.as_deref() {
                copied_from.insert(old, i);
            }
        }
    }

    let parent_was_copied =
        |name: &str| copies.iter().any(|c| name.starts_with(&format!("{c}/")));

    let mut renamed_from: HashMap<usize, &str> = HashMap::new();
    let mut dropped: HashSet<usize> = HashSet::new();
    let mut promoted: HashSet<usize> = HashSet::new();

    for (i, p) in paths.iter().enumerate() {
        match p.action {
            PathAction::Deleted if copied_from.contains_key(p.name.as_str()) => {
                renamed_from.insert(copied_from[p.name.as_str()], p.name.as_str());
                dropped.insert(i);
            }
            PathAction::Replaced => {
                if let Some(&j) = copied_from.get(p.name.as_str()) {
                    renamed_from.insert(j, p.name.as_str());
                }
            }
            _ if parent_was_copied(&p.name) => {
                // The copy already brought this path in.
                if p.action == PathAction::Deleted {
                    dropped.insert(i);
                } else {
                    promoted.insert(i);
                }
            }
            _ => {}
        }
    }

    paths
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(i, p)| {
            if let Some(old) = renamed_from.get(&i) {
                return Entry::renamed(p.name.as_str(), *old);
            }
            let entry = match p.action {
                PathAction::Deleted => Entry::deleted(p.name.as_str()),
                PathAction::Modified if !promoted.contains(&i) => Entry::updated(p.name.as_str()),
                _ => Entry::added(p.name.as_str()),
            };
            match p.copy_from.as_deref() {
                Some(source) if entry.action() == EntryAction::Added => {
                    entry.with_copy_source(source)
                }
                _ => entry,
            }
        })
        .collect()
}

/// Parse `2004-11-12T15:05:37.134366Z`.
fn parse_svn_date(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ParseError::InvalidDate(raw.to_string()))
}

/// Replace control characters that are illegal in XML 1.0 with `?`.
pub fn filter_badchars(chunk: &mut [u8]) {
    for b in chunk.iter_mut() {
        if (*b < 0x20 && !matches!(*b, b'\t' | b'\n' | b'\r')) || *b == 0x7f {
            *b = b'?';
        }
    }
}
