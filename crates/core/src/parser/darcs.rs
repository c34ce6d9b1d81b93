//! Incremental parser for `darcs changes --xml-output --summary`.
//!
//! Every `<patch>` becomes one changeset. The revision is the patch name,
//! the log is the name followed by the comment and the patch hash is kept
//! as the upstream id. Changesets come out in document order, which for
//! `darcs changes` is newest first; see [`collect_darcs_changes`].
//!
//! [`collect_darcs_changes`]: super::collect_darcs_changes
//!
//! Tags are patches whose name starts with `TAG `. The tag is attached to
//! that patch's own changeset, on the assumption that a tag depends on
//! every patch fetched before it. That holds for tags recorded in the
//! upstream repository but not for tags pulled in out of band; the
//! approximation is kept as is.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tracing::debug;

use super::xml::{XmlEvent, XmlTokenizer};
use super::IncrementalParser;
use crate::changeset::{refill, Changeset, Entry};
use crate::errors::ParseError;

/// Prefix marking a tag patch.
pub const TAG_PREFIX: &str = "TAG ";

/// Summary primitive, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Primitive {
    AddFile(String),
    AddDir(String),
    Modify(String),
    Remove(String),
    Move { from: String, to: String },
}

#[derive(Debug, Default)]
struct PatchDraft {
    author: String,
    date: Option<DateTime<Utc>>,
    hash: Option<String>,
    name: String,
    comment: String,
    summary: Vec<Primitive>,
}

/// Streaming `darcs changes --xml-output` parser.
pub struct DarcsChangesParser {
    xml: XmlTokenizer,
    refill: bool,
    current: Option<PatchDraft>,
    /// Element whose text is being collected, with the text so far.
    field: Option<(String, String)>,
}

impl DarcsChangesParser {
    pub fn new(refill: bool) -> Self {
        Self {
            xml: XmlTokenizer::new(),
            refill,
            current: None,
            field: None,
        }
    }

    fn handle(&mut self, event: XmlEvent) -> Result<Option<Changeset>, ParseError> {
        match event {
            XmlEvent::Start { ref name, empty, .. } => {
                match name.as_str() {
                    "patch" => {
                        let author = event.attr("author").unwrap_or_default().to_string();
                        let raw_date = event.attr("date").ok_or_else(|| {
                            ParseError::MissingAttribute {
                                element: "patch".into(),
                                attribute: "date".into(),
                            }
                        })?;
                        self.current = Some(PatchDraft {
                            author,
                            date: Some(parse_darcs_date(raw_date)?),
                            hash: event.attr("hash").map(str::to_string),
                            ..Default::default()
                        });
                    }
                    "name" | "comment" | "add_file" | "add_directory" | "modify_file"
                    | "remove_file" | "remove_directory" => {
                        self.field = Some((name.clone(), String::new()));
                    }
                    "move" => {
                        let from = event.attr("from");
                        let to = event.attr("to");
                        match (from, to, self.current.as_mut()) {
                            (Some(from), Some(to), Some(patch)) => {
                                patch.summary.push(Primitive::Move {
                                    from: from.to_string(),
                                    to: to.to_string(),
                                });
                            }
                            (None, _, _) | (_, None, _) => {
                                return Err(ParseError::MissingAttribute {
                                    element: "move".into(),
                                    attribute: if from.is_none() { "from" } else { "to" }.into(),
                                });
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
                if empty {
                    return self.handle(XmlEvent::End { name: name.clone() });
                }
            }
            XmlEvent::Text(text) => {
                if let Some((_, buf)) = self.field.as_mut() {
                    buf.push_str(&text);
                }
            }
            XmlEvent::End { name } => {
                if name == "patch" {
                    if let Some(draft) = self.current.take() {
                        return Ok(Some(self.complete(draft)));
                    }
                    return Ok(None);
                }
                if !matches!(&self.field, Some((field, _)) if *field == name) {
                    return Ok(None);
                }
                let Some((field, text)) = self.field.take() else {
                    return Ok(None);
                };
                let Some(patch) = self.current.as_mut() else {
                    return Ok(None);
                };
                let path = text.trim().to_string();
                match field.as_str() {
                    "name" => patch.name = text.trim().to_string(),
                    "comment" => patch.comment = text,
                    "add_file" => patch.summary.push(Primitive::AddFile(path)),
                    "add_directory" => patch.summary.push(Primitive::AddDir(path)),
                    "modify_file" => patch.summary.push(Primitive::Modify(path)),
                    _ => patch.summary.push(Primitive::Remove(path)),
                }
            }
        }
        Ok(None)
    }

    fn complete(&self, draft: PatchDraft) -> Changeset {
        let entries = normalize(&draft.summary);
        debug!(patch = %draft.name, entries = entries.len(), "parsed darcs patch");

        let tag = draft
            .name
            .strip_prefix(TAG_PREFIX)
            .map(|t| t.trim().to_string());
        // The patch name stays the first log line; only the comment is refilled.
        let comment = if self.refill {
            refill(&draft.comment)
        } else {
            draft.comment.trim_end().to_string()
        };
        let log = if comment.trim().is_empty() {
            draft.name.clone()
        } else {
            format!("{}\n{}", draft.name, comment)
        };
        let mut cs = Changeset::new(
            draft.name,
            draft.date.unwrap_or_default(),
            draft.author,
            &log,
            entries,
            false,
        );
        if let Some(tag) = tag {
            cs = cs.with_tags([tag]);
        }
        if let Some(hash) = draft.hash {
            cs = cs.with_upstream_id(hash);
        }
        cs
    }
}

impl IncrementalParser for DarcsChangesParser {
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
                "patch '{}' was never closed",
                draft.name
            )));
        }
        Ok(Vec::new())
    }
}

/// Turn the summary primitives of one patch into entries.
///
/// `darcs changes --xml-output` lists moves before everything else,
/// regardless of the order in which they were recorded, so:
/// - adding file A and moving A to B is an addition of B;
/// - moving A to B and removing B is a removal of A.
///
/// A directory that is moved away and re-added under its old name stays a
/// rename plus an addition.
fn normalize(summary: &[Primitive]) -> Vec<Entry> {
    let mut entries: Vec<Option<Entry>> = Vec::with_capacity(summary.len());

    for prim in summary {
        match prim {
            Primitive::AddFile(p) | Primitive::AddDir(p) => {
                entries.push(Some(Entry::added(p.as_str())))
            }
            Primitive::Modify(p) => entries.push(Some(Entry::updated(p.as_str()))),
            Primitive::Remove(p) => entries.push(Some(Entry::deleted(p.as_str()))),
            Primitive::Move { from, to } => {
                entries.push(Some(Entry::renamed(to.as_str(), from.as_str())))
            }
        }
    }

    for (i, prim) in summary.iter().enumerate() {
        let Primitive::Move { from, to } = prim else {
            continue;
        };

        let added_file = summary
            .iter()
            .position(|p| matches!(p, Primitive::AddFile(n) if n == from));
        if let Some(j) = added_file {
            if entries[j].is_some() {
                entries[j] = None;
                entries[i] = Some(Entry::added(to.as_str()));
                continue;
            }
        }

        let removed = summary
            .iter()
            .position(|p| matches!(p, Primitive::Remove(n) if n == to));
        if let Some(j) = removed {
            if entries[j].is_some() {
                entries[j] = None;
                entries[i] = Some(Entry::deleted(from.as_str()));
            }
        }
    }

    entries.into_iter().flatten().collect()
}

/// Parse `20040716123737`, or the old `Tue Oct 14 09:42:00 EDT 2003` form.
///
/// The old form is read as UTC; its zone abbreviation is discarded.
fn parse_darcs_date(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let raw = raw.trim();
    if raw.len() == 14 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
            .map(|d| Utc.from_utc_datetime(&d))
            .map_err(|_| ParseError::InvalidDate(raw.to_string()));
    }

    let parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.len() == 6 {
        let (date, time, year) = (format!("{} {}", parts[1], parts[2]), parts[3], parts[5]);
        let day = NaiveDate::parse_from_str(&format!("{date} {year}"), "%b %d %Y");
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S");
        if let (Ok(day), Ok(time)) = (day, time) {
            return Ok(Utc.from_utc_datetime(&day.and_time(time)));
        }
    }
    Err(ParseError::InvalidDate(raw.to_string()))
}
