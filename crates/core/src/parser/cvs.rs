//! Parser for `cvs rlog` / `cvs log` output.
//!
//! CVS versions files independently and has no repository-wide commit.
//! Per-file revisions are grouped into synthetic changesets keyed by
//! `(timestamp, author, message)`, then adjacent groups by the same author
//! with the same message are coalesced when they are close in time. Each
//! synthetic changeset gets a revision token that starts with its
//! timestamp, so tokens sort by time and can serve as a resume cursor.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

use crate::changeset::{Changeset, Entry};
use crate::errors::ParseError;

/// Default coalescing window.
pub const DEFAULT_COALESCE_THRESHOLD: Duration = Duration::from_secs(180);

const REVISION_SEPARATOR: &str = "----------------------------";
const FILE_SEPARATOR: &str =
    "=============================================================================";
const EMPTY_LOG: &str = "*** empty log message ***";

/// Compare two CVS revision numbers component-wise, so `1.9 < 1.10`.
///
/// An empty revision counts as `0`.
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    fn components(rev: &str) -> Vec<u64> {
        if rev.is_empty() {
            return vec![0];
        }
        rev.split('.').map(|n| n.parse().unwrap_or(0)).collect()
    }
    components(a).cmp(&components(b))
}

/// One revision of one file.
#[derive(Debug, Clone)]
struct FileRevision {
    file: String,
    revision: String,
    dead: bool,
}

/// Revisions sharing the same timestamp, author and message.
#[derive(Debug)]
struct Group {
    date: DateTime<Utc>,
    author: String,
    log: String,
    /// `(revision, is first revision of its file)`.
    members: Vec<(FileRevision, bool)>,
}

/// Parse a complete CVS log into time-ordered, coalesced changesets.
///
/// Groups by the same author with the same message are merged when each
/// is less than `threshold` after the previous one. A merged changeset
/// takes the timestamp of its latest member.
pub fn parse_cvs_log<R: BufRead>(
    reader: R,
    threshold: Duration,
    refill: bool,
) -> Result<Vec<Changeset>, ParseError> {
    let groups = collect(reader)?;
    let threshold = chrono::Duration::from_std(threshold)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));

    let mut coalesced: Vec<Group> = Vec::new();
    for group in groups.into_values() {
        if let Some(last) = coalesced.last_mut() {
            if last.author == group.author
                && last.log == group.log
                && (group.date - last.date).abs() < threshold
            {
                last.date = last.date.max(group.date);
                last.members.extend(group.members);
                continue;
            }
        }
        coalesced.push(group);
    }

    let changesets: Vec<Changeset> = coalesced
        .into_iter()
        .map(|g| {
            let revision = synthetic_revision(g.date, &g.author, &g.log);
            let entries = g
                .members
                .into_iter()
                .map(|(rev, first)| {
                    let entry = if rev.dead {
                        Entry::deleted(rev.file)
                    } else if first {
                        Entry::added(rev.file)
                    } else {
                        Entry::updated(rev.file)
                    };
                    entry.at_revision(rev.revision)
                })
                .collect();
            Changeset::new(revision, g.date, g.author, &g.log, entries, refill)
        })
        .collect();

    debug!(count = changesets.len(), "parsed cvs log");
    Ok(changesets)
}

/// Build the `DATE; AUTHOR, "MESSAGE"` revision token.
///
/// Messages longer than 33 characters are cut to 30 plus `...`.
pub fn synthetic_revision(date: DateTime<Utc>, author: &str, log: &str) -> String {
    let msg: String = if log.chars().count() > 33 {
        log.chars().take(30).chain("...".chars()).collect()
    } else {
        log.to_string()
    };
    format!(
        "{}; {}, \"{}\"",
        date.format("%Y-%m-%d %H:%M:%S"),
        author,
        msg.replace('\n', "")
    )
}

/// Timestamp prefix of a token built by [`synthetic_revision`].
pub fn revision_timestamp(revision: &str) -> Result<DateTime<Utc>, ParseError> {
    let stamp = revision.split(';').next().unwrap_or_default().trim();
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
        .map(|d| Utc.from_utc_datetime(&d))
        .map_err(|_| ParseError::InvalidDate(stamp.to_string()))
}

type GroupKey = (DateTime<Utc>, String, String);

struct LineReader<R> {
    inner: R,
    line_no: usize,
}

impl<R: BufRead> LineReader<R> {
    fn next_line(&mut self) -> Result<Option<String>, ParseError> {
        let mut buf = String::new();
        if self.inner.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        let trimmed = buf.trim_end_matches(['\n', '\r']).len();
        buf.truncate(trimmed);
        Ok(Some(buf))
    }

    fn unexpected(&self, detail: impl Into<String>) -> ParseError {
        ParseError::UnexpectedLine {
            line: self.line_no,
            detail: detail.into(),
        }
    }
}

fn collect<R: BufRead>(reader: R) -> Result<BTreeMap<GroupKey, Group>, ParseError> {
    let mut lines = LineReader {
        inner: reader,
        line_no: 0,
    };
    let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();

    loop {
        let file = loop {
            match lines.next_line()? {
                None => return Ok(groups),
                Some(l) => {
                    if let Some(name) = l.strip_prefix("Working file: ") {
                        break name.to_string();
                    }
                }
            }
        };

        let new_file = loop {
            let l = lines
                .next_line()?
                .ok_or_else(|| ParseError::Truncated(format!("header of {file}")))?;
            if l.starts_with("total revisions: ") {
                break is_whole_history(&l).ok_or_else(|| lines.unexpected(l.clone()))?;
            }
        };

        // Skip the description up to the first revision.
        let mut at_end = false;
        loop {
            match lines.next_line()?.as_deref() {
                None => return Err(ParseError::Truncated(format!("revisions of {file}"))),
                Some(REVISION_SEPARATOR) => break,
                Some(FILE_SEPARATOR) => {
                    at_end = true;
                    break;
                }
                Some(_) => {}
            }
        }

        let mut revisions: Vec<(DateTime<Utc>, String, String, FileRevision)> = Vec::new();
        while !at_end {
            let (rev, ended) = parse_revision(&mut lines, &file)?;
            revisions.push(rev);
            at_end = ended;
        }

        // Revisions are listed newest first; the oldest is the file's
        // first when the log covers its whole history.
        let oldest = revisions
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| compare_revisions(&a.3.revision, &b.3.revision))
            .map(|(i, _)| i);

        for (i, (date, author, log, rev)) in revisions.into_iter().enumerate() {
            let first = new_file && Some(i) == oldest;
            let key = (date, author.clone(), log.clone());
            groups
                .entry(key)
                .or_insert_with(|| Group {
                    date,
                    author,
                    log,
                    members: Vec::new(),
                })
                .members
                .push((rev, first));
        }
    }
}

/// `total revisions: 2;\tselected revisions: 2` -> whether both match.
fn is_whole_history(line: &str) -> Option<bool> {
    let mut counts = line.split(';').map(|part| {
        part.split(':')
            .nth(1)
            .map(str::trim)
            .and_then(|n| n.parse::<u64>().ok())
    });
    let total = counts.next()??;
    match counts.next().flatten() {
        Some(selected) => Some(total == selected),
        None => Some(true),
    }
}

/// Parse one revision block. Returns it and whether the file section ended.
fn parse_revision<R: BufRead>(
    lines: &mut LineReader<R>,
    file: &str,
) -> Result<((DateTime<Utc>, String, String, FileRevision), bool), ParseError> {
    let header = lines
        .next_line()?
        .ok_or_else(|| ParseError::Truncated(format!("revision of {file}")))?;
    let revision = header
        .strip_prefix("revision ")
        .and_then(|r| r.split_whitespace().next())
        .ok_or_else(|| lines.unexpected(format!("expected 'revision', got '{header}'")))?
        .to_string();

    let info = lines
        .next_line()?
        .ok_or_else(|| ParseError::Truncated(format!("revision {revision} of {file}")))?;
    let mut date = None;
    let mut author = None;
    let mut state = None;
    for field in info.split(';') {
        let field = field.trim();
        if let Some(v) = field.strip_prefix("date: ") {
            date = Some(parse_cvs_date(v)?);
        } else if let Some(v) = field.strip_prefix("author: ") {
            author = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("state: ") {
            state = Some(v.to_string());
        }
    }
    let (Some(date), Some(author)) = (date, author) else {
        return Err(lines.unexpected(format!("bad revision info '{info}'")));
    };

    let mut message: Vec<String> = Vec::new();
    let ended = loop {
        let l = lines
            .next_line()?
            .ok_or_else(|| ParseError::Truncated(format!("message of {file} {revision}")))?;
        match l.as_str() {
            REVISION_SEPARATOR => break false,
            FILE_SEPARATOR => break true,
            _ if message.is_empty() && l.starts_with("branches: ") => {}
            _ => message.push(l),
        }
    };

    let log = if message.len() == 1 && message[0] == EMPTY_LOG {
        String::new()
    } else {
        message.join("\n")
    };

    let rev = FileRevision {
        file: file.to_string(),
        revision,
        dead: state.as_deref() == Some("dead"),
    };
    Ok(((date, author, log, rev), ended))
}

/// Accepts `2004/06/10 02:17:20` and `2004-06-10 02:17:20 +0000`.
fn parse_cvs_date(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let mut parts = raw.split_whitespace();
    let (Some(day), Some(time)) = (parts.next(), parts.next()) else {
        return Err(ParseError::InvalidDate(raw.to_string()));
    };
    let stamp = format!("{} {}", day.replace('/', "-"), time);
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| ParseError::InvalidDate(raw.to_string()))?;
    match parts.next() {
        Some(offset) => DateTime::parse_from_str(&format!("{stamp} {offset}"), "%Y-%m-%d %H:%M:%S %z")
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| ParseError::InvalidDate(raw.to_string())),
        None => Ok(Utc.from_utc_datetime(&naive)),
    }
}
