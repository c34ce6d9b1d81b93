//! Backend log parsers.
//!
//! Each parser turns one upstream system's native history representation
//! into [`Changeset`]s. svn and CVS logs come out in ascending commit order;
//! darcs lists newest first and is put in order by
//! [`collect_darcs_changes`]. The structured (XML)
//! parsers are incremental: they are fed fixed-size chunks and hand back
//! every changeset whose closing element has been seen, so arbitrarily
//! long histories are processed in bounded memory.

pub mod cvs;
pub mod darcs;
pub mod svn;
pub(crate) mod xml;

use std::collections::VecDeque;
use std::io::Read;

use crate::changeset::Changeset;
use crate::errors::ParseError;

pub use cvs::{compare_revisions, parse_cvs_log};
pub use darcs::DarcsChangesParser;
pub use svn::SvnLogParser;

/// Default number of bytes read per chunk when streaming a log.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// A push parser that emits changesets as soon as they are complete.
pub trait IncrementalParser {
    /// Consume the next chunk of raw log bytes.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Changeset>, ParseError>;

    /// Signal end of input, returning whatever is still buffered.
    fn finish(&mut self) -> Result<Vec<Changeset>, ParseError>;
}

/// Lazy, finite, non-restartable sequence of changesets read from `R`.
///
/// Stops permanently after the first error or at end of input.
pub struct ChangesetStream<R, P> {
    reader: R,
    parser: P,
    ready: VecDeque<Changeset>,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read, P: IncrementalParser> ChangesetStream<R, P> {
    pub fn new(reader: R, parser: P) -> Self {
        Self::with_chunk_size(reader, parser, CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, parser: P, chunk_size: usize) -> Self {
        Self {
            reader,
            parser,
            ready: VecDeque::new(),
            chunk: vec![0; chunk_size.max(1)],
            done: false,
        }
    }

    fn fill(&mut self) -> Result<(), ParseError> {
        while self.ready.is_empty() && !self.done {
            let n = match self.reader.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                self.done = true;
                self.ready.extend(self.parser.finish()?);
            } else {
                self.ready.extend(self.parser.feed(&self.chunk[..n])?);
            }
        }
        Ok(())
    }
}

/// Stream changesets out of `svn log --verbose --xml` output.
pub fn parse_svn_log<R: Read>(
    reader: R,
    module: &str,
    refill: bool,
) -> ChangesetStream<R, SvnLogParser> {
    ChangesetStream::new(reader, SvnLogParser::new(module, refill))
}

/// Stream changesets out of `darcs changes --xml-output --summary` output,
/// in document order (darcs lists the newest patch first).
pub fn parse_darcs_changes<R: Read>(
    reader: R,
    refill: bool,
) -> ChangesetStream<R, DarcsChangesParser> {
    ChangesetStream::new(reader, DarcsChangesParser::new(refill))
}

/// Parse darcs XML output completely and return it oldest first.
///
/// Patches recorded in the same second keep their reversed document order.
pub fn collect_darcs_changes<R: Read>(
    reader: R,
    refill: bool,
) -> Result<Vec<Changeset>, ParseError> {
    let mut changesets = parse_darcs_changes(reader, refill).collect::<Result<Vec<_>, _>>()?;
    changesets.reverse();
    changesets.sort_by_key(Changeset::date);
    Ok(changesets)
}

impl<R: Read, P: IncrementalParser> Iterator for ChangesetStream<R, P> {
    type Item = Result<Changeset, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.done = true;
            self.ready.clear();
            return Some(Err(e));
        }
        self.ready.pop_front().map(Ok)
    }
}
