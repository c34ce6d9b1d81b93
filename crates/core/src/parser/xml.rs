//! Minimal streaming XML tokenizer.
//!
//! Bytes are pushed in arbitrary chunks with [`XmlTokenizer::feed`] and
//! complete tokens are pulled with [`XmlTokenizer::next_event`]. Only the
//! unconsumed tail of the input is kept, so memory stays bounded by the
//! largest single token rather than by the document size. Processing
//! instructions, comments and DOCTYPE declarations are skipped.

use crate::errors::ParseError;

/// A complete XML token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum XmlEvent {
    Start {
        name: String,
        attrs: Vec<(String, String)>,
        empty: bool,
    },
    End {
        name: String,
    },
    Text(String),
}

impl XmlEvent {
    /// Look up an attribute of a start tag.
    pub(crate) fn attr(&self, key: &str) -> Option<&str> {
        match self {
            XmlEvent::Start { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct XmlTokenizer {
    buf: Vec<u8>,
    pos: usize,
    /// Absolute stream offset of `buf[0]`, for error messages.
    base: usize,
}

impl XmlTokenizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of input, discarding everything already tokenized.
    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.base += self.pos;
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete token, or `None` when more input is needed.
    pub(crate) fn next_event(&mut self) -> Result<Option<XmlEvent>, ParseError> {
        loop {
            let rest = &self.buf[self.pos..];
            if rest.is_empty() {
                return Ok(None);
            }

            if rest[0] != b'<' {
                let Some(lt) = find(rest, b"<") else {
                    return Ok(None);
                };
                let raw = self.utf8(&rest[..lt])?;
                let text = unescape(raw);
                self.pos += lt;
                return Ok(Some(XmlEvent::Text(text)));
            }

            if rest.len() < 2 {
                return Ok(None);
            }

            match rest[1] {
                b'?' => {
                    let Some(end) = find(rest, b"?>") else {
                        return Ok(None);
                    };
                    self.pos += end + 2;
                }
                b'!' => {
                    if rest.starts_with(b"<!--") {
                        let Some(end) = find(rest, b"-->") else {
                            return Ok(None);
                        };
                        self.pos += end + 3;
                    } else if rest.starts_with(b"<![CDATA[") {
                        let Some(end) = find(rest, b"]]>") else {
                            return Ok(None);
                        };
                        let text = self.utf8(&rest[9..end])?.to_string();
                        self.pos += end + 3;
                        return Ok(Some(XmlEvent::Text(text)));
                    } else if rest.len() < 9 && b"<![CDATA[".starts_with(rest) {
                        return Ok(None);
                    } else {
                        let Some(end) = find(rest, b">") else {
                            return Ok(None);
                        };
                        self.pos += end + 1;
                    }
                }
                b'/' => {
                    let Some(end) = find(rest, b">") else {
                        return Ok(None);
                    };
                    let name = self.utf8(&rest[2..end])?.trim().to_string();
                    if name.is_empty() {
                        return Err(self.error("empty closing tag"));
                    }
                    self.pos += end + 1;
                    return Ok(Some(XmlEvent::End { name }));
                }
                _ => {
                    let Some(end) = tag_end(rest) else {
                        return Ok(None);
                    };
                    let inner = self.utf8(&rest[1..end])?;
                    let event = self.start_tag(inner)?;
                    self.pos += end + 1;
                    return Ok(Some(event));
                }
            }
        }
    }

    /// Fail if anything but whitespace is left unconsumed.
    pub(crate) fn finish(&self) -> Result<(), ParseError> {
        let rest = &self.buf[self.pos..];
        if rest.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(self.error("unexpected end of document"))
        }
    }

    fn start_tag(&self, inner: &str) -> Result<XmlEvent, ParseError> {
        let (inner, empty) = match inner.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (inner, false),
        };
        let name_end = inner
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(inner.len());
        let name = &inner[..name_end];
        if name.is_empty() {
            return Err(self.error("element without a name"));
        }
        let attrs = self.attributes(&inner[name_end..])?;
        Ok(XmlEvent::Start {
            name: name.to_string(),
            attrs,
            empty,
        })
    }

    fn attributes(&self, mut s: &str) -> Result<Vec<(String, String)>, ParseError> {
        let mut attrs = Vec::new();
        loop {
            s = s.trim_start();
            if s.is_empty() {
                return Ok(attrs);
            }
            let eq = s
                .find('=')
                .ok_or_else(|| self.error(&format!("attribute without value near '{s}'")))?;
            let key = s[..eq].trim();
            s = s[eq + 1..].trim_start();
            let quote = s
                .chars()
                .next()
                .filter(|c| *c == '"' || *c == '\'')
                .ok_or_else(|| self.error(&format!("unquoted value for attribute '{key}'")))?;
            let close = s[1..]
                .find(quote)
                .ok_or_else(|| self.error(&format!("unterminated value for attribute '{key}'")))?;
            attrs.push((key.to_string(), unescape(&s[1..close + 1])));
            s = &s[close + 2..];
        }
    }

    fn utf8<'a>(&self, bytes: &'a [u8]) -> Result<&'a str, ParseError> {
        std::str::from_utf8(bytes).map_err(|e| self.error(&format!("invalid UTF-8: {e}")))
    }

    fn error(&self, detail: &str) -> ParseError {
        ParseError::Xml {
            offset: self.base + self.pos,
            detail: detail.to_string(),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position of the `>` closing a start tag, skipping quoted attribute values.
fn tag_end(s: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in s.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

/// Resolve the predefined entities and numeric character references.
pub(crate) fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let Some(semi) = after.find(';') else {
            out.push_str(after);
            return out;
        };
        let entity = &after[1..semi];
        let resolved = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                .and_then(Result::ok)
                .and_then(char::from_u32),
        };
        match resolved {
            Some(c) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(tok: &mut XmlTokenizer) -> Vec<XmlEvent> {
        let mut events = Vec::new();
        while let Some(ev) = tok.next_event().unwrap() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn test_tokenizes_elements_and_text() {
        let mut tok = XmlTokenizer::new();
        tok.feed(br#"<?xml version="1.0"?><log><entry rev="2" a='x &amp; y'>hi &lt;there&gt;</entry><e/></log>"#);
        let events = drain(&mut tok);
        assert_eq!(events.len(), 6);
        assert_eq!(events[1].attr("rev"), Some("2"));
        assert_eq!(events[1].attr("a"), Some("x & y"));
        assert_eq!(events[2], XmlEvent::Text("hi <there>".into()));
        assert!(matches!(&events[4], XmlEvent::Start { name, empty: true, .. } if name == "e"));
        tok.finish().unwrap();
    }

    #[test]
    fn test_byte_at_a_time_feeding() {
        let doc = "<a x=\"1>2\"><!-- c --><![CDATA[<raw>]]>caf\u{e9}</a>";
        let mut tok = XmlTokenizer::new();
        let mut events = Vec::new();
        for b in doc.as_bytes() {
            tok.feed(std::slice::from_ref(b));
            events.extend(drain(&mut tok));
        }
        assert_eq!(events[0].attr("x"), Some("1>2"));
        assert_eq!(events[1], XmlEvent::Text("<raw>".into()));
        assert_eq!(events[2], XmlEvent::Text("caf\u{e9}".into()));
        assert_eq!(events[3], XmlEvent::End { name: "a".into() });
    }

    #[test]
    fn test_truncated_document_fails_on_finish() {
        let mut tok = XmlTokenizer::new();
        tok.feed(b"<log><logentry revision=\"1");
        assert_eq!(drain(&mut tok).len(), 1);
        assert!(tok.finish().is_err());
    }

    #[test]
    fn test_malformed_attribute_is_an_error() {
        let mut tok = XmlTokenizer::new();
        tok.feed(b"<path action=A>");
        assert!(matches!(tok.next_event(), Err(ParseError::Xml { .. })));
    }

    #[test]
    fn test_unescape_numeric_references() {
        assert_eq!(unescape("a&#65;&#x42;c"), "aABc");
        assert_eq!(unescape("R&D &unknown; x"), "R&D &unknown; x");
    }
}
