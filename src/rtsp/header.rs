//! Header lines and the quoted-string-aware value tokenizer.
//!
//! A header keeps its key, the raw value and a pre-tokenised view of the
//! value. Once a header has been serialized its wire line is cached and
//! reused verbatim on re-send, so serialisation is idempotent.

use crate::rtsp::rtsp_error::RtspError;

#[derive(Debug, Clone)]
pub struct Header {
    key: String,
    value: String,
    tokens: Vec<String>,
    line: Option<String>,
}

impl Header {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        let tokens = tokenize(&value);
        Self {
            key: key.into(),
            value,
            tokens,
            line: None,
        }
    }

    /// Parse a sanitized header line. A line without a colon yields a
    /// key-only header with an empty value; `text/parameters` bodies use
    /// such lines to request parameters by name.
    ///
    /// # Errors
    /// Fails on an empty line.
    pub fn parse_line(line: &str) -> Result<Self, RtspError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RtspError::Protocol("empty header line"));
        }

        match line.find(':') {
            Some(pos) => {
                let key = line[..pos].trim_end();
                let value = line[pos + 1..].trim();
                if key.is_empty() {
                    return Err(RtspError::Protocol("header line without key"));
                }
                Ok(Self::new(key, value))
            }
            None => Ok(Self::new(line, "")),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    #[must_use]
    pub fn token(&self, i: usize) -> Option<&str> {
        self.tokens.get(i).map(String::as_str)
    }

    /// Case-insensitive key match.
    #[must_use]
    pub fn is(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key)
    }

    /// Wire line, cached after the first render.
    pub(crate) fn serialize(&mut self) -> &str {
        if self.line.is_none() {
            let line = if self.value.is_empty() {
                format!("{}\r\n", self.key)
            } else {
                format!("{}: {}\r\n", self.key, self.value)
            };
            self.line = Some(line);
        }
        self.line.as_deref().unwrap_or_default()
    }
}

/// Split a header value on whitespace while keeping double-quoted runs
/// intact; a backslash inside quotes escapes the next character. Tokens
/// keep their quote characters verbatim.
#[must_use]
pub fn tokenize(value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            cur.push(ch);
            escaped = false;
            continue;
        }
        if quoted {
            cur.push(ch);
            match ch {
                '\\' => escaped = true,
                '"' => quoted = false,
                _ => {}
            }
            continue;
        }
        match ch {
            ' ' | '\t' => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            '"' => {
                quoted = true;
                cur.push(ch);
            }
            _ => cur.push(ch),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

/// Normalize one raw wire line: strip binary zeros outside quotes, decode
/// an escaped `\0` to a literal `0`, turn CR/LF/TAB into spaces, collapse
/// space runs and trim the edges (trailing only when unquoted).
#[must_use]
pub fn sanitize_line(raw: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut quoted = false;
    let mut escaped = false;
    let mut last_c: u8 = 0;

    for &b in raw {
        let mut c = b;
        let prev = last_c;
        last_c = c;

        if escaped {
            escaped = false;
            if c == 0 {
                c = b'0';
                last_c = c;
            }
        } else if quoted {
            if c == b'"' {
                quoted = false;
            } else if c == 0 {
                last_c = prev;
                continue;
            } else if c == b'\\' {
                escaped = true;
            }
        } else {
            if c == 0 {
                last_c = prev;
                continue;
            }

            if c == b'\r' || c == b'\n' || c == b'\t' {
                c = b' ';
                last_c = c;
            }

            if c == b' ' && prev == b' ' {
                continue;
            }

            if c == b' ' && out.is_empty() {
                continue;
            }

            if c == b'"' {
                quoted = true;
            }
        }

        out.push(c);
    }

    if !quoted {
        while out.last() == Some(&b' ') {
            out.pop();
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn tokenize_respects_quotes() {
        let t = tokenize("RTP/AVP/UDP;unicast 1991 0 mode=play");
        assert_eq!(t, vec!["RTP/AVP/UDP;unicast", "1991", "0", "mode=play"]);

        let t = tokenize(r#"a "b c" d"#);
        assert_eq!(t, vec!["a", "\"b c\"", "d"]);
    }

    #[test]
    fn tokenize_escapes_inside_quotes() {
        let t = tokenize(r#""a\" b" c"#);
        assert_eq!(t, vec!["\"a\\\" b\"", "c"]);
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_line(b"  CSeq:\t\t3  "), "CSeq: 3");
        assert_eq!(sanitize_line(b"a\r\n b"), "a b");
    }

    #[test]
    fn sanitize_keeps_quoted_runs() {
        assert_eq!(sanitize_line(b"k: \"a  b\""), "k: \"a  b\"");
    }

    #[test]
    fn sanitize_decodes_escaped_zero() {
        assert_eq!(sanitize_line(b"k: \"a\\\x00b\""), "k: \"a\\0b\"");
    }

    #[test]
    fn parse_line_with_and_without_colon() {
        let h = Header::parse_line("Content-Length: 4").expect("parses");
        assert!(h.is("content-length"));
        assert_eq!(h.value(), "4");

        let h = Header::parse_line("wfd_video_formats").expect("parses");
        assert_eq!(h.key(), "wfd_video_formats");
        assert_eq!(h.value(), "");
    }

    #[test]
    fn serialize_caches_line() {
        let mut h = Header::new("CSeq", "3");
        assert_eq!(h.serialize(), "CSeq: 3\r\n");
        assert_eq!(h.serialize(), "CSeq: 3\r\n");
    }
}
