//! Byte-fed RTSP wire parser.
//!
//! The endless input stream is split into header lines; lines are not
//! interpreted here beyond `Content-Length` (body size) and `CSeq`
//! (remote cookie). Parsing RTSP is troublesome due to its ASCII nature:
//! CR, LF and CRLF all terminate lines, header lines may continue on the
//! next line, and quoted runs suspend all separator handling. The state
//! machine consumes one byte at a time and records the previous byte to
//! resolve the ambiguities, so feeding a buffer byte-by-byte yields
//! exactly the same messages as feeding it at once.
//!
//! A leading `$` switches to the interleaved-data track: one channel
//! byte, a 16-bit big-endian length, then exactly that many payload
//! bytes.

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder};

use crate::rtsp::header::{Header, sanitize_line};
use crate::rtsp::message::Message;
use crate::rtsp::rtsp_error::RtspError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Header,
    HeaderQuote,
    HeaderNl,
    Body,
    DataHead,
    DataBody,
}

#[derive(Debug)]
pub struct Parser {
    state: State,
    /// Unconsumed bytes of the current line / body / data frame.
    buf: Vec<u8>,
    last_chr: u8,
    /// Inside a quoted run: the previous backslash already consumed its
    /// escaped character.
    quote_escaped: bool,

    msg: Option<Message>,
    remaining_body: usize,

    data_head: [u8; 3],
    data_head_len: usize,
    data_channel: u8,
    data_size: usize,

    /// Fallback cookies for incoming messages without a CSeq.
    cookies: u64,
    out: VecDeque<Message>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::New,
            buf: Vec::new(),
            last_chr: 0,
            quote_escaped: false,
            msg: None,
            remaining_body: 0,
            data_head: [0; 3],
            data_head_len: 0,
            data_channel: 0,
            data_size: 0,
            cookies: 0,
            out: VecDeque::new(),
        }
    }

    /// Feed raw bytes; completed messages queue up for
    /// [`next_message`](Self::next_message).
    ///
    /// # Errors
    /// A framing violation (e.g. unparseable `Content-Length`) poisons the
    /// stream; the caller must treat the bus as dead.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), RtspError> {
        for &b in data {
            self.feed_char(b)?;
            self.last_chr = b;
        }
        Ok(())
    }

    pub fn next_message(&mut self) -> Option<Message> {
        self.out.pop_front()
    }

    fn feed_char(&mut self, ch: u8) -> Result<(), RtspError> {
        match self.state {
            State::New => self.feed_char_new(ch),
            State::Header => self.feed_char_header(ch),
            State::HeaderQuote => {
                self.feed_char_header_quote(ch);
                Ok(())
            }
            State::HeaderNl => self.feed_char_header_nl(ch),
            State::Body => self.feed_char_body(ch),
            State::DataHead => {
                self.feed_char_data_head(ch);
                Ok(())
            }
            State::DataBody => {
                self.feed_char_data_body(ch);
                Ok(())
            }
        }
    }

    fn feed_char_new(&mut self, ch: u8) -> Result<(), RtspError> {
        match ch {
            // LWS between messages is not allowed, but implementations are
            // supposed to ignore it.
            b'\r' | b'\n' | b'\t' | b' ' => {}
            b'$' => {
                self.state = State::DataHead;
                self.data_head_len = 0;
                self.data_channel = 0;
                self.data_size = 0;
                self.buf.clear();
            }
            _ => {
                self.state = State::Header;
                self.remaining_body = 0;
                self.buf.clear();
                self.buf.push(ch);
            }
        }
        Ok(())
    }

    fn feed_char_header(&mut self, ch: u8) -> Result<(), RtspError> {
        match ch {
            b'\r' => {
                if self.last_chr == b'\r' || self.last_chr == b'\n' {
                    // Empty line ending in \r: maybe completed by a \n,
                    // maybe not. Finish the pending header line first and
                    // submit early if there is no body.
                    self.state = State::HeaderNl;
                    self.finish_header_line()?;
                    self.buf.clear();
                    if self.remaining_body == 0 {
                        self.submit();
                    }
                } else {
                    // Might be a continuation line; keep collecting.
                    self.buf.push(ch);
                }
            }
            b'\n' => {
                if self.last_chr == b'\n' {
                    // \n\n: finish the line; empty body submits at once.
                    self.finish_header_line()?;
                    self.buf.clear();
                    if self.remaining_body > 0 {
                        self.state = State::Body;
                    } else {
                        self.state = State::New;
                        self.submit();
                    }
                } else {
                    // \r\n or a bare \n: the next character decides whether
                    // this was a continuation line.
                    self.buf.push(ch);
                }
            }
            b'\t' | b' ' => {
                // Whitespace: possibly a continuation line, nothing to do.
                self.buf.push(ch);
            }
            _ => {
                if self.last_chr == b'\r' || self.last_chr == b'\n' {
                    // Completed line and no leading whitespace: not a
                    // continuation, finish it.
                    self.finish_header_line()?;
                    self.buf.clear();
                }
                self.buf.push(ch);
                if ch == b'"' {
                    self.state = State::HeaderQuote;
                    self.quote_escaped = false;
                }
            }
        }
        Ok(())
    }

    fn feed_char_header_quote(&mut self, ch: u8) {
        if self.last_chr == b'\\' && !self.quote_escaped {
            // Escaped byte, copied unparsed; flag it so a double backslash
            // does not escape the byte after it.
            self.buf.push(ch);
            self.quote_escaped = true;
        } else {
            self.quote_escaped = false;
            self.buf.push(ch);
            if ch == b'"' {
                self.state = State::Header;
            }
        }
    }

    fn feed_char_header_nl(&mut self, ch: u8) -> Result<(), RtspError> {
        // An empty line ended with \r; the standard requires a following
        // \n but advises accepting \r alone.
        if ch == b'\n' {
            self.buf.clear();
            self.state = if self.remaining_body > 0 {
                State::Body
            } else {
                State::New
            };
            Ok(())
        } else {
            self.buf.clear();
            self.state = State::Body;
            self.feed_char_body(ch)
        }
    }

    fn feed_char_body(&mut self, ch: u8) -> Result<(), RtspError> {
        if self.remaining_body == 0 {
            // Message had no body and was submitted early; this byte
            // already belongs to the next message.
            self.state = State::New;
            return self.feed_char_new(ch);
        }

        self.buf.push(ch);
        self.remaining_body -= 1;

        if self.remaining_body == 0 {
            let body = std::mem::take(&mut self.buf);
            if let Some(m) = self.msg.as_mut() {
                m.append_wire_body(body);
            }
            self.submit();
            self.state = State::New;
        }
        Ok(())
    }

    fn feed_char_data_head(&mut self, ch: u8) {
        self.data_head[self.data_head_len] = ch;
        self.data_head_len += 1;

        if self.data_head_len == 3 {
            self.data_channel = self.data_head[0];
            self.data_size = BigEndian::read_u16(&self.data_head[1..3]) as usize;
            self.buf.clear();
            if self.data_size == 0 {
                self.submit_data(Vec::new());
                self.state = State::New;
            } else {
                self.state = State::DataBody;
            }
        }
    }

    fn feed_char_data_body(&mut self, ch: u8) {
        self.buf.push(ch);
        if self.buf.len() >= self.data_size {
            let payload = std::mem::take(&mut self.buf);
            self.submit_data(payload);
            self.state = State::New;
        }
    }

    fn finish_header_line(&mut self) -> Result<(), RtspError> {
        let line = sanitize_line(&self.buf);

        if self.msg.is_none() {
            self.msg = Some(Message::from_head(&line));
            return Ok(());
        }

        if line.is_empty() {
            return Ok(());
        }

        let h = Header::parse_line(&line)?;
        if h.is("Content-Length") {
            // A screwed content-length cannot be recovered from; the
            // attached entity would be of unknown length.
            let len = h
                .token(0)
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or(RtspError::Protocol("bad Content-Length"))?;
            self.remaining_body = len;
        }
        if let Some(m) = self.msg.as_mut() {
            m.append_wire_header(h);
        }
        Ok(())
    }

    fn submit(&mut self) {
        if let Some(mut m) = self.msg.take() {
            self.cookies = self.cookies.wrapping_add(1).max(1);
            let _ = m.seal(self.cookies);
            self.out.push_back(m);
        }
    }

    fn submit_data(&mut self, payload: Vec<u8>) {
        let mut m = Message::data(self.data_channel, payload);
        self.cookies = self.cookies.wrapping_add(1).max(1);
        let _ = m.seal(self.cookies);
        self.out.push_back(m);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use crate::rtsp::message::MessageKind;

    fn parse_all(input: &[u8]) -> Vec<Message> {
        let mut p = Parser::new();
        p.feed(input).expect("parse");
        let mut v = Vec::new();
        while let Some(m) = p.next_message() {
            v.push(m);
        }
        v
    }

    fn parse_bytewise(input: &[u8]) -> Vec<Message> {
        let mut p = Parser::new();
        for &b in input {
            p.feed(&[b]).expect("parse");
        }
        let mut v = Vec::new();
        while let Some(m) = p.next_message() {
            v.push(m);
        }
        v
    }

    #[test]
    fn reply_then_interleaved_data() {
        // Seed scenario 1.
        let ms = parse_all(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n$\x00\x00\x04ABCD");
        assert_eq!(ms.len(), 2);

        assert!(ms[0].is_reply_code(200));
        assert_eq!(ms[0].wire_cookie(), 3);
        assert_ne!(ms[0].cookie() & crate::rtsp::message::REMOTE_COOKIE_FLAG, 0);

        assert_eq!(ms[1].channel(), Some(0));
        assert_eq!(ms[1].body(), b"ABCD");
    }

    #[test]
    fn request_with_parameter_body() {
        let wire = b"SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n\
                     CSeq: 2\r\n\
                     Content-Type: text/parameters\r\n\
                     Content-Length: 25\r\n\
                     \r\n\
                     wfd_trigger_method: SETUP";
        let ms = parse_all(wire);
        assert_eq!(ms.len(), 1);
        assert_eq!(ms[0].method(), Some("SET_PARAMETER"));
        assert_eq!(ms[0].body_param("wfd_trigger_method"), Some("SETUP"));
    }

    #[test]
    fn bytewise_equals_oneshot() {
        let wire: &[u8] = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.wfa.wfd1.0\r\n\r\n\
            RTSP/1.0 200 OK\nCSeq: 1\n\n\
            $\x07\x00\x02hi\
            GET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\rCSeq: 9\r\r";
        let a = parse_all(wire);
        let b = parse_bytewise(wire);

        assert_eq!(a.len(), 4);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.kind(), y.kind());
            assert_eq!(x.cookie(), y.cookie());
            assert_eq!(x.body(), y.body());
            assert_eq!(x.headers().len(), y.headers().len());
        }
    }

    #[test]
    fn lone_cr_and_lone_lf_terminate_lines() {
        let ms = parse_all(b"RTSP/1.0 200 OK\rCSeq: 4\r\r");
        assert_eq!(ms.len(), 1);
        assert!(ms[0].is_reply_code(200));
        assert_eq!(ms[0].wire_cookie(), 4);

        let ms = parse_all(b"RTSP/1.0 200 OK\nCSeq: 5\n\n");
        assert_eq!(ms.len(), 1);
        assert_eq!(ms[0].wire_cookie(), 5);
    }

    #[test]
    fn continuation_line_joins_value() {
        let ms = parse_all(b"OPTIONS * RTSP/1.0\r\nRequire: org.wfa.wfd1.0,\r\n  another\r\n\r\n");
        assert_eq!(ms.len(), 1);
        let v = ms[0].header_value("Require").expect("header");
        assert_eq!(v, "org.wfa.wfd1.0, another");
    }

    #[test]
    fn garbage_head_becomes_unknown() {
        let ms = parse_all(b"HELLO THERE\r\n\r\n");
        assert_eq!(ms.len(), 1);
        assert!(matches!(ms[0].kind(), MessageKind::Unknown { .. }));
    }

    #[test]
    fn round_trip_sealed_bytes_reparse() {
        let mut m = Message::request("SETUP", "rtsp://x/wfd1.0/streamid=0");
        m.append_header("Transport", "RTP/AVP/UDP;unicast;client_port=1991-1992")
            .expect("header");
        m.seal(11).expect("seal");
        let raw = m.raw().expect("raw").clone();

        let back = parse_all(&raw);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].method(), Some("SETUP"));
        assert_eq!(back[0].uri(), Some("rtsp://x/wfd1.0/streamid=0"));
        assert_eq!(back[0].wire_cookie(), 11);
        assert_eq!(
            back[0].header_value("Transport"),
            Some("RTP/AVP/UDP;unicast;client_port=1991-1992")
        );
    }

    #[test]
    fn leading_whitespace_between_messages_ignored() {
        let ms = parse_all(b"\r\n  \r\nRTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n");
        assert_eq!(ms.len(), 1);
    }
}
