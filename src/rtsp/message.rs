//! RTSP message model: requests, replies, interleaved data frames and
//! unknown heads kept for diagnostics.
//!
//! A message is mutable while it is being assembled. `seal` assigns its
//! CSeq cookie (unless one is present), renders the wire image into an
//! immutable buffer and freezes the message; any further mutation fails
//! with [`RtspError::Busy`]. CSeq cookies of locally originated messages
//! have the top bit clear; cookies echoing a peer's CSeq carry
//! [`REMOTE_COOKIE_FLAG`], so both namespaces share one lookup table
//! without collisions.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::rtsp::header::{Header, sanitize_line};
use crate::rtsp::rtsp_error::RtspError;
use crate::rtsp::status;

/// Marks cookies that echo a remote CSeq.
pub const REMOTE_COOKIE_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { method: String, uri: String },
    Reply { code: u16, phrase: String },
    Data { channel: u8 },
    Unknown { head: String },
}

#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    headers: Vec<Header>,
    body: Vec<u8>,
    /// Parsed body lines when `Content-Type: text/parameters`.
    body_params: Vec<Header>,
    cookie: u64,
    raw: Option<Bytes>,
}

impl Message {
    #[must_use]
    pub fn request(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::with_kind(MessageKind::Request {
            method: method.into(),
            uri: uri.into(),
        })
    }

    /// A reply with an explicit phrase, or the RFC 2326 default.
    #[must_use]
    pub fn reply(code: u16, phrase: Option<&str>) -> Self {
        Self::with_kind(MessageKind::Reply {
            code,
            phrase: phrase.unwrap_or_else(|| status::phrase(code)).to_string(),
        })
    }

    /// A reply bound to `request`: echoes its remote CSeq cookie.
    ///
    /// # Errors
    /// Fails with `InvalidState` when `request` did not come from the peer.
    pub fn reply_for(request: &Self, code: u16, phrase: Option<&str>) -> Result<Self, RtspError> {
        if request.cookie & REMOTE_COOKIE_FLAG == 0 {
            return Err(RtspError::InvalidState);
        }
        let mut m = Self::reply(code, phrase);
        m.cookie = request.cookie;
        Ok(m)
    }

    #[must_use]
    pub fn data(channel: u8, payload: Vec<u8>) -> Self {
        let mut m = Self::with_kind(MessageKind::Data { channel });
        m.body = payload;
        m
    }

    #[must_use]
    pub fn unknown(head: impl Into<String>) -> Self {
        Self::with_kind(MessageKind::Unknown { head: head.into() })
    }

    fn with_kind(kind: MessageKind) -> Self {
        Self {
            kind,
            headers: Vec::new(),
            body: Vec::new(),
            body_params: Vec::new(),
            cookie: 0,
            raw: None,
        }
    }

    /// Build a message from its sanitized first wire line.
    #[must_use]
    pub(crate) fn from_head(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix("RTSP/1.0 ") {
            let mut it = rest.splitn(2, ' ');
            if let Some(code) = it.next().and_then(|c| c.parse::<u16>().ok()) {
                let phrase = it
                    .next()
                    .map_or_else(|| status::phrase(code).to_string(), str::to_string);
                return Self::with_kind(MessageKind::Reply { code, phrase });
            }
            return Self::unknown(line);
        }

        let mut it = line.split(' ');
        match (it.next(), it.next(), it.next()) {
            (Some(method), Some(uri), Some("RTSP/1.0")) if !method.is_empty() => {
                Self::request(method, uri)
            }
            _ => Self::unknown(line),
        }
    }

    // ---- Inspection --------------------------------------------------

    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Reply { .. })
    }

    /// True for a reply carrying exactly `code`.
    #[must_use]
    pub fn is_reply_code(&self, code: u16) -> bool {
        matches!(self.kind, MessageKind::Reply { code: c, .. } if c == code)
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { method, .. } => Some(method),
            _ => None,
        }
    }

    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { uri, .. } => Some(uri),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match &self.kind {
            MessageKind::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[must_use]
    pub fn channel(&self) -> Option<u8> {
        match &self.kind {
            MessageKind::Data { channel } => Some(*channel),
            _ => None,
        }
    }

    // ---- Headers -----------------------------------------------------

    /// # Errors
    /// `Busy` once sealed; `InvalidState` on data frames.
    pub fn append_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), RtspError> {
        self.check_mutable()?;
        let h = Header::new(key, value);
        if h.is("CSeq")
            && self.cookie == 0
            && let Some(v) = h.token(0).and_then(|t| t.parse::<u64>().ok())
        {
            self.cookie = v & !REMOTE_COOKIE_FLAG;
        }
        self.headers.push(h);
        Ok(())
    }

    /// Append a parsed header, tracking CSeq the way the wire parser must:
    /// a CSeq from the peer lands in the remote cookie namespace.
    pub(crate) fn append_wire_header(&mut self, h: Header) {
        if h.is("CSeq")
            && let Some(v) = h.token(0).and_then(|t| t.parse::<u64>().ok())
            && v & REMOTE_COOKIE_FLAG == 0
        {
            self.cookie = v | REMOTE_COOKIE_FLAG;
        }
        self.headers.push(h);
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.is(key))
    }

    #[must_use]
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header(key).map(Header::value)
    }

    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn upsert_header(&mut self, key: &str, value: String) {
        if let Some(pos) = self.headers.iter().position(|h| h.is(key)) {
            self.headers[pos] = Header::new(key, value);
        } else {
            self.headers.push(Header::new(key, value));
        }
    }

    // ---- Body --------------------------------------------------------

    /// Attach an opaque body; maintains `Content-Length`.
    ///
    /// # Errors
    /// `Busy` once sealed; `InvalidState` on data frames.
    pub fn set_body(&mut self, body: Vec<u8>) -> Result<(), RtspError> {
        self.check_mutable()?;
        self.upsert_header("Content-Length", body.len().to_string());
        if self
            .header_value("Content-Type")
            .is_some_and(|t| t == "text/parameters")
        {
            self.body_params = parse_parameter_lines(&body);
        }
        self.body = body;
        Ok(())
    }

    /// Attach a `text/parameters` body; maintains `Content-Type` and
    /// `Content-Length` and pre-parses the parameter lines.
    ///
    /// # Errors
    /// `Busy` once sealed; `InvalidState` on data frames.
    pub fn set_parameter_body(&mut self, text: impl Into<String>) -> Result<(), RtspError> {
        self.check_mutable()?;
        let text = text.into();
        self.upsert_header("Content-Type", "text/parameters".to_string());
        self.upsert_header("Content-Length", text.len().to_string());
        self.body_params = parse_parameter_lines(text.as_bytes());
        self.body = text.into_bytes();
        Ok(())
    }

    /// Called by the wire parser once all body bytes arrived; the headers
    /// decide whether the body is re-parsed as parameters.
    pub(crate) fn append_wire_body(&mut self, body: Vec<u8>) {
        if self
            .header_value("Content-Type")
            .is_some_and(|t| t == "text/parameters")
        {
            self.body_params = parse_parameter_lines(&body);
        }
        self.body = body;
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Lookup of a `text/parameters` body field by key.
    #[must_use]
    pub fn body_param(&self, key: &str) -> Option<&str> {
        self.body_params
            .iter()
            .find(|h| h.is(key))
            .map(Header::value)
    }

    #[must_use]
    pub fn body_params(&self) -> &[Header] {
        &self.body_params
    }

    // ---- Cookie & sealing --------------------------------------------

    #[must_use]
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// The cookie with the namespace flag stripped, as it appears on the
    /// wire in the CSeq header.
    #[must_use]
    pub fn wire_cookie(&self) -> u64 {
        self.cookie & !REMOTE_COOKIE_FLAG
    }

    /// # Errors
    /// `Busy` once sealed.
    pub fn set_cookie(&mut self, cookie: u64) -> Result<(), RtspError> {
        if self.is_sealed() {
            return Err(RtspError::Busy);
        }
        self.cookie = cookie;
        Ok(())
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.raw.is_some()
    }

    /// Render the wire image and freeze the message. `fallback_cookie` is
    /// used when no cookie has been assigned yet (the bus passes the next
    /// free local cookie).
    ///
    /// # Errors
    /// Never fails on a well-formed message; kept fallible to match the
    /// sealed-mutation contract of the callers.
    pub fn seal(&mut self, fallback_cookie: u64) -> Result<(), RtspError> {
        if self.is_sealed() {
            return Ok(());
        }
        if self.cookie == 0 {
            self.cookie = fallback_cookie & !REMOTE_COOKIE_FLAG;
        }

        let mut wire: Vec<u8> = Vec::with_capacity(128 + self.body.len());
        match &self.kind {
            MessageKind::Data { channel } => {
                wire.push(b'$');
                wire.push(*channel);
                let mut len = [0u8; 2];
                BigEndian::write_u16(&mut len, self.body.len() as u16);
                wire.extend_from_slice(&len);
                wire.extend_from_slice(&self.body);
            }
            kind => {
                let head = match kind {
                    MessageKind::Request { method, uri } => {
                        format!("{method} {uri} RTSP/1.0\r\n")
                    }
                    MessageKind::Reply { code, phrase } => {
                        format!("RTSP/1.0 {code} {phrase}\r\n")
                    }
                    MessageKind::Unknown { head } => format!("{head}\r\n"),
                    MessageKind::Data { .. } => unreachable!(),
                };
                wire.extend_from_slice(head.as_bytes());

                if self.header("CSeq").is_none() {
                    let cseq = self.cookie & !REMOTE_COOKIE_FLAG;
                    self.headers.insert(0, Header::new("CSeq", cseq.to_string()));
                }
                for h in &mut self.headers {
                    wire.extend_from_slice(h.serialize().as_bytes());
                }
                wire.extend_from_slice(b"\r\n");
                wire.extend_from_slice(&self.body);
            }
        }

        self.raw = Some(Bytes::from(wire));
        Ok(())
    }

    /// The sealed wire image.
    #[must_use]
    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    fn check_mutable(&self) -> Result<(), RtspError> {
        if self.is_sealed() {
            return Err(RtspError::Busy);
        }
        if matches!(self.kind, MessageKind::Data { .. }) {
            return Err(RtspError::InvalidState);
        }
        Ok(())
    }
}

/// Split a `text/parameters` body into sanitized key[: value] lines;
/// empty lines are skipped.
fn parse_parameter_lines(body: &[u8]) -> Vec<Header> {
    let mut out = Vec::new();
    for raw in split_body_lines(body) {
        if raw.is_empty() {
            continue;
        }
        let line = sanitize_line(raw);
        if line.is_empty() {
            continue;
        }
        if let Ok(h) = Header::parse_line(&line) {
            out.push(h);
        }
    }
    out
}

/// Split on `\r`, `\n` or `\r\n` without allocating per line.
fn split_body_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'\n' => {
                lines.push(&body[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(&body[start..i]);
                i += 1;
                if body.get(i) == Some(&b'\n') {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}
