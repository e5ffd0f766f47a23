use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const STOMP_VERSION: &str = "1.1";
pub const HEARTBEAT_PAYLOAD: &[u8] = b"\n";

const NUL: u8 = 0x00;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
}

/// Ordered STOMP header list. Lookup returns the first occurrence of a
/// key (repeated headers keep their first value, per STOMP 1.1); all
/// occurrences are preserved in order so frames re-serialize verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replaces the first occurrence of `key`, or appends when absent.
    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.into(),
            None => self.0.push((key.to_string(), value.into())),
        }
    }

    /// Appends unconditionally, keeping any earlier occurrence of `key`.
    pub fn append(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.0.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), headers: Headers::new(), body: None }
    }

    pub fn header(
        mut self,
        key: &str,
        value: impl Into<String>,
    ) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn body_text(mut self, text: impl Into<String>) -> Self {
        self.body = Some(text.into().into_bytes());
        self
    }

    pub fn body_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.body = Some(bytes);
        self
    }

    pub fn body_as_text(&self) -> Option<&str> {
        self.body.as_deref().and_then(|body| std::str::from_utf8(body).ok())
    }
}

/// One decoded WebSocket payload: a STOMP frame, or the single-LF
/// heartbeat beacon, which is never dispatched as a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    Frame(Frame),
    Heartbeat,
}

/// Decodes exactly one wire payload.
pub fn parse(payload: &[u8]) -> Result<WirePayload, FrameError> {
    if payload == b"\n" || payload == b"\r\n" {
        return Ok(WirePayload::Heartbeat);
    }
    Ok(WirePayload::Frame(parse_frame(payload)?))
}

fn parse_frame(input: &[u8]) -> Result<Frame, FrameError> {
    let (command_line, mut rest) =
        split_line(input).ok_or_else(|| malformed("missing command line"))?;
    if command_line.is_empty() {
        return Err(malformed("missing command line"));
    }
    let command = String::from_utf8(command_line.to_vec())
        .map_err(|_| malformed("command is not valid UTF-8"))?;

    let mut headers = Headers::new();
    loop {
        let (line, next) = split_line(rest)
            .ok_or_else(|| malformed("unterminated header section"))?;
        rest = next;
        if line.is_empty() {
            break;
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| malformed("header line without colon"))?;
        let key = unescape(&line[..colon])?;
        let value = unescape(&line[colon + 1..])?;
        headers.append(key, value);
    }

    let body = match headers.get("content-length") {
        Some(raw) => {
            let length: usize = raw
                .trim()
                .parse()
                .map_err(|_| malformed("content-length is not an integer"))?;
            if rest.len() <= length || rest[length] != NUL {
                return Err(malformed(
                    "content-length does not match body length",
                ));
            }
            let body = rest[..length].to_vec();
            ensure_only_eol(&rest[length + 1..])?;
            body
        }
        None => {
            let nul = rest
                .iter()
                .position(|b| *b == NUL)
                .ok_or_else(|| malformed("missing frame terminator"))?;
            let body = rest[..nul].to_vec();
            ensure_only_eol(&rest[nul + 1..])?;
            body
        }
    };

    let body = if body.is_empty() { None } else { Some(body) };
    Ok(Frame { command, headers, body })
}

/// Encodes a frame per the STOMP 1.1 grammar. When a body is present and
/// the frame carries no `content-length` header, one is added with the
/// body's octet length.
pub fn serialize(frame: &Frame) -> Vec<u8> {
    let body_len = frame.body.as_ref().map_or(0, Vec::len);
    let mut buf = BytesMut::with_capacity(
        frame.command.len() + body_len + frame.headers.len() * 32 + 32,
    );

    buf.put_slice(frame.command.as_bytes());
    buf.put_u8(b'\n');

    for (key, value) in frame.headers.iter() {
        put_escaped(&mut buf, key);
        buf.put_u8(b':');
        put_escaped(&mut buf, value);
        buf.put_u8(b'\n');
    }

    if let Some(body) = &frame.body {
        if !frame.headers.contains("content-length") {
            buf.put_slice(
                format!("content-length:{}\n", body.len()).as_bytes(),
            );
        }
        buf.put_u8(b'\n');
        buf.put_slice(body);
    } else {
        buf.put_u8(b'\n');
    }

    buf.put_u8(NUL);
    buf.to_vec()
}

/// Parses a `heart-beat: tx,rx` header value into millisecond intervals.
pub fn parse_heart_beat(value: &str) -> Result<(u64, u64), FrameError> {
    let (tx, rx) = value
        .split_once(',')
        .ok_or_else(|| FrameError::InvalidHeartBeat(value.to_string()))?;
    let tx = tx
        .trim()
        .parse()
        .map_err(|_| FrameError::InvalidHeartBeat(value.to_string()))?;
    let rx = rx
        .trim()
        .parse()
        .map_err(|_| FrameError::InvalidHeartBeat(value.to_string()))?;
    Ok((tx, rx))
}

pub fn format_heart_beat(tx: u64, rx: u64) -> String {
    format!("{tx},{rx}")
}

/// Splits at the first LF, stripping an optional preceding CR.
fn split_line(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let lf = input.iter().position(|b| *b == b'\n')?;
    let line = if lf > 0 && input[lf - 1] == b'\r' {
        &input[..lf - 1]
    } else {
        &input[..lf]
    };
    Some((line, &input[lf + 1..]))
}

fn ensure_only_eol(trailing: &[u8]) -> Result<(), FrameError> {
    if trailing.iter().all(|&b| matches!(b, b'\r' | b'\n')) {
        Ok(())
    } else {
        Err(malformed("trailing bytes after frame terminator"))
    }
}

fn unescape(raw: &[u8]) -> Result<String, FrameError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'c') => out.push(b':'),
            Some(b'\\') => out.push(b'\\'),
            _ => return Err(malformed("undefined header escape sequence")),
        }
    }
    String::from_utf8(out).map_err(|_| malformed("header is not valid UTF-8"))
}

fn put_escaped(
    buf: &mut BytesMut,
    text: &str,
) {
    for &b in text.as_bytes() {
        match b {
            b'\n' => buf.put_slice(b"\\n"),
            b':' => buf.put_slice(b"\\c"),
            b'\\' => buf.put_slice(b"\\\\"),
            _ => buf.put_u8(b),
        }
    }
}

fn malformed(reason: &str) -> FrameError {
    FrameError::Malformed(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(payload: &[u8]) -> Frame {
        match parse(payload).expect("parse should succeed") {
            WirePayload::Frame(frame) => frame,
            WirePayload::Heartbeat => panic!("unexpected heartbeat"),
        }
    }

    #[test]
    fn parse_connect_frame_with_headers() {
        let frame = parse_one(
            b"CONNECT\naccept-version:1.1\nhost:example\nheart-beat:5000,10000\n\n\x00",
        );
        assert_eq!(frame.command, "CONNECT");
        assert_eq!(frame.headers.get("accept-version"), Some("1.1"));
        assert_eq!(frame.headers.get("host"), Some("example"));
        assert_eq!(frame.headers.get("heart-beat"), Some("5000,10000"));
        assert_eq!(frame.body, None);
    }

    #[test]
    fn parse_treats_single_lf_as_heartbeat() {
        assert_eq!(parse(b"\n").unwrap(), WirePayload::Heartbeat);
        assert_eq!(parse(b"\r\n").unwrap(), WirePayload::Heartbeat);
    }

    #[test]
    fn parse_reads_body_up_to_nul_without_content_length() {
        let frame = parse_one(b"SEND\ndestination:/foo\n\nhello\x00");
        assert_eq!(frame.body_as_text(), Some("hello"));
    }

    #[test]
    fn parse_honors_content_length_with_embedded_nul() {
        let body = b"ab\x00cd";
        let mut payload = b"SEND\ndestination:/foo\ncontent-length:5\n\n".to_vec();
        payload.extend_from_slice(body);
        payload.push(0);
        let frame = parse_one(&payload);
        assert_eq!(frame.body.as_deref(), Some(&body[..]));
    }

    #[test]
    fn parse_tolerates_crlf_line_endings() {
        let frame = parse_one(b"SEND\r\ndestination:/foo\r\n\r\nhi\x00");
        assert_eq!(frame.command, "SEND");
        assert_eq!(frame.headers.get("destination"), Some("/foo"));
        assert_eq!(frame.body_as_text(), Some("hi"));
    }

    #[test]
    fn parse_keeps_first_value_for_repeated_header() {
        let frame = parse_one(b"SEND\nfoo:first\nfoo:second\n\n\x00");
        assert_eq!(frame.headers.get("foo"), Some("first"));
        assert_eq!(frame.headers.len(), 2);
    }

    #[test]
    fn parse_rejects_header_without_colon() {
        let err = parse(b"SEND\nbroken-header\n\n\x00").unwrap_err();
        assert!(err.to_string().contains("header line without colon"));
    }

    #[test]
    fn parse_rejects_content_length_mismatch() {
        let err = parse(b"SEND\ncontent-length:10\n\nshort\x00").unwrap_err();
        assert!(err.to_string().contains("content-length"));
    }

    #[test]
    fn parse_rejects_missing_terminator() {
        let err = parse(b"SEND\ndestination:/foo\n\nbody").unwrap_err();
        assert!(err.to_string().contains("missing frame terminator"));
    }

    #[test]
    fn parse_rejects_missing_command_line() {
        assert!(parse(b"").is_err());
        assert!(parse(b"\n\n\x00").is_err());
    }

    #[test]
    fn parse_rejects_undefined_escape() {
        let err = parse(b"SEND\nfoo:bad\\x\n\n\x00").unwrap_err();
        assert!(err.to_string().contains("escape"));
    }

    #[test]
    fn serialize_adds_content_length_for_body() {
        let frame = Frame::new("SEND")
            .header("destination", "/foo")
            .body_text("hello");
        let bytes = serialize(&frame);
        let expected =
            b"SEND\ndestination:/foo\ncontent-length:5\n\nhello\x00";
        assert_eq!(bytes, expected);
    }

    #[test]
    fn serialize_keeps_existing_content_length() {
        let frame = Frame::new("SEND")
            .header("content-length", "5")
            .body_text("hello");
        let bytes = serialize(&frame);
        assert_eq!(bytes, b"SEND\ncontent-length:5\n\nhello\x00");
    }

    #[test]
    fn header_escaping_round_trips() {
        let frame = Frame::new("MESSAGE")
            .header("weird:key", "line\nbreak\\and:colon");
        let parsed = parse_one(&serialize(&frame));
        assert_eq!(parsed, frame);
    }

    #[test]
    fn round_trip_preserves_frame() {
        let frame = Frame::new("MESSAGE")
            .header("destination", "/a.b")
            .header("message-id", "m-1")
            .header("subscription", "s-1")
            .header("content-type", "text/plain")
            .header("content-length", "4")
            .body_text("body");
        let parsed = parse_one(&serialize(&frame));
        assert_eq!(parsed, frame);
    }

    #[test]
    fn headers_set_replaces_first_occurrence() {
        let mut headers = Headers::new();
        headers.append("k", "a");
        headers.append("k", "b");
        headers.set("k", "c");
        assert_eq!(headers.get("k"), Some("c"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn parse_heart_beat_accepts_pair() {
        assert_eq!(parse_heart_beat("5000,10000").unwrap(), (5000, 10000));
        assert_eq!(parse_heart_beat("0,0").unwrap(), (0, 0));
    }

    #[test]
    fn parse_heart_beat_rejects_garbage() {
        assert!(parse_heart_beat("5000").is_err());
        assert!(parse_heart_beat("a,b").is_err());
        assert!(parse_heart_beat("").is_err());
    }
}
