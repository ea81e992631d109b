//! response -- encodes a response as FCGI records.
//!
//! What a response looks like on the wire:
//!
//! ```text
//! {FCGI_STDOUT,      1, "Status: 200\r\nContent-Type: text/html\r\n\r\n"}
//! {FCGI_STDOUT,      1, "<html>\n<head> ... "}
//! {FCGI_STDOUT,      1, ""}
//! {FCGI_END_REQUEST, 1, {200, FCGI_REQUEST_COMPLETE}}
//! ```
//!
//! Every record is padded to a multiple of 8 bytes.
//
use crate::error::FcgiError;
use crate::record::{MAX_CONTENT_LENGTH, ProtocolStatus, RecordType, encode_record};
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::io::Write;

/// Append `data` as STDOUT records of at most 65535 content bytes each.
/// Empty data adds nothing. The end-of-stream record is separate.
pub fn encode_stdout(out: &mut Vec<u8>, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LENGTH) {
        encode_record(out, RecordType::Stdout, request_id, chunk);
    }
}

/// The END_REQUEST record. Content is app_status:4 protocol_status:1 reserved:3
pub fn end_request_frame(request_id: u16, app_status: u32, protocol_status: ProtocolStatus) -> Vec<u8> {
    let mut body = [0u8; 8];
    body[0..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = protocol_status as u8;
    let mut out = Vec::with_capacity(16);
    encode_record(&mut out, RecordType::EndRequest, request_id, &body);
    out
}

/// The CGI response header block, blank line included.
pub fn header_block(status: u16, headers: &[(String, String)]) -> String {
    let mut block = format!("Status: {}\r\n", status);
    for (name, value) in headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    block
}

/// Bytes that would end or split a cookie name or value.
const COOKIE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b';')
    .add(b'=')
    .add(b'\\');

/// When a cookie expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieExpiration {
    /// No Expires attribute.
    Session,
    /// Preformatted date, used as is.
    AbsoluteDate(String),
    /// Seconds since the Unix epoch.
    AbsoluteSeconds(i64),
    /// Seconds from now.
    RelativeSeconds(i64),
}

/// A cookie to be sent with Set-Cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub expires: Option<CookieExpiration>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }
    }

    /// Cookie dates, always GMT.
    fn format_date(seconds: i64) -> Option<String> {
        DateTime::<Utc>::from_timestamp(seconds, 0)
            .map(|t| t.format("%a, %d-%b-%Y %T GMT").to_string())
    }

    /// Value for a Set-Cookie header. Name and value are percent-encoded.
    pub fn to_header_value(&self) -> String {
        let mut line = format!(
            "{}={}",
            utf8_percent_encode(&self.name, COOKIE_ENCODE_SET),
            utf8_percent_encode(&self.value, COOKIE_ENCODE_SET)
        );
        let expires = match &self.expires {
            None | Some(CookieExpiration::Session) => None,
            Some(CookieExpiration::AbsoluteDate(date)) => Some(date.clone()),
            Some(CookieExpiration::AbsoluteSeconds(seconds)) => Self::format_date(*seconds),
            Some(CookieExpiration::RelativeSeconds(seconds)) => {
                Self::format_date(Utc::now().timestamp() + seconds)
            }
        };
        if let Some(expires) = expires {
            line.push_str(";expires=");
            line.push_str(&expires);
        }
        if let Some(path) = &self.path {
            line.push_str("; path=");
            line.push_str(path);
        }
        if let Some(domain) = &self.domain {
            line.push_str("; domain=");
            line.push_str(domain);
        }
        if self.secure {
            line.push_str("; secure");
        }
        if self.http_only {
            line.push_str("; HttpOnly");
        }
        line
    }
}

/// Response -- sends back a response to a request.
///
/// Headers go out once, with the first push. After that, pushes
/// carry body only.
pub struct Response<'a> {
    /// Copied from the request.
    request_id: u16,
    /// HTTP status. Also sent as the END_REQUEST app status.
    pub status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: Vec<u8>,
    headers_sent: bool,
    out: &'a mut dyn Write,
}

impl<'a> Response<'a> {
    pub fn new(request_id: u16, out: &'a mut dyn Write) -> Self {
        Self {
            request_id,
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            headers_sent: false,
            out,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Add a header. Duplicates allowed.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replace all headers with this name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.add_header(name, value);
    }

    /// First header with this name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Becomes a Set-Cookie header when headers are sent.
    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    pub fn append_body(&mut self, b: &[u8]) {
        self.body.extend_from_slice(b);
    }

    pub fn append_body_str(&mut self, s: &str) {
        self.body.extend_from_slice(s.as_bytes());
    }

    /// Body not yet pushed.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the unsent body.
    pub fn set_body(&mut self, b: Vec<u8>) {
        self.body = b;
    }

    /// Send headers if not yet sent, then whatever body is pending.
    pub fn push(&mut self) -> Result<(), FcgiError> {
        let mut frames = Vec::new();
        if !self.headers_sent {
            for cookie in std::mem::take(&mut self.cookies) {
                self.add_header("Set-Cookie", &cookie.to_header_value());
            }
            let block = header_block(self.status, &self.headers);
            log::info!("Response header: {:?}", block);
            encode_stdout(&mut frames, self.request_id, block.as_bytes());
            self.headers_sent = true;
        } else if !self.cookies.is_empty() {
            log::warn!(
                "{} cookies added after headers were sent. Dropped.",
                self.cookies.len()
            );
            self.cookies.clear();
        }
        encode_stdout(&mut frames, self.request_id, &self.body);
        self.body.clear();
        self.write_frames(&frames)
    }

    /// Push everything, end the output stream, and send END_REQUEST.
    pub fn finish(mut self) -> Result<(), FcgiError> {
        self.push()?;
        let mut frames = Vec::with_capacity(24);
        //  End of data record.
        encode_record(&mut frames, RecordType::Stdout, self.request_id, &[]);
        frames.extend(end_request_frame(
            self.request_id,
            u32::from(self.status),
            ProtocolStatus::RequestComplete,
        ));
        self.write_frames(&frames)
    }

    fn write_frames(&mut self, frames: &[u8]) -> Result<(), FcgiError> {
        log::debug!("Writing {} response bytes", frames.len());
        self.out.write_all(frames).map_err(FcgiError::Write)?;
        self.out.flush().map_err(FcgiError::Write)
    }
}

/// Test helper: split a byte stream into (header, content) records,
/// checking each one's padding on the way.
#[cfg(test)]
pub(crate) fn parse_records(mut b: &[u8]) -> Vec<(crate::record::RecordHeader, Vec<u8>)> {
    use crate::record::RecordHeader;
    let mut records = Vec::new();
    while !b.is_empty() {
        let header = RecordHeader::from_bytes(b[..8].try_into().expect("header"));
        let content_len = header.content_length as usize;
        let pad_len = header.padding_length as usize;
        assert_eq!((content_len + pad_len) % 8, 0, "record not aligned");
        assert!(b[8 + content_len..8 + content_len + pad_len].iter().all(|&p| p == 0));
        records.push((header, b[8..8 + content_len].to_vec()));
        b = &b[8 + content_len + pad_len..];
    }
    records
}

#[test]
fn end_request_bytes() {
    assert_eq!(
        end_request_frame(3, 0, ProtocolStatus::RequestComplete),
        vec![1, 3, 0, 3, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(
        end_request_frame(1, 404, ProtocolStatus::RequestComplete)[8..12],
        [0, 0, 1, 0x94]
    );
}

#[test]
fn stdout_chunking() {
    let lengths = [
        0usize, 1, 7, 8, 9, 65534, 65535, 65536, 65537, 131070, 131071, 200000,
    ];
    for len in lengths.into_iter().chain((0..=200_000).step_by(9973)) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        encode_stdout(&mut out, 9, &data);
        let records = parse_records(&out);
        assert_eq!(records.len(), len.div_ceil(MAX_CONTENT_LENGTH), "len {}", len);
        let mut joined = Vec::new();
        for (header, content) in records {
            assert_eq!(header.rec_type, RecordType::Stdout as u8);
            assert_eq!(header.request_id, 9);
            assert!(content.len() <= MAX_CONTENT_LENGTH);
            assert!(!content.is_empty());
            joined.extend(content);
        }
        assert_eq!(joined, data, "len {}", len);
    }
}

#[test]
fn header_block_format() {
    let headers = vec![
        ("Content-Type".to_string(), "text/plain".to_string()),
        ("X-A".to_string(), "1".to_string()),
        ("X-A".to_string(), "2".to_string()),
    ];
    assert_eq!(
        header_block(404, &headers),
        "Status: 404\r\nContent-Type: text/plain\r\nX-A: 1\r\nX-A: 2\r\n\r\n"
    );
}

#[test]
fn push_sends_headers_once() {
    let mut out = Vec::new();
    let mut response = Response::new(5, &mut out);
    response.add_header("Content-Type", "text/plain");
    response.append_body_str("first");
    response.push().expect("push");
    assert!(response.headers_sent());
    response.append_body_str("second");
    response.finish().expect("finish");
    let records = parse_records(&out);
    let contents: Vec<&[u8]> = records.iter().map(|(_, c)| c.as_slice()).collect();
    assert_eq!(
        contents,
        vec![
            &b"Status: 200\r\nContent-Type: text/plain\r\n\r\n"[..],
            &b"first"[..],
            &b"second"[..],
            &b""[..],
            &[0, 0, 0, 200, 0, 0, 0, 0][..],
        ]
    );
    assert_eq!(records[4].0.rec_type, RecordType::EndRequest as u8);
    assert_eq!(records[4].0.padding_length, 0);
    assert!(records.iter().all(|(h, _)| h.request_id == 5));
}

#[test]
fn set_header_replaces_and_cookies_become_headers() {
    let mut out = Vec::new();
    let mut response = Response::new(1, &mut out);
    response.add_header("X-Tag", "a");
    response.add_header("X-Tag", "b");
    response.set_header("x-tag", "c");
    assert_eq!(response.headers().count(), 1);
    assert_eq!(response.header("X-TAG"), Some("c"));
    let mut cookie = Cookie::new("session", "abc");
    cookie.path = Some("/".to_string());
    cookie.expires = Some(CookieExpiration::AbsoluteSeconds(0));
    cookie.http_only = true;
    response.add_cookie(cookie);
    response.push().expect("push");
    assert_eq!(
        response.header("Set-Cookie"),
        Some("session=abc;expires=Thu, 01-Jan-1970 00:00:00 GMT; path=/; HttpOnly")
    );
}

#[test]
fn write_failure_reported() {
    struct Broken;
    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    let mut out = Broken;
    let response = Response::new(1, &mut out);
    assert!(matches!(response.finish(), Err(FcgiError::Write(_))));
}

#[test]
fn cookie_name_and_value_encoded() {
    let cookie = Cookie::new("user", "a b;c");
    assert_eq!(cookie.to_header_value(), "user=a%20b%3Bc");
    let cookie = Cookie::new("k=v", "J\u{fc}rgen,100%");
    assert_eq!(cookie.to_header_value(), "k%3Dv=J%C3%BCrgen%2C100%25");
}
