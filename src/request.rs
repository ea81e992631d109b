//! request -- builds an HTTP-like request out of FCGI records.
//!
//! What a request looks like on the wire:
//!
//! ```text
//! {FCGI_BEGIN_REQUEST,   1, {FCGI_RESPONDER, 0}}
//! {FCGI_PARAMS,          1, "\013\002SERVER_PORT80\013\016SER"}
//! {FCGI_PARAMS,          1, "VER_ADDR199.170.183.42 ... "}
//! {FCGI_PARAMS,          1, ""}
//! {FCGI_STDIN,           1, "quantity=100&item=3047936"}
//! {FCGI_STDIN,           1, ""}
//! ```
//!
//! Records are folded in one at a time. The empty STDIN record
//! means the request is complete.
//
use crate::error::FcgiError;
use crate::multipart::{BodySpec, MultipartFactory, MultipartParser, is_multipart};
use crate::params::decode_params_partial;
use crate::record::{Record, RecordType, Role};
use num_traits::FromPrimitive;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
    /// Anything else, as sent.
    Custom(String),
}

impl HttpMethod {
    /// Parse a REQUEST_METHOD value. Case-insensitive.
    pub fn from_name(name: &str) -> HttpMethod {
        match name.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "OPTIONS" => HttpMethod::Options,
            "PATCH" => HttpMethod::Patch,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            _ => HttpMethod::Custom(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Custom(name) => name,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host and port, as given by the front end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// Ordered request headers. Names are kept lower case.
/// A repeated name is folded into the existing value.
#[derive(Debug, Clone, Default)]
pub struct HeaderStore {
    entries: Vec<(String, String)>,
}

impl HeaderStore {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Add a header. Repeats are merged, `; ` for Cookie, `, ` for everything else.
    pub fn add(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) => {
                let existing = &mut self.entries[i].1;
                if name.eq_ignore_ascii_case("cookie") {
                    existing.push_str("; ");
                } else {
                    existing.push_str(", ");
                }
                existing.push_str(value);
            }
            None => self
                .entries
                .push((name.to_ascii_lowercase(), value.to_string())),
        }
    }

    /// Replace any existing value.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) => self.entries[i].1 = value.to_string(),
            None => self
                .entries
                .push((name.to_ascii_lowercase(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// CGI params that map to dedicated request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    RequestMethod,
    ServerProtocol,
    DocumentRoot,
    ServerName,
    ServerAddr,
    ServerPort,
    RemoteAddr,
    RemotePort,
    QueryString,
    RequestUri,
    /// Front ends send these two without the HTTP_ prefix.
    ContentType,
    ContentLength,
}

impl PseudoHeader {
    const TABLE: [(&'static str, PseudoHeader); 12] = [
        ("REQUEST_METHOD", PseudoHeader::RequestMethod),
        ("SERVER_PROTOCOL", PseudoHeader::ServerProtocol),
        ("DOCUMENT_ROOT", PseudoHeader::DocumentRoot),
        ("SERVER_NAME", PseudoHeader::ServerName),
        ("SERVER_ADDR", PseudoHeader::ServerAddr),
        ("SERVER_PORT", PseudoHeader::ServerPort),
        ("REMOTE_ADDR", PseudoHeader::RemoteAddr),
        ("REMOTE_PORT", PseudoHeader::RemotePort),
        ("QUERY_STRING", PseudoHeader::QueryString),
        ("REQUEST_URI", PseudoHeader::RequestUri),
        ("CONTENT_TYPE", PseudoHeader::ContentType),
        ("CONTENT_LENGTH", PseudoHeader::ContentLength),
    ];

    /// Look up a param name. Exact match.
    pub fn from_name(name: &str) -> Option<PseudoHeader> {
        Self::TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| *p)
    }
}

/// Prefix of params that carry HTTP request headers.
const HTTP_PREFIX: &str = "HTTP_";

/// `HTTP_X_FORWARDED_FOR` -> `x-forwarded-for`. None if not an HTTP_ param.
fn header_name_from_param(name: &str) -> Option<String> {
    let rest = name.strip_prefix(HTTP_PREFIX)?;
    Some(rest.to_ascii_lowercase().replace('_', "-"))
}

/// Request to server.
pub struct Request {
    /// ID from BEGIN_REQUEST.
    pub request_id: u16,
    /// Role from BEGIN_REQUEST, if it was a known one.
    pub role: Option<Role>,
    pub flags: u8,
    pub method: HttpMethod,
    /// REQUEST_URI, as sent.
    pub path: String,
    /// Path split on '/', query removed, empty components dropped.
    pub path_components: Vec<String>,
    pub query_string: String,
    /// (major, minor)
    pub protocol_version: (u8, u8),
    pub remote_address: HostPort,
    pub server_address: HostPort,
    pub server_name: String,
    pub document_root: String,
    /// Filled in by the router from the matched route.
    pub url_variables: HashMap<String, String>,
    /// Every param received, in order, including ones mapped elsewhere.
    pub params: Vec<(String, String)>,
    headers: HeaderStore,
    body: Vec<u8>,
    multipart: Option<Box<dyn MultipartParser>>,
}

impl Request {
    ///  Usual new
    pub fn new() -> Request {
        Self {
            request_id: 0,
            role: None,
            flags: 0,
            method: HttpMethod::Get,
            path: String::new(),
            path_components: Vec::new(),
            query_string: String::new(),
            protocol_version: (1, 0),
            remote_address: HostPort::default(),
            server_address: HostPort::default(),
            server_name: String::new(),
            document_root: "./webroot".to_string(),
            url_variables: HashMap::new(),
            params: Vec::new(),
            headers: HeaderStore::default(),
            body: Vec::new(),
            multipart: None,
        }
    }

    /// Header value, case-insensitive name. Repeats already merged.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All headers, in first-seen order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter()
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.set(name, value)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Raw param value by CGI name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Query string split into decoded pairs.
    pub fn query_params(&self) -> Vec<(String, String)> {
        form_decode(&self.query_string)
    }

    /// Body bytes. None when the body went to a multipart parser.
    pub fn post_body_bytes(&self) -> Option<&[u8]> {
        match self.multipart {
            Some(_) => None,
            None => Some(&self.body),
        }
    }

    /// Body as text, lossy.
    pub fn post_body_string(&self) -> Option<String> {
        self.post_body_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Multipart parts. None for non-multipart bodies.
    pub fn post_file_uploads(&self) -> Option<&[BodySpec]> {
        self.multipart.as_ref().map(|m| m.body_specs())
    }

    /// Form fields from the body. Multipart fields that are not files,
    /// or a urlencoded body split into decoded pairs.
    pub fn post_params(&self) -> Vec<(String, String)> {
        if let Some(mimes) = &self.multipart {
            return mimes
                .body_specs()
                .iter()
                .filter(|spec| spec.file.is_none())
                .map(|spec| (spec.field_name.clone(), spec.field_value.clone()))
                .collect();
        }
        form_decode(&String::from_utf8_lossy(&self.body))
    }

    /// Fold one CGI param into the request.
    fn add_param(&mut self, name: &str, value: &str) {
        match PseudoHeader::from_name(name) {
            Some(PseudoHeader::RequestMethod) => self.method = HttpMethod::from_name(value),
            Some(PseudoHeader::ServerProtocol) => {
                if let Some(version) = parse_protocol_version(value) {
                    self.protocol_version = version;
                }
            }
            Some(PseudoHeader::DocumentRoot) => self.document_root = value.to_string(),
            Some(PseudoHeader::ServerName) => self.server_name = value.to_string(),
            Some(PseudoHeader::ServerAddr) => self.server_address.host = value.to_string(),
            Some(PseudoHeader::ServerPort) => self.server_address.port = value.parse().unwrap_or(0),
            Some(PseudoHeader::RemoteAddr) => self.remote_address.host = value.to_string(),
            Some(PseudoHeader::RemotePort) => self.remote_address.port = value.parse().unwrap_or(0),
            Some(PseudoHeader::QueryString) => self.query_string = value.to_string(),
            Some(PseudoHeader::RequestUri) => {
                self.path = value.to_string();
                self.path_components = split_path(value);
            }
            Some(PseudoHeader::ContentType) => self.add_header("content-type", value),
            Some(PseudoHeader::ContentLength) => self.add_header("content-length", value),
            None => {
                if let Some(header_name) = header_name_from_param(name) {
                    self.add_header(&header_name, value);
                } // else unknown or unwanted - ignored
            }
        }
        self.params.push((name.to_string(), value.to_string()));
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("multipart", &self.multipart.is_some())
            .finish()
    }
}

/// One application/x-www-form-urlencoded name or value.
/// '+' is a space, then %XX escapes. Bad UTF-8 is replaced.
fn form_unescape(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

/// "a=1&b=x%20y" -> [("a", "1"), ("b", "x y")]
fn form_decode(s: &str) -> Vec<(String, String)> {
    querystring::querify(s)
        .into_iter()
        .map(|(k, v)| (form_unescape(k), form_unescape(v)))
        .collect()
}

/// "HTTP/1.1" -> (1, 1)
fn parse_protocol_version(value: &str) -> Option<(u8, u8)> {
    let (major, minor) = value.strip_prefix("HTTP/")?.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// "/a/b/?x=1" -> ["a", "b"]
fn split_path(uri: &str) -> Vec<String> {
    let path = uri.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// What the connection should do after a record is folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Read another record.
    Continue,
    /// Request complete. Dispatch it.
    Ready,
    /// Read this many raw body bytes straight off the stream, then go back to records.
    ExtendedStdin(u32),
}

/// Size limits for one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_params_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_params_bytes: 1_048_576, // 1 MiB
            max_body_bytes: 33_554_432,  // 32 MiB
        }
    }
}

/// Record dispatcher. Folds records into a `Request`.
pub struct RequestBuilder {
    request: Request,
    /// Set by BEGIN_REQUEST. Later records must match.
    begun: Option<u16>,
    /// Tail of a name-value pair split across PARAMS records.
    pending_params: Vec<u8>,
    params_total: usize,
    body_total: usize,
    limits: RequestLimits,
    multipart_factory: Option<Arc<dyn MultipartFactory>>,
    last_record_type: u8,
}

impl RequestBuilder {
    pub fn new(limits: RequestLimits, multipart_factory: Option<Arc<dyn MultipartFactory>>) -> Self {
        Self {
            request: Request::new(),
            begun: None,
            pending_params: Vec::new(),
            params_total: 0,
            body_total: 0,
            limits,
            multipart_factory,
            last_record_type: 0,
        }
    }

    /// Request as built so far.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Type of the last record folded in.
    pub fn last_record_type(&self) -> u8 {
        self.last_record_type
    }

    /// Done building.
    pub fn into_request(self) -> Request {
        self.request
    }

    /// Fold one record into the request.
    pub fn add_record(&mut self, rec: Record) -> Result<Step, FcgiError> {
        //  Check that we're not in multiplex mode
        if let Some(id) = self.begun {
            if rec.request_id() != id && rec.request_id() != 0 {
                return Err(FcgiError::Multiplex {
                    expected: id,
                    got: rec.request_id(),
                });
            }
        }
        let step = match rec.record_type() {
            Some(RecordType::BeginRequest) => {
                self.begin_request(&rec)?;
                Step::Continue
            }
            Some(RecordType::Params) => {
                if !rec.content.is_empty() {
                    self.add_params(&rec.content)?;
                }
                Step::Continue
            }
            Some(RecordType::Stdin) => {
                self.end_params()?;
                if rec.content.is_empty() {
                    //  A zero-length block means we have a complete request.
                    log::debug!("Request ready: {:?}", self.request);
                    Step::Ready
                } else {
                    self.put_post_data(&rec.content)?;
                    Step::Continue
                }
            }
            Some(RecordType::Data) => {
                if !rec.content.is_empty() {
                    let data = String::from_utf8_lossy(&rec.content).into_owned();
                    self.request.add_header("x-fcgi-data", &data);
                }
                Step::Continue
            }
            Some(RecordType::XStdin) => {
                if let Ok(size_bytes) = <[u8; 4]>::try_from(rec.content.as_slice()) {
                    self.end_params()?;
                    let size = u32::from_be_bytes(size_bytes);
                    log::debug!("Extended stdin of {} bytes follows", size);
                    self.last_record_type = RecordType::Stdin as u8;
                    return Ok(Step::ExtendedStdin(size));
                }
                log::warn!(
                    "FCGI extended stdin record with {} content bytes, expected 4. Ignored.",
                    rec.content.len()
                );
                Step::Continue
            }
            _ => {
                log::debug!("Unhandled FCGI record type {}", rec.header.rec_type);
                Step::Continue
            }
        };
        self.last_record_type = rec.header.rec_type;
        Ok(step)
    }

    /// BEGIN_REQUEST content: role:2 flags:1 reserved:5
    fn begin_request(&mut self, rec: &Record) -> Result<(), FcgiError> {
        if rec.content.len() < 3 {
            return Err(FcgiError::BadRequest(format!(
                "BEGIN_REQUEST content is {} bytes, need 3",
                rec.content.len()
            )));
        }
        let role = u16::from_be_bytes([rec.content[0], rec.content[1]]);
        let flags = rec.content[2];
        self.request.role = Role::from_u16(role);
        if self.request.role.is_none() {
            log::warn!("Unknown FCGI role {}", role);
        }
        self.request.flags = flags;
        self.request.request_id = rec.request_id();
        self.request.add_header("x-fcgi-role", &role.to_string());
        self.request.add_header("x-fcgi-flags", &flags.to_string());
        self.begun = Some(rec.request_id());
        Ok(())
    }

    /// Decode whatever complete pairs are available. A pair split across
    /// records waits for the rest.
    fn add_params(&mut self, content: &[u8]) -> Result<(), FcgiError> {
        self.params_total += content.len();
        if self.params_total > self.limits.max_params_bytes {
            return Err(FcgiError::TooLarge(format!(
                "PARAMS exceeds size limit ({} bytes)",
                self.limits.max_params_bytes
            )));
        }
        self.pending_params.extend_from_slice(content);
        let (pairs, used) = decode_params_partial(&self.pending_params)?;
        self.pending_params.drain(..used);
        for (name, value) in pairs {
            self.request.add_param(&name, &value);
        }
        Ok(())
    }

    /// Params are over once the body starts. Leftovers mean a truncated pair.
    fn end_params(&mut self) -> Result<(), FcgiError> {
        if !self.pending_params.is_empty() {
            return Err(FcgiError::Decode(format!(
                "{} bytes of incomplete name-value pair at end of PARAMS",
                self.pending_params.len()
            )));
        }
        Ok(())
    }

    /// Add body bytes. On the first bytes, a multipart content type
    /// switches the body over to a multipart parser.
    pub fn put_post_data(&mut self, b: &[u8]) -> Result<(), FcgiError> {
        let request = &mut self.request;
        if request.body.is_empty() && request.multipart.is_none() {
            if let (Some(factory), Some(content_type)) =
                (&self.multipart_factory, request.headers.get("content-type"))
            {
                if is_multipart(content_type) {
                    log::debug!("Multipart body: {}", content_type);
                    request.multipart = Some(factory.new_parser(content_type));
                }
            }
        }
        if self.body_total + b.len() > self.limits.max_body_bytes {
            return Err(FcgiError::TooLarge(format!(
                "STDIN exceeds size limit ({} bytes)",
                self.limits.max_body_bytes
            )));
        }
        self.body_total += b.len();
        match self.request.multipart.as_mut() {
            Some(mimes) => mimes.add_to_buffer(b),
            None => self.request.body.extend_from_slice(b),
        }
        Ok(())
    }
}

/// Test helper: one record as the dispatcher sees it.
#[cfg(test)]
pub(crate) fn test_record(rec_type: u8, request_id: u16, content: &[u8]) -> Record {
    use crate::record::{FCGI_VERSION_1, RecordHeader, calc_padding_length};
    Record {
        header: RecordHeader {
            version: FCGI_VERSION_1,
            rec_type,
            request_id,
            content_length: content.len() as u16,
            padding_length: calc_padding_length(content.len()),
            reserved: 0,
        },
        content: content.to_vec(),
        padding: Vec::new(),
    }
}

#[test]
fn header_merge_rules() {
    let mut headers = HeaderStore::default();
    headers.add("Cookie", "a=1");
    headers.add("cookie", "b=2");
    headers.add("X-Custom", "foo");
    headers.add("x-custom", "bar");
    assert_eq!(headers.get("COOKIE"), Some("a=1; b=2"));
    assert_eq!(headers.get("X-Custom"), Some("foo, bar"));
    assert_eq!(headers.len(), 2);
    headers.set("x-custom", "baz");
    assert_eq!(headers.get("X-Custom"), Some("baz"));
}

#[test]
fn simple_get_request() {
    use crate::params::encode_params;
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    let begin = [0, 1, 0, 0, 0, 0, 0, 0];
    assert_eq!(
        builder
            .add_record(test_record(RecordType::BeginRequest as u8, 1, &begin))
            .expect("begin"),
        Step::Continue
    );
    let params = encode_params(&[
        ("REQUEST_METHOD", "GET"),
        ("HTTP_ACCEPT", "text/html"),
        ("REQUEST_URI", "/x"),
    ]);
    assert_eq!(
        builder
            .add_record(test_record(RecordType::Params as u8, 1, &params))
            .expect("params"),
        Step::Continue
    );
    assert_eq!(
        builder
            .add_record(test_record(RecordType::Params as u8, 1, &[]))
            .expect("empty params"),
        Step::Continue
    );
    assert_eq!(
        builder
            .add_record(test_record(RecordType::Stdin as u8, 1, &[]))
            .expect("stdin"),
        Step::Ready
    );
    let request = builder.into_request();
    assert_eq!(request.request_id, 1);
    assert_eq!(request.role, Some(Role::Responder));
    assert_eq!(request.method, HttpMethod::Get);
    assert_eq!(request.path, "/x");
    assert_eq!(request.path_components, vec!["x".to_string()]);
    assert_eq!(request.header("Accept"), Some("text/html"));
    assert_eq!(request.header("x-fcgi-role"), Some("1"));
    assert_eq!(request.post_body_bytes(), Some(&[][..]));
}

#[test]
fn param_dispatch_table() {
    let mut request = Request::new();
    for (name, value) in [
        ("REQUEST_METHOD", "post"),
        ("SERVER_PROTOCOL", "HTTP/1.1"),
        ("DOCUMENT_ROOT", "/var/www"),
        ("SERVER_NAME", "example.com"),
        ("SERVER_ADDR", "10.0.0.1"),
        ("SERVER_PORT", "8080"),
        ("REMOTE_ADDR", "10.0.0.2"),
        ("REMOTE_PORT", "notaport"),
        ("QUERY_STRING", "a=1&b=2"),
        ("REQUEST_URI", "/api//items/?a=1&b=2"),
        ("CONTENT_TYPE", "text/plain"),
        ("HTTP_X_FORWARDED_FOR", "1.2.3.4"),
        ("SCRIPT_FILENAME", "/var/www/index.php"),
    ] {
        request.add_param(name, value);
    }
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.protocol_version, (1, 1));
    assert_eq!(request.document_root, "/var/www");
    assert_eq!(request.server_name, "example.com");
    assert_eq!(
        request.server_address,
        HostPort {
            host: "10.0.0.1".to_string(),
            port: 8080
        }
    );
    assert_eq!(request.remote_address.port, 0);
    assert_eq!(request.path_components, vec!["api", "items"]);
    assert_eq!(
        request.query_params(),
        vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
    );
    assert_eq!(request.content_type(), Some("text/plain"));
    assert_eq!(request.header("x-forwarded-for"), Some("1.2.3.4"));
    //  Dropped from dispatch, still in the raw params.
    assert!(request.header("script-filename").is_none());
    assert_eq!(request.param("SCRIPT_FILENAME"), Some("/var/www/index.php"));
}

#[test]
fn begin_request_too_short() {
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    let err = builder
        .add_record(test_record(RecordType::BeginRequest as u8, 1, &[0, 1]))
        .unwrap_err();
    assert!(matches!(err, FcgiError::BadRequest(_)));
    assert_eq!(err.status(), 400);
}

#[test]
fn params_split_across_records() {
    use crate::params::encode_params;
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    let params = encode_params(&[("REQUEST_URI", "/long/path"), ("HTTP_HOST", "h")]);
    let (first, second) = params.split_at(5);
    for part in [first, second] {
        builder
            .add_record(test_record(RecordType::Params as u8, 1, part))
            .expect("params");
    }
    builder
        .add_record(test_record(RecordType::Stdin as u8, 1, &[]))
        .expect("stdin");
    let request = builder.into_request();
    assert_eq!(request.path, "/long/path");
    assert_eq!(request.header("host"), Some("h"));
}

#[test]
fn truncated_params_fail_at_stdin() {
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    builder
        .add_record(test_record(RecordType::Params as u8, 1, &[3, 9, b'K', b'E', b'Y']))
        .expect("params");
    let err = builder
        .add_record(test_record(RecordType::Stdin as u8, 1, &[]))
        .unwrap_err();
    assert!(matches!(err, FcgiError::Decode(_)));
}

#[test]
fn stdin_data_and_unknown_records() {
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    for (rec_type, content) in [
        (RecordType::Stdin as u8, &b"quantity=100"[..]),
        (RecordType::GetValues as u8, &b""[..]),
        (77, &b"whatever"[..]),
        (RecordType::Data as u8, &b"aux"[..]),
        (RecordType::Stdin as u8, &b"&item=3047936"[..]),
    ] {
        assert_eq!(
            builder
                .add_record(test_record(rec_type, 1, content))
                .expect("record"),
            Step::Continue
        );
    }
    assert_eq!(builder.last_record_type(), RecordType::Stdin as u8);
    builder
        .add_record(test_record(RecordType::Stdin as u8, 1, &[]))
        .expect("stdin");
    let request = builder.into_request();
    assert_eq!(
        request.post_body_string().as_deref(),
        Some("quantity=100&item=3047936")
    );
    assert_eq!(
        request.post_params(),
        vec![
            ("quantity".to_string(), "100".to_string()),
            ("item".to_string(), "3047936".to_string())
        ]
    );
    assert_eq!(request.header("x-fcgi-data"), Some("aux"));
}

#[test]
fn extended_stdin_size_is_big_endian() {
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    let step = builder
        .add_record(test_record(RecordType::XStdin as u8, 1, &[0, 1, 0, 2]))
        .expect("xstdin");
    assert_eq!(step, Step::ExtendedStdin(0x0001_0002));
    //  Wrong size content is ignored.
    let step = builder
        .add_record(test_record(RecordType::XStdin as u8, 1, &[0, 1]))
        .expect("xstdin");
    assert_eq!(step, Step::Continue);
}

#[test]
fn multiplexed_record_rejected() {
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    builder
        .add_record(test_record(RecordType::BeginRequest as u8, 1, &[0, 1, 0]))
        .expect("begin");
    let err = builder
        .add_record(test_record(RecordType::Params as u8, 2, &[]))
        .unwrap_err();
    assert!(matches!(err, FcgiError::Multiplex { expected: 1, got: 2 }));
}

#[test]
fn body_limit_enforced() {
    let limits = RequestLimits {
        max_params_bytes: 16,
        max_body_bytes: 8,
    };
    let mut builder = RequestBuilder::new(limits, None);
    builder.put_post_data(b"12345678").expect("at limit");
    assert!(matches!(
        builder.put_post_data(b"9"),
        Err(FcgiError::TooLarge(_))
    ));
    let mut builder = RequestBuilder::new(limits, None);
    let err = builder
        .add_record(test_record(RecordType::Params as u8, 1, &[0u8; 17]))
        .unwrap_err();
    assert_eq!(err.status(), 413);
}

#[test]
fn multipart_body_goes_to_parser() {
    struct Collect {
        specs: Vec<BodySpec>,
    }
    impl MultipartParser for Collect {
        fn add_to_buffer(&mut self, bytes: &[u8]) {
            self.specs.push(BodySpec {
                field_name: format!("chunk{}", self.specs.len()),
                field_value: String::from_utf8_lossy(bytes).into_owned(),
                ..Default::default()
            });
        }
        fn body_specs(&self) -> &[BodySpec] {
            &self.specs
        }
    }
    struct CollectFactory;
    impl MultipartFactory for CollectFactory {
        fn new_parser(&self, _content_type: &str) -> Box<dyn MultipartParser> {
            Box::new(Collect { specs: Vec::new() })
        }
    }
    let mut builder = RequestBuilder::new(RequestLimits::default(), Some(Arc::new(CollectFactory)));
    builder.request.add_param("CONTENT_TYPE", "multipart/form-data; boundary=X");
    builder.put_post_data(b"one").expect("body");
    builder.put_post_data(b"two").expect("body");
    let request = builder.into_request();
    assert!(request.post_body_bytes().is_none());
    assert_eq!(request.post_file_uploads().map(|s| s.len()), Some(2));
    assert_eq!(
        request.post_params(),
        vec![
            ("chunk0".to_string(), "one".to_string()),
            ("chunk1".to_string(), "two".to_string())
        ]
    );
}

#[test]
fn form_values_are_decoded() {
    let mut request = Request::new();
    request.add_param("QUERY_STRING", "name=J%C3%BCrgen+Smith&q=a%26b&k%3D=%zz");
    assert_eq!(
        request.query_params(),
        vec![
            ("name".to_string(), "J\u{fc}rgen Smith".to_string()),
            ("q".to_string(), "a&b".to_string()),
            ("k=".to_string(), "%zz".to_string()),
        ]
    );
    let mut builder = RequestBuilder::new(RequestLimits::default(), None);
    builder.put_post_data(b"msg=hello%20world&emoji=%F0%9F%98%80+ok").expect("body");
    assert_eq!(
        builder.into_request().post_params(),
        vec![
            ("msg".to_string(), "hello world".to_string()),
            ("emoji".to_string(), "\u{1F600} ok".to_string()),
        ]
    );
}
