//! multipart -- hook for a multipart/form-data body parser.
//!
//! The parser itself lives elsewhere. Once a request's content type says
//! multipart, body bytes go to the parser instead of the body buffer.
//
use std::path::PathBuf;

/// One parsed part of a multipart body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodySpec {
    pub field_name: String,
    /// Field text. Empty for file parts.
    pub field_value: String,
    pub content_type: String,
    /// Set for file uploads, where the part was spooled.
    pub file: Option<PathBuf>,
}

/// Incremental multipart parser for one request.
pub trait MultipartParser: Send {
    /// Feed the next slice of raw body bytes.
    fn add_to_buffer(&mut self, bytes: &[u8]);
    /// Parts seen so far. Complete once the body has ended.
    fn body_specs(&self) -> &[BodySpec];
}

/// Makes a parser for a request, given its full content type.
pub trait MultipartFactory: Send + Sync {
    fn new_parser(&self, content_type: &str) -> Box<dyn MultipartParser>;
}

/// Content types starting with this get a multipart parser.
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";

/// True if `content_type` announces a multipart/form-data body.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .get(..MULTIPART_FORM_DATA.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MULTIPART_FORM_DATA))
}

#[test]
fn multipart_detection() {
    assert!(is_multipart("multipart/form-data; boundary=xyz"));
    assert!(is_multipart("Multipart/Form-Data"));
    assert!(!is_multipart("application/x-www-form-urlencoded"));
    assert!(!is_multipart("multi"));
}
