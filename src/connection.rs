//! connection -- one FCGI connection, start to finish.
//!
//! Reads records until the request is complete, runs the handler chain,
//! writes the response, closes. One request per connection, no keep-alive.
//!
//! ```text
//! AwaitingRequest -> RequestReady -> Dispatched -> Responding -> Closed
//! ```
//!
//! Any failure before the response goes out ends in Failed, and the
//! connection is closed with nothing written.
//
use crate::config::ServerConfig;
use crate::error::FcgiError;
use crate::multipart::MultipartFactory;
use crate::record::Record;
use crate::request::{Request, RequestBuilder, RequestLimits, Step};
use crate::response::Response;
use crate::router::{Flow, Handler, Router};
use crate::transport::{Transport, read_some};
use anyhow::Error;
use std::sync::Arc;

/// Where a connection is in its one request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRequest,
    RequestReady,
    Dispatched,
    Responding,
    Closed,
    /// Absorbing. Nothing more happens on this connection.
    Failed,
}

impl ConnectionState {
    fn advance(&mut self, next: ConnectionState) {
        if *self == ConnectionState::Failed {
            return;
        }
        log::debug!("Connection state {:?} -> {:?}", self, next);
        *self = next;
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Response sent with this status.
    Completed { status: u16 },
    /// Gave up. `status` describes why; it may never have reached the peer.
    Failed { status: u16, reason: String },
}

/// Owns one connection and everything built on it.
pub struct ConnectionHandler<T: Transport> {
    stream: T,
    config: Arc<ServerConfig>,
    router: Arc<dyn Router>,
    multipart: Option<Arc<dyn MultipartFactory>>,
    state: ConnectionState,
}

impl<T: Transport> ConnectionHandler<T> {
    pub fn new(stream: T, config: Arc<ServerConfig>, router: Arc<dyn Router>) -> Self {
        Self {
            stream,
            config,
            router,
            multipart: None,
            state: ConnectionState::AwaitingRequest,
        }
    }

    /// Hand multipart/form-data bodies to parsers from this factory.
    pub fn with_multipart(mut self, factory: Option<Arc<dyn MultipartFactory>>) -> Self {
        self.multipart = factory;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the whole request cycle, then close. Call once.
    pub fn run(&mut self) -> ConnectionOutcome {
        if self.state != ConnectionState::AwaitingRequest {
            return ConnectionOutcome::Failed {
                status: 500,
                reason: format!("connection already used, state {:?}", self.state),
            };
        }
        let outcome = self.serve();
        if let Err(e) = self.stream.close() {
            log::debug!("Error closing FCGI connection: {:?}", e);
        }
        self.state.advance(ConnectionState::Closed);
        match &outcome {
            ConnectionOutcome::Completed { status } => log::info!("Request complete, status {}", status),
            ConnectionOutcome::Failed { status, reason } => {
                log::warn!("Connection failed, status {}: {}", status, reason)
            }
        }
        outcome
    }

    fn fail(&mut self, status: u16, reason: String) -> ConnectionOutcome {
        self.state.advance(ConnectionState::Failed);
        ConnectionOutcome::Failed { status, reason }
    }

    fn serve(&mut self) -> ConnectionOutcome {
        let mut request = match self.read_request() {
            Ok(request) => request,
            Err(e) => return self.fail(e.status(), e.to_string()),
        };
        self.state.advance(ConnectionState::RequestReady);
        log::info!(
            "FCGI request {}: {} {}",
            request.request_id,
            request.method,
            request.path
        );
        let found = self.router.find_handlers(&request.path_components, &request);
        self.state.advance(ConnectionState::Dispatched);
        let mut response = Response::new(request.request_id, &mut self.stream);
        match found {
            Some(route) => {
                request.url_variables = route.url_variables;
                if let Err(e) = run_chain(&route.handlers, &request, &mut response) {
                    log::error!("Handler failed on {}: {:?}", request.path, e);
                    if response.headers_sent() {
                        drop(response);
                        return self.fail(500, format!("handler failed after headers sent: {}", e));
                    }
                    response.status = 500;
                    response.set_header("Content-Type", "text/plain; charset=utf-8");
                    response.set_body(format!("Problem processing request: {}", e).into_bytes());
                }
            }
            None => {
                log::info!("No handlers for {}", request.path);
                response.status = 404;
                response.append_body_str(&format!("The file {} was not found.", request.path));
            }
        }
        let status = response.status;
        self.state.advance(ConnectionState::Responding);
        match response.finish() {
            Ok(()) => ConnectionOutcome::Completed { status },
            Err(e) => self.fail(e.status(), e.to_string()),
        }
    }

    /// Read and fold records until the request is complete.
    fn read_request(&mut self) -> Result<Request, FcgiError> {
        let limits = RequestLimits {
            max_params_bytes: self.config.max_params_bytes,
            max_body_bytes: self.config.max_body_bytes,
        };
        let mut builder = RequestBuilder::new(limits, self.multipart.clone());
        loop {
            let rec = Record::read_from(&mut self.stream, self.config.read_timeout)?;
            match builder.add_record(rec)? {
                Step::Continue => {}
                Step::Ready => return Ok(builder.into_request()),
                Step::ExtendedStdin(size) => self.read_extended_stdin(&mut builder, size)?,
            }
        }
    }

    /// Raw body bytes outside record framing, until `size` are consumed.
    fn read_extended_stdin(
        &mut self,
        builder: &mut RequestBuilder,
        size: u32,
    ) -> Result<(), FcgiError> {
        let mut remaining = size as usize;
        let mut buf = vec![0u8; self.config.xstdin_chunk_size.clamp(1, remaining.max(1))];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = read_some(&mut self.stream, &mut buf[..want], self.config.read_timeout)?;
            builder.put_post_data(&buf[..n])?;
            remaining -= n;
        }
        log::debug!("Extended stdin of {} bytes read", size);
        Ok(())
    }
}

/// Run handlers in order until one completes the response.
fn run_chain(
    handlers: &[Arc<dyn Handler>],
    request: &Request,
    response: &mut Response<'_>,
) -> Result<(), Error> {
    for handler in handlers {
        if handler.handle(request, response)? == Flow::Complete {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::encode_params;
    use crate::record::{RecordType, encode_record};
    use crate::response::parse_records;
    use crate::router::Routes;
    use crate::transport::MockStream;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Echoes the body back as text/plain.
    struct EchoBody;
    impl Handler for EchoBody {
        fn handle(&self, request: &Request, response: &mut Response<'_>) -> Result<Flow, Error> {
            response.add_header("Content-Type", "text/plain");
            response.append_body(request.post_body_bytes().unwrap_or_default());
            Ok(Flow::Complete)
        }
    }

    /// Adds a header and lets the chain continue.
    struct Tag;
    impl Handler for Tag {
        fn handle(&self, _request: &Request, response: &mut Response<'_>) -> Result<Flow, Error> {
            response.add_header("X-Tag", "seen");
            Ok(Flow::Next)
        }
    }

    struct Fails;
    impl Handler for Fails {
        fn handle(&self, _request: &Request, _response: &mut Response<'_>) -> Result<Flow, Error> {
            Err(anyhow::anyhow!("database is down"))
        }
    }

    fn router() -> Arc<dyn Router> {
        let mut routes = Routes::new();
        routes
            .add("/echo", vec![Arc::new(Tag) as Arc<dyn Handler>, Arc::new(EchoBody)])
            .add("/fail", vec![Arc::new(Fails) as Arc<dyn Handler>]);
        Arc::new(routes)
    }

    fn config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default().with_read_timeout(Duration::from_millis(200)))
    }

    fn begin_and_params(out: &mut Vec<u8>, id: u16, uri: &str) {
        encode_record(out, RecordType::BeginRequest, id, &[0, 1, 0, 0, 0, 0, 0, 0]);
        let params = encode_params(&[
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", uri),
            ("HTTP_ACCEPT", "text/html"),
        ]);
        encode_record(out, RecordType::Params, id, &params);
        encode_record(out, RecordType::Params, id, &[]);
    }

    fn request_bytes(id: u16, uri: &str, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        begin_and_params(&mut out, id, uri);
        if !body.is_empty() {
            encode_record(&mut out, RecordType::Stdin, id, body);
        }
        encode_record(&mut out, RecordType::Stdin, id, &[]);
        out
    }

    fn run(stream: MockStream) -> (ConnectionOutcome, ConnectionState, Vec<u8>, bool) {
        let output = stream.output.clone();
        let closed = stream.closed.clone();
        let mut handler = ConnectionHandler::new(stream, config(), router());
        let outcome = handler.run();
        let written = output.lock().unwrap().clone();
        (outcome, handler.state(), written, closed.load(Ordering::SeqCst))
    }

    #[test]
    fn full_request_cycle() {
        crate::testlogger::test_logger();
        let stream = MockStream::new(request_bytes(3, "/echo", b"hello")).trickle(5);
        let (outcome, state, written, closed) = run(stream);
        assert_eq!(outcome, ConnectionOutcome::Completed { status: 200 });
        assert_eq!(state, ConnectionState::Closed);
        assert!(closed);
        let records = parse_records(&written);
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0].1,
            b"Status: 200\r\nX-Tag: seen\r\nContent-Type: text/plain\r\n\r\n".to_vec()
        );
        assert_eq!(records[1].1, b"hello".to_vec());
        assert_eq!(records[2].0.rec_type, RecordType::Stdout as u8);
        assert!(records[2].1.is_empty());
        assert_eq!(
            written[written.len() - 16..],
            [1, 3, 0, 3, 0, 8, 0, 0, 0, 0, 0, 200, 0, 0, 0, 0]
        );
    }

    #[test]
    fn unrouted_path_is_404() {
        let stream = MockStream::new(request_bytes(1, "/missing?x=1", b""));
        let (outcome, _, written, _) = run(stream);
        assert_eq!(outcome, ConnectionOutcome::Completed { status: 404 });
        let records = parse_records(&written);
        assert!(records[0].1.starts_with(b"Status: 404\r\n"));
        assert_eq!(
            records[1].1,
            b"The file /missing?x=1 was not found.".to_vec()
        );
    }

    #[test]
    fn timeout_before_stdin_end_writes_nothing() {
        let mut input = Vec::new();
        begin_and_params(&mut input, 1, "/echo");
        let (outcome, state, written, closed) = run(MockStream::new(input).stalling());
        assert!(matches!(outcome, ConnectionOutcome::Failed { status: 408, .. }));
        assert_eq!(state, ConnectionState::Failed);
        assert!(written.is_empty());
        assert!(closed);
    }

    #[test]
    fn bad_begin_request_writes_nothing() {
        let mut input = Vec::new();
        encode_record(&mut input, RecordType::BeginRequest, 1, &[0]);
        let (outcome, state, written, closed) = run(MockStream::new(input));
        assert!(matches!(outcome, ConnectionOutcome::Failed { status: 400, .. }));
        assert_eq!(state, ConnectionState::Failed);
        assert!(written.is_empty());
        assert!(closed);
    }

    #[test]
    fn handler_error_becomes_500() {
        let stream = MockStream::new(request_bytes(2, "/fail", b""));
        let (outcome, _, written, _) = run(stream);
        assert_eq!(outcome, ConnectionOutcome::Completed { status: 500 });
        let records = parse_records(&written);
        assert!(records[0].1.starts_with(b"Status: 500\r\n"));
        assert_eq!(records[1].1, b"Problem processing request: database is down".to_vec());
    }

    #[test]
    fn extended_stdin_body() {
        let mut input = Vec::new();
        begin_and_params(&mut input, 4, "/echo");
        encode_record(&mut input, RecordType::Stdin, 4, b"ab");
        encode_record(&mut input, RecordType::XStdin, 4, &10u32.to_be_bytes());
        input.extend_from_slice(b"0123456789");
        encode_record(&mut input, RecordType::Stdin, 4, b"cd");
        encode_record(&mut input, RecordType::Stdin, 4, &[]);
        let (outcome, _, written, _) = run(MockStream::new(input).trickle(3));
        assert_eq!(outcome, ConnectionOutcome::Completed { status: 200 });
        let records = parse_records(&written);
        assert_eq!(records[1].1, b"ab0123456789cd".to_vec());
    }

    #[test]
    fn large_response_is_chunked() {
        let body: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
        let mut input = Vec::new();
        begin_and_params(&mut input, 1, "/echo");
        for chunk in body.chunks(60_000) {
            encode_record(&mut input, RecordType::Stdin, 1, chunk);
        }
        encode_record(&mut input, RecordType::Stdin, 1, &[]);
        let (outcome, _, written, _) = run(MockStream::new(input));
        assert_eq!(outcome, ConnectionOutcome::Completed { status: 200 });
        let records = parse_records(&written);
        //  header, 3 body chunks, end of stream, end request
        assert_eq!(records.len(), 6);
        let echoed: Vec<u8> = records[1..4].iter().flat_map(|(_, c)| c.clone()).collect();
        assert_eq!(echoed, body);
    }

    #[test]
    fn write_failure_fails_connection() {
        let stream = MockStream::new(request_bytes(1, "/echo", b"x")).failing_writes();
        let (outcome, state, _, closed) = run(stream);
        assert!(matches!(outcome, ConnectionOutcome::Failed { status: 500, .. }));
        assert_eq!(state, ConnectionState::Failed);
        assert!(closed);
    }

    #[test]
    fn second_run_refused() {
        let mut handler =
            ConnectionHandler::new(MockStream::new(request_bytes(1, "/echo", b"")), config(), router());
        assert!(matches!(handler.run(), ConnectionOutcome::Completed { .. }));
        assert!(matches!(handler.run(), ConnectionOutcome::Failed { .. }));
    }
}
