//! server -- accept loop.
//!
//! One thread per connection. Connections share only the config and
//! the router, both read-only.
//
use crate::config::ServerConfig;
use crate::connection::{ConnectionHandler, ConnectionOutcome};
use crate::fcgisocketsetup::{Listener, switch_to_user};
use crate::multipart::MultipartFactory;
use crate::router::Router;
use anyhow::Error;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Wait after a failed accept before trying again.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// A server for the FastCGI protocol.
pub struct Server {
    config: Arc<ServerConfig>,
    router: Arc<dyn Router>,
    multipart: Option<Arc<dyn MultipartFactory>>,
}

impl Server {
    pub fn new(config: ServerConfig, router: Arc<dyn Router>) -> Self {
        Self {
            config: Arc::new(config),
            router,
            multipart: None,
        }
    }

    /// Parser factory for multipart/form-data bodies.
    pub fn with_multipart(mut self, factory: Arc<dyn MultipartFactory>) -> Self {
        self.multipart = Some(factory);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve on `listener` until the process ends.
    /// Drops privileges first if a user is configured.
    pub fn start(&self, listener: Listener) -> Result<(), Error> {
        if let Some(user) = &self.config.run_as_user {
            switch_to_user(user)?;
        }
        loop {
            self.serve_or_pause(&listener);
        }
    }

    /// One pass of the accept loop. After an accept error, wait a little
    /// so a persistent failure such as EMFILE does not spin.
    fn serve_or_pause(&self, listener: &Listener) -> bool {
        match self.serve_one(listener) {
            Ok(_) => true,
            Err(e) => {
                log::error!("Accept failed: {:?}", e);
                std::thread::sleep(ACCEPT_ERROR_PAUSE);
                false
            }
        }
    }

    /// Accept one connection and hand it to its own thread.
    pub fn serve_one(&self, listener: &Listener) -> io::Result<JoinHandle<ConnectionOutcome>> {
        let stream = listener.accept()?;
        let config = Arc::clone(&self.config);
        let router = Arc::clone(&self.router);
        let multipart = self.multipart.clone();
        std::thread::Builder::new()
            .name("fcgi-connection".to_string())
            .spawn(move || {
                ConnectionHandler::new(stream, config, router)
                    .with_multipart(multipart)
                    .run()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::encode_params;
    use crate::record::{RecordType, encode_record};
    use crate::request::Request;
    use crate::response::{Response, parse_records};
    use crate::router::{Flow, Handler, Routes};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    fn hello(_request: &Request, response: &mut Response<'_>) -> Result<Flow, Error> {
        response.add_header("Content-Type", "text/plain");
        response.append_body_str("hi");
        Ok(Flow::Complete)
    }

    fn server() -> Server {
        let mut routes = Routes::new();
        routes.add("/hello", vec![Arc::new(hello) as Arc<dyn Handler>]);
        let config = ServerConfig::default().with_read_timeout(Duration::from_millis(500));
        Server::new(config, Arc::new(routes))
    }

    fn hello_request() -> Vec<u8> {
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::BeginRequest, 1, &[0, 1, 0, 0, 0, 0, 0, 0]);
        let params = encode_params(&[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/hello")]);
        encode_record(&mut out, RecordType::Params, 1, &params);
        encode_record(&mut out, RecordType::Params, 1, &[]);
        encode_record(&mut out, RecordType::Stdin, 1, &[]);
        out
    }

    #[test]
    fn serves_over_tcp() {
        crate::testlogger::test_logger();
        let server = server();
        let listener = Listener::bind_tcp("127.0.0.1", 0).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream.write_all(&hello_request()).expect("send");
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).expect("receive");
            reply
        });
        let outcome = server.serve_one(&listener).expect("accept").join().expect("join");
        assert_eq!(outcome, ConnectionOutcome::Completed { status: 200 });
        let reply = client.join().expect("client");
        let records = parse_records(&reply);
        assert_eq!(records[1].1, b"hi".to_vec());
        assert_eq!(records.last().map(|r| r.0.rec_type), Some(RecordType::EndRequest as u8));
    }

    #[test]
    fn accept_error_pauses() {
        let server = server();
        let listener = Listener::bind_tcp("127.0.0.1", 0).expect("bind");
        if let Listener::Tcp(tcp) = &listener {
            //  Nothing pending, so accept fails at once with WouldBlock.
            tcp.set_nonblocking(true).expect("nonblocking");
        }
        let start = Instant::now();
        assert!(!server.serve_or_pause(&listener));
        assert!(start.elapsed() >= ACCEPT_ERROR_PAUSE);
    }

    #[test]
    fn stalled_connection_does_not_block_others() {
        let server = server();
        let listener = Listener::bind_tcp("127.0.0.1", 0).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let start = Instant::now();
        //  Connects and says nothing.
        let _staller = TcpStream::connect(addr).expect("connect");
        let stalled = server.serve_one(&listener).expect("accept");
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream.write_all(&hello_request()).expect("send");
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).expect("receive");
            reply
        });
        let served = server.serve_one(&listener).expect("accept");
        assert_eq!(
            served.join().expect("join"),
            ConnectionOutcome::Completed { status: 200 }
        );
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!client.join().expect("client").is_empty());
        assert!(matches!(
            stalled.join().expect("join"),
            ConnectionOutcome::Failed { status: 408, .. }
        ));
    }
}
