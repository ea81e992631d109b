//! # fcgiserver
//!
//! Application side of the FastCGI protocol, responder role.
//!
//! A front end such as nginx or Apache connects, sends one request as a
//! sequence of records, and gets the response back as STDOUT records
//! followed by END_REQUEST. One request per connection; the front end
//! closes the connection afterwards.
//!
//! Usage:
//!
//! ```no_run
//!    use fcgiserver::{Flow, Handler, Listener, Request, Response, Routes, Server, ServerConfig};
//!    use std::sync::Arc;
//!
//!    fn hello(_request: &Request, response: &mut Response<'_>) -> anyhow::Result<Flow> {
//!        response.add_header("Content-Type", "text/plain");
//!        response.append_body_str("Hello");
//!        Ok(Flow::Complete)
//!    }
//!
//!    pub fn main() -> anyhow::Result<()> {
//!        let mut routes = Routes::new();
//!        routes.add("/hello", vec![Arc::new(hello) as Arc<dyn Handler>]);
//!        let listener = Listener::bind_tcp("127.0.0.1", 9000)?;
//!        Server::new(ServerConfig::default(), Arc::new(routes)).start(listener)
//!    }
//! ```
//
mod config;
mod connection;
mod error;
mod fcgisocketsetup;
mod multipart;
pub mod params;
pub mod record;
mod request;
pub mod response;
mod router;
mod server;
#[cfg(test)]
mod testlogger;
mod transport;

pub use config::ServerConfig;
pub use connection::{ConnectionHandler, ConnectionOutcome, ConnectionState};
pub use error::FcgiError;
pub use fcgisocketsetup::{Listener, switch_to_user};
pub use multipart::{BodySpec, MULTIPART_FORM_DATA, MultipartFactory, MultipartParser, is_multipart};
pub use request::{
    HeaderStore, HostPort, HttpMethod, PseudoHeader, Request, RequestBuilder, RequestLimits, Step,
};
pub use response::{Cookie, CookieExpiration, Response};
pub use router::{Flow, Handler, RouteMatch, Router, Routes};
pub use server::Server;
pub use transport::{Transport, read_exactly, read_some};
