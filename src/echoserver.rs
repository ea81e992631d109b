//! # echoserver
//!
//! Demo FastCGI responder. Run it behind nginx or Apache; every request
//! under /echo gets the request back as plain text.
//!
//! ```text
//! echoserver -a 127.0.0.1 -p 9000
//! echoserver -s /run/echoserver.sock -u www-data
//! echoserver --stdin
//! ```
//
use anyhow::{Error, anyhow};
use fcgiserver::{Flow, Handler, Listener, Request, Response, Routes, Server, ServerConfig};
use getopts::Options;
use log::LevelFilter;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Echo handler. Reports method, path, headers and body.
fn echo(request: &Request, response: &mut Response<'_>) -> Result<Flow, Error> {
    let mut report = String::new();
    writeln!(report, "Method: {}", request.method)?;
    writeln!(report, "Path: {}", request.path)?;
    if !request.query_string.is_empty() {
        writeln!(report, "Query: {}", request.query_string)?;
    }
    for (name, value) in &request.url_variables {
        writeln!(report, "Variable: {} = {}", name, value)?;
    }
    writeln!(report, "Headers:")?;
    for (name, value) in request.headers() {
        writeln!(report, "  {}: {}", name, value)?;
    }
    if let Some(body) = request.post_body_bytes() {
        writeln!(report, "Body: {} bytes", body.len())?;
        report.push_str(&String::from_utf8_lossy(body));
    }
    response.add_header("Content-Type", "text/plain; charset=utf-8");
    response.append_body_str(&report);
    Ok(Flow::Complete)
}

/// Where to listen, from the command line.
#[derive(Debug, PartialEq)]
enum ListenOn {
    Tcp(String, u16),
    Unix(String),
    Stdin,
}

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Command line options.
fn options() -> Options {
    let mut opts = Options::new();
    opts.optopt("a", "address", "Listen on this TCP address.", "ADDR");
    opts.optopt("p", "port", "Listen on this TCP port.", "PORT");
    opts.optopt("s", "socket", "Listen on this UNIX socket path.", "PATH");
    opts.optflag("", "stdin", "Use the listening socket passed as standard input.");
    opts.optopt("t", "timeout", "Read timeout per connection, in seconds.", "SECS");
    opts.optopt("u", "user", "Switch to this user after binding.", "USER");
    opts.optopt("l", "logfile", "Log to this file instead of the console.", "NAME");
    opts.optflag("v", "verbose", "Verbose mode.");
    opts.optflag("h", "help", "Print this help menu.");
    opts
}

/// Parse the command line. None means help was requested.
fn parse_args(program: &str, args: &[String]) -> Result<Option<(ListenOn, ServerConfig, Option<String>, bool)>, Error> {
    let opts = options();
    let matches = opts.parse(args)?;
    if matches.opt_present("h") {
        print_usage(program, opts);
        return Ok(None);
    }
    let listen_on = match (matches.opt_str("s"), matches.opt_str("p"), matches.opt_present("stdin")) {
        (Some(path), None, false) => ListenOn::Unix(path),
        (None, Some(port), false) => {
            let address = matches.opt_str("a").unwrap_or_else(|| "127.0.0.1".to_string());
            ListenOn::Tcp(address, port.parse::<u16>()?)
        }
        (None, None, true) => ListenOn::Stdin,
        _ => {
            print_usage(program, opts);
            return Err(anyhow!("Give exactly one of --port, --socket or --stdin"));
        }
    };
    let mut config = ServerConfig::default().with_run_as_user(matches.opt_str("u"));
    if let Some(secs) = matches.opt_str("t") {
        config = config.with_read_timeout(Duration::from_secs(secs.parse::<u64>()?));
    }
    Ok(Some((listen_on, config, matches.opt_str("l"), matches.opt_present("v"))))
}

/// Set up logging.
fn logger(logfile: Option<&str>, verbose: bool) -> Result<(), Error> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    match logfile {
        Some(name) => simplelog::CombinedLogger::init(vec![simplelog::WriteLogger::new(
            level,
            simplelog::Config::default(),
            std::fs::File::create(name)?,
        )])?,
        None => simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
            level,
            simplelog::Config::default(),
            simplelog::TerminalMode::Stderr,
            simplelog::ColorChoice::Auto,
        )])?,
    }
    if let Some(name) = logfile {
        log::warn!("Logging to {:?}", name); // where the log is going
    }
    Ok(())
}

/// Setup, then serve forever.
fn run() -> Result<(), Error> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "echoserver".to_string());
    let Some((listen_on, config, logfile, verbose)) = parse_args(&program, args.get(1..).unwrap_or(&[]))? else {
        return Ok(());
    };
    logger(logfile.as_deref(), verbose)?;
    let listener = match &listen_on {
        ListenOn::Tcp(address, port) => Listener::bind_tcp(address, *port)?,
        ListenOn::Unix(path) => Listener::bind_unix(path)?,
        ListenOn::Stdin => Listener::from_stdin()?,
    };
    log::info!("Listening on {:?}", listen_on);
    let mut routes = Routes::new();
    routes.add("/echo/*", vec![Arc::new(echo) as Arc<dyn Handler>]);
    Server::new(config, Arc::new(routes)).start(listener)
}

/// Main program.
fn main() {
    if let Err(e) = run() {
        log::error!("Failed: {:?}", e);
        eprintln!("Failed: {:?}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn listen_options() {
        let (on, config, logfile, verbose) = parse_args("echoserver", &args(&["-p", "9000", "-t", "2", "-v"]))
            .expect("parse")
            .expect("not help");
        assert_eq!(on, ListenOn::Tcp("127.0.0.1".to_string(), 9000));
        assert_eq!(config.read_timeout, Duration::from_secs(2));
        assert!(logfile.is_none());
        assert!(verbose);
        let (on, config, _, _) = parse_args("echoserver", &args(&["-s", "/tmp/x.sock", "-u", "nobody"]))
            .expect("parse")
            .expect("not help");
        assert_eq!(on, ListenOn::Unix("/tmp/x.sock".to_string()));
        assert_eq!(config.run_as_user.as_deref(), Some("nobody"));
        assert!(parse_args("echoserver", &args(&["-p", "1", "--stdin"])).is_err());
        assert!(parse_args("echoserver", &args(&[])).is_err());
        assert!(parse_args("echoserver", &args(&["-p", "notaport"])).is_err());
    }

    #[test]
    fn echo_reports_request() {
        let mut request = Request::new();
        request.path = "/echo/x".to_string();
        request.add_header("Host", "example.com");
        let mut out = Vec::new();
        let mut response = Response::new(1, &mut out);
        assert_eq!(echo(&request, &mut response).expect("echo"), Flow::Complete);
        let body = String::from_utf8_lossy(response.body()).to_string();
        assert!(body.contains("Method: GET"));
        assert!(body.contains("Path: /echo/x"));
        assert!(body.contains("host: example.com"));
        assert_eq!(response.header("content-type"), Some("text/plain; charset=utf-8"));
    }
}
