//! fcgisocketsetup -- where connections come from.
//!
//! Three ways to listen:
//! - TCP, for nginx-style `fastcgi_pass host:port`.
//! - A Unix socket path, replacing any stale socket file.
//! - A listener socket inherited on FD 0, the way Apache mod_fcgid starts us.
//
// https://users.rust-lang.org/t/reading-from-pipe-via-stdin-in-binary/133088/10
use crate::transport::Transport;
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd::{User, dup2_stdin, setgid, setuid};
use std::fs::{File, Permissions};
use std::io;
use std::io::stdin;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

/// A bound listener socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
    /// Inherited from the parent process on FD 0.
    Inherited(UnixListener),
}

impl Listener {
    /// Bind to an address and port. "0.0.0.0" for all interfaces.
    pub fn bind_tcp(address: &str, port: u16) -> io::Result<Listener> {
        let listener = TcpListener::bind((address, port))?;
        log::info!("Starting FastCGI server on {}:{}", address, port);
        Ok(Listener::Tcp(listener))
    }

    /// Bind to a Unix socket path. An existing file there is removed first.
    /// The socket is made world read/write so the web server can reach it.
    pub fn bind_unix(path: impl AsRef<Path>) -> io::Result<Listener> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            log::warn!("Removing existing socket file {:?}", path);
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, Permissions::from_mode(0o777))?;
        log::info!("Starting FastCGI server on socket {:?}", path);
        Ok(Listener::Unix { listener, path })
    }

    /// Take over the listener socket the parent left on FD 0.
    /// FD 0 is replaced with /dev/null.
    pub fn from_stdin() -> io::Result<Listener> {
        let listening = getsockopt(&stdin().as_fd(), sockopt::AcceptConn).unwrap_or(false);
        if !listening {
            return Err(io::Error::other(
                "Not a FastCGI application (FD-0 is not a listener socket)",
            ));
        }
        let file = File::open("/dev/null")?;
        let socket_fd = stdin().as_fd().try_clone_to_owned()?;
        dup2_stdin(file)?; // atomically replace stdin
        log::info!("Starting FastCGI server on inherited socket");
        Ok(Listener::Inherited(UnixListener::from(socket_fd)))
    }

    /// TCP address, if bound to one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Wait for the next connection.
    pub fn accept(&self) -> io::Result<Box<dyn Transport>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                log::debug!("Connection from {}", addr);
                Ok(Box::new(stream))
            }
            Listener::Unix { listener, .. } | Listener::Inherited(listener) => {
                let (stream, _addr) = listener.accept()?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Give up root. Group first, while we still can.
pub fn switch_to_user(name: &str) -> io::Result<()> {
    let user = User::from_name(name)?
        .ok_or_else(|| io::Error::other(format!("No such user: {}", name)))?;
    setgid(user.gid)?;
    setuid(user.uid)?;
    log::info!("Running as user {} ({})", name, user.uid);
    Ok(())
}

#[test]
fn unix_socket_replaces_stale_file() {
    let path = std::env::temp_dir().join(format!("fcgiserver-test-{}.sock", std::process::id()));
    std::fs::write(&path, b"stale").expect("write stale file");
    {
        let listener = Listener::bind_unix(&path).expect("bind unix");
        assert!(listener.local_addr().is_none());
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        let _client = std::os::unix::net::UnixStream::connect(&path).expect("connect");
        listener.accept().expect("accept");
    }
    assert!(!path.exists());
}

#[test]
fn tcp_listener_accepts() {
    let listener = Listener::bind_tcp("127.0.0.1", 0).expect("bind tcp");
    let addr = listener.local_addr().expect("addr");
    let _client = std::net::TcpStream::connect(addr).expect("connect");
    listener.accept().expect("accept");
}

#[test]
fn unknown_user_rejected() {
    assert!(switch_to_user("no-such-user-fcgiserver").is_err());
}
