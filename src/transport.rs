//! transport -- the byte stream under one FCGI connection.
//!
//! Reads are blocking, with a deadline per read step. A connection
//! runs on its own thread, so a slow peer only stalls itself.
//
use crate::error::FcgiError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

/// A connected stream the engine can read records from and write frames to.
pub trait Transport: Read + Write + Send {
    /// Timeout for the next blocking read. `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Shut down both directions.
    fn close(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.shutdown(Shutdown::Both)
    }
}

impl Transport for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.shutdown(Shutdown::Both)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Socket read timeouts show up as WouldBlock on Unix and TimedOut elsewhere.
fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Time left before `deadline`, or a timeout error if none.
fn remaining(deadline: Instant) -> Result<Duration, FcgiError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(FcgiError::Timeout);
    }
    Ok(left)
}

/// Fill `buf` completely within `timeout`.
///
/// Partial reads are accumulated. Running out of time is a timeout;
/// EOF before the buffer is full is a short read. Either fails the whole step.
pub fn read_exactly<T: Transport + ?Sized>(
    stream: &mut T,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), FcgiError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    while filled < buf.len() {
        stream.set_read_timeout(Some(remaining(deadline)?))?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(FcgiError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => return Err(FcgiError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// One read of up to `buf.len()` bytes within `timeout`. Never returns 0.
pub fn read_some<T: Transport + ?Sized>(
    stream: &mut T,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, FcgiError> {
    let deadline = Instant::now() + timeout;
    loop {
        stream.set_read_timeout(Some(remaining(deadline)?))?;
        match stream.read(buf) {
            Ok(0) => return Err(FcgiError::ConnectionClosed),
            Ok(n) => return Ok(n),
            Err(e) if is_timeout(&e) => return Err(FcgiError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// In-memory transport for tests.
///
/// Hands out scripted input, optionally a few bytes at a time. When input
/// runs out it either reports a timeout (a stalled peer) or EOF.
#[cfg(test)]
pub(crate) struct MockStream {
    input: std::io::Cursor<Vec<u8>>,
    /// Largest number of bytes a single read returns.
    max_read: usize,
    /// At end of input: true = behave like a stalled peer, false = EOF.
    stall_at_end: bool,
    /// Fail every write.
    fail_writes: bool,
    pub(crate) output: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    pub(crate) closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl MockStream {
    pub(crate) fn new(input: Vec<u8>) -> Self {
        Self {
            input: std::io::Cursor::new(input),
            max_read: usize::MAX,
            stall_at_end: false,
            fail_writes: false,
            output: Default::default(),
            closed: Default::default(),
        }
    }

    pub(crate) fn stalling(mut self) -> Self {
        self.stall_at_end = true;
        self
    }

    pub(crate) fn trickle(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    pub(crate) fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.output.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.input.get_ref().len() - self.input.position() as usize;
        if left == 0 && self.stall_at_end {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(self.max_read);
        self.input.read(&mut buf[..n])
    }
}

#[cfg(test)]
impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Transport for MockStream {
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn read_exactly_accumulates_partial_reads() {
    let mut stream = MockStream::new((0u8..20).collect()).trickle(3);
    let mut buf = [0u8; 16];
    read_exactly(&mut stream, &mut buf, Duration::from_secs(1)).expect("read failed");
    assert_eq!(buf.to_vec(), (0u8..16).collect::<Vec<u8>>());
}

#[test]
fn read_exactly_short_read_fails() {
    let mut stream = MockStream::new(vec![1, 2, 3]);
    let mut buf = [0u8; 8];
    let err = read_exactly(&mut stream, &mut buf, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, FcgiError::ConnectionClosed));
}

#[test]
fn read_exactly_stall_is_timeout() {
    let mut stream = MockStream::new(vec![1, 2, 3]).stalling();
    let mut buf = [0u8; 8];
    let err = read_exactly(&mut stream, &mut buf, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, FcgiError::Timeout));
}

#[test]
fn real_socket_times_out() {
    //  A peer that connects and never sends anything.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let _client = TcpStream::connect(addr).expect("connect");
    let (mut server_side, _) = listener.accept().expect("accept");
    let mut buf = [0u8; 8];
    let start = Instant::now();
    let err = read_exactly(&mut server_side, &mut buf, Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, FcgiError::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(90));
}
