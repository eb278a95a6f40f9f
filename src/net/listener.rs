//! Listener setup and accept-surge protection.

use mio::net::{TcpListener, TcpStream};
use std::fs::File;
use std::io;
use std::net::SocketAddr;

/// Creates a `SO_REUSEPORT` listener so multiple worker threads can each
/// register their own copy and let the kernel load-balance accepts across
/// them, rather than funneling every accept through a single thread.
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Wraps a listener with one descriptor reserved against `EMFILE`: when the
/// process is out of file descriptors, `accept` keeps returning ready
/// events for a connection the kernel already queued but that can't be
/// accepted, spinning the reactor. Closing the reserve fd frees exactly one
/// slot, enough to accept and immediately drop the offending client, after
/// which the reserve is reopened.
pub struct Guarded {
    pub listener: TcpListener,
    reserve: Option<File>,
}

impl Guarded {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        Ok(Self {
            listener,
            reserve: Some(open_reserve()?),
        })
    }

    pub fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self.listener.accept() {
            Ok(pair) => Ok(pair),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                self.reserve.take();
                let result = self.listener.accept();
                self.reserve = Some(open_reserve()?);
                match result {
                    Ok((conn, addr)) => {
                        drop(conn);
                        Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            format!("dropped {addr} under fd exhaustion"),
                        ))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn open_reserve() -> io::Result<File> {
    File::open("/dev/null")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reuseport_produces_nonblocking_listener() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_reuseport(addr).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn guarded_accept_returns_would_block_on_empty_listener() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let std_listener = bind_reuseport(addr).unwrap();
        let listener = TcpListener::from_std(std_listener);
        let mut guarded = Guarded::new(listener).unwrap();
        let err = guarded.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
