use std::io::{self, Read, Write};
use std::net::SocketAddr;

use log::{debug, error, info, trace};
use mio::net::{TcpListener, TcpStream};

use crate::mesh::buffers::{InputBuffer, OutputBuffer};
use crate::mesh::error::*;

/// Size of the scratch buffer sockets read into.
pub const RECV_BUFSIZE: usize = 64 * 1024;

/// The listening socket accepting inbound peers.
pub struct Listener {
    inner: TcpListener,
}

/// Binds a non-blocking listener on `addr`.
pub fn bind(addr: SocketAddr) -> io::Result<Listener> {
    let inner = TcpListener::bind(addr)?;
    Ok(Listener { inner })
}

/// Starts a non-blocking connect to `addr`.
///
/// The connection is usually still in progress when this returns;
/// completion is signalled by the first writability event.
pub fn connect(addr: SocketAddr) -> io::Result<SocketConnection> {
    let stream = TcpStream::connect(addr)?;
    Ok(SocketConnection::from_stream(stream))
}

impl Listener {
    /// Accepts one pending connection, if any.
    pub fn accept(&self) -> io::Result<(SocketConnection, SocketAddr)> {
        let (stream, addr) = self.inner.accept()?;
        Ok((SocketConnection::from_stream(stream), addr))
    }

    /// The listening socket, for readiness registration.
    pub fn inner_mut(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

/// A non-blocking TCP stream plus the bookkeeping the event loop
/// needs: the last writability signal and the close mark.
pub struct SocketConnection {
    stream: TcpStream,
    can_send: bool,
    marked_for_close: bool,
}

impl SocketConnection {
    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {}", e);
        }
        if let Err(e) = set_keepalive(&stream) {
            debug!("could not set SO_KEEPALIVE: {}", e);
        }
        SocketConnection {
            stream,
            can_send: false,
            marked_for_close: false,
        }
    }

    /// The stream itself, for readiness registration.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// The OS level descriptor backing this socket.
    pub fn fileno(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.stream.as_raw_fd()
    }

    pub fn can_send(&self) -> bool {
        self.can_send
    }

    pub fn set_can_send(&mut self, can_send: bool) {
        self.can_send = can_send;
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.marked_for_close
    }

    pub fn mark_for_close(&mut self) {
        self.marked_for_close = true;
    }

    /// Drains the socket into `input` until it would block.
    ///
    /// Peer-fatal conditions mark the socket for close; conditions
    /// pointing at a bug in this process are surfaced as fatal
    /// errors for the node to act on.
    pub fn receive(&mut self, scratch: &mut [u8], input: &mut InputBuffer) -> Result<()> {
        let fileno = self.fileno();
        while !self.marked_for_close {
            match self.stream.read(scratch) {
                Ok(0) => {
                    info!("received close from fileno {}", fileno);
                    self.mark_for_close();
                    return Ok(());
                }
                Ok(n) => {
                    trace!("got {} bytes from fileno {}", n, fileno);
                    input.append(&scratch[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_peer_fatal(&e) => {
                    debug!("receive on fileno {} failed, closing: {}", fileno, e);
                    self.mark_for_close();
                    return Ok(());
                }
                Err(e) if is_software_fault(&e) => {
                    error!(
                        "receive on fileno {} failed with {}; this should never happen",
                        fileno, e
                    );
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::wrapped(ErrorKind::NodeFatal, e));
                }
            }
        }
        Ok(())
    }

    /// Writes queued frames until the socket fills up or the
    /// buffer runs dry. Returns the number of bytes written.
    pub fn send(&mut self, output: &mut OutputBuffer) -> Result<usize> {
        if self.marked_for_close {
            return Ok(0);
        }
        let fileno = self.fileno();
        let mut total = 0;
        while self.can_send && !self.marked_for_close {
            let head = output.head();
            if head.is_empty() {
                break;
            }
            match self.stream.write(head) {
                Ok(n) => {
                    trace!("sent {} bytes on fileno {}", n, fileno);
                    output.advance(n).map_err(|e| e.swap_kind(ErrorKind::NodeFatal))?;
                    total += n;
                }
                Err(e) if is_socket_full(&e) => {
                    trace!("fileno {} has a full socket, marking as not sendable", fileno);
                    self.can_send = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_peer_fatal(&e) || e.raw_os_error() == Some(libc::EHOSTUNREACH) => {
                    debug!("send on fileno {} failed, closing: {}", fileno, e);
                    self.mark_for_close();
                    return Ok(total);
                }
                Err(e) => {
                    // ENOMEM, EINVAL and friends violate our own
                    // invariants; the node cannot continue
                    return Err(Error::wrapped(ErrorKind::NodeFatal, e));
                }
            }
        }
        Ok(total)
    }

    /// Shuts the socket down. Unless `force` is set, the socket
    /// must have been marked for close beforehand.
    pub fn close(&mut self, force: bool) -> Result<()> {
        if !force && !self.marked_for_close {
            return Err("Attempted to close a socket not marked for close")
                .wrapped(ErrorKind::CommunicationSocket);
        }
        // the peer may already be gone, nothing to do about errors
        self.stream.shutdown(std::net::Shutdown::Both).unwrap_or(());
        Ok(())
    }
}

fn is_socket_full(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS)
}

fn is_peer_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    ) || e.raw_os_error() == Some(libc::EBADF)
}

fn is_software_fault(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EFAULT) | Some(libc::EINVAL) | Some(libc::ENOTCONN) | Some(libc::ENOMEM)
    )
}

fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
