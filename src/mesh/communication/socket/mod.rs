//! Non-blocking stream sockets, behind a feature selected backend.

#[cfg(feature = "socket_mio_tcp")]
mod mio_tcp;

#[cfg(feature = "socket_mio_tcp")]
pub use mio_tcp::{bind, connect, Listener, SocketConnection, RECV_BUFSIZE};

#[cfg(not(feature = "socket_mio_tcp"))]
compile_error!("Please enable one socket backend feature (e.g. socket_mio_tcp).");
