//! The readiness driven event loop multiplexing every socket of
//! the node.
//!
//! One iteration: sleep until the next alarm (bounded), dispatch
//! readiness events (accepting inbound peers under the admission
//! policy), run the deferred receive pass, fire due alarms, tear
//! down connections marked for close, and open requested outbound
//! connections.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use mio::{Events, Interest, Poll, Token};

use crate::mesh::communication::socket::{self, Listener, RECV_BUFSIZE};
use crate::mesh::communication::{Connection, ConnectionId, ConnectionState};
use crate::mesh::core::{ConnectRequest, Node};
use crate::mesh::error::*;

/// Ceiling on how long one poll may sleep, whatever the alarm
/// queue says.
pub const MAX_EVENT_LOOP_TIMEOUT: Duration = Duration::from_secs(1);

// readiness events drained per poll
const EVENTS_CAPACITY: usize = 1000;

const LISTENER: Token = Token(0);

fn token_of(id: ConnectionId) -> Token {
    Token(id.index() + 1)
}

fn id_of(token: Token) -> ConnectionId {
    ConnectionId(token.0 - 1)
}

/// The readiness notification loop owning the listener and the
/// poll registry all sockets are registered with.
pub struct NetworkEventLoop {
    poll: Poll,
    events: Events,
    listener: Listener,
    recv_buf: Box<[u8]>,
    poll_timeout: Duration,
}

impl NetworkEventLoop {
    pub fn new(node: &Node) -> Result<Self> {
        let mut listener = socket::bind(node.config().listen_addr)
            .wrapped_msg(ErrorKind::Network, "could not bind the listen address")?;
        let poll = Poll::new().wrapped(ErrorKind::Network)?;
        poll.registry()
            .register(listener.inner_mut(), LISTENER, Interest::READABLE)
            .wrapped(ErrorKind::Network)?;
        info!("listening on {}", node.config().listen_addr);
        Ok(NetworkEventLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            recv_buf: vec![0; RECV_BUFSIZE].into_boxed_slice(),
            poll_timeout: MAX_EVENT_LOOP_TIMEOUT,
        })
    }

    /// The address the listener actually bound, e.g. with an OS
    /// assigned port.
    pub fn local_addr(&mut self) -> Result<std::net::SocketAddr> {
        self.listener
            .inner_mut()
            .local_addr()
            .wrapped(ErrorKind::Network)
    }

    /// Caps the poll sleep; mostly useful to tighten tests.
    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    /// Runs iterations until a node-fatal error surfaces.
    pub fn run(&mut self, node: &mut Node) -> Result<()> {
        loop {
            self.run_once(node)?;
        }
    }

    /// One iteration of the event loop.
    pub fn run_once(&mut self, node: &mut Node) -> Result<()> {
        let now = Instant::now();
        let timeout = node
            .time_to_next_alarm(now)
            .map(|delay| delay.min(self.poll_timeout))
            .unwrap_or(self.poll_timeout);

        let mut interrupted = false;
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                debug!("poll was interrupted, skipping to the alarm pass");
                self.events.clear();
                interrupted = true;
            } else {
                return Err(Error::wrapped(ErrorKind::Network, e));
            }
        }
        let had_events = !self.events.is_empty();

        if !interrupted {
            let facts: Vec<(Token, bool, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error() || event.is_read_closed() || event.is_write_closed(),
                    )
                })
                .collect();

            let mut receive_after = Vec::new();
            for (token, readable, writable, closed) in facts {
                if token == LISTENER {
                    if readable {
                        self.accept_pending(node, now);
                    }
                    continue;
                }
                let id = id_of(token);

                if closed {
                    debug!("received hangup for connection {}", id);
                    if let Some(conn) = node.pool_mut().get_mut(id) {
                        conn.mark_for_close();
                    }
                }

                if writable {
                    self.on_writable(node, id, now)?;
                }

                if readable {
                    let marked = node
                        .pool()
                        .get(id)
                        .map(Connection::is_marked_for_close)
                        .unwrap_or(true);
                    if !marked {
                        receive_after.push(id);
                    }
                }
            }

            // the receive pass runs after all other readiness
            // dispatch so writability facts are not stale
            for id in receive_after {
                let marked = match node.pool_mut().get_mut(id) {
                    Some(conn) if !conn.is_marked_for_close() => {
                        conn.receive(&mut self.recv_buf)?;
                        false
                    }
                    _ => true,
                };
                if !marked {
                    if let Err(e) = node.process_connection(id) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        error!("processing connection {} failed: {}", id, e);
                        if let Some(conn) = node.pool_mut().get_mut(id) {
                            conn.mark_for_close();
                        }
                    }
                }
            }
        }

        node.drain_worker_events();
        if let Some(e) = node.take_fatal() {
            return Err(e);
        }

        let after_dispatch = Instant::now();
        node.fire_alarms(after_dispatch, !had_events);

        for id in node.marked_connections() {
            self.teardown(node, id, after_dispatch);
        }

        while let Some(request) = node.pop_connection_request() {
            self.connect_out(node, request, after_dispatch);
        }

        if let Some(e) = node.take_fatal() {
            return Err(e);
        }
        Ok(())
    }

    /// Accepts every pending inbound connection, closing the ones
    /// over the per-IP admission cap.
    fn accept_pending(&mut self, node: &mut Node, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((mut sock, addr)) => {
                    debug!("new connection from {}", addr);
                    let admitted = node.pool().num_connections_by_ip(addr.ip())
                        < node.config().max_conn_by_ip;
                    if !admitted {
                        warn!("{} has too many connections, closing", addr.ip());
                        sock.close(true).unwrap_or(());
                        continue;
                    }
                    if node.pool().has_connection(addr.ip(), addr.port()) {
                        warn!("connection from {} already exists, closing", addr);
                        sock.close(true).unwrap_or(());
                        continue;
                    }

                    let id = node.pool_mut().reserve_id();
                    let mut conn = Connection::new(
                        id,
                        sock,
                        addr.ip(),
                        addr.port(),
                        false,
                        false,
                        node.config().network_num,
                    );
                    // an accepted socket is connected already
                    conn.on_initialized();
                    if let Err(e) = self.poll.registry().register(
                        conn.socket_mut().stream_mut(),
                        token_of(id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!("could not register {}: {}", addr, e);
                        continue;
                    }
                    match node.pool_mut().add(conn) {
                        Ok(id) => node.on_connection_added(id, now),
                        Err(e) => warn!("could not pool {}: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Writability: completes in-progress connects, then flushes
    /// the output buffer.
    fn on_writable(&mut self, node: &mut Node, id: ConnectionId, now: Instant) -> Result<()> {
        let mut initialize = false;
        if let Some(conn) = node.pool_mut().get_mut(id) {
            if conn.is_marked_for_close() {
                return Ok(());
            }
            if !conn.state().contains(ConnectionState::INITIALIZED) {
                // writability on a connecting socket reports the
                // non-blocking connect's outcome
                match conn.socket_mut().stream_mut().take_error() {
                    Ok(Some(e)) => {
                        debug!("connect on connection {} failed: {}", id, e);
                        conn.mark_for_close();
                        return Ok(());
                    }
                    Ok(None) => initialize = true,
                    Err(e) => {
                        debug!("connection {} state unreadable: {}", id, e);
                        conn.mark_for_close();
                        return Ok(());
                    }
                }
            }
        }
        if initialize {
            trace!("connection {} finished connecting", id);
            node.on_connection_initialized(id, now);
        }
        if let Some(conn) = node.pool_mut().get_mut(id) {
            if !conn.is_marked_for_close() {
                conn.socket_mut().set_can_send(true);
                conn.send()?;
            }
        }
        Ok(())
    }

    /// Deregisters, closes and forgets a connection marked for
    /// close.
    fn teardown(&mut self, node: &mut Node, id: ConnectionId, now: Instant) {
        if let Some(mut conn) = node.pool_mut().delete(id) {
            if let Err(e) = self.poll.registry().deregister(conn.socket_mut().stream_mut()) {
                debug!("could not deregister connection {}: {}", id, e);
            }
            conn.close(false).unwrap_or(());
            node.on_connection_destroyed(&conn, now);
        }
    }

    /// Opens a non-blocking outbound connection.
    fn connect_out(&mut self, node: &mut Node, request: ConnectRequest, now: Instant) {
        debug!("initiating connection to {}", request.addr);
        let sock = match socket::connect(request.addr) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("connect to {} failed: {}", request.addr, e);
                return;
            }
        };
        let id = node.pool_mut().reserve_id();
        let mut conn = Connection::new(
            id,
            sock,
            request.addr.ip(),
            request.addr.port(),
            true,
            request.persistent,
            node.config().network_num,
        );
        if let Err(e) = self.poll.registry().register(
            conn.socket_mut().stream_mut(),
            token_of(id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!("could not register {}: {}", request.addr, e);
            return;
        }
        match node.pool_mut().add(conn) {
            Ok(id) => node.on_connection_added(id, now),
            Err(e) => warn!("could not pool {}: {}", request.addr, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::SocketAddr;

    use crate::mesh::core::NodeConfig;
    use crate::mesh::messages::SourceId;

    fn test_node(node_id: u8, max_conn_by_ip: usize) -> Node {
        Node::new(NodeConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: SourceId::from_bytes([node_id; 16]),
            max_conn_by_ip,
            ..NodeConfig::default()
        })
    }

    fn test_loop(node: &Node) -> NetworkEventLoop {
        let mut event_loop = NetworkEventLoop::new(node).unwrap();
        event_loop.set_poll_timeout(Duration::from_millis(20));
        event_loop
    }

    #[test]
    fn test_accept_registers_connection() {
        let mut node = test_node(1, 30);
        let mut event_loop = test_loop(&node);
        let addr = event_loop.local_addr().unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..5 {
            event_loop.run_once(&mut node).unwrap();
            if node.pool().len() == 1 {
                break;
            }
        }
        assert_eq!(1, node.pool().len());
        let conn = node.pool().iter().next().unwrap();
        assert!(conn.state().contains(ConnectionState::INITIALIZED));
        assert!(!conn.from_me());
    }

    #[test]
    fn test_admission_cap_closes_excess_connections() {
        let mut node = test_node(1, 1);
        let mut event_loop = test_loop(&node);
        let addr = event_loop.local_addr().unwrap();

        let mut first = std::net::TcpStream::connect(addr).unwrap();
        let mut second = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..10 {
            event_loop.run_once(&mut node).unwrap();
            if node.pool().len() >= 1 {
                break;
            }
        }
        // one admitted, the other closed outright
        event_loop.run_once(&mut node).unwrap();
        assert_eq!(1, node.pool().len());

        let mut closed = 0;
        for client in [&mut first, &mut second] {
            client
                .set_read_timeout(Some(Duration::from_millis(300)))
                .unwrap();
            let mut buf = [0u8; 1];
            if let Ok(0) = client.read(&mut buf) {
                closed += 1;
            }
        }
        assert_eq!(1, closed);
    }

    #[test]
    fn test_two_nodes_establish_over_the_wire() {
        let mut node_a = test_node(0xaa, 30);
        let mut loop_a = test_loop(&node_a);
        let addr_a = loop_a.local_addr().unwrap();

        let mut node_b = test_node(0xbb, 30);
        let mut loop_b = test_loop(&node_b);

        node_b.request_connect(addr_a, false);

        let mut both_active = false;
        for _ in 0..100 {
            loop_b.run_once(&mut node_b).unwrap();
            loop_a.run_once(&mut node_a).unwrap();
            let a_active = node_a.pool().iter().any(Connection::is_active);
            let b_active = node_b.pool().iter().any(Connection::is_active);
            if a_active && b_active {
                both_active = true;
                break;
            }
        }
        assert!(both_active, "handshake did not complete");

        let conn_b = node_b.pool().iter().next().unwrap();
        assert_eq!(
            Some(SourceId::from_bytes([0xaa; 16])),
            conn_b.peer_id()
        );
        let conn_a = node_a.pool().iter().next().unwrap();
        assert_eq!(
            Some(SourceId::from_bytes([0xbb; 16])),
            conn_a.peer_id()
        );
    }
}
