//! Per-peer connections: the handshake state machine, framed
//! message processing, and the throttle for misbehaving peers.

pub mod channel;
pub mod pool;
pub mod socket;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::mesh::buffers::{InputBuffer, OutputBuffer};
use crate::mesh::error::*;
use crate::mesh::messages::factory::HeaderPreview;
use crate::mesh::messages::validator::{MessageValidationSettings, MessageValidator};
use crate::mesh::messages::versioning::{VersionManager, CURRENT_PROTOCOL_VERSION};
use crate::mesh::messages::{Message, MessageKind, ProtocolError, SourceId};
use crate::mesh::communication::socket::SocketConnection;

/// Consecutive bad messages tolerated before a peer is cut off.
pub const MAX_BAD_MESSAGES: u32 = 3;

/// Interval between keepalive pings on an established connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for a pong before giving up on the peer.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Index of a connection in the pool; stable for the connection's
/// lifetime, like a file descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// The lifecycle bits of a connection.
///
/// `CONNECTING` is the all-zero initial state, so code always tests
/// positively for `INITIALIZED` rather than for `CONNECTING`.
/// `ESTABLISHED` is the conjunction of the three handshake bits and
/// is monotonic once reached; `MARK_FOR_CLOSE` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct ConnectionState(u8);

impl ConnectionState {
    pub const CONNECTING: ConnectionState = ConnectionState(0b0000_0000);
    pub const INITIALIZED: ConnectionState = ConnectionState(0b0000_0001);
    pub const HELLO_RECVD: ConnectionState = ConnectionState(0b0000_0010);
    pub const HELLO_ACKD: ConnectionState = ConnectionState(0b0000_0100);
    pub const ESTABLISHED: ConnectionState = ConnectionState(0b0000_0111);
    pub const MARK_FOR_CLOSE: ConnectionState = ConnectionState(0b0100_0000);

    pub fn contains(self, other: ConnectionState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ConnectionState) {
        self.0 |= other.0;
    }
}

/// Progress reported back from a handshake transition.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeStatus {
    /// More handshake messages are needed.
    InProgress,
    /// All three handshake bits are now set; the caller should emit
    /// its established hooks exactly once.
    Established,
}

/// Node level semantics of a fully parsed message.
///
/// The connection drives framing, validation and the throttle; what
/// a `tx` or `blockconf` actually *means* is the node's business.
pub trait MessageHandler {
    fn handle(
        &mut self,
        conn: &mut Connection,
        msg: Message,
    ) -> std::result::Result<(), ProtocolError>;
}

/// A peer connection: socket, buffers, handshake state and the
/// per-connection protocol version.
pub struct Connection {
    id: ConnectionId,
    socket: SocketConnection,
    peer_ip: IpAddr,
    peer_port: u16,
    peer_id: Option<SourceId>,
    from_me: bool,
    persistent: bool,
    state: ConnectionState,
    protocol_version: Option<u32>,
    network_num: u32,
    inputbuf: InputBuffer,
    outputbuf: OutputBuffer,
    bad_messages: u32,
    outstanding_ping: Option<u64>,
    hello_sent: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        socket: SocketConnection,
        peer_ip: IpAddr,
        peer_port: u16,
        from_me: bool,
        persistent: bool,
        network_num: u32,
    ) -> Self {
        Connection {
            id,
            socket,
            peer_ip,
            peer_port,
            peer_id: None,
            from_me,
            persistent,
            state: ConnectionState::CONNECTING,
            protocol_version: None,
            network_num,
            inputbuf: InputBuffer::new(),
            outputbuf: OutputBuffer::new(),
            bad_messages: 0,
            outstanding_ping: None,
            hello_sent: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn peer_id(&self) -> Option<SourceId> {
        self.peer_id
    }

    pub fn from_me(&self) -> bool {
        self.from_me
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn network_num(&self) -> u32 {
        self.network_num
    }

    pub fn protocol_version(&self) -> Option<u32> {
        self.protocol_version
    }

    pub fn socket_mut(&mut self) -> &mut SocketConnection {
        &mut self.socket
    }

    /// Established and not yet marked for close.
    pub fn is_active(&self) -> bool {
        self.state.contains(ConnectionState::ESTABLISHED)
            && !self.state.contains(ConnectionState::MARK_FOR_CLOSE)
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.state.contains(ConnectionState::MARK_FOR_CLOSE)
    }

    /// Marks the connection for close; processing and sending stop,
    /// teardown happens at the end of the loop iteration.
    pub fn mark_for_close(&mut self) {
        debug!("marking connection {} for close", self.id);
        self.state.insert(ConnectionState::MARK_FOR_CLOSE);
        self.socket.mark_for_close();
    }

    /// The socket finished its non-blocking connect (or was
    /// accepted); outbound connections send their hello here.
    pub fn on_initialized(&mut self) {
        self.state.insert(ConnectionState::INITIALIZED);
    }

    /// Records the peer's hello. The caller indexes the peer id in
    /// the pool and applies the duplicate-peer policy.
    pub fn on_hello_received(&mut self, peer_id: SourceId, network_num: u32) -> HandshakeStatus {
        let was_active = self.is_active();
        self.state.insert(ConnectionState::HELLO_RECVD);
        if peer_id.is_empty() {
            debug!("connection {} sent a hello without a peer id", self.id);
        }
        self.peer_id = Some(peer_id);
        self.network_num = network_num;
        self.handshake_status(was_active)
    }

    /// Records the peer's ack of our hello.
    pub fn on_ack_received(&mut self) -> HandshakeStatus {
        let was_active = self.is_active();
        self.state.insert(ConnectionState::HELLO_ACKD);
        self.handshake_status(was_active)
    }

    // `Established` is edge triggered so the caller runs its
    // established hooks exactly once
    fn handshake_status(&self, was_active: bool) -> HandshakeStatus {
        if !was_active && self.is_active() {
            HandshakeStatus::Established
        } else {
            HandshakeStatus::InProgress
        }
    }

    /// Whether our own hello already went out on this connection.
    pub fn hello_sent(&self) -> bool {
        self.hello_sent
    }

    pub fn mark_hello_sent(&mut self) {
        self.hello_sent = true;
    }

    /// Fixes the protocol version without probing, e.g. for
    /// outbound connections that already received a versioned hello.
    pub fn set_protocol_version(&mut self, version: u32) {
        self.protocol_version = Some(version);
    }

    /// Nonce of the ping awaiting its pong, if any.
    pub fn outstanding_ping(&self) -> Option<u64> {
        self.outstanding_ping
    }

    pub fn begin_ping(&mut self, nonce: u64) {
        self.outstanding_ping = Some(nonce);
    }

    /// Matches a pong against the outstanding ping.
    pub fn on_pong(&mut self, nonce: u64) -> bool {
        match self.outstanding_ping {
            Some(expected) if expected == nonce => {
                self.outstanding_ping = None;
                true
            }
            _ => false,
        }
    }

    /// Feeds bytes that arrived for this connection; the next
    /// `process_message` call consumes them frame by frame.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) {
        self.inputbuf.append(bytes);
    }

    /// Drains readable socket bytes into the input buffer.
    pub fn receive(&mut self, scratch: &mut [u8]) -> Result<()> {
        let result = self.socket.receive(scratch, &mut self.inputbuf);
        self.sync_socket_state();
        result
    }

    /// Flushes as much of the output buffer as the socket takes.
    pub fn send(&mut self) -> Result<usize> {
        let result = self.socket.send(&mut self.outputbuf);
        self.sync_socket_state();
        result
    }

    fn sync_socket_state(&mut self) {
        if self.socket.is_marked_for_close() {
            self.state.insert(ConnectionState::MARK_FOR_CLOSE);
        }
    }

    /// Frames `msg` for this connection's protocol version and
    /// queues it, nudging the socket.
    ///
    /// Connections marked for close silently drop the message.
    pub fn enqueue_msg(
        &mut self,
        version_manager: &VersionManager,
        msg: &Message,
        prepend: bool,
    ) -> Result<()> {
        let version = self.protocol_version.unwrap_or(CURRENT_PROTOCOL_VERSION);
        let factory = version_manager.factory_for_version(version)?;
        self.enqueue_frame(factory.build(msg), prepend)
    }

    /// Queues an already framed message, nudging the socket.
    pub fn enqueue_frame(&mut self, frame: Vec<u8>, prepend: bool) -> Result<()> {
        if self.is_marked_for_close() {
            return Ok(());
        }
        trace!("enqueued {} bytes on connection {}", frame.len(), self.id);
        if prepend {
            self.outputbuf.prepend(frame);
        } else {
            self.outputbuf.enqueue(frame);
        }
        // the socket may have become writable since the last event
        self.socket.set_can_send(true);
        self.send()?;
        Ok(())
    }

    /// Processes every complete frame sitting in the input buffer.
    ///
    /// On return the buffer is either empty or starts at the header
    /// of an incomplete frame.
    pub fn process_message<H: MessageHandler>(
        &mut self,
        version_manager: &VersionManager,
        settings: MessageValidationSettings,
        handler: &mut H,
    ) -> Result<()> {
        loop {
            if self.is_marked_for_close() {
                return Ok(());
            }

            let version = match self.probe_version(version_manager) {
                Some(version) => version,
                None => return Ok(()),
            };
            let factory = match version_manager.factory_for_version(version) {
                Ok(factory) => factory,
                Err(_) => {
                    warn!(
                        "connection {} speaks unsupported protocol version {}",
                        self.id, version
                    );
                    self.mark_for_close();
                    return Ok(());
                }
            };

            let preview = factory.peek_header(&mut self.inputbuf);
            let validator = MessageValidator::new(settings, version);
            if let Err(e) = validator.validate(&preview, factory.header_length(), &self.inputbuf) {
                if self.handle_protocol_error(&e, &preview, factory.header_length())? {
                    return Ok(());
                }
                continue;
            }

            let (label, payload_len) = match preview {
                HeaderPreview::Header {
                    is_full: true,
                    label,
                    payload_len,
                } => (label, payload_len),
                _ => return Ok(()),
            };

            // pre-handshake, only handshake messages may arrive
            let kind = MessageKind::from_label(&label);
            if !self.state.contains(ConnectionState::ESTABLISHED)
                && !kind.map(MessageKind::is_handshake).unwrap_or(false)
            {
                warn!(
                    "connection {} sent {:?} before the handshake completed, closing",
                    self.id, kind
                );
                self.mark_for_close();
                return Ok(());
            }

            let frame = self
                .inputbuf
                .remove(factory.header_length() + payload_len)
                .map_err(|e| e.swap_kind(ErrorKind::Communication))?;
            let msg = match factory.create_from_buffer(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    if self.handle_protocol_error(&e, &preview, factory.header_length())? {
                        return Ok(());
                    }
                    continue;
                }
            };

            trace!("connection {} processing {:?}", self.id, msg.kind());
            match handler.handle(self, msg) {
                Ok(()) => self.bad_messages = 0,
                Err(e) => {
                    if self.handle_protocol_error(&e, &preview, factory.header_length())? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn probe_version(&mut self, version_manager: &VersionManager) -> Option<u32> {
        if let Some(version) = self.protocol_version {
            return Some(version);
        }
        match version_manager.probe_protocol_version(&mut self.inputbuf) {
            Ok(None) => None,
            Ok(Some(version)) => {
                if !version_manager.is_protocol_supported(version) {
                    warn!(
                        "connection {} negotiated unsupported protocol version {}, closing",
                        self.id, version
                    );
                    self.mark_for_close();
                    return None;
                }
                debug!("connection {} speaks protocol version {}", self.id, version);
                self.protocol_version = Some(version);
                Some(version)
            }
            Err(e) => {
                warn!("connection {} version probe failed: {}, closing", self.id, e);
                self.mark_for_close();
                None
            }
        }
    }

    /// Applies the per-kind failure policy. Returns `true` when
    /// processing must stop (the connection was marked for close).
    fn handle_protocol_error(
        &mut self,
        e: &ProtocolError,
        preview: &HeaderPreview,
        header_length: usize,
    ) -> Result<bool> {
        match e {
            ProtocolError::PayloadLen(reason) => {
                warn!("connection {}: {}; closing", self.id, reason);
                self.mark_for_close();
                Ok(true)
            }
            ProtocolError::Parse(reason) => {
                debug!("connection {}: {}", self.id, reason);
                Ok(self.report_bad_message())
            }
            ProtocolError::Unauthorized(kind) => {
                warn!("connection {} sent unauthorized {:?}", self.id, kind);
                Ok(self.report_bad_message())
            }
            ProtocolError::Validation {
                full_message,
                reason,
            } => {
                warn!("connection {} failed validation: {}", self.id, reason);
                if !*full_message {
                    // an incomplete frame that fails validation can
                    // never realign the stream
                    self.mark_for_close();
                    return Ok(true);
                }
                self.clean_up_current_msg(preview, header_length)?;
                Ok(self.report_bad_message())
            }
        }
    }

    /// Drops the offending frame so the buffer realigns on the next
    /// header.
    fn clean_up_current_msg(
        &mut self,
        preview: &HeaderPreview,
        header_length: usize,
    ) -> Result<()> {
        if let HeaderPreview::Header { payload_len, .. } = preview {
            let frame_len = header_length + *payload_len;
            if self.inputbuf.len() >= frame_len {
                self.inputbuf
                    .remove(frame_len)
                    .map_err(|e| e.swap_kind(ErrorKind::Communication))?;
            }
        }
        Ok(())
    }

    /// Bumps the bad message counter; returns `true` once the
    /// connection got marked for close.
    fn report_bad_message(&mut self) -> bool {
        self.bad_messages += 1;
        if self.bad_messages >= MAX_BAD_MESSAGES {
            warn!("connection {} sent too many bad messages, closing", self.id);
            self.mark_for_close();
            true
        } else {
            false
        }
    }

    /// Closes the underlying socket after teardown.
    pub fn close(&mut self, force: bool) -> Result<()> {
        self.socket.close(force)
    }

    #[cfg(test)]
    pub(crate) fn inputbuf_mut(&mut self) -> &mut InputBuffer {
        &mut self.inputbuf
    }

    #[cfg(test)]
    pub(crate) fn outputbuf(&self) -> &OutputBuffer {
        &self.outputbuf
    }

    #[cfg(test)]
    pub(crate) fn bad_messages(&self) -> u32 {
        self.bad_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::communication::socket::{bind, connect, Listener};
    use crate::mesh::messages::factory::MessageFactory;
    use crate::mesh::messages::{AckMessage, PingMessage, PongMessage};

    struct Recorder {
        seen: Vec<MessageKind>,
        fail_next: Option<ProtocolError>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                seen: Vec::new(),
                fail_next: None,
            }
        }
    }

    impl MessageHandler for Recorder {
        fn handle(
            &mut self,
            _conn: &mut Connection,
            msg: Message,
        ) -> std::result::Result<(), ProtocolError> {
            match self.fail_next.take() {
                Some(e) => Err(e),
                None => {
                    self.seen.push(msg.kind());
                    Ok(())
                }
            }
        }
    }

    fn test_connection() -> (Connection, Listener) {
        let mut listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.inner_mut().local_addr().unwrap();
        let socket = connect(addr).unwrap();
        let conn = Connection::new(
            ConnectionId(1),
            socket,
            addr.ip(),
            addr.port(),
            true,
            false,
            1,
        );
        (conn, listener)
    }

    fn established(conn: &mut Connection) {
        conn.set_protocol_version(CURRENT_PROTOCOL_VERSION);
        conn.on_initialized();
        conn.on_hello_received(SourceId::from_bytes([1; 16]), 1);
        conn.on_ack_received();
    }

    fn process(conn: &mut Connection, handler: &mut Recorder) {
        let vm = VersionManager::new();
        conn.process_message(&vm, MessageValidationSettings::default(), handler)
            .unwrap();
    }

    #[test]
    fn test_handshake_reaches_established() {
        let (mut conn, _listener) = test_connection();
        assert!(!conn.is_active());
        conn.on_initialized();
        assert_eq!(
            HandshakeStatus::InProgress,
            conn.on_hello_received(SourceId::from_bytes([1; 16]), 7)
        );
        assert_eq!(HandshakeStatus::Established, conn.on_ack_received());
        assert!(conn.is_active());
        assert_eq!(7, conn.network_num());
        assert!(conn.state().contains(ConnectionState::ESTABLISHED));
    }

    #[test]
    fn test_mark_for_close_is_terminal() {
        let (mut conn, _listener) = test_connection();
        established(&mut conn);
        conn.mark_for_close();
        assert!(!conn.is_active());
        assert!(conn.is_marked_for_close());
    }

    #[test]
    fn test_three_invalid_frames_close_without_dispatch() {
        let (mut conn, _listener) = test_connection();
        established(&mut conn);
        let mut bad_frame = MessageFactory::current().build(&Message::Ack(AckMessage));
        bad_frame[0] = 0x00;
        for _ in 0..3 {
            conn.on_bytes_received(&bad_frame);
        }
        let mut handler = Recorder::new();
        process(&mut conn, &mut handler);
        assert!(conn.is_marked_for_close());
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn test_invalid_frame_then_valid_recovers() {
        let (mut conn, _listener) = test_connection();
        established(&mut conn);
        let factory = MessageFactory::current();
        let mut bad_frame = factory.build(&Message::Ack(AckMessage));
        bad_frame[0] = 0x00;
        // one bad frame stays well under the throttle
        conn.on_bytes_received(&bad_frame);
        let mut handler = Recorder::new();
        process(&mut conn, &mut handler);
        assert!(!conn.is_marked_for_close());
        assert_eq!(1, conn.bad_messages());

        conn.on_bytes_received(&factory.build(&Message::Ping(PingMessage { nonce: 3 })));
        process(&mut conn, &mut handler);
        assert_eq!(vec![MessageKind::Ping], handler.seen);
        assert_eq!(0, conn.bad_messages());
    }

    #[test]
    fn test_non_handshake_before_established_closes() {
        let (mut conn, _listener) = test_connection();
        conn.set_protocol_version(CURRENT_PROTOCOL_VERSION);
        let frame = MessageFactory::current().build(&Message::Ping(PingMessage { nonce: 1 }));
        conn.on_bytes_received(&frame);
        let mut handler = Recorder::new();
        process(&mut conn, &mut handler);
        assert!(conn.is_marked_for_close());
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let (mut conn, _listener) = test_connection();
        established(&mut conn);
        let frame = MessageFactory::current().build(&Message::Pong(PongMessage { nonce: 2 }));
        let (first, rest) = frame.split_at(frame.len() - 3);
        conn.on_bytes_received(first);
        let mut handler = Recorder::new();
        process(&mut conn, &mut handler);
        assert!(handler.seen.is_empty());
        assert!(!conn.is_marked_for_close());

        conn.on_bytes_received(rest);
        process(&mut conn, &mut handler);
        assert_eq!(vec![MessageKind::Pong], handler.seen);
        // input realigned on a message boundary
        assert!(conn.inputbuf_mut().is_empty());
    }

    #[test]
    fn test_version_probe_from_first_frame() {
        let (mut conn, _listener) = test_connection();
        let hello = Message::Hello(crate::mesh::messages::HelloMessage {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            network_num: 1,
            node_id: SourceId::from_bytes([5; 16]),
        });
        conn.on_bytes_received(&MessageFactory::current().build(&hello));
        let mut handler = Recorder::new();
        process(&mut conn, &mut handler);
        assert_eq!(Some(CURRENT_PROTOCOL_VERSION), conn.protocol_version());
        assert_eq!(vec![MessageKind::Hello], handler.seen);
    }

    #[test]
    fn test_unauthorized_message_throttles_but_continues() {
        let (mut conn, _listener) = test_connection();
        established(&mut conn);
        let factory = MessageFactory::current();
        conn.on_bytes_received(&factory.build(&Message::Ping(PingMessage { nonce: 1 })));
        conn.on_bytes_received(&factory.build(&Message::Pong(PongMessage { nonce: 2 })));
        let mut handler = Recorder::new();
        handler.fail_next = Some(ProtocolError::Unauthorized(MessageKind::Ping));
        process(&mut conn, &mut handler);
        assert!(!conn.is_marked_for_close());
        assert_eq!(1, conn.bad_messages());
        assert_eq!(vec![MessageKind::Pong], handler.seen);
    }

    #[test]
    fn test_enqueue_after_mark_for_close_drops() {
        let (mut conn, _listener) = test_connection();
        established(&mut conn);
        conn.mark_for_close();
        let vm = VersionManager::new();
        conn.enqueue_msg(&vm, &Message::Ping(PingMessage { nonce: 1 }), false)
            .unwrap();
        assert!(!conn.outputbuf().has_more_bytes());
    }

    #[test]
    fn test_pong_matching() {
        let (mut conn, _listener) = test_connection();
        conn.begin_ping(42);
        assert!(!conn.on_pong(41));
        assert_eq!(Some(42), conn.outstanding_ping());
        assert!(conn.on_pong(42));
        assert_eq!(None, conn.outstanding_ping());
    }
}
