//! The node core: owns the connection pool, the alarm queue and the
//! per-network transaction services, and gives every parsed message
//! its meaning.
//!
//! The node never blocks and holds no reference back into the event
//! loop; the loop calls in with readiness facts (accepted, writable,
//! readable, closed) and the node answers with state changes, queued
//! frames, scheduled alarms and connection requests.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::mesh::alarms::{AlarmNext, AlarmQueue};
use crate::mesh::collections::{self, HashMap};
use crate::mesh::communication::channel::{new_inbox, InboxRx, InboxTx};
use crate::mesh::communication::{
    Connection, ConnectionId, HandshakeStatus, MessageHandler, PING_INTERVAL, PING_TIMEOUT,
};
use crate::mesh::crypto::hash::Digest;
use crate::mesh::error::*;
use crate::mesh::expiry::ExpiringSet;
use crate::mesh::messages::validator::MessageValidationSettings;
use crate::mesh::messages::versioning::{VersionManager, CURRENT_PROTOCOL_VERSION};
use crate::mesh::messages::{
    AckMessage, BlockConfirmationMessage, BlockHoldingMessage, BroadcastMessage, GetTxsMessage,
    HelloMessage, KeyMessage, Message, PingMessage, PongMessage, ProtocolError, SourceId,
    TxAssignMessage, TxCleanupMessage, TxEntry, TxMessage, TxServiceSyncMessage, TxsMessage,
    NULL_TX_SID,
};
use crate::mesh::communication::pool::ConnectionPool;
use crate::mesh::prng;
use crate::mesh::threadpool::ThreadPool;
use crate::mesh::transactions::{TransactionService, TransactionServiceConfig};

/// Reconnect delay for persistent peers that dropped.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// How long an outbound connection may take to reach
/// `ESTABLISHED` before it is torn down.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Reconnect attempts per peer IP before giving up.
pub const MAX_CONNECT_RETRIES: usize = 3;

/// Admitted connections per source IP.
pub const MAX_CONN_BY_IP: usize = 30;

/// Content bytes packed into one `txs` sync batch.
pub const TXS_MSG_SIZE: usize = 64_000;

/// Delay between consecutive `txs` sync batches.
pub const TX_SERVICE_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// How long relayed broadcast hashes are remembered for dedup.
pub const RELAYED_BLOCKS_EXPIRE_TIME: Duration = Duration::from_secs(6 * 60 * 60);

// coalesce key for the relayed-hash cleanup alarm
const CLEAN_RELAYED_HASHES_KEY: u64 = 1;

/// Represents a configuration used to bootstrap a `Node`.
pub struct NodeConfig {
    /// The address the node listens on.
    pub listen_addr: SocketAddr,
    /// The id this node introduces itself with.
    pub node_id: SourceId,
    /// The default network number of this node's connections.
    pub network_num: u32,
    /// Persistent peers to connect out to on startup.
    pub outbound_peers: Vec<SocketAddr>,
    /// Payload size caps enforced on every frame.
    pub validation: MessageValidationSettings,
    /// Time to live of short id assignments.
    pub sid_expire_time: Duration,
    /// Block confirmations before short ids are reclaimed.
    pub final_tx_confirmations_count: usize,
    /// Per-network byte budget for transaction contents.
    pub tx_content_memory_limit: usize,
    /// Worker threads for offloaded serialization work.
    pub worker_threads: usize,
    /// Admitted connections per source IP.
    pub max_conn_by_ip: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let tx_defaults = TransactionServiceConfig::default();
        NodeConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            node_id: SourceId::EMPTY,
            network_num: 1,
            outbound_peers: Vec::new(),
            validation: MessageValidationSettings::default(),
            sid_expire_time: tx_defaults.sid_expire_time,
            final_tx_confirmations_count: tx_defaults.final_tx_confirmations_count,
            tx_content_memory_limit: tx_defaults.tx_content_memory_limit,
            worker_threads: 1,
            max_conn_by_ip: MAX_CONN_BY_IP,
        }
    }
}

/// Deferred work tokens dispatched by the alarm queue.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Timer {
    /// Tear the connection down unless it established in time.
    ConnectionTimeout(ConnectionId),
    /// Send the periodic keepalive ping.
    Ping(ConnectionId),
    /// The pong for the outstanding ping never came.
    PongTimeout(ConnectionId),
    /// Reconnect to a dropped persistent peer.
    Retry { ip: IpAddr, port: u16 },
    /// Sweep expired short id assignments of one network.
    ExpireShortIds(u32),
    /// Deferred confirmation tracking of a routed block.
    TrackSeenShortIds {
        network_num: u32,
        block_hash: Digest,
        short_ids: Vec<u32>,
    },
    /// Send the next batch of a transaction service sync.
    SyncTxBatch {
        conn: ConnectionId,
        network_num: u32,
        sent: usize,
    },
    /// Expire remembered relayed broadcast hashes.
    CleanRelayedHashes,
}

/// An outbound connection the event loop should open.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectRequest {
    pub addr: SocketAddr,
    pub persistent: bool,
}

/// Results handed back to the loop by worker threads.
pub enum WorkerEvent {
    /// A worker finished framing bytes for a connection.
    FramesReady {
        conn: ConnectionId,
        frames: Vec<Vec<u8>>,
    },
}

/// A relay node: the orchestrator owning all loop-side state.
pub struct Node {
    config: NodeConfig,
    version_manager: VersionManager,
    pool: ConnectionPool,
    alarms: AlarmQueue<Timer>,
    // registrations made while the alarm queue itself is firing
    pending_alarms: Vec<(Duration, Timer)>,
    services: HashMap<u32, TransactionService>,
    workers: ThreadPool,
    worker_events: InboxRx<WorkerEvent>,
    worker_events_tx: InboxTx<WorkerEvent>,
    relayed_hashes: ExpiringSet<(Digest, u32)>,
    prng: prng::State,
    connection_requests: VecDeque<ConnectRequest>,
    retries_by_ip: HashMap<IpAddr, usize>,
    fatal_error: Option<Error>,
}

impl Node {
    // max no. of worker results parked between loop iterations
    const INBOX_BOUND: usize = 1024;

    pub fn new(config: NodeConfig) -> Self {
        let (worker_events_tx, worker_events) = new_inbox(Self::INBOX_BOUND);
        let workers = ThreadPool::new(config.worker_threads);
        let mut connection_requests = VecDeque::new();
        for addr in config.outbound_peers.iter().copied() {
            connection_requests.push_back(ConnectRequest {
                addr,
                persistent: true,
            });
        }
        Node {
            config,
            version_manager: VersionManager::new(),
            pool: ConnectionPool::new(),
            alarms: AlarmQueue::new(),
            pending_alarms: Vec::new(),
            services: collections::hash_map(),
            workers,
            worker_events,
            worker_events_tx,
            relayed_hashes: ExpiringSet::new(RELAYED_BLOCKS_EXPIRE_TIME),
            prng: prng::State::new(),
            connection_requests,
            retries_by_ip: collections::hash_map(),
            fatal_error: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn version_manager(&self) -> &VersionManager {
        &self.version_manager
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ConnectionPool {
        &mut self.pool
    }

    /// The transaction service of one network, created on first use.
    pub fn service_mut(&mut self, network_num: u32) -> &mut TransactionService {
        let config = TransactionServiceConfig {
            sid_expire_time: self.config.sid_expire_time,
            final_tx_confirmations_count: self.config.final_tx_confirmations_count,
            tx_content_memory_limit: self.config.tx_content_memory_limit,
        };
        self.services
            .entry(network_num)
            .or_insert_with(|| TransactionService::new(network_num, config))
    }

    pub fn service(&self, network_num: u32) -> Option<&TransactionService> {
        self.services.get(&network_num)
    }

    /// A handle workers use to report results back to the loop.
    pub fn worker_inbox(&self) -> InboxTx<WorkerEvent> {
        self.worker_events_tx.clone()
    }

    /// Applies every worker result parked in the inbox.
    pub fn drain_worker_events(&mut self) {
        for event in self.worker_events.drain() {
            match event {
                WorkerEvent::FramesReady { conn: id, frames } => {
                    let mut failure = None;
                    if let Some(conn) = self.pool.get_mut(id) {
                        for frame in frames {
                            if let Err(e) = conn.enqueue_frame(frame, false) {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    if let Some(e) = failure {
                        self.note_error(e);
                    }
                }
            }
        }
    }

    /// Queues an outbound connection for the loop to open.
    pub fn request_connect(&mut self, addr: SocketAddr, persistent: bool) {
        self.connection_requests
            .push_back(ConnectRequest { addr, persistent });
    }

    /// The next outbound connection the loop should open.
    pub fn pop_connection_request(&mut self) -> Option<ConnectRequest> {
        loop {
            let request = self.connection_requests.pop_front()?;
            if self.pool.has_connection(request.addr.ip(), request.addr.port()) {
                warn!("connection to {} already exists, skipping", request.addr);
                continue;
            }
            return Some(request);
        }
    }

    /// Bookkeeping for a connection that just entered the pool.
    pub fn on_connection_added(&mut self, id: ConnectionId, now: Instant) {
        self.alarms
            .register(CONNECTION_TIMEOUT, Timer::ConnectionTimeout(id), now);
    }

    /// The socket finished connecting (or was accepted); outbound
    /// sides introduce themselves here.
    pub fn on_connection_initialized(&mut self, id: ConnectionId, _now: Instant) {
        let hello = Message::Hello(HelloMessage {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            network_num: self.config.network_num,
            node_id: self.config.node_id,
        });
        let vm = self.version_manager;
        if let Some(conn) = self.pool.get_mut(id) {
            conn.on_initialized();
            if conn.from_me() && !conn.hello_sent() {
                conn.mark_hello_sent();
                let result = conn.enqueue_msg(&vm, &hello, false);
                if let Err(e) = result {
                    self.note_error(e);
                }
            }
        }
    }

    /// Runs the framed-message state machine of one connection
    /// against this node's handlers.
    pub fn process_connection(&mut self, id: ConnectionId) -> Result<()> {
        let mut conn = match self.pool.take(id) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let vm = self.version_manager;
        let settings = self.config.validation;
        let result = conn.process_message(&vm, settings, self);
        self.pool.put_back(conn);
        result
    }

    /// Ids of connections awaiting teardown.
    pub fn marked_connections(&self) -> Vec<ConnectionId> {
        self.pool
            .iter()
            .filter(|conn| conn.is_marked_for_close())
            .map(|conn| conn.id())
            .collect()
    }

    /// Schedules a reconnect if the lost connection merits one.
    pub fn on_connection_destroyed(&mut self, conn: &Connection, now: Instant) {
        info!(
            "connection {} to {}:{} destroyed",
            conn.id(),
            conn.peer_ip(),
            conn.peer_port()
        );
        if conn.is_persistent() {
            debug!("scheduling reconnect to {}:{}", conn.peer_ip(), conn.peer_port());
            self.alarms.register(
                RETRY_INTERVAL,
                Timer::Retry {
                    ip: conn.peer_ip(),
                    port: conn.peer_port(),
                },
                now,
            );
        }
    }

    /// Delay until the next pending alarm.
    pub fn time_to_next_alarm(&mut self, now: Instant) -> Option<Duration> {
        self.alarms.time_to_next(now).map(|(_, delay)| delay)
    }

    /// Fires all due alarms; `force_fire_one` fires the earliest
    /// alarm even if its time has not quite come, used when the
    /// poll woke on timeout with no events.
    pub fn fire_alarms(&mut self, now: Instant, force_fire_one: bool) -> Option<Duration> {
        let mut alarms = std::mem::take(&mut self.alarms);
        alarms.fire_ready(now, force_fire_one, |token| self.dispatch_timer(token, now));
        self.alarms = alarms;
        let pending = std::mem::take(&mut self.pending_alarms);
        for (delay, token) in pending {
            self.alarms.register(delay, token, now);
        }
        self.time_to_next_alarm(now)
    }

    /// An error the loop must stop for, if one occurred.
    pub fn take_fatal(&mut self) -> Option<Error> {
        self.fatal_error.take()
    }

    fn note_error(&mut self, e: Error) {
        if e.is_fatal() {
            self.fatal_error = Some(e);
        } else {
            warn!("i/o failure: {}", e);
        }
    }

    fn dispatch_timer(&mut self, token: &Timer, now: Instant) -> AlarmNext {
        match token {
            Timer::ConnectionTimeout(id) => {
                if let Some(conn) = self.pool.get_mut(*id) {
                    if !conn.is_active() && !conn.is_marked_for_close() {
                        warn!("connection {} did not establish in time, closing", id);
                        conn.mark_for_close();
                    }
                }
                AlarmNext::Cancel
            }
            Timer::Ping(id) => self.send_ping(*id),
            Timer::PongTimeout(id) => {
                if let Some(conn) = self.pool.get_mut(*id) {
                    if conn.outstanding_ping().is_some() {
                        warn!("connection {} missed its pong, closing", id);
                        conn.mark_for_close();
                    }
                }
                AlarmNext::Cancel
            }
            Timer::Retry { ip, port } => {
                let retries = self.retries_by_ip.entry(*ip).or_insert(0);
                if *retries >= MAX_CONNECT_RETRIES {
                    debug!("not retrying {}:{}, too many attempts", ip, port);
                    self.retries_by_ip.remove(ip);
                } else {
                    *retries += 1;
                    debug!("retrying connection to {}:{}", ip, port);
                    self.request_connect(SocketAddr::new(*ip, *port), true);
                }
                AlarmNext::Cancel
            }
            Timer::ExpireShortIds(network_num) => {
                match self.services.get_mut(network_num) {
                    Some(service) => match service.expire_old_assignments(now) {
                        Some(delay) => AlarmNext::Reschedule(delay),
                        None => AlarmNext::Cancel,
                    },
                    None => AlarmNext::Cancel,
                }
            }
            Timer::TrackSeenShortIds {
                network_num,
                block_hash,
                short_ids,
            } => {
                if let Some(service) = self.services.get_mut(network_num) {
                    service.track_seen_short_ids(*block_hash, short_ids.clone());
                }
                AlarmNext::Cancel
            }
            Timer::SyncTxBatch {
                conn,
                network_num,
                sent,
            } => self.send_sync_batch(*conn, *network_num, *sent),
            Timer::CleanRelayedHashes => {
                self.relayed_hashes.cleanup(now);
                if self.relayed_hashes.is_empty() {
                    AlarmNext::Cancel
                } else {
                    AlarmNext::Reschedule(self.relayed_hashes.expiration_time())
                }
            }
        }
    }

    fn send_ping(&mut self, id: ConnectionId) -> AlarmNext {
        let nonce = self.prng.next_nonce();
        let vm = self.version_manager;
        let conn = match self.pool.get_mut(id) {
            Some(conn) => conn,
            None => return AlarmNext::Cancel,
        };
        if !conn.is_active() {
            return AlarmNext::Cancel;
        }
        conn.begin_ping(nonce);
        let result = conn.enqueue_msg(&vm, &Message::Ping(PingMessage { nonce }), false);
        if let Err(e) = result {
            self.note_error(e);
            return AlarmNext::Cancel;
        }
        self.pending_alarms
            .push((PING_TIMEOUT, Timer::PongTimeout(id)));
        AlarmNext::Reschedule(PING_INTERVAL)
    }

    fn send_sync_batch(&mut self, id: ConnectionId, network_num: u32, sent: usize) -> AlarmNext {
        let service = match self.services.get(&network_num) {
            Some(service) => service,
            None => return AlarmNext::Cancel,
        };
        let snapshot = match service.thread_safe_iter_timestamped_transactions_from_oldest(None) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("could not snapshot network {} for sync: {}", network_num, e);
                return AlarmNext::Cancel;
            }
        };

        let mut batch = Vec::new();
        let mut batch_bytes = 0;
        let mut taken = 0;
        for &(short_id, hash, _) in snapshot.iter().skip(sent) {
            if batch_bytes > TXS_MSG_SIZE {
                break;
            }
            taken += 1;
            let contents = service
                .get_transaction_by_hash(&hash)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            batch_bytes += contents.len();
            batch.push(TxEntry {
                short_id,
                hash,
                contents,
            });
        }
        if batch.is_empty() {
            return AlarmNext::Cancel;
        }

        let version = self
            .pool
            .get(id)
            .and_then(Connection::protocol_version)
            .unwrap_or(CURRENT_PROTOCOL_VERSION);
        let factory = match self.version_manager.factory_for_version(version) {
            Ok(factory) => factory,
            Err(_) => return AlarmNext::Cancel,
        };
        // serialization of a large batch is the heavy part; hand it
        // to the workers and join for the result
        let msg = Message::Txs(TxsMessage { txs: batch });
        let frame = match self.workers.execute_join(move || factory.build(&msg)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("sync batch serialization failed: {}", e);
                return AlarmNext::Cancel;
            }
        };

        match self.pool.get_mut(id) {
            Some(conn) => {
                let result = conn.enqueue_frame(frame, false);
                if let Err(e) = result {
                    self.note_error(e);
                    return AlarmNext::Cancel;
                }
            }
            None => return AlarmNext::Cancel,
        }

        if sent + taken < snapshot.len() {
            self.pending_alarms.push((
                TX_SERVICE_SYNC_INTERVAL,
                Timer::SyncTxBatch {
                    conn: id,
                    network_num,
                    sent: sent + taken,
                },
            ));
        }
        AlarmNext::Cancel
    }

    fn on_connection_established(&mut self, conn: &mut Connection) {
        info!(
            "connection {} to {}:{} established",
            conn.id(),
            conn.peer_ip(),
            conn.peer_port()
        );
        self.alarms.register(
            PING_INTERVAL,
            Timer::Ping(conn.id()),
            Instant::now(),
        );
    }

    /// Relays a broadcast family message to every other active
    /// connection of its network.
    fn relay_to_network(
        &mut self,
        from: ConnectionId,
        network_num: u32,
        msg: &Message,
        prepend: bool,
    ) {
        let vm = self.version_manager;
        let mut failures = Vec::new();
        for conn in self.pool.iter_mut() {
            if conn.id() == from || !conn.is_active() || conn.network_num() != network_num {
                continue;
            }
            if let Err(e) = conn.enqueue_msg(&vm, msg, prepend) {
                failures.push(e);
            }
        }
        for e in failures {
            self.note_error(e);
        }
    }

    fn msg_hello(&mut self, conn: &mut Connection, m: HelloMessage) {
        let vm = self.version_manager;
        let status = conn.on_hello_received(m.node_id, m.network_num);
        self.pool.index_peer_id(conn.id(), m.node_id);

        let duplicates: Vec<ConnectionId> = self
            .pool
            .ids_by_peer_id(&m.node_id)
            .iter()
            .copied()
            .filter(|other| *other != conn.id())
            .collect();
        if !duplicates.is_empty() {
            if conn.from_me() {
                info!(
                    "duplicate connection to peer {}, closing this one",
                    m.node_id
                );
                conn.mark_for_close();
                return;
            }
            // inbound wins: the peer reconnected, drop the old one
            for other in duplicates {
                info!("peer {} reconnected, closing connection {}", m.node_id, other);
                if let Some(other) = self.pool.get_mut(other) {
                    other.mark_for_close();
                }
            }
        }

        // accepted connections introduce themselves upon the
        // peer's hello
        if !conn.from_me() && !conn.hello_sent() {
            conn.mark_hello_sent();
            let hello = Message::Hello(HelloMessage {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                network_num: self.config.network_num,
                node_id: self.config.node_id,
            });
            if let Err(e) = conn.enqueue_msg(&vm, &hello, false) {
                self.note_error(e);
                return;
            }
        }
        if let Err(e) = conn.enqueue_msg(&vm, &Message::Ack(AckMessage), false) {
            self.note_error(e);
            return;
        }
        if status == HandshakeStatus::Established {
            self.on_connection_established(conn);
        }
    }

    fn msg_ack(&mut self, conn: &mut Connection) {
        if conn.on_ack_received() == HandshakeStatus::Established {
            self.on_connection_established(conn);
        }
    }

    fn msg_ping(&mut self, conn: &mut Connection, m: PingMessage) {
        let vm = self.version_manager;
        let result = conn.enqueue_msg(&vm, &Message::Pong(PongMessage { nonce: m.nonce }), false);
        if let Err(e) = result {
            self.note_error(e);
        }
    }

    fn msg_pong(&mut self, conn: &mut Connection, m: PongMessage) {
        if !conn.on_pong(m.nonce) {
            debug!(
                "connection {} sent a pong for no outstanding ping",
                conn.id()
            );
        }
    }

    fn msg_broadcast(&mut self, conn: &mut Connection, m: BroadcastMessage) {
        let network_num = m.header.network_num;
        if self.first_sighting(m.header.message_hash, network_num) {
            self.relay_to_network(conn.id(), network_num, &Message::Broadcast(m), true);
        }
    }

    fn msg_key(&mut self, conn: &mut Connection, m: KeyMessage) {
        let network_num = m.header.network_num;
        if self.first_sighting(m.header.message_hash, network_num) {
            self.relay_to_network(conn.id(), network_num, &Message::Key(m), true);
        }
    }

    fn msg_block_hold(&mut self, conn: &mut Connection, m: BlockHoldingMessage) {
        let network_num = m.header.network_num;
        if self.first_sighting(m.header.message_hash, network_num) {
            self.relay_to_network(conn.id(), network_num, &Message::BlockHold(m), false);
        }
    }

    fn msg_tx(&mut self, conn: &mut Connection, m: TxMessage, now: Instant) {
        let network_num = m.header.network_num;
        let tx_hash = m.header.message_hash;
        {
            let mut alarms = std::mem::take(&mut self.alarms);
            let service = self.service_mut(network_num);
            if m.short_id != NULL_TX_SID {
                service.assign_short_id(&mut alarms, &tx_hash, m.short_id, now);
            }
            if !m.contents.is_empty() {
                service.set_transaction_contents(&tx_hash, m.contents.clone());
            }
            self.alarms = alarms;
        }
        if self.first_sighting(tx_hash, network_num) {
            self.relay_to_network(conn.id(), network_num, &Message::Tx(m), false);
        }
    }

    fn msg_txs(&mut self, conn: &Connection, m: TxsMessage, now: Instant) {
        let network_num = conn.network_num();
        let mut alarms = std::mem::take(&mut self.alarms);
        for entry in m.txs {
            let service = self.service_mut(network_num);
            if entry.short_id != NULL_TX_SID {
                service.assign_short_id(&mut alarms, &entry.hash, entry.short_id, now);
            }
            if !entry.contents.is_empty() {
                service.set_transaction_contents(&entry.hash, entry.contents);
            }
        }
        self.alarms = alarms;
    }

    fn msg_get_txs(&mut self, conn: &mut Connection, m: GetTxsMessage) {
        let vm = self.version_manager;
        let service = self.service_mut(conn.network_num());
        let result = service.get_transactions(&m.short_ids);
        let txs = result
            .found
            .into_iter()
            .filter_map(|info| {
                Some(TxEntry {
                    short_id: info.short_id,
                    hash: info.hash?,
                    contents: info.contents?,
                })
            })
            .collect();
        let reply = Message::Txs(TxsMessage { txs });
        if let Err(e) = conn.enqueue_msg(&vm, &reply, false) {
            self.note_error(e);
        }
    }

    fn msg_tx_assign(&mut self, conn: &mut Connection, m: TxAssignMessage, now: Instant) {
        let network_num = conn.network_num();
        let mut alarms = std::mem::take(&mut self.alarms);
        self.service_mut(network_num)
            .assign_short_id(&mut alarms, &m.tx_hash, m.short_id, now);
        self.alarms = alarms;
    }

    fn msg_tx_service_sync(&mut self, conn: &mut Connection, m: TxServiceSyncMessage, now: Instant) {
        // answered in batches so a large snapshot cannot stall the
        // loop; the first batch goes out on the next alarm pass
        self.alarms.register(
            Duration::ZERO,
            Timer::SyncTxBatch {
                conn: conn.id(),
                network_num: m.network_num,
                sent: 0,
            },
            now,
        );
    }

    fn msg_block_confirmation(&mut self, m: BlockConfirmationMessage, now: Instant) {
        let network_num = m.header.network_num;
        let mut alarms = std::mem::take(&mut self.alarms);
        let service = self.service_mut(network_num);
        service.track_seen_short_ids_delayed(&mut alarms, m.header.message_hash, m.short_ids, now);
        self.alarms = alarms;
    }

    fn msg_tx_cleanup(&mut self, m: TxCleanupMessage) {
        let service = self.service_mut(m.header.network_num);
        for short_id in m.short_ids {
            service.remove_transaction_by_short_id(short_id, true);
        }
        for tx_hash in m.tx_hashes {
            service.remove_transaction_by_tx_hash(&tx_hash);
        }
        service.on_block_cleaned_up(&m.header.message_hash);
    }

    /// Remembers a broadcast hash; returns whether it was new, and
    /// keeps the cleanup alarm alive.
    fn first_sighting(&mut self, hash: Digest, network_num: u32) -> bool {
        let now = Instant::now();
        let fresh = self.relayed_hashes.add((hash, network_num), now);
        if fresh {
            let ttl = self.relayed_hashes.expiration_time();
            self.alarms.register_approx(
                2 * ttl,
                ttl,
                CLEAN_RELAYED_HASHES_KEY,
                Timer::CleanRelayedHashes,
                now,
            );
        }
        fresh
    }
}

impl MessageHandler for Node {
    /// Gives a parsed message its node level meaning.
    fn handle(
        &mut self,
        conn: &mut Connection,
        msg: Message,
    ) -> std::result::Result<(), ProtocolError> {
        let now = Instant::now();
        match msg {
            Message::Hello(m) => {
                if !self.version_manager.is_protocol_supported(m.protocol_version) {
                    warn!(
                        "connection {} advertises unsupported protocol version {}, closing",
                        conn.id(),
                        m.protocol_version
                    );
                    conn.mark_for_close();
                    return Ok(());
                }
                self.msg_hello(conn, m);
            }
            Message::Ack(_) => self.msg_ack(conn),
            Message::Ping(m) => self.msg_ping(conn, m),
            Message::Pong(m) => self.msg_pong(conn, m),
            Message::Broadcast(m) => self.msg_broadcast(conn, m),
            Message::Tx(m) => self.msg_tx(conn, m, now),
            Message::Txs(m) => self.msg_txs(conn, m, now),
            Message::Key(m) => self.msg_key(conn, m),
            Message::BlockHold(m) => self.msg_block_hold(conn, m),
            Message::GetTxs(m) => self.msg_get_txs(conn, m),
            Message::TxAssign(m) => self.msg_tx_assign(conn, m, now),
            Message::TxServiceSync(m) => self.msg_tx_service_sync(conn, m, now),
            Message::BlockConfirmation(m) => self.msg_block_confirmation(m, now),
            Message::TxCleanup(m) => self.msg_tx_cleanup(m),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    use byteorder::{ByteOrder, LittleEndian};

    use crate::mesh::communication::socket;
    use crate::mesh::crypto::hash::digest;
    use crate::mesh::messages::factory::MessageFactory;
    use crate::mesh::messages::{BroadcastHeader, HEADER_LENGTH};
    use crate::mesh::transactions::CLEAN_UP_SEEN_SHORT_IDS_DELAY;

    const SEC: Duration = Duration::from_secs(1);

    fn test_node() -> Node {
        Node::new(NodeConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: SourceId::from_bytes([1; 16]),
            ..NodeConfig::default()
        })
    }

    /// Adds a pooled connection backed by a real loopback socket;
    /// returns the peer end so tests can observe the wire.
    fn add_peer(node: &mut Node, from_me: bool, persistent: bool) -> (ConnectionId, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = socket::connect(addr).unwrap();
        let id = node.pool_mut().reserve_id();
        let network_num = node.config().network_num;
        let conn = Connection::new(id, sock, addr.ip(), addr.port(), from_me, persistent, network_num);
        node.pool_mut().add(conn).unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (id, peer)
    }

    fn deliver(node: &mut Node, id: ConnectionId, msg: Message) {
        let mut conn = node.pool_mut().take(id).unwrap();
        node.handle(&mut conn, msg).unwrap();
        node.pool_mut().put_back(conn);
    }

    fn establish(node: &mut Node, id: ConnectionId, peer_id: SourceId) {
        {
            let conn = node.pool_mut().get_mut(id).unwrap();
            conn.set_protocol_version(CURRENT_PROTOCOL_VERSION);
            conn.on_initialized();
        }
        deliver(
            node,
            id,
            Message::Hello(HelloMessage {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                network_num: 1,
                node_id: peer_id,
            }),
        );
        deliver(node, id, Message::Ack(AckMessage));
        assert!(node.pool().get(id).unwrap().is_active());
    }

    fn read_frame(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut header = [0u8; HEADER_LENGTH];
        stream.read_exact(&mut header).unwrap();
        let payload_len = LittleEndian::read_u32(&header[16..]) as usize;
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    fn read_message(stream: &mut std::net::TcpStream) -> Message {
        MessageFactory::current()
            .create_from_buffer(&read_frame(stream))
            .unwrap()
    }

    #[test]
    fn test_outbound_handshake_sends_hello_then_establishes() {
        let mut node = test_node();
        let (id, mut peer) = add_peer(&mut node, true, false);
        let now = Instant::now();
        node.on_connection_added(id, now);
        node.on_connection_initialized(id, now);

        match read_message(&mut peer) {
            Message::Hello(hello) => {
                assert_eq!(CURRENT_PROTOCOL_VERSION, hello.protocol_version);
                assert_eq!(node.config().node_id, hello.node_id);
            }
            other => panic!("expected a hello, got {:?}", other),
        }

        // peer answers hello; we ack and, on its ack, establish
        deliver(
            &mut node,
            id,
            Message::Hello(HelloMessage {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                network_num: 1,
                node_id: SourceId::from_bytes([2; 16]),
            }),
        );
        match read_message(&mut peer) {
            Message::Ack(_) => (),
            other => panic!("expected an ack, got {:?}", other),
        }
        deliver(&mut node, id, Message::Ack(AckMessage));
        assert!(node.pool().get(id).unwrap().is_active());

        // the keepalive ping is now scheduled
        let mut fired = Vec::new();
        let mut alarms = std::mem::take(&mut node.alarms);
        alarms.fire_ready(Instant::now() + PING_INTERVAL + SEC, false, |t| {
            fired.push(t.clone());
            AlarmNext::Cancel
        });
        assert!(fired.iter().any(|t| matches!(t, Timer::Ping(other) if *other == id)));
    }

    #[test]
    fn test_duplicate_peer_outbound_closes_itself() {
        let mut node = test_node();
        let peer_id = SourceId::from_bytes([7; 16]);
        let (first, _peer1) = add_peer(&mut node, true, false);
        establish(&mut node, first, peer_id);

        let (second, _peer2) = add_peer(&mut node, true, false);
        {
            let conn = node.pool_mut().get_mut(second).unwrap();
            conn.set_protocol_version(CURRENT_PROTOCOL_VERSION);
            conn.on_initialized();
        }
        deliver(
            &mut node,
            second,
            Message::Hello(HelloMessage {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                network_num: 1,
                node_id: peer_id,
            }),
        );
        assert!(node.pool().get(second).unwrap().is_marked_for_close());
        assert!(node.pool().get(first).unwrap().is_active());
    }

    #[test]
    fn test_duplicate_peer_inbound_closes_the_other() {
        let mut node = test_node();
        let peer_id = SourceId::from_bytes([7; 16]);
        let (first, _peer1) = add_peer(&mut node, true, false);
        establish(&mut node, first, peer_id);

        let (second, _peer2) = add_peer(&mut node, false, false);
        {
            let conn = node.pool_mut().get_mut(second).unwrap();
            conn.set_protocol_version(CURRENT_PROTOCOL_VERSION);
            conn.on_initialized();
        }
        deliver(
            &mut node,
            second,
            Message::Hello(HelloMessage {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                network_num: 1,
                node_id: peer_id,
            }),
        );
        assert!(node.pool().get(first).unwrap().is_marked_for_close());
        assert!(!node.pool().get(second).unwrap().is_marked_for_close());
    }

    #[test]
    fn test_ping_pong_keepalive() {
        let mut node = test_node();
        let (id, mut peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));
        // skip the hello/ack the handshake wrote
        let _ = read_message(&mut peer);

        let now = Instant::now();
        node.fire_alarms(now + PING_INTERVAL + SEC, false);
        assert!(node.pool().get(id).unwrap().outstanding_ping().is_some());
        let nonce = match read_message(&mut peer) {
            Message::Ping(ping) => ping.nonce,
            other => panic!("expected a ping, got {:?}", other),
        };

        deliver(&mut node, id, Message::Pong(PongMessage { nonce }));
        assert!(node.pool().get(id).unwrap().outstanding_ping().is_none());

        // the pong timeout passes without incident
        node.fire_alarms(now + PING_INTERVAL + PING_TIMEOUT + 2 * SEC, false);
        assert!(!node.pool().get(id).unwrap().is_marked_for_close());
    }

    #[test]
    fn test_missing_pong_closes_connection() {
        let mut node = test_node();
        let (id, _peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));

        let now = Instant::now();
        node.fire_alarms(now + PING_INTERVAL + SEC, false);
        node.fire_alarms(now + PING_INTERVAL + PING_TIMEOUT + 2 * SEC, false);
        assert!(node.pool().get(id).unwrap().is_marked_for_close());
    }

    #[test]
    fn test_persistent_connection_schedules_one_reconnect() {
        let mut node = test_node();
        let (id, _peer) = add_peer(&mut node, true, true);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));
        let addr = {
            let conn = node.pool().get(id).unwrap();
            SocketAddr::new(conn.peer_ip(), conn.peer_port())
        };

        node.pool_mut().get_mut(id).unwrap().mark_for_close();
        let now = Instant::now();
        for id in node.marked_connections() {
            let conn = node.pool_mut().delete(id).unwrap();
            node.on_connection_destroyed(&conn, now);
        }

        // nothing to connect yet; the retry fires RETRY_INTERVAL later
        assert_eq!(None, node.pop_connection_request());
        node.fire_alarms(now + RETRY_INTERVAL + SEC, false);
        let request = node.pop_connection_request().unwrap();
        assert_eq!(addr, request.addr);
        assert!(request.persistent);
        assert_eq!(None, node.pop_connection_request());
    }

    #[test]
    fn test_tx_message_updates_service_and_relays_once() {
        let mut node = test_node();
        let (source, mut _peer1) = add_peer(&mut node, true, false);
        establish(&mut node, source, SourceId::from_bytes([3; 16]));
        let (other, mut peer2) = add_peer(&mut node, true, false);
        establish(&mut node, other, SourceId::from_bytes([4; 16]));
        let _ = read_message(&mut peer2);

        let tx_hash = digest(b"tx");
        let tx = TxMessage {
            header: BroadcastHeader {
                message_hash: tx_hash,
                network_num: 1,
                source_id: SourceId::from_bytes([3; 16]),
            },
            short_id: 9,
            contents: vec![1, 2, 3],
        };
        deliver(&mut node, source, Message::Tx(tx.clone()));

        let service = node.service(1).unwrap();
        assert!(service.has_short_id(9));
        assert_eq!(Some(&[1u8, 2, 3][..]), service.get_transaction_by_hash(&tx_hash));

        match read_message(&mut peer2) {
            Message::Tx(relayed) => assert_eq!(tx, relayed),
            other => panic!("expected a relayed tx, got {:?}", other),
        }

        // the same hash is not relayed twice
        deliver(&mut node, source, Message::Tx(tx));
        peer2
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut scratch = [0u8; 1];
        assert!(peer2.read_exact(&mut scratch).is_err());
    }

    #[test]
    fn test_get_txs_replies_with_known_transactions() {
        let mut node = test_node();
        let (id, mut peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));
        let _ = read_message(&mut peer);

        let tx_hash = digest(b"known");
        deliver(
            &mut node,
            id,
            Message::TxAssign(TxAssignMessage {
                tx_hash,
                short_id: 5,
            }),
        );
        node.service_mut(1).set_transaction_contents(&tx_hash, vec![8, 8]);

        deliver(
            &mut node,
            id,
            Message::GetTxs(GetTxsMessage {
                short_ids: vec![5, 77],
            }),
        );
        match read_message(&mut peer) {
            Message::Txs(reply) => {
                assert_eq!(1, reply.txs.len());
                assert_eq!(5, reply.txs[0].short_id);
                assert_eq!(tx_hash, reply.txs[0].hash);
                assert_eq!(vec![8, 8], reply.txs[0].contents);
            }
            other => panic!("expected txs, got {:?}", other),
        }
    }

    #[test]
    fn test_block_confirmation_tracks_after_delay() {
        let mut node = test_node();
        let (id, _peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));

        let block_hash = digest(b"block");
        deliver(
            &mut node,
            id,
            Message::BlockConfirmation(BlockConfirmationMessage {
                header: BroadcastHeader {
                    message_hash: block_hash,
                    network_num: 1,
                    source_id: SourceId::EMPTY,
                },
                short_ids: vec![10, 11],
                tx_hashes: Vec::new(),
            }),
        );
        assert_eq!(0, node.service(1).unwrap().tracked_block_count());

        node.fire_alarms(Instant::now() + CLEAN_UP_SEEN_SHORT_IDS_DELAY + SEC, false);
        assert_eq!(1, node.service(1).unwrap().tracked_block_count());
    }

    #[test]
    fn test_tx_cleanup_removes_state() {
        let mut node = test_node();
        let (id, _peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));

        let tx_hash = digest(b"doomed");
        deliver(
            &mut node,
            id,
            Message::TxAssign(TxAssignMessage {
                tx_hash,
                short_id: 44,
            }),
        );
        assert!(node.service(1).unwrap().has_short_id(44));

        deliver(
            &mut node,
            id,
            Message::TxCleanup(TxCleanupMessage::new(
                1,
                SourceId::EMPTY,
                vec![44],
                vec![tx_hash],
            )),
        );
        let service = node.service(1).unwrap();
        assert!(!service.has_short_id(44));
        assert!(!service.has_transaction_short_id(&tx_hash));
    }

    #[test]
    fn test_tx_service_sync_sends_batches() {
        let mut node = test_node();
        let (id, mut peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));
        let _ = read_message(&mut peer);

        let now = Instant::now();
        for (i, name) in [&b"s0"[..], &b"s1"[..]].iter().enumerate() {
            let tx_hash = digest(name);
            let mut alarms = std::mem::take(&mut node.alarms);
            let service = node.service_mut(1);
            service.assign_short_id(&mut alarms, &tx_hash, (i + 1) as u32, now);
            service.set_transaction_contents(&tx_hash, vec![i as u8; 4]);
            node.alarms = alarms;
        }

        deliver(
            &mut node,
            id,
            Message::TxServiceSync(TxServiceSyncMessage { network_num: 1 }),
        );
        node.fire_alarms(Instant::now() + SEC, false);

        match read_message(&mut peer) {
            Message::Txs(batch) => {
                let mut sids: Vec<u32> = batch.txs.iter().map(|tx| tx.short_id).collect();
                sids.sort_unstable();
                assert_eq!(vec![1, 2], sids);
            }
            other => panic!("expected a txs batch, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_inbox_frames_reach_the_wire() {
        let mut node = test_node();
        let (id, mut peer) = add_peer(&mut node, true, false);
        establish(&mut node, id, SourceId::from_bytes([3; 16]));
        let _ = read_message(&mut peer);

        let frame = MessageFactory::current().build(&Message::Ping(PingMessage { nonce: 99 }));
        let inbox = node.worker_inbox();
        inbox
            .send(WorkerEvent::FramesReady {
                conn: id,
                frames: vec![frame],
            })
            .unwrap();
        node.drain_worker_events();

        match read_message(&mut peer) {
            Message::Ping(ping) => assert_eq!(99, ping.nonce),
            other => panic!("expected the worker's ping, got {:?}", other),
        }
    }
}
