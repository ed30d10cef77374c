//! The set of live connections, indexed three ways: by connection
//! id (a dense vector, like a file descriptor table), by remote
//! `(ip, port)` address, and by the peer id learnt on handshake.

use std::net::IpAddr;

use log::debug;

use crate::mesh::collections::{self, HashMap};
use crate::mesh::communication::{Connection, ConnectionId};
use crate::mesh::error::*;
use crate::mesh::messages::SourceId;

/// The dense id table grows in chunks of this many slots.
pub const ID_TABLE_CHUNK: usize = 5000;

/// All live connections of a node.
pub struct ConnectionPool {
    by_id: Vec<Option<Connection>>,
    by_address: HashMap<(IpAddr, u16), ConnectionId>,
    by_peer_id: HashMap<SourceId, Vec<ConnectionId>>,
    count_by_ip: HashMap<IpAddr, usize>,
    free_ids: Vec<usize>,
    next_id: usize,
    len: usize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            by_id: Vec::new(),
            by_address: collections::hash_map(),
            by_peer_id: collections::hash_map(),
            count_by_ip: collections::hash_map(),
            free_ids: Vec::new(),
            next_id: 0,
            len: 0,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hands out the id the next added connection must carry.
    pub fn reserve_id(&mut self) -> ConnectionId {
        match self.free_ids.pop() {
            Some(id) => ConnectionId(id),
            None => {
                let id = self.next_id;
                self.next_id += 1;
                ConnectionId(id)
            }
        }
    }

    /// Adds a connection under the id it carries.
    ///
    /// A second connection to the same `(ip, port)` is a programmer
    /// error and is rejected.
    pub fn add(&mut self, conn: Connection) -> Result<ConnectionId> {
        let id = conn.id();
        let address = (conn.peer_ip(), conn.peer_port());
        if self.by_address.contains_key(&address) {
            self.free_ids.push(id.index());
            return Err("Connection to this address already pooled")
                .wrapped(ErrorKind::CommunicationPool);
        }
        while self.by_id.len() <= id.index() {
            self.by_id
                .extend(std::iter::repeat_with(|| None).take(ID_TABLE_CHUNK));
        }
        debug_assert!(self.by_id[id.index()].is_none());
        *self.count_by_ip.entry(address.0).or_insert(0) += 1;
        self.by_address.insert(address, id);
        self.by_id[id.index()] = Some(conn);
        self.len += 1;
        Ok(id)
    }

    /// Records the peer id a connection learnt during its
    /// handshake.
    pub fn index_peer_id(&mut self, id: ConnectionId, peer_id: SourceId) {
        let ids = self.by_peer_id.entry(peer_id).or_insert_with(Vec::new);
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    pub fn has_connection(&self, ip: IpAddr, port: u16) -> bool {
        self.by_address.contains_key(&(ip, port))
    }

    pub fn id_by_address(&self, ip: IpAddr, port: u16) -> Option<ConnectionId> {
        self.by_address.get(&(ip, port)).copied()
    }

    /// Connections that introduced themselves with `peer_id`.
    pub fn ids_by_peer_id(&self, peer_id: &SourceId) -> &[ConnectionId] {
        self.by_peer_id
            .get(peer_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Live connections from this source address.
    pub fn num_connections_by_ip(&self, ip: IpAddr) -> usize {
        self.count_by_ip.get(&ip).copied().unwrap_or(0)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.by_id.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.by_id.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Temporarily removes a connection from its slot, e.g. while
    /// its messages are dispatched against the rest of the node.
    /// Pair with `put_back`.
    pub fn take(&mut self, id: ConnectionId) -> Option<Connection> {
        self.by_id.get_mut(id.index()).and_then(Option::take)
    }

    /// Returns a connection previously removed with `take`.
    pub fn put_back(&mut self, conn: Connection) {
        let idx = conn.id().index();
        debug_assert!(self.by_id[idx].is_none());
        self.by_id[idx] = Some(conn);
    }

    /// Removes a connection from every index.
    pub fn delete(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.by_id.get_mut(id.index()).and_then(Option::take)?;
        let address = (conn.peer_ip(), conn.peer_port());
        self.by_address.remove(&address);
        match self.count_by_ip.get_mut(&address.0) {
            Some(count) if *count <= 1 => {
                self.count_by_ip.remove(&address.0);
            }
            Some(count) => *count -= 1,
            None => (),
        }
        if let Some(peer_id) = conn.peer_id() {
            if let Some(ids) = self.by_peer_id.get_mut(&peer_id) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_peer_id.remove(&peer_id);
                }
            }
        }
        self.free_ids.push(id.index());
        self.len -= 1;
        debug!("removed connection {} from the pool", id);
        Some(conn)
    }

    /// Ids of all pooled connections, in id order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.by_id
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| ConnectionId(idx)))
            .collect()
    }

    /// Iterates pooled connections in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.by_id.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.by_id.iter_mut().filter_map(Option::as_mut)
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::communication::socket::{bind, connect, Listener};

    fn pooled_connection(pool: &mut ConnectionPool, port_hint: u16) -> (Connection, Listener) {
        let mut listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.inner_mut().local_addr().unwrap();
        let socket = connect(addr).unwrap();
        let conn = Connection::new(
            pool.reserve_id(),
            socket,
            addr.ip(),
            // fake the remote port so distinct test peers differ
            port_hint,
            false,
            false,
            1,
        );
        (conn, listener)
    }

    #[test]
    fn test_add_get_delete() {
        let mut pool = ConnectionPool::new();
        let (conn, _listener) = pooled_connection(&mut pool, 1000);
        let ip = conn.peer_ip();
        let id = pool.add(conn).unwrap();
        assert_eq!(1, pool.len());
        assert!(pool.has_connection(ip, 1000));
        assert_eq!(1, pool.num_connections_by_ip(ip));
        assert!(pool.get(id).is_some());

        pool.delete(id).unwrap();
        assert_eq!(0, pool.len());
        assert!(!pool.has_connection(ip, 1000));
        assert_eq!(0, pool.num_connections_by_ip(ip));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut pool = ConnectionPool::new();
        let (a, _la) = pooled_connection(&mut pool, 1000);
        let (b, _lb) = pooled_connection(&mut pool, 1000);
        pool.add(a).unwrap();
        assert!(pool.add(b).is_err());
        assert_eq!(1, pool.len());
    }

    #[test]
    fn test_peer_id_index() {
        let mut pool = ConnectionPool::new();
        let (mut a, _la) = pooled_connection(&mut pool, 1000);
        let (mut b, _lb) = pooled_connection(&mut pool, 1001);
        let peer = SourceId::from_bytes([9; 16]);
        a.on_hello_received(peer, 1);
        b.on_hello_received(peer, 1);
        let id_a = pool.add(a).unwrap();
        let id_b = pool.add(b).unwrap();
        pool.index_peer_id(id_a, peer);
        pool.index_peer_id(id_b, peer);
        assert_eq!(&[id_a, id_b][..], pool.ids_by_peer_id(&peer));

        pool.delete(id_a);
        assert_eq!(&[id_b][..], pool.ids_by_peer_id(&peer));
    }

    #[test]
    fn test_take_and_put_back() {
        let mut pool = ConnectionPool::new();
        let (conn, _listener) = pooled_connection(&mut pool, 1000);
        let id = pool.add(conn).unwrap();
        let conn = pool.take(id).unwrap();
        assert!(pool.get(id).is_none());
        pool.put_back(conn);
        assert!(pool.get(id).is_some());
    }

    #[test]
    fn test_ids_in_id_order() {
        let mut pool = ConnectionPool::new();
        let (a, _la) = pooled_connection(&mut pool, 1000);
        let (b, _lb) = pooled_connection(&mut pool, 1001);
        let id_a = pool.add(a).unwrap();
        let id_b = pool.add(b).unwrap();
        assert_eq!(vec![id_a, id_b], pool.ids());
        assert!(id_a.index() < id_b.index());
    }

    #[test]
    fn test_id_reuse_after_delete() {
        let mut pool = ConnectionPool::new();
        let (a, _la) = pooled_connection(&mut pool, 1000);
        let id_a = pool.add(a).unwrap();
        pool.delete(id_a);
        let (b, _lb) = pooled_connection(&mut pool, 1001);
        assert_eq!(id_a, pool.add(b).unwrap());
    }
}
