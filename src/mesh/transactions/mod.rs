//! The transaction service: a content addressed pool mapping
//! between transaction hashes, 4-byte short ids, and raw
//! transaction contents, one instance per blockchain network.
//!
//! Records are evicted four ways: explicitly by hash or short id,
//! by the in-memory byte budget, once enough blocks have confirmed
//! them, and when short id assignments outlive their time to live.

pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::mesh::alarms::AlarmQueue;
use crate::mesh::collections::RandomState;
use crate::mesh::core::Timer;
use crate::mesh::crypto::hash::Digest;
use crate::mesh::error::*;
use crate::mesh::expiry::ExpirationQueue;
use crate::mesh::messages::NULL_TX_SID;

pub use store::{HashStore, TransactionStore, TxCacheKey};

/// Fallback for networks that do not configure how many block
/// confirmations reclaim a short id.
pub const DEFAULT_FINAL_TX_CONFIRMATIONS_COUNT: usize = 24;

/// Default in-memory budget for transaction contents, per network.
pub const DEFAULT_TX_CACHE_MEMORY_LIMIT_BYTES: usize = 250 * 1024 * 1024;

/// Delay before short ids seen in a block are tracked for cleanup.
pub const CLEAN_UP_SEEN_SHORT_IDS_DELAY: Duration = Duration::from_secs(10);

/// Floor on the interval between short id expiration sweeps.
pub const MIN_CLEAN_UP_EXPIRED_TXS_TASK_INTERVAL: Duration = Duration::from_secs(60);

/// Attempts at snapshotting the assignment queue while another
/// thread holds it.
const SNAPSHOT_LOCK_RETRIES: usize = 10;

/// What is known about a transaction looked up by short id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransactionInfo {
    pub hash: Option<Digest>,
    pub contents: Option<Vec<u8>>,
    pub short_id: u32,
}

/// Result of resolving a batch of short ids.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransactionSearchResult {
    pub found: Vec<TransactionInfo>,
    pub missing: Vec<TransactionInfo>,
}

/// Configuration of one per-network transaction service.
pub struct TransactionServiceConfig {
    /// How long a short id assignment lives without being renewed.
    pub sid_expire_time: Duration,
    /// Blocks a transaction must be seen in before its short ids
    /// are reclaimed.
    pub final_tx_confirmations_count: usize,
    /// Byte budget for stored transaction contents.
    pub tx_content_memory_limit: usize,
}

impl Default for TransactionServiceConfig {
    fn default() -> Self {
        TransactionServiceConfig {
            sid_expire_time: Duration::from_secs(3 * 24 * 60 * 60),
            final_tx_confirmations_count: DEFAULT_FINAL_TX_CONFIRMATIONS_COUNT,
            tx_content_memory_limit: DEFAULT_TX_CACHE_MEMORY_LIMIT_BYTES,
        }
    }
}

/// The transaction mappings of one blockchain network.
pub struct TransactionService<S: TransactionStore = HashStore> {
    network_num: u32,
    store: S,
    sid_expire_time: Duration,
    // shared so worker threads can snapshot assignment ages while
    // the loop keeps mutating
    tx_assignment_expire_queue: Arc<Mutex<ExpirationQueue<u32>>>,
    expiry_alarm_scheduled: bool,
    final_tx_confirmations_count: usize,
    tx_content_memory_limit: usize,
    short_ids_seen_in_block: LinkedHashMap<Digest, Vec<u32>, RandomState>,
    total_tx_contents_size: usize,
    total_tx_removed_by_memory_limit: usize,
}

impl TransactionService<HashStore> {
    pub fn new(network_num: u32, config: TransactionServiceConfig) -> Self {
        Self::with_store(HashStore::new(), network_num, config)
    }
}

impl<S: TransactionStore> TransactionService<S> {
    pub fn with_store(store: S, network_num: u32, config: TransactionServiceConfig) -> Self {
        debug!(
            "transaction service for network {} capped at {} content bytes",
            network_num, config.tx_content_memory_limit
        );
        TransactionService {
            network_num,
            store,
            sid_expire_time: config.sid_expire_time,
            tx_assignment_expire_queue: Arc::new(Mutex::new(ExpirationQueue::new(
                config.sid_expire_time,
            ))),
            expiry_alarm_scheduled: false,
            final_tx_confirmations_count: config.final_tx_confirmations_count,
            tx_content_memory_limit: config.tx_content_memory_limit,
            short_ids_seen_in_block: LinkedHashMap::with_hasher(RandomState::default()),
            total_tx_contents_size: 0,
            total_tx_removed_by_memory_limit: 0,
        }
    }

    pub fn network_num(&self) -> u32 {
        self.network_num
    }

    /// Any short id assigned to `tx_hash`, or the null id.
    pub fn get_short_id(&self, tx_hash: &Digest) -> u32 {
        self.get_short_ids(tx_hash)
            .first()
            .copied()
            .unwrap_or(NULL_TX_SID)
    }

    /// All short ids assigned to `tx_hash`.
    pub fn get_short_ids(&self, tx_hash: &Digest) -> Vec<u32> {
        let key = self.store.cache_key(tx_hash);
        self.store.short_ids_of(&key).unwrap_or_default()
    }

    /// Everything known about the transaction behind `short_id`.
    pub fn get_transaction(&self, short_id: u32) -> TransactionInfo {
        match self.store.key_of(short_id) {
            Some(key) => TransactionInfo {
                hash: Some(self.store.cache_key_to_hash(&key)),
                contents: self.store.contents_of(&key).map(<[u8]>::to_vec),
                short_id,
            },
            None => TransactionInfo {
                hash: None,
                contents: None,
                short_id,
            },
        }
    }

    /// Resolves a batch of short ids into found and missing halves.
    pub fn get_transactions(&self, short_ids: &[u32]) -> TransactionSearchResult {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for short_id in short_ids.iter().copied() {
            let info = self.get_transaction(short_id);
            if info.hash.is_some() && info.contents.is_some() {
                found.push(info);
            } else {
                trace!("short id {} was requested but is unknown", short_id);
                missing.push(TransactionInfo {
                    hash: None,
                    contents: None,
                    short_id,
                });
            }
        }
        TransactionSearchResult { found, missing }
    }

    /// Splits a batch of short ids into the unknown ids and the
    /// known ids whose contents are absent.
    pub fn get_missing_transactions(&self, short_ids: &[u32]) -> (bool, Vec<u32>, Vec<Digest>) {
        let mut unknown_sids = Vec::new();
        let mut unknown_hashes = Vec::new();
        for short_id in short_ids.iter().copied() {
            match self.store.key_of(short_id) {
                None => unknown_sids.push(short_id),
                Some(key) => {
                    if !self.store.has_contents_of(&key) {
                        unknown_hashes.push(self.store.cache_key_to_hash(&key));
                    }
                }
            }
        }
        let has_missing = !unknown_sids.is_empty() || !unknown_hashes.is_empty();
        (has_missing, unknown_sids, unknown_hashes)
    }

    /// Contents stored for `tx_hash`, if any.
    pub fn get_transaction_by_hash(&self, tx_hash: &Digest) -> Option<&[u8]> {
        let key = self.store.cache_key(tx_hash);
        self.store.contents_of(&key)
    }

    pub fn has_transaction_contents(&self, tx_hash: &Digest) -> bool {
        let key = self.store.cache_key(tx_hash);
        self.store.has_contents_of(&key)
    }

    pub fn has_transaction_short_id(&self, tx_hash: &Digest) -> bool {
        let key = self.store.cache_key(tx_hash);
        self.store.has_short_ids_of(&key)
    }

    pub fn has_short_id(&self, short_id: u32) -> bool {
        self.store.has_short_id(short_id)
    }

    pub fn short_id_count(&self) -> usize {
        self.store.short_id_count()
    }

    pub fn contents_count(&self) -> usize {
        self.store.contents_count()
    }

    pub fn total_tx_contents_size(&self) -> usize {
        self.total_tx_contents_size
    }

    pub fn total_tx_removed_by_memory_limit(&self) -> usize {
        self.total_tx_removed_by_memory_limit
    }

    pub fn tracked_block_count(&self) -> usize {
        self.short_ids_seen_in_block.len()
    }

    pub fn set_final_tx_confirmations_count(&mut self, count: usize) {
        self.final_tx_confirmations_count = count;
    }

    /// Maps `short_id` to `tx_hash`, scheduling the expiration
    /// sweep if this is the first live assignment.
    ///
    /// The null short id is silently refused.
    pub fn assign_short_id(
        &mut self,
        alarms: &mut AlarmQueue<Timer>,
        tx_hash: &Digest,
        short_id: u32,
        now: Instant,
    ) {
        if short_id == NULL_TX_SID {
            warn!(
                "attempted to assign the null short id to transaction {}, ignoring",
                tx_hash
            );
            return;
        }
        trace!("assigning short id {} to transaction {}", short_id, tx_hash);
        let key = self.store.cache_key(tx_hash);
        self.store.insert_short_id(key, short_id);
        self.tx_assignment_expire_queue.lock().add(short_id, now);

        if !self.expiry_alarm_scheduled {
            alarms.register(
                self.sid_expire_time,
                Timer::ExpireShortIds(self.network_num),
                now,
            );
            self.expiry_alarm_scheduled = true;
        }
    }

    /// Stores (or replaces) the contents of `tx_hash`, then
    /// enforces the memory budget.
    pub fn set_transaction_contents(&mut self, tx_hash: &Digest, contents: Vec<u8>) {
        let key = self.store.cache_key(tx_hash);
        let new_size = contents.len();
        let previous_size = self.store.set_contents(key, contents);
        self.total_tx_contents_size = self.total_tx_contents_size - previous_size + new_size;
        self.memory_limit_cleanup();
    }

    /// Removes the contents entry and every short id assigned to
    /// `tx_hash`. Returns the removed short ids, if there were any.
    pub fn remove_transaction_by_tx_hash(&mut self, tx_hash: &Digest) -> Option<Vec<u32>> {
        let key = self.store.cache_key(tx_hash);
        let short_ids = self.store.remove_short_ids_of(&key);
        if let Some(short_ids) = &short_ids {
            let mut queue = self.tx_assignment_expire_queue.lock();
            for short_id in short_ids.iter().copied() {
                trace!(
                    "removed short id {} of transaction {} on network {}: RemoveByTransactionHash",
                    short_id,
                    tx_hash,
                    self.network_num
                );
                self.store.remove_key_of(short_id);
                queue.remove(&short_id);
            }
        }
        if let Some(contents) = self.store.remove_contents_of(&key) {
            self.total_tx_contents_size -= contents.len();
        }
        short_ids
    }

    /// Removes one short id assignment. With `remove_related`, all
    /// sibling assignments of the same hash go too; without it, the
    /// hash's contents are only freed when this was its last
    /// assignment.
    pub fn remove_transaction_by_short_id(&mut self, short_id: u32, remove_related: bool) {
        if let Some(key) = self.store.remove_key_of(short_id) {
            let tx_hash = self.store.cache_key_to_hash(&key);
            trace!(
                "removed short id {} of transaction {} on network {}: RemoveByShortId",
                short_id,
                tx_hash,
                self.network_num
            );
            if let Some(siblings) = self.store.short_ids_of(&key) {
                let last_assignment = siblings.len() == 1;
                if last_assignment || remove_related {
                    for sibling in siblings.into_iter().filter(|s| *s != short_id) {
                        trace!(
                            "removed short id {} of transaction {} on network {}: \
                             RemoveRelatedShortId",
                            sibling,
                            tx_hash,
                            self.network_num
                        );
                        self.store.remove_key_of(sibling);
                        self.tx_assignment_expire_queue.lock().remove(&sibling);
                    }
                    if let Some(contents) = self.store.remove_contents_of(&key) {
                        self.total_tx_contents_size -= contents.len();
                    }
                    self.store.remove_short_ids_of(&key);
                } else {
                    self.store.remove_one_short_id(&key, short_id);
                }
            }
        }
        self.tx_assignment_expire_queue.lock().remove(&short_id);
    }

    /// Records the short ids a routed block confirmed. Once more
    /// than `final_tx_confirmations_count` blocks are tracked, the
    /// oldest block's short ids are reclaimed wholesale.
    pub fn track_seen_short_ids(&mut self, block_hash: Digest, short_ids: Vec<u32>) {
        self.short_ids_seen_in_block.remove(&block_hash);
        self.short_ids_seen_in_block.insert(block_hash, short_ids);

        while self.short_ids_seen_in_block.len() > self.final_tx_confirmations_count {
            if let Some((evicted_block, final_short_ids)) = self.short_ids_seen_in_block.pop_front()
            {
                debug!(
                    "reclaiming {} short ids confirmed by block {} on network {}",
                    final_short_ids.len(),
                    evicted_block,
                    self.network_num
                );
                for short_id in final_short_ids {
                    self.remove_transaction_by_short_id(short_id, true);
                }
            }
        }
    }

    /// Schedules `track_seen_short_ids` to run after the cleanup
    /// delay.
    pub fn track_seen_short_ids_delayed(
        &self,
        alarms: &mut AlarmQueue<Timer>,
        block_hash: Digest,
        short_ids: Vec<u32>,
        now: Instant,
    ) {
        alarms.register(
            CLEAN_UP_SEEN_SHORT_IDS_DELAY,
            Timer::TrackSeenShortIds {
                network_num: self.network_num,
                block_hash,
                short_ids,
            },
            now,
        );
    }

    /// Forgets a block whose transactions were already cleaned up
    /// by other means.
    pub fn on_block_cleaned_up(&mut self, block_hash: &Digest) {
        self.short_ids_seen_in_block.remove(block_hash);
    }

    /// Drops every assignment older than the expiry time. Returns
    /// the delay until the next sweep, or `None` when the queue
    /// drained (the caller cancels the alarm).
    pub fn expire_old_assignments(&mut self, now: Instant) -> Option<Duration> {
        debug!(
            "expiring old short id assignments on network {}, {} entries",
            self.network_num,
            self.tx_assignment_expire_queue.lock().len()
        );
        let expired = {
            let mut queue = self.tx_assignment_expire_queue.lock();
            let mut expired = Vec::new();
            queue.remove_expired(now, |short_id| expired.push(short_id));
            expired
        };
        for short_id in expired {
            self.remove_transaction_by_short_id(short_id, false);
        }

        let queue = self.tx_assignment_expire_queue.lock();
        match queue.oldest_timestamp() {
            Some(oldest) => {
                let until_next = (oldest + self.sid_expire_time).saturating_duration_since(now);
                Some(until_next.max(MIN_CLEAN_UP_EXPIRED_TXS_TASK_INTERVAL))
            }
            None => {
                self.expiry_alarm_scheduled = false;
                None
            }
        }
    }

    /// Oldest-first snapshot of `(short_id, tx_hash, assigned_at)`
    /// entries, safe to call while a worker thread holds the
    /// assignment queue.
    pub fn thread_safe_iter_timestamped_transactions_from_oldest(
        &self,
        newest: Option<Instant>,
    ) -> Result<Vec<(u32, Digest, Instant)>> {
        let mut tries = 0;
        let snapshot = loop {
            match self.tx_assignment_expire_queue.try_lock() {
                Some(queue) => {
                    break queue
                        .iter()
                        .map(|(short_id, ts)| (*short_id, ts))
                        .collect::<Vec<_>>()
                }
                None => {
                    tries += 1;
                    if tries >= SNAPSHOT_LOCK_RETRIES {
                        return Err("The assignment queue stayed contended on every attempt")
                            .wrapped(ErrorKind::Transactions);
                    }
                    std::thread::yield_now();
                }
            }
        };
        debug!("froze the assignment queue after {} contended tries", tries);

        let mut out = Vec::with_capacity(snapshot.len());
        for (short_id, ts) in snapshot {
            if let Some(newest) = newest {
                if ts > newest {
                    break;
                }
            }
            // assignments racing with removal are skipped
            if let Some(key) = self.store.key_of(short_id) {
                out.push((short_id, self.store.cache_key_to_hash(&key), ts));
            }
        }
        Ok(out)
    }

    /// A clone of the assignment queue handle, for workers that
    /// need to watch assignment ages.
    pub fn assignment_queue_handle(&self) -> Arc<Mutex<ExpirationQueue<u32>>> {
        Arc::clone(&self.tx_assignment_expire_queue)
    }

    /// Hashes of every transaction with stored contents.
    pub fn get_snapshot(&self) -> Vec<Digest> {
        self.store
            .content_keys()
            .iter()
            .map(|key| self.store.cache_key_to_hash(key))
            .collect()
    }

    fn memory_limit_cleanup(&mut self) {
        if self.total_tx_contents_size <= self.tx_content_memory_limit {
            return;
        }
        trace!(
            "network {} exceeds its contents budget: {} of {} bytes",
            self.network_num,
            self.total_tx_contents_size,
            self.tx_content_memory_limit
        );
        let mut removed = 0;

        while self.total_tx_contents_size > self.tx_content_memory_limit {
            let oldest = {
                let mut queue = self.tx_assignment_expire_queue.lock();
                let mut oldest = None;
                queue.remove_oldest(|short_id| oldest = Some(short_id));
                oldest
            };
            match oldest {
                Some(short_id) => {
                    self.remove_transaction_by_short_id(short_id, false);
                    removed += 1;
                }
                None => break,
            }
        }
        if self.total_tx_contents_size > self.tx_content_memory_limit {
            warn!(
                "memory management failure on network {}: no short ids left to evict, \
                 clearing all transaction data",
                self.network_num
            );
            removed += self.store.contents_count();
            self.clear();
        }

        self.total_tx_removed_by_memory_limit += removed;
        trace!(
            "evicted {} transactions, {} content bytes remain",
            removed,
            self.total_tx_contents_size
        );
    }

    fn clear(&mut self) {
        self.store.clear();
        self.short_ids_seen_in_block.clear();
        self.total_tx_contents_size = 0;
    }
}
