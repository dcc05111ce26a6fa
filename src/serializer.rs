//! The persistent block store the cache sits on.
//!
//! The cache only ever talks to the serializer through this trait: batched
//! block writes that mint tokens, one atomic index write per flush, block
//! reads by id or token, and the read-ahead callback. The on-disk format is
//! entirely the serializer's business.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CacheError, Result};
use crate::types::{BlockId, Recency};

/// Opaque handle to one persisted copy of a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BlockToken(pub u64);

pub struct LoadedBlock {
    pub data: Vec<u8>,
    pub token: BlockToken,
}

pub struct BlockWrite {
    pub block_id: BlockId,
    pub data: Vec<u8>,
}

/// One entry of an index-write transaction.
///
/// `token` is three-valued: `None` leaves the index entry alone (recency-only
/// touch), `Some(None)` deletes the block, `Some(Some(t))` points the entry
/// at a new persisted copy.
pub struct IndexWriteOp {
    pub block_id: BlockId,
    pub token: Option<Option<BlockToken>>,
    pub recency: Option<Recency>,
}

/// I/O accounting handle. Priorities map onto the serializer's scheduler;
/// the cache holds one account for demand reads and one per explicit
/// cache-account request.
#[derive(Clone, Copy, Debug)]
pub struct IoAccount {
    pub priority: i32,
    pub outstanding_limit: i32,
}

pub const CACHE_READS_IO_PRIORITY: i32 = 100;

pub type ReadAheadCallback = Box<dyn Fn(BlockId, Vec<u8>, BlockToken) + Send + Sync>;

pub trait Serializer: Send + Sync {
    fn max_block_size(&self) -> u32;

    fn get_all_recencies(&self) -> Vec<Recency>;

    fn make_io_account(&self, priority: i32, outstanding_limit: i32) -> IoAccount;

    fn read_block(&self, id: BlockId, account: &IoAccount) -> Result<LoadedBlock>;

    fn read_token(&self, token: BlockToken) -> Result<Vec<u8>>;

    /// Writes a batch of blocks and returns one token per write, in order.
    /// Returns after the data is durable.
    fn block_writes(&self, writes: Vec<BlockWrite>, account: &IoAccount) -> Result<Vec<BlockToken>>;

    /// Atomically applies an index transaction. `on_applied` runs once the
    /// in-memory index reflects the ops, before the call returns.
    fn index_write(&self, ops: Vec<IndexWriteOp>, on_applied: &mut dyn FnMut()) -> Result<()>;

    fn register_read_ahead_cb(&self, cb: ReadAheadCallback);

    fn unregister_read_ahead_cb(&self);
}

/// In-memory serializer used by tests and single-process demos.
///
/// Holds a block index and a token-addressed store behind one mutex so index
/// writes are atomic with respect to readers.
pub struct MemorySerializer {
    max_block_size: u32,
    next_token: AtomicU64,
    index_writes: AtomicU64,
    inner: Mutex<MemoryInner>,
    read_ahead: Mutex<Option<ReadAheadCallback>>,
}

#[derive(Default)]
struct MemoryInner {
    index: FxHashMap<BlockId, IndexEntry>,
    store: FxHashMap<u64, Vec<u8>>,
}

struct IndexEntry {
    token: BlockToken,
    recency: Recency,
}

impl MemorySerializer {
    pub fn new(max_block_size: u32) -> Self {
        MemorySerializer {
            max_block_size,
            next_token: AtomicU64::new(1),
            index_writes: AtomicU64::new(0),
            inner: Mutex::new(MemoryInner::default()),
            read_ahead: Mutex::new(None),
        }
    }

    /// Number of index-write transactions applied so far.
    pub fn index_write_count(&self) -> u64 {
        self.index_writes.load(Ordering::Relaxed)
    }

    fn mint_token(&self) -> BlockToken {
        BlockToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of live index entries.
    pub fn indexed_blocks(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Volunteers an already-persisted block to the registered read-ahead
    /// callback, the way a disk serializer does when a nearby block passes
    /// under the head. No-op if the block is unknown or no callback is live.
    pub fn offer_read_ahead(&self, id: BlockId) {
        let (data, token) = {
            let inner = self.inner.lock();
            match inner.index.get(&id) {
                Some(entry) => match inner.store.get(&entry.token.0) {
                    Some(data) => (data.clone(), entry.token),
                    None => return,
                },
                None => return,
            }
        };
        let cb = self.read_ahead.lock();
        if let Some(cb) = cb.as_ref() {
            cb(id, data, token);
        }
    }
}

impl Serializer for MemorySerializer {
    fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    fn get_all_recencies(&self) -> Vec<Recency> {
        let inner = self.inner.lock();
        let len = inner
            .index
            .keys()
            .filter(|id| !id.is_aux())
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(0);
        let mut recencies = vec![Recency::INVALID; len as usize];
        for (id, entry) in &inner.index {
            if !id.is_aux() {
                recencies[id.0 as usize] = entry.recency;
            }
        }
        recencies
    }

    fn make_io_account(&self, priority: i32, outstanding_limit: i32) -> IoAccount {
        IoAccount {
            priority: priority.max(1),
            outstanding_limit: outstanding_limit.max(1),
        }
    }

    fn read_block(&self, id: BlockId, _account: &IoAccount) -> Result<LoadedBlock> {
        let inner = self.inner.lock();
        let entry = inner
            .index
            .get(&id)
            .ok_or(CacheError::BlockNotFound(id.0))?;
        let data = inner
            .store
            .get(&entry.token.0)
            .ok_or(CacheError::BlockNotFound(id.0))?
            .clone();
        Ok(LoadedBlock {
            data,
            token: entry.token,
        })
    }

    fn read_token(&self, token: BlockToken) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .store
            .get(&token.0)
            .cloned()
            .ok_or_else(|| CacheError::Serializer(format!("unknown block token {}", token.0)))
    }

    fn block_writes(&self, writes: Vec<BlockWrite>, _account: &IoAccount) -> Result<Vec<BlockToken>> {
        let mut inner = self.inner.lock();
        let mut tokens = Vec::with_capacity(writes.len());
        for write in writes {
            let token = self.mint_token();
            inner.store.insert(token.0, write.data);
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn index_write(&self, ops: Vec<IndexWriteOp>, on_applied: &mut dyn FnMut()) -> Result<()> {
        self.index_writes.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            for op in ops {
                match op.token {
                    Some(Some(token)) => {
                        let recency = op.recency.unwrap_or(Recency::INVALID);
                        if let Some(old) = inner
                            .index
                            .insert(op.block_id, IndexEntry { token, recency })
                        {
                            if old.token != token {
                                inner.store.remove(&old.token.0);
                            }
                        }
                    }
                    Some(None) => {
                        if let Some(old) = inner.index.remove(&op.block_id) {
                            inner.store.remove(&old.token.0);
                        }
                    }
                    None => {
                        if let Some(recency) = op.recency {
                            if let Some(entry) = inner.index.get_mut(&op.block_id) {
                                entry.recency = recency;
                            }
                        }
                    }
                }
            }
        }
        on_applied();
        Ok(())
    }

    fn register_read_ahead_cb(&self, cb: ReadAheadCallback) {
        *self.read_ahead.lock() = Some(cb);
    }

    fn unregister_read_ahead_cb(&self) {
        *self.read_ahead.lock() = None;
    }
}
