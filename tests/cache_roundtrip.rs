//! Single-node behavior: write/flush/evict/read round trips, deletion,
//! read-only transactions, the memory limit, and read-ahead intake.

use std::sync::Arc;
use std::time::Duration;

use nimbus::serializer::{BlockWrite, IndexWriteOp};
use nimbus::{
    Access, BlockId, BlockType, CacheConnection, CacheOptions, CacheRuntime, Config, FixedBalancer,
    LoopbackTransport, MemorySerializer, PageCache, RdmaTransport, Recency, Result, Serializer,
    TxnThrottler,
};

const BLOCK_SIZE: u32 = 4096;

fn node_with(
    limit: u64,
    read_ahead: bool,
    write_shard: bool,
) -> (Arc<PageCache>, Arc<MemorySerializer>) {
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    let transport: Arc<dyn RdmaTransport> = LoopbackTransport::new();
    let balancer = FixedBalancer::new(limit, read_ahead);
    let throttler = TxnThrottler::new(1024);
    let runtime = CacheRuntime::new(
        Config::single_node("10.0.0.1", 6001, 7001),
        transport,
        balancer,
        throttler,
        CacheOptions {
            rdma_enabled: false,
            write_shard_enabled: write_shard,
            ..CacheOptions::default()
        },
    );
    let cache = PageCache::new(serializer.clone() as Arc<dyn Serializer>, runtime)
        .expect("cache construction");
    (cache, serializer)
}

fn node(limit: u64, read_ahead: bool) -> (Arc<PageCache>, Arc<MemorySerializer>) {
    node_with(limit, read_ahead, true)
}

fn seed_block(serializer: &MemorySerializer, id: u64, fill: u8) {
    let account = serializer.make_io_account(1, 1);
    let data = vec![fill; BLOCK_SIZE as usize];
    let tokens = serializer
        .block_writes(
            vec![BlockWrite {
                block_id: BlockId(id),
                data,
            }],
            &account,
        )
        .unwrap();
    serializer
        .index_write(
            vec![IndexWriteOp {
                block_id: BlockId(id),
                token: Some(Some(tokens[0])),
                recency: Some(Recency(1)),
            }],
            &mut || {},
        )
        .unwrap();
}

fn write_block(cache: &Arc<PageCache>, conn: &CacheConnection, id: u64, first_byte: u8) {
    let txn = cache.begin_txn(Some(conn));
    let acq = txn.create_chosen(BlockId(id)).unwrap();
    acq.write_with(|buf| buf[0] = first_byte).unwrap();
    drop(acq);
    cache.flush_and_destroy_txn(txn).wait();
}

#[test]
fn write_flush_evict_read_round_trip() -> Result<()> {
    let (cache, serializer) = node(1 << 20, false);
    let conn = CacheConnection::new(&cache);

    let txn = cache.begin_txn(Some(&conn));
    let acq = txn.create_chosen(BlockId(100))?;
    acq.write_with(|buf| {
        buf[..4].copy_from_slice(&[9, 8, 7, 6]);
    })?;
    acq.set_recency(Recency(5));
    drop(acq);
    let flush = cache.flush_and_destroy_txn(txn);
    flush.wait();

    assert_eq!(serializer.indexed_blocks(), 1);
    let account = serializer.make_io_account(1, 1);
    let persisted = serializer.read_block(BlockId(100), &account)?;
    assert_eq!(&persisted.data[..4], &[9, 8, 7, 6]);

    // Age block 100 past the eviction hysteresis by touching a second
    // block repeatedly, then shrink the budget to one block.
    write_block(&cache, &conn, 101, 1);
    for _ in 0..32 {
        let reader = cache.read_acquire(BlockId(101))?;
        reader.read_with(|_| ())?;
    }
    cache.update_memory_limit(BLOCK_SIZE as u64, 0, 0, false);
    let stats = cache.stats();
    assert!(stats.in_memory_bytes <= BLOCK_SIZE as u64);

    // The evicted block reloads through its token with the flushed value.
    let reader = cache.read_acquire(BlockId(100))?;
    assert_eq!(reader.read_with(|buf| buf[0])?, 9);
    Ok(())
}

#[test]
fn created_blocks_live_in_the_write_shard() -> Result<()> {
    let (cache, _serializer) = node(1 << 20, false);
    let conn = CacheConnection::new(&cache);

    let txn = cache.begin_txn(Some(&conn));
    let acq = txn.create(BlockType::Normal)?;
    let block_id = acq.block_id();
    assert!(!block_id.is_reserved());
    acq.write_with(|buf| buf[0] = 1)?;
    drop(acq);
    assert!(cache.block_in_write_map(block_id));
    assert!(!cache.block_in_primary_map(block_id));

    // Reads consult the write shard first.
    let reader = cache.read_acquire(block_id)?;
    assert_eq!(reader.read_with(|buf| buf[0])?, 1);
    drop(reader);
    assert!(cache.stats().writes_hits >= 1);

    cache.flush_and_destroy_txn(txn).wait();
    Ok(())
}

#[test]
fn block_versions_increase_per_write_acquire() -> Result<()> {
    let (cache, _serializer) = node(1 << 20, false);
    let conn = CacheConnection::new(&cache);

    let txn1 = cache.begin_txn(Some(&conn));
    let acq1 = txn1.create_chosen(BlockId(50))?;
    acq1.wait_write();
    let v1 = acq1.block_version();
    drop(acq1);

    let txn2 = cache.begin_txn(Some(&conn));
    let acq2 = txn2.acquire(BlockId(50), Access::Write)?;
    acq2.wait_write();
    let v2 = acq2.block_version();
    acq2.write_with(|buf| buf[0] = 2)?;
    drop(acq2);

    assert!(v2 > v1, "versions must be strictly increasing");

    // A reader between writers observes the last writer's version.
    let reader = cache.read_acquire(BlockId(50))?;
    assert_eq!(reader.block_version(), v2);
    drop(reader);

    let f1 = cache.flush_and_destroy_txn(txn1);
    let f2 = cache.flush_and_destroy_txn(txn2);
    f1.wait();
    f2.wait();
    Ok(())
}

#[test]
fn snapshotted_reader_outlives_later_writes() -> Result<()> {
    let (cache, _serializer) = node(1 << 20, false);
    let conn = CacheConnection::new(&cache);

    let txn1 = cache.begin_txn(Some(&conn));
    let acq1 = txn1.create_chosen(BlockId(70))?;
    acq1.write_with(|buf| buf[0] = 10)?;
    drop(acq1);

    let snapshot = cache.read_acquire(BlockId(70))?;
    snapshot.wait_read();
    snapshot.declare_snapshotted();

    let txn2 = cache.begin_txn(Some(&conn));
    let acq2 = txn2.acquire(BlockId(70), Access::Write)?;
    // The snapshotter left the queue, so the writer holds exclusivity.
    assert!(acq2.write_available());
    acq2.write_with(|buf| buf[0] = 20)?;
    drop(acq2);

    // The snapshot still sees the pre-write value.
    assert_eq!(snapshot.read_with(|buf| buf[0])?, 10);
    let fresh = cache.read_acquire(BlockId(70))?;
    assert_eq!(fresh.read_with(|buf| buf[0])?, 20);
    drop(fresh);
    drop(snapshot);

    let f1 = cache.flush_and_destroy_txn(txn1);
    let f2 = cache.flush_and_destroy_txn(txn2);
    f1.wait();
    f2.wait();
    Ok(())
}

#[test]
fn writer_waits_for_queued_readers() -> Result<()> {
    let (cache, serializer) = node(1 << 20, false);
    seed_block(&serializer, 7, 3);

    let reader1 = cache.read_acquire(BlockId(7))?;
    let reader2 = cache.read_acquire(BlockId(7))?;
    reader1.wait_read();
    reader2.wait_read();

    let conn = CacheConnection::new(&cache);
    let txn = cache.begin_txn(Some(&conn));
    let writer = txn.acquire(BlockId(7), Access::Write)?;
    // Readers ahead of the writer: read granted, write withheld.
    assert!(writer.read_available());
    assert!(!writer.write_available());

    drop(reader1);
    assert!(!writer.write_available());
    drop(reader2);
    assert!(writer.write_available());
    writer.write_with(|buf| buf[0] = 4)?;
    drop(writer);
    cache.flush_and_destroy_txn(txn).wait();
    Ok(())
}

#[test]
fn delete_then_flush_removes_block() -> Result<()> {
    let (cache, serializer) = node(1 << 20, false);
    let conn = CacheConnection::new(&cache);

    let txn1 = cache.begin_txn(Some(&conn));
    let acq = txn1.create_chosen(BlockId(200))?;
    acq.write_with(|buf| buf[0] = 1)?;
    drop(acq);
    cache.flush_and_destroy_txn(txn1).wait();
    assert_eq!(serializer.indexed_blocks(), 1);

    let txn2 = cache.begin_txn(Some(&conn));
    let acq = txn2.acquire(BlockId(200), Access::Write)?;
    acq.mark_deleted();
    drop(acq);
    cache.flush_and_destroy_txn(txn2).wait();

    assert_eq!(serializer.indexed_blocks(), 0);
    assert_eq!(cache.recency_of(BlockId(200)), Recency::INVALID);

    // A fresh read of the deleted block fails with not-found.
    let reader = cache.read_acquire(BlockId(200))?;
    let outcome = reader.read_with(|_| ());
    assert!(matches!(
        outcome,
        Err(nimbus::CacheError::BlockNotFound(200))
    ));
    Ok(())
}

#[test]
fn read_only_txn_completes_immediately() -> Result<()> {
    let (cache, serializer) = node(1 << 20, false);
    seed_block(&serializer, 5, 42);

    let txn = cache.begin_read_txn();
    let acq = txn.acquire(BlockId(5), Access::Read)?;
    assert_eq!(acq.read_with(|buf| buf[0])?, 42);
    drop(acq);
    cache.end_read_txn(txn);
    // No index write happened for a pure read; only the seeding one.
    assert_eq!(serializer.index_write_count(), 1);
    Ok(())
}

#[test]
fn shrinking_limit_evicts_oldest_first() -> Result<()> {
    // Write-shard off: flushed pages stay put instead of being swept, so
    // the limit is the only thing driving eviction here.
    let (cache, _serializer) = node_with(1 << 20, false, false);
    let conn = CacheConnection::new(&cache);

    // Fifty flushed blocks, written oldest-to-newest.
    for id in 100..150u64 {
        write_block(&cache, &conn, id, id as u8);
    }
    assert_eq!(cache.stats().evictable_disk_backed_pages, 50);

    // Shrink to sixteen blocks' worth of memory.
    let new_limit = 16 * BLOCK_SIZE as u64;
    cache.update_memory_limit(new_limit, 0, 0, false);

    let stats = cache.stats();
    assert!(stats.in_memory_bytes <= new_limit);
    // The oldest blocks went first; the newest stayed resident.
    assert!(!cache.block_in_primary_map(BlockId(100)));
    assert!(!cache.block_in_primary_map(BlockId(101)));
    assert!(cache.block_in_primary_map(BlockId(149)));

    // Evicted blocks remain readable from disk.
    let reader = cache.read_acquire(BlockId(100))?;
    assert_eq!(reader.read_with(|buf| buf[0])?, 100);
    Ok(())
}

#[test]
fn read_ahead_intake_and_rejection() -> Result<()> {
    let (cache, serializer) = node(1 << 20, true);
    seed_block(&serializer, 10, 11);
    seed_block(&serializer, 11, 12);

    // Volunteered buffer for an unknown block is accepted.
    serializer.offer_read_ahead(BlockId(10));
    assert!(cache.block_in_primary_map(BlockId(10)));
    let accepted = cache.stats().evictable_disk_backed_pages;
    assert_eq!(accepted, 1);

    // A block with an existing current-page is rejected.
    let reader = cache.read_acquire(BlockId(11))?;
    reader.wait_read();
    serializer.offer_read_ahead(BlockId(11));
    assert_eq!(cache.stats().evictable_disk_backed_pages, accepted);
    drop(reader);

    // Turning read-ahead off tears the callback down; later offers are
    // ignored entirely.
    cache.update_memory_limit(1 << 20, 0, 0, false);
    serializer.offer_read_ahead(BlockId(10));
    assert_eq!(cache.stats().evictable_disk_backed_pages, accepted);
    Ok(())
}

#[test]
fn balancer_hears_about_activity() -> Result<()> {
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    let transport: Arc<dyn RdmaTransport> = LoopbackTransport::new();
    let balancer = FixedBalancer::new(1 << 20, false);
    let balancer_handle = Arc::clone(&balancer);
    let runtime = CacheRuntime::new(
        Config::single_node("10.0.0.1", 6001, 7001),
        transport,
        balancer,
        TxnThrottler::new(64),
        CacheOptions {
            rdma_enabled: false,
            ..CacheOptions::default()
        },
    );
    let cache = PageCache::new(serializer as Arc<dyn Serializer>, runtime)?;

    let conn = CacheConnection::new(&cache);
    let txn = cache.begin_txn(Some(&conn));
    let acq = txn.create_chosen(BlockId(30))?;
    acq.write_with(|buf| buf[0] = 1)?;
    drop(acq);
    cache.flush_and_destroy_txn(txn).wait();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while balancer_handle.wakeups_seen() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(balancer_handle.wakeups_seen() >= 1);
    Ok(())
}
