//! Transaction DAG behavior: flush sets, change compaction, and the
//! single-index-write guarantee.

use std::sync::Arc;
use std::time::Duration;

use nimbus::{
    Access, BlockId, CacheConnection, CacheOptions, CacheRuntime, Config, FixedBalancer,
    LoopbackTransport, MemorySerializer, PageCache, RdmaTransport, Result, Serializer,
    TxnThrottler,
};

const BLOCK_SIZE: u32 = 4096;

fn node() -> (Arc<PageCache>, Arc<MemorySerializer>) {
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    let transport: Arc<dyn RdmaTransport> = LoopbackTransport::new();
    let runtime = CacheRuntime::new(
        Config::single_node("10.0.0.1", 6001, 7001),
        transport,
        FixedBalancer::new(1 << 20, false),
        TxnThrottler::new(256),
        CacheOptions {
            rdma_enabled: false,
            ..CacheOptions::default()
        },
    );
    let cache = PageCache::new(serializer.clone() as Arc<dyn Serializer>, runtime)
        .expect("cache construction");
    (cache, serializer)
}

#[test]
fn dependent_writers_flush_together_with_one_change() -> Result<()> {
    let (cache, serializer) = node();
    let conn = CacheConnection::new(&cache);

    let txn1 = cache.begin_txn(Some(&conn));
    let acq1 = txn1.create_chosen(BlockId(100))?;
    let v1 = {
        acq1.write_with(|buf| buf[0] = 0xA1)?;
        acq1.block_version()
    };
    drop(acq1);

    let txn2 = cache.begin_txn(Some(&conn));
    let acq2 = txn2.acquire(BlockId(100), Access::Write)?;
    let v2 = {
        acq2.write_with(|buf| buf[0] = 0xB2)?;
        acq2.block_version()
    };
    drop(acq2);
    assert!(v2 > v1);

    // The newer transaction announces first; its preceder has not, so the
    // flush stays pending.
    let handle2 = cache.flush_and_destroy_txn(txn2);
    assert!(!handle2.is_complete());
    assert_eq!(serializer.index_write_count(), 0);

    // Announcing the base releases both in one atomic index write.
    let handle1 = cache.flush_and_destroy_txn(txn1);
    handle1.wait();
    assert!(handle2.wait_timeout(Duration::from_secs(5)));
    assert_eq!(serializer.index_write_count(), 1);

    // Compaction kept the newer version's bytes only.
    let account = serializer.make_io_account(1, 1);
    let persisted = serializer.read_block(BlockId(100), &account)?;
    assert_eq!(persisted.data[0], 0xB2);
    assert_eq!(serializer.indexed_blocks(), 1);
    Ok(())
}

#[test]
fn same_connection_reader_joins_the_flush_set() -> Result<()> {
    let (cache, serializer) = node();
    let conn = CacheConnection::new(&cache);

    let txn1 = cache.begin_txn(Some(&conn));
    let acq1 = txn1.create_chosen(BlockId(10))?;
    acq1.write_with(|buf| buf[0] = 7)?;
    let writer_version = acq1.block_version();
    drop(acq1);

    // A reader in the same connection sees the unflushed writer's version.
    let txn2 = cache.begin_txn(Some(&conn));
    let reader = txn2.acquire(BlockId(10), Access::Read)?;
    assert_eq!(reader.block_version(), writer_version);
    assert_eq!(reader.read_with(|buf| buf[0])?, 7);
    drop(reader);

    // The reader's transaction is a subseqer of the writer's and cannot
    // complete first.
    let handle2 = cache.flush_and_destroy_txn(txn2);
    assert!(!handle2.is_complete());

    let handle1 = cache.flush_and_destroy_txn(txn1);
    handle1.wait();
    assert!(handle2.wait_timeout(Duration::from_secs(5)));
    assert_eq!(serializer.index_write_count(), 1);
    Ok(())
}

#[test]
fn changeless_transaction_completes_in_place() -> Result<()> {
    let (cache, serializer) = node();
    let conn = CacheConnection::new(&cache);

    let txn = cache.begin_txn(Some(&conn));
    let handle = cache.flush_and_destroy_txn(txn);
    // Nothing to persist: completion is synchronous and no index write
    // happens.
    assert!(handle.is_complete());
    assert_eq!(serializer.index_write_count(), 0);
    Ok(())
}

#[test]
fn independent_transactions_flush_independently() -> Result<()> {
    let (cache, serializer) = node();
    let conn_a = CacheConnection::new(&cache);
    let conn_b = CacheConnection::new(&cache);

    let txn_a = cache.begin_txn(Some(&conn_a));
    let acq_a = txn_a.create_chosen(BlockId(20))?;
    acq_a.write_with(|buf| buf[0] = 1)?;
    drop(acq_a);

    let txn_b = cache.begin_txn(Some(&conn_b));
    let acq_b = txn_b.create_chosen(BlockId(21))?;
    acq_b.write_with(|buf| buf[0] = 2)?;
    drop(acq_b);

    // Disjoint blocks, disjoint connections: each flushes on its own.
    let handle_b = cache.flush_and_destroy_txn(txn_b);
    assert!(handle_b.wait_timeout(Duration::from_secs(5)));
    assert_eq!(serializer.indexed_blocks(), 1);

    let handle_a = cache.flush_and_destroy_txn(txn_a);
    assert!(handle_a.wait_timeout(Duration::from_secs(5)));
    assert_eq!(serializer.indexed_blocks(), 2);
    assert_eq!(serializer.index_write_count(), 2);
    Ok(())
}

#[test]
fn chains_of_connection_transactions_flush_in_order() -> Result<()> {
    let (cache, serializer) = node();
    let conn = CacheConnection::new(&cache);

    // Three transactions chained by the connection, announced newest
    // first: nothing can flush until the oldest announces.
    let txn1 = cache.begin_txn(Some(&conn));
    let acq = txn1.create_chosen(BlockId(30))?;
    acq.write_with(|buf| buf[0] = 1)?;
    drop(acq);

    let txn2 = cache.begin_txn(Some(&conn));
    let acq = txn2.acquire(BlockId(30), Access::Write)?;
    acq.write_with(|buf| buf[0] = 2)?;
    drop(acq);

    let txn3 = cache.begin_txn(Some(&conn));
    let acq = txn3.acquire(BlockId(30), Access::Write)?;
    acq.write_with(|buf| buf[0] = 3)?;
    drop(acq);

    let handle3 = cache.flush_and_destroy_txn(txn3);
    let handle2 = cache.flush_and_destroy_txn(txn2);
    assert!(!handle3.is_complete());
    assert!(!handle2.is_complete());

    let handle1 = cache.flush_and_destroy_txn(txn1);
    handle1.wait();
    assert!(handle2.wait_timeout(Duration::from_secs(5)));
    assert!(handle3.wait_timeout(Duration::from_secs(5)));

    // One flush set, one index write, newest bytes.
    assert_eq!(serializer.index_write_count(), 1);
    let account = serializer.make_io_account(1, 1);
    assert_eq!(serializer.read_block(BlockId(30), &account)?.data[0], 3);
    Ok(())
}
