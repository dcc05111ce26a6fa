//! Two-node tiering: metadata-ring discovery, one-sided promotion,
//! admission, and fall-through to disk on transport faults.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbus::serializer::{BlockWrite, IndexWriteOp};
use nimbus::types::{INTERNAL_NODE_TAG, LEAF_NODE_TAG};
use nimbus::{
    BlockId, CacheOptions, CacheRuntime, Config, FixedBalancer, HostConfig, LoopbackTransport,
    MemorySerializer, PageCache, RdmaTransport, Recency, Result, Serializer, TxnThrottler,
};

const BLOCK_SIZE: u32 = 4096;

struct Cluster {
    a: Arc<PageCache>,
    b: Arc<PageCache>,
    ser_a: Arc<MemorySerializer>,
    ser_b: Arc<MemorySerializer>,
    transport: Arc<LoopbackTransport>,
}

fn make_node(
    transport: &Arc<LoopbackTransport>,
    hosts: &[HostConfig],
    ip: &str,
) -> (Arc<PageCache>, Arc<MemorySerializer>) {
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    let config = Config {
        hosts: hosts.to_vec(),
        my_ip: Some(ip.to_string()),
    };
    let runtime = CacheRuntime::new(
        config,
        Arc::clone(transport) as Arc<dyn RdmaTransport>,
        FixedBalancer::new(1 << 22, false),
        TxnThrottler::new(256),
        CacheOptions {
            ring_poll_interval: Duration::from_millis(2),
            ..CacheOptions::default()
        },
    );
    let cache = PageCache::new(serializer.clone() as Arc<dyn Serializer>, runtime)
        .expect("cache construction");
    (cache, serializer)
}

fn cluster() -> Cluster {
    let transport = LoopbackTransport::new();
    let hosts = vec![
        HostConfig {
            host: "10.0.0.1".into(),
            memory_port: 6001,
            metadata_port: 7001,
        },
        HostConfig {
            host: "10.0.0.2".into(),
            memory_port: 6001,
            metadata_port: 7001,
        },
    ];
    let (a, ser_a) = make_node(&transport, &hosts, "10.0.0.1");
    let (b, ser_b) = make_node(&transport, &hosts, "10.0.0.2");
    a.connect_peers().expect("peer wiring");
    b.connect_peers().expect("peer wiring");
    Cluster {
        a,
        b,
        ser_a,
        ser_b,
        transport,
    }
}

fn seed_block(serializer: &MemorySerializer, id: u64, fill: u8, tag: u8) {
    let account = serializer.make_io_account(1, 1);
    let mut data = vec![fill; BLOCK_SIZE as usize];
    data[0] = tag;
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

/// Loads a block into a node's local cache (publishing it in that node's
/// metadata ring).
fn load_locally(cache: &Arc<PageCache>, id: u64) {
    let acq = cache.read_acquire(BlockId(id)).unwrap();
    acq.read_with(|_| ()).unwrap();
}

fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn remote_block_is_fetched_and_admitted_by_range() -> Result<()> {
    let cluster = cluster();
    // Block 200 is in node A's id range; B caches it from its own disk.
    seed_block(&cluster.ser_b, 200, 0xAB, LEAF_NODE_TAG);
    load_locally(&cluster.b, 200);
    wait_until("ring entry for 200", || {
        cluster.a.remote_offset_of(BlockId(200)).is_some()
    });

    let acq = cluster.a.read_acquire(BlockId(200))?;
    assert_eq!(acq.read_with(|buf| buf[1])?, 0xAB);
    drop(acq);
    let stats = cluster.a.stats();
    assert_eq!(stats.rdma_hits, 1);
    assert!(cluster.a.block_in_rdma_map(BlockId(200)));

    // The second read is a local hit; no further remote traffic.
    let acq = cluster.a.read_acquire(BlockId(200))?;
    assert_eq!(acq.read_with(|buf| buf[1])?, 0xAB);
    drop(acq);
    let after = cluster.a.stats();
    assert_eq!(after.rdma_hits, 1);
    assert_eq!(after.hits, stats.hits + 1);
    Ok(())
}

#[test]
fn internal_nodes_are_admitted_outside_the_range() -> Result<()> {
    let cluster = cluster();
    // Block 60000 belongs to B's range, but carries the internal-node tag.
    seed_block(&cluster.ser_b, 60_000, 0x11, INTERNAL_NODE_TAG);
    load_locally(&cluster.b, 60_000);
    wait_until("ring entry for 60000", || {
        cluster.a.remote_offset_of(BlockId(60_000)).is_some()
    });

    let acq = cluster.a.read_acquire(BlockId(60_000))?;
    assert_eq!(acq.read_with(|buf| buf[0])?, INTERNAL_NODE_TAG);
    drop(acq);
    assert!(cluster.a.block_in_rdma_map(BlockId(60_000)));
    Ok(())
}

#[test]
fn unadmitted_remote_blocks_are_served_one_shot() -> Result<()> {
    let cluster = cluster();
    // Out of A's range, a leaf, and cold: the cost model has no reason to
    // keep it.
    seed_block(&cluster.ser_b, 60_001, 0x22, LEAF_NODE_TAG);
    load_locally(&cluster.b, 60_001);
    wait_until("ring entry for 60001", || {
        cluster.a.remote_offset_of(BlockId(60_001)).is_some()
    });

    let acq = cluster.a.read_acquire(BlockId(60_001))?;
    assert_eq!(acq.read_with(|buf| buf[1])?, 0x22);
    drop(acq);
    assert!(!cluster.a.block_in_rdma_map(BlockId(60_001)));
    assert_eq!(cluster.a.stats().rdma_hits, 1);

    // Every read fetches again: the caller got a one-shot view.
    let acq = cluster.a.read_acquire(BlockId(60_001))?;
    acq.read_with(|_| ())?;
    drop(acq);
    assert_eq!(cluster.a.stats().rdma_hits, 2);
    Ok(())
}

#[test]
fn peer_failure_degrades_to_disk_and_recovers() -> Result<()> {
    let cluster = cluster();
    // The block is on B and also on A's own disk.
    seed_block(&cluster.ser_a, 60_002, 0x33, LEAF_NODE_TAG);
    seed_block(&cluster.ser_b, 60_002, 0x33, LEAF_NODE_TAG);
    load_locally(&cluster.b, 60_002);
    wait_until("ring entry for 60002", || {
        cluster.a.remote_offset_of(BlockId(60_002)).is_some()
    });

    // Sever the link mid-flight: the fetch fails, the lookup records a
    // miss, and the read lands on local disk.
    cluster.transport.set_host_down("10.0.0.2", true);
    let acq = cluster.a.read_acquire(BlockId(60_002))?;
    assert_eq!(acq.read_with(|buf| buf[1])?, 0x33);
    drop(acq);
    let stats = cluster.a.stats();
    assert_eq!(stats.rdma_hits, 0);
    assert!(stats.misses >= 1);

    // Polling fails silently while the peer is away and resumes after it
    // returns.
    cluster.transport.set_host_down("10.0.0.2", false);
    seed_block(&cluster.ser_b, 60_003, 0x44, LEAF_NODE_TAG);
    load_locally(&cluster.b, 60_003);
    wait_until("ring entry for 60003", || {
        cluster.a.remote_offset_of(BlockId(60_003)).is_some()
    });
    Ok(())
}

#[test]
fn absent_ring_entries_fall_through_to_disk() -> Result<()> {
    let cluster = cluster();
    // Nobody advertises this block; the read comes straight from disk.
    seed_block(&cluster.ser_a, 60_004, 0x55, LEAF_NODE_TAG);
    assert!(cluster.a.remote_offset_of(BlockId(60_004)).is_none());

    let acq = cluster.a.read_acquire(BlockId(60_004))?;
    assert_eq!(acq.read_with(|buf| buf[1])?, 0x55);
    drop(acq);
    let stats = cluster.a.stats();
    assert_eq!(stats.rdma_hits, 0);
    assert!(cluster.a.block_in_primary_map(BlockId(60_004)));
    Ok(())
}
