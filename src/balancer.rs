//! Cache balancer contract.
//!
//! The balancer owns the memory budget and wants to hear about cache
//! activity, but not on every access: it arms a shared flag, the evicter
//! disarms it on the first activity it sees and enqueues one wake-up message
//! onto the balancer's inbox. The balancer consumes the message, reacts, and
//! re-arms the flag when it wants the next notification.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

pub trait CacheBalancer: Send + Sync {
    /// Memory budget assigned to each store.
    fn base_mem_per_store(&self) -> u64;

    /// Whether caches may accept read-ahead buffers at startup.
    fn read_ahead_ok_at_start(&self) -> bool;

    fn add_evicter(&self);

    fn remove_evicter(&self);

    /// The shared notify-me flag. The evicter clears it when activity
    /// happens; the balancer re-arms it.
    fn activity_flag(&self) -> Arc<AtomicBool>;

    /// Delivers one "activity observed" message to the balancer.
    fn wake_up_activity_happened(&self);
}

/// A balancer with a fixed per-store budget. Activity wake-ups are consumed
/// on a small worker thread which immediately re-arms the flag, so every
/// burst of cache traffic produces exactly one message.
pub struct FixedBalancer {
    base_mem: u64,
    read_ahead_ok: bool,
    flag: Arc<AtomicBool>,
    evicters: AtomicUsize,
    wakeups_seen: Arc<AtomicUsize>,
    inbox: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FixedBalancer {
    pub fn new(base_mem: u64, read_ahead_ok: bool) -> Arc<FixedBalancer> {
        let flag = Arc::new(AtomicBool::new(true));
        let wakeups_seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx): (Sender<()>, Receiver<()>) = mpsc::channel();

        let worker_flag = Arc::clone(&flag);
        let worker_seen = Arc::clone(&wakeups_seen);
        let worker = thread::Builder::new()
            .name("cache-balancer".into())
            .spawn(move || {
                while rx.recv().is_ok() {
                    worker_seen.fetch_add(1, Ordering::Relaxed);
                    debug!("balancer.activity_happened");
                    worker_flag.store(true, Ordering::Release);
                }
            })
            .expect("spawn balancer worker");

        Arc::new(FixedBalancer {
            base_mem,
            read_ahead_ok,
            flag,
            evicters: AtomicUsize::new(0),
            wakeups_seen,
            inbox: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn evicter_count(&self) -> usize {
        self.evicters.load(Ordering::Relaxed)
    }

    pub fn wakeups_seen(&self) -> usize {
        self.wakeups_seen.load(Ordering::Relaxed)
    }
}

impl CacheBalancer for FixedBalancer {
    fn base_mem_per_store(&self) -> u64 {
        self.base_mem
    }

    fn read_ahead_ok_at_start(&self) -> bool {
        self.read_ahead_ok
    }

    fn add_evicter(&self) {
        self.evicters.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_evicter(&self) {
        self.evicters.fetch_sub(1, Ordering::Relaxed);
    }

    fn activity_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    fn wake_up_activity_happened(&self) {
        let inbox = self.inbox.lock().expect("balancer inbox");
        if let Some(tx) = inbox.as_ref() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FixedBalancer {
    fn drop(&mut self) {
        // Close the inbox so the worker drains and exits.
        self.inbox.lock().expect("balancer inbox").take();
        if let Some(handle) = self.worker.lock().expect("balancer worker").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn wakeup_rearms_flag() {
        let balancer = FixedBalancer::new(1 << 20, true);
        let flag = balancer.activity_flag();

        // Evicter-side handshake: observe armed flag, disarm, send wake-up.
        assert!(flag.swap(false, Ordering::AcqRel));
        balancer.wake_up_activity_happened();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !flag.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(balancer.wakeups_seen(), 1);
    }

    #[test]
    fn evicter_registration_counts() {
        let balancer = FixedBalancer::new(64, false);
        balancer.add_evicter();
        balancer.add_evicter();
        balancer.remove_evicter();
        assert_eq!(balancer.evicter_count(), 1);
        assert!(!balancer.read_ahead_ok_at_start());
    }
}
