//! Stress tests for concurrent pins, eviction and checkpoints.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cachetable::{
    BlockFile, BlockKey, BlockNum, BlockOps, Cachetable, Cloned, Dirtiness, Fetched, FlushArgs,
    LockMode, OptionsBuilder, PairAttr, Result, Unlockers,
};
use tempfile::TempDir;

const NODE_SIZE: usize = 64;

/// A counter block stored as 8 little-endian bytes.
#[derive(Debug, Clone)]
struct Counter(u64);

#[derive(Default)]
struct CounterOps {
    cloneable: bool,
    writes: AtomicUsize,
}

impl BlockOps<Counter> for CounterOps {
    fn fetch(&self, file: &BlockFile, key: BlockKey, _fullhash: u32) -> Result<Fetched<Counter>> {
        let value = match file.read_block(key.block_num)? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(buf)
            }
            None => 0,
        };
        Ok(Fetched::clean(Counter(value), PairAttr::new(NODE_SIZE)))
    }

    fn flush(&self, file: &BlockFile, value: &mut Counter, args: &FlushArgs) -> Result<()> {
        if args.write_me {
            file.write_block(args.key.block_num, &value.0.to_le_bytes())?;
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn clone_value(&self, value: &Counter) -> Option<Cloned<Counter>> {
        self.cloneable.then(|| Cloned {
            value: value.clone(),
            attr: PairAttr::new(NODE_SIZE),
        })
    }
}

fn tight_options() -> cachetable::Options {
    OptionsBuilder::new()
        .size_limit(NODE_SIZE * 16)
        .evictor_period(Some(Duration::from_millis(5)))
        .cleaner_period(Some(Duration::from_millis(10)))
        .checkpoint_period(None)
        .kibbutz_threads(2)
        .build()
        .unwrap()
}

/// Many writers incrementing counters through a cache far smaller than the
/// working set lose no increments.
#[test]
fn stress_concurrent_increments_with_eviction() {
    let dir = TempDir::new().unwrap();
    let ct: Arc<Cachetable<Counter>> = Cachetable::new(tight_options()).unwrap();
    let cf = ct.open_cachefile(dir.path().join("counters.db")).unwrap();
    let ops: Arc<dyn BlockOps<Counter>> = Arc::new(CounterOps::default());

    let num_threads = 8;
    let blocks = 64u64;
    let rounds = 200u64;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let ct = Arc::clone(&ct);
            let cf = Arc::clone(&cf);
            let ops = Arc::clone(&ops);
            thread::spawn(move || {
                for i in 0..rounds {
                    let block = BlockNum((t * 7 + i * 13) % blocks);
                    let mut pin = ct
                        .get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteCheap)
                        .unwrap();
                    pin.value_mut().0 += 1;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    ct.checkpoint().unwrap();
    let mut total = 0;
    for n in 0..blocks {
        let block = BlockNum(n);
        let pin = ct
            .get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::Read)
            .unwrap();
        total += pin.value().0;
    }
    assert_eq!(total, num_threads * rounds);
    assert!(ct.status().evictions_dirty + ct.status().evictions_clean > 0);
    ct.verify().unwrap();
}

/// Checkpoints taken while writers run always complete, and every
/// increment survives a reopen.
#[test]
fn stress_checkpoints_during_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counters.db");
    let ops: Arc<dyn BlockOps<Counter>> = Arc::new(CounterOps {
        cloneable: true,
        ..CounterOps::default()
    });

    let num_threads = 4u64;
    let rounds = 300u64;
    let blocks = 32u64;
    {
        let ct: Arc<Cachetable<Counter>> = Cachetable::new(tight_options()).unwrap();
        let cf = ct.open_cachefile(&path).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let checkpointer = {
            let ct = Arc::clone(&ct);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut taken = 0;
                while !stop.load(Ordering::SeqCst) {
                    ct.checkpoint().unwrap();
                    taken += 1;
                    thread::sleep(Duration::from_millis(2));
                }
                taken
            })
        };

        let writers: Vec<_> = (0..num_threads)
            .map(|t| {
                let ct = Arc::clone(&ct);
                let cf = Arc::clone(&cf);
                let ops = Arc::clone(&ops);
                thread::spawn(move || {
                    for i in 0..rounds {
                        let block = BlockNum((t + i) % blocks);
                        let mut pin = ct
                            .get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteCheap)
                            .unwrap();
                        pin.value_mut().0 += 1;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        assert!(checkpointer.join().unwrap() > 0);

        ct.close_cachefile(&cf).unwrap();
    }

    let ct: Arc<Cachetable<Counter>> = Cachetable::new(tight_options()).unwrap();
    let cf = ct.open_cachefile(&path).unwrap();
    let mut total = 0;
    for n in 0..blocks {
        let block = BlockNum(n);
        total += ct
            .get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::Read)
            .unwrap()
            .value()
            .0;
    }
    assert_eq!(total, num_threads * rounds);
}

/// Non-blocking readers retrying on TryAgain make progress alongside
/// blocking writers.
#[test]
fn stress_nonblocking_retries() {
    let dir = TempDir::new().unwrap();
    let ct: Arc<Cachetable<Counter>> = Cachetable::new(tight_options()).unwrap();
    let cf = ct.open_cachefile(dir.path().join("counters.db")).unwrap();
    let ops: Arc<dyn BlockOps<Counter>> = Arc::new(CounterOps::default());
    let reads = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let ct = Arc::clone(&ct);
        let cf = Arc::clone(&cf);
        let ops = Arc::clone(&ops);
        handles.push(thread::spawn(move || {
            for i in 0..200u64 {
                let block = BlockNum((t * 3 + i) % 48);
                let mut pin = ct
                    .get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteExpensive)
                    .unwrap();
                pin.value_mut().0 += 1;
            }
        }));
    }
    for t in 0..4u64 {
        let ct = Arc::clone(&ct);
        let cf = Arc::clone(&cf);
        let ops = Arc::clone(&ops);
        let reads = Arc::clone(&reads);
        handles.push(thread::spawn(move || {
            for i in 0..200u64 {
                let block = BlockNum((t * 5 + i) % 48);
                loop {
                    let mut unlockers = Unlockers::new();
                    match ct.get_and_pin_nonblocking(
                        &cf,
                        block,
                        cf.hash(block),
                        &ops,
                        LockMode::Read,
                        &mut unlockers,
                    ) {
                        Ok(pin) => {
                            let _ = pin.value().0;
                            reads.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => assert!(e.is_try_again(), "unexpected error: {}", e),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(reads.load(Ordering::SeqCst), 800);
    ct.verify().unwrap();
}

/// Opening and closing cachefiles repeatedly keeps data and accounting
/// intact.
#[test]
fn stress_open_close_cycles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cycles.db");
    let ct: Arc<Cachetable<Counter>> = Cachetable::new(tight_options()).unwrap();
    let ops: Arc<dyn BlockOps<Counter>> = Arc::new(CounterOps::default());

    for cycle in 0..20u64 {
        let cf = ct.open_cachefile(&path).unwrap();
        for n in 0..8 {
            let block = BlockNum(n);
            let pin = ct
                .get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteCheap)
                .unwrap();
            assert_eq!(pin.value().0, cycle);
            let mut pin = pin;
            pin.value_mut().0 += 1;
            pin.unpin(Dirtiness::Dirty, None);
        }
        ct.close_cachefile(&cf).unwrap();
        assert!(ct.is_empty());
        assert_eq!(ct.size_current(), 0);
    }
}
