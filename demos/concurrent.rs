//! Concurrent access example for cachetable.
//!
//! Run with: cargo run --example concurrent

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cachetable::{
    BlockFile, BlockKey, BlockNum, BlockOps, Cachetable, Fetched, FlushArgs, LockMode,
    OptionsBuilder, PairAttr,
};
use tempfile::TempDir;

const BLOCK_SIZE: usize = 512;

/// A counter padded out to a fixed block size.
struct CounterOps;

impl BlockOps<u64> for CounterOps {
    fn fetch(&self, file: &BlockFile, key: BlockKey, _fullhash: u32) -> cachetable::Result<Fetched<u64>> {
        let value = match file.read_block(key.block_num)? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(buf)
            }
            None => 0,
        };
        Ok(Fetched::clean(value, PairAttr::new(BLOCK_SIZE)))
    }

    fn flush(&self, file: &BlockFile, value: &mut u64, args: &FlushArgs) -> cachetable::Result<()> {
        if args.write_me {
            file.write_block(args.key.block_num, &value.to_le_bytes())?;
        }
        Ok(())
    }
}

fn main() -> cachetable::Result<()> {
    let dir = TempDir::new().expect("failed to create temp dir");

    // Room for 128 blocks; the working set is 1024.
    let options = OptionsBuilder::new()
        .size_limit(BLOCK_SIZE * 128)
        .evictor_period(Some(Duration::from_millis(10)))
        .cleaner_period(Some(Duration::from_millis(50)))
        .build()?;
    let ct: Arc<Cachetable<u64>> = Cachetable::new(options)?;
    let cf = ct.open_cachefile(dir.path().join("counters.db"))?;
    let ops: Arc<dyn BlockOps<u64>> = Arc::new(CounterOps);

    println!("=== Concurrent Access Example ===\n");

    let num_writers = 4;
    let num_readers = 4;
    let ops_per_thread = 5000u64;
    let blocks = 1024u64;

    let start = Instant::now();
    let mut handles = Vec::new();

    for w in 0..num_writers {
        let ct = Arc::clone(&ct);
        let cf = Arc::clone(&cf);
        let ops = Arc::clone(&ops);
        handles.push(thread::spawn(move || -> cachetable::Result<()> {
            for i in 0..ops_per_thread {
                let block = BlockNum((w * 31 + i * 17) % blocks);
                let mut pin = ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteCheap)?;
                *pin.value_mut() += 1;
            }
            Ok(())
        }));
    }

    for r in 0..num_readers {
        let ct = Arc::clone(&ct);
        let cf = Arc::clone(&cf);
        let ops = Arc::clone(&ops);
        handles.push(thread::spawn(move || -> cachetable::Result<()> {
            let mut sum = 0u64;
            for i in 0..ops_per_thread {
                let block = BlockNum((r * 7 + i * 3) % blocks);
                let pin = ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::Read)?;
                sum += *pin.value();
            }
            println!("reader {} saw sum {}", r, sum);
            Ok(())
        }));
    }

    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    let elapsed = start.elapsed();

    let total_ops = (num_writers + num_readers) * ops_per_thread;
    println!(
        "\n{} pins in {:?} ({:.0} pins/sec)",
        total_ops,
        elapsed,
        total_ops as f64 / elapsed.as_secs_f64()
    );

    ct.checkpoint()?;
    let mut total = 0;
    for n in 0..blocks {
        let block = BlockNum(n);
        total += *ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::Read)?.value();
    }
    println!("Total increments: {} (expected {})", total, num_writers * ops_per_thread);

    println!("\n{}", ct.status());
    Ok(())
}
