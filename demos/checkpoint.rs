//! Checkpoint example for cachetable.
//!
//! Shows a writer modifying a block while a checkpoint is in progress: the
//! checkpoint writes the block as it was at begin, via a clone.
//!
//! Run with: RUST_LOG=cachetable=debug cargo run --example checkpoint

use std::sync::Arc;

use cachetable::{
    BlockFile, BlockKey, BlockNum, BlockOps, CacheFileHooks, Cachetable, Cloned, Dirtiness, Fetched,
    FileId, FlushArgs, LockMode, Options, PairAttr,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Blocks are lists of numbers; cloning is cheap enough to always allow.
struct ListOps;

impl BlockOps<Vec<u32>> for ListOps {
    fn fetch(&self, file: &BlockFile, key: BlockKey, _fullhash: u32) -> cachetable::Result<Fetched<Vec<u32>>> {
        let list: Vec<u32> = match file.read_block(key.block_num)? {
            Some(bytes) => bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            None => Vec::new(),
        };
        let attr = PairAttr::new(list.len() * 4 + 16);
        Ok(Fetched::clean(list, attr))
    }

    fn flush(&self, file: &BlockFile, value: &mut Vec<u32>, args: &FlushArgs) -> cachetable::Result<()> {
        if args.write_me {
            let bytes: Vec<u8> = value.iter().flat_map(|v| v.to_le_bytes()).collect();
            file.write_block(args.key.block_num, &bytes)?;
            println!(
                "  wrote block {} = {:?} (checkpoint: {}, clone: {})",
                args.key.block_num.0, value, args.for_checkpoint, args.is_clone
            );
        }
        Ok(())
    }

    fn clone_value(&self, value: &Vec<u32>) -> Option<Cloned<Vec<u32>>> {
        Some(Cloned {
            value: value.clone(),
            attr: PairAttr::new(value.len() * 4 + 16),
        })
    }
}

struct PrintHooks;

impl CacheFileHooks for PrintHooks {
    fn begin_checkpoint(&self, file_id: FileId, checkpoint_id: u64) -> cachetable::Result<()> {
        println!("  [file {}] checkpoint {} begins", file_id.0, checkpoint_id);
        Ok(())
    }

    fn checkpoint_complete(&self, file_id: FileId, checkpoint_id: u64) -> cachetable::Result<()> {
        println!("  [file {}] checkpoint {} complete", file_id.0, checkpoint_id);
        Ok(())
    }
}

fn main() -> cachetable::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = TempDir::new().expect("failed to create temp dir");
    let ct: Arc<Cachetable<Vec<u32>>> = Cachetable::new(Options::for_testing())?;
    let cf = ct.open_cachefile_with_hooks(dir.path().join("lists.db"), Arc::new(PrintHooks))?;
    let ops: Arc<dyn BlockOps<Vec<u32>>> = Arc::new(ListOps);

    println!("=== Checkpoint Example ===\n");

    let block = BlockNum(0);
    ct.put(&cf, block, cf.hash(block), vec![1, 2, 3], PairAttr::new(28), &ops)?
        .unpin(Dirtiness::Dirty, None);

    println!("begin_checkpoint");
    ct.begin_checkpoint()?;

    println!("writer appends 4 while the checkpoint is pending");
    {
        let mut pin = ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteCheap)?;
        pin.value_mut().push(4);
    }

    println!("end_checkpoint");
    let stats = ct.end_checkpoint()?;
    println!(
        "checkpoint {}: {} pending, {} cloned, {} written\n",
        stats.id, stats.pairs_pending, stats.pairs_cloned, stats.pairs_written
    );

    let state = ct.key_state(&cf, block, cf.hash(block));
    println!("block 0 still dirty after checkpoint: {:?}", state.map(|s| s.dirty));

    println!("\nclose_cachefile");
    ct.close_cachefile(&cf)?;
    Ok(())
}
