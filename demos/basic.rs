//! Basic usage example for cachetable.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use cachetable::{
    BlockFile, BlockKey, BlockNum, BlockOps, Cachetable, Dirtiness, Fetched, FlushArgs, LockMode,
    Options, PairAttr,
};
use tempfile::TempDir;

/// A block holding a UTF-8 string.
struct TextOps;

impl BlockOps<String> for TextOps {
    fn fetch(&self, file: &BlockFile, key: BlockKey, _fullhash: u32) -> cachetable::Result<Fetched<String>> {
        let text = match file.read_block(key.block_num)? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => String::new(),
        };
        let attr = PairAttr::new(text.len().max(1));
        Ok(Fetched::clean(text, attr))
    }

    fn flush(&self, file: &BlockFile, value: &mut String, args: &FlushArgs) -> cachetable::Result<()> {
        if args.write_me {
            file.write_block(args.key.block_num, value.as_bytes())?;
        }
        Ok(())
    }
}

fn main() -> cachetable::Result<()> {
    // Create a temporary directory for the backing file
    let dir = TempDir::new().expect("failed to create temp dir");

    let ct: Arc<Cachetable<String>> = Cachetable::new(Options::default())?;
    let cf = ct.open_cachefile(dir.path().join("notes.db"))?;
    let ops: Arc<dyn BlockOps<String>> = Arc::new(TextOps);

    println!("Cachefile opened: {}", cf.path().display());

    // Insert new blocks
    for (n, text) in ["hello", "cache", "world"].iter().enumerate() {
        let block = BlockNum(n as u64);
        let value = text.to_string();
        let attr = PairAttr::new(value.len());
        ct.put(&cf, block, cf.hash(block), value, attr, &ops)?
            .unpin(Dirtiness::Dirty, None);
    }
    println!("Inserted 3 blocks");

    // Read one back
    let block = BlockNum(1);
    {
        let pin = ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::Read)?;
        println!("block 1 = {}", *pin.value());
    }

    // Modify it in place
    {
        let mut pin = ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::WriteCheap)?;
        pin.value_mut().push_str("table");
        let attr = PairAttr::new(pin.value().len());
        pin.unpin(Dirtiness::Dirty, Some(attr));
    }
    if let Some(state) = ct.key_state(&cf, block, cf.hash(block)) {
        println!("block 1 dirty = {}, size = {}", state.dirty, state.attr.size);
    }

    // Write everything out
    let stats = ct.checkpoint()?;
    println!(
        "Checkpoint {} wrote {} blocks in {:?}",
        stats.id, stats.pairs_written, stats.duration
    );

    // Drop the blocks from memory and read one back from disk
    let evicted = ct.flush_cachefile(&cf)?;
    println!("Evicted {} blocks", evicted);
    {
        let pin = ct.get_and_pin(&cf, block, cf.hash(block), &ops, LockMode::Read)?;
        println!("block 1 from disk = {}", *pin.value());
    }

    println!("\n{}", ct.status());

    ct.close_cachefile(&cf)?;
    println!("Cachefile closed successfully!");

    Ok(())
}
