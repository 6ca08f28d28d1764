//! Backing file for a cachefile.
//!
//! Blocks are addressed by number and stored in fixed-size slots:
//!
//! ```text
//! +------------------+------------------+---------------------+---------+
//! | length (4 bytes) | masked crc (4 B) | payload (length B)  | padding |
//! +------------------+------------------+---------------------+---------+
//! ```
//!
//! The framing helpers are a convenience for [`BlockOps`](crate::BlockOps)
//! implementations; callbacks that manage their own layout can use the raw
//! positional `read_at`/`write_at` methods instead.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::types::BlockNum;
use crate::{Error, Result};

/// Size of the slot header (length + checksum).
pub const BLOCK_HEADER_SIZE: usize = 8;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Mask a CRC so that checksums of data containing CRCs stay well spread.
fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// A file supporting concurrent positional reads and writes.
///
/// The OS handle is dropped by [`BlockFile::close`]; any I/O after that fails
/// with [`Error::CacheFileClosed`].
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    file: RwLock<Option<File>>,
    block_size: usize,
}

impl BlockFile {
    /// Open (creating if missing) a block file.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            file: RwLock::new(Some(file)),
            block_size,
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Slot size used by the framing helpers.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Largest payload [`write_block`](Self::write_block) accepts.
    pub fn max_payload(&self) -> usize {
        self.block_size - BLOCK_HEADER_SIZE
    }

    /// Whether the OS handle is still open.
    pub fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> Result<T> {
        let guard = self.file.read();
        match guard.as_ref() {
            Some(file) => f(file).map_err(Error::from),
            None => Err(Error::CacheFileClosed(self.path.display().to_string())),
        }
    }

    /// Read into `buf` starting at `offset`, returning the bytes read.
    ///
    /// Reading past the end of the file yields a short count, not an error.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_file(|file| {
            let mut total = 0;
            while total < buf.len() {
                match file.read_at(&mut buf[total..], offset + total as u64) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(total)
        })
    }

    /// Write all of `data` at `offset`.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        self.with_file(|file| file.write_all_at(data, offset))
    }

    /// Flush file data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.with_file(|file| file.sync_data())
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        self.with_file(|file| file.metadata().map(|m| m.len()))
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn slot_offset(&self, block: BlockNum) -> u64 {
        block.0 * self.block_size as u64
    }

    /// Write a framed block into its slot.
    pub fn write_block(&self, block: BlockNum, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(Error::InvalidState(format!(
                "block {} payload of {} bytes exceeds slot capacity {}",
                block.0,
                payload.len(),
                self.max_payload()
            )));
        }

        let mut frame = BytesMut::with_capacity(self.block_size);
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(mask_crc(crc32fast::hash(payload)));
        frame.put_slice(payload);
        frame.resize(self.block_size, 0);

        self.write_at(&frame, self.slot_offset(block))
    }

    /// Read a framed block.
    ///
    /// Returns `Ok(None)` for a slot that was never written.
    pub fn read_block(&self, block: BlockNum) -> Result<Option<Bytes>> {
        let mut slot = vec![0u8; self.block_size];
        let n = self.read_at(&mut slot, self.slot_offset(block))?;
        if n < BLOCK_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
        let masked = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]);
        if len == 0 && masked == 0 {
            return Ok(None);
        }
        if len > self.max_payload() || BLOCK_HEADER_SIZE + len > n {
            return Err(Error::corruption(format!(
                "block {} in {} claims {} bytes",
                block.0,
                self.path.display(),
                len
            )));
        }

        let payload = &slot[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + len];
        let expected = unmask_crc(masked);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Some(Bytes::copy_from_slice(payload)))
    }

    /// Sync and drop the OS handle. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.write();
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_file(dir: &TempDir) -> BlockFile {
        BlockFile::open(dir.path().join("blocks.db"), 256).unwrap()
    }

    #[test]
    fn test_crc_mask_roundtrip() {
        for crc in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(unmask_crc(mask_crc(crc)), crc);
        }
    }

    #[test]
    fn test_block_write_read() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);

        file.write_block(BlockNum(3), b"hello block").unwrap();
        let data = file.read_block(BlockNum(3)).unwrap().unwrap();
        assert_eq!(&data[..], b"hello block");

        // Slots before the written one read as holes.
        assert!(file.read_block(BlockNum(1)).unwrap().is_none());
        // Past end of file.
        assert!(file.read_block(BlockNum(10)).unwrap().is_none());
    }

    #[test]
    fn test_block_overwrite() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);

        file.write_block(BlockNum(0), b"first version").unwrap();
        file.write_block(BlockNum(0), b"v2").unwrap();
        assert_eq!(&file.read_block(BlockNum(0)).unwrap().unwrap()[..], b"v2");
    }

    #[test]
    fn test_payload_too_large() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        let big = vec![7u8; file.max_payload() + 1];
        assert!(matches!(
            file.write_block(BlockNum(0), &big),
            Err(Error::InvalidState(_))
        ));
        let fits = vec![7u8; file.max_payload()];
        file.write_block(BlockNum(0), &fits).unwrap();
    }

    #[test]
    fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        file.write_block(BlockNum(2), b"precious data").unwrap();

        // Flip a payload byte behind the framing's back.
        let offset = 2 * 256 + BLOCK_HEADER_SIZE as u64;
        file.write_at(b"P", offset).unwrap();

        let err = file.read_block(BlockNum(2)).unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, Error::CrcMismatch { .. }));
    }

    #[test]
    fn test_close_rejects_io() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        file.write_block(BlockNum(0), b"x").unwrap();
        file.close().unwrap();
        file.close().unwrap();

        assert!(!file.is_open());
        assert!(matches!(
            file.read_block(BlockNum(0)),
            Err(Error::CacheFileClosed(_))
        ));
    }

    #[test]
    fn test_reopen_sees_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.db");
        {
            let file = BlockFile::open(&path, 128).unwrap();
            file.write_block(BlockNum(5), b"durable").unwrap();
            file.close().unwrap();
        }
        let file = BlockFile::open(&path, 128).unwrap();
        assert_eq!(&file.read_block(BlockNum(5)).unwrap().unwrap()[..], b"durable");
        assert_eq!(file.len().unwrap(), 6 * 128);
    }
}
