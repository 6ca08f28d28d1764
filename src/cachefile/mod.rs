//! Cachefiles: the backing files whose blocks the cachetable caches.
//!
//! A [`CacheFile`] is created by [`Cachetable::open_cachefile`] and lives
//! until [`Cachetable::close_cachefile`]. Its lifecycle is
//! `Open -> MarkedForClose -> Closed`; once marked, new pins and new
//! background jobs against the file are refused.
//!
//! [`Cachetable::open_cachefile`]: crate::Cachetable::open_cachefile
//! [`Cachetable::close_cachefile`]: crate::Cachetable::close_cachefile

mod file;
mod kibbutz;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{BlockKey, BlockNum, FileId};
use crate::{Error, Result};

pub use file::{BlockFile, BLOCK_HEADER_SIZE};
pub(crate) use kibbutz::{BackgroundJobs, Job, Kibbutz};

/// Lifecycle state of a cachefile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFileState {
    /// Accepting pins.
    Open,
    /// Close has started; pins and background jobs are refused.
    MarkedForClose,
    /// Closed; the OS handle has been released.
    Closed,
}

/// Hooks the owner of a cachefile may install.
///
/// All methods have no-op defaults.
pub trait CacheFileHooks: Send + Sync {
    /// A checkpoint including this file is starting. Runs while new
    /// checkpoint-pending marks are being taken.
    fn begin_checkpoint(&self, _file_id: FileId, _checkpoint_id: u64) -> Result<()> {
        Ok(())
    }

    /// Every pending pair of the file has been written for the checkpoint.
    fn checkpoint_complete(&self, _file_id: FileId, _checkpoint_id: u64) -> Result<()> {
        Ok(())
    }

    /// The file is closing; every pair has already been written or
    /// discarded. The file is still open for I/O.
    fn close(&self, _file: &BlockFile) -> Result<()> {
        Ok(())
    }

    /// Release user data attached to the file. Runs after `close`.
    fn free(&self) {}
}

/// An open backing file registered with a cachetable.
pub struct CacheFile {
    id: FileId,
    path: PathBuf,
    file: BlockFile,
    state: Mutex<CacheFileState>,
    hooks: Option<Arc<dyn CacheFileHooks>>,
    unlink_on_close: AtomicBool,
    pub(crate) jobs: BackgroundJobs,
}

impl CacheFile {
    pub(crate) fn new(
        id: FileId,
        path: PathBuf,
        file: BlockFile,
        hooks: Option<Arc<dyn CacheFileHooks>>,
    ) -> Self {
        Self {
            id,
            path,
            file,
            state: Mutex::new(CacheFileState::Open),
            hooks,
            unlink_on_close: AtomicBool::new(false),
            jobs: BackgroundJobs::new(),
        }
    }

    /// Identifier of this file within its cachetable.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Path the file was opened with (canonicalized).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backing file.
    pub fn file(&self) -> &BlockFile {
        &self.file
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CacheFileState {
        *self.state.lock()
    }

    /// Whether the file accepts pins.
    pub fn is_open(&self) -> bool {
        self.state() == CacheFileState::Open
    }

    /// Key of `block` in this file.
    pub fn key(&self, block: BlockNum) -> BlockKey {
        BlockKey::new(self.id, block)
    }

    /// The fullhash callers pass along with `block`.
    pub fn hash(&self, block: BlockNum) -> u32 {
        self.key(block).fullhash()
    }

    /// Remove the file from disk when it is closed.
    pub fn set_unlink_on_close(&self, unlink: bool) {
        self.unlink_on_close.store(unlink, Ordering::SeqCst);
    }

    /// Whether the file will be removed on close.
    pub fn unlink_on_close(&self) -> bool {
        self.unlink_on_close.load(Ordering::SeqCst)
    }

    pub(crate) fn hooks(&self) -> Option<&Arc<dyn CacheFileHooks>> {
        self.hooks.as_ref()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::CacheFileClosed(self.path.display().to_string()))
        }
    }

    /// Move `Open -> MarkedForClose`.
    pub(crate) fn mark_for_close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != CacheFileState::Open {
            return Err(Error::CacheFileClosed(self.path.display().to_string()));
        }
        *state = CacheFileState::MarkedForClose;
        Ok(())
    }

    /// Undo a mark when close has to be abandoned.
    pub(crate) fn reopen(&self) {
        let mut state = self.state.lock();
        if *state == CacheFileState::MarkedForClose {
            *state = CacheFileState::Open;
        }
    }

    pub(crate) fn set_closed(&self) {
        *self.state.lock() = CacheFileState::Closed;
    }
}

impl fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .field("has_hooks", &self.hooks.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cachefile(dir: &TempDir) -> CacheFile {
        let path = dir.path().join("cf.db");
        let file = BlockFile::open(&path, 512).unwrap();
        CacheFile::new(FileId(4), path, file, None)
    }

    #[test]
    fn test_hash_matches_key() {
        let dir = TempDir::new().unwrap();
        let cf = cachefile(&dir);
        let key = cf.key(BlockNum(17));
        assert_eq!(key, BlockKey::new(FileId(4), BlockNum(17)));
        assert_eq!(cf.hash(BlockNum(17)), key.fullhash());
    }

    #[test]
    fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let cf = cachefile(&dir);
        assert!(cf.is_open());
        assert!(cf.check_open().is_ok());

        cf.mark_for_close().unwrap();
        assert_eq!(cf.state(), CacheFileState::MarkedForClose);
        assert!(matches!(cf.check_open(), Err(Error::CacheFileClosed(_))));
        assert!(cf.mark_for_close().is_err());

        cf.reopen();
        assert!(cf.is_open());

        cf.mark_for_close().unwrap();
        cf.set_closed();
        cf.reopen();
        assert_eq!(cf.state(), CacheFileState::Closed);
    }

    #[test]
    fn test_unlink_flag() {
        let dir = TempDir::new().unwrap();
        let cf = cachefile(&dir);
        assert!(!cf.unlink_on_close());
        cf.set_unlink_on_close(true);
        assert!(cf.unlink_on_close());
    }
}
