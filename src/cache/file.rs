use crate::cache::callbacks::{CacheClient, FileUserdata};
use crate::error::{Error, Result};
use crate::jobs::BackgroundJobManager;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Logical file number, unique for the lifetime of the cachetable and
/// monotonically reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileNum(pub u32);

/// OS identity of an open file, used to normalize repeated opens of the
/// same underlying file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    pub device: u64,
    pub inode: u64,
}

#[inline]
pub(crate) fn file_id_of(fd: &File) -> Result<FileId> {
    let meta = fd.metadata()?;
    Ok(FileId {
        device: meta.dev(),
        inode: meta.ino(),
    })
}

/// Composes a path from parts; an absolute part resets the accumulation.
pub fn construct_full_name<I, P>(parts: I) -> PathBuf
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut full = PathBuf::new();
    for part in parts {
        full.push(part);
    }
    full
}

/// Thin handle grouping a file descriptor, its identity, per-file user
/// data and the background-job counter used as a barrier for safe close.
pub struct CacheFile<C: CacheClient> {
    fd: File,
    fileid: FileId,
    filenum: FileNum,
    fname_in_env: String,
    userdata: Mutex<Option<Arc<dyn FileUserdata<C>>>>,
    pub(crate) bjm: BackgroundJobManager,
    unlink_on_close: AtomicBool,
    /// Set while a checkpoint that includes this file is in progress.
    pub(crate) for_checkpoint: AtomicBool,
}

impl<C: CacheClient> CacheFile<C> {
    pub(crate) fn new(fd: File, fileid: FileId, filenum: FileNum, fname_in_env: &str) -> Self {
        CacheFile {
            fd,
            fileid,
            filenum,
            fname_in_env: fname_in_env.to_string(),
            userdata: Mutex::new(None),
            bjm: BackgroundJobManager::new(),
            unlink_on_close: AtomicBool::new(false),
            for_checkpoint: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn fd(&self) -> &File {
        &self.fd
    }

    #[inline]
    pub fn filenum(&self) -> FileNum {
        self.filenum
    }

    #[inline]
    pub fn fileid(&self) -> FileId {
        self.fileid
    }

    #[inline]
    pub fn fname_in_env(&self) -> &str {
        &self.fname_in_env
    }

    #[inline]
    pub fn set_userdata(&self, userdata: Arc<dyn FileUserdata<C>>) {
        *self.userdata.lock() = Some(userdata);
    }

    #[inline]
    pub(crate) fn userdata(&self) -> Option<Arc<dyn FileUserdata<C>>> {
        self.userdata.lock().clone()
    }

    #[inline]
    pub fn set_unlink_on_close(&self) {
        self.unlink_on_close.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_unlink_on_close(&self) -> bool {
        self.unlink_on_close.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_for_checkpoint(&self) -> bool {
        self.for_checkpoint.load(Ordering::Acquire)
    }

    #[inline]
    pub fn fsync(&self) -> Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub(crate) struct CfInner<C: CacheClient> {
    pub(crate) files: Vec<Arc<CacheFile<C>>>,
    next_filenum: u32,
}

/// Process-wide list of open cache files behind one reader/writer lock.
pub(crate) struct CacheFileList<C: CacheClient> {
    inner: RwLock<CfInner<C>>,
}

impl<C: CacheClient> CacheFileList<C> {
    pub(crate) fn new() -> Self {
        CacheFileList {
            inner: RwLock::new(CfInner {
                files: Vec::new(),
                next_filenum: 0,
            }),
        }
    }

    /// Snapshot of the open files.
    pub(crate) fn all(&self) -> Vec<Arc<CacheFile<C>>> {
        self.inner.read().files.clone()
    }

    /// Read access to the list itself, for sections that must hold the
    /// cachefile-list lock across other lock acquisitions.
    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, CfInner<C>> {
        self.inner.read()
    }

    pub(crate) fn find_by_filenum(&self, filenum: FileNum) -> Result<Arc<CacheFile<C>>> {
        let g = self.inner.read();
        g.files
            .iter()
            .find(|cf| cf.filenum == filenum)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub(crate) fn find_by_iname(&self, iname_in_env: &str) -> Result<Arc<CacheFile<C>>> {
        let g = self.inner.read();
        g.files
            .iter()
            .find(|cf| cf.fname_in_env == iname_in_env)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Reserves the first unused filenum at or after the monotonic cursor.
    pub(crate) fn reserve_filenum(&self) -> FileNum {
        let mut g = self.inner.write();
        loop {
            let candidate = g.next_filenum;
            g.next_filenum = g.next_filenum.wrapping_add(1);
            if !g.files.iter().any(|cf| cf.filenum.0 == candidate) {
                return FileNum(candidate);
            }
        }
    }

    /// Inserts a new file, normalizing by OS identity: when a file with
    /// the same identity is already open, the extant handle is returned
    /// and the caller's descriptor is dropped.
    pub(crate) fn insert_or_reuse(
        &self,
        make: impl FnOnce() -> Arc<CacheFile<C>>,
        fileid: FileId,
        filenum: FileNum,
    ) -> Result<Arc<CacheFile<C>>> {
        let mut g = self.inner.write();
        if let Some(extant) = g.files.iter().find(|cf| cf.fileid == fileid) {
            // Clients serialize open, close and unlink, so an extant file
            // is never closing or marked unlink-on-close.
            assert!(!extant.is_unlink_on_close());
            return Ok(Arc::clone(extant));
        }
        assert!(!g.files.iter().any(|cf| cf.filenum == filenum));
        let cf = make();
        g.files.insert(0, Arc::clone(&cf));
        Ok(cf)
    }

    pub(crate) fn remove(&self, cf: &Arc<CacheFile<C>>) {
        let mut g = self.inner.write();
        g.files.retain(|f| !Arc::ptr_eq(f, cf));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().files.is_empty()
    }
}
