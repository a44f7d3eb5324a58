//! `fuser` filesystem over [`RemoteFs`]
//!
//! The kernel session thread only translates requests. Anything that may
//! reach the network runs as a task on the tokio runtime, bounded by a
//! semaphore, and answers the kernel from there.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::fs::{FileAttributes, FsError, OpenFlags, RemoteFs};
use common::node::NodeKind;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};

use super::errno::errno_for;
use super::inode_table::InodeTable;

/// How long the kernel may cache attributes and entries
const TTL: Duration = Duration::from_secs(1);
const NAME_MAX: u32 = 255;

pub struct IliasFs {
    fs: Arc<RemoteFs>,
    inodes: Arc<Mutex<InodeTable>>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    unmounted: Arc<Notify>,
    uid: u32,
    gid: u32,
}

impl IliasFs {
    pub fn new(
        fs: Arc<RemoteFs>,
        inodes: Arc<Mutex<InodeTable>>,
        runtime: Handle,
        unmounted: Arc<Notify>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(fs.config().max_concurrent_ops.max(1)));
        // SAFETY: getuid/getgid cannot fail
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            fs,
            inodes,
            runtime,
            permits,
            unmounted,
            uid,
            gid,
        }
    }

    /// Run `task` on the runtime once a permit is free
    ///
    /// A reply dropped without an answer reaches the kernel as EIO.
    fn dispatch<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.lock().get_path(ino).map(str::to_string)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        self.inodes.lock().child_path(parent, name)
    }

    fn attr_builder(&self) -> AttrBuilder {
        AttrBuilder {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Turns core attributes into kernel attributes
#[derive(Debug, Clone, Copy)]
struct AttrBuilder {
    uid: u32,
    gid: u32,
}

impl AttrBuilder {
    fn build(&self, ino: u64, attrs: &FileAttributes) -> FileAttr {
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.blocks,
            atime: attrs.mtime,
            mtime: attrs.mtime,
            ctime: attrs.mtime,
            crtime: attrs.mtime,
            kind: file_type(attrs.kind),
            perm: attrs.perm,
            nlink: attrs.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: attrs.blksize,
            flags: 0,
        }
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

fn open_flags(flags: i32) -> OpenFlags {
    OpenFlags {
        write: flags & libc::O_ACCMODE != libc::O_RDONLY,
        append: flags & libc::O_APPEND != 0,
        create: flags & libc::O_CREAT != 0,
        truncate: flags & libc::O_TRUNC != 0,
    }
}

/// errno for a call that must not succeed on a read-only mount
fn refused<T>(result: Result<T, FsError>) -> libc::c_int {
    match result {
        Ok(_) => libc::EROFS,
        Err(err) => errno_for(&err),
    }
}

fn log_failure(op: &'static str, path: &str, err: &FsError) {
    let errno = errno_for(err);
    if errno == libc::ENOENT {
        tracing::debug!(op, path, errno, error = %err, "request failed");
    } else {
        tracing::warn!(op, path, errno, error = %err, "request failed");
    }
}

impl Filesystem for IliasFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        tracing::info!(root = %self.fs.cache().root().id(), "filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem session ended");
        self.unmounted.notify_one();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        let attrs = self.attr_builder();
        self.dispatch(async move {
            match fs.getattr(&path).await {
                Ok(found) => {
                    let ino = inodes.lock().lookup(&path);
                    reply.entry(&TTL, &attrs.build(ino, &found), 0);
                }
                Err(err) => {
                    log_failure("lookup", &path, &err);
                    reply.error(errno_for(&err));
                }
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.lock().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = self.fs.clone();
        let attrs = self.attr_builder();
        self.dispatch(async move {
            match fs.getattr(&path).await {
                Ok(found) => reply.attr(&TTL, &attrs.build(ino, &found)),
                Err(err) => {
                    log_failure("getattr", &path, &err);
                    reply.error(errno_for(&err));
                }
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = self.path_of(ino).unwrap_or_default();
        let errno = match (size, mode) {
            (Some(size), _) => refused(self.fs.truncate(&path, size)),
            (None, Some(mode)) => refused(self.fs.chmod(&path, mode)),
            (None, None) => libc::EROFS,
        };
        reply.error(errno);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(refused(self.fs.mkdir(&path)));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(refused(self.fs.unlink(&path)));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(refused(self.fs.rmdir(&path)));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = self.child_path(parent, name).unwrap_or_default();
        let to = self.child_path(newparent, newname).unwrap_or_default();
        reply.error(refused(self.fs.rename(&from, &to)));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = self.fs.clone();
        self.dispatch(async move {
            match fs.open(&path, open_flags(flags)).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(err) => {
                    log_failure("open", &path, &err);
                    reply.error(errno_for(&err));
                }
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        let fs = self.fs.clone();
        self.dispatch(async move {
            match fs.read(fh, offset, size as usize).await {
                Ok(data) => reply.data(&data),
                Err(err) => {
                    tracing::warn!(fh, offset, size, error = %err, "read failed");
                    reply.error(errno_for(&err));
                }
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(refused(self.fs.write(fh, offset.max(0) as u64, data)));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = self.fs.clone();
        self.dispatch(async move {
            match fs.getattr(&path).await {
                Ok(found) if found.kind == NodeKind::Directory => reply.opened(0, 0),
                Ok(_) => reply.error(libc::ENOTDIR),
                Err(err) => {
                    log_failure("opendir", &path, &err);
                    reply.error(errno_for(&err));
                }
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.dispatch(async move {
            let children = match fs.readdir(&path).await {
                Ok(children) => children,
                Err(err) => {
                    log_failure("readdir", &path, &err);
                    reply.error(errno_for(&err));
                    return;
                }
            };

            let entries: Vec<(u64, FileType, String)> = {
                let mut inodes = inodes.lock();
                let mut entries = Vec::with_capacity(children.len() + 2);
                entries.push((ino, FileType::Directory, ".".to_string()));
                entries.push((inodes.parent_inode(ino), FileType::Directory, "..".to_string()));
                let listed: HashSet<String> = children.iter().map(|child| child.name.clone()).collect();
                inodes.retain_listed(&path, &listed);
                for child in children {
                    let child_ino = inodes.assign(&InodeTable::join(&path, &child.name));
                    entries.push((child_ino, file_type(child.kind), child.name));
                }
                entries
            };

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
                if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.cache().stats();
        reply.statfs(0, 0, 0, stats.nodes, 0, common::fs::BLOCK_SIZE, NAME_MAX, common::fs::BLOCK_SIZE);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = self.child_path(parent, name).unwrap_or_default();
        reply.error(refused(self.fs.create(&path)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(!open_flags(libc::O_RDONLY).is_mutating());
        assert!(open_flags(libc::O_WRONLY).write);
        assert!(open_flags(libc::O_RDWR).write);
        assert!(open_flags(libc::O_RDONLY | libc::O_APPEND).append);
        assert!(open_flags(libc::O_RDONLY | libc::O_CREAT).create);
        assert!(open_flags(libc::O_RDONLY | libc::O_TRUNC).truncate);
    }

    #[test]
    fn test_attr_builder() {
        let attrs = FileAttributes {
            kind: NodeKind::File,
            size: 2048,
            blocks: 4,
            blksize: 512,
            perm: 0o444,
            nlink: 1,
            mtime: SystemTime::UNIX_EPOCH,
        };
        let built = AttrBuilder { uid: 1000, gid: 100 }.build(7, &attrs);

        assert_eq!(built.ino, 7);
        assert_eq!(built.kind, FileType::RegularFile);
        assert_eq!(built.size, 2048);
        assert_eq!(built.blocks, 4);
        assert_eq!(built.perm, 0o444);
        assert_eq!(built.uid, 1000);
        assert_eq!(built.atime, built.mtime);
    }

    #[test]
    fn test_refused_maps_to_erofs() {
        let err: Result<(), FsError> = Err(FsError::ReadOnly("mkdir"));
        assert_eq!(refused(err), libc::EROFS);
        assert_eq!(refused::<()>(Ok(())), libc::EROFS);
        assert_eq!(refused::<()>(Err(FsError::NotSupported("link"))), libc::ENOSYS);
    }
}
