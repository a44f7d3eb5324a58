use common::fs::{ErrorKind, FsError};

/// OS error code for a filesystem error
pub fn errno_for(err: &FsError) -> libc::c_int {
    match err.kind() {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::NotADirectory => libc::ENOTDIR,
        ErrorKind::IsADirectory => libc::EISDIR,
        ErrorKind::UpstreamUnavailable if err.retry_after().is_some() => libc::EAGAIN,
        ErrorKind::UpstreamUnavailable => libc::EIO,
        ErrorKind::UnsupportedSeek => libc::ESPIPE,
        ErrorKind::ReadOnly => libc::EROFS,
        ErrorKind::NotSupported => libc::ENOSYS,
        ErrorKind::BadHandle => libc::EBADF,
    }
}
