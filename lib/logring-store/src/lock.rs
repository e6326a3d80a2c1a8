//! Advisory byte-range locks over the index file.
//!
//! Two named regions serialize writers without ever blocking readers:
//!
//! - the *append* region runs from the index tail (where the trailing
//!   counter lives) through all future growth, and is held for the duration
//!   of an append;
//! - the *complete* region covers the whole file from byte 0, and is held
//!   by operations that truncate or replace the files (`clear`,
//!   `overwrite`, deprecation renames, transfer decode).
//!
//! Both regions extend to infinity, so a truncating operation always
//! conflicts with an in-flight append. Open-file-description locks are used
//! rather than classic POSIX record locks: OFD locks conflict between two
//! open descriptions of the same file inside one process, which is exactly
//! the serialization multiple request tasks touching one collection need,
//! and they are not dropped when an unrelated descriptor to the same file
//! is closed.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;

/// Exclusive lock over a region of a file, released on drop.
///
/// The guard captures the raw descriptor; callers keep the `File` alive
/// for at least as long as the guard, which every use here does by holding
/// both in the same scope.
#[derive(Debug)]
pub(crate) struct LockGuard {
    fd: RawFd,
    whence: libc::c_short,
}

/// Locks the append region: from the current end of file onward.
pub(crate) fn lock_append(file: &File) -> io::Result<LockGuard> {
    lock(file, libc::SEEK_END as libc::c_short)
}

/// Locks the complete region: the whole file, from byte 0 onward.
pub(crate) fn lock_complete(file: &File) -> io::Result<LockGuard> {
    lock(file, libc::SEEK_SET as libc::c_short)
}

fn lock(file: &File, whence: libc::c_short) -> io::Result<LockGuard> {
    let fd = file.as_raw_fd();
    let region = flock_region(libc::F_WRLCK as libc::c_short, whence);
    fcntl(fd, FcntlArg::F_OFD_SETLKW(&region)).map_err(io::Error::from)?;
    Ok(LockGuard { fd, whence })
}

fn flock_region(l_type: libc::c_short, l_whence: libc::c_short) -> libc::flock {
    // l_len == 0 extends the region to infinity; l_pid must be zero for OFD
    // locks.
    libc::flock {
        l_type,
        l_whence,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let region = flock_region(libc::F_UNLCK as libc::c_short, self.whence);
        if let Err(error) = fcntl(self.fd, FcntlArg::F_OFD_SETLK(&region)) {
            // Nothing sensible to do mid-unwind; the lock dies with the
            // descriptor anyway.
            warn!(message = "Failed to release advisory lock.", %error);
        }
    }
}
