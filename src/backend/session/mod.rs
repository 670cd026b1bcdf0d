//! Opening of privileged device nodes.
//!
//! Device nodes of a seat are usually not accessible to the user running the display
//! code. A [`FileInterface`] abstracts how such a node gets opened, so a session manager
//! or a privileged helper passing file descriptors can be plugged in. Without one,
//! [`DirectFileInterface`] opens the node directly.

use std::fmt;
use std::io;
use std::os::unix::io::OwnedFd;
use std::path::Path;

use rustix::fs::OFlags;

mod direct;

pub use self::direct::DirectFileInterface;

/// Opens and closes device nodes
pub trait FileInterface: fmt::Debug {
    /// Opens the device node at `path` with `flags`
    fn open(&mut self, path: &Path, flags: OFlags) -> io::Result<OwnedFd>;

    /// Closes a file descriptor returned by [`FileInterface::open`]
    fn close(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

impl<T: FileInterface + ?Sized> FileInterface for &mut T {
    fn open(&mut self, path: &Path, flags: OFlags) -> io::Result<OwnedFd> {
        (**self).open(path, flags)
    }

    fn close(&mut self, fd: OwnedFd) {
        (**self).close(fd)
    }
}

impl<T: FileInterface + ?Sized> FileInterface for Box<T> {
    fn open(&mut self, path: &Path, flags: OFlags) -> io::Result<OwnedFd> {
        (**self).open(path, flags)
    }

    fn close(&mut self, fd: OwnedFd) {
        (**self).close(fd)
    }
}
