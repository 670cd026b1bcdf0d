use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    sync::Arc,
};

/// Ref-counted file descriptor of an open device node, closed with the last clone
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl DeviceFd {
    /// Path the device node was opened from, resolved through procfs
    pub fn path(&self) -> Option<PathBuf> {
        fd_path(self.as_fd())
    }
}

fn fd_path(fd: BorrowedFd<'_>) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok()
}

impl AsFd for DeviceFd {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<OwnedFd> for DeviceFd {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        DeviceFd(Arc::new(fd))
    }
}
