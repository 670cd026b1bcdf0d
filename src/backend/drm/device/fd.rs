use drm::{control::Device as ControlDevice, Device as BasicDevice};
use std::{
    os::unix::io::{AsFd, BorrowedFd},
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, error};

use crate::utils::DeviceFd;

#[derive(Debug)]
struct MasterFd {
    fd: DeviceFd,
    master: bool,
}

impl AsFd for MasterFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for MasterFd {}

impl Drop for MasterFd {
    fn drop(&mut self) {
        let path = self.fd.path();
        if !self.master {
            debug!(?path, "Closing device");
            return;
        }
        match self.release_master_lock() {
            Ok(()) => debug!(?path, "Closing device, dropped drm master"),
            Err(err) => error!(?path, ?err, "Failed to drop drm master"),
        }
    }
}

/// Open drm device node, shared by all handles of one [`DrmDevice`](super::DrmDevice)
///
/// Becomes drm master if possible and gives the lock up together with the last clone, so
/// wrap a [`DeviceFd`] only once and clone the result.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<MasterFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Wraps an open device node
    pub fn new(fd: DeviceFd) -> DrmDeviceFd {
        let mut inner = MasterFd { fd, master: false };
        match inner.acquire_master_lock() {
            Ok(()) => inner.master = true,
            // newer kernels make the first opener master anyway
            Err(err) => debug!(?err, "Not drm master, running unprivileged"),
        }
        DrmDeviceFd(Arc::new(inner))
    }

    /// Path of the device node
    pub fn path(&self) -> Option<PathBuf> {
        self.0.fd.path()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}
