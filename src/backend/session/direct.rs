use std::io;
use std::os::unix::io::OwnedFd;
use std::path::Path;

use rustix::fs::{Mode, OFlags};
use tracing::{debug, trace};

use super::FileInterface;

/// Opens device nodes with plain `open(2)`, requires the process to have access to them
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFileInterface;

impl FileInterface for DirectFileInterface {
    fn open(&mut self, path: &Path, flags: OFlags) -> io::Result<OwnedFd> {
        debug!("Opening device: {:?}", path);
        let fd = rustix::fs::open(path, flags | OFlags::CLOEXEC, Mode::empty())?;
        trace!("Fd num: {:?}", fd);
        Ok(fd)
    }

    fn close(&mut self, fd: OwnedFd) {
        debug!("Closing device: {:?}", fd);
        drop(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_readable_nodes() {
        let mut files = DirectFileInterface;
        let fd = files.open(Path::new("/dev/null"), OFlags::RDWR).unwrap();
        files.close(fd);
    }

    #[test]
    fn reports_missing_nodes() {
        let err = DirectFileInterface
            .open(Path::new("/dev/dri/does-not-exist"), OFlags::RDWR)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
