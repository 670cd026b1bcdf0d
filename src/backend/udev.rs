//! Discovery of KMS devices and drm uevents.
//!
//! With the `backend_udev` feature this module scans the `drm` subsystem for the gpus of a
//! seat, opens the primary one through a [`FileInterface`] and provides [`DrmMonitor`], a
//! [`calloop`] event source reporting hotplug uevents.
//!
//! [`DrmUevent`] is always available, so uevents received through other channels can be
//! interpreted the same way.
//!
//! ```rust,ignore
//! let (device, notifier) = DrmDevice::new_from_udev_primary("seat0", &mut DirectFileInterface, DrmDeviceConfig::default())?;
//! let monitor = DrmMonitor::new()?;
//! event_loop.handle().insert_source(monitor, |event, _, state| {
//!     if event.hotplug {
//!         state.rescan_connectors(event.connector);
//!     }
//! })?;
//! ```

use std::path::PathBuf;

use drm::control::{connector, property};
use tracing::trace;

/// What happened to the device of a uevent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventAction {
    /// A device was added
    Add,
    /// Properties of a device changed, e.g. a connector was plugged in
    Change,
    /// A device was removed
    Remove,
    /// Any other action
    Other(String),
}

impl UeventAction {
    /// Parses the `ACTION` value of a uevent
    pub fn from_name(name: &str) -> Self {
        match name {
            "add" => UeventAction::Add,
            "change" => UeventAction::Change,
            "remove" => UeventAction::Remove,
            other => UeventAction::Other(other.to_string()),
        }
    }
}

/// A uevent of the `drm` subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmUevent {
    /// Action of the event
    pub action: UeventAction,
    /// Kernel name of the device, like `card0`
    pub sysname: String,
    /// Device node, if the device has one
    pub devnode: Option<PathBuf>,
    /// Device number of the node
    pub dev_id: Option<u64>,
    /// The `HOTPLUG` property was set, the connector state of the device changed
    pub hotplug: bool,
    /// The connector the event is about (`CONNECTOR`)
    pub connector: Option<connector::Handle>,
    /// The connector property that changed (`PROPERTY`)
    pub property: Option<property::Handle>,
}

fn parse_handle<T: drm::control::ResourceHandle>(name: &str, value: &str) -> Option<T> {
    let handle = value.parse::<u32>().ok().and_then(drm::control::from_u32);
    if handle.is_none() {
        trace!(name, value, "Ignoring malformed uevent property");
    }
    handle
}

impl DrmUevent {
    /// Interprets the properties of a uevent.
    ///
    /// Unknown properties are ignored, malformed ids are logged and dropped.
    pub fn from_properties<'a>(
        action: UeventAction,
        sysname: impl Into<String>,
        devnode: Option<PathBuf>,
        dev_id: Option<u64>,
        properties: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut event = DrmUevent {
            action,
            sysname: sysname.into(),
            devnode,
            dev_id,
            hotplug: false,
            connector: None,
            property: None,
        };
        for (name, value) in properties {
            match name {
                "HOTPLUG" => event.hotplug = value == "1",
                "CONNECTOR" => event.connector = parse_handle(name, value),
                "PROPERTY" => event.property = parse_handle(name, value),
                _ => {}
            }
        }
        event
    }
}

#[cfg(feature = "backend_udev")]
pub use self::monitor::{all_gpus, primary_gpu, DrmMonitor};

#[cfg(feature = "backend_udev")]
mod monitor {
    use std::ffi::OsString;
    use std::fmt;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use calloop::generic::Generic;
    use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
    use rustix::fs::OFlags;
    use tracing::{debug, info, info_span, warn};
    use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

    use super::{DrmUevent, UeventAction};
    use crate::backend::drm::{
        AccessError, DrmDevice, DrmDeviceConfig, DrmDeviceFd, DrmDeviceNotifier, Error, KmsIo,
    };
    use crate::backend::session::FileInterface;
    use crate::utils::DeviceFd;

    fn on_seat(device: &udev::Device, seat: &str) -> bool {
        device
            .property_value("ID_SEAT")
            .map(|x| x.to_os_string())
            .unwrap_or_else(|| OsString::from("seat0"))
            == *seat
    }

    /// Returns the path of the primary gpu of `seat`, preferring the boot vga device
    pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;

        let mut result = None;
        for device in enumerator.scan_devices()? {
            if !on_seat(&device, seat.as_ref()) {
                continue;
            }
            if let Some(pci) = device.parent_with_subsystem(Path::new("pci"))? {
                if let Some(id) = pci.attribute_value("boot_vga") {
                    if id == "1" {
                        result = Some(device);
                    }
                }
            } else if result.is_none() {
                result = Some(device);
            }
        }
        Ok(result.and_then(|device| device.devnode().map(PathBuf::from)))
    }

    /// Returns the paths of all gpus of `seat`
    pub fn all_gpus<S: AsRef<str>>(seat: S) -> io::Result<Vec<PathBuf>> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;
        Ok(enumerator
            .scan_devices()?
            .filter(|device| on_seat(device, seat.as_ref()))
            .flat_map(|device| device.devnode().map(PathBuf::from))
            .collect())
    }

    fn access(errmsg: &'static str, dev: Option<PathBuf>) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Access(AccessError { errmsg, dev, source })
    }

    fn open_kms<F: FileInterface + ?Sized>(path: &Path, file_interface: &mut F) -> Result<DrmDeviceFd, Error> {
        let fd = file_interface
            .open(
                path,
                OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            )
            .map_err(access("Failed to open device", Some(path.to_path_buf())))?;
        let fd = DrmDeviceFd::new(DeviceFd::from(fd));
        match fd.resource_ids() {
            Ok(ids) if !ids.crtcs.is_empty() && !ids.connectors.is_empty() => Ok(fd),
            result => {
                debug!(?path, ?result, "Device is no KMS device");
                Err(Error::NotKms(Some(path.to_path_buf())))
            }
        }
    }

    impl DrmDevice {
        /// Opens the primary KMS device of `seat`.
        ///
        /// All gpus of the seat are tried, starting with the primary one, until one of
        /// them opens through `file_interface` and supports kernel mode-setting.
        pub fn new_from_udev_primary<F: FileInterface + ?Sized>(
            seat: &str,
            file_interface: &mut F,
            config: DrmDeviceConfig,
        ) -> Result<(Arc<DrmDevice>, DrmDeviceNotifier), Error> {
            let span = info_span!("udev", seat);
            let _guard = span.enter();

            let primary = primary_gpu(seat).map_err(access("Failed to scan for the primary gpu", None))?;
            let mut candidates = all_gpus(seat).map_err(access("Failed to scan for gpus", None))?;
            if let Some(primary) = primary {
                candidates.retain(|path| *path != primary);
                candidates.insert(0, primary);
            }

            for path in candidates {
                match open_kms(&path, file_interface) {
                    Ok(fd) => {
                        info!(?path, "Using KMS device");
                        drop(_guard);
                        return DrmDevice::new(fd, config);
                    }
                    Err(err) => warn!(?path, ?err, "Skipping device"),
                }
            }
            Err(Error::NoDevice(seat.to_string()))
        }
    }

    /// Event source of `drm` subsystem uevents
    pub struct DrmMonitor {
        source: Generic<MonitorSocket>,
        span: tracing::Span,
    }

    impl fmt::Debug for DrmMonitor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("DrmMonitor").field("span", &self.span).finish_non_exhaustive()
        }
    }

    impl DrmMonitor {
        /// Starts listening for uevents of the `drm` subsystem
        pub fn new() -> io::Result<DrmMonitor> {
            let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
            Ok(DrmMonitor {
                source: Generic::new(monitor, Interest::READ, Mode::Level),
                span: info_span!("drm_monitor"),
            })
        }
    }

    fn action(event_type: EventType) -> UeventAction {
        match event_type {
            EventType::Add => UeventAction::Add,
            EventType::Change => UeventAction::Change,
            EventType::Remove => UeventAction::Remove,
            other => UeventAction::Other(format!("{:?}", other).to_lowercase()),
        }
    }

    impl EventSource for DrmMonitor {
        type Event = DrmUevent;
        type Metadata = ();
        type Ret = ();
        type Error = io::Error;

        fn process_events<C>(
            &mut self,
            readiness: Readiness,
            token: Token,
            mut callback: C,
        ) -> Result<PostAction, Self::Error>
        where
            C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
        {
            let _guard = self.span.enter();
            self.source.process_events(readiness, token, |_, monitor| {
                for event in monitor.as_ref().iter() {
                    let properties: Vec<(String, String)> = event
                        .properties()
                        .map(|entry| {
                            (
                                entry.name().to_string_lossy().into_owned(),
                                entry.value().to_string_lossy().into_owned(),
                            )
                        })
                        .collect();
                    let uevent = DrmUevent::from_properties(
                        action(event.event_type()),
                        event.sysname().to_string_lossy(),
                        event.devnode().map(PathBuf::from),
                        event.devnum().map(|dev| dev as u64),
                        properties.iter().map(|(name, value)| (name.as_str(), value.as_str())),
                    );
                    debug!(?uevent, "Got drm uevent");
                    callback(uevent, &mut ());
                }
                Ok(PostAction::Continue)
            })
        }

        fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            self.source.register(poll, factory)
        }

        fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            self.source.reregister(poll, factory)
        }

        fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
            self.source.unregister(poll)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hotplug_uevent() {
        let event = DrmUevent::from_properties(
            UeventAction::from_name("change"),
            "card0",
            Some(PathBuf::from("/dev/dri/card0")),
            Some(0xe200),
            [
                ("ACTION", "change"),
                ("HOTPLUG", "1"),
                ("CONNECTOR", "77"),
                ("PROPERTY", "5"),
                ("SEQNUM", "1234"),
            ],
        );
        assert_eq!(event.action, UeventAction::Change);
        assert!(event.hotplug);
        assert_eq!(event.connector.map(u32::from), Some(77));
        assert_eq!(event.property.map(u32::from), Some(5));
        assert_eq!(event.devnode, Some(PathBuf::from("/dev/dri/card0")));
    }

    #[test]
    fn malformed_properties_are_dropped() {
        let event = DrmUevent::from_properties(
            UeventAction::from_name("bind"),
            "card1",
            None,
            None,
            [("HOTPLUG", "0"), ("CONNECTOR", "not-a-number"), ("PROPERTY", "0")],
        );
        assert_eq!(event.action, UeventAction::Other("bind".into()));
        assert!(!event.hotplug);
        assert_eq!(event.connector, None);
        assert_eq!(event.property, None);
    }
}
