//! Device hand-off: the fd a controller is given for one DRM or evdev node,
//! and the kernel-authority dance around pausing/resuming it.
//!
//! Grounded on `backend/drm/session.rs` (DRM master acquire/release on VT
//! switch) and `backend/session/libseat.rs` (open/close of arbitrary device
//! nodes through a session) in the reference tree; those act from the
//! *client* side of this protocol, this module implements the *server* side
//! that hands the fd out in the first place.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{fstat, major, minor, Mode};
use nix::unistd::close;

/// Category a device node falls into, decided once at `TakeDevice` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Drm,
    Evdev,
    Other,
}

/// DRM major device number on Linux (`Documentation/admin-guide/devices.txt`).
const DRM_MAJOR: u64 = 226;
/// evdev input major device number on Linux.
const INPUT_MAJOR: u64 = 13;

impl DeviceKind {
    /// Classify by device-number major, the same strategy `is_tty_device`
    /// in the direct session backend uses for the boot tty (major 4).
    fn classify(major: u64) -> DeviceKind {
        if major == DRM_MAJOR {
            DeviceKind::Drm
        } else if major == INPUT_MAJOR {
            DeviceKind::Evdev
        } else {
            DeviceKind::Other
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open device node: {0}")]
    Open(#[source] nix::Error),
    #[error("failed to stat device node: {0}")]
    Stat(#[source] nix::Error),
    #[error("failed to set drm master: {0}")]
    SetMaster(#[source] nix::Error),
    #[error("failed to drop drm master: {0}")]
    DropMaster(#[source] nix::Error),
    #[error("failed to revoke evdev fd: {0}")]
    Revoke(#[source] nix::Error),
}

/// A handle to a single device-number: exclusively owned by one [`crate::session::Session`].
pub struct Device {
    path: std::path::PathBuf,
    major: u32,
    minor: u32,
    kind: DeviceKind,
    fd: OwnedFd,
    active: bool,
}

struct RawDrmFd(RawFd);
impl AsRawFd for RawDrmFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}
impl BasicDevice for RawDrmFd {}
impl ControlDevice for RawDrmFd {}

impl Device {
    /// Opens `path` with `O_RDWR|O_CLOEXEC|O_NONBLOCK`, classifies it, and
    /// puts it in the authority state matching `session_active` immediately
    /// (spec §4.5: DRM devices take master in an active session and drop it
    /// otherwise; evdev devices are revoked immediately if the session is
    /// not active).
    pub fn open(path: &Path, session_active: bool) -> Result<Device, Error> {
        let fd = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(Error::Open)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let stat = fstat(fd.as_raw_fd()).map_err(Error::Stat)?;
        let kind = DeviceKind::classify(major(stat.st_rdev));

        let mut device = Device {
            path: path.to_path_buf(),
            major: major(stat.st_rdev) as u32,
            minor: minor(stat.st_rdev) as u32,
            kind,
            fd,
            active: session_active,
        };
        device.set_active(session_active)?;
        Ok(device)
    }

    pub fn devnum(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Transitions the kernel-visible authority, per the table in spec §4.5.
    pub fn set_active(&mut self, active: bool) -> Result<(), Error> {
        match (self.kind, active, self.active) {
            (DeviceKind::Drm, true, _) => {
                let raw = RawDrmFd(self.fd.as_raw_fd());
                raw.acquire_master_lock().map_err(Error::SetMaster)?;
            }
            (DeviceKind::Drm, false, _) => {
                let raw = RawDrmFd(self.fd.as_raw_fd());
                raw.release_master_lock().map_err(Error::DropMaster)?;
            }
            (DeviceKind::Evdev, false, _) => {
                unsafe { ioctl_evdev_revoke(self.fd.as_raw_fd(), 0) }.map_err(Error::Revoke)?;
            }
            (DeviceKind::Evdev, true, false) => {
                // The revoked fd is permanently dead; reopen the node fresh.
                let new_fd = fcntl::open(
                    &self.path,
                    OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_NONBLOCK,
                    Mode::empty(),
                )
                .map_err(Error::Open)?;
                let old = std::mem::replace(&mut self.fd, unsafe { OwnedFd::from_raw_fd(new_fd) });
                let _ = close(old.as_raw_fd());
            }
            (DeviceKind::Evdev, true, true) | (DeviceKind::Other, _, _) => {}
        }
        self.active = active;
        Ok(())
    }

    /// Duplicates the owned fd for handing to a bus caller as a passed fd.
    /// The caller keeps the original; this is only used on resume, where the
    /// evdev path already produced a fresh fd and the DRM/OTHER paths must
    /// not consume the one the `Device` still owns.
    pub fn dup_fd(&self) -> std::io::Result<OwnedFd> {
        nix::unistd::dup(self.fd.as_raw_fd())
            .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Deactivate before closing: dropping authority is cheap and
        // idempotent, whereas leaking DRM master across a close can wedge
        // the next opener.
        let _ = self.set_active(false);
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.devnum() == other.devnum()
    }
}
impl Eq for Device {}

// EVIOCREVOKE is `_IOW('E', 0x91, int)`, not a bare `_IO`: it carries the
// write direction and an `int` argument size, even though the kernel
// ignores the argument's value and this is always called with `0`.
nix::ioctl_write_int_bad!(
    ioctl_evdev_revoke,
    nix::request_code_write!(b'E', 0x91, std::mem::size_of::<libc::c_int>())
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_by_major_covers_the_known_device_numbers() {
        assert_eq!(DeviceKind::classify(DRM_MAJOR), DeviceKind::Drm);
        assert_eq!(DeviceKind::classify(INPUT_MAJOR), DeviceKind::Evdev);
        assert_eq!(DeviceKind::classify(4), DeviceKind::Other);
    }
}
