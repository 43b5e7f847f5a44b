//! The cross process channel between the monitored process and the helper.
//!
//! The channel consists of two independent halves. The control half is a
//! plain pipe, used to send single bytes from the helper to the monitored
//! process. The blob half carries the crash context from the monitored process
//! to the helper, and is implemented differently per target:
//!
//! * Linux/Android - a connected `SOCK_SEQPACKET` socket pair
//! * Macos - a mach port whose receive right is handed to the helper via a
//!   bootstrap port exchange
//!
//! Both blob backends expose the same set of types, [`BlobSender`],
//! [`HelperEnd`], and [`BlobReceiver`], so that the rest of the protocol is
//! written once.

pub(crate) mod control;

pub use control::{ControlEvent, ControlReader, ControlWriter, control_pair};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod socket;

        pub use socket::{BlobReceiver, BlobSender, HelperEnd, create_pair};
    } else if #[cfg(target_os = "macos")] {
        pub mod port;

        pub use port::{BlobReceiver, BlobSender, HelperEnd, create_pair};
    } else {
        compile_error!("unimplemented target platform");
    }
}

use crate::Error;
use std::{fmt, io, os::fd::RawFd, str::FromStr};

/// A crash context received by the helper
pub struct ReceivedBlob {
    /// The process the crash context was sent from
    pub pid: u32,
    /// The crash context, exactly as it was sent
    pub context: Vec<u8>,
}

/// Identifies one end of a channel on the command line of the helper process.
///
/// This is always a descriptor number that the helper inherits from the
/// monitored process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelId(RawFd);

impl ChannelId {
    #[inline]
    pub fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    #[inline]
    pub fn as_raw(self) -> RawFd {
        self.0
    }

    /// Ensures the id refers to a descriptor that is open in this process
    pub(crate) fn validate(self) -> Result<(), Error> {
        // SAFETY: syscall, fcntl on an arbitrary number is fine
        if unsafe { libc::fcntl(self.0, libc::F_GETFD) } == -1 {
            return Err(Error::InvalidChannelId(self.to_string()));
        }

        Ok(())
    }

    /// Clears `FD_CLOEXEC` so that the descriptor survives the `exec` of the
    /// helper.
    ///
    /// This is called in the forked child before `exec`, so it must only
    /// perform async signal safe operations.
    pub(crate) fn set_inheritable(self) -> io::Result<()> {
        set_cloexec(self.0, false)
    }

    /// Sets `FD_CLOEXEC` so that a descriptor inherited by the helper is not
    /// leaked further
    pub(crate) fn set_cloexec(self) -> io::Result<()> {
        set_cloexec(self.0, true)
    }
}

fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    // SAFETY: syscalls
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }

        let flags = if cloexec {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };

        if libc::fcntl(fd, libc::F_SETFD, flags) == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<RawFd>() {
            Ok(fd) if fd >= 0 => Ok(Self(fd)),
            _ => Err(Error::InvalidChannelId(s.to_owned())),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn parses_channel_ids() {
        assert_eq!("7".parse::<ChannelId>().unwrap(), ChannelId::from_raw(7));
        assert_eq!(ChannelId::from_raw(12).to_string(), "12");

        for bad in ["", "-1", "fd", "3.5", " 4"] {
            assert!(
                matches!(bad.parse::<ChannelId>(), Err(Error::InvalidChannelId(s)) if s == bad),
                "'{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn validates_open_descriptors() {
        let (reader, _writer) = control_pair().unwrap();
        let id = reader.channel_id();

        assert!(id.validate().is_ok());

        // Closed descriptor numbers can be reused by other test threads, so
        // only check one that can't possibly be open
        assert!(matches!(
            ChannelId::from_raw(i32::MAX).validate(),
            Err(Error::InvalidChannelId(_))
        ));
    }

    #[test]
    fn toggles_cloexec() {
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        let id = ChannelId::from_raw(file.as_raw_fd());

        let flags = || unsafe { libc::fcntl(id.as_raw(), libc::F_GETFD) };

        // std opens everything with O_CLOEXEC
        assert_ne!(flags() & libc::FD_CLOEXEC, 0);
        id.set_inheritable().unwrap();
        assert_eq!(flags() & libc::FD_CLOEXEC, 0);
        id.set_cloexec().unwrap();
        assert_ne!(flags() & libc::FD_CLOEXEC, 0);
    }
}
