use super::ChannelId;
use crate::Error;
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    time::{Duration, Instant},
};

/// The byte written by the helper to the control channel. The value itself
/// carries no meaning.
const LIVENESS_BYTE: u8 = 1;

/// The outcome of waiting for a control byte
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    /// A byte was received
    Received(u8),
    /// No byte arrived before the timeout elapsed
    TimedOut,
    /// The channel reported an error or hangup, the `revents` are provided
    Errored(i16),
}

/// The result of polling the control channel for readability
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Readable,
    TimedOut,
    Errored(i16),
}

/// The read end of the control channel, owned by the monitored process
pub struct ControlReader {
    fd: OwnedFd,
}

/// The write end of the control channel, owned by the helper process
pub struct ControlWriter {
    fd: OwnedFd,
}

/// Creates the control channel, both ends are close-on-exec.
pub fn control_pair() -> Result<(ControlReader, ControlWriter), Error> {
    let mut fds = [-1; 2];

    // SAFETY: syscalls, and we take ownership of the descriptors immediately
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) == -1 {
                    return Err(Error::ChannelCreation(io::Error::last_os_error()));
                }

                let (read, write) = (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]));
            } else {
                if libc::pipe(fds.as_mut_ptr()) == -1 {
                    return Err(Error::ChannelCreation(io::Error::last_os_error()));
                }

                let (read, write) = (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]));

                for fd in fds {
                    ChannelId(fd).set_cloexec().map_err(Error::ChannelCreation)?;
                }
            }
        }

        Ok((ControlReader { fd: read }, ControlWriter { fd: write }))
    }
}

impl ControlReader {
    #[inline]
    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.fd.as_raw_fd())
    }

    /// Waits until the channel is readable, it reports an error or hangup, or
    /// the timeout elapses.
    ///
    /// The timeout is never cut short by signal interruptions, the wait is
    /// resumed with the remaining time instead.
    pub(crate) fn poll_readable(&self, timeout: Duration) -> PollOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            // Round up so that we never wake before the deadline
            let mut millis = remaining.as_millis();
            if remaining.subsec_nanos() % 1_000_000 != 0 {
                millis += 1;
            }

            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN | libc::POLLERR,
                revents: 0,
            };

            // SAFETY: syscall
            let res = unsafe { libc::poll(&mut pfd, 1, millis.min(i32::MAX as u128) as i32) };

            match res {
                -1 => {
                    if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                        continue;
                    }

                    return PollOutcome::Errored(pfd.revents);
                }
                0 => {
                    if Instant::now() >= deadline {
                        return PollOutcome::TimedOut;
                    }
                }
                _ => {
                    // A hangup with data still in the pipe is still readable
                    return if pfd.revents & libc::POLLIN != 0 {
                        PollOutcome::Readable
                    } else {
                        PollOutcome::Errored(pfd.revents)
                    };
                }
            }
        }
    }

    /// Waits up to `timeout` for a single control byte
    pub fn receive_control_byte(&self, timeout: Duration) -> ControlEvent {
        match self.poll_readable(timeout) {
            PollOutcome::Readable => match self.read_byte() {
                Ok(Some(byte)) => ControlEvent::Received(byte),
                Ok(None) => ControlEvent::Errored(libc::POLLHUP),
                Err(_err) => ControlEvent::Errored(libc::POLLERR),
            },
            PollOutcome::TimedOut => ControlEvent::TimedOut,
            PollOutcome::Errored(revents) => ControlEvent::Errored(revents),
        }
    }

    /// Reads a single byte, blocking until one is available. `None` is
    /// returned if the write end has been closed.
    ///
    /// This is async signal safe.
    pub(crate) fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = 0u8;

        loop {
            // SAFETY: syscall
            let res = unsafe { libc::read(self.fd.as_raw_fd(), (&mut byte as *mut u8).cast(), 1) };

            match res {
                1 => return Ok(Some(byte)),
                0 => return Ok(None),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }
}

impl ControlWriter {
    /// Takes ownership of the write end of the control channel that was
    /// inherited from the monitored process
    pub fn from_channel_id(id: ChannelId) -> Result<Self, Error> {
        id.validate()?;
        id.set_cloexec()?;

        // SAFETY: the descriptor is open, and was handed to this process for
        // the sole use of the control channel
        let fd = unsafe { OwnedFd::from_raw_fd(id.0) };
        Ok(Self { fd })
    }

    #[inline]
    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.fd.as_raw_fd())
    }

    /// Writes a single control byte
    pub fn send_control_byte(&self) -> Result<(), Error> {
        loop {
            // SAFETY: syscall
            let res = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    (&LIVENESS_BYTE as *const u8).cast(),
                    1,
                )
            };

            match res {
                1 => return Ok(()),
                0 => return Err(Error::Transmission(io::ErrorKind::WriteZero.into())),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(Error::Transmission(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sends_and_receives_bytes() {
        let (reader, writer) = control_pair().unwrap();

        writer.send_control_byte().unwrap();
        assert_eq!(
            reader.receive_control_byte(Duration::from_secs(1)),
            ControlEvent::Received(LIVENESS_BYTE)
        );
    }

    #[test]
    fn times_out_without_byte() {
        let (reader, _writer) = control_pair().unwrap();

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        assert_eq!(reader.receive_control_byte(timeout), ControlEvent::TimedOut);
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn reports_hangup() {
        let (reader, writer) = control_pair().unwrap();
        drop(writer);

        match reader.receive_control_byte(Duration::from_secs(5)) {
            ControlEvent::Errored(revents) => assert_ne!(revents & libc::POLLHUP, 0),
            other => panic!("expected hangup, got {other:?}"),
        }
    }

    #[test]
    fn pending_byte_survives_hangup() {
        let (reader, writer) = control_pair().unwrap();
        writer.send_control_byte().unwrap();
        drop(writer);

        assert_eq!(
            reader.receive_control_byte(Duration::from_secs(1)),
            ControlEvent::Received(LIVENESS_BYTE)
        );
        assert_eq!(reader.read_byte().unwrap(), None);
    }

    #[test]
    fn adopts_inherited_writer() {
        let (reader, writer) = control_pair().unwrap();

        // Simulate the descriptor being inherited by giving up our ownership
        let id = ChannelId(std::os::fd::IntoRawFd::into_raw_fd(writer.fd));

        let adopted = ControlWriter::from_channel_id(id).unwrap();
        adopted.send_control_byte().unwrap();

        assert_eq!(reader.read_byte().unwrap(), Some(LIVENESS_BYTE));
    }
}
