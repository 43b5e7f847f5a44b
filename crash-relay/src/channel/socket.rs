use super::{ChannelId, ReceivedBlob};
use crate::{Error, MAX_BLOB_SIZE};
use polling::{Event, Events, PollMode, Poller};
use std::{
    io::{self, IoSliceMut},
    os::fd::{AsRawFd, BorrowedFd, FromRawFd},
    time::Duration,
};
use uds::UnixSeqpacketConn;

/// The monitored process' end of the blob channel
pub struct BlobSender {
    socket: UnixSeqpacketConn,
}

/// The helper's end of the blob channel, while it is still owned by the
/// monitored process
pub struct HelperEnd {
    socket: UnixSeqpacketConn,
}

/// Creates a connected socket pair, the first end stays with the monitored
/// process, the second is inherited by the helper.
pub fn create_pair() -> Result<(BlobSender, HelperEnd), Error> {
    let (ours, theirs) = UnixSeqpacketConn::pair().map_err(Error::ChannelCreation)?;

    Ok((BlobSender { socket: ours }, HelperEnd { socket: theirs }))
}

impl BlobSender {
    /// Sends the crash context as a single packet.
    ///
    /// This is async signal safe, it neither allocates nor takes locks.
    ///
    /// An empty blob is rejected, as an empty packet is indistinguishable from
    /// the monitored process closing its end.
    pub fn send_blob(&self, blob: &[u8]) -> Result<(), Error> {
        if blob.is_empty() {
            return Err(Error::EmptyBlob);
        }

        if blob.len() > MAX_BLOB_SIZE {
            return Err(Error::BlobTooLarge {
                len: blob.len(),
                max: MAX_BLOB_SIZE,
            });
        }

        let sent = self.socket.send(blob).map_err(Error::Transmission)?;
        if sent != blob.len() {
            return Err(Error::Transmission(io::ErrorKind::WriteZero.into()));
        }

        Ok(())
    }
}

impl HelperEnd {
    #[inline]
    pub fn channel_id(&self) -> Option<ChannelId> {
        Some(ChannelId(self.socket.as_raw_fd()))
    }

    /// Runs the provided function to spawn the helper, passing it the id of
    /// this end of the channel.
    ///
    /// Once the helper has been spawned with its own copy of the socket, our
    /// copy is closed so that the helper is the sole owner of its end.
    pub fn spawn_with<T>(
        self,
        _timeout: Duration,
        spawn: impl FnOnce(Option<ChannelId>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        spawn(self.channel_id())
    }

    /// Converts this end into a receiver in the current process
    pub fn into_receiver(self) -> Result<BlobReceiver, Error> {
        BlobReceiver::new(self.socket)
    }
}

/// The helper's end of the blob channel
pub struct BlobReceiver {
    socket: UnixSeqpacketConn,
    poll: Poller,
    events: Events,
    buffer: Vec<u8>,
}

impl BlobReceiver {
    /// Takes ownership of the socket inherited from the monitored process
    pub fn from_channel_id(id: Option<ChannelId>, _timeout: Duration) -> Result<Self, Error> {
        let id = id.ok_or(Error::MissingChannelId)?;
        id.validate()?;
        id.set_cloexec()?;

        // SAFETY: the descriptor is open, and was handed to this process for
        // the sole use of receiving crash contexts
        let socket = unsafe { UnixSeqpacketConn::from_raw_fd(id.0) };
        Self::new(socket)
    }

    fn new(socket: UnixSeqpacketConn) -> Result<Self, Error> {
        let poll = Poller::new()?;

        // SAFETY: We ensure we delete the socket during drop. Level triggered
        // so that we don't need to rearm after every event
        unsafe {
            poll.add_with_mode(socket.as_raw_fd(), Event::readable(0), PollMode::Level)?;
        }

        Ok(Self {
            socket,
            poll,
            events: Events::new(),
            buffer: vec![0u8; MAX_BLOB_SIZE],
        })
    }

    /// Waits up to `timeout` for a crash context to arrive.
    ///
    /// Returns [`Error::Disconnected`] once the monitored process has closed
    /// its end of the channel.
    pub fn receive_blob(&mut self, timeout: Option<Duration>) -> Result<Option<ReceivedBlob>, Error> {
        self.events.clear();

        match self.poll.wait(&mut self.events, timeout) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let (len, truncated) = self
            .socket
            .recv_vectored(&mut [IoSliceMut::new(&mut self.buffer)])?;

        if truncated {
            return Err(Error::Truncated);
        }

        if len == 0 {
            return Err(Error::Disconnected);
        }

        // The pair was created by the monitored process, so the initial
        // credentials are the ones of the process that will crash
        let pid = self
            .socket
            .initial_peer_credentials()?
            .pid()
            .ok_or(Error::UnknownClientPid)?;

        Ok(Some(ReceivedBlob {
            pid: pid.get(),
            context: self.buffer[..len].to_vec(),
        }))
    }
}

impl Drop for BlobReceiver {
    fn drop(&mut self) {
        // SAFETY: the socket is still open, it is closed after this method
        let fd = unsafe { BorrowedFd::borrow_raw(self.socket.as_raw_fd()) };
        if let Err(err) = self.poll.delete(fd) {
            log::error!("failed to deregister socket: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (BlobSender, BlobReceiver) {
        let (tx, helper_end) = create_pair().unwrap();
        (tx, helper_end.into_receiver().unwrap())
    }

    fn roundtrip(tx: &BlobSender, rx: &mut BlobReceiver, blob: &[u8]) {
        tx.send_blob(blob).unwrap();

        let received = rx
            .receive_blob(Some(Duration::from_secs(5)))
            .unwrap()
            .expect("timed out waiting for blob");

        assert_eq!(received.pid, std::process::id());
        assert_eq!(received.context.len(), blob.len());
        assert!(received.context == blob);
    }

    #[test]
    fn preserves_crash_contexts() {
        // Use the size of an actual signal context as the declared size
        const SIZE: usize = std::mem::size_of::<libc::ucontext_t>();

        let (tx, mut rx) = pair();

        roundtrip(&tx, &mut rx, &[0u8; SIZE]);
        roundtrip(&tx, &mut rx, &[0xffu8; SIZE]);

        let random: Vec<u8> = std::iter::repeat_with(|| uuid::Uuid::new_v4().into_bytes())
            .flatten()
            .take(SIZE)
            .collect();
        roundtrip(&tx, &mut rx, &random);
    }

    #[test]
    fn times_out_when_idle() {
        let (_tx, mut rx) = pair();

        assert!(rx.receive_blob(Some(Duration::from_millis(20))).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_blobs() {
        let (tx, _rx) = pair();

        let blob = vec![1u8; MAX_BLOB_SIZE + 1];
        assert!(matches!(
            tx.send_blob(&blob),
            Err(Error::BlobTooLarge { len, max }) if len == MAX_BLOB_SIZE + 1 && max == MAX_BLOB_SIZE
        ));
    }

    #[test]
    fn rejects_empty_blobs() {
        let (tx, mut rx) = pair();

        assert!(matches!(tx.send_blob(&[]), Err(Error::EmptyBlob)));

        // Nothing was sent, so the receiver neither sees a blob nor mistakes
        // the attempt for a disconnect
        assert!(rx.receive_blob(Some(Duration::from_millis(50))).unwrap().is_none());
    }

    #[test]
    fn fails_without_peer() {
        let (tx, rx) = pair();
        drop(rx);

        assert!(matches!(tx.send_blob(&[0u8; 64]), Err(Error::Transmission(_))));
    }

    #[test]
    fn reports_disconnect() {
        let (tx, mut rx) = pair();
        drop(tx);

        assert!(matches!(
            rx.receive_blob(Some(Duration::from_secs(5))),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn requires_channel_id() {
        assert!(matches!(
            BlobReceiver::from_channel_id(None, Duration::ZERO),
            Err(Error::MissingChannelId)
        ));
    }
}
