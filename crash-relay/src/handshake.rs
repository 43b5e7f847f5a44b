//! The one-shot readiness signal from the helper to the monitored process.
//!
//! The helper writes a single byte to the control channel once it is able to
//! receive a crash context. The monitored process only observes that the
//! channel has become readable, the byte itself stays in the pipe and is
//! consumed by [`crate::CrashBridge::on_crash`] as a final liveness check.

use crate::{
    Error,
    channel::{ControlReader, ControlWriter, control::PollOutcome},
};
use std::time::Duration;

/// The outcome of waiting for the helper
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The helper has signaled that it is listening
    Ready,
    /// The helper did not signal within the timeout
    TimedOut,
    /// The control channel reported an error or hangup, eg. because the
    /// helper exited, the `revents` are provided
    PeerError(i16),
}

impl Readiness {
    #[inline]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// Converts the outcome into the equivalent error
    pub fn into_result(self, timeout: Duration) -> Result<(), Error> {
        match self {
            Self::Ready => Ok(()),
            Self::TimedOut => Err(Error::HandshakeTimeout(timeout)),
            Self::PeerError(revents) => Err(Error::HandshakePeerError(revents)),
        }
    }
}

/// Blocks until the helper signals readiness, the control channel fails, or
/// the timeout elapses, whichever comes first.
///
/// [`Readiness::TimedOut`] is never returned before the full timeout has
/// elapsed.
pub fn await_readiness(control: &ControlReader, timeout: Duration) -> Readiness {
    match control.poll_readable(timeout) {
        PollOutcome::Readable => Readiness::Ready,
        PollOutcome::TimedOut => Readiness::TimedOut,
        PollOutcome::Errored(revents) => Readiness::PeerError(revents),
    }
}

/// Signals the monitored process that the helper is ready.
///
/// This must only be called once the receiving side of the blob channel is
/// able to accept a crash context.
#[inline]
pub fn signal_readiness(control: &ControlWriter) -> Result<(), Error> {
    control.send_control_byte()
}
