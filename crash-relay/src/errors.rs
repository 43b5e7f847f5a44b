use std::{io, time::Duration};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to create cross process channel")]
    ChannelCreation(#[source] io::Error),
    #[error("unable to spawn helper process")]
    Spawn(#[source] io::Error),
    #[error("unable to resolve helper path: {0}")]
    PathResolution(&'static str),
    #[error("helper did not signal readiness within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("control channel failed while waiting for helper (revents: {0:#x})")]
    HandshakePeerError(i16),
    #[error("failed to transmit crash context")]
    Transmission(#[source] io::Error),
    #[error("invalid channel id '{0}'")]
    InvalidChannelId(String),
    #[error("a required channel id was not provided")]
    MissingChannelId,
    #[error("crash context is empty")]
    EmptyBlob,
    #[error("crash context of {len} bytes exceeds the maximum of {max}")]
    BlobTooLarge { len: usize, max: usize },
    #[error("the monitored process closed the crash context channel")]
    Disconnected,
    #[error("received crash context was truncated")]
    Truncated,
    #[error("process sending the crash context has an unknown or invalid pid")]
    UnknownClientPid,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[cfg(target_os = "macos")]
    #[error("mach kernel call failed with {0}")]
    Kernel(mach2::kern_return::kern_return_t),
    #[cfg(target_os = "macos")]
    #[error("mach message failed with {0:#x}")]
    Message(mach2::message::mach_msg_return_t),
    #[cfg(target_os = "macos")]
    #[error("received unexpected mach message with id {0:#x}")]
    UnexpectedMessage(i32),
}
