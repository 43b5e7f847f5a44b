//! The crash context is sent to the helper as a mach message. The tricky part
//! is getting a receive right into the helper in the first place, since mach
//! ports are not inherited across `exec`, with the exception of a handful of
//! special ports.
//!
//! So we abuse one of those, the bootstrap port:
//!
//! 1. The monitored process allocates a temporary port and installs it as its
//!    own bootstrap port, after saving the original.
//! 2. The helper is spawned, inheriting the temporary port as its bootstrap
//!    port. The monitored process restores its original bootstrap port
//!    immediately after the spawn, regardless of whether it succeeded.
//! 3. The helper sends a message to its (temporary) bootstrap port, containing
//!    a send right to a port it allocated for the reply.
//! 4. The monitored process replies with a copy of the original bootstrap port
//!    and the receive right for the crash context port.
//! 5. The helper restores its bootstrap port to the original, and uses the
//!    receive right to accept crash contexts.

use super::{ChannelId, ReceivedBlob};
use crate::{Error, MAX_BLOB_SIZE};
use mach2::{
    kern_return::{KERN_SUCCESS, kern_return_t},
    mach_port,
    message::{self as msg, mach_msg_type_name_t},
    port::{self, mach_port_t},
    task,
    traps::mach_task_self,
};
use std::{io, time::Duration};

unsafe extern "C" {
    /// From <usr/include/mach/mach_traps.h>, there is no binding for this in mach2
    fn pid_for_task(task: port::mach_port_name_t, pid: *mut i32) -> kern_return_t;
    /// From <usr/include/mach/task.h>
    fn task_set_special_port(
        task: mach_port_t,
        which_port: libc::c_int,
        special_port: mach_port_t,
    ) -> kern_return_t;
}

macro_rules! kern {
    ($call:expr) => {{
        let res = $call;

        if res != KERN_SUCCESS {
            return Err(Error::Kernel(res));
        }
    }};
}

macro_rules! msg {
    ($call:expr) => {{
        let res = $call;

        if res != msg::MACH_MSG_SUCCESS {
            return Err(Error::Message(res));
        }
    }};
}

const BOOTSTRAP_REQUEST_ID: i32 = 0x6372_0001;
const BOOTSTRAP_REPLY_ID: i32 = 0x6372_0002;
const BLOB_ID: i32 = 0x6372_0003;

/// Equivalent of the `MACH_MSGH_BITS` macro
#[inline]
const fn msgh_bits(remote: mach_msg_type_name_t, local: mach_msg_type_name_t) -> u32 {
    remote | (local << 8)
}

/// Sent from the helper to its inherited bootstrap port
#[repr(C)]
struct BootstrapRequest {
    head: msg::mach_msg_header_t,
    body: msg::mach_msg_body_t,
    /// Send right to the port the helper waits for the reply on
    reply: msg::mach_msg_port_descriptor_t,
}

/// Sent from the monitored process in response to a [`BootstrapRequest`]
#[repr(C)]
struct BootstrapReply {
    head: msg::mach_msg_header_t,
    body: msg::mach_msg_body_t,
    /// The original bootstrap port of the monitored process
    bootstrap: msg::mach_msg_port_descriptor_t,
    /// The receive right for crash contexts
    blob_port: msg::mach_msg_port_descriptor_t,
}

/// Carries the crash context
#[repr(C)]
struct BlobMessage {
    head: msg::mach_msg_header_t,
    body: msg::mach_msg_body_t,
    /// The task that crashed, translated by the kernel so that the helper can
    /// determine its pid
    task: msg::mach_msg_port_descriptor_t,
    len: u32,
    data: [u8; MAX_BLOB_SIZE],
}

/// The kernel appends a trailer to every received message, so the buffer we
/// receive into needs to account for it
#[repr(C)]
struct Received<T> {
    msg: T,
    _trailer: [u32; 2],
}

/// Retrieves the current bootstrap port of this task
pub fn bootstrap_port() -> Result<mach_port_t, Error> {
    let mut port = 0;
    // SAFETY: syscall
    unsafe {
        kern!(task::task_get_special_port(
            mach_task_self(),
            task::TASK_BOOTSTRAP_PORT,
            &mut port
        ));
    }
    Ok(port)
}

fn set_bootstrap_port(port: mach_port_t) -> Result<(), Error> {
    // SAFETY: syscall
    unsafe {
        kern!(task_set_special_port(
            mach_task_self(),
            task::TASK_BOOTSTRAP_PORT,
            port
        ));
    }
    Ok(())
}

/// Releases one user reference to a send right held by this task
fn release_send_right(port: mach_port_t) {
    // SAFETY: syscall
    unsafe {
        mach_port::mach_port_deallocate(mach_task_self(), port);
    }
}

/// Temporarily replaces the bootstrap port of this task.
///
/// The original port is restored when this is dropped, or explicitly via
/// [`Self::restore`]. The reference to the original port that was acquired
/// when installing is held until drop, so that it can still be handed out
/// after restoring.
pub struct BootstrapSwap {
    original: mach_port_t,
    restored: bool,
}

impl BootstrapSwap {
    pub fn install(replacement: mach_port_t) -> Result<Self, Error> {
        let original = bootstrap_port()?;
        if let Err(err) = set_bootstrap_port(replacement) {
            release_send_right(original);
            return Err(err);
        }

        Ok(Self {
            original,
            restored: false,
        })
    }

    #[inline]
    pub fn original(&self) -> mach_port_t {
        self.original
    }

    pub fn restore(&mut self) -> Result<(), Error> {
        self.restored = true;
        set_bootstrap_port(self.original)
    }
}

impl Drop for BootstrapSwap {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(err) = set_bootstrap_port(self.original) {
                log::error!("failed to restore bootstrap port: {err}");
            }
        }

        release_send_right(self.original);
    }
}

/// A port this task holds both the receive right and a send right for
struct ReceivePort {
    port: mach_port_t,
}

impl ReceivePort {
    fn new() -> Result<Self, Error> {
        // SAFETY: syscalls
        unsafe {
            let mut port = 0;
            kern!(mach_port::mach_port_allocate(
                mach_task_self(),
                port::MACH_PORT_RIGHT_RECEIVE,
                &mut port
            ));

            let rp = Self { port };

            kern!(mach_port::mach_port_insert_right(
                mach_task_self(),
                port,
                port,
                msg::MACH_MSG_TYPE_MAKE_SEND
            ));

            Ok(rp)
        }
    }

    /// Relinquishes ownership of the port name
    fn into_raw(self) -> mach_port_t {
        std::mem::ManuallyDrop::new(self).port
    }
}

impl Drop for ReceivePort {
    fn drop(&mut self) {
        // SAFETY: syscalls
        unsafe {
            mach_port::mach_port_mod_refs(
                mach_task_self(),
                self.port,
                port::MACH_PORT_RIGHT_RECEIVE,
                -1,
            );
            mach_port::mach_port_deallocate(mach_task_self(), self.port);
        }
    }
}

/// Waits for a message on the specified port. `None` is returned if the
/// timeout elapses first, no timeout waits forever.
///
/// SAFETY: `T` must be a `repr(C)` message type that is valid when zeroed
unsafe fn receive<T>(port: mach_port_t, timeout: Option<Duration>) -> Result<Option<T>, Error> {
    // SAFETY: syscall, and the caller guarantees T is valid zeroed
    unsafe {
        let mut received: Received<T> = std::mem::zeroed();

        let header = (&mut received.msg as *mut T).cast::<msg::mach_msg_header_t>();
        (*header).msgh_local_port = port;

        let (options, timeout) = match timeout {
            Some(to) => (
                msg::MACH_RCV_MSG | msg::MACH_RCV_TIMEOUT,
                to.as_millis().min(u32::MAX as u128) as u32,
            ),
            None => (msg::MACH_RCV_MSG, msg::MACH_MSG_TIMEOUT_NONE),
        };

        let ret = msg::mach_msg(
            header,
            options,
            0,
            std::mem::size_of::<Received<T>>() as u32,
            port,
            timeout,
            port::MACH_PORT_NULL,
        );

        if ret == msg::MACH_RCV_TIMED_OUT {
            return Ok(None);
        } else if ret != msg::MACH_MSG_SUCCESS {
            return Err(Error::Message(ret));
        }

        Ok(Some(received.msg))
    }
}

/// The monitored process' end of the blob channel, a send right to the port
/// the helper receives crash contexts on
pub struct BlobSender {
    port: mach_port_t,
}

/// The receive right for crash contexts, while it is still owned by the
/// monitored process
pub struct HelperEnd {
    port: ReceivePort,
}

/// Allocates the crash context port. The monitored process keeps a send
/// right, the receive right is moved to the helper during the bootstrap
/// exchange.
pub fn create_pair() -> Result<(BlobSender, HelperEnd), Error> {
    let port = ReceivePort::new()?;

    // Add a second send right so that each half owns one
    // SAFETY: syscall
    unsafe {
        kern!(mach_port::mach_port_mod_refs(
            mach_task_self(),
            port.port,
            port::MACH_PORT_RIGHT_SEND,
            1
        ));
    }

    Ok((BlobSender { port: port.port }, HelperEnd { port }))
}

impl BlobSender {
    /// Sends the crash context as a single mach message.
    ///
    /// This does not allocate or take locks.
    pub fn send_blob(&self, blob: &[u8]) -> Result<(), Error> {
        self.send_message(BLOB_ID, blob)
    }

    fn send_message(&self, id: i32, blob: &[u8]) -> Result<(), Error> {
        if blob.is_empty() {
            return Err(Error::EmptyBlob);
        }

        if blob.len() > MAX_BLOB_SIZE {
            return Err(Error::BlobTooLarge {
                len: blob.len(),
                max: MAX_BLOB_SIZE,
            });
        }

        // SAFETY: syscalls
        unsafe {
            let mut message = BlobMessage {
                head: msg::mach_msg_header_t {
                    msgh_bits: msgh_bits(msg::MACH_MSG_TYPE_COPY_SEND, 0)
                        | msg::MACH_MSGH_BITS_COMPLEX,
                    msgh_size: std::mem::size_of::<BlobMessage>() as u32,
                    msgh_remote_port: self.port,
                    msgh_local_port: port::MACH_PORT_NULL,
                    msgh_voucher_port: port::MACH_PORT_NULL,
                    msgh_id: id,
                },
                body: msg::mach_msg_body_t {
                    msgh_descriptor_count: 1,
                },
                task: msg::mach_msg_port_descriptor_t::new(
                    mach_task_self(),
                    msg::MACH_MSG_TYPE_COPY_SEND,
                ),
                len: blob.len() as u32,
                data: [0u8; MAX_BLOB_SIZE],
            };

            message.data[..blob.len()].copy_from_slice(blob);

            let ret = msg::mach_msg(
                &mut message.head,
                msg::MACH_SEND_MSG,
                message.head.msgh_size,
                0,
                port::MACH_PORT_NULL,
                msg::MACH_MSG_TIMEOUT_NONE,
                port::MACH_PORT_NULL,
            );

            match ret {
                msg::MACH_MSG_SUCCESS => Ok(()),
                msg::MACH_SEND_INVALID_DEST => {
                    Err(Error::Transmission(io::ErrorKind::BrokenPipe.into()))
                }
                _ => Err(Error::Transmission(io::ErrorKind::Other.into())),
            }
        }
    }
}

impl Drop for BlobSender {
    fn drop(&mut self) {
        // SAFETY: syscall
        unsafe {
            mach_port::mach_port_deallocate(mach_task_self(), self.port);
        }
    }
}

impl HelperEnd {
    /// The helper's end is not passed on the command line
    #[inline]
    pub fn channel_id(&self) -> Option<ChannelId> {
        None
    }

    /// Runs the provided function to spawn the helper with a temporary
    /// bootstrap port, then performs the bootstrap exchange to hand the
    /// receive right for crash contexts to the helper.
    ///
    /// The original bootstrap port of this task is restored as soon as the
    /// spawn function returns, whether it succeeded or not.
    pub fn spawn_with<T>(
        self,
        timeout: Duration,
        spawn: impl FnOnce(Option<ChannelId>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let receiver = ReceivePort::new()?;

        let mut swap = BootstrapSwap::install(receiver.port)?;
        let spawned = spawn(None);
        swap.restore()?;
        let spawned = spawned?;

        log::debug!("waiting for bootstrap request from helper");
        // The reply copies the original port, our own reference is released
        // when the swap is dropped
        self.serve_handoff(&receiver, swap.original(), timeout)?;

        Ok(spawned)
    }

    /// Waits for the helper's bootstrap request and replies with the original
    /// bootstrap port and the receive right for crash contexts
    fn serve_handoff(
        self,
        receiver: &ReceivePort,
        original: mach_port_t,
        timeout: Duration,
    ) -> Result<(), Error> {
        // SAFETY: BootstrapRequest is a plain repr(C) message
        let request = unsafe { receive::<BootstrapRequest>(receiver.port, Some(timeout))? }
            .ok_or(Error::HandshakeTimeout(timeout))?;

        if request.head.msgh_id != BOOTSTRAP_REQUEST_ID {
            return Err(Error::UnexpectedMessage(request.head.msgh_id));
        }

        let blob_port = self.port.into_raw();

        // SAFETY: syscall
        unsafe {
            let mut reply = BootstrapReply {
                head: msg::mach_msg_header_t {
                    msgh_bits: msgh_bits(msg::MACH_MSG_TYPE_MOVE_SEND, 0)
                        | msg::MACH_MSGH_BITS_COMPLEX,
                    msgh_size: std::mem::size_of::<BootstrapReply>() as u32,
                    msgh_remote_port: request.reply.name,
                    msgh_local_port: port::MACH_PORT_NULL,
                    msgh_voucher_port: port::MACH_PORT_NULL,
                    msgh_id: BOOTSTRAP_REPLY_ID,
                },
                body: msg::mach_msg_body_t {
                    msgh_descriptor_count: 2,
                },
                bootstrap: msg::mach_msg_port_descriptor_t::new(
                    original,
                    msg::MACH_MSG_TYPE_COPY_SEND,
                ),
                blob_port: msg::mach_msg_port_descriptor_t::new(
                    blob_port,
                    msg::MACH_MSG_TYPE_MOVE_RECEIVE,
                ),
            };

            msg!(msg::mach_msg(
                &mut reply.head,
                msg::MACH_SEND_MSG | msg::MACH_SEND_TIMEOUT,
                reply.head.msgh_size,
                0,
                port::MACH_PORT_NULL,
                timeout.as_millis().min(u32::MAX as u128) as u32,
                port::MACH_PORT_NULL
            ));
        }

        log::debug!("handed crash context port to helper");
        Ok(())
    }
}

/// Sends a bootstrap request to the specified port, and waits for the reply.
///
/// Returns the original bootstrap port of the monitored process, and the
/// receive right for crash contexts.
pub fn request_handoff(
    bootstrap: mach_port_t,
    timeout: Duration,
) -> Result<(mach_port_t, mach_port_t), Error> {
    let reply_port = ReceivePort::new()?;

    // SAFETY: syscall
    unsafe {
        let mut request = BootstrapRequest {
            head: msg::mach_msg_header_t {
                msgh_bits: msgh_bits(msg::MACH_MSG_TYPE_COPY_SEND, 0) | msg::MACH_MSGH_BITS_COMPLEX,
                msgh_size: std::mem::size_of::<BootstrapRequest>() as u32,
                msgh_remote_port: bootstrap,
                msgh_local_port: port::MACH_PORT_NULL,
                msgh_voucher_port: port::MACH_PORT_NULL,
                msgh_id: BOOTSTRAP_REQUEST_ID,
            },
            body: msg::mach_msg_body_t {
                msgh_descriptor_count: 1,
            },
            reply: msg::mach_msg_port_descriptor_t::new(
                reply_port.port,
                msg::MACH_MSG_TYPE_MAKE_SEND,
            ),
        };

        msg!(msg::mach_msg(
            &mut request.head,
            msg::MACH_SEND_MSG | msg::MACH_SEND_TIMEOUT,
            request.head.msgh_size,
            0,
            port::MACH_PORT_NULL,
            timeout.as_millis().min(u32::MAX as u128) as u32,
            port::MACH_PORT_NULL
        ));
    }

    // SAFETY: BootstrapReply is a plain repr(C) message
    let reply = unsafe { receive::<BootstrapReply>(reply_port.port, Some(timeout))? }
        .ok_or(Error::HandshakeTimeout(timeout))?;

    if reply.head.msgh_id != BOOTSTRAP_REPLY_ID {
        return Err(Error::UnexpectedMessage(reply.head.msgh_id));
    }

    Ok((reply.bootstrap.name, reply.blob_port.name))
}

/// The helper's end of the blob channel
pub struct BlobReceiver {
    port: ReceivePort,
}

impl BlobReceiver {
    /// Performs the helper side of the bootstrap exchange with the monitored
    /// process that spawned us, and restores our bootstrap port to the
    /// original one
    pub fn from_channel_id(_id: Option<ChannelId>, timeout: Duration) -> Result<Self, Error> {
        let inherited = bootstrap_port()?;
        let handoff = request_handoff(inherited, timeout);
        release_send_right(inherited);

        let (original, port) = handoff?;
        // The task holds its own reference once the port is installed
        let restored = set_bootstrap_port(original);
        release_send_right(original);
        restored?;

        log::debug!("received crash context port from monitored process");
        Ok(Self {
            port: ReceivePort { port },
        })
    }

    /// Waits up to `timeout` for a crash context to arrive
    pub fn receive_blob(&mut self, timeout: Option<Duration>) -> Result<Option<ReceivedBlob>, Error> {
        // SAFETY: BlobMessage is a plain repr(C) message
        let Some(message) = (unsafe { receive::<BlobMessage>(self.port.port, timeout)? }) else {
            return Ok(None);
        };

        // Only a crash context carries a task port
        if message.head.msgh_id != BLOB_ID {
            return Err(Error::UnexpectedMessage(message.head.msgh_id));
        }

        let task = message.task.name;
        let mut pid = 0;

        // SAFETY: syscalls
        unsafe {
            let res = pid_for_task(task, &mut pid);
            mach_port::mach_port_deallocate(mach_task_self(), task);

            if res != KERN_SUCCESS {
                return Err(Error::UnknownClientPid);
            }
        }

        let len = message.len as usize;
        if len > MAX_BLOB_SIZE {
            return Err(Error::Truncated);
        }

        Ok(Some(ReceivedBlob {
            pid: pid as u32,
            context: message.data[..len].to_vec(),
        }))
    }
}
