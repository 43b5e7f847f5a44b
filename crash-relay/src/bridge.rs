use crate::{
    channel::{BlobSender, ControlReader},
    debug_print,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Relays a crash context to the helper from within a crash callback.
///
/// Everything the crash path needs is allocated up front, so that
/// [`Self::on_crash`] can be called from a signal handler.
pub struct CrashBridge {
    control: ControlReader,
    blob: BlobSender,
    /// Set once the readiness handshake has completed, cleared by the first
    /// crash that consumes the readiness token
    armed: AtomicBool,
}

impl CrashBridge {
    pub(crate) fn new(control: ControlReader, blob: BlobSender) -> Self {
        Self {
            control,
            blob,
            armed: AtomicBool::new(false),
        }
    }

    /// Marks the readiness handshake as completed
    #[inline]
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    #[cfg(all(test, any(target_os = "linux", target_os = "android")))]
    #[inline]
    pub(crate) fn control(&self) -> &ControlReader {
        &self.control
    }

    /// Whether a crash context can currently be relayed
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Relays the crash context to the helper.
    ///
    /// Returns `false` if the readiness handshake never completed, the crash
    /// relay has already been used, the helper is gone, or the context could
    /// not be sent. In that case the caller should fall back to its default
    /// crash behavior.
    ///
    /// This is async signal safe. It does not allocate, take locks, or panic,
    /// it only performs a blocking `read` of the readiness token followed by
    /// a single send of the crash context, exactly as provided.
    pub fn on_crash(&self, context: &[u8]) -> bool {
        if !self.armed.swap(false, Ordering::AcqRel) {
            debug_print!("crash relay is not armed");
            return false;
        }

        // The value of the token is irrelevant, it just needs to be there
        match self.control.read_byte() {
            Ok(Some(_token)) => {}
            Ok(None) => {
                debug_print!("helper closed the control channel");
                return false;
            }
            Err(_err) => {
                debug_print!("failed to read readiness token");
                return false;
            }
        }

        if self.blob.send_blob(context).is_err() {
            debug_print!("failed to send crash context");
            return false;
        }

        debug_print!("crash context relayed");
        true
    }
}
