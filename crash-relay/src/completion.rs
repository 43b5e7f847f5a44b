use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionState {
    /// No dump has been written yet
    AwaitingClient,
    /// A dump has been written, this state is terminal
    DumpReceived,
}

/// Lets the helper's main flow block until the dump writer reports that a
/// dump has been written.
///
/// This is shared between the [`crate::ServerHandler`] (which runs on the
/// dump server's worker thread) and the helper's main thread, so it is
/// generally wrapped in an [`std::sync::Arc`].
pub struct CompletionSync {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl CompletionSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState::AwaitingClient),
            cond: Condvar::new(),
        }
    }

    /// Marks the dump as complete, waking any waiters.
    ///
    /// Subsequent calls have no effect.
    pub fn mark_dump_complete(&self) {
        let mut state = self.state.lock();
        if *state == CompletionState::DumpReceived {
            return;
        }

        *state = CompletionState::DumpReceived;
        self.cond.notify_all();
    }

    /// Blocks until [`Self::mark_dump_complete`] has been called, with no
    /// timeout
    pub fn await_completion(&self) {
        let mut state = self.state.lock();
        while *state == CompletionState::AwaitingClient {
            self.cond.wait(&mut state);
        }
    }

    /// Blocks until [`Self::mark_dump_complete`] has been called or the
    /// timeout elapses, returning whether the dump is complete
    pub fn await_completion_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock();
        while *state == CompletionState::AwaitingClient {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        *state == CompletionState::DumpReceived
    }

    #[inline]
    pub fn state(&self) -> CompletionState {
        *self.state.lock()
    }
}

impl Default for CompletionSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unblocks_waiter() {
        let sync = Arc::new(CompletionSync::new());
        assert_eq!(sync.state(), CompletionState::AwaitingClient);

        let waiter = {
            let sync = sync.clone();
            std::thread::spawn(move || sync.await_completion())
        };

        std::thread::sleep(Duration::from_millis(50));
        sync.mark_dump_complete();

        waiter.join().unwrap();
        assert_eq!(sync.state(), CompletionState::DumpReceived);
    }

    #[test]
    fn completion_is_sticky() {
        let sync = CompletionSync::new();

        sync.mark_dump_complete();
        sync.mark_dump_complete();

        // Already signaled, so neither of these block
        sync.await_completion();
        assert!(sync.await_completion_timeout(Duration::ZERO));
        assert_eq!(sync.state(), CompletionState::DumpReceived);
    }

    #[test]
    fn times_out_without_completion() {
        let sync = CompletionSync::new();

        let start = Instant::now();
        assert!(!sync.await_completion_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
